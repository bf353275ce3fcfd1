use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorBag;

/// Correlates a request with its reply. Generated by the sending queue.
#[derive(
	Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, derive_more::Display,
)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	/// UUIDv7, so that ids stay unique across a context reload
	/// and a stale reply can never match a fresh call.
	pub fn generate() -> Self {
		Self(uuid::Uuid::now_v7().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for MessageId {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

impl From<String> for MessageId {
	fn from(value: String) -> Self {
		Self(value)
	}
}

/// The unit of exchange between two contexts.
#[derive(Serialize, Deserialize, Clone, derive_more::Debug, PartialEq)]
#[serde(tag = "type")]
pub enum Envelope {
	Request {
		id: MessageId,
		command: String,

		#[debug(skip)]
		args: Vec<Value>,
	},

	Response {
		id: MessageId,
		command: String,

		#[debug(skip)]
		value: Value,
	},

	RequestError {
		id: MessageId,
		command: String,

		#[serde(rename = "value")]
		error: ErrorBag,
	},
}

impl Envelope {
	pub fn id(&self) -> &MessageId {
		match self {
			Self::Request { id, .. }
			| Self::Response { id, .. }
			| Self::RequestError { id, .. } => id,
		}
	}

	pub fn command(&self) -> &str {
		match self {
			Self::Request { command, .. }
			| Self::Response { command, .. }
			| Self::RequestError { command, .. } => command,
		}
	}

	pub fn is_request(&self) -> bool {
		matches!(self, Self::Request { .. })
	}
}

impl From<Request> for Envelope {
	fn from(request: Request) -> Self {
		Self::Request {
			id: request.id,
			command: request.command,
			args: request.args,
		}
	}
}

/// An inbound request, as handed to a command handler.
#[derive(Clone, derive_more::Debug, PartialEq)]
pub struct Request {
	pub id: MessageId,
	pub command: String,

	#[debug(skip)]
	pub args: Vec<Value>,
}

impl Request {
	pub fn new(command: impl Into<String>, args: Vec<Value>) -> Self {
		Self {
			id: MessageId::generate(),
			command: command.into(),
			args,
		}
	}

	/// Deserializes the positional argument at `index`.
	/// A missing argument reads as `null`.
	pub fn arg<T>(&self, index: usize) -> Result<T, crate::RemoteError>
	where
		T: serde::de::DeserializeOwned,
	{
		let value = self.args.get(index).cloned().unwrap_or(Value::Null);

		serde_json::from_value(value).map_err(|e| {
			crate::RemoteError::invalid_arguments(format!(
				"`{}` argument #{}: {}",
				self.command, index, e
			))
		})
	}

	/// The reply to this request.
	pub fn respond(&self, result: Result<Value, crate::RemoteError>) -> Envelope {
		match result {
			Ok(value) => Envelope::Response {
				id: self.id.clone(),
				command: self.command.clone(),
				value,
			},

			Err(error) => Envelope::RequestError {
				id: self.id.clone(),
				command: self.command.clone(),
				error: error.to_bag(),
			},
		}
	}
}
