use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::envelope::MessageId;

/// The plain attribute bag an error travels as.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorBag {
	pub kind: String,
	pub message: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stack: Option<String>,

	/// Structured fields of the kind, if it has any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

/// A closed set of error kinds, each keyed by a stable string tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
	Programming,
	Crypto,
	NotAuthenticated,
	Connection,
	InvalidArguments,
	UnknownCommand { command: String },
	UnknownFacade { facade: String },
	UnknownMethod { facade: String, method: String },

	/// A kind this side does not know; the tag is kept verbatim.
	/// [RemoteError::new] turns a known tag given here into its own variant.
	Other(String),
}

impl ErrorKind {
	pub fn tag(&self) -> &str {
		match self {
			Self::Programming => "ProgrammingError",
			Self::Crypto => "CryptoError",
			Self::NotAuthenticated => "NotAuthenticatedError",
			Self::Connection => "ConnectionError",
			Self::InvalidArguments => "InvalidArgumentsError",
			Self::UnknownCommand { .. } => "UnknownCommandError",
			Self::UnknownFacade { .. } => "UnknownFacadeError",
			Self::UnknownMethod { .. } => "UnknownMethodError",
			Self::Other(tag) => tag,
		}
	}

	fn data(&self) -> Option<Value> {
		match self {
			Self::UnknownCommand { command } => Some(json!({ "command": command })),
			Self::UnknownFacade { facade } => Some(json!({ "facade": facade })),
			Self::UnknownMethod { facade, method } => {
				Some(json!({ "facade": facade, "method": method }))
			}
			_ => None,
		}
	}

	/// Kind lookup by tag. Unknown tags, and known tags whose
	/// structured fields are missing, fall back to [ErrorKind::Other].
	fn from_tag(tag: &str, data: Option<&Value>) -> Self {
		let field = |name: &str| -> Option<String> {
			data?.get(name)?.as_str().map(str::to_string)
		};

		let kind = match tag {
			"ProgrammingError" => Some(Self::Programming),
			"CryptoError" => Some(Self::Crypto),
			"NotAuthenticatedError" => Some(Self::NotAuthenticated),
			"ConnectionError" => Some(Self::Connection),
			"InvalidArgumentsError" => Some(Self::InvalidArguments),

			"UnknownCommandError" => {
				field("command").map(|command| Self::UnknownCommand { command })
			}

			"UnknownFacadeError" => {
				field("facade").map(|facade| Self::UnknownFacade { facade })
			}

			"UnknownMethodError" => field("facade")
				.zip(field("method"))
				.map(|(facade, method)| Self::UnknownMethod { facade, method }),

			_ => None,
		};

		kind.unwrap_or_else(|| Self::Other(tag.to_string()))
	}

	/// The kind as it reads back from the wire.
	fn normalized(self) -> Self {
		match self {
			Self::Other(tag) => Self::from_tag(&tag, None),
			kind => kind,
		}
	}
}

impl std::fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.tag())
	}
}

/// An application error that crosses the boundary:
/// thrown by a handler on one side, returned to the caller on the other.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
#[error("{kind}: {message}")]
pub struct RemoteError {
	pub kind: ErrorKind,
	pub message: String,
	pub stack: Option<String>,
}

impl RemoteError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind: kind.normalized(),
			message: message.into(),
			stack: None,
		}
	}

	pub fn programming(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Programming, message)
	}

	pub fn invalid_arguments(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::InvalidArguments, message)
	}

	pub fn unknown_command(command: &str) -> Self {
		Self::new(
			ErrorKind::UnknownCommand {
				command: command.to_string(),
			},
			format!("unknown command `{command}`"),
		)
	}

	pub fn unknown_facade(facade: &str) -> Self {
		Self::new(
			ErrorKind::UnknownFacade {
				facade: facade.to_string(),
			},
			format!("unknown facade `{facade}`"),
		)
	}

	pub fn unknown_method(facade: &str, method: &str) -> Self {
		Self::new(
			ErrorKind::UnknownMethod {
				facade: facade.to_string(),
				method: method.to_string(),
			},
			format!("unknown method `{facade}.{method}`"),
		)
	}

	pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
		self.stack = Some(stack.into());
		self
	}

	pub fn to_bag(&self) -> ErrorBag {
		ErrorBag {
			kind: self.kind.tag().to_string(),
			message: self.message.clone(),
			stack: self.stack.clone(),
			data: self.kind.data(),
		}
	}

	pub fn from_bag(bag: ErrorBag) -> Self {
		Self {
			kind: ErrorKind::from_tag(&bag.kind, bag.data.as_ref()),
			message: bag.message,
			stack: bag.stack,
		}
	}
}

impl From<ErrorBag> for RemoteError {
	fn from(bag: ErrorBag) -> Self {
		Self::from_bag(bag)
	}
}

/// What a caller of a remote command gets back instead of a value.
#[derive(thiserror::Error, Debug)]
pub enum CallError {
	#[error(transparent)]
	Remote(#[from] RemoteError),

	#[error("failed to encode arguments: {0}")]
	Encode(#[source] serde_json::Error),

	#[error("failed to decode reply: {0}")]
	Decode(#[source] serde_json::Error),

	/// The queue was disconnected before a reply arrived.
	#[error("disconnected before a reply arrived")]
	Disconnected,
}

impl CallError {
	pub fn remote(&self) -> Option<&RemoteError> {
		match self {
			Self::Remote(e) => Some(e),
			_ => None,
		}
	}
}

/// A protocol fault. Nobody is waiting on these,
/// so they go to the queue's fault channel.
#[derive(thiserror::Error, Debug)]
pub enum Fault {
	/// Usually a version mismatch between the two contexts.
	#[error("inbound request {id} names unknown command `{command}`")]
	UnknownCommand { id: MessageId, command: String },

	#[error("malformed envelope: {0}")]
	Malformed(String),

	#[error("notification `{command}` failed: {error}")]
	NotificationFailed { command: String, error: CallError },
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Cbor(#[from] serde_cbor::Error),
}
