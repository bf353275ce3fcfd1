//! Facades are named groups of backend operations, addressed across the
//! boundary through the reserved `facade` command as `[facade, method, args]`.
//!
//! The local side registers a [FacadeDispatcher] built by [expose_local].
//! The remote side talks to it through [FacadeClient]s handed out by
//! [expose_remote], or through typed stubs generated with [crate::facade!].

use std::{collections::HashMap, future::Future, sync::Arc};

use futures::{FutureExt as _, future::BoxFuture};
use serde::{Serialize, de::DeserializeOwned};

pub use serde_json::Value;

use crate::{
	CallError, Command, CommandTable, Queue, RemoteError,
	command::{CommandFuture, commands},
	envelope::Request,
	queue::Reply,
};

pub type DispatchFuture = BoxFuture<'static, Result<Value, RemoteError>>;

/// A facade implementation living on this side of the boundary.
pub trait LocalFacade: Send + Sync + 'static {
	fn name(&self) -> &str;

	/// `None` if the facade has no method by that name.
	fn dispatch(&self, method: &str, args: Vec<Value>) -> Option<DispatchFuture>;
}

/// The handler for the `facade` command.
pub struct FacadeDispatcher {
	facades: HashMap<String, Arc<dyn LocalFacade>>,
}

pub fn expose_local<I>(facades: I) -> FacadeDispatcher
where
	I: IntoIterator<Item = Arc<dyn LocalFacade>>,
{
	let facades = facades
		.into_iter()
		.map(|facade| (facade.name().to_string(), facade))
		.collect();

	FacadeDispatcher { facades }
}

impl FacadeDispatcher {
	/// A table with only the `facade` command installed.
	pub fn into_commands(self) -> CommandTable {
		CommandTable::new().with_command(commands::FACADE, Arc::new(self))
	}

	fn route(&self, request: Request) -> Result<DispatchFuture, RemoteError> {
		let malformed = || {
			RemoteError::invalid_arguments(
				"`facade` expects [facade: string, method: string, args: array]",
			)
		};

		let [facade, method, args]: [Value; 3] =
			request.args.try_into().map_err(|_| malformed())?;

		let (Value::String(facade), Value::String(method), Value::Array(args)) =
			(facade, method, args)
		else {
			return Err(malformed());
		};

		let implementation = self
			.facades
			.get(&facade)
			.ok_or_else(|| RemoteError::unknown_facade(&facade))?;

		log::trace!("Dispatching {}.{} ({})", facade, method, request.id);

		implementation
			.dispatch(&method, args)
			.ok_or_else(|| RemoteError::unknown_method(&facade, &method))
	}
}

impl Command for FacadeDispatcher {
	fn call(&self, request: Request) -> CommandFuture {
		match self.route(request) {
			Ok(future) => future,
			Err(e) => futures::future::ready(Err(e)).boxed(),
		}
	}
}

type DynamicMethod = Arc<dyn Fn(Vec<Value>) -> DispatchFuture + Send + Sync>;

/// A facade assembled at runtime from closures over the raw argument list.
pub struct DynamicFacade {
	name: String,
	methods: HashMap<String, DynamicMethod>,
}

impl DynamicFacade {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			methods: HashMap::new(),
		}
	}

	pub fn method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
	where
		F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
	{
		let method: DynamicMethod =
			Arc::new(move |args: Vec<Value>| -> DispatchFuture { Box::pin(method(args)) });

		self.methods.insert(name.into(), method);
		self
	}
}

impl LocalFacade for DynamicFacade {
	fn name(&self) -> &str {
		&self.name
	}

	fn dispatch(&self, method: &str, args: Vec<Value>) -> Option<DispatchFuture> {
		self.methods.get(method).map(|method| method(args))
	}
}

/// Hands out [FacadeClient]s bound to one queue.
#[derive(Clone, Debug)]
pub struct Remote {
	queue: Queue,
}

pub fn expose_remote(queue: Queue) -> Remote {
	Remote { queue }
}

impl Remote {
	pub fn facade(&self, name: impl Into<String>) -> FacadeClient {
		FacadeClient::new(self.queue.clone(), name)
	}

	pub fn queue(&self) -> &Queue {
		&self.queue
	}
}

/// A stand-in for a facade on the other side. Holds nothing but the
/// queue and the facade name; nothing is checked until the call comes back.
#[derive(Clone, Debug)]
pub struct FacadeClient {
	queue: Queue,
	facade: String,
}

impl FacadeClient {
	pub fn new(queue: Queue, facade: impl Into<String>) -> Self {
		Self {
			queue,
			facade: facade.into(),
		}
	}

	pub fn name(&self) -> &str {
		&self.facade
	}

	/// Posts exactly one `facade` request.
	pub fn call(&self, method: &str, args: Vec<Value>) -> Reply {
		self.queue.post_message(
			commands::FACADE,
			vec![
				Value::String(self.facade.clone()),
				Value::String(method.to_string()),
				Value::Array(args),
			],
		)
	}

	pub async fn invoke<T>(&self, method: &str, args: Vec<Value>) -> Result<T, CallError>
	where
		T: DeserializeOwned,
	{
		self.call(method, args).decode().await
	}
}

pub fn encode_arg<T: Serialize>(value: &T) -> Result<Value, CallError> {
	serde_json::to_value(value).map_err(CallError::Encode)
}

pub fn encode_value<T: Serialize>(value: &T) -> Result<Value, RemoteError> {
	serde_json::to_value(value)
		.map_err(|e| RemoteError::programming(format!("failed to encode result: {e}")))
}

/// Positional argument decoding for generated dispatchers.
pub struct Args {
	args: std::vec::IntoIter<Value>,
	position: usize,
}

impl Args {
	pub fn new(args: Vec<Value>) -> Self {
		Self {
			args: args.into_iter(),
			position: 0,
		}
	}

	/// A missing argument reads as `null`.
	pub fn next<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, RemoteError> {
		let value = self.args.next().unwrap_or(Value::Null);
		self.position += 1;

		serde_json::from_value(value).map_err(|e| {
			RemoteError::invalid_arguments(format!(
				"argument #{} (`{}`): {}",
				self.position - 1,
				name,
				e
			))
		})
	}

	/// Fails if arguments were left over.
	pub fn finish(self) -> Result<(), RemoteError> {
		let extra = self.args.len();

		if extra == 0 {
			Ok(())
		} else {
			Err(RemoteError::invalid_arguments(format!(
				"expected {} argument(s), got {}",
				self.position,
				self.position + extra
			)))
		}
	}
}
