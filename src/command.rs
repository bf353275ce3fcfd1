use std::{collections::HashMap, future::Future, sync::Arc};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{RemoteError, envelope::Request};

pub type CommandFuture = BoxFuture<'static, Result<Value, RemoteError>>;

/// Reserved command names. These are routing hints, not data operations.
pub mod commands {
	/// Carries `[facade, method, args]` to the peer's facade dispatcher.
	pub const FACADE: &str = "facade";

	pub const ERROR: &str = "error";
	pub const PROGRESS: &str = "progress";
	pub const UPDATE_INDEX_STATE: &str = "updateIndexState";
	pub const COUNTER_UPDATE: &str = "counterUpdate";
	pub const INFO_MESSAGE: &str = "infoMessage";
	pub const UPDATE_WEB_SOCKET_STATE: &str = "updateWebSocketState";
	pub const UPDATE_LEADER_STATUS: &str = "updateLeaderStatus";
	pub const WRITE_INDEXER_DEBUG_LOG: &str = "writeIndexerDebugLog";
	pub const ENTITY_EVENT: &str = "entityEvent";
	pub const CREATE_PROGRESS_MONITOR: &str = "createProgressMonitor";
	pub const PROGRESS_WORK_DONE: &str = "progressWorkDone";
}

/// Services one inbound request.
pub trait Command: Send + Sync + 'static {
	fn call(&self, request: Request) -> CommandFuture;
}

impl<F, Fut> Command for F
where
	F: Fn(Request) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
	fn call(&self, request: Request) -> CommandFuture {
		Box::pin(self(request))
	}
}

/// Command name to handler.
#[derive(Clone, Default)]
pub struct CommandTable {
	commands: HashMap<String, Arc<dyn Command>>,
}

impl std::fmt::Debug for CommandTable {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_set().entries(self.commands.keys()).finish()
	}
}

impl CommandTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(Request) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
	{
		self.insert(name, handler);
		self
	}

	/// Returns `true` if `name` replaced an existing handler.
	pub fn insert<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> bool
	where
		F: Fn(Request) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
	{
		self.insert_command(name, Arc::new(handler))
	}

	pub fn with_command(
		mut self,
		name: impl Into<String>,
		command: Arc<dyn Command>,
	) -> Self {
		self.insert_command(name, command);
		self
	}

	pub fn insert_command(
		&mut self,
		name: impl Into<String>,
		command: Arc<dyn Command>,
	) -> bool {
		self.commands.insert(name.into(), command).is_some()
	}

	/// Adds every handler from `other`. Handlers in `other` win on conflict.
	pub fn merge(mut self, other: CommandTable) -> Self {
		self.commands.extend(other.commands);
		self
	}

	pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
		self.commands.get(name).cloned()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.commands.contains_key(name)
	}

	pub fn len(&self) -> usize {
		self.commands.len()
	}

	pub fn is_empty(&self) -> bool {
		self.commands.is_empty()
	}
}
