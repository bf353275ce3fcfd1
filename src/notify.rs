//! One-way pushes from the worker to the main context: errors, progress,
//! search index state, websocket state and friends.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
	CallError, CommandTable, Queue, RemoteError,
	command::commands,
	envelope::Request,
	error::ErrorBag,
	facade::encode_arg,
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebSocketState {
	Connecting,
	Connected,
	Terminated,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfoMessage {
	pub translation_key: String,

	#[serde(default)]
	pub args: HashMap<String, Value>,
}

#[derive(
	Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display,
)]
#[serde(transparent)]
pub struct ProgressMonitorId(pub u64);

/// Worker-side sender of notifications.
#[derive(Clone, Debug)]
pub struct Notifier {
	queue: Queue,
}

impl Notifier {
	pub fn new(queue: Queue) -> Self {
		Self { queue }
	}

	async fn push(&self, command: &str, args: Vec<Value>) -> Result<(), CallError> {
		self.queue.post_message(command, args).await.map(|_| ())
	}

	pub async fn send_error(&self, error: &RemoteError) -> Result<(), CallError> {
		self.push(commands::ERROR, vec![encode_arg(&error.to_bag())?])
			.await
	}

	pub async fn send_progress(&self, percentage: u8) -> Result<(), CallError> {
		self.push(commands::PROGRESS, vec![json!(percentage)]).await?;

		// Give the receiving side a chance to render before more work piles up.
		tokio::task::yield_now().await;
		Ok(())
	}

	pub async fn send_index_state(&self, state: &impl Serialize) -> Result<(), CallError> {
		self.push(commands::UPDATE_INDEX_STATE, vec![encode_arg(state)?])
			.await
	}

	pub async fn update_web_socket_state(
		&self,
		state: WebSocketState,
	) -> Result<(), CallError> {
		log::info!("WebSocket displayed state: {:?}", state);

		self.push(commands::UPDATE_WEB_SOCKET_STATE, vec![encode_arg(&state)?])
			.await
	}

	pub async fn update_counter(&self, update: &impl Serialize) -> Result<(), CallError> {
		self.push(commands::COUNTER_UPDATE, vec![encode_arg(update)?])
			.await
	}

	pub async fn info_message(&self, message: &InfoMessage) -> Result<(), CallError> {
		self.push(commands::INFO_MESSAGE, vec![encode_arg(message)?])
			.await
	}

	pub async fn create_progress_monitor(
		&self,
		total_work: u64,
	) -> Result<ProgressMonitorId, CallError> {
		self.queue
			.post_message(commands::CREATE_PROGRESS_MONITOR, vec![json!(total_work)])
			.decode()
			.await
	}

	pub async fn progress_work_done(
		&self,
		monitor: ProgressMonitorId,
		work: u64,
	) -> Result<(), CallError> {
		self.push(commands::PROGRESS_WORK_DONE, vec![json!(monitor), json!(work)])
			.await
	}

	pub async fn update_leader_status(
		&self,
		status: &impl Serialize,
	) -> Result<(), CallError> {
		self.push(commands::UPDATE_LEADER_STATUS, vec![encode_arg(status)?])
			.await
	}

	pub async fn write_indexer_debug_log(
		&self,
		reason: &str,
		user: &impl Serialize,
	) -> Result<(), CallError> {
		self.push(
			commands::WRITE_INDEXER_DEBUG_LOG,
			vec![json!(reason), encode_arg(user)?],
		)
		.await
	}

	pub async fn entity_events_received(
		&self,
		updates: &impl Serialize,
		owner_group: &str,
	) -> Result<(), CallError> {
		self.push(
			commands::ENTITY_EVENT,
			vec![encode_arg(updates)?, json!(owner_group)],
		)
		.await
	}
}

/// Main-side receiver of notifications. Everything but
/// [create_progress_monitor](Self::create_progress_monitor) defaults to logging.
pub trait NotificationHandler: Send + Sync + 'static {
	fn on_error(&self, error: RemoteError) {
		log::error!("Worker error: {}", error);
	}

	fn on_progress(&self, percentage: u8) {
		log::debug!("Progress: {}%", percentage);
	}

	fn on_index_state(&self, state: Value) {
		log::debug!("Search index state: {}", state);
	}

	fn on_web_socket_state(&self, state: WebSocketState) {
		log::debug!("WebSocket state: {:?}", state);
	}

	fn on_counter_update(&self, update: Value) {
		log::debug!("Counter update: {}", update);
	}

	fn on_info_message(&self, message: InfoMessage) {
		log::info!("Info message: {}", message.translation_key);
	}

	fn create_progress_monitor(&self, total_work: u64) -> ProgressMonitorId;

	fn on_progress_work_done(&self, monitor: ProgressMonitorId, work: u64) {
		log::debug!("Progress monitor {}: {} done", monitor, work);
	}

	fn on_leader_status(&self, status: Value) {
		log::debug!("Leader status: {}", status);
	}

	fn on_indexer_debug_log(&self, reason: String, user: Value) {
		log::debug!("Indexer debug log ({}): {}", reason, user);
	}

	fn on_entity_events(&self, updates: Value, owner_group: String) {
		log::debug!("Entity events for group {}: {}", owner_group, updates);
	}
}

/// The main side's table for every notification command.
pub fn notification_commands<H: NotificationHandler>(handler: Arc<H>) -> CommandTable {
	fn install<H, F>(table: &mut CommandTable, handler: &Arc<H>, name: &str, f: F)
	where
		H: NotificationHandler,
		F: Fn(&H, &Request) -> Result<Value, RemoteError> + Send + Sync + 'static,
	{
		let handler = handler.clone();

		table.insert(name, move |request: Request| {
			let result = f(&handler, &request);
			async move { result }
		});
	}

	let mut table = CommandTable::new();

	install(&mut table, &handler, commands::ERROR, |h, r| {
		h.on_error(RemoteError::from_bag(r.arg::<ErrorBag>(0)?));
		Ok(Value::Null)
	});

	install(&mut table, &handler, commands::PROGRESS, |h, r| {
		h.on_progress(r.arg(0)?);
		Ok(Value::Null)
	});

	install(&mut table, &handler, commands::UPDATE_INDEX_STATE, |h, r| {
		h.on_index_state(r.arg(0)?);
		Ok(Value::Null)
	});

	install(&mut table, &handler, commands::UPDATE_WEB_SOCKET_STATE, |h, r| {
		h.on_web_socket_state(r.arg(0)?);
		Ok(Value::Null)
	});

	install(&mut table, &handler, commands::COUNTER_UPDATE, |h, r| {
		h.on_counter_update(r.arg(0)?);
		Ok(Value::Null)
	});

	install(&mut table, &handler, commands::INFO_MESSAGE, |h, r| {
		h.on_info_message(r.arg(0)?);
		Ok(Value::Null)
	});

	install(&mut table, &handler, commands::CREATE_PROGRESS_MONITOR, |h, r| {
		Ok(json!(h.create_progress_monitor(r.arg(0)?)))
	});

	install(&mut table, &handler, commands::PROGRESS_WORK_DONE, |h, r| {
		h.on_progress_work_done(r.arg(0)?, r.arg(1)?);
		Ok(Value::Null)
	});

	install(&mut table, &handler, commands::UPDATE_LEADER_STATUS, |h, r| {
		h.on_leader_status(r.arg(0)?);
		Ok(Value::Null)
	});

	install(&mut table, &handler, commands::WRITE_INDEXER_DEBUG_LOG, |h, r| {
		h.on_indexer_debug_log(r.arg(0)?, r.arg(1)?);
		Ok(Value::Null)
	});

	install(&mut table, &handler, commands::ENTITY_EVENT, |h, r| {
		h.on_entity_events(r.arg(0)?, r.arg(1)?);
		Ok(Value::Null)
	});

	table
}
