use std::{
	collections::{HashMap, VecDeque},
	future::Future,
	panic::AssertUnwindSafe,
	pin::Pin,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	task::{Context, Poll},
};

use futures::FutureExt as _;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;

use crate::{
	CallError, Command, CommandTable, Fault, RemoteError,
	envelope::{Envelope, MessageId, Request},
	transport::Codec,
};

type ReplyResult = Result<Value, RemoteError>;

struct PendingCall {
	command: String,
	reply_tx: oneshot::Sender<ReplyResult>,
}

enum Commands {
	/// No table yet; inbound requests wait here in arrival order.
	Uninitialized { backlog: VecDeque<Request> },

	/// The backlog is being replayed. New arrivals queue up behind it.
	Draining {
		table: CommandTable,
		backlog: VecDeque<Request>,
	},

	Installed(CommandTable),

	Disconnected,
}

struct Shared {
	/// Shows up in logs, e.g. `worker` or `main`.
	name: String,

	outbound_tx: mpsc::UnboundedSender<Envelope>,
	fault_tx: mpsc::UnboundedSender<Fault>,
	pending: Mutex<HashMap<MessageId, PendingCall>>,
	disconnected: AtomicBool,
	commands: Mutex<Commands>,

	/// Spawned handlers that still owe the peer a reply.
	handlers: TaskTracker,
}

/// One side of the boundary. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Queue {
	shared: Arc<Shared>,
}

/// The host-facing ends of a [Queue].
pub struct QueueIo {
	/// Envelopes for the transport to deliver to the peer.
	pub outbound: mpsc::UnboundedReceiver<Envelope>,

	/// Protocol faults nobody is waiting on.
	pub faults: mpsc::UnboundedReceiver<Fault>,
}

impl std::fmt::Debug for Queue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Queue")
			.field("name", &self.shared.name)
			.field("pending", &self.pending_count())
			.finish()
	}
}

impl Queue {
	pub fn new(name: impl Into<String>) -> (Self, QueueIo) {
		let (outbound_tx, outbound) = mpsc::unbounded_channel();
		let (fault_tx, faults) = mpsc::unbounded_channel();

		let queue = Self {
			shared: Arc::new(Shared {
				name: name.into(),
				outbound_tx,
				fault_tx,
				pending: Mutex::new(HashMap::new()),
				disconnected: AtomicBool::new(false),
				commands: Mutex::new(Commands::Uninitialized {
					backlog: VecDeque::new(),
				}),
				handlers: TaskTracker::new(),
			}),
		};

		(queue, QueueIo { outbound, faults })
	}

	pub fn name(&self) -> &str {
		&self.shared.name
	}

	/// Installs (or replaces) the table that serves inbound requests.
	/// Requests received before the first table are replayed now, in
	/// arrival order and ahead of anything that arrives meanwhile.
	pub fn set_commands(&self, table: CommandTable) {
		{
			let mut commands = self.shared.commands.lock();

			match std::mem::replace(&mut *commands, Commands::Disconnected) {
				Commands::Uninitialized { backlog } => {
					if !backlog.is_empty() {
						log::debug!(
							"[{}] Replaying {} request(s) received before initialization",
							self.shared.name,
							backlog.len()
						);
					}

					*commands = Commands::Draining { table, backlog };
				}

				// Whoever is draining picks up the new table.
				Commands::Draining { backlog, .. } => {
					*commands = Commands::Draining { table, backlog };
					return;
				}

				Commands::Installed(_) => {
					*commands = Commands::Installed(table);
					return;
				}

				Commands::Disconnected => {
					log::warn!(
						"[{}] Ignoring command table for a disconnected queue",
						self.shared.name
					);

					return;
				}
			}
		}

		self.drain_backlog();
	}

	fn drain_backlog(&self) {
		loop {
			let (request, handler) = {
				let mut commands = self.shared.commands.lock();

				let Commands::Draining { table, backlog } = &mut *commands else {
					return;
				};

				match backlog.pop_front() {
					Some(request) => {
						let handler = table.get(&request.command);
						(request, handler)
					}

					None => {
						*commands = Commands::Installed(std::mem::take(table));
						return;
					}
				}
			};

			self.start(request, handler);
		}
	}

	/// Sends a request right away; the returned [Reply] settles
	/// once the peer answers. Never fails synchronously.
	pub fn post_message(&self, command: impl Into<String>, args: Vec<Value>) -> Reply {
		self.post(Request::new(command, args))
	}

	pub fn post(&self, request: Request) -> Reply {
		let (reply_tx, reply_rx) = oneshot::channel();
		let id = request.id.clone();

		{
			let mut pending = self.shared.pending.lock();

			if self.shared.disconnected.load(Ordering::SeqCst) {
				// Dropping `reply_tx` settles the reply with `Disconnected`.
				log::debug!(
					"[{}] Not sending `{}` on a disconnected queue",
					self.shared.name,
					request.command
				);

				return Reply { reply_rx };
			}

			pending.insert(
				id.clone(),
				PendingCall {
					command: request.command.clone(),
					reply_tx,
				},
			);
		}

		let envelope = Envelope::from(request);
		log::debug!("[{}] ➡️ {:?}", self.shared.name, envelope);

		if self.shared.outbound_tx.send(envelope).is_err() {
			// Dropping the call settles the reply with `Disconnected`.
			log::warn!("[{}] Outbound channel closed", self.shared.name);
			self.shared.pending.lock().remove(&id);
		}

		Reply { reply_rx }
	}

	/// Fire-and-forget. A failed reply is reported as a [Fault].
	pub fn notify(&self, command: impl Into<String>, args: Vec<Value>) {
		let command = command.into();
		let reply = self.post_message(command.clone(), args);
		let queue = self.clone();

		tokio::spawn(async move {
			if let Err(error) = reply.await {
				queue.fault(Fault::NotificationFailed { command, error });
			}
		});
	}

	/// Decodes a frame from the transport and handles it.
	pub fn handle_frame(&self, codec: Codec, frame: &[u8]) {
		match codec.decode(frame) {
			Ok(envelope) => self.handle_envelope(envelope),
			Err(e) => self.fault(Fault::Malformed(e.to_string())),
		}
	}

	pub fn handle_envelope(&self, envelope: Envelope) {
		log::debug!("[{}] ⬅️ {:?}", self.shared.name, envelope);

		match envelope {
			Envelope::Request { id, command, args } => {
				self.dispatch(Request { id, command, args })
			}

			Envelope::Response { id, value, .. } => self.settle(&id, Ok(value)),

			Envelope::RequestError { id, error, .. } => {
				self.settle(&id, Err(RemoteError::from_bag(error)))
			}
		}
	}

	fn settle(&self, id: &MessageId, result: ReplyResult) {
		let Some(call) = self.shared.pending.lock().remove(id) else {
			log::debug!(
				"[{}] Discarding reply to unknown request {}",
				self.shared.name,
				id
			);

			return;
		};

		if call.reply_tx.send(result).is_err() {
			log::trace!(
				"[{}] Caller of `{}` ({}) stopped waiting",
				self.shared.name,
				call.command,
				id
			);
		}
	}

	fn dispatch(&self, request: Request) {
		let handler = {
			let mut commands = self.shared.commands.lock();

			match &mut *commands {
				Commands::Uninitialized { backlog } => {
					log::debug!(
						"[{}] Queueing `{}` ({}) until commands are set",
						self.shared.name,
						request.command,
						request.id
					);

					backlog.push_back(request);
					return;
				}

				Commands::Draining { backlog, .. } => {
					backlog.push_back(request);
					return;
				}

				Commands::Disconnected => {
					log::warn!(
						"[{}] Ignoring `{}` ({}) on a disconnected queue",
						self.shared.name,
						request.command,
						request.id
					);

					return;
				}

				Commands::Installed(table) => table.get(&request.command),
			}
		};

		self.start(request, handler);
	}

	/// Calls the handler right here, so handlers see requests in the order
	/// they are started, and spawns only the future it returns.
	fn start(&self, request: Request, handler: Option<Arc<dyn Command>>) {
		let Some(handler) = handler else {
			self.fault(Fault::UnknownCommand {
				id: request.id.clone(),
				command: request.command.clone(),
			});

			self.send(
				request.respond(Err(RemoteError::unknown_command(&request.command))),
			);

			return;
		};

		let future = match std::panic::catch_unwind(AssertUnwindSafe(|| {
			handler.call(request.clone())
		})) {
			Ok(future) => future,

			Err(panic) => {
				self.send(request.respond(Err(panicked(&request, panic.as_ref()))));
				return;
			}
		};

		let queue = self.clone();

		self.shared.handlers.spawn(async move {
			let result = AssertUnwindSafe(future)
				.catch_unwind()
				.await
				.unwrap_or_else(|panic| Err(panicked(&request, panic.as_ref())));

			if let Err(e) = &result {
				log::debug!(
					"[{}] `{}` ({}) failed: {}",
					queue.shared.name,
					request.command,
					request.id,
					e
				);
			}

			queue.send(request.respond(result));
		});
	}

	fn send(&self, envelope: Envelope) {
		log::debug!("[{}] ➡️ {:?}", self.shared.name, envelope);

		if self.shared.outbound_tx.send(envelope).is_err() {
			log::warn!("[{}] Outbound channel closed", self.shared.name);
		}
	}

	fn fault(&self, fault: Fault) {
		log::error!("[{}] {}", self.shared.name, fault);
		let _ = self.shared.fault_tx.send(fault);
	}

	/// Drops every pending call and the command table.
	/// Outstanding replies resolve to [CallError::Disconnected].
	/// Later posts settle the same way without being sent.
	pub fn disconnect(&self) {
		self.shared.disconnected.store(true, Ordering::SeqCst);
		*self.shared.commands.lock() = Commands::Disconnected;
		let pending = std::mem::take(&mut *self.shared.pending.lock());

		if !pending.is_empty() {
			log::debug!(
				"[{}] Disconnected with {} pending call(s)",
				self.shared.name,
				pending.len()
			);
		}
	}

	pub fn pending_count(&self) -> usize {
		self.shared.pending.lock().len()
	}

	/// Resolves once every started handler has queued its reply.
	/// Transports wait on this after [disconnect](Self::disconnect)
	/// before they stop writing.
	pub async fn handlers_finished(&self) {
		self.shared.handlers.close();
		self.shared.handlers.wait().await;
	}
}

fn panicked(request: &Request, panic: &(dyn std::any::Any + Send)) -> RemoteError {
	RemoteError::programming(format!(
		"handler for `{}` panicked: {}",
		request.command,
		panic_message(panic)
	))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
	if let Some(message) = panic.downcast_ref::<&str>() {
		message
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message
	} else {
		"unknown panic"
	}
}

/// The eventual reply to a posted request.
#[must_use = "dropping a reply does not cancel the request"]
#[derive(Debug)]
pub struct Reply {
	reply_rx: oneshot::Receiver<ReplyResult>,
}

impl Reply {
	pub async fn decode<T: DeserializeOwned>(self) -> Result<T, CallError> {
		serde_json::from_value(self.await?).map_err(CallError::Decode)
	}
}

impl Future for Reply {
	type Output = Result<Value, CallError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.reply_rx).poll(cx).map(|result| match result {
			Ok(Ok(value)) => Ok(value),
			Ok(Err(e)) => Err(CallError::Remote(e)),
			Err(_) => Err(CallError::Disconnected),
		})
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::ErrorKind;

	async fn next_request(io: &mut QueueIo) -> (MessageId, String, Vec<Value>) {
		match io.outbound.recv().await.unwrap() {
			Envelope::Request { id, command, args } => (id, command, args),
			other => panic!("expected a request, got {other:?}"),
		}
	}

	async fn next_reply(io: &mut QueueIo) -> Envelope {
		let envelope = io.outbound.recv().await.unwrap();
		assert!(!envelope.is_request(), "expected a reply, got {envelope:?}");
		envelope
	}

	fn response(id: &MessageId, value: Value) -> Envelope {
		Envelope::Response {
			id: id.clone(),
			command: "facade".to_string(),
			value,
		}
	}

	#[tokio::test]
	async fn replies_in_any_order_settle_their_own_calls() {
		let (queue, mut io) = Queue::new("main");

		let replies: Vec<Reply> = (0..5)
			.map(|i| queue.post_message("facade", vec![json!(i)]))
			.collect();

		let mut sent = vec![];
		for _ in 0..5 {
			sent.push(next_request(&mut io).await);
		}

		assert_eq!(queue.pending_count(), 5);

		for (index, (id, _, args)) in sent.iter().enumerate().rev() {
			if index == 2 {
				queue.handle_envelope(Envelope::RequestError {
					id: id.clone(),
					command: "facade".to_string(),
					error: RemoteError::programming("two").to_bag(),
				});
			} else {
				queue.handle_envelope(response(id, json!(args[0].as_i64().unwrap() * 10)));
			}
		}

		for (i, reply) in replies.into_iter().enumerate() {
			match reply.await {
				Ok(value) => assert_eq!(value, json!(i * 10)),
				Err(CallError::Remote(e)) => {
					assert_eq!(i, 2);
					assert_eq!(e.kind, ErrorKind::Programming);
					assert_eq!(e.message, "two");
				}
				Err(e) => panic!("unexpected {e:?}"),
			}
		}

		assert_eq!(queue.pending_count(), 0);
	}

	#[tokio::test]
	async fn interleaved_replies_settle_their_own_calls() {
		let (queue, mut io) = Queue::new("main");

		let replies: Vec<Reply> = (0..8)
			.map(|i| queue.post_message("facade", vec![json!(i)]))
			.collect();

		let mut sent = vec![];
		for _ in 0..8 {
			sent.push(next_request(&mut io).await);
		}

		for index in [3, 0, 7, 4, 2, 6, 1, 5] {
			let (id, _, args) = &sent[index];
			queue.handle_envelope(response(id, json!({ "echo": args[0] })));
		}

		for (i, reply) in replies.into_iter().enumerate() {
			assert_eq!(reply.await.unwrap(), json!({ "echo": i }));
		}

		assert_eq!(queue.pending_count(), 0);
	}

	#[tokio::test]
	async fn stale_reply_is_discarded() {
		let (queue, mut io) = Queue::new("main");

		let reply = queue.post_message("facade", vec![]);
		let (id, ..) = next_request(&mut io).await;

		queue.handle_envelope(response(&MessageId::from("never-sent"), json!(1)));
		assert_eq!(queue.pending_count(), 1);

		queue.handle_envelope(response(&id, json!("ok")));
		queue.handle_envelope(response(&id, json!("duplicate")));

		assert_eq!(reply.await.unwrap(), json!("ok"));
		assert_eq!(queue.pending_count(), 0);
		assert!(io.faults.try_recv().is_err());
	}

	#[tokio::test]
	async fn unknown_command_is_reported_and_answered() {
		let (queue, mut io) = Queue::new("worker");
		queue.set_commands(CommandTable::new());

		let unrelated = queue.post_message("facade", vec![]);
		let _ = next_request(&mut io).await;

		queue.handle_envelope(Envelope::Request {
			id: "r1".into(),
			command: "frobnicate".to_string(),
			args: vec![],
		});

		match io.faults.recv().await.unwrap() {
			Fault::UnknownCommand { id, command } => {
				assert_eq!(id.as_str(), "r1");
				assert_eq!(command, "frobnicate");
			}
			other => panic!("unexpected {other:?}"),
		}

		match next_reply(&mut io).await {
			Envelope::RequestError { id, error, .. } => {
				assert_eq!(id.as_str(), "r1");
				assert_eq!(error.kind, "UnknownCommandError");
			}
			other => panic!("unexpected {other:?}"),
		}

		assert_eq!(queue.pending_count(), 1);
		drop(unrelated);
	}

	#[tokio::test]
	async fn handler_result_becomes_response() {
		let (queue, mut io) = Queue::new("worker");
		queue.set_commands(CommandTable::new().with("testEcho", |request: Request| async move {
			let message: String = request.arg(0)?;
			Ok(json!({ "msg": format!(">>> {message}") }))
		}));

		queue.handle_envelope(Envelope::Request {
			id: "e1".into(),
			command: "testEcho".to_string(),
			args: vec![json!("hello")],
		});

		assert_eq!(
			next_reply(&mut io).await,
			Envelope::Response {
				id: "e1".into(),
				command: "testEcho".to_string(),
				value: json!({ "msg": ">>> hello" }),
			}
		);
	}

	#[tokio::test]
	async fn handler_error_and_panic_become_request_errors() {
		let (queue, mut io) = Queue::new("worker");
		queue.set_commands(
			CommandTable::new()
				.with("testError", |_: Request| async {
					Err::<Value, _>(RemoteError::new(ErrorKind::NotAuthenticated, "wtf"))
				})
				.with("testPanic", |_: Request| async {
					if true {
						panic!("boom");
					}
					Ok::<_, RemoteError>(Value::Null)
				}),
		);

		queue.handle_envelope(Envelope::Request {
			id: "a".into(),
			command: "testError".to_string(),
			args: vec![],
		});

		match next_reply(&mut io).await {
			Envelope::RequestError { error, .. } => {
				assert_eq!(error.kind, "NotAuthenticatedError");
				assert_eq!(error.message, "wtf");
			}
			other => panic!("unexpected {other:?}"),
		}

		queue.handle_envelope(Envelope::Request {
			id: "b".into(),
			command: "testPanic".to_string(),
			args: vec![],
		});

		match next_reply(&mut io).await {
			Envelope::RequestError { error, .. } => {
				assert_eq!(error.kind, "ProgrammingError");
				assert!(error.message.contains("boom"));
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	fn request(id: &str, command: &str) -> Envelope {
		Envelope::Request {
			id: id.into(),
			command: command.to_string(),
			args: vec![],
		}
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
	async fn requests_before_initialization_are_replayed_in_order() {
		let (queue, mut io) = Queue::new("worker");
		let seen = Arc::new(Mutex::new(vec![]));

		let ids: Vec<String> = (0..64).map(|i| format!("r{i}")).collect();
		for id in &ids {
			queue.handle_envelope(request(id, "record"));
		}

		assert!(io.outbound.try_recv().is_err());

		let record = seen.clone();
		queue.set_commands(CommandTable::new().with("record", move |request: Request| {
			record.lock().push(request.id.as_str().to_string());
			async move { Ok(Value::Null) }
		}));

		for _ in 0..ids.len() {
			next_reply(&mut io).await;
		}

		assert_eq!(*seen.lock(), ids);
	}

	#[tokio::test]
	async fn arrivals_during_replay_wait_behind_the_backlog() {
		let (queue, mut io) = Queue::new("worker");
		let seen = Arc::new(Mutex::new(vec![]));

		queue.handle_envelope(request("first", "record"));
		queue.handle_envelope(request("second", "record"));

		let record = seen.clone();
		let inner = queue.clone();
		queue.set_commands(CommandTable::new().with("record", move |request: Request| {
			record.lock().push(request.id.as_str().to_string());

			// Lands while the backlog is still being replayed.
			if request.id.as_str() == "first" {
				inner.handle_envelope(self::request("late", "record"));
			}

			async move { Ok(Value::Null) }
		}));

		for _ in 0..3 {
			next_reply(&mut io).await;
		}

		assert_eq!(*seen.lock(), vec!["first", "second", "late"]);
	}

	#[tokio::test]
	async fn handler_panicking_before_its_future_is_answered() {
		let (queue, mut io) = Queue::new("worker");
		queue.set_commands(CommandTable::new().with("eager", |_: Request| {
			if true {
				panic!("too eager");
			}
			async { Ok::<_, RemoteError>(Value::Null) }
		}));

		queue.handle_envelope(request("p", "eager"));

		match next_reply(&mut io).await {
			Envelope::RequestError { id, error, .. } => {
				assert_eq!(id.as_str(), "p");
				assert_eq!(error.kind, "ProgrammingError");
				assert!(error.message.contains("too eager"));
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[tokio::test]
	async fn disconnect_settles_pending_calls() {
		let (queue, mut io) = Queue::new("main");

		let reply = queue.post_message("facade", vec![]);
		let _ = next_request(&mut io).await;

		queue.disconnect();

		assert!(matches!(reply.await, Err(CallError::Disconnected)));
		assert_eq!(queue.pending_count(), 0);
	}

	#[tokio::test]
	async fn posting_after_disconnect_sends_nothing() {
		let (queue, mut io) = Queue::new("main");
		queue.disconnect();

		let reply = queue.post_message("facade", vec![]);

		assert!(matches!(reply.await, Err(CallError::Disconnected)));
		assert!(io.outbound.try_recv().is_err());
		assert_eq!(queue.pending_count(), 0);
	}

	#[tokio::test]
	async fn handlers_finished_waits_for_replies() {
		let (queue, mut io) = Queue::new("worker");
		let (release_tx, release_rx) = oneshot::channel::<()>();
		let release_rx = Arc::new(Mutex::new(Some(release_rx)));

		queue.set_commands(CommandTable::new().with("slow", move |_: Request| {
			let release_rx = release_rx.lock().take();

			async move {
				if let Some(release_rx) = release_rx {
					let _ = release_rx.await;
				}
				Ok(json!("done"))
			}
		}));

		queue.handle_envelope(request("s", "slow"));
		queue.disconnect();

		let finished = tokio::spawn({
			let queue = queue.clone();
			async move { queue.handlers_finished().await }
		});

		tokio::task::yield_now().await;
		assert!(!finished.is_finished());

		release_tx.send(()).unwrap();
		finished.await.unwrap();

		assert_eq!(next_reply(&mut io).await.id().as_str(), "s");
	}

	#[tokio::test]
	async fn closed_transport_fails_calls_without_panicking() {
		let (queue, io) = Queue::new("main");
		drop(io);

		let reply = queue.post_message("facade", vec![]);
		assert!(matches!(reply.await, Err(CallError::Disconnected)));
	}

	#[tokio::test]
	async fn malformed_frame_is_a_fault() {
		let (queue, mut io) = Queue::new("main");

		queue.handle_frame(Codec::Json, br#"{"type":"Response","value":1}"#);

		assert!(matches!(io.faults.recv().await.unwrap(), Fault::Malformed(_)));
	}

	#[tokio::test]
	async fn failed_notification_is_a_fault() {
		let (queue, mut io) = Queue::new("worker");

		queue.notify("progress", vec![json!(50)]);
		let (id, command, args) = next_request(&mut io).await;
		assert_eq!(command, "progress");
		assert_eq!(args, vec![json!(50)]);

		queue.handle_envelope(Envelope::RequestError {
			id,
			command,
			error: RemoteError::programming("no ui").to_bag(),
		});

		match io.faults.recv().await.unwrap() {
			Fault::NotificationFailed { command, error } => {
				assert_eq!(command, "progress");
				assert_eq!(error.remote().unwrap().message, "no ui");
			}
			other => panic!("unexpected {other:?}"),
		}
	}
}
