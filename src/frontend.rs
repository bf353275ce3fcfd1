//! The main-context side of the demo: a connection to the worker plus a
//! notification handler that renders pushes into the log.

use std::{
	collections::HashMap,
	net::SocketAddr,
	sync::{
		Arc,
		atomic::{AtomicU64, AtomicUsize, Ordering},
	},
};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use worker_rpc::{
	NotificationHandler, Queue, Remote, RemoteError, expose_remote,
	notification_commands,
	notify::{InfoMessage, ProgressMonitorId, WebSocketState},
	transport::stream,
};

#[derive(Debug)]
struct Monitor {
	total: u64,
	done: u64,
}

#[derive(Default, Debug)]
pub struct UiNotifications {
	next_monitor: AtomicU64,
	monitors: Mutex<HashMap<ProgressMonitorId, Monitor>>,
	completed: AtomicUsize,
}

impl UiNotifications {
	/// Monitors whose work has all been reported done.
	pub fn completed_monitors(&self) -> usize {
		self.completed.load(Ordering::SeqCst)
	}
}

impl NotificationHandler for UiNotifications {
	fn on_error(&self, error: RemoteError) {
		match &error.stack {
			Some(stack) => log::error!("💥 Worker error: {}\n{}", error, stack),
			None => log::error!("💥 Worker error: {}", error),
		}
	}

	fn on_progress(&self, percentage: u8) {
		log::info!("⏳ {}%", percentage);
	}

	fn on_web_socket_state(&self, state: WebSocketState) {
		log::info!("🔌 WebSocket {:?}", state);
	}

	fn on_info_message(&self, message: InfoMessage) {
		log::info!("💬 {} {:?}", message.translation_key, message.args);
	}

	fn create_progress_monitor(&self, total_work: u64) -> ProgressMonitorId {
		let id = ProgressMonitorId(self.next_monitor.fetch_add(1, Ordering::SeqCst));

		self.monitors.lock().insert(
			id,
			Monitor {
				total: total_work,
				done: 0,
			},
		);

		id
	}

	fn on_progress_work_done(&self, monitor: ProgressMonitorId, work: u64) {
		let mut monitors = self.monitors.lock();

		let Some(entry) = monitors.get_mut(&monitor) else {
			log::warn!("Work reported for unknown progress monitor {}", monitor);
			return;
		};

		entry.done = entry.done.saturating_add(work).min(entry.total);
		log::debug!("Progress monitor {}: {}/{}", monitor, entry.done, entry.total);

		if entry.done == entry.total {
			monitors.remove(&monitor);
			self.completed.fetch_add(1, Ordering::SeqCst);
		}
	}
}

pub struct Frontend {
	remote: Remote,
	handler: Arc<UiNotifications>,
	shutdown: CancellationToken,
	connection: JoinHandle<eyre::Result<()>>,
	faults: JoinHandle<()>,
}

impl Frontend {
	pub async fn connect(addr: SocketAddr) -> eyre::Result<Self> {
		let stream = TcpStream::connect(addr).await?;
		log::debug!("Connected to tcp://{}", addr);

		let (queue, mut io) = Queue::new("main");

		let handler = Arc::new(UiNotifications::default());
		queue.set_commands(notification_commands(handler.clone()));

		// Already logged by the queue.
		let faults = tokio::spawn(async move { while io.faults.recv().await.is_some() {} });

		let shutdown = CancellationToken::new();
		let connection = tokio::spawn(stream::drive(
			queue.clone(),
			io.outbound,
			stream,
			shutdown.clone(),
		));

		Ok(Self {
			remote: expose_remote(queue),
			handler,
			shutdown,
			connection,
			faults,
		})
	}

	pub fn remote(&self) -> &Remote {
		&self.remote
	}

	pub fn queue(&self) -> &Queue {
		self.remote.queue()
	}

	pub fn handler(&self) -> &UiNotifications {
		&self.handler
	}

	pub async fn echo(&self, message: &str) -> eyre::Result<String> {
		let reply = self
			.queue()
			.post_message("testEcho", vec![json!({ "msg": message })])
			.await?;

		match reply.get("msg") {
			Some(Value::String(msg)) => Ok(msg.clone()),
			_ => eyre::bail!("unexpected echo reply {}", reply),
		}
	}

	pub async fn call(
		&self,
		facade: &str,
		method: &str,
		args: Vec<Value>,
	) -> eyre::Result<Value> {
		Ok(self.remote().facade(facade).call(method, args).await?)
	}

	pub async fn close(self) -> eyre::Result<()> {
		self.shutdown.cancel();
		let result = self.connection.await?;
		self.faults.abort();
		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn monitors_complete_once() {
		let ui = UiNotifications::default();

		let first = ui.create_progress_monitor(3);
		let second = ui.create_progress_monitor(1);
		assert_ne!(first, second);

		ui.on_progress_work_done(first, 2);
		assert_eq!(ui.completed_monitors(), 0);

		ui.on_progress_work_done(first, 5);
		assert_eq!(ui.completed_monitors(), 1);

		// Already removed.
		ui.on_progress_work_done(first, 1);
		assert_eq!(ui.completed_monitors(), 1);

		ui.on_progress_work_done(second, 1);
		assert_eq!(ui.completed_monitors(), 2);
	}

	#[test]
	fn huge_work_report_completes_without_overflow() {
		let ui = UiNotifications::default();
		let monitor = ui.create_progress_monitor(10);

		ui.on_progress_work_done(monitor, 3);
		ui.on_progress_work_done(monitor, u64::MAX);
		assert_eq!(ui.completed_monitors(), 1);
	}

	#[tokio::test]
	async fn connect_refused() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		assert!(Frontend::connect(addr).await.is_err());
	}
}
