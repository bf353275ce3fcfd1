//! The worker process: one queue and one [Backend] per TCP connection.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
	net::{TcpListener, TcpStream},
	sync::mpsc,
	task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use worker_rpc::{
	Fault, Notifier, Queue, RemoteError, commands, transport::stream,
};

use crate::{backend::Backend, config::Config};

pub async fn run(
	config: Arc<Config>,
	shutdown: CancellationToken,
) -> eyre::Result<()> {
	let listener = TcpListener::bind(config.server.addr).await?;
	log::info!("👂 Listening on tcp://{}", listener.local_addr()?);

	serve(listener, config, shutdown).await
}

pub async fn serve(
	listener: TcpListener,
	config: Arc<Config>,
	shutdown: CancellationToken,
) -> eyre::Result<()> {
	let mut connections = JoinSet::new();

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, addr)) => {
						log::debug!("Got new TCP connection from {}", addr);

						connections.spawn(handle_connection(
							stream,
							addr,
							config.clone(),
							shutdown.child_token(),
						));
					}

					Err(e) => log::warn!("Failed to accept: {}", e),
				}
			},

			_ = shutdown.cancelled() => {
				log::info!("🛑 Shutting down...");
				connections.join_all().await;
				log::debug!("✅ All connections closed");
				break;
			}
		}
	}

	Ok(())
}

async fn handle_connection(
	stream: TcpStream,
	addr: SocketAddr,
	config: Arc<Config>,
	shutdown: CancellationToken,
) {
	let (queue, io) = Queue::new(format!("{}@{}", config.worker.name, addr));

	let backend = Backend::new(Notifier::new(queue.clone()), &config.worker);
	queue.set_commands(backend.commands());

	let faults = tokio::spawn(report_faults(queue.clone(), io.faults));

	match stream::drive(queue.clone(), io.outbound, stream, shutdown).await {
		Ok(()) => log::debug!("[{}] Connection closed", queue.name()),
		Err(e) => log::warn!("[{}] Connection failed: {:?}", queue.name(), e),
	}

	faults.abort();
}

/// Forwards worker-side faults to the main context, which owns the
/// user-visible error reporting.
async fn report_faults(queue: Queue, mut faults: mpsc::UnboundedReceiver<Fault>) {
	while let Some(fault) = faults.recv().await {
		// A failing `error` push would otherwise feed itself.
		if matches!(
			&fault,
			Fault::NotificationFailed { command, .. } if command == commands::ERROR
		) {
			continue;
		}

		let error = RemoteError::programming(fault.to_string());
		let Ok(bag) = serde_json::to_value(error.to_bag()) else {
			continue;
		};

		queue.notify(commands::ERROR, vec![bag]);
	}
}
