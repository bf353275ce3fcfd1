//! Length-prefixed CBOR frames over any byte stream (TCP, pipes, duplex).

use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
	sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use super::Codec;
use crate::{Queue, RemoteError, envelope::Envelope};

/// Frames larger than this are refused rather than allocated.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let len = u32::try_from(frame.len())
		.ok()
		.filter(|len| *len as usize <= MAX_FRAME_LEN)
		.ok_or_else(|| {
			std::io::Error::new(
				std::io::ErrorKind::InvalidInput,
				format!("frame of {} bytes is too large", frame.len()),
			)
		})?;

	writer.write_u32(len).await?;
	writer.write_all(frame).await?;
	writer.flush().await
}

pub struct FrameReader<R> {
	reader: BufReader<R>,
}

impl<R> FrameReader<R>
where
	R: AsyncRead + Unpin,
{
	pub fn new(inner: R) -> Self {
		FrameReader {
			reader: BufReader::new(inner),
		}
	}

	/// `Ok(None)` on a clean EOF between frames.
	pub async fn next_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
		log::trace!("Reading frame length...");
		let mut len_buf = [0u8; 4];

		// EOF is only clean before the first byte of a length prefix.
		if self.reader.read(&mut len_buf[..1]).await? == 0 {
			return Ok(None);
		}

		self.reader.read_exact(&mut len_buf[1..]).await?;

		let len = u32::from_be_bytes(len_buf) as usize;
		if len > MAX_FRAME_LEN {
			return Err(std::io::Error::new(
				std::io::ErrorKind::InvalidData,
				format!("frame of {len} bytes is too large"),
			));
		}

		log::trace!("Reading frame body ({})...", len);
		let mut buffer = vec![0u8; len];
		self.reader.read_exact(&mut buffer).await?;

		Ok(Some(buffer))
	}
}

/// Encodes `envelope` for the wire. An envelope that cannot go out is
/// answered locally instead: a reply turns into a `RequestError` for the
/// peer, and a request settles its own pending call.
fn encode_for_wire(queue: &Queue, envelope: Envelope) -> Option<Vec<u8>> {
	let what = if envelope.is_request() { "request" } else { "reply" };

	let error = match Codec::Cbor.encode(&envelope) {
		Ok(frame) if frame.len() <= MAX_FRAME_LEN => return Some(frame),

		Ok(frame) => RemoteError::programming(format!(
			"{what} of {} bytes exceeds the frame limit",
			frame.len()
		)),

		Err(e) => RemoteError::programming(format!("failed to encode {what}: {e}")),
	};

	log::error!(
		"[{}] Cannot send `{}` ({}): {}",
		queue.name(),
		envelope.command(),
		envelope.id(),
		error
	);

	match envelope {
		Envelope::Request { id, command, .. } => {
			queue.handle_envelope(Envelope::RequestError {
				id,
				command,
				error: error.to_bag(),
			});

			None
		}

		Envelope::Response { id, command, .. } | Envelope::RequestError { id, command, .. } => {
			let fallback = Envelope::RequestError {
				id,
				command,
				error: error.to_bag(),
			};

			Codec::Cbor
				.encode(&fallback)
				.ok()
				.filter(|frame| frame.len() <= MAX_FRAME_LEN)
		}
	}
}

/// Runs one connection until an I/O error or `shutdown`, or until the
/// peer stops sending. In the last case requests that already arrived
/// are still answered before the write side is closed.
/// Disconnects the queue on the way out.
pub async fn drive<S>(
	queue: Queue,
	mut outbound: mpsc::UnboundedReceiver<Envelope>,
	stream: S,
	shutdown: CancellationToken,
) -> eyre::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let (reader, mut writer) = tokio::io::split(stream);
	let mut reader = FrameReader::new(reader);

	// Stops the writer once the outbound channel is empty.
	let flush = CancellationToken::new();

	// Each direction is one long-lived future, so a partially read
	// frame is never lost to a `select!` branch switch.
	let read_loop = async {
		while let Some(frame) = reader.next_frame().await? {
			queue.handle_frame(Codec::Cbor, &frame);
		}

		log::debug!("[{}] Reader EOF", queue.name());
		eyre::Ok(())
	};

	let write_loop = async {
		loop {
			let envelope = tokio::select! {
				biased;
				envelope = outbound.recv() => envelope,
				_ = flush.cancelled() => None,
			};

			let Some(envelope) = envelope else {
				break;
			};

			if let Some(frame) = encode_for_wire(&queue, envelope) {
				write_frame(&mut writer, &frame).await?;
			}
		}

		if let Err(e) = writer.shutdown().await {
			log::trace!("[{}] Closing writer: {}", queue.name(), e);
		}

		log::trace!("[{}] Writer EOF", queue.name());
		eyre::Ok(())
	};

	tokio::pin!(write_loop);

	let result = tokio::select! {
		biased;

		_ = shutdown.cancelled() => {
			log::debug!("[{}] Shutting down connection", queue.name());
			Ok(())
		}

		result = &mut write_loop => result,

		result = read_loop => match result {
			Ok(()) => {
				// Nothing more arrives, so nothing new gets started.
				queue.disconnect();

				let drained = async {
					queue.handlers_finished().await;
					flush.cancel();
					(&mut write_loop).await
				};

				tokio::select! {
					biased;

					_ = shutdown.cancelled() => {
						log::debug!("[{}] Shutting down connection", queue.name());
						Ok(())
					}

					result = drained => result,
				}
			}

			Err(e) => Err(e),
		},
	};

	queue.disconnect();
	result
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::{CallError, CommandTable, Fault, envelope::Request};

	fn spawn_pair() -> (Queue, Queue, mpsc::UnboundedReceiver<Fault>, CancellationToken) {
		let (main_stream, worker_stream) = tokio::io::duplex(1024);
		let shutdown = CancellationToken::new();

		let (main, main_io) = Queue::new("main");
		let (worker, worker_io) = Queue::new("worker");

		tokio::spawn(drive(
			main.clone(),
			main_io.outbound,
			main_stream,
			shutdown.child_token(),
		));

		tokio::spawn(drive(
			worker.clone(),
			worker_io.outbound,
			worker_stream,
			shutdown.child_token(),
		));

		(main, worker, worker_io.faults, shutdown)
	}

	#[tokio::test]
	async fn request_and_reply_over_cbor_frames() {
		let (main, worker, _faults, _shutdown) = spawn_pair();

		worker.set_commands(CommandTable::new().with("urlify", |request: Request| async move {
			let html: String = request.arg(0)?;
			Ok(json!(format!("<a href=\"{html}\">{html}</a>")))
		}));

		let value = main
			.post_message("urlify", vec![json!("https://example.org")])
			.await
			.unwrap();

		assert_eq!(
			value,
			json!("<a href=\"https://example.org\">https://example.org</a>")
		);
	}

	#[tokio::test]
	async fn shutdown_disconnects_pending_calls() {
		let (main, _worker, _faults, shutdown) = spawn_pair();

		// The worker never installs commands, so this stays pending.
		let reply = main.post_message("neverAnswered", vec![]);
		shutdown.cancel();

		assert!(matches!(reply.await, Err(CallError::Disconnected)));
	}

	#[tokio::test]
	async fn garbage_frame_is_a_fault_and_the_loop_survives() {
		let (mut client, server) = tokio::io::duplex(1024);
		let (worker, mut worker_io) = Queue::new("worker");

		worker.set_commands(CommandTable::new().with("ping", |_: Request| async {
			Ok(json!("pong"))
		}));

		tokio::spawn(drive(
			worker.clone(),
			worker_io.outbound,
			server,
			CancellationToken::new(),
		));

		write_frame(&mut client, b"\xff\x00garbage").await.unwrap();
		assert!(matches!(
			worker_io.faults.recv().await.unwrap(),
			Fault::Malformed(_)
		));

		let ping = Envelope::Request {
			id: "p1".into(),
			command: "ping".to_string(),
			args: vec![],
		};
		write_frame(&mut client, &Codec::Cbor.encode(&ping).unwrap())
			.await
			.unwrap();

		let mut reader = FrameReader::new(client);
		let frame = reader.next_frame().await.unwrap().unwrap();

		assert_eq!(
			Codec::Cbor.decode(&frame).unwrap(),
			Envelope::Response {
				id: "p1".into(),
				command: "ping".to_string(),
				value: json!("pong"),
			}
		);
	}

	#[tokio::test]
	async fn half_closed_peer_still_gets_its_reply() {
		let (mut client, server) = tokio::io::duplex(1024);
		let (worker, worker_io) = Queue::new("worker");

		worker.set_commands(CommandTable::new().with("ping", |_: Request| async {
			tokio::task::yield_now().await;
			Ok(json!("pong"))
		}));

		let driver = tokio::spawn(drive(
			worker.clone(),
			worker_io.outbound,
			server,
			CancellationToken::new(),
		));

		let ping = Envelope::Request {
			id: "h1".into(),
			command: "ping".to_string(),
			args: vec![],
		};
		write_frame(&mut client, &Codec::Cbor.encode(&ping).unwrap())
			.await
			.unwrap();
		client.shutdown().await.unwrap();

		let mut reader = FrameReader::new(client);
		let frame = reader.next_frame().await.unwrap().unwrap();

		assert_eq!(
			Codec::Cbor.decode(&frame).unwrap(),
			Envelope::Response {
				id: "h1".into(),
				command: "ping".to_string(),
				value: json!("pong"),
			}
		);

		// The worker closes its side once everything is answered.
		assert!(reader.next_frame().await.unwrap().is_none());
		driver.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn oversized_reply_becomes_an_error_and_the_loop_survives() {
		let (main, worker, _faults, _shutdown) = spawn_pair();

		worker.set_commands(
			CommandTable::new()
				.with("big", |_: Request| async {
					Ok(json!("x".repeat(MAX_FRAME_LEN + 1)))
				})
				.with("ping", |_: Request| async { Ok(json!("pong")) }),
		);

		let error = main.post_message("big", vec![]).await.unwrap_err();
		let error = error.remote().unwrap();
		assert_eq!(error.kind, crate::ErrorKind::Programming);
		assert!(error.message.contains("exceeds the frame limit"));

		assert_eq!(
			main.post_message("ping", vec![]).await.unwrap(),
			json!("pong")
		);
	}

	#[tokio::test]
	async fn oversized_request_fails_locally() {
		let (main, worker, _faults, _shutdown) = spawn_pair();

		worker.set_commands(
			CommandTable::new().with("ping", |_: Request| async { Ok(json!("pong")) }),
		);

		let error = main
			.post_message("ping", vec![json!("x".repeat(MAX_FRAME_LEN + 1))])
			.await
			.unwrap_err();
		assert!(error.remote().unwrap().message.contains("request of"));
		assert_eq!(main.pending_count(), 0);

		assert_eq!(
			main.post_message("ping", vec![]).await.unwrap(),
			json!("pong")
		);
	}

	#[tokio::test]
	async fn eof_inside_a_length_prefix_is_an_error() {
		let (mut client, server) = tokio::io::duplex(64);
		client.write_all(&[0, 0]).await.unwrap();
		client.shutdown().await.unwrap();

		let error = FrameReader::new(server).next_frame().await.unwrap_err();
		assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
	}

	#[tokio::test]
	async fn eof_between_frames_is_clean() {
		let (mut client, server) = tokio::io::duplex(64);
		write_frame(&mut client, b"one").await.unwrap();
		client.shutdown().await.unwrap();

		let mut reader = FrameReader::new(server);
		assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"one");
		assert!(reader.next_frame().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn oversized_length_is_rejected() {
		let (mut client, server) = tokio::io::duplex(64);
		client.write_u32(u32::MAX).await.unwrap();

		let mut reader = FrameReader::new(server);
		let error = reader.next_frame().await.unwrap_err();
		assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
	}
}
