//! A cross-context RPC queue.
//!
//! Two execution contexts (a UI and its background worker, two processes,
//! two ends of a socket) each own a [Queue]. A queue posts requests to its
//! peer, correlates replies by id, and serves the peer's requests from an
//! installed [CommandTable]. Backend capabilities are grouped into facades
//! and reached through the reserved `facade` command; see [facade].

mod command;
mod envelope;
mod error;
pub mod facade;
mod macros;
pub mod notify;
mod queue;
pub mod transport;

pub use command::{Command, CommandFuture, CommandTable, commands};
pub use envelope::{Envelope, MessageId, Request};
pub use error::{CallError, CodecError, ErrorBag, ErrorKind, Fault, RemoteError};
pub use facade::{FacadeClient, FacadeDispatcher, Remote, expose_local, expose_remote};
pub use notify::{NotificationHandler, Notifier, notification_commands};
pub use queue::{Queue, QueueIo, Reply};
