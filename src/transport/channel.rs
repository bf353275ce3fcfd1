//! Links two queues living in the same process.
//!
//! Envelopes still go through a JSON encode/decode step on their way
//! across, so anything that would not survive a real boundary fails here too.

use tokio::{sync::mpsc, task::JoinSet};

use super::Codec;
use crate::{Queue, envelope::Envelope};

/// Keeps both directions pumping. Dropping it stops them.
pub struct Link {
	pumps: JoinSet<()>,
}

impl Link {
	/// Stops both pumps and disconnects both queues.
	pub async fn shutdown(mut self, left: &Queue, right: &Queue) {
		self.pumps.shutdown().await;
		left.disconnect();
		right.disconnect();
	}
}

pub fn link(
	left: &Queue,
	left_outbound: mpsc::UnboundedReceiver<Envelope>,
	right: &Queue,
	right_outbound: mpsc::UnboundedReceiver<Envelope>,
) -> Link {
	let mut pumps = JoinSet::new();
	pumps.spawn(pump(left_outbound, right.clone()));
	pumps.spawn(pump(right_outbound, left.clone()));

	Link { pumps }
}

async fn pump(mut outbound: mpsc::UnboundedReceiver<Envelope>, peer: Queue) {
	while let Some(envelope) = outbound.recv().await {
		match Codec::Json.encode(&envelope) {
			Ok(frame) => peer.handle_frame(Codec::Json, &frame),
			Err(e) => log::error!("Dropping unencodable {:?}: {}", envelope, e),
		}
	}

	log::trace!("Outbound channel towards `{}` closed", peer.name());
}
