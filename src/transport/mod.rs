use crate::{envelope::Envelope, error::CodecError};

pub mod channel;
pub mod stream;

/// How envelopes are turned into bytes at the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
	Json,
	Cbor,
}

impl Codec {
	pub fn encode(self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
		Ok(match self {
			Self::Json => serde_json::to_vec(envelope)?,
			Self::Cbor => serde_cbor::to_vec(envelope)?,
		})
	}

	pub fn decode(self, bytes: &[u8]) -> Result<Envelope, CodecError> {
		Ok(match self {
			Self::Json => serde_json::from_slice(bytes)?,
			Self::Cbor => serde_cbor::from_slice(bytes)?,
		})
	}
}
