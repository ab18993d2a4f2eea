//! Frame format exchanged between scope actors.
//!
//! Every frame is a postcard-encoded envelope whose first byte is the
//! protocol version, so a mismatched peer is detected before the body is
//! interpreted.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ScopeHandler;
use crate::error::CodecError;
use crate::types::{ActorAddress, ReplyTo};

/// Current wire protocol revision.
pub const PROTOCOL_VERSION: u8 = 3;

/// Messages delivered to a scope actor's inbox.
///
/// Type parameters are the handler's snapshot, request, reply, cast and info
/// types; see [`WireOf`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScopeWire<S, Q, R, C, I> {
	/// "I exist; here is my address."
	Discover { from: ActorAddress },
	/// Handshake reply carrying the sender's local data, if any.
	AckSync { from: ActorAddress, data: Option<S> },
	Call { reply_to: ReplyTo, request: Q },
	Reply { request_id: u64, reply: R },
	Cast(C),
	/// Handler-defined peer message, e.g. a broadcast payload.
	Info(I),
}

/// The wire type of handler `H`.
pub type WireOf<H> = ScopeWire<
	<H as ScopeHandler>::Snapshot,
	<H as ScopeHandler>::Request,
	<H as ScopeHandler>::Reply,
	<H as ScopeHandler>::Cast,
	<H as ScopeHandler>::Info,
>;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
	version: u8,
	message: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
	version: u8,
	message: T,
}

/// Encodes `message` into a versioned frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, CodecError> {
	let envelope = EnvelopeRef {
		version: PROTOCOL_VERSION,
		message,
	};
	postcard::to_stdvec(&envelope).map(Bytes::from).map_err(CodecError::Encode)
}

/// Decodes a frame produced by [`encode`].
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, CodecError> {
	let (version, _) = postcard::take_from_bytes::<u8>(frame).map_err(CodecError::Decode)?;
	if version != PROTOCOL_VERSION {
		return Err(CodecError::VersionMismatch {
			expected: PROTOCOL_VERSION,
			found: version,
		});
	}
	let envelope: Envelope<T> = postcard::from_bytes(frame).map_err(CodecError::Decode)?;
	debug_assert_eq!(envelope.version, PROTOCOL_VERSION);
	Ok(envelope.message)
}
