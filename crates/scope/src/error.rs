//! Error types for scope actors, transports and codecs.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::{ActorAddress, NodeId, ScopeIdentity};

/// Errors surfaced by [`crate::ScopeRuntime`] operations.
#[derive(Debug, Error)]
pub enum ScopeError {
	/// No actor for this identity is registered on the local node.
	#[error("invalid scope: {0} is not running on this node")]
	InvalidScope(ScopeIdentity),

	/// The remote node is unreachable or runs no actor for this identity.
	#[error("invalid remote scope: {identity} on node {node}")]
	InvalidRemoteScope {
		/// Identity that was addressed.
		identity: ScopeIdentity,
		/// Node that was asked.
		node: NodeId,
	},

	/// A live actor for this identity already exists on the local node.
	#[error("scope {identity} already started at {address}")]
	AlreadyStarted {
		/// Identity that was started twice.
		identity: ScopeIdentity,
		/// Address of the running actor.
		address: ActorAddress,
	},

	/// The local actor went away before answering.
	#[error("scope {0} exited before replying")]
	Exited(ScopeIdentity),

	/// The actor is alive but its inbox is full.
	#[error("scope {identity} on node {node} is busy")]
	Busy {
		/// Identity that was called.
		identity: ScopeIdentity,
		/// Node hosting the busy actor.
		node: NodeId,
	},

	/// The call received no reply within the configured timeout.
	#[error("call to {identity} timed out after {timeout:?}")]
	Timeout {
		/// Identity that was called.
		identity: ScopeIdentity,
		/// Timeout that elapsed.
		timeout: Duration,
	},

	/// The handler refused to initialize.
	#[error("scope {identity} failed to initialize: {source}")]
	Init {
		/// Identity being started.
		identity: ScopeIdentity,
		/// Error returned by the handler.
		#[source]
		source: HandlerError,
	},

	/// A message could not be encoded or a reply could not be decoded.
	#[error(transparent)]
	Codec(#[from] CodecError),

	/// The runtime was built with an unusable [`crate::ScopeConfig`].
	#[error(transparent)]
	Config(#[from] ConfigError),
}

/// Transport level delivery failures. Scope actors log and drop these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
	/// Target process does not exist or has exited.
	#[error("no such process")]
	NoProcess,
	/// Target node is not connected to the sender.
	#[error("node not connected")]
	NoConnection,
	/// Target inbox is at capacity.
	#[error("target mailbox full")]
	MailboxFull,
}

/// Wire and table codec failures.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
	#[error("encode failed: {0}")]
	Encode(#[source] postcard::Error),
	#[error("decode failed: {0}")]
	Decode(#[source] postcard::Error),
	/// Peer speaks a different protocol revision.
	#[error("protocol version mismatch: expected {expected}, found {found}")]
	VersionMismatch { expected: u8, found: u8 },
}

/// Error returned by [`crate::ScopeHandler`] callbacks.
///
/// Any handler error is fatal to the owning actor.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
	message: String,
}

impl HandlerError {
	pub fn new(message: impl Into<String>) -> Self {
		Self { message: message.into() }
	}

	pub fn message(&self) -> &str {
		&self.message
	}
}

impl From<CodecError> for HandlerError {
	fn from(err: CodecError) -> Self {
		Self::new(err.to_string())
	}
}

/// Result type for scope operations.
pub type Result<T, E = ScopeError> = std::result::Result<T, E>;
