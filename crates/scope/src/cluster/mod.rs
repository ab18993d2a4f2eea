//! Cluster transport seam.
//!
//! Scope actors only talk to the cluster through [`Cluster`]: addressed sends,
//! named sends to `(node, identity)`, liveness monitors and node membership
//! events. [`LocalFabric`] is the in-process implementation used by tests and
//! the simulator.

mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use murmur_worker::MailboxReceiver;
use tokio::sync::broadcast;

pub use self::local::{LocalFabric, LocalNode};
use crate::error::SendError;
use crate::registry::Registry;
use crate::types::{ActorAddress, MonitorRef, NodeId, ScopeIdentity};

/// Node membership change observed by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
	NodeUp(NodeId),
	NodeDown(NodeId),
}

/// Why a monitored process is considered gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownReason {
	/// The process exited.
	Exited,
	/// The process did not exist when the monitor was installed.
	NoProcess,
	/// The connection to the process's node was lost.
	NoConnection,
}

/// Delivery class of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
	/// Ordinary traffic. A full inbox refuses it with [`SendError::MailboxFull`].
	Data,
	/// Handshake traffic. Accepted past inbox capacity, so only a dead or
	/// unreachable target refuses it.
	Control,
}

/// One item in a process inbox.
#[derive(Debug, Clone)]
pub enum Delivery {
	/// An encoded [`crate::wire::ScopeWire`] frame.
	Frame(Bytes),
	/// A monitor installed by this process fired.
	Down {
		monitor: MonitorRef,
		address: ActorAddress,
		reason: DownReason,
	},
}

/// Transport abstraction consumed by scope actors.
///
/// Sends are asynchronous and unacknowledged. A `Down` is delivered at most
/// once per monitor, to the inbox of the watcher that installed it, however
/// full that inbox is.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
	fn local_node(&self) -> NodeId;

	/// Currently connected nodes, excluding the local one, sorted.
	fn visible_nodes(&self) -> Vec<NodeId>;

	fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent>;

	/// Registry of the local node.
	fn registry(&self) -> Arc<Registry>;

	/// Creates a new local process and returns its inbox.
	///
	/// Dropping the inbox is the process exit.
	fn open_inbox(&self, capacity: usize) -> Inbox;

	async fn send_on(&self, lane: Lane, to: &ActorAddress, frame: Bytes) -> Result<(), SendError>;

	async fn send(&self, to: &ActorAddress, frame: Bytes) -> Result<(), SendError> {
		self.send_on(Lane::Data, to, frame).await
	}

	/// Resolves the actor registered for `identity` on `node`.
	async fn whereis(&self, node: &NodeId, identity: &ScopeIdentity) -> Result<Option<ActorAddress>, SendError>;

	/// Sends to whatever actor `node` has registered for `identity`.
	async fn send_named_on(&self, lane: Lane, node: &NodeId, identity: &ScopeIdentity, frame: Bytes) -> Result<(), SendError> {
		match self.whereis(node, identity).await? {
			Some(address) => self.send_on(lane, &address, frame).await,
			None => Err(SendError::NoProcess),
		}
	}

	async fn send_named(&self, node: &NodeId, identity: &ScopeIdentity, frame: Bytes) -> Result<(), SendError> {
		self.send_named_on(Lane::Data, node, identity, frame).await
	}

	/// Asks for a `Down` in `watcher`'s inbox when `target` goes away.
	///
	/// A target that is already gone or unreachable fires immediately.
	fn monitor(&self, watcher: &ActorAddress, target: &ActorAddress) -> MonitorRef;

	/// Removes a monitor. Unknown or already fired refs are ignored.
	fn demonitor(&self, monitor: MonitorRef);
}

type ExitHook = Box<dyn FnOnce(&ActorAddress) + Send + Sync>;

/// Receiving side of a local process.
pub struct Inbox {
	address: ActorAddress,
	rx: MailboxReceiver<Delivery>,
	on_exit: Option<ExitHook>,
}

impl fmt::Debug for Inbox {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Inbox").field("address", &self.address).field("queued", &self.rx.len()).finish()
	}
}

impl Inbox {
	/// Wraps a mailbox receiver. `on_exit` runs once when the inbox is dropped.
	pub fn new(address: ActorAddress, rx: MailboxReceiver<Delivery>, on_exit: impl FnOnce(&ActorAddress) + Send + Sync + 'static) -> Self {
		Self {
			address,
			rx,
			on_exit: Some(Box::new(on_exit)),
		}
	}

	pub fn address(&self) -> &ActorAddress {
		&self.address
	}

	/// Next delivery; `None` once the process has been torn down by its node.
	pub async fn recv(&mut self) -> Option<Delivery> {
		self.rx.recv().await
	}

	pub fn try_recv(&mut self) -> Option<Delivery> {
		self.rx.try_recv()
	}
}

impl Drop for Inbox {
	fn drop(&mut self) {
		self.rx.close();
		if let Some(on_exit) = self.on_exit.take() {
			on_exit(&self.address);
		}
	}
}
