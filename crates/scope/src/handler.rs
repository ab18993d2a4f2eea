//! The pluggable behaviour of a scope actor.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::actor::peers::PeerTable;
use crate::cluster::{Cluster, DownReason};
use crate::error::HandlerError;
use crate::registry::TableSet;
use crate::relay::RelayHandle;
use crate::types::{ActorAddress, MonitorRef, NodeId, ReplyTo, ScopeIdentity};
use crate::wire::{self, WireOf};

/// Bound shared by every message type a handler puts on the wire.
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {}

impl<T> WireMessage for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Whether the actor keeps running after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorFlow {
	Continue,
	Stop,
}

/// Result of [`ScopeHandler::handle_call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFlow<R> {
	/// Send this reply now.
	Reply(R),
	/// Reply later through [`ScopeContext::reply`], or never.
	NoReply,
	/// Optionally reply, then stop the actor.
	Stop(Option<R>),
}

/// Anything that is not a handshake, call or cast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeInfo<I> {
	/// A handler-defined message from a peer, e.g. a broadcast.
	Message(I),
	/// A `Down` that does not match a recorded peer, typically for an address
	/// that has since been superseded by a restart.
	Down {
		monitor: MonitorRef,
		address: ActorAddress,
		reason: DownReason,
	},
}

/// Behaviour plugged into a scope actor.
///
/// The actor owns membership: discovery, monitors and the peer set. The
/// handler owns the data. It publishes a snapshot for newly met peers,
/// merges theirs, and drops whatever belonged to a node that went away.
///
/// Every callback runs on the actor task, one at a time. An `Err` from any
/// callback stops the actor.
#[async_trait]
pub trait ScopeHandler: Sized + Send + 'static {
	/// Handler kind, the first half of a [`ScopeIdentity`].
	const KIND: &'static str;
	/// Name used in log fields.
	const LOG_NAME: &'static str = Self::KIND;

	/// Data exchanged during the handshake.
	type Snapshot: WireMessage;
	type Request: WireMessage;
	type Reply: WireMessage;
	type Cast: WireMessage;
	/// Payload of [`ScopeContext::broadcast`] and [`ScopeContext::send_to_node`].
	type Info: WireMessage;

	/// Builds the handler state. Runs after the scope's tables are provisioned
	/// and before any discovery.
	async fn init(ctx: &mut ScopeContext<Self>) -> Result<Self, HandlerError>;

	async fn handle_call(&mut self, request: Self::Request, from: &ReplyTo, ctx: &mut ScopeContext<Self>) -> Result<CallFlow<Self::Reply>, HandlerError>;

	async fn handle_cast(&mut self, cast: Self::Cast, ctx: &mut ScopeContext<Self>) -> Result<ActorFlow, HandlerError> {
		let _ = (cast, ctx);
		Ok(ActorFlow::Continue)
	}

	async fn handle_info(&mut self, info: ScopeInfo<Self::Info>, ctx: &mut ScopeContext<Self>) -> Result<ActorFlow, HandlerError> {
		let _ = (info, ctx);
		Ok(ActorFlow::Continue)
	}

	/// Snapshot of data owned by this node, sent in every `AckSync`.
	fn local_data(&self, ctx: &ScopeContext<Self>) -> Option<Self::Snapshot>;

	/// Merges a peer's snapshot.
	async fn save_remote_data(&mut self, data: Self::Snapshot, ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError>;

	/// Drops everything that belongs to `node`.
	async fn purge_local_data_for_node(&mut self, node: &NodeId, ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError>;
}

/// Actor state visible to handler callbacks.
pub struct ScopeContext<H: ScopeHandler> {
	identity: ScopeIdentity,
	address: ActorAddress,
	cluster: Arc<dyn Cluster>,
	pub(crate) peers: PeerTable,
	pub(crate) relay: RelayHandle,
	tables: TableSet,
	_handler: PhantomData<fn() -> H>,
}

impl<H: ScopeHandler> ScopeContext<H> {
	pub(crate) fn new(identity: ScopeIdentity, address: ActorAddress, cluster: Arc<dyn Cluster>, relay: RelayHandle, tables: TableSet) -> Self {
		Self {
			identity,
			address,
			cluster,
			peers: PeerTable::default(),
			relay,
			tables,
			_handler: PhantomData,
		}
	}

	pub fn identity(&self) -> &ScopeIdentity {
		&self.identity
	}

	/// Address of this actor.
	pub fn address(&self) -> &ActorAddress {
		&self.address
	}

	pub fn local_node(&self) -> &NodeId {
		&self.address.node
	}

	pub(crate) fn cluster(&self) -> &Arc<dyn Cluster> {
		&self.cluster
	}

	/// The four shared tables of this scope name.
	pub fn tables(&self) -> &TableSet {
		&self.tables
	}

	/// Nodes currently running this scope, sorted. Never includes the local node.
	pub fn peer_nodes(&self) -> Vec<NodeId> {
		self.peers.nodes()
	}

	pub fn peer_address(&self, node: &NodeId) -> Option<&ActorAddress> {
		self.peers.get(node).map(|peer| &peer.address)
	}

	/// Queues `info` for every peer outside `excluded`. Fire-and-forget.
	pub async fn broadcast(&self, info: H::Info, excluded: &[NodeId]) -> Result<(), HandlerError> {
		let frame = wire::encode(&WireOf::<H>::Info(info))?;
		self.relay.broadcast(frame, excluded.to_vec(), self.peers.snapshot()).await;
		Ok(())
	}

	/// Sends `info` to this scope's actor on `node`. Delivery failures are dropped.
	pub async fn send_to_node(&self, node: &NodeId, info: H::Info) -> Result<(), HandlerError> {
		let frame = wire::encode(&WireOf::<H>::Info(info))?;
		if let Err(err) = self.cluster.send_named(node, &self.identity, frame).await {
			tracing::debug!(scope = %self.identity, node = %node, %err, "scope.send_to_node.dropped");
		}
		Ok(())
	}

	/// Answers a call, typically one deferred with [`CallFlow::NoReply`].
	pub async fn reply(&self, to: &ReplyTo, reply: H::Reply) -> Result<(), HandlerError> {
		let frame = wire::encode(&WireOf::<H>::Reply {
			request_id: to.request_id,
			reply,
		})?;
		if let Err(err) = self.cluster.send(&to.address, frame).await {
			tracing::debug!(scope = %self.identity, to = %to.address, %err, "scope.reply.dropped");
		}
		Ok(())
	}
}
