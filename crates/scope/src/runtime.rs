//! Public entry point for starting and talking to scope actors on one node.

use std::sync::Arc;

use murmur_worker::{Clock, TaskClass, WorkerJoinSet};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::actor::{self, Control};
use crate::cluster::{Cluster, Delivery};
use crate::config::ScopeConfig;
use crate::error::{Result, ScopeError, SendError};
use crate::handler::ScopeHandler;
use crate::registry::{Registry, ScopeEntry};
use crate::types::{ActorAddress, NodeId, ReplyTo, ScopeIdentity, ScopeName};
use crate::wire::{self, ScopeWire, WireOf};

/// Capacity of the throwaway inbox a call waits on. It only ever sees one
/// reply and at most one down.
const CALL_INBOX_CAPACITY: usize = 4;

/// Starts scope actors on one node and routes calls, casts and broadcasts to
/// them. Cheap to clone.
#[derive(Clone)]
pub struct ScopeRuntime {
	cluster: Arc<dyn Cluster>,
	config: ScopeConfig,
	requests: Clock,
	cancel: CancellationToken,
}

impl std::fmt::Debug for ScopeRuntime {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ScopeRuntime").field("node", &self.cluster.local_node()).field("config", &self.config).finish()
	}
}

impl ScopeRuntime {
	pub fn new(cluster: Arc<dyn Cluster>, config: ScopeConfig) -> Self {
		Self {
			cluster,
			config,
			requests: Clock::new(),
			cancel: CancellationToken::new(),
		}
	}

	pub fn local_node(&self) -> NodeId {
		self.cluster.local_node()
	}

	pub fn config(&self) -> &ScopeConfig {
		&self.config
	}

	pub fn registry(&self) -> Arc<Registry> {
		self.cluster.registry()
	}

	/// Starts the actor for `H` in `scope` and returns once `init` has run.
	///
	/// Fails with [`ScopeError::AlreadyStarted`] if a live actor already
	/// serves this identity on the local node, and with [`ScopeError::Config`]
	/// if the runtime's configuration has a zero capacity or timeout.
	pub async fn start<H: ScopeHandler>(&self, scope: impl Into<ScopeName>) -> Result<ActorAddress> {
		self.config.validate()?;
		actor::start::<H>(Arc::clone(&self.cluster), scope.into(), &self.config, self.cancel.child_token()).await
	}

	/// Stops the local actor and waits for it to unregister.
	pub async fn stop(&self, identity: &ScopeIdentity) -> Result<()> {
		let (reply, done) = oneshot::channel();
		self.control(identity, Control::Stop { reply }).await?;
		done.await.map_err(|_| ScopeError::Exited(identity.clone()))
	}

	/// Cancels every actor started through this runtime.
	pub fn shutdown(&self) {
		tracing::info!(node = %self.cluster.local_node(), "scope.runtime.shutdown");
		self.cancel.cancel();
	}

	/// Nodes currently running `identity`, as seen by the local actor.
	pub async fn subcluster_nodes(&self, identity: &ScopeIdentity) -> Result<Vec<NodeId>> {
		let (reply, rx) = oneshot::channel();
		self.control(identity, Control::SubclusterNodes { reply }).await?;
		rx.await.map_err(|_| ScopeError::Exited(identity.clone()))
	}

	/// Peer actor addresses of the local actor, sorted by node.
	pub async fn peers(&self, identity: &ScopeIdentity) -> Result<Vec<(NodeId, ActorAddress)>> {
		let (reply, rx) = oneshot::channel();
		self.control(identity, Control::Peers { reply }).await?;
		rx.await.map_err(|_| ScopeError::Exited(identity.clone()))
	}

	/// Identities with an actor registered on this node.
	pub fn local_scopes(&self) -> Vec<ScopeIdentity> {
		self.cluster.registry().local_scopes()
	}

	/// Calls the local actor of `H` in `scope`.
	pub async fn call<H: ScopeHandler>(&self, scope: impl Into<ScopeName>, request: H::Request) -> Result<H::Reply> {
		let node = self.cluster.local_node();
		self.call_on::<H>(&node, scope, request).await
	}

	/// Calls the actor of `H` in `scope` on `node`.
	///
	/// Local targets that are missing fail with [`ScopeError::InvalidScope`],
	/// local targets that die mid-call with [`ScopeError::Exited`]. A live
	/// target whose inbox is full is [`ScopeError::Busy`]. Any other remote
	/// failure short of a timeout is [`ScopeError::InvalidRemoteScope`].
	pub async fn call_on<H: ScopeHandler>(&self, node: &NodeId, scope: impl Into<ScopeName>, request: H::Request) -> Result<H::Reply> {
		let identity = ScopeIdentity::of::<H>(scope);
		let remote = *node != self.cluster.local_node();
		let lost = |identity: &ScopeIdentity| {
			if remote {
				ScopeError::InvalidRemoteScope {
					identity: identity.clone(),
					node: node.clone(),
				}
			} else {
				ScopeError::Exited(identity.clone())
			}
		};

		let target = if remote {
			match self.cluster.whereis(node, &identity).await {
				Ok(Some(address)) => address,
				Ok(None) | Err(_) => return Err(lost(&identity)),
			}
		} else {
			self.cluster.registry().lookup_address(&identity).ok_or_else(|| ScopeError::InvalidScope(identity.clone()))?
		};

		let mut endpoint = self.cluster.open_inbox(CALL_INBOX_CAPACITY);
		let monitor = self.cluster.monitor(endpoint.address(), &target);
		let request_id = self.requests.next();
		let frame = wire::encode(&WireOf::<H>::Call {
			reply_to: ReplyTo {
				address: endpoint.address().clone(),
				request_id,
			},
			request,
		})?;
		if let Err(err) = self.cluster.send(&target, frame).await {
			self.cluster.demonitor(monitor);
			return Err(match err {
				SendError::MailboxFull => ScopeError::Busy {
					identity,
					node: node.clone(),
				},
				SendError::NoProcess | SendError::NoConnection => lost(&identity),
			});
		}

		let timeout = self.config.call_timeout();
		let waited = tokio::time::timeout(timeout, async {
			while let Some(delivery) = endpoint.recv().await {
				match delivery {
					Delivery::Frame(frame) => match wire::decode::<WireOf<H>>(&frame) {
						Ok(ScopeWire::Reply { request_id: id, reply }) if id == request_id => return Ok(reply),
						Ok(_) => tracing::debug!(request_id, "scope.call.unexpected_frame"),
						Err(err) => return Err(ScopeError::Codec(err)),
					},
					Delivery::Down { monitor: fired, .. } if fired == monitor => return Err(lost(&identity)),
					Delivery::Down { .. } => {}
				}
			}
			Err(lost(&identity))
		})
		.await;
		self.cluster.demonitor(monitor);

		match waited {
			Ok(result) => result,
			Err(_) => {
				tracing::debug!(scope = %identity, ?timeout, "scope.call.timeout");
				Err(ScopeError::Timeout { identity, timeout })
			}
		}
	}

	/// Calls every node of the local subcluster, plus the local actor.
	///
	/// Returns the replies and the nodes that failed to answer.
	pub async fn multi_call<H>(&self, scope: impl Into<ScopeName>, request: H::Request) -> Result<(Vec<(NodeId, H::Reply)>, Vec<NodeId>)>
	where
		H: ScopeHandler,
		H::Request: Clone,
	{
		let scope = scope.into();
		let identity = ScopeIdentity::of::<H>(scope.clone());
		let mut nodes = self.subcluster_nodes(&identity).await?;
		nodes.push(self.cluster.local_node());

		let mut calls = WorkerJoinSet::new(TaskClass::Call);
		for node in nodes {
			let runtime = self.clone();
			let scope = scope.clone();
			let request = request.clone();
			calls.spawn(async move {
				let result = runtime.call_on::<H>(&node, scope, request).await;
				(node, result)
			});
		}

		let mut replies = Vec::new();
		let mut bad_nodes = Vec::new();
		while let Some(joined) = calls.join_next().await {
			match joined {
				Ok((node, Ok(reply))) => replies.push((node, reply)),
				Ok((node, Err(err))) => {
					tracing::debug!(node = %node, %err, "scope.multi_call.failed");
					bad_nodes.push(node);
				}
				Err(err) => tracing::warn!(%err, "scope.multi_call.join_failed"),
			}
		}
		replies.sort_by(|a, b| a.0.cmp(&b.0));
		bad_nodes.sort_unstable();
		Ok((replies, bad_nodes))
	}

	/// Fire-and-forget message to the actor of `H` in `scope` on `node`.
	///
	/// Only a missing local actor is reported; remote delivery is not
	/// acknowledged.
	pub async fn cast<H: ScopeHandler>(&self, node: &NodeId, scope: impl Into<ScopeName>, cast: H::Cast) -> Result<()> {
		let identity = ScopeIdentity::of::<H>(scope);
		if *node == self.cluster.local_node() && self.cluster.registry().lookup_address(&identity).is_none() {
			return Err(ScopeError::InvalidScope(identity));
		}
		let frame = wire::encode(&WireOf::<H>::Cast(cast))?;
		if let Err(err) = self.cluster.send_named(node, &identity, frame).await {
			tracing::debug!(scope = %identity, node = %node, %err, "scope.cast.dropped");
		}
		Ok(())
	}

	/// Sends `info` to every peer of the local actor, skipping `excluded`.
	///
	/// Fan-out happens on the actor's relay; the local actor itself does not
	/// receive the message.
	pub async fn broadcast<H: ScopeHandler>(&self, scope: impl Into<ScopeName>, info: H::Info, excluded: &[NodeId]) -> Result<()> {
		let identity = ScopeIdentity::of::<H>(scope);
		let frame = wire::encode(&WireOf::<H>::Info(info))?;
		self.control(
			&identity,
			Control::Broadcast {
				frame,
				excluded: excluded.to_vec(),
			},
		)
		.await
	}

	/// Sends `info` directly to the actor of `H` in `scope` on `node`.
	pub async fn send_to_node<H: ScopeHandler>(&self, node: &NodeId, scope: impl Into<ScopeName>, info: H::Info) -> Result<()> {
		let identity = ScopeIdentity::of::<H>(scope);
		let frame = wire::encode(&WireOf::<H>::Info(info))?;
		if let Err(err) = self.cluster.send_named(node, &identity, frame).await {
			tracing::debug!(scope = %identity, node = %node, %err, "scope.send_to_node.dropped");
		}
		Ok(())
	}

	async fn control(&self, identity: &ScopeIdentity, cmd: Control) -> Result<()> {
		let entry = self.live_entry(identity)?;
		if entry.control().send(cmd).await {
			Ok(())
		} else {
			Err(ScopeError::InvalidScope(identity.clone()))
		}
	}

	fn live_entry(&self, identity: &ScopeIdentity) -> Result<ScopeEntry> {
		self.cluster
			.registry()
			.lookup_actor(identity)
			.filter(ScopeEntry::is_alive)
			.ok_or_else(|| ScopeError::InvalidScope(identity.clone()))
	}
}
