//! The per-`(handler, scope)` actor loop.
//!
//! # Role
//!
//! One actor per identity per node. It finds its peers on other nodes with a
//! `Discover` / `AckSync` handshake, keeps one monitor per peer, hands remote
//! snapshots to the handler and asks the handler to purge a node's data when
//! that node's actor goes away.
//!
//! # Invariants
//!
//! - At most one peer entry, and one live monitor, per remote node.
//! - The local node is never a peer.
//! - A `Down` only removes a peer if its address still matches the entry.
//! - A handshake with an already known address sends no further `AckSync`,
//!   so two actors exchange a bounded number of messages per meeting.
//! - A peer is only admitted once our `AckSync` reached it. Handshake frames
//!   travel on [`Lane::Control`], so that only fails for a dead or
//!   unreachable peer.
//!
//! # Lifecycle
//!
//! Start subscribes to membership, starts the relay, provisions the scope's
//! tables, runs `init`, and only then signals the caller. Discovery of
//! already visible nodes runs as the first step of the loop.

pub(crate) mod peers;

use std::sync::Arc;

use bytes::Bytes;
use murmur_worker::TaskClass;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use self::peers::Admission;
use crate::cluster::{Cluster, Delivery, DownReason, Inbox, Lane, MembershipEvent};
use crate::config::ScopeConfig;
use crate::error::{HandlerError, ScopeError};
use crate::handler::{ActorFlow, CallFlow, ScopeContext, ScopeHandler, ScopeInfo};
use crate::registry::ScopeEntry;
use crate::relay::RelayHandle;
use crate::types::{ActorAddress, MonitorRef, NodeId, ReplyTo, ScopeIdentity, ScopeName};
use crate::wire::{self, ScopeWire, WireOf};

/// Local-only commands, delivered outside the wire protocol.
pub(crate) enum Control {
	SubclusterNodes { reply: oneshot::Sender<Vec<NodeId>> },
	Peers { reply: oneshot::Sender<Vec<(NodeId, ActorAddress)>> },
	Broadcast { frame: Bytes, excluded: Vec<NodeId> },
	Stop { reply: oneshot::Sender<()> },
}

/// Local control port of a running actor, held by the registry.
#[derive(Debug, Clone)]
pub struct ScopeControl {
	tx: mpsc::Sender<Control>,
}

impl ScopeControl {
	pub(crate) fn new(tx: mpsc::Sender<Control>) -> Self {
		Self { tx }
	}

	pub(crate) fn is_alive(&self) -> bool {
		!self.tx.is_closed()
	}

	pub(crate) async fn send(&self, cmd: Control) -> bool {
		self.tx.send(cmd).await.is_ok()
	}
}

enum Exit {
	Stopped(Option<oneshot::Sender<()>>),
	HandlerStopped,
	HandlerFailed(HandlerError),
	InboxClosed,
	Detached,
	Cancelled,
}

impl Exit {
	fn as_str(&self) -> &'static str {
		match self {
			Self::Stopped(_) => "stopped",
			Self::HandlerStopped => "handler_stopped",
			Self::HandlerFailed(_) => "handler_failed",
			Self::InboxClosed => "inbox_closed",
			Self::Detached => "detached",
			Self::Cancelled => "cancelled",
		}
	}
}

/// Outcome of one loop step. `None` keeps the loop running.
type Step = Option<Exit>;

fn step(result: Result<ActorFlow, HandlerError>) -> Step {
	match result {
		Ok(ActorFlow::Continue) => None,
		Ok(ActorFlow::Stop) => Some(Exit::HandlerStopped),
		Err(err) => Some(Exit::HandlerFailed(err)),
	}
}

/// Starts the actor for `H` in `scope` and waits until it is initialized.
pub(crate) async fn start<H: ScopeHandler>(cluster: Arc<dyn Cluster>, scope: ScopeName, config: &ScopeConfig, cancel: CancellationToken) -> Result<ActorAddress, ScopeError> {
	let identity = ScopeIdentity::of::<H>(scope);
	let registry = cluster.registry();
	if let Some(existing) = registry.lookup_actor(&identity).filter(ScopeEntry::is_alive) {
		return Err(ScopeError::AlreadyStarted {
			identity,
			address: existing.address().clone(),
		});
	}

	let inbox = cluster.open_inbox(config.inbox_capacity);
	let address = inbox.address().clone();
	let (control_tx, control_rx) = mpsc::channel(config.control_capacity);
	if let Err(existing) = registry.claim_actor(&identity, ScopeEntry::new(address.clone(), ScopeControl::new(control_tx))) {
		return Err(ScopeError::AlreadyStarted { identity, address: existing });
	}

	let (ready_tx, ready_rx) = oneshot::channel();
	let span = tracing::info_span!("scope", handler = H::LOG_NAME, scope = %identity.scope, node = %address.node);
	let boot = Boot {
		identity: identity.clone(),
		cluster,
		inbox,
		control: control_rx,
		relay_capacity: config.relay_capacity,
		cancel,
	};
	murmur_worker::spawn(TaskClass::Scope, boot.run::<H>(ready_tx).instrument(span));

	match ready_rx.await {
		Ok(Ok(())) => Ok(address),
		Ok(Err(source)) => Err(ScopeError::Init { identity, source }),
		Err(_) => Err(ScopeError::Exited(identity)),
	}
}

struct Boot {
	identity: ScopeIdentity,
	cluster: Arc<dyn Cluster>,
	inbox: Inbox,
	control: mpsc::Receiver<Control>,
	relay_capacity: usize,
	cancel: CancellationToken,
}

impl Boot {
	async fn run<H: ScopeHandler>(self, ready: oneshot::Sender<Result<(), HandlerError>>) {
		let Boot {
			identity,
			cluster,
			inbox,
			control,
			relay_capacity,
			cancel,
		} = self;
		let address = inbox.address().clone();
		let registry = cluster.registry();

		let membership = cluster.subscribe_membership();
		let (relay, _relay_task) = RelayHandle::start(identity.clone(), Arc::clone(&cluster), relay_capacity);
		let tables = registry.provision_tables(&identity.scope);
		let mut ctx = ScopeContext::<H>::new(identity.clone(), address.clone(), cluster, relay, tables);

		let handler = match H::init(&mut ctx).await {
			Ok(handler) => handler,
			Err(err) => {
				tracing::warn!(%err, "scope.init.failed");
				ctx.relay.terminate().await;
				registry.unregister_actor(&identity, &address);
				drop(inbox);
				let _ = ready.send(Err(err));
				return;
			}
		};

		tracing::info!(address = %address, "scope.actor.start");
		if ready.send(Ok(())).is_err() {
			tracing::debug!("scope.start.caller_gone");
		}

		let actor = ScopeActor {
			ctx,
			handler,
			inbox,
			control,
			membership,
			membership_open: true,
			cancel,
		};
		actor.run().await;
	}
}

struct ScopeActor<H: ScopeHandler> {
	ctx: ScopeContext<H>,
	handler: H,
	inbox: Inbox,
	control: mpsc::Receiver<Control>,
	membership: broadcast::Receiver<MembershipEvent>,
	membership_open: bool,
	cancel: CancellationToken,
}

impl<H: ScopeHandler> ScopeActor<H> {
	async fn run(mut self) {
		self.discover_visible().await;

		let exit = loop {
			let step = tokio::select! {
				biased;
				_ = self.cancel.cancelled() => Some(Exit::Cancelled),
				cmd = self.control.recv() => match cmd {
					Some(cmd) => self.handle_control(cmd).await,
					None => Some(Exit::Detached),
				},
				delivery = self.inbox.recv() => match delivery {
					Some(Delivery::Frame(frame)) => self.handle_frame(frame).await,
					Some(Delivery::Down { monitor, address, reason }) => step(self.handle_down(monitor, address, reason).await),
					None => Some(Exit::InboxClosed),
				},
				event = self.membership.recv(), if self.membership_open => {
					self.handle_membership(event).await;
					None
				}
			};
			if let Some(exit) = step {
				break exit;
			}
		};

		self.terminate(exit).await;
	}

	async fn handle_control(&mut self, cmd: Control) -> Step {
		match cmd {
			Control::SubclusterNodes { reply } => {
				let _ = reply.send(self.ctx.peers.nodes());
			}
			Control::Peers { reply } => {
				let _ = reply.send(self.ctx.peers.snapshot());
			}
			Control::Broadcast { frame, excluded } => {
				self.ctx.relay.broadcast(frame, excluded, self.ctx.peers.snapshot()).await;
			}
			Control::Stop { reply } => return Some(Exit::Stopped(Some(reply))),
		}
		None
	}

	async fn handle_frame(&mut self, frame: Bytes) -> Step {
		let message: WireOf<H> = match wire::decode(&frame) {
			Ok(message) => message,
			Err(err) => {
				tracing::warn!(%err, len = frame.len(), "scope.frame.dropped");
				return None;
			}
		};

		let result = match message {
			ScopeWire::Discover { from } => self.handle_discover(from).await,
			ScopeWire::AckSync { from, data } => self.handle_ack_sync(from, data).await,
			ScopeWire::Call { reply_to, request } => self.handle_call(reply_to, request).await,
			ScopeWire::Cast(cast) => self.handler.handle_cast(cast, &mut self.ctx).await,
			ScopeWire::Info(info) => self.handler.handle_info(ScopeInfo::Message(info), &mut self.ctx).await,
			ScopeWire::Reply { request_id, .. } => {
				tracing::debug!(request_id, "scope.reply.unexpected");
				Ok(ActorFlow::Continue)
			}
		};
		step(result)
	}

	async fn handle_discover(&mut self, from: ActorAddress) -> Result<ActorFlow, HandlerError> {
		if from.node == *self.ctx.local_node() {
			return Ok(ActorFlow::Continue);
		}
		tracing::debug!(from = %from, "scope.discover.recv");
		let acked = self.send_ack_sync(&from).await;

		match self.ctx.peers.classify(&from) {
			Admission::Known => {}
			Admission::New if acked => self.admit(from),
			Admission::New => {}
			Admission::Superseded(old) => {
				self.retire(old.address, old.monitor).await?;
				if acked {
					self.admit(from);
				}
			}
		}
		Ok(ActorFlow::Continue)
	}

	async fn handle_ack_sync(&mut self, from: ActorAddress, data: Option<H::Snapshot>) -> Result<ActorFlow, HandlerError> {
		if from.node == *self.ctx.local_node() {
			return Ok(ActorFlow::Continue);
		}
		tracing::debug!(from = %from, with_data = data.is_some(), "scope.ack_sync.recv");

		let admission = self.ctx.peers.classify(&from);
		if let Admission::Superseded(old) = &admission {
			self.retire(old.address.clone(), old.monitor).await?;
		}
		if let Some(data) = data {
			self.handler.save_remote_data(data, &mut self.ctx).await?;
		}
		if admission != Admission::Known && self.send_ack_sync(&from).await {
			self.admit(from);
		}
		Ok(ActorFlow::Continue)
	}

	async fn handle_call(&mut self, reply_to: ReplyTo, request: H::Request) -> Result<ActorFlow, HandlerError> {
		match self.handler.handle_call(request, &reply_to, &mut self.ctx).await? {
			CallFlow::Reply(reply) => {
				self.ctx.reply(&reply_to, reply).await?;
				Ok(ActorFlow::Continue)
			}
			CallFlow::NoReply => Ok(ActorFlow::Continue),
			CallFlow::Stop(reply) => {
				if let Some(reply) = reply {
					self.ctx.reply(&reply_to, reply).await?;
				}
				Ok(ActorFlow::Stop)
			}
		}
	}

	async fn handle_down(&mut self, monitor: MonitorRef, address: ActorAddress, reason: DownReason) -> Result<ActorFlow, HandlerError> {
		if let Some(peer) = self.ctx.peers.remove_if_current(&address) {
			tracing::info!(peer = %address, reason = ?reason, peers = self.ctx.peers.len(), "scope.peer.down");
			if peer.monitor != monitor {
				self.ctx.cluster().demonitor(peer.monitor);
			}
			self.handler.purge_local_data_for_node(&address.node, &mut self.ctx).await?;
			return Ok(ActorFlow::Continue);
		}

		tracing::debug!(address = %address, reason = ?reason, "scope.down.stale");
		self.handler.handle_info(ScopeInfo::Down { monitor, address, reason }, &mut self.ctx).await
	}

	async fn handle_membership(&mut self, event: Result<MembershipEvent, RecvError>) {
		match event {
			Ok(MembershipEvent::NodeUp(node)) => {
				tracing::debug!(node = %node, "scope.node.up");
				self.discover(&node).await;
			}
			// Peer removal is driven by monitors alone.
			Ok(MembershipEvent::NodeDown(node)) => tracing::debug!(node = %node, "scope.node.down"),
			Err(RecvError::Lagged(missed)) => {
				tracing::warn!(missed, "scope.membership.lagged");
				self.discover_visible().await;
			}
			Err(RecvError::Closed) => {
				tracing::debug!("scope.membership.closed");
				self.membership_open = false;
			}
		}
	}

	fn admit(&mut self, address: ActorAddress) {
		let monitor = self.ctx.cluster().monitor(self.ctx.address(), &address);
		self.ctx.peers.insert(address.clone(), monitor);
		tracing::info!(peer = %address, peers = self.ctx.peers.len(), "scope.peer.up");
	}

	/// Drops a peer whose node has restarted its actor under a new address.
	async fn retire(&mut self, old: ActorAddress, monitor: MonitorRef) -> Result<(), HandlerError> {
		tracing::info!(peer = %old, "scope.peer.superseded");
		self.ctx.cluster().demonitor(monitor);
		self.ctx.peers.remove_if_current(&old);
		self.handler.purge_local_data_for_node(&old.node, &mut self.ctx).await
	}

	/// Returns whether the `AckSync` was handed to a live peer.
	async fn send_ack_sync(&mut self, to: &ActorAddress) -> bool {
		let data = self.handler.local_data(&self.ctx);
		let message = WireOf::<H>::AckSync {
			from: self.ctx.address().clone(),
			data,
		};
		let frame = match wire::encode(&message) {
			Ok(frame) => frame,
			Err(err) => {
				tracing::warn!(%err, "scope.ack_sync.encode_failed");
				return false;
			}
		};
		match self.ctx.cluster().send_on(Lane::Control, to, frame).await {
			Ok(()) => true,
			Err(err) => {
				tracing::debug!(to = %to, %err, "scope.ack_sync.dropped");
				false
			}
		}
	}

	async fn discover(&mut self, node: &NodeId) {
		if node == self.ctx.local_node() {
			return;
		}
		let message = WireOf::<H>::Discover {
			from: self.ctx.address().clone(),
		};
		let frame = match wire::encode(&message) {
			Ok(frame) => frame,
			Err(err) => {
				tracing::warn!(%err, "scope.discover.encode_failed");
				return;
			}
		};
		if let Err(err) = self.ctx.cluster().send_named_on(Lane::Control, node, self.ctx.identity(), frame).await {
			tracing::debug!(node = %node, %err, "scope.discover.dropped");
		}
	}

	async fn discover_visible(&mut self) {
		let nodes = self.ctx.cluster().visible_nodes();
		tracing::debug!(nodes = nodes.len(), "scope.discover.visible");
		for node in &nodes {
			self.discover(node).await;
		}
	}

	async fn terminate(self, exit: Exit) {
		let ScopeActor { mut ctx, inbox, .. } = self;
		match &exit {
			Exit::HandlerFailed(err) => tracing::error!(%err, "scope.actor.failed"),
			other => tracing::info!(reason = other.as_str(), "scope.actor.exit"),
		}

		ctx.relay.terminate().await;
		let cluster = Arc::clone(ctx.cluster());
		for peer in ctx.peers.drain() {
			cluster.demonitor(peer.monitor);
		}
		cluster.registry().unregister_actor(ctx.identity(), ctx.address());
		drop(inbox);

		if let Exit::Stopped(Some(reply)) = exit {
			let _ = reply.send(());
		}
	}
}
