//! In-process cluster fabric.
//!
//! Every joined node gets its own [`Registry`], process table and membership
//! channel. Links between nodes can be cut and restored to simulate
//! partitions; cutting a link fires `NoConnection` downs for every monitor
//! spanning it, and sends across a missing link fail with
//! [`SendError::NoConnection`].
//!
//! Downs and [`Lane::Control`] frames bypass inbox capacity. Only
//! [`Lane::Data`] frames can be refused by a full inbox.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use murmur_worker::{Clock, Mailbox, MailboxPolicy, MailboxSendError, MailboxSender};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;

use super::{Cluster, Delivery, DownReason, Inbox, Lane, MembershipEvent};
use crate::error::SendError;
use crate::registry::Registry;
use crate::types::{ActorAddress, MonitorRef, NodeId, Pid, ScopeIdentity};

const MEMBERSHIP_CAPACITY: usize = 256;

struct NodeSlot {
	id: NodeId,
	registry: Arc<Registry>,
	processes: RwLock<FxHashMap<Pid, MailboxSender<Delivery>>>,
	membership: broadcast::Sender<MembershipEvent>,
}

impl NodeSlot {
	fn emit(&self, event: MembershipEvent) {
		// No subscribers is fine.
		let _ = self.membership.send(event);
	}
}

#[derive(Debug, Clone)]
struct MonitorEntry {
	watcher: ActorAddress,
	target: ActorAddress,
}

#[derive(Default)]
struct Fabric {
	nodes: RwLock<FxHashMap<NodeId, Arc<NodeSlot>>>,
	links: RwLock<FxHashSet<(NodeId, NodeId)>>,
	monitors: Mutex<FxHashMap<MonitorRef, MonitorEntry>>,
	monitor_ids: Clock,
	// Fabric-wide so a rejoined node never reuses a pid of its previous life.
	pids: Clock,
}

fn link_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
	if a <= b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) }
}

impl Fabric {
	fn slot(&self, node: &NodeId) -> Option<Arc<NodeSlot>> {
		self.nodes.read().get(node).cloned()
	}

	fn connected(&self, a: &NodeId, b: &NodeId) -> bool {
		a == b || self.links.read().contains(&link_key(a, b))
	}

	fn is_alive(&self, address: &ActorAddress) -> bool {
		self.slot(&address.node).is_some_and(|slot| slot.processes.read().contains_key(&address.pid))
	}

	fn deliver(&self, lane: Lane, to: &ActorAddress, delivery: Delivery) -> Result<(), SendError> {
		let sender = self
			.slot(&to.node)
			.and_then(|slot| slot.processes.read().get(&to.pid).cloned())
			.ok_or(SendError::NoProcess)?;
		let sent = match lane {
			Lane::Data => sender.try_send(delivery),
			Lane::Control => sender.force_send(delivery),
		};
		match sent {
			Ok(_) => Ok(()),
			Err(MailboxSendError::Closed) => Err(SendError::NoProcess),
			Err(MailboxSendError::Full) => {
				tracing::warn!(to = %to, "fabric.inbox.full");
				Err(SendError::MailboxFull)
			}
		}
	}

	fn route(&self, lane: Lane, from: &NodeId, to: &ActorAddress, delivery: Delivery) -> Result<(), SendError> {
		if !self.connected(from, &to.node) {
			return Err(SendError::NoConnection);
		}
		self.deliver(lane, to, delivery)
	}

	fn fire(&self, fired: Vec<(MonitorRef, MonitorEntry)>, reason: DownReason) {
		for (monitor, entry) in fired {
			let down = Delivery::Down {
				monitor,
				address: entry.target,
				reason,
			};
			if let Err(err) = self.deliver(Lane::Control, &entry.watcher, down) {
				tracing::trace!(watcher = %entry.watcher, %err, "fabric.down.undeliverable");
			}
		}
	}

	fn process_exited(&self, address: &ActorAddress) {
		let Some(slot) = self.slot(&address.node) else {
			return;
		};
		if slot.processes.write().remove(&address.pid).is_none() {
			return;
		}

		let mut fired = {
			let mut monitors = self.monitors.lock();
			let mut fired = Vec::new();
			monitors.retain(|monitor, entry| {
				if entry.target == *address {
					fired.push((*monitor, entry.clone()));
					return false;
				}
				entry.watcher != *address
			});
			fired
		};
		fired.retain(|(_, entry)| self.connected(&entry.watcher.node, &address.node));
		tracing::trace!(address = %address, downs = fired.len(), "fabric.process.exit");
		self.fire(fired, DownReason::Exited);
	}

	fn sever(&self, a: &NodeId, b: &NodeId) -> bool {
		if a == b || !self.links.write().remove(&link_key(a, b)) {
			return false;
		}

		let fired = {
			let mut monitors = self.monitors.lock();
			let mut fired = Vec::new();
			monitors.retain(|monitor, entry| {
				let spans = (entry.watcher.node == *a && entry.target.node == *b) || (entry.watcher.node == *b && entry.target.node == *a);
				if spans {
					fired.push((*monitor, entry.clone()));
				}
				!spans
			});
			fired
		};
		self.fire(fired, DownReason::NoConnection);

		for (local, remote) in [(a, b), (b, a)] {
			if let Some(slot) = self.slot(local) {
				slot.emit(MembershipEvent::NodeDown(remote.clone()));
			}
		}
		tracing::info!(a = %a, b = %b, "fabric.link.down");
		true
	}

	fn link(&self, a: &NodeId, b: &NodeId) -> bool {
		let (Some(slot_a), Some(slot_b)) = (self.slot(a), self.slot(b)) else {
			return false;
		};
		if a == b || !self.links.write().insert(link_key(a, b)) {
			return false;
		}
		slot_a.emit(MembershipEvent::NodeUp(b.clone()));
		slot_b.emit(MembershipEvent::NodeUp(a.clone()));
		tracing::info!(a = %a, b = %b, "fabric.link.up");
		true
	}
}

/// In-process cluster made of named nodes connected by links.
#[derive(Clone, Default)]
pub struct LocalFabric {
	inner: Arc<Fabric>,
}

impl std::fmt::Debug for LocalFabric {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LocalFabric").field("nodes", &self.nodes()).finish()
	}
}

impl LocalFabric {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a node linked to every current node. Joining an existing name
	/// returns that node.
	pub fn join(&self, name: impl Into<NodeId>) -> Arc<LocalNode> {
		let id = name.into();
		let (slot, peers) = {
			let mut nodes = self.inner.nodes.write();
			if let Some(slot) = nodes.get(&id) {
				return Arc::new(LocalNode {
					fabric: Arc::clone(&self.inner),
					slot: Arc::clone(slot),
				});
			}
			let (membership, _) = broadcast::channel(MEMBERSHIP_CAPACITY);
			let slot = Arc::new(NodeSlot {
				id: id.clone(),
				registry: Arc::new(Registry::new()),
				processes: RwLock::new(FxHashMap::default()),
				membership,
			});
			let peers: Vec<NodeId> = nodes.keys().cloned().collect();
			nodes.insert(id.clone(), Arc::clone(&slot));
			(slot, peers)
		};
		tracing::info!(node = %id, "fabric.node.join");
		for peer in &peers {
			self.inner.link(&id, peer);
		}
		Arc::new(LocalNode {
			fabric: Arc::clone(&self.inner),
			slot,
		})
	}

	/// Removes a node. Its links drop, firing `NoConnection` downs on the
	/// remaining nodes, and all of its processes are torn down.
	pub fn leave(&self, name: &NodeId) -> bool {
		let peers: Vec<NodeId> = self.inner.nodes.read().keys().filter(|n| *n != name).cloned().collect();
		for peer in &peers {
			self.inner.sever(name, peer);
		}
		let Some(slot) = self.inner.nodes.write().remove(name) else {
			return false;
		};
		let processes = std::mem::take(&mut *slot.processes.write());
		for sender in processes.values() {
			sender.close();
		}
		self.inner.monitors.lock().retain(|_, entry| entry.watcher.node != *name && entry.target.node != *name);
		tracing::info!(node = %name, processes = processes.len(), "fabric.node.leave");
		true
	}

	/// Cuts the link between two nodes.
	pub fn disconnect(&self, a: &NodeId, b: &NodeId) -> bool {
		self.inner.sever(a, b)
	}

	/// Restores the link between two nodes.
	pub fn connect(&self, a: &NodeId, b: &NodeId) -> bool {
		self.inner.link(a, b)
	}

	pub fn nodes(&self) -> Vec<NodeId> {
		let mut nodes: Vec<_> = self.inner.nodes.read().keys().cloned().collect();
		nodes.sort_unstable();
		nodes
	}

	pub fn node(&self, name: &NodeId) -> Option<Arc<LocalNode>> {
		self.inner.slot(name).map(|slot| {
			Arc::new(LocalNode {
				fabric: Arc::clone(&self.inner),
				slot,
			})
		})
	}

	/// Number of live monitors targeting `target`.
	pub fn monitor_count(&self, target: &ActorAddress) -> usize {
		self.inner.monitors.lock().values().filter(|entry| entry.target == *target).count()
	}

	/// Delivers directly into a process inbox, bypassing links and capacity.
	///
	/// Lets tests forge stale or duplicate notifications.
	pub fn inject(&self, to: &ActorAddress, delivery: Delivery) -> Result<(), SendError> {
		self.inner.deliver(Lane::Control, to, delivery)
	}
}

/// One node's view of a [`LocalFabric`].
pub struct LocalNode {
	fabric: Arc<Fabric>,
	slot: Arc<NodeSlot>,
}

impl std::fmt::Debug for LocalNode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LocalNode").field("id", &self.slot.id).finish()
	}
}

impl LocalNode {
	pub fn id(&self) -> &NodeId {
		&self.slot.id
	}

	/// Number of live processes on this node.
	pub fn process_count(&self) -> usize {
		self.slot.processes.read().len()
	}
}

#[async_trait]
impl Cluster for LocalNode {
	fn local_node(&self) -> NodeId {
		self.slot.id.clone()
	}

	fn visible_nodes(&self) -> Vec<NodeId> {
		let links = self.fabric.links.read();
		let mut nodes: Vec<NodeId> = links
			.iter()
			.filter_map(|(a, b)| {
				if *a == self.slot.id {
					Some(b.clone())
				} else if *b == self.slot.id {
					Some(a.clone())
				} else {
					None
				}
			})
			.collect();
		nodes.sort_unstable();
		nodes
	}

	fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
		self.slot.membership.subscribe()
	}

	fn registry(&self) -> Arc<Registry> {
		Arc::clone(&self.slot.registry)
	}

	fn open_inbox(&self, capacity: usize) -> Inbox {
		let pid = Pid::new(self.fabric.pids.next());
		let address = ActorAddress::new(self.slot.id.clone(), pid);
		let (tx, rx) = Mailbox::bounded(capacity, MailboxPolicy::Backpressure);
		self.slot.processes.write().insert(pid, tx);

		let fabric: Weak<Fabric> = Arc::downgrade(&self.fabric);
		Inbox::new(address, rx, move |address| {
			if let Some(fabric) = fabric.upgrade() {
				fabric.process_exited(address);
			}
		})
	}

	async fn send_on(&self, lane: Lane, to: &ActorAddress, frame: Bytes) -> Result<(), SendError> {
		self.fabric.route(lane, &self.slot.id, to, Delivery::Frame(frame))
	}

	async fn whereis(&self, node: &NodeId, identity: &ScopeIdentity) -> Result<Option<ActorAddress>, SendError> {
		if !self.fabric.connected(&self.slot.id, node) {
			return Err(SendError::NoConnection);
		}
		let slot = self.fabric.slot(node).ok_or(SendError::NoConnection)?;
		Ok(slot
			.registry
			.lookup_address(identity)
			.filter(|address| slot.processes.read().contains_key(&address.pid)))
	}

	fn monitor(&self, watcher: &ActorAddress, target: &ActorAddress) -> MonitorRef {
		let monitor = MonitorRef::new(self.fabric.monitor_ids.next());
		let immediate = {
			let mut monitors = self.fabric.monitors.lock();
			if !self.fabric.connected(&watcher.node, &target.node) {
				Some(DownReason::NoConnection)
			} else if !self.fabric.is_alive(target) {
				Some(DownReason::NoProcess)
			} else {
				monitors.insert(
					monitor,
					MonitorEntry {
						watcher: watcher.clone(),
						target: target.clone(),
					},
				);
				None
			}
		};
		if let Some(reason) = immediate {
			let entry = MonitorEntry {
				watcher: watcher.clone(),
				target: target.clone(),
			};
			self.fabric.fire(vec![(monitor, entry)], reason);
		}
		monitor
	}

	fn demonitor(&self, monitor: MonitorRef) {
		self.fabric.monitors.lock().remove(&monitor);
	}
}
