use rustc_hash::FxHashMap;

use crate::types::{ActorAddress, MonitorRef, NodeId};

/// A known peer actor and the monitor watching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Peer {
	pub address: ActorAddress,
	pub monitor: MonitorRef,
}

/// How an incoming address relates to the current peer set.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
	/// Same address already recorded.
	Known,
	/// No peer recorded for that node.
	New,
	/// The node is recorded with a different, older address.
	Superseded(Peer),
}

/// Peer actors keyed by node. At most one entry, and so one monitor, per node.
#[derive(Debug, Default)]
pub(crate) struct PeerTable {
	peers: FxHashMap<NodeId, Peer>,
}

impl PeerTable {
	pub fn classify(&self, address: &ActorAddress) -> Admission {
		match self.peers.get(&address.node) {
			None => Admission::New,
			Some(peer) if peer.address == *address => Admission::Known,
			Some(peer) => Admission::Superseded(peer.clone()),
		}
	}

	/// Records `address` for its node. Returns the entry it replaced.
	pub fn insert(&mut self, address: ActorAddress, monitor: MonitorRef) -> Option<Peer> {
		self.peers.insert(address.node.clone(), Peer { address, monitor })
	}

	/// Removes the node's entry only if it still records exactly `address`.
	pub fn remove_if_current(&mut self, address: &ActorAddress) -> Option<Peer> {
		if self.peers.get(&address.node).is_some_and(|peer| peer.address == *address) {
			self.peers.remove(&address.node)
		} else {
			None
		}
	}

	pub fn get(&self, node: &NodeId) -> Option<&Peer> {
		self.peers.get(node)
	}

	pub fn len(&self) -> usize {
		self.peers.len()
	}

	/// Peer nodes, sorted.
	pub fn nodes(&self) -> Vec<NodeId> {
		let mut nodes: Vec<_> = self.peers.keys().cloned().collect();
		nodes.sort_unstable();
		nodes
	}

	/// `(node, address)` pairs sorted by node, for handing to the relay.
	pub fn snapshot(&self) -> Vec<(NodeId, ActorAddress)> {
		let mut peers: Vec<_> = self.peers.iter().map(|(node, peer)| (node.clone(), peer.address.clone())).collect();
		peers.sort_unstable();
		peers
	}

	pub fn drain(&mut self) -> impl Iterator<Item = Peer> + '_ {
		self.peers.drain().map(|(_, peer)| peer)
	}
}
