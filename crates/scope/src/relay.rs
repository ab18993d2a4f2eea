//! Per-scope multicast relay.
//!
//! The relay takes one encoded frame plus a snapshot of the peer set and
//! sends it to every peer outside the exclusion list, so the owning actor
//! never waits on a fan-out. Send failures are logged and skipped.

use std::sync::Arc;

use bytes::Bytes;
use murmur_worker::{Mailbox, MailboxPolicy, MailboxReceiver, MailboxSender, TaskClass};
use tokio::task::JoinHandle;

use crate::cluster::Cluster;
use crate::types::{ActorAddress, NodeId, ScopeIdentity};

pub(crate) enum RelayCmd {
	Broadcast {
		frame: Bytes,
		excluded: Vec<NodeId>,
		peers: Vec<(NodeId, ActorAddress)>,
	},
	Terminate,
}

/// Sending side of a relay. The relay stops when every handle is dropped.
#[derive(Clone)]
pub(crate) struct RelayHandle {
	tx: MailboxSender<RelayCmd>,
}

impl RelayHandle {
	pub fn start(identity: ScopeIdentity, cluster: Arc<dyn Cluster>, capacity: usize) -> (Self, JoinHandle<()>) {
		let (tx, rx) = Mailbox::bounded(capacity, MailboxPolicy::Backpressure);
		let task = murmur_worker::spawn(TaskClass::Relay, run(identity, cluster, rx));
		(Self { tx }, task)
	}

	pub async fn broadcast(&self, frame: Bytes, excluded: Vec<NodeId>, peers: Vec<(NodeId, ActorAddress)>) {
		if peers.is_empty() {
			return;
		}
		if self.tx.send(RelayCmd::Broadcast { frame, excluded, peers }).await.is_err() {
			tracing::debug!("relay.closed");
		}
	}

	pub async fn terminate(&self) {
		let _ = self.tx.send(RelayCmd::Terminate).await;
	}
}

async fn run(identity: ScopeIdentity, cluster: Arc<dyn Cluster>, mut rx: MailboxReceiver<RelayCmd>) {
	tracing::debug!(scope = %identity, "relay.start");
	while let Some(cmd) = rx.recv().await {
		match cmd {
			RelayCmd::Broadcast { frame, excluded, peers } => {
				let mut sent = 0usize;
				for (node, address) in peers {
					if excluded.contains(&node) {
						continue;
					}
					match cluster.send(&address, frame.clone()).await {
						Ok(()) => sent += 1,
						Err(err) => tracing::debug!(scope = %identity, to = %address, %err, "relay.send.failed"),
					}
				}
				tracing::trace!(scope = %identity, sent, "relay.broadcast");
			}
			RelayCmd::Terminate => break,
		}
	}
	tracing::debug!(scope = %identity, "relay.stop");
}
