//! Peer removal: exits, stale downs, partitions and restarts.

use std::time::Duration;

use murmur_scope::wire::ScopeWire;
use murmur_scope::{Cluster, Delivery, DownReason, LocalFabric, MonitorRef, SendError};

use crate::common::*;

#[tokio::test]
async fn peer_exit_removes_it_and_purges_once() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a"]);
	let a = &runtimes[0];
	let target = a.start::<Names>(SCOPE).await.unwrap();
	let b = fabric.join("b");
	let mut fake = b.open_inbox(16);

	send_from(&*b, &target, &ScopeWire::Discover { from: fake.address().clone() }).await;
	let _ack = next_message(&mut fake).await;
	assert_eq!(subcluster(a).await, nodes(&["b"]));

	drop(fake);
	eventually("peer removed", || async { subcluster(a).await.is_empty() }).await;
	tokio::time::sleep(Duration::from_millis(20)).await;
	let stats = stats(a).await;
	assert_eq!(stats.purges, nodes(&["b"]));
	assert_eq!(stats.stale_downs, 0);
}

#[tokio::test]
async fn peer_exit_is_seen_through_a_full_inbox() {
	init_tracing();
	let fabric = LocalFabric::new();
	let a = runtime_with_inbox(&fabric, "a", 2);
	let target = a.start::<Names>(SCOPE).await.unwrap();
	let b = fabric.join("b");
	let mut fake = b.open_inbox(16);
	let fake_address = fake.address().clone();

	send_from(&*b, &target, &ScopeWire::Discover { from: fake_address.clone() }).await;
	let _ack = next_message(&mut fake).await;
	assert_eq!(subcluster(&a).await, nodes(&["b"]));

	make_busy(&*b, &target, 300, 2).await;
	let overflow = b.send(&target, frame(&ScopeWire::Cast(NamesCast::Poke))).await;
	assert_eq!(overflow, Err(SendError::MailboxFull));

	drop(fake);
	eventually("peer removed after nap", || async { subcluster(&a).await.is_empty() }).await;
	let stats = stats(&a).await;
	assert_eq!(stats.purges, nodes(&["b"]));
	assert_eq!(stats.casts, 2);
	assert_eq!(fabric.monitor_count(&fake_address), 0);
}

#[tokio::test]
async fn restart_on_same_node_supersedes_and_stale_down_reaches_handler() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a"]);
	let a = &runtimes[0];
	let target = a.start::<Names>(SCOPE).await.unwrap();
	let b = fabric.join("b");
	let mut first = b.open_inbox(16);
	let mut second = b.open_inbox(16);
	let first_address = first.address().clone();
	let second_address = second.address().clone();

	send_from(&*b, &target, &ScopeWire::Discover { from: first_address.clone() }).await;
	let _ = next_message(&mut first).await;
	send_from(&*b, &target, &ScopeWire::Discover { from: second_address.clone() }).await;
	let _ = next_message(&mut second).await;

	let peers = a.peers(&identity()).await.unwrap();
	assert_eq!(peers, vec![(node("b"), second_address.clone())]);
	assert_eq!(fabric.monitor_count(&first_address), 0);
	assert_eq!(fabric.monitor_count(&second_address), 1);

	fabric
		.inject(
			&target,
			Delivery::Down {
				monitor: MonitorRef::new(u64::MAX),
				address: first_address,
				reason: DownReason::Exited,
			},
		)
		.unwrap();

	eventually("stale down forwarded", || async { stats(a).await.stale_downs == 1 }).await;
	assert_eq!(subcluster(a).await, nodes(&["b"]));
	assert_eq!(stats(a).await.purges, nodes(&["b"]), "only the supersede purges");
	assert_eq!(fabric.monitor_count(&second_address), 1);
}

#[tokio::test]
async fn ack_sync_from_new_address_replaces_old_peer() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a"]);
	let a = &runtimes[0];
	let target = a.start::<Names>(SCOPE).await.unwrap();
	let b = fabric.join("b");
	let mut first = b.open_inbox(16);
	let mut second = b.open_inbox(16);

	send_from(&*b, &target, &ScopeWire::Discover { from: first.address().clone() }).await;
	let _ = next_message(&mut first).await;

	let record = NameRecord {
		name: "fresh".into(),
		node: node("b"),
		value: 2,
	};
	send_from(
		&*b,
		&target,
		&ScopeWire::AckSync {
			from: second.address().clone(),
			data: Some(vec![record.clone()]),
		},
	)
	.await;
	assert!(matches!(next_message(&mut second).await, ScopeWire::AckSync { .. }));

	let peers = a.peers(&identity()).await.unwrap();
	assert_eq!(peers, vec![(node("b"), second.address().clone())]);
	assert_eq!(stats(a).await.purges, nodes(&["b"]));
	// Purge of the old address ran before the new snapshot was saved.
	assert_eq!(lookup(a, "fresh").await, Some(record));
	assert_eq!(fabric.monitor_count(first.address()), 0);
}

#[tokio::test]
async fn partition_splits_and_heal_reconverges() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a", "b", "c"]);
	start_all(&runtimes).await;
	converged(&runtimes).await;

	fabric.disconnect(&node("a"), &node("b"));
	eventually("a drops b", || async { subcluster(&runtimes[0]).await == nodes(&["c"]) }).await;
	eventually("b drops a", || async { subcluster(&runtimes[1]).await == nodes(&["c"]) }).await;
	assert_eq!(subcluster(&runtimes[2]).await, nodes(&["a", "b"]));
	assert_eq!(stats(&runtimes[0]).await.purges, nodes(&["b"]));

	fabric.connect(&node("a"), &node("b"));
	converged(&runtimes).await;
}

#[tokio::test]
async fn stopped_peer_is_purged_and_restart_is_rediscovered() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a", "b"]);
	start_all(&runtimes).await;
	converged(&runtimes).await;
	let before = runtimes[0].peers(&identity()).await.unwrap();

	runtimes[1].stop(&identity()).await.unwrap();
	eventually("a drops stopped b", || async { subcluster(&runtimes[0]).await.is_empty() }).await;

	runtimes[1].start::<Names>(SCOPE).await.unwrap();
	converged(&runtimes).await;
	let after = runtimes[0].peers(&identity()).await.unwrap();
	assert_eq!(after.len(), 1);
	assert_ne!(after, before, "restarted actor has a new address");
	assert_eq!(stats(&runtimes[0]).await.purges, nodes(&["b"]));
}

#[tokio::test]
async fn departed_node_data_is_purged() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a", "b"]);
	start_all(&runtimes).await;
	converged(&runtimes).await;

	let reply = runtimes[1]
		.call::<Names>(SCOPE, NamesRequest::Register { name: "bob".into(), value: 3 })
		.await
		.unwrap();
	assert_eq!(reply, NamesReply::Registered);
	eventually("a learns bob", || async { lookup(&runtimes[0], "bob").await.is_some() }).await;

	fabric.leave(&node("b"));
	eventually("a forgets bob", || async { lookup(&runtimes[0], "bob").await.is_none() }).await;
	assert!(subcluster(&runtimes[0]).await.is_empty());
}
