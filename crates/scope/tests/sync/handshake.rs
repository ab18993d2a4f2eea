//! Discovery and the Discover / AckSync handshake.

use murmur_scope::wire::ScopeWire;
use murmur_scope::{Cluster, Lane, LocalFabric};

use crate::common::*;

#[tokio::test]
async fn three_nodes_converge() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a", "b", "c"]);
	start_all(&runtimes).await;

	converged(&runtimes).await;
	assert_eq!(subcluster(&runtimes[0]).await, nodes(&["b", "c"]));
}

#[tokio::test]
async fn late_joiner_is_discovered() {
	init_tracing();
	let fabric = LocalFabric::new();
	let early = runtimes(&fabric, &["a", "b"]);
	start_all(&early).await;
	converged(&early).await;

	let late = runtimes(&fabric, &["c"]);
	start_all(&late).await;

	let all: Vec<_> = early.into_iter().chain(late).collect();
	converged(&all).await;
}

#[tokio::test]
async fn nodes_running_another_scope_are_not_peers() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a", "b", "c"]);
	runtimes[0].start::<Names>(SCOPE).await.unwrap();
	runtimes[1].start::<Names>(SCOPE).await.unwrap();
	runtimes[2].start::<Names>("elsewhere").await.unwrap();

	converged(&runtimes[..2]).await;
	tokio::time::sleep(std::time::Duration::from_millis(50)).await;
	assert_eq!(subcluster(&runtimes[0]).await, nodes(&["b"]));
}

#[tokio::test]
async fn repeated_discover_gets_an_ack_each_time_but_one_monitor() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a"]);
	let a = &runtimes[0];
	let target = a.start::<Names>(SCOPE).await.unwrap();
	let b = fabric.join("b");
	let mut fake = b.open_inbox(16);
	let fake_address = fake.address().clone();

	for _ in 0..3 {
		send_from(&*b, &target, &ScopeWire::Discover { from: fake_address.clone() }).await;
		match next_message(&mut fake).await {
			ScopeWire::AckSync { from, data } => {
				assert_eq!(from, target);
				assert_eq!(data, Some(Vec::new()));
			}
			other => panic!("expected ack sync, got {other:?}"),
		}
	}

	assert_eq!(fabric.monitor_count(&fake_address), 1);
	assert_eq!(subcluster(a).await, nodes(&["b"]));
	assert_eq!(b.visible_nodes(), nodes(&["a"]));
}

#[tokio::test]
async fn discover_into_a_full_inbox_still_completes() {
	init_tracing();
	let fabric = LocalFabric::new();
	let a = runtime_with_inbox(&fabric, "a", 2);
	let target = a.start::<Names>(SCOPE).await.unwrap();
	let b = fabric.join("b");
	let mut fake = b.open_inbox(16);

	make_busy(&*b, &target, 200, 2).await;
	b.send_on(Lane::Control, &target, frame(&ScopeWire::Discover { from: fake.address().clone() }))
		.await
		.expect("control lane ignores capacity");

	assert!(matches!(next_message(&mut fake).await, ScopeWire::AckSync { .. }));
	eventually("b admitted", || async { subcluster(&a).await == nodes(&["b"]) }).await;
	assert_eq!(fabric.monitor_count(fake.address()), 1);
}

#[tokio::test]
async fn peer_that_cannot_be_acked_is_not_admitted() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a"]);
	let a = &runtimes[0];
	let target = a.start::<Names>(SCOPE).await.unwrap();
	let b = fabric.join("b");
	let fake = b.open_inbox(16);
	let gone = fake.address().clone();

	make_busy(&*b, &target, 100, 0).await;
	send_from(&*b, &target, &ScopeWire::Discover { from: gone.clone() }).await;
	drop(fake);

	// Stats queues behind the Discover, so the reply means it was handled.
	let stats = stats(a).await;
	assert!(stats.purges.is_empty());
	assert!(subcluster(a).await.is_empty());
	assert_eq!(fabric.monitor_count(&gone), 0);
}

#[tokio::test]
async fn ack_sync_from_a_known_peer_is_not_answered() {
	init_tracing();
	let fabric = LocalFabric::new();
	let runtimes = runtimes(&fabric, &["a"]);
	let a = &runtimes[0];
	let target = a.start::<Names>(SCOPE).await.unwrap();
	let b = fabric.join("b");
	let mut fake = b.open_inbox(16);
	let fake_address = fake.address().clone();
	let record = NameRecord {
		name: "remote".into(),
		node: node("b"),
		value: 1,
	};

	let ack = ScopeWire::AckSync {
		from: fake_address.clone(),
		data: Some(vec![record.clone()]),
	};
	send_from(&*b, &target, &ack).await;
	assert!(matches!(next_message(&mut fake).await, ScopeWire::AckSync { from, .. } if from == target));

	send_from(&*b, &target, &ack).await;
	assert_quiet(&mut fake).await;

	let stats = stats(a).await;
	assert_eq!(stats.saves, 2);
	assert_eq!(fabric.monitor_count(&fake_address), 1);
	assert_eq!(lookup(a, "remote").await, Some(record));
}

#[tokio::test]
async fn own_node_is_never_a_peer() {
	init_tracing();
	let fabric = LocalFabric::new();
	let node_a = fabric.join("a");
	let a = murmur_scope::ScopeRuntime::new(node_a.clone(), config());
	let target = a.start::<Names>(SCOPE).await.unwrap();
	let mut local_fake = node_a.open_inbox(4);

	send_from(&*node_a, &target, &ScopeWire::Discover { from: local_fake.address().clone() }).await;
	assert_quiet(&mut local_fake).await;
	assert!(subcluster(&a).await.is_empty());
}

#[tokio::test]
async fn malformed_frames_are_dropped() {
	init_tracing();
	let fabric = LocalFabric::new();
	let node_a = fabric.join("a");
	let a = murmur_scope::ScopeRuntime::new(node_a.clone(), config());
	let target = a.start::<Names>(SCOPE).await.unwrap();

	node_a.send(&target, bytes::Bytes::from_static(&[0xff, 0x00, 0x01])).await.unwrap();
	node_a.send(&target, bytes::Bytes::new()).await.unwrap();

	assert_eq!(stats(&a).await, NamesStats::default());
}
