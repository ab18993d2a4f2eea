//! Shared handlers and helpers for scope integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use murmur_scope::wire::{self, ScopeWire, WireOf};
use murmur_scope::{
	ActorFlow, CallFlow, Cluster, Delivery, HandlerError, Inbox, LocalFabric, NodeId, ReplyTo, ScopeConfig, ScopeContext, ScopeHandler, ScopeIdentity,
	ScopeInfo, ScopeRuntime,
};
use serde::{Deserialize, Serialize};

pub const SCOPE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
	pub name: String,
	pub node: NodeId,
	pub value: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NamesRequest {
	Register { name: String, value: u64 },
	Lookup(String),
	Stats,
	/// Parks the caller until `Release`.
	Deferred,
	Release,
	Fail,
	StopNow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamesReply {
	Registered,
	Found(Option<NameRecord>),
	Stats(NamesStats),
	Later(u64),
	Released(usize),
	Stopping,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamesStats {
	pub saves: u64,
	pub purges: Vec<NodeId>,
	pub stale_downs: u64,
	pub pings: Vec<(NodeId, u64)>,
	pub casts: u64,
	pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NamesCast {
	Poke,
	/// Keeps the actor busy so its inbox can be filled.
	Nap(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NamesInfo {
	Ping { from: NodeId, seq: u64 },
	Registered(NameRecord),
}

/// Small replicated name registry backed by the scope's `registry_by_name` table.
#[derive(Default)]
pub struct Names {
	stats: NamesStats,
	parked: Vec<ReplyTo>,
}

impl Names {
	fn store(ctx: &ScopeContext<Self>, record: &NameRecord) -> Result<(), HandlerError> {
		ctx.tables().registry_by_name.put(&record.name, record)?;
		Ok(())
	}
}

#[async_trait]
impl ScopeHandler for Names {
	const KIND: &'static str = "names";

	type Snapshot = Vec<NameRecord>;
	type Request = NamesRequest;
	type Reply = NamesReply;
	type Cast = NamesCast;
	type Info = NamesInfo;

	async fn init(_ctx: &mut ScopeContext<Self>) -> Result<Self, HandlerError> {
		Ok(Self::default())
	}

	async fn handle_call(&mut self, request: NamesRequest, from: &ReplyTo, ctx: &mut ScopeContext<Self>) -> Result<CallFlow<NamesReply>, HandlerError> {
		match request {
			NamesRequest::Register { name, value } => {
				let record = NameRecord {
					name,
					node: ctx.local_node().clone(),
					value,
				};
				Self::store(ctx, &record)?;
				ctx.broadcast(NamesInfo::Registered(record), &[]).await?;
				Ok(CallFlow::Reply(NamesReply::Registered))
			}
			NamesRequest::Lookup(name) => Ok(CallFlow::Reply(NamesReply::Found(ctx.tables().registry_by_name.fetch(&name)?))),
			NamesRequest::Stats => {
				let mut stats = self.stats.clone();
				stats.records = ctx.tables().registry_by_name.len();
				Ok(CallFlow::Reply(NamesReply::Stats(stats)))
			}
			NamesRequest::Deferred => {
				self.parked.push(from.clone());
				Ok(CallFlow::NoReply)
			}
			NamesRequest::Release => {
				let parked = std::mem::take(&mut self.parked);
				let count = parked.len();
				for (i, to) in parked.iter().enumerate() {
					ctx.reply(to, NamesReply::Later(i as u64 + 1)).await?;
				}
				Ok(CallFlow::Reply(NamesReply::Released(count)))
			}
			NamesRequest::Fail => Err(HandlerError::new("asked to fail")),
			NamesRequest::StopNow => Ok(CallFlow::Stop(Some(NamesReply::Stopping))),
		}
	}

	async fn handle_cast(&mut self, cast: NamesCast, _ctx: &mut ScopeContext<Self>) -> Result<ActorFlow, HandlerError> {
		match cast {
			NamesCast::Poke => self.stats.casts += 1,
			NamesCast::Nap(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
		}
		Ok(ActorFlow::Continue)
	}

	async fn handle_info(&mut self, info: ScopeInfo<NamesInfo>, ctx: &mut ScopeContext<Self>) -> Result<ActorFlow, HandlerError> {
		match info {
			ScopeInfo::Message(NamesInfo::Ping { from, seq }) => self.stats.pings.push((from, seq)),
			ScopeInfo::Message(NamesInfo::Registered(record)) => Self::store(ctx, &record)?,
			ScopeInfo::Down { .. } => self.stats.stale_downs += 1,
		}
		Ok(ActorFlow::Continue)
	}

	fn local_data(&self, ctx: &ScopeContext<Self>) -> Option<Vec<NameRecord>> {
		let local = ctx.local_node();
		let records: Vec<NameRecord> = ctx
			.tables()
			.registry_by_name
			.entries::<String, NameRecord>()
			.ok()?
			.into_iter()
			.map(|(_, record)| record)
			.filter(|record| &record.node == local)
			.collect();
		Some(records)
	}

	async fn save_remote_data(&mut self, data: Vec<NameRecord>, ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError> {
		self.stats.saves += 1;
		for record in &data {
			Self::store(ctx, record)?;
		}
		Ok(())
	}

	async fn purge_local_data_for_node(&mut self, node: &NodeId, ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError> {
		self.stats.purges.push(node.clone());
		ctx.tables().registry_by_name.retain(|_: &String, record: &NameRecord| &record.node != node);
		Ok(())
	}
}

/// Handler whose `init` always fails.
pub struct Refuser;

#[async_trait]
impl ScopeHandler for Refuser {
	const KIND: &'static str = "refuser";

	type Snapshot = ();
	type Request = ();
	type Reply = ();
	type Cast = ();
	type Info = ();

	async fn init(_ctx: &mut ScopeContext<Self>) -> Result<Self, HandlerError> {
		Err(HandlerError::new("not today"))
	}

	async fn handle_call(&mut self, _request: (), _from: &ReplyTo, _ctx: &mut ScopeContext<Self>) -> Result<CallFlow<()>, HandlerError> {
		Ok(CallFlow::Reply(()))
	}

	fn local_data(&self, _ctx: &ScopeContext<Self>) -> Option<()> {
		None
	}

	async fn save_remote_data(&mut self, _data: (), _ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError> {
		Ok(())
	}

	async fn purge_local_data_for_node(&mut self, _node: &NodeId, _ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError> {
		Ok(())
	}
}

/// Stateless handler that echoes requests, used next to [`Names`] in one scope.
pub struct Echo;

#[async_trait]
impl ScopeHandler for Echo {
	const KIND: &'static str = "echo";
	const LOG_NAME: &'static str = "echo_handler";

	type Snapshot = ();
	type Request = String;
	type Reply = String;
	type Cast = ();
	type Info = ();

	async fn init(_ctx: &mut ScopeContext<Self>) -> Result<Self, HandlerError> {
		Ok(Self)
	}

	async fn handle_call(&mut self, request: String, _from: &ReplyTo, _ctx: &mut ScopeContext<Self>) -> Result<CallFlow<String>, HandlerError> {
		Ok(CallFlow::Reply(request))
	}

	fn local_data(&self, _ctx: &ScopeContext<Self>) -> Option<()> {
		None
	}

	async fn save_remote_data(&mut self, _data: (), _ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError> {
		Ok(())
	}

	async fn purge_local_data_for_node(&mut self, _node: &NodeId, _ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError> {
		Ok(())
	}
}

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt::try_init();
}

pub fn config() -> ScopeConfig {
	ScopeConfig {
		call_timeout_ms: 1_000,
		..ScopeConfig::default()
	}
}

pub fn node(name: &str) -> NodeId {
	NodeId::new(name)
}

pub fn nodes(names: &[&str]) -> Vec<NodeId> {
	names.iter().map(|name| node(name)).collect()
}

pub fn identity() -> ScopeIdentity {
	ScopeIdentity::of::<Names>(SCOPE)
}

/// Joins one fabric node per name and wraps each in a runtime.
pub fn runtimes(fabric: &LocalFabric, names: &[&str]) -> Vec<ScopeRuntime> {
	names.iter().map(|name| ScopeRuntime::new(fabric.join(*name), config())).collect()
}

/// Starts [`Names`] in [`SCOPE`] on every runtime.
pub async fn start_all(runtimes: &[ScopeRuntime]) {
	for runtime in runtimes {
		runtime.start::<Names>(SCOPE).await.expect("start names");
	}
}

pub async fn subcluster(runtime: &ScopeRuntime) -> Vec<NodeId> {
	runtime.subcluster_nodes(&identity()).await.expect("subcluster nodes")
}

pub async fn stats(runtime: &ScopeRuntime) -> NamesStats {
	match runtime.call::<Names>(SCOPE, NamesRequest::Stats).await.expect("stats call") {
		NamesReply::Stats(stats) => stats,
		other => panic!("unexpected reply {other:?}"),
	}
}

pub async fn lookup(runtime: &ScopeRuntime, name: &str) -> Option<NameRecord> {
	match runtime.call::<Names>(SCOPE, NamesRequest::Lookup(name.into())).await.expect("lookup call") {
		NamesReply::Found(record) => record,
		other => panic!("unexpected reply {other:?}"),
	}
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = Instant::now() + Duration::from_secs(5);
	loop {
		if check().await {
			return;
		}
		assert!(Instant::now() < deadline, "condition not met within 5s: {what}");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

/// Waits until every runtime sees exactly the other runtimes as peers.
pub async fn converged(runtimes: &[ScopeRuntime]) {
	for runtime in runtimes {
		let mut expected: Vec<NodeId> = runtimes.iter().map(ScopeRuntime::local_node).filter(|n| *n != runtime.local_node()).collect();
		expected.sort_unstable();
		eventually(&format!("{} converges", runtime.local_node()), || {
			let expected = expected.clone();
			async move { subcluster(runtime).await == expected }
		})
		.await;
	}
}

pub fn frame(message: &WireOf<Names>) -> Bytes {
	wire::encode(message).expect("encode frame")
}

pub async fn next_delivery(inbox: &mut Inbox) -> Delivery {
	tokio::time::timeout(Duration::from_secs(1), inbox.recv())
		.await
		.expect("delivery within 1s")
		.expect("inbox open")
}

pub async fn next_message(inbox: &mut Inbox) -> WireOf<Names> {
	match next_delivery(inbox).await {
		Delivery::Frame(frame) => wire::decode(&frame).expect("decode frame"),
		other => panic!("expected frame, got {other:?}"),
	}
}

/// Asserts nothing arrives for a short while.
pub async fn assert_quiet(inbox: &mut Inbox) {
	let got = tokio::time::timeout(Duration::from_millis(100), inbox.recv()).await;
	assert!(got.is_err(), "unexpected delivery: {got:?}");
}

/// Runtime on a fresh node whose actors have an inbox of `capacity` frames.
pub fn runtime_with_inbox(fabric: &LocalFabric, name: &str, capacity: usize) -> ScopeRuntime {
	let config = ScopeConfig {
		inbox_capacity: capacity,
		..config()
	};
	ScopeRuntime::new(fabric.join(name), config)
}

/// Parks the [`Names`] actor at `target` for `ms` and fills the rest of its
/// inbox with `fill` pokes.
pub async fn make_busy(sender: &dyn Cluster, target: &murmur_scope::ActorAddress, ms: u64, fill: usize) {
	send_from(sender, target, &ScopeWire::Cast(NamesCast::Nap(ms))).await;
	tokio::time::sleep(Duration::from_millis(30)).await;
	for _ in 0..fill {
		send_from(sender, target, &ScopeWire::Cast(NamesCast::Poke)).await;
	}
}

/// Sends a raw frame from a fake process to the [`Names`] actor on `target`.
pub async fn send_from(sender: &dyn Cluster, target: &murmur_scope::ActorAddress, message: &WireOf<Names>) {
	sender.send(target, frame(message)).await.expect("fake peer send");
}
