//! Murmur simulator.
//!
//! Joins a handful of nodes on an in-process fabric, starts a counting scope
//! on each, and prints the subcluster every node sees. With `--partition` the
//! fabric is split in two and healed again.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context as _, bail};
use async_trait::async_trait;
use clap::Parser;
use murmur_scope::{
	ActorFlow, CallFlow, HandlerError, LocalFabric, NodeId, ReplyTo, ScopeConfig, ScopeContext, ScopeHandler, ScopeIdentity, ScopeInfo, ScopeRuntime,
};
use serde::{Deserialize, Serialize};
use tracing::info;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Simulator command line arguments.
#[derive(Parser, Debug)]
#[command(name = "murmur-sim")]
#[command(about = "Watch murmur scope actors discover each other")]
struct Args {
	/// Number of nodes to join
	#[arg(short, long, default_value_t = 3)]
	nodes: usize,

	/// Scope name to start on every node
	#[arg(short, long, default_value = "default")]
	scope: String,

	/// Split the fabric in two, then heal it
	#[arg(short, long)]
	partition: bool,

	/// TOML file with scope settings
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

/// Per-node counters, replicated through the scope.
#[derive(Default)]
struct Tally {
	counts: BTreeMap<NodeId, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TallyRequest {
	Bump(u64),
	Totals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TallyReply {
	Bumped(u64),
	Totals(BTreeMap<NodeId, u64>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Count {
	node: NodeId,
	value: u64,
}

#[async_trait]
impl ScopeHandler for Tally {
	const KIND: &'static str = "tally";

	type Snapshot = Count;
	type Request = TallyRequest;
	type Reply = TallyReply;
	type Cast = ();
	type Info = Count;

	async fn init(_ctx: &mut ScopeContext<Self>) -> Result<Self, HandlerError> {
		Ok(Self::default())
	}

	async fn handle_call(&mut self, request: TallyRequest, _from: &ReplyTo, ctx: &mut ScopeContext<Self>) -> Result<CallFlow<TallyReply>, HandlerError> {
		match request {
			TallyRequest::Bump(by) => {
				let node = ctx.local_node().clone();
				let value = self.counts.entry(node.clone()).or_default();
				*value += by;
				let value = *value;
				ctx.broadcast(Count { node, value }, &[]).await?;
				Ok(CallFlow::Reply(TallyReply::Bumped(value)))
			}
			TallyRequest::Totals => Ok(CallFlow::Reply(TallyReply::Totals(self.counts.clone()))),
		}
	}

	async fn handle_info(&mut self, info: ScopeInfo<Count>, _ctx: &mut ScopeContext<Self>) -> Result<ActorFlow, HandlerError> {
		if let ScopeInfo::Message(count) = info {
			self.counts.insert(count.node, count.value);
		}
		Ok(ActorFlow::Continue)
	}

	fn local_data(&self, ctx: &ScopeContext<Self>) -> Option<Count> {
		let node = ctx.local_node();
		self.counts.get(node).map(|value| Count { node: node.clone(), value: *value })
	}

	async fn save_remote_data(&mut self, data: Count, _ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError> {
		self.counts.insert(data.node, data.value);
		Ok(())
	}

	async fn purge_local_data_for_node(&mut self, node: &NodeId, _ctx: &mut ScopeContext<Self>) -> Result<(), HandlerError> {
		self.counts.remove(node);
		Ok(())
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	setup_tracing(args.verbose);

	if args.nodes == 0 {
		bail!("--nodes must be at least 1");
	}
	let config = match &args.config {
		Some(path) => ScopeConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
		None => ScopeConfig::default(),
	};
	config.validate()?;

	info!(nodes = args.nodes, scope = %args.scope, "starting murmur-sim");

	let fabric = LocalFabric::new();
	let runtimes: Vec<ScopeRuntime> = (0..args.nodes).map(|i| ScopeRuntime::new(fabric.join(format!("node-{i}")), config.clone())).collect();
	let identity = ScopeIdentity::of::<Tally>(args.scope.as_str());

	for runtime in &runtimes {
		runtime.start::<Tally>(args.scope.as_str()).await?;
	}
	let everyone: Vec<NodeId> = runtimes.iter().map(ScopeRuntime::local_node).collect();
	settle(&runtimes, &identity, |_| everyone.clone()).await?;
	report("converged", &runtimes, &identity).await?;

	for (i, runtime) in runtimes.iter().enumerate() {
		runtime.call::<Tally>(args.scope.as_str(), TallyRequest::Bump(i as u64 + 1)).await?;
	}
	let (replies, bad_nodes) = runtimes[0].multi_call::<Tally>(args.scope.as_str(), TallyRequest::Totals).await?;
	for (node, reply) in replies {
		if let TallyReply::Totals(totals) = reply {
			println!("{node} totals {totals:?}");
		}
	}
	if !bad_nodes.is_empty() {
		println!("no answer from {bad_nodes:?}");
	}

	if args.partition && args.nodes > 1 {
		let (left, right) = everyone.split_at(args.nodes / 2);
		for a in left {
			for b in right {
				fabric.disconnect(a, b);
			}
		}
		settle(&runtimes, &identity, |node| if left.contains(node) { left.to_vec() } else { right.to_vec() }).await?;
		report("partitioned", &runtimes, &identity).await?;

		for a in left {
			for b in right {
				fabric.connect(a, b);
			}
		}
		settle(&runtimes, &identity, |_| everyone.clone()).await?;
		report("healed", &runtimes, &identity).await?;
	}

	for runtime in &runtimes {
		runtime.shutdown();
	}
	Ok(())
}

/// Waits until every node's subcluster equals `expected(node)` minus itself.
async fn settle(runtimes: &[ScopeRuntime], identity: &ScopeIdentity, expected: impl Fn(&NodeId) -> Vec<NodeId>) -> anyhow::Result<()> {
	let deadline = Instant::now() + SETTLE_TIMEOUT;
	for runtime in runtimes {
		let node = runtime.local_node();
		let mut want: Vec<NodeId> = expected(&node).into_iter().filter(|peer| *peer != node).collect();
		want.sort_unstable();
		while runtime.subcluster_nodes(identity).await? != want {
			if Instant::now() >= deadline {
				bail!("{node} did not settle on {want:?} within {SETTLE_TIMEOUT:?}");
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	}
	Ok(())
}

async fn report(stage: &str, runtimes: &[ScopeRuntime], identity: &ScopeIdentity) -> anyhow::Result<()> {
	println!("== {stage}");
	for runtime in runtimes {
		let peers = runtime.subcluster_nodes(identity).await?;
		println!("{} sees {peers:?}", runtime.local_node());
	}
	Ok(())
}

fn setup_tracing(verbose: bool) {
	use tracing_subscriber::EnvFilter;

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		if verbose {
			EnvFilter::new("murmur_scope=debug,info")
		} else {
			EnvFilter::new("info")
		}
	});
	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
