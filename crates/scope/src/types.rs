//! Identity and addressing types shared by every scope component.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! name_type {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			pub fn new(name: impl Into<String>) -> Self {
				Self(name.into())
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({:?})", stringify!($name), self.0)
			}
		}

		impl From<&str> for $name {
			fn from(name: &str) -> Self {
				Self::new(name)
			}
		}

		impl From<String> for $name {
			fn from(name: String) -> Self {
				Self(name)
			}
		}
	};
}

name_type!(
	/// Name of a cluster node. Unique among visible nodes.
	NodeId
);

name_type!(
	/// Stable name of a [`crate::ScopeHandler`] implementation.
	HandlerKind
);

name_type!(
	/// User-chosen partition name. A scope defines a subcluster.
	ScopeName
);

/// The `(handler, scope)` pair naming one logical sync actor per node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeIdentity {
	pub handler: HandlerKind,
	pub scope: ScopeName,
}

impl ScopeIdentity {
	pub fn new(handler: impl Into<HandlerKind>, scope: impl Into<ScopeName>) -> Self {
		Self {
			handler: handler.into(),
			scope: scope.into(),
		}
	}

	/// Identity of handler `H` in `scope`.
	pub fn of<H: crate::ScopeHandler>(scope: impl Into<ScopeName>) -> Self {
		Self::new(H::KIND, scope)
	}

	/// Deterministic process name, used in logs and as the registered name.
	pub fn process_name(&self) -> String {
		format!("murmur_{}_{}", self.handler, self.scope)
	}
}

impl fmt::Display for ScopeIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.handler, self.scope)
	}
}

impl fmt::Debug for ScopeIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ScopeIdentity({self})")
	}
}

/// Node-local process number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(u64);

impl Pid {
	pub const fn new(raw: u64) -> Self {
		Self(raw)
	}

	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for Pid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<{}>", self.0)
	}
}

impl fmt::Debug for Pid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Pid({})", self.0)
	}
}

/// Cluster-wide address of one process. A restarted actor gets a new address.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorAddress {
	pub node: NodeId,
	pub pid: Pid,
}

impl ActorAddress {
	pub fn new(node: NodeId, pid: Pid) -> Self {
		Self { node, pid }
	}
}

impl fmt::Display for ActorAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}", self.pid, self.node)
	}
}

impl fmt::Debug for ActorAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ActorAddress({self})")
	}
}

/// Handle for one installed liveness monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitorRef(u64);

impl MonitorRef {
	pub const fn new(raw: u64) -> Self {
		Self(raw)
	}

	pub const fn get(self) -> u64 {
		self.0
	}
}

/// Where a call reply must be sent, and the id correlating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
	pub address: ActorAddress,
	pub request_id: u64,
}
