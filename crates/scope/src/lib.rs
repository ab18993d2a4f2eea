//! Gossip-style scope synchronisation.
//!
//! A *scope* partitions a cluster: for every `(handler, scope)` identity
//! each participating node runs one actor. Actors find each other with a
//! `Discover` / `AckSync` handshake, exchange handler snapshots, monitor one
//! another and purge a node's data when its actor goes away. Each actor owns
//! a relay task for multicast, and each node owns a [`Registry`] that maps
//! identities to actors and provisions the shared tables of every scope name.
//!
//! ```text
//!   ScopeRuntime ──start──▶ ScopeActor<H> ──owns──▶ RelayHandle ──▶ peers
//!        │                      │  ▲
//!        │ control              │  │ Frame / Down
//!        ▼                      ▼  │
//!     Registry ◀──provision──  Cluster (LocalFabric, ...)
//! ```
//!
//! Handlers implement [`ScopeHandler`]; the transport implements [`Cluster`].

mod actor;
mod cluster;
mod config;
mod error;
mod handler;
mod registry;
mod relay;
mod runtime;
mod types;
pub mod wire;

pub use actor::ScopeControl;
pub use cluster::{Cluster, Delivery, DownReason, Inbox, Lane, LocalFabric, LocalNode, MembershipEvent};
pub use config::{ConfigError, ScopeConfig};
pub use error::{CodecError, HandlerError, Result, ScopeError, SendError};
pub use handler::{ActorFlow, CallFlow, ScopeContext, ScopeHandler, ScopeInfo, WireMessage};
pub use registry::{Registry, ScopeEntry, Table, TableHandle, TableKind, TableSet};
pub use runtime::ScopeRuntime;
pub use types::{ActorAddress, HandlerKind, MonitorRef, NodeId, Pid, ReplyTo, ScopeIdentity, ScopeName};
