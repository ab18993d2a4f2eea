//! Node-local registry of running scope actors and their provisioned tables.
//!
//! # Role
//!
//! The registry is the single source of truth for "which actor serves
//! `(handler, scope)` on this node" and for the shared tables of each scope
//! name. It is owned by the node, not by any actor, so tables outlive actor
//! restarts.
//!
//! # Invariants
//!
//! - Readers never block: both maps are published as immutable snapshots.
//! - Writers publish with a CAS loop, so concurrent writers never lose an update.
//! - Provisioning tables for a scope name is idempotent: concurrent callers all
//!   observe the same four tables and never a partially provisioned set.

mod table;

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;

pub use self::table::{Table, TableHandle, TableKind, TableSet};
use crate::actor::ScopeControl;
use crate::types::{ActorAddress, ScopeIdentity, ScopeName};

/// A registered actor: its address and its local control port.
#[derive(Debug, Clone)]
pub struct ScopeEntry {
	address: ActorAddress,
	control: ScopeControl,
}

impl ScopeEntry {
	pub(crate) fn new(address: ActorAddress, control: ScopeControl) -> Self {
		Self { address, control }
	}

	pub fn address(&self) -> &ActorAddress {
		&self.address
	}

	/// False once the actor loop has exited.
	pub fn is_alive(&self) -> bool {
		self.control.is_alive()
	}

	pub(crate) fn control(&self) -> &ScopeControl {
		&self.control
	}
}

type ActorMap = FxHashMap<ScopeIdentity, ScopeEntry>;
type TableMap = FxHashMap<(TableKind, ScopeName), TableHandle>;

/// Node-local registry.
#[derive(Default)]
pub struct Registry {
	actors: ArcSwap<ActorMap>,
	tables: ArcSwap<TableMap>,
}

impl std::fmt::Debug for Registry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Registry")
			.field("actors", &self.actors.load().len())
			.field("tables", &self.tables.load().len())
			.finish()
	}
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `entry` under `identity`, replacing any previous entry.
	pub fn register_actor(&self, identity: ScopeIdentity, entry: ScopeEntry) {
		publish(&self.actors, |actors| {
			let mut next = actors.clone();
			next.insert(identity.clone(), entry.clone());
			Some(next)
		});
	}

	/// Registers `entry` unless a live actor already holds `identity`.
	///
	/// Returns the address of the live holder on conflict.
	pub(crate) fn claim_actor(&self, identity: &ScopeIdentity, entry: ScopeEntry) -> Result<(), ActorAddress> {
		let mut conflict = None;
		publish(&self.actors, |actors| {
			if let Some(existing) = actors.get(identity).filter(|existing| existing.is_alive()) {
				conflict = Some(existing.address.clone());
				return None;
			}
			conflict = None;
			let mut next = actors.clone();
			next.insert(identity.clone(), entry.clone());
			Some(next)
		});
		conflict.map_or(Ok(()), Err)
	}

	/// Removes the entry for `identity` only if it still points at `address`.
	///
	/// A restarted actor may already have replaced the entry; that
	/// registration is left untouched.
	pub fn unregister_actor(&self, identity: &ScopeIdentity, address: &ActorAddress) -> bool {
		let mut removed = false;
		publish(&self.actors, |actors| {
			removed = actors.get(identity).is_some_and(|entry| &entry.address == address);
			if !removed {
				return None;
			}
			let mut next = actors.clone();
			next.remove(identity);
			Some(next)
		});
		removed
	}

	pub fn lookup_actor(&self, identity: &ScopeIdentity) -> Option<ScopeEntry> {
		self.actors.load().get(identity).cloned()
	}

	pub fn lookup_address(&self, identity: &ScopeIdentity) -> Option<ActorAddress> {
		self.actors.load().get(identity).map(|entry| entry.address.clone())
	}

	/// Identities with a registered actor, sorted.
	pub fn local_scopes(&self) -> Vec<ScopeIdentity> {
		let mut scopes: Vec<_> = self.actors.load().keys().cloned().collect();
		scopes.sort_unstable();
		scopes
	}

	/// Ensures the four tables of `scope` exist and returns them.
	///
	/// Calling this again, from any thread, returns the same tables.
	pub fn provision_tables(&self, scope: &ScopeName) -> TableSet {
		publish(&self.tables, |tables| {
			if TableKind::ALL.iter().all(|kind| tables.contains_key(&(*kind, scope.clone()))) {
				return None;
			}
			let mut next = tables.clone();
			for kind in TableKind::ALL {
				next.entry((kind, scope.clone())).or_insert_with(|| Arc::new(Table::new(kind, scope)));
			}
			tracing::debug!(scope = %scope, "registry.tables.provisioned");
			Some(next)
		});

		let tables = self.tables.load();
		let get = |kind: TableKind| Arc::clone(&tables[&(kind, scope.clone())]);
		TableSet {
			registry_by_name: get(TableKind::RegistryByName),
			registry_by_pid: get(TableKind::RegistryByPid),
			pg_by_name: get(TableKind::PgByName),
			pg_by_pid: get(TableKind::PgByPid),
		}
	}

	pub fn lookup_table(&self, kind: TableKind, scope: &ScopeName) -> Option<TableHandle> {
		self.tables.load().get(&(kind, scope.clone())).cloned()
	}

	pub fn table_count(&self) -> usize {
		self.tables.load().len()
	}
}

/// CAS publication loop. `update` returns `None` to leave the snapshot as is.
fn publish<T>(slot: &ArcSwap<T>, mut update: impl FnMut(&T) -> Option<T>) {
	loop {
		let old = slot.load_full();
		let Some(next) = update(&old) else {
			return;
		};
		let prev = slot.compare_and_swap(&old, Arc::new(next));
		if Arc::ptr_eq(&prev, &old) {
			return;
		}
	}
}
