use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;
use crate::types::ScopeName;

/// The four per-scope tables provisioned for every scope name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
	/// Hashed: name to registration.
	RegistryByName,
	/// Hashed: process to its registered names.
	RegistryByPid,
	/// Ordered: `(group, member)` keys, scanned by group prefix.
	PgByName,
	/// Ordered: `(member, group)` keys, scanned by member prefix.
	PgByPid,
}

impl TableKind {
	pub const ALL: [Self; 4] = [Self::RegistryByName, Self::RegistryByPid, Self::PgByName, Self::PgByPid];

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::RegistryByName => "registry_by_name",
			Self::RegistryByPid => "registry_by_pid",
			Self::PgByName => "pg_by_name",
			Self::PgByPid => "pg_by_pid",
		}
	}

	/// Ordered tables keep keys sorted and support efficient prefix scans.
	pub const fn is_ordered(self) -> bool {
		matches!(self, Self::PgByName | Self::PgByPid)
	}

	/// Deterministic table name, unique per `(kind, scope)`.
	pub fn table_name(self, scope: &ScopeName) -> String {
		format!("murmur_{}_{}", self.as_str(), scope)
	}
}

// Keys are postcard bytes. In `Ordered`, the byte order only groups keys that
// share an encoded prefix; it is not the key order, which readers restore by
// sorting decoded keys.
enum Store {
	Hashed(FxHashMap<Vec<u8>, Vec<u8>>),
	Ordered(BTreeMap<Vec<u8>, Vec<u8>>),
}

impl Store {
	fn for_kind(kind: TableKind) -> Self {
		if kind.is_ordered() {
			Self::Ordered(BTreeMap::new())
		} else {
			Self::Hashed(FxHashMap::default())
		}
	}

	fn len(&self) -> usize {
		match self {
			Self::Hashed(map) => map.len(),
			Self::Ordered(map) => map.len(),
		}
	}

	fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
		match self {
			Self::Hashed(map) => map.insert(key, value),
			Self::Ordered(map) => map.insert(key, value),
		}
	}

	fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
		match self {
			Self::Hashed(map) => map.get(key),
			Self::Ordered(map) => map.get(key),
		}
	}

	fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
		match self {
			Self::Hashed(map) => map.remove(key),
			Self::Ordered(map) => map.remove(key),
		}
	}

	fn retain(&mut self, mut keep: impl FnMut(&[u8], &[u8]) -> bool) {
		match self {
			Self::Hashed(map) => map.retain(|k, v| keep(k, v)),
			Self::Ordered(map) => map.retain(|k, v| keep(k, v)),
		}
	}

	fn collect(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
		match self {
			Self::Hashed(map) => map
				.iter()
				.filter(|(k, _)| k.starts_with(prefix))
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
			Self::Ordered(map) => map
				.range(prefix.to_vec()..)
				.take_while(|(k, _)| k.starts_with(prefix))
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
		}
	}
}

/// Shared, concurrently readable key/value table.
///
/// Keys and values are stored as postcard bytes. Any process holding the
/// handle may read or write; writers do not block each other beyond a short
/// lock.
pub struct Table {
	name: String,
	kind: TableKind,
	store: RwLock<Store>,
}

/// Shared reference to a provisioned table.
pub type TableHandle = Arc<Table>;

impl fmt::Debug for Table {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Table").field("name", &self.name).field("kind", &self.kind).field("len", &self.len()).finish()
	}
}

impl Table {
	pub(crate) fn new(kind: TableKind, scope: &ScopeName) -> Self {
		Self {
			name: kind.table_name(scope),
			kind,
			store: RwLock::new(Store::for_kind(kind)),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn kind(&self) -> TableKind {
		self.kind
	}

	pub fn len(&self) -> usize {
		self.store.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn insert_raw(&self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
		self.store.write().insert(key, value)
	}

	pub fn get_raw(&self, key: &[u8]) -> Option<Vec<u8>> {
		self.store.read().get(key).cloned()
	}

	pub fn remove_raw(&self, key: &[u8]) -> Option<Vec<u8>> {
		self.store.write().remove(key)
	}

	/// Stores `value` under `key`, replacing any previous value.
	pub fn put<K: Serialize, V: Serialize>(&self, key: &K, value: &V) -> Result<(), CodecError> {
		let key = encode(key)?;
		let value = encode(value)?;
		self.insert_raw(key, value);
		Ok(())
	}

	pub fn fetch<K: Serialize, V: DeserializeOwned>(&self, key: &K) -> Result<Option<V>, CodecError> {
		let key = encode(key)?;
		self.get_raw(&key).map(|raw| decode(&raw)).transpose()
	}

	/// Removes `key`; returns whether it was present.
	pub fn delete<K: Serialize>(&self, key: &K) -> Result<bool, CodecError> {
		let key = encode(key)?;
		Ok(self.remove_raw(&key).is_some())
	}

	/// All entries. Ordered tables yield them sorted by `K`, hashed tables in
	/// no particular order.
	pub fn entries<K: DeserializeOwned + Ord, V: DeserializeOwned>(&self) -> Result<Vec<(K, V)>, CodecError> {
		let raw = self.store.read().collect(&[]);
		self.decode_pairs(raw)
	}

	/// Entries whose encoded key starts with the encoding of `prefix`.
	///
	/// For tuple keys this selects every entry sharing the leading fields,
	/// e.g. all members of one group in [`TableKind::PgByName`]. Ordering
	/// follows [`Table::entries`].
	pub fn prefix<P: Serialize, K: DeserializeOwned + Ord, V: DeserializeOwned>(&self, prefix: &P) -> Result<Vec<(K, V)>, CodecError> {
		let prefix = encode(prefix)?;
		let raw = self.store.read().collect(&prefix);
		self.decode_pairs(raw)
	}

	fn decode_pairs<K: DeserializeOwned + Ord, V: DeserializeOwned>(&self, raw: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<(K, V)>, CodecError> {
		let mut pairs = raw.into_iter().map(|(k, v)| Ok((decode(&k)?, decode(&v)?))).collect::<Result<Vec<(K, V)>, CodecError>>()?;
		if self.kind.is_ordered() {
			pairs.sort_by(|a, b| a.0.cmp(&b.0));
		}
		Ok(pairs)
	}

	/// Keeps only entries for which `keep` returns true. Returns the number removed.
	///
	/// Entries that fail to decode as `(K, V)` are kept.
	pub fn retain<K: DeserializeOwned, V: DeserializeOwned>(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
		let mut store = self.store.write();
		let before = store.len();
		store.retain(|k, v| match (decode::<K>(k), decode::<V>(v)) {
			(Ok(k), Ok(v)) => keep(&k, &v),
			_ => true,
		});
		before - store.len()
	}

	pub fn clear(&self) {
		*self.store.write() = Store::for_kind(self.kind);
	}
}

/// The four tables of one scope name.
#[derive(Debug, Clone)]
pub struct TableSet {
	pub registry_by_name: TableHandle,
	pub registry_by_pid: TableHandle,
	pub pg_by_name: TableHandle,
	pub pg_by_pid: TableHandle,
}

impl TableSet {
	pub fn get(&self, kind: TableKind) -> &TableHandle {
		match kind {
			TableKind::RegistryByName => &self.registry_by_name,
			TableKind::RegistryByPid => &self.registry_by_pid,
			TableKind::PgByName => &self.pg_by_name,
			TableKind::PgByPid => &self.pg_by_pid,
		}
	}
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
	postcard::to_stdvec(value).map_err(CodecError::Encode)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CodecError> {
	postcard::from_bytes(raw).map_err(CodecError::Decode)
}
