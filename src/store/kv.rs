#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::hash::Hash;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::{AtomicStore, AtomicStoreLoader, Resource, Transaction};
use crate::primitives::codec::BincodeCodec;
use crate::types::Result;

/// Codec of the log backing a [`KvStore`]; `None` marks a removal.
pub type KvCodec<K, V> = BincodeCodec<(K, Option<V>)>;

/// Typed key/value map persisted as an append log of `(key, value)` entries.
///
/// A `None` value records a removal. The map is rebuilt by replaying the log
/// at open, and edits stay in memory until [`commit`](Self::commit).
pub struct KvStore<K, V> {
    resource: Resource<KvCodec<K, V>>,
    committed: HashMap<K, V>,
    pending: HashMap<K, Option<V>>,
}

impl<K, V> KvStore<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Registers the backing append log under `key`.
    pub fn register(loader: &mut AtomicStoreLoader, key: &str) -> Result<Resource<KvCodec<K, V>>> {
        loader.append_log(key, BincodeCodec::default())
    }

    /// Replays the committed entries of `resource`.
    pub fn open(store: &AtomicStore, resource: Resource<KvCodec<K, V>>) -> Result<Self> {
        let mut committed = HashMap::new();
        let mut replayed = 0usize;
        for entry in store.iter(&resource)? {
            let (key, value) = entry?;
            match value {
                Some(value) => committed.insert(key, value),
                None => committed.remove(&key),
            };
            replayed += 1;
        }
        debug!(key = resource.key(), replayed, live = committed.len(), "kv.open");
        Ok(Self {
            resource,
            committed,
            pending: HashMap::new(),
        })
    }

    /// Current value of `key`, uncommitted edits included.
    pub fn get(&self, key: &K) -> Option<&V> {
        match self.pending.get(key) {
            Some(value) => value.as_ref(),
            None => self.committed.get(key),
        }
    }

    /// Sets `key` to `value`; returns the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.get(&key).cloned();
        self.pending.insert(key, Some(value));
        previous
    }

    /// Removes `key`; returns the previous value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let previous = self.get(key).cloned();
        if previous.is_some() {
            self.pending.insert(key.clone(), None);
        }
        previous
    }

    /// Live entries, uncommitted edits included, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let committed = self
            .committed
            .iter()
            .filter(|(key, _)| !self.pending.contains_key(*key));
        let pending = self
            .pending
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|value| (key, value)));
        committed.chain(pending)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True when no entries are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether edits are waiting for a commit.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Appends every pending edit to `txn` without committing it.
    ///
    /// Call [`mark_committed`](Self::mark_committed) once `txn` commits, or
    /// [`discard`](Self::discard) if it does not.
    pub fn stage(&self, txn: &mut Transaction<'_>) -> Result<usize> {
        for (key, value) in &self.pending {
            txn.append(&self.resource, &(key.clone(), value.clone()))?;
        }
        Ok(self.pending.len())
    }

    /// Folds staged edits into the committed view.
    pub fn mark_committed(&mut self) {
        for (key, value) in self.pending.drain() {
            match value {
                Some(value) => self.committed.insert(key, value),
                None => self.committed.remove(&key),
            };
        }
    }

    /// Drops every pending edit.
    pub fn discard(&mut self) {
        self.pending.clear();
    }

    /// Commits pending edits in their own transaction; returns the new version.
    pub fn commit(&mut self, store: &AtomicStore) -> Result<u64> {
        let mut txn = store.begin()?;
        let staged = self.stage(&mut txn)?;
        let version = txn.commit()?;
        self.mark_committed();
        debug!(key = self.resource.key(), staged, version, "kv.commit");
        Ok(version)
    }
}
