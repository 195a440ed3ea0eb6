#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::loader::AtomicStoreLoader;
use super::meta::{AtomicStoreFileContents, ResourceEntry, RootFiles};
use super::resource::{Entries, Resource};
use super::{StoreOptions, Synchronous};
use crate::log::{LogIter, ResourceLog, ResourceReader};
use crate::primitives::codec::Codec;
use crate::primitives::concurrency::{CommitGuard, CommitPhase, VersionSyncHandle};
use crate::primitives::fs::FileLayout;
use crate::types::{LogState, Result, StorageLocation, StoreError};

struct Slot {
    log: Mutex<ResourceLog>,
    reader: ResourceReader,
}

/// Coordinator committing appends to several resources as one atomic unit.
///
/// Writers go through a [`Transaction`]; at most one is open at a time. Reads use
/// the last published root metadata snapshot and never wait for a commit.
pub struct AtomicStore {
    name: String,
    layout: FileLayout,
    options: StoreOptions,
    root: RootFiles,
    sync: VersionSyncHandle,
    committed: RwLock<Arc<AtomicStoreFileContents>>,
    slots: BTreeMap<String, Slot>,
}

impl AtomicStore {
    /// Opens every resource registered with `loader` at its committed extent.
    pub fn open(loader: AtomicStoreLoader) -> Result<Self> {
        if let Some(key) = loader.rejected {
            return Err(StoreError::DuplicateResourceKey { key });
        }
        let mut contents = loader.contents;
        let mut slots = BTreeMap::new();
        for (key, registration) in &loader.registrations {
            let entry = contents
                .resources
                .entry(key.clone())
                .or_insert_with(|| ResourceEntry {
                    kind: registration.shape.kind(),
                    codec: registration.codec.to_owned(),
                    record_size: registration.shape.record_size(),
                    state: LogState::default(),
                });
            let log = ResourceLog::open(
                &loader.layout,
                key,
                registration.shape,
                &entry.state,
                loader.options.synchronous,
            )?;
            let reader = log.reader();
            slots.insert(
                key.clone(),
                Slot {
                    log: Mutex::new(log),
                    reader,
                },
            );
        }
        for key in contents.resources.keys() {
            if !slots.contains_key(key) {
                warn!(store = %loader.name, key = %key, "store.open.unregistered_resource");
            }
        }
        info!(
            store = %loader.name,
            version = contents.version,
            resources = slots.len(),
            "store.open"
        );
        Ok(Self {
            name: loader.name,
            layout: loader.layout,
            options: loader.options,
            root: loader.root,
            sync: VersionSyncHandle::new(contents.version),
            committed: RwLock::new(Arc::new(contents)),
            slots,
        })
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the store.
    pub fn persistence_path(&self) -> &Path {
        self.layout.dir()
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Changes how long [`begin`](Self::begin) waits for the commit lock.
    pub fn set_commit_timeout(&mut self, timeout: Duration) {
        self.options.commit_timeout = timeout;
    }

    /// Last durable version.
    pub fn current_version(&self) -> u64 {
        self.sync.current_version()
    }

    /// Shared view of the commit lock and version counter.
    pub fn sync_handle(&self) -> &VersionSyncHandle {
        &self.sync
    }

    /// True once a commit failed mid-swap; the store must be reopened.
    pub fn is_poisoned(&self) -> bool {
        self.sync.is_poisoned()
    }

    /// The committed root metadata readers currently observe.
    pub fn snapshot(&self) -> Arc<AtomicStoreFileContents> {
        Arc::clone(&self.committed.read())
    }

    /// Starts a transaction, waiting up to the configured commit timeout.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.begin_with_timeout(self.options.commit_timeout)
    }

    /// Starts a transaction, waiting up to `timeout` for a running commit.
    pub fn begin_with_timeout(&self, timeout: Duration) -> Result<Transaction<'_>> {
        let guard = self.sync.begin_commit(timeout)?;
        debug!(store = %self.name, base = self.current_version(), "store.begin");
        Ok(Transaction {
            store: self,
            guard: Some(guard),
            touched: BTreeSet::new(),
        })
    }

    fn slot(&self, key: &str) -> Result<&Slot> {
        self.slots
            .get(key)
            .ok_or_else(|| StoreError::FailedToFindExpectedResource {
                key: key.to_owned(),
            })
    }

    fn committed_state(&self, key: &str) -> Result<(&Slot, LogState)> {
        let slot = self.slot(key)?;
        let state = self
            .snapshot()
            .resources
            .get(key)
            .map(|entry| entry.state)
            .unwrap_or_default();
        Ok((slot, state))
    }

    /// Committed location of the newest record in `key`.
    pub fn committed_location(&self, key: &str) -> Option<StorageLocation> {
        self.snapshot()
            .resources
            .get(key)
            .and_then(|entry| entry.state.location)
    }

    /// Committed record count of `key`, pruned records included.
    pub fn record_count(&self, key: &str) -> Result<u64> {
        Ok(self.committed_state(key)?.1.records)
    }

    /// Iterates the committed records of `resource`.
    pub fn iter<C: Codec>(&self, resource: &Resource<C>) -> Result<Entries<C>> {
        self.iter_from(resource, None)
    }

    /// Iterates committed records starting at `from` (inclusive).
    pub fn iter_from<C: Codec>(
        &self,
        resource: &Resource<C>,
        from: Option<StorageLocation>,
    ) -> Result<Entries<C>> {
        Ok(Entries::new(self.iter_raw(resource.key(), from)?, resource))
    }

    /// Iterates committed record bytes of `key`.
    pub fn iter_raw(&self, key: &str, from: Option<StorageLocation>) -> Result<LogIter> {
        let (slot, state) = self.committed_state(key)?;
        slot.reader.iter(&state, from)
    }

    /// Reads record number `record` of a fixed-record resource.
    pub fn read<C: Codec>(&self, resource: &Resource<C>, record: u64) -> Result<C::Item> {
        let (slot, state) = self.committed_state(resource.key())?;
        let bytes = slot.reader.read(resource.key(), &state, record)?;
        resource.codec().decode(&bytes)
    }

    /// Reads the committed record at `location`.
    pub fn read_at<C: Codec>(
        &self,
        resource: &Resource<C>,
        location: StorageLocation,
    ) -> Result<C::Item> {
        let (slot, state) = self.committed_state(resource.key())?;
        let bytes = slot.reader.read_at(&state, location)?;
        resource.codec().decode(&bytes)
    }

    /// Reads the newest committed record of `resource`.
    pub fn load_latest<C: Codec>(&self, resource: &Resource<C>) -> Result<C::Item> {
        let (slot, state) = self.committed_state(resource.key())?;
        let location = state
            .location
            .ok_or_else(|| StoreError::FailedToFindExpectedResource {
                key: resource.key().to_owned(),
            })?;
        let bytes = slot.reader.read_at(&state, location)?;
        resource.codec().decode(&bytes)
    }

    /// Drops rolling-log generations outside the resource's retention policy.
    ///
    /// Takes the commit lock, commits the new oldest generation, then deletes the
    /// files the published root metadata no longer references. Returns the number
    /// of generation files removed.
    pub fn prune<C: Codec>(&self, resource: &Resource<C>) -> Result<usize> {
        let key = resource.key();
        let guard = self.sync.begin_commit(self.options.commit_timeout)?;
        let (slot, state) = self.committed_state(key)?;
        let first = {
            let log = slot.log.lock();
            let rolling = log
                .as_rolling()
                .ok_or_else(|| StoreError::FeatureNotYetImplemented {
                    description: format!("pruning '{key}', which is not a rolling log"),
                })?;
            rolling.prune_plan(&state)?
        };
        if first <= state.first_generation {
            return Ok(0);
        }
        self.finalize(guard, &BTreeSet::new(), |next| {
            if let Some(entry) = next.resources.get_mut(key) {
                entry.state.first_generation = first;
            }
        })?;

        let published = self.snapshot();
        let Some(entry) = published.resources.get(key) else {
            return Ok(0);
        };
        let floor = entry
            .state
            .first_generation
            .min(entry.state.current_generation());
        let removed = match slot.log.lock().as_rolling() {
            Some(rolling) => rolling.remove_generations_below(floor)?,
            None => 0,
        };
        info!(store = %self.name, key, first = floor, removed, "store.prune");
        Ok(removed)
    }

    fn revert(&self, touched: &BTreeSet<String>) {
        for key in touched {
            if let Some(slot) = self.slots.get(key) {
                slot.log.lock().revert();
            }
        }
    }

    /// Runs the commit protocol for `touched` resources while holding `guard`.
    fn finalize(
        &self,
        mut guard: CommitGuard,
        touched: &BTreeSet<String>,
        adjust: impl FnOnce(&mut AtomicStoreFileContents),
    ) -> Result<u64> {
        let base = self.snapshot();
        let mut next = AtomicStoreFileContents::clone(&base);
        next.version = base.version + 1;
        for key in touched {
            let slot = self.slot(key)?;
            let mut log = slot.log.lock();
            if let Err(err) = log.flush() {
                drop(log);
                self.revert(touched);
                return Err(err);
            }
            if let Some(entry) = next.resources.get_mut(key) {
                entry.state = log.staged_state(&entry.state);
            }
        }
        adjust(&mut next);

        let durable = self.options.synchronous != Synchronous::Off;
        if let Err(err) = self.root.write_working(&next, durable) {
            self.revert(touched);
            return Err(err);
        }

        guard.enter_finalizing();
        let swapped = self
            .root
            .archive_latest(base.version)
            .and_then(|()| self.root.publish_working());
        if let Err(err) = swapped {
            warn!(
                store = %self.name,
                version = next.version,
                error = %err,
                "store.commit.swap_failed"
            );
            guard.leave_finalizing();
            self.root.discard_working();
            self.revert(touched);
            return Err(err);
        }
        if durable {
            if let Err(err) = self.root.sync_dir() {
                guard.poison(format!(
                    "root metadata for version {} renamed but not synced: {err}",
                    next.version
                ));
                return Err(err);
            }
        }

        for key in touched {
            if let Some(slot) = self.slots.get(key) {
                slot.log.lock().mark_committed();
            }
        }
        let version = next.version;
        // Readers of the snapshot never see a version ahead of `current_version`.
        let mut published = self.committed.write();
        *published = Arc::new(next);
        let advanced = self.sync.advance(guard)?;
        drop(published);
        debug_assert_eq!(advanced, version);

        match self.root.trim_archives(self.options.retained_root_archives) {
            Ok(0) => {}
            Ok(removed) => debug!(store = %self.name, removed, "store.root.trim_archives"),
            Err(err) => warn!(store = %self.name, error = %err, "store.root.trim_archives_failed"),
        }
        info!(store = %self.name, version, resources = touched.len(), "store.commit.complete");
        Ok(version)
    }
}

/// A batch of appends that becomes durable and visible together on [`commit`](Self::commit).
///
/// Dropping a transaction without committing rolls it back.
pub struct Transaction<'a> {
    store: &'a AtomicStore,
    guard: Option<CommitGuard>,
    touched: BTreeSet<String>,
}

impl<'a> Transaction<'a> {
    /// Version this transaction builds on.
    pub fn base_version(&self) -> u64 {
        self.store.current_version()
    }

    /// Commit phase; `Preparing` until [`commit`](Self::commit) runs.
    pub fn phase(&self) -> CommitPhase {
        self.guard
            .as_ref()
            .map(CommitGuard::phase)
            .unwrap_or(CommitPhase::Idle)
    }

    /// Encodes `item` with the resource's codec and appends it.
    pub fn append<C: Codec>(
        &mut self,
        resource: &Resource<C>,
        item: &C::Item,
    ) -> Result<StorageLocation> {
        let bytes = resource.codec().encode(item)?;
        self.append_bytes(resource.key(), &bytes)
    }

    /// Appends raw record bytes to `key`.
    pub fn append_bytes(&mut self, key: &str, payload: &[u8]) -> Result<StorageLocation> {
        let slot = self.store.slot(key)?;
        let location = slot.log.lock().append(payload)?;
        if !self.touched.contains(key) {
            self.touched.insert(key.to_owned());
        }
        Ok(location)
    }

    /// Resources appended to so far.
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.touched.iter().map(String::as_str)
    }

    /// Whether any resource holds appends that this transaction would commit.
    pub fn has_pending(&self) -> bool {
        self.touched.iter().any(|key| {
            self.store
                .slots
                .get(key)
                .map(|slot| slot.log.lock().has_pending())
                .unwrap_or(false)
        })
    }

    /// Makes every append durable and visible; returns the new version.
    pub fn commit(mut self) -> Result<u64> {
        let Some(guard) = self.guard.take() else {
            return Err(StoreError::SyncPoison {
                description: "transaction already finished".into(),
            });
        };
        let touched = std::mem::take(&mut self.touched);
        self.store.finalize(guard, &touched, |_| {})
    }

    /// Discards every append made by this transaction.
    pub fn rollback(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.store.revert(&self.touched);
            debug!(store = %self.store.name, resources = self.touched.len(), "store.rollback");
            drop(guard);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abandon();
    }
}
