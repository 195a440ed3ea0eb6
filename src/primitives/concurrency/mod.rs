#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::types::{Result, StoreError};

/// Where the commit lock currently is in the commit protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitPhase {
    /// No commit in flight.
    #[default]
    Idle,
    /// A writer holds the lock and is appending to resources.
    Preparing,
    /// The root metadata swap is underway and must not be abandoned.
    Finalizing,
}

/// Serializes commits and publishes the last durable version.
///
/// Cloning yields another view of the same lock and counter. Reading the version
/// never blocks; taking the lock waits at most the requested timeout.
#[derive(Clone)]
pub struct VersionSyncHandle {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    state: Mutex<SyncState>,
    released: Condvar,
    version: AtomicU64,
}

#[derive(Default, Debug)]
struct SyncState {
    held: bool,
    phase: CommitPhase,
    poisoned: Option<String>,
}

/// Exclusive right to commit, obtained from [`VersionSyncHandle::begin_commit`].
///
/// Dropping the guard releases the lock. Dropping it while unwinding from a panic,
/// or while the root swap is in progress, poisons the handle.
pub struct CommitGuard {
    inner: Arc<SyncInner>,
    released: bool,
}

impl VersionSyncHandle {
    /// Creates a handle whose durable version starts at `version`.
    pub fn new(version: u64) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                state: Mutex::new(SyncState::default()),
                released: Condvar::new(),
                version: AtomicU64::new(version),
            }),
        }
    }

    /// Last version whose root metadata swap completed.
    pub fn current_version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Phase of the commit currently holding the lock.
    pub fn phase(&self) -> CommitPhase {
        self.inner.state.lock().phase
    }

    /// Returns true once a commit was interrupted mid-critical-section.
    pub fn is_poisoned(&self) -> bool {
        self.inner.state.lock().poisoned.is_some()
    }

    /// Takes the commit lock, waiting up to `timeout`.
    ///
    /// `Duration::MAX` waits indefinitely.
    pub fn begin_commit(&self, timeout: Duration) -> Result<CommitGuard> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        loop {
            if let Some(description) = &state.poisoned {
                return Err(StoreError::SyncPoison {
                    description: description.clone(),
                });
            }
            if !state.held {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .released
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.held
                    {
                        debug!(?timeout, "sync.begin_commit.timed_out");
                        return Err(StoreError::TimedOut);
                    }
                }
                None => self.inner.released.wait(&mut state),
            }
        }
        state.held = true;
        state.phase = CommitPhase::Preparing;
        Ok(CommitGuard {
            inner: Arc::clone(&self.inner),
            released: false,
        })
    }

    /// Publishes the next version and releases the lock held by `guard`.
    pub fn advance(&self, mut guard: CommitGuard) -> Result<u64> {
        if !Arc::ptr_eq(&self.inner, &guard.inner) {
            return Err(StoreError::SyncPoison {
                description: "commit guard belongs to another store".into(),
            });
        }
        let mut state = self.inner.state.lock();
        let next = self.inner.version.fetch_add(1, Ordering::AcqRel) + 1;
        state.held = false;
        state.phase = CommitPhase::Idle;
        guard.released = true;
        drop(state);
        self.inner.released.notify_all();
        Ok(next)
    }
}

impl CommitGuard {
    /// Phase this commit has reached.
    pub fn phase(&self) -> CommitPhase {
        self.inner.state.lock().phase
    }

    pub(crate) fn enter_finalizing(&mut self) {
        self.inner.state.lock().phase = CommitPhase::Finalizing;
    }

    /// Marks an aborted swap that left durable state untouched.
    pub(crate) fn leave_finalizing(&mut self) {
        self.inner.state.lock().phase = CommitPhase::Preparing;
    }

    /// Releases the lock and leaves the handle permanently poisoned.
    pub(crate) fn poison(mut self, description: impl Into<String>) {
        let description = description.into();
        let mut state = self.inner.state.lock();
        error!(reason = %description, "sync.poisoned");
        state.poisoned.get_or_insert(description);
        state.held = false;
        state.phase = CommitPhase::Idle;
        self.released = true;
        drop(state);
        self.inner.released.notify_all();
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.inner.state.lock();
        let reason = if std::thread::panicking() {
            Some("commit panicked while holding the lock")
        } else if state.phase == CommitPhase::Finalizing {
            Some("commit abandoned during root metadata swap")
        } else {
            None
        };
        if let Some(reason) = reason {
            error!(reason, "sync.poisoned");
            state.poisoned.get_or_insert_with(|| reason.to_owned());
        }
        state.held = false;
        state.phase = CommitPhase::Idle;
        drop(state);
        self.inner.released.notify_all();
    }
}
