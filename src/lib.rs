//! Crash-consistent persistence for several append-only resources that commit together.
//!
//! An [`AtomicStoreLoader`] registers named resources (append logs, fixed-record logs and
//! rolling logs) and is consumed into an [`AtomicStore`]. Writes issued inside a
//! [`Transaction`] become visible only when the store swaps in a new root metadata file,
//! so after a crash every resource reflects the same committed version.
//!
//! ```no_run
//! use atomic_store::{AtomicStoreLoader, BincodeCodec, BytesCodec};
//!
//! # fn main() -> atomic_store::Result<()> {
//! let mut loader = AtomicStoreLoader::load("/tmp/bank".as_ref(), "bank")?;
//! let ledger = loader.append_log("ledger", BincodeCodec::<String>::default())?;
//! let index = loader.fixed_append_log("index", BytesCodec, 32)?;
//! let store = loader.open()?;
//!
//! let mut txn = store.begin()?;
//! txn.append(&ledger, &"tx1".to_string())?;
//! txn.append(&index, &vec![0u8; 32])?;
//! let version = txn.commit()?;
//! assert_eq!(store.current_version(), version);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Append-only log backends and the framing they share.
pub mod log;
/// Low-level building blocks: file I/O, paths, codecs and commit synchronization.
pub mod primitives;
/// The store coordinator, its loader and root metadata.
pub mod store;
/// Errors, locations and checksums shared across the crate.
pub mod types;

pub use log::{LogIter, LogKind, LogRecord, RetentionPolicy, RollingOptions};
pub use primitives::codec::{BincodeCodec, BytesCodec, Codec, JsonCodec};
pub use primitives::concurrency::{CommitGuard, CommitPhase, VersionSyncHandle};
pub use store::{
    AtomicStore, AtomicStoreFileContents, AtomicStoreLoader, Entries, KvCodec, KvStore, Resource,
    ResourceEntry, StoreOptions, Synchronous, Transaction,
};
pub use types::{IndexContents, LogState, Result, StorageLocation, StoreError};
