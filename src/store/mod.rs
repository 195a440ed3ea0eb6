#![forbid(unsafe_code)]

mod atomic_store;
mod kv;
mod loader;
mod meta;
mod options;
mod resource;

pub use atomic_store::{AtomicStore, Transaction};
pub use kv::{KvCodec, KvStore};
pub use loader::AtomicStoreLoader;
pub use meta::{AtomicStoreFileContents, ResourceEntry};
pub use options::{
    StoreOptions, Synchronous, ENV_COMMIT_TIMEOUT_MS, ENV_NO_TIMEOUT, ENV_SYNCHRONOUS,
};
pub use resource::{Entries, Resource};
