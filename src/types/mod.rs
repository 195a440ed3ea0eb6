#![forbid(unsafe_code)]

/// CRC32 helpers for frames, headers and index entries.
pub mod checksum;
mod error;
mod location;

pub use error::{Result, StoreError};
pub use location::{IndexContents, LogState, StorageLocation, INDEX_CONTENTS_LEN};
