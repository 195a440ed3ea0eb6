#![forbid(unsafe_code)]

use std::io;

use thiserror::Error;

use super::StorageLocation;

/// Errors surfaced by the store, its logs and their collaborators.
///
/// Every failure mode has its own variant so callers can branch on the kind
/// instead of parsing messages.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A path could not be resolved to a usable location.
    #[error("failed to resolve path '{path}'")]
    FailedToResolvePath {
        /// Path that could not be resolved.
        path: String,
    },
    /// A resource expected by the caller is not registered or has nothing committed.
    #[error("failed to find expected resource '{key}'")]
    FailedToFindExpectedResource {
        /// Resource key that was looked up.
        key: String,
    },
    /// A path or resource key cannot be used as a file name.
    #[error("path '{path}' cannot be used as a file")]
    InvalidPathToFile {
        /// Offending path or key.
        path: String,
    },
    /// A file exists but its contents do not decode.
    #[error("file '{path}' has invalid contents: {note}")]
    InvalidFileContents {
        /// File that failed validation.
        path: String,
        /// What was wrong with it.
        note: String,
    },
    /// A record could not be written at the requested position.
    #[error("failed to write to '{filename}' at position {position}")]
    FailedToWriteToFile {
        /// Target file.
        filename: String,
        /// Byte position of the attempted write.
        position: u64,
    },
    /// Two resources were registered under the same key.
    #[error("duplicate resource key '{key}'")]
    DuplicateResourceKey {
        /// Key registered twice.
        key: String,
    },
    /// Persisted state does not match the registered resource shape.
    #[error("resource '{key}' is inconsistent with its registration: {note}")]
    ResourceFormatInconsistent {
        /// Resource key.
        key: String,
        /// Description of the mismatch.
        note: String,
    },
    /// The requested operation is not supported for this resource or format.
    #[error("feature not yet implemented: {description}")]
    FeatureNotYetImplemented {
        /// What was requested.
        description: String,
    },
    /// Creating, renaming, removing or listing directory entries failed.
    #[error("directory operation failed: {source}")]
    StdIoDirOps {
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Opening a file failed.
    #[error("failed to open file: {source}")]
    StdIoOpen {
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Determining a file length or position failed.
    #[error("failed to seek in file: {source}")]
    StdIoSeek {
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Writing or truncating a file failed.
    #[error("failed to write file: {source}")]
    StdIoWrite {
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Reading a file failed.
    #[error("failed to read file: {source}")]
    StdIoRead {
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Flushing a file or directory to stable storage failed.
    #[error("failed to sync file: {source}")]
    StdIoSync {
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Bincode failed to serialize a value.
    #[error("bincode serialization failed: {source}")]
    BincodeSer {
        /// Underlying codec error.
        source: bincode::Error,
    },
    /// Bincode failed to deserialize a value.
    #[error("bincode deserialization failed: {source}")]
    BincodeDe {
        /// Underlying codec error.
        source: bincode::Error,
    },
    /// JSON serialization failed.
    #[error("json serialization failed: {source}")]
    JsonSer {
        /// Underlying codec error.
        source: serde_json::Error,
    },
    /// JSON deserialization failed.
    #[error("json deserialization failed: {source}")]
    JsonDe {
        /// Underlying codec error.
        source: serde_json::Error,
    },
    /// A glob pattern was malformed.
    #[error("invalid glob pattern: {source}")]
    GlobPattern {
        /// Underlying pattern error.
        source: glob::PatternError,
    },
    /// Walking a glob match failed.
    #[error("glob traversal failed: {source}")]
    GlobRuntime {
        /// Underlying traversal error.
        source: glob::GlobError,
    },
    /// An external error raised while storing a value.
    #[error("store failed: {inner}")]
    OtherStore {
        /// Wrapped error.
        inner: Box<dyn std::error::Error + Send + Sync>,
    },
    /// An external error raised while loading a value.
    #[error("load failed: {inner}")]
    OtherLoad {
        /// Wrapped error.
        inner: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A commit was interrupted mid-critical-section; the store must be reopened.
    #[error("commit lock poisoned: {description}")]
    SyncPoison {
        /// Why the lock was poisoned.
        description: String,
    },
    /// The commit lock was not acquired within the configured timeout.
    #[error("timed out waiting for the commit lock")]
    TimedOut,
    /// A log on disk is behind the committed root metadata.
    #[error("log location {stored} is older than committed location {expected}")]
    LocationOutOfDate {
        /// Furthest location physically present.
        stored: StorageLocation,
        /// Location the root metadata expects.
        expected: StorageLocation,
    },
    /// A location references a pruned generation or no committed record.
    #[error("stale location {location} for '{key}': {note}")]
    StaleLocation {
        /// Resource key.
        key: String,
        /// Rejected location.
        location: StorageLocation,
        /// Why it was rejected.
        note: String,
    },
    /// A record number is beyond the committed record count.
    #[error("record {record} of '{key}' is out of range; {committed} committed")]
    RecordOutOfRange {
        /// Resource key.
        key: String,
        /// Requested record number.
        record: u64,
        /// Committed record count.
        committed: u64,
    },
}

/// Convenience result alias.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

impl StoreError {
    pub(crate) fn invalid_contents(
        path: impl AsRef<std::path::Path>,
        note: impl Into<String>,
    ) -> Self {
        StoreError::InvalidFileContents {
            path: path.as_ref().display().to_string(),
            note: note.into(),
        }
    }

    pub(crate) fn inconsistent(key: &str, note: impl Into<String>) -> Self {
        StoreError::ResourceFormatInconsistent {
            key: key.to_owned(),
            note: note.into(),
        }
    }

    /// Returns true for errors reporting that the commit lock is poisoned.
    pub fn is_poison(&self) -> bool {
        matches!(self, StoreError::SyncPoison { .. })
    }

    /// Returns true for any of the raw I/O sub-kinds.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            StoreError::StdIoDirOps { .. }
                | StoreError::StdIoOpen { .. }
                | StoreError::StdIoSeek { .. }
                | StoreError::StdIoWrite { .. }
                | StoreError::StdIoRead { .. }
                | StoreError::StdIoSync { .. }
        )
    }
}
