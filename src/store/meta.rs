#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::log::LogKind;
use crate::primitives::fs::{self, FileLayout};
use crate::types::checksum::crc32;
use crate::types::{LogState, Result, StoreError};

const ROOT_MAGIC: [u8; 4] = *b"ATSR";
const ROOT_FORMAT_VERSION: u16 = 1;
const ROOT_HEADER_LEN: usize = 16;

const MAGIC: Range<usize> = 0..4;
const FORMAT: Range<usize> = 4..6;
const BODY_LEN: Range<usize> = 8..12;
const BODY_CRC: Range<usize> = 12..16;

/// Root metadata entry for one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Backend kind the resource was registered with.
    pub kind: LogKind,
    /// Codec format tag the resource was registered with.
    pub codec: String,
    /// Record size for fixed-record logs, 0 otherwise.
    pub record_size: u32,
    /// Committed extent.
    pub state: LogState,
}

/// The root metadata record: which version is durable and where every resource ends.
///
/// Replaced wholesale on each commit, never edited in place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicStoreFileContents {
    /// Store-wide commit version.
    pub version: u64,
    /// Per-resource committed state, keyed by resource name.
    pub resources: BTreeMap<String, ResourceEntry>,
}

impl AtomicStoreFileContents {
    /// Serializes the contents behind a checksummed header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|source| StoreError::BincodeSer { source })?;
        let body_len = u32::try_from(body.len()).map_err(|_| StoreError::FailedToWriteToFile {
            filename: "root metadata".into(),
            position: 0,
        })?;
        let mut buf = vec![0u8; ROOT_HEADER_LEN + body.len()];
        buf[MAGIC].copy_from_slice(&ROOT_MAGIC);
        buf[FORMAT].copy_from_slice(&ROOT_FORMAT_VERSION.to_be_bytes());
        buf[BODY_LEN].copy_from_slice(&body_len.to_be_bytes());
        buf[BODY_CRC].copy_from_slice(&crc32(&body).to_be_bytes());
        buf[ROOT_HEADER_LEN..].copy_from_slice(&body);
        Ok(buf)
    }

    /// Decodes contents read from `path`.
    pub fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < ROOT_HEADER_LEN {
            return Err(StoreError::invalid_contents(path, "root header truncated"));
        }
        if buf[MAGIC] != ROOT_MAGIC {
            return Err(StoreError::invalid_contents(path, "bad root metadata magic"));
        }
        let format = u16::from_be_bytes([buf[4], buf[5]]);
        if format != ROOT_FORMAT_VERSION {
            return Err(StoreError::FeatureNotYetImplemented {
                description: format!("root metadata format version {format}"),
            });
        }
        let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let crc = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let body = &buf[ROOT_HEADER_LEN..];
        if body.len() != body_len {
            return Err(StoreError::invalid_contents(
                path,
                format!("root body is {} bytes, header says {body_len}", body.len()),
            ));
        }
        if crc32(body) != crc {
            return Err(StoreError::invalid_contents(path, "root metadata checksum mismatch"));
        }
        bincode::deserialize(body).map_err(|source| StoreError::BincodeDe { source })
    }
}

/// The files holding one store's root metadata.
#[derive(Clone, Debug)]
pub(crate) struct RootFiles {
    layout: FileLayout,
    name: String,
}

impl RootFiles {
    pub(crate) fn new(layout: FileLayout, name: &str) -> Self {
        Self {
            layout,
            name: name.to_owned(),
        }
    }

    pub(crate) fn latest(&self) -> PathBuf {
        self.layout.root_latest(&self.name)
    }

    pub(crate) fn working(&self) -> PathBuf {
        self.layout.root_working(&self.name)
    }

    /// Whether any root metadata exists for this store.
    pub(crate) fn exists(&self) -> Result<bool> {
        Ok(self.latest().exists() || !self.layout.root_archives(&self.name)?.is_empty())
    }

    /// Loads the durable contents, discarding an abandoned working file.
    ///
    /// A missing latest file falls back to the newest archive, which is what a
    /// crash between the two renames of a swap leaves behind.
    pub(crate) fn load(&self) -> Result<Option<AtomicStoreFileContents>> {
        let working = self.working();
        if working.exists() {
            warn!(path = %working.display(), "store.root.discard_working");
            fs::remove_file(&working)?;
        }
        let latest = self.latest();
        if latest.exists() {
            fs::expect_file_or_absent(&latest)?;
            let contents = AtomicStoreFileContents::decode(&fs::read_file(&latest)?, &latest)?;
            debug!(version = contents.version, "store.root.load_latest");
            return Ok(Some(contents));
        }
        let archives = self.layout.root_archives(&self.name)?;
        match archives.iter().next_back() {
            Some((version, path)) => {
                warn!(version, path = %path.display(), "store.root.recover_from_archive");
                let contents = AtomicStoreFileContents::decode(&fs::read_file(path)?, path)?;
                Ok(Some(contents))
            }
            None => Ok(None),
        }
    }

    /// Writes `contents` to the working file.
    pub(crate) fn write_working(
        &self,
        contents: &AtomicStoreFileContents,
        sync: bool,
    ) -> Result<()> {
        let bytes = contents.encode()?;
        let working = self.working();
        if let Err(err) = fs::write_file(&working, &bytes, sync) {
            if let Err(cleanup) = fs::remove_file(&working) {
                warn!(
                    path = %working.display(),
                    error = %cleanup,
                    "store.root.discard_working_failed"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn discard_working(&self) {
        if let Err(err) = fs::remove_file(&self.working()) {
            warn!(error = %err, "store.root.discard_working_failed");
        }
    }

    /// Moves the current latest file aside as the archive of `previous_version`.
    pub(crate) fn archive_latest(&self, previous_version: u64) -> Result<()> {
        let latest = self.latest();
        if latest.exists() {
            fs::rename(&latest, &self.layout.root_archive(&self.name, previous_version))?;
        }
        Ok(())
    }

    /// Renames the working file into place.
    pub(crate) fn publish_working(&self) -> Result<()> {
        fs::rename(&self.working(), &self.latest())
    }

    pub(crate) fn sync_dir(&self) -> Result<()> {
        fs::sync_dir(self.layout.dir())
    }

    /// Removes all but the newest `retain` archives.
    pub(crate) fn trim_archives(&self, retain: usize) -> Result<usize> {
        let archives = self.layout.root_archives(&self.name)?;
        let excess = archives.len().saturating_sub(retain);
        for path in archives.values().take(excess) {
            fs::remove_file(path)?;
        }
        Ok(excess)
    }
}
