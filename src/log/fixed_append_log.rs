#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use super::frame::LogRecord;
use crate::primitives::fs::{self, FileLayout};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::store::Synchronous;
use crate::types::checksum::crc32;
use crate::types::{
    IndexContents, LogState, Result, StorageLocation, StoreError, INDEX_CONTENTS_LEN,
};

const ENTRY_LEN: u64 = INDEX_CONTENTS_LEN as u64;

/// Fixed-size records with a position index for O(1) lookup by record number.
///
/// Each append writes the record to the data file, then its [`IndexContents`]
/// entry to the index file, so the index never describes unwritten data.
pub struct FixedAppendLog {
    key: String,
    files: FixedFiles,
    synchronous: Synchronous,
    committed: u64,
    write: u64,
    stale_tail: bool,
    unsynced: bool,
}

#[derive(Clone)]
struct FixedFiles {
    data_path: PathBuf,
    index_path: PathBuf,
    data: Arc<dyn FileIo>,
    index: Arc<dyn FileIo>,
    record_size: u32,
}

impl FixedFiles {
    fn location(&self, record: u64) -> StorageLocation {
        StorageLocation::new(0, record * u64::from(self.record_size), self.record_size)
    }

    fn read_entry(&self, record: u64) -> Result<IndexContents> {
        let mut buf = [0u8; INDEX_CONTENTS_LEN];
        self.index.read_at(record * ENTRY_LEN, &mut buf)?;
        IndexContents::decode(&buf)
            .ok_or_else(|| StoreError::invalid_contents(&self.index_path, "short index entry"))
    }

    /// Reads and verifies record `record` through its index entry.
    fn read_record(&self, record: u64) -> Result<Vec<u8>> {
        let entry = self.read_entry(record)?;
        let expected = self.location(record);
        if entry.record != record || entry.location() != expected {
            return Err(StoreError::invalid_contents(
                &self.index_path,
                format!("entry {record} points at {} instead of {expected}", entry.location()),
            ));
        }
        let mut payload = vec![0u8; self.record_size as usize];
        self.data.read_at(entry.offset, &mut payload)?;
        if crc32(&payload) != entry.crc32 {
            return Err(StoreError::invalid_contents(
                &self.data_path,
                format!("record {record} fails its index checksum"),
            ));
        }
        Ok(payload)
    }

    /// Whether the index entry for `record` matches the data on disk.
    fn entry_matches(&self, record: u64) -> Result<bool> {
        match self.read_record(record) {
            Ok(_) => Ok(true),
            Err(StoreError::InvalidFileContents { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl FixedAppendLog {
    /// Opens the log for `key`, recovering index and data to a common durable length.
    pub fn open(
        layout: &FileLayout,
        key: &str,
        record_size: u32,
        state: &LogState,
        synchronous: Synchronous,
    ) -> Result<Self> {
        if record_size == 0 {
            return Err(StoreError::inconsistent(key, "record size must be non-zero"));
        }
        let data_path = layout.fixed_data(key);
        let index_path = layout.fixed_index(key);
        fs::expect_file_or_absent(&data_path)?;
        fs::expect_file_or_absent(&index_path)?;
        let files = FixedFiles {
            data: Arc::new(StdFileIo::open(&data_path)?),
            index: Arc::new(StdFileIo::open(&index_path)?),
            data_path,
            index_path,
            record_size,
        };
        Self::from_files(key, files, state, synchronous)
    }

    fn from_files(
        key: &str,
        files: FixedFiles,
        state: &LogState,
        synchronous: Synchronous,
    ) -> Result<Self> {
        let committed = state.records;
        let size = u64::from(files.record_size);
        let data_len = files.data.len()?;
        let index_len = files.index.len()?;
        let index_entries = index_len / ENTRY_LEN;
        let mut durable = (data_len / size).min(index_entries);
        if durable < committed {
            return Err(StoreError::LocationOutOfDate {
                stored: files.location(durable.saturating_sub(1)),
                expected: files.location(committed - 1),
            });
        }
        if committed > 0 && !files.entry_matches(committed - 1)? {
            return Err(StoreError::invalid_contents(
                &files.index_path,
                format!("committed record {} does not verify", committed - 1),
            ));
        }
        for record in committed..durable {
            if !files.entry_matches(record)? {
                durable = record;
                break;
            }
        }
        if index_entries > durable {
            warn!(key, index_entries, durable, "log.fixed.index_ahead");
            files.index.truncate(durable * ENTRY_LEN)?;
            files.index.sync_all()?;
        }
        let stale_tail = data_len > committed * size || durable > committed;
        if stale_tail {
            debug!(key, committed, durable, "log.fixed.uncommitted_tail");
        }
        Ok(Self {
            key: key.to_owned(),
            files,
            synchronous,
            committed,
            write: committed,
            stale_tail,
            unsynced: false,
        })
    }

    /// Resource key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Size of every record.
    pub fn record_size(&self) -> u32 {
        self.files.record_size
    }

    /// Appends one record; `payload` must be exactly [`record_size`](Self::record_size) bytes.
    pub fn append(&mut self, payload: &[u8]) -> Result<StorageLocation> {
        if payload.len() != self.files.record_size as usize {
            return Err(StoreError::inconsistent(
                &self.key,
                format!(
                    "record of {} bytes, expected {}",
                    payload.len(),
                    self.files.record_size
                ),
            ));
        }
        if self.stale_tail {
            self.truncate_to_cursor()?;
        }
        let location = self.files.location(self.write);
        let entry = IndexContents {
            record: self.write,
            offset: location.offset,
            length: location.length,
            crc32: crc32(payload),
        };
        if let Err(err) = self.write_record(&entry, payload) {
            self.stale_tail = true;
            return Err(err);
        }
        self.write += 1;
        debug!(key = %self.key, record = entry.record, "log.fixed.append");
        Ok(location)
    }

    fn write_record(&mut self, entry: &IndexContents, payload: &[u8]) -> Result<()> {
        let full = self.synchronous == Synchronous::Full;
        self.files.data.write_at(entry.offset, payload)?;
        if full {
            self.files.data.sync_all()?;
        }
        self.files
            .index
            .write_at(entry.record * ENTRY_LEN, &entry.encode())?;
        if full {
            self.files.index.sync_all()?;
        } else {
            self.unsynced = true;
        }
        Ok(())
    }

    fn truncate_to_cursor(&mut self) -> Result<()> {
        self.files
            .index
            .truncate(self.write * ENTRY_LEN)?;
        self.files
            .data
            .truncate(self.write * u64::from(self.files.record_size))?;
        self.stale_tail = false;
        Ok(())
    }

    /// Flushes data, then index, to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        if self.unsynced && self.synchronous != Synchronous::Off {
            self.files.data.sync_all()?;
            self.files.index.sync_all()?;
        }
        self.unsynced = false;
        Ok(())
    }

    /// Committed state reflecting everything appended so far.
    pub fn staged_state(&self, base: &LogState) -> LogState {
        LogState {
            location: self.write.checked_sub(1).map(|n| self.files.location(n)),
            records: self.write,
            first_generation: base.first_generation,
            generation_records: self.write,
        }
    }

    /// Whether appends happened since the last commit or revert.
    pub fn has_pending(&self) -> bool {
        self.write != self.committed
    }

    /// Makes the staged appends the committed extent.
    pub fn mark_committed(&mut self) {
        self.committed = self.write;
    }

    /// Returns the cursor to the committed record count.
    pub fn revert(&mut self) {
        if self.write != self.committed {
            debug!(key = %self.key, dropped = self.write - self.committed, "log.fixed.revert");
            self.write = self.committed;
            self.stale_tail = true;
        }
    }

    /// Lock-free reader sharing this log's file handles.
    pub fn reader(&self) -> FixedAppendLogReader {
        FixedAppendLogReader {
            key: self.key.clone(),
            files: self.files.clone(),
        }
    }
}

/// Reads committed records of a [`FixedAppendLog`].
#[derive(Clone)]
pub struct FixedAppendLogReader {
    key: String,
    files: FixedFiles,
}

impl FixedAppendLogReader {
    /// Reads record `record`, which must be below the committed count in `state`.
    pub fn read(&self, state: &LogState, record: u64) -> Result<Vec<u8>> {
        if record >= state.records {
            return Err(StoreError::RecordOutOfRange {
                key: self.key.clone(),
                record,
                committed: state.records,
            });
        }
        self.files.read_record(record)
    }

    /// Location of record `record`.
    pub fn index_to_location(&self, record: u64) -> StorageLocation {
        self.files.location(record)
    }

    /// Record number addressed by `location`.
    pub fn location_to_index(&self, location: StorageLocation) -> Result<u64> {
        let size = u64::from(self.files.record_size);
        if location.generation != 0
            || location.length != self.files.record_size
            || location.offset % size != 0
        {
            return Err(StoreError::StaleLocation {
                key: self.key.clone(),
                location,
                note: "not a record boundary".into(),
            });
        }
        Ok(location.offset / size)
    }

    /// Reads the committed record at `location`.
    pub fn read_at(&self, state: &LogState, location: StorageLocation) -> Result<Vec<u8>> {
        let record = self.location_to_index(location)?;
        if record >= state.records {
            return Err(StoreError::StaleLocation {
                key: self.key.clone(),
                location,
                note: "beyond the committed extent".into(),
            });
        }
        self.files.read_record(record)
    }

    /// Iterates committed records starting at `from` (inclusive) or record 0.
    pub fn iter(&self, state: &LogState, from: Option<StorageLocation>) -> Result<FixedIter> {
        let next = match from {
            None => 0,
            Some(location) => {
                let record = self.location_to_index(location)?;
                if record >= state.records {
                    return Err(StoreError::StaleLocation {
                        key: self.key.clone(),
                        location,
                        note: "beyond the committed extent".into(),
                    });
                }
                record
            }
        };
        Ok(FixedIter {
            files: self.files.clone(),
            next,
            end: state.records,
        })
    }
}

/// Iterator over committed fixed-size records.
pub struct FixedIter {
    files: FixedFiles,
    next: u64,
    end: u64,
}

impl Iterator for FixedIter {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let record = self.next;
        self.next += 1;
        let result = self.files.read_record(record).map(|payload| LogRecord {
            location: self.files.location(record),
            payload,
        });
        if result.is_err() {
            self.next = self.end;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FixedIter {}
