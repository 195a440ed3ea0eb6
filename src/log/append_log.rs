#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::frame::{self, FrameRead, LogRecord};
use crate::primitives::fs::{self, FileLayout};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::store::Synchronous;
use crate::types::{LogState, Result, StorageLocation, StoreError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Cursor {
    end: u64,
    records: u64,
    last: Option<StorageLocation>,
}

impl Cursor {
    fn from_state(state: &LogState) -> Self {
        Self {
            end: state.location.map(|loc| loc.end()).unwrap_or(0),
            records: state.records,
            last: state.location,
        }
    }
}

/// Variable-length records framed back to back in a single file.
pub struct AppendLog {
    key: String,
    path: PathBuf,
    io: Arc<dyn FileIo>,
    synchronous: Synchronous,
    committed: Cursor,
    write: Cursor,
    /// Bytes past `write.end` exist on disk and must go before the next write.
    stale_tail: bool,
    unsynced: bool,
}

impl AppendLog {
    /// Opens the log for `key`, positioned at its committed extent.
    pub fn open(
        layout: &FileLayout,
        key: &str,
        state: &LogState,
        synchronous: Synchronous,
    ) -> Result<Self> {
        let path = layout.append_log(key);
        fs::expect_file_or_absent(&path)?;
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
        Self::from_io(key, path, io, state, synchronous)
    }

    pub(crate) fn from_io(
        key: &str,
        path: PathBuf,
        io: Arc<dyn FileIo>,
        state: &LogState,
        synchronous: Synchronous,
    ) -> Result<Self> {
        let committed = Cursor::from_state(state);
        let len = io.len()?;
        if len < committed.end {
            return Err(StoreError::LocationOutOfDate {
                stored: StorageLocation::new(0, len, 0),
                expected: state.location.unwrap_or_default(),
            });
        }
        if let Some(last) = state.location {
            verify_record(&*io, &path, last)?;
        }
        let stale_tail = len > committed.end;
        if stale_tail {
            let tail = frame::scan(&*io, 0, committed.end, len)?;
            warn!(
                key,
                bytes = len - committed.end,
                records = tail.records,
                torn = tail.torn,
                "log.append.uncommitted_tail"
            );
        }
        debug!(key, end = committed.end, records = committed.records, "log.append.open");
        Ok(Self {
            key: key.to_owned(),
            path,
            io,
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

    /// Appends one record and returns where it landed.
    ///
    /// On failure the write cursor does not move.
    pub fn append(&mut self, payload: &[u8]) -> Result<StorageLocation> {
        if u32::try_from(payload.len()).is_err() {
            return Err(StoreError::FailedToWriteToFile {
                filename: self.path.display().to_string(),
                position: self.write.end,
            });
        }
        if self.stale_tail {
            self.io.truncate(self.write.end)?;
            self.stale_tail = false;
        }
        let location = match frame::write_frame(&*self.io, 0, self.write.end, payload) {
            Ok(location) => location,
            Err(err) => {
                self.stale_tail = true;
                return Err(err);
            }
        };
        if self.synchronous == Synchronous::Full {
            if let Err(err) = self.io.sync_all() {
                self.stale_tail = true;
                return Err(err);
            }
        } else {
            self.unsynced = true;
        }
        self.write = Cursor {
            end: location.end(),
            records: self.write.records + 1,
            last: Some(location),
        };
        debug!(key = %self.key, %location, "log.append.append");
        Ok(location)
    }

    /// Flushes appended records to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        if self.unsynced && self.synchronous != Synchronous::Off {
            self.io.sync_all()?;
        }
        self.unsynced = false;
        Ok(())
    }

    /// Committed state reflecting everything appended so far.
    pub fn staged_state(&self, base: &LogState) -> LogState {
        LogState {
            location: self.write.last,
            records: self.write.records,
            first_generation: base.first_generation,
            generation_records: self.write.records,
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

    /// Returns the cursor to the committed extent; appended bytes stay until overwritten.
    pub fn revert(&mut self) {
        if self.write != self.committed {
            debug!(
                key = %self.key,
                dropped = self.write.records - self.committed.records,
                "log.append.revert"
            );
            self.write = self.committed;
            self.stale_tail = true;
        }
    }

    /// Lock-free reader sharing this log's file handle.
    pub fn reader(&self) -> AppendLogReader {
        AppendLogReader {
            key: self.key.clone(),
            path: self.path.clone(),
            io: Arc::clone(&self.io),
        }
    }
}

/// Reads committed records of an [`AppendLog`].
#[derive(Clone)]
pub struct AppendLogReader {
    key: String,
    path: PathBuf,
    io: Arc<dyn FileIo>,
}

impl AppendLogReader {
    /// Iterates records committed in `state`, starting at `from` (inclusive) or the beginning.
    pub fn iter(&self, state: &LogState, from: Option<StorageLocation>) -> Result<AppendLogIter> {
        let end = Cursor::from_state(state).end;
        let pos = match from {
            None => 0,
            Some(location) => {
                self.read_at(state, location)?;
                location.offset - frame::FRAME_HEADER_LEN
            }
        };
        Ok(AppendLogIter {
            io: Arc::clone(&self.io),
            path: self.path.clone(),
            pos,
            end,
            failed: false,
        })
    }

    /// Reads the committed record at `location`.
    pub fn read_at(&self, state: &LogState, location: StorageLocation) -> Result<Vec<u8>> {
        let end = Cursor::from_state(state).end;
        let stale = |note: &str| StoreError::StaleLocation {
            key: self.key.clone(),
            location,
            note: note.to_owned(),
        };
        let in_extent = location.checked_end().is_some_and(|loc_end| loc_end <= end);
        if location.generation != 0 || !in_extent {
            return Err(stale("beyond the committed extent"));
        }
        let start = frame::frame_start(&location).ok_or_else(|| stale("not a record boundary"))?;
        match frame::read_frame(&*self.io, 0, start, end)? {
            FrameRead::Complete(record) if record.location == location => Ok(record.payload),
            _ => Err(stale("not a record boundary")),
        }
    }
}

/// Forward iterator over committed [`AppendLog`] records.
pub struct AppendLogIter {
    io: Arc<dyn FileIo>,
    path: PathBuf,
    pos: u64,
    end: u64,
    failed: bool,
}

impl Iterator for AppendLogIter {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.end {
            return None;
        }
        match frame::read_frame(&*self.io, 0, self.pos, self.end) {
            Ok(FrameRead::Complete(record)) => {
                self.pos = record.location.end();
                Some(Ok(record))
            }
            Ok(FrameRead::End) => None,
            Ok(FrameRead::Torn) => {
                self.failed = true;
                Some(Err(StoreError::invalid_contents(
                    &self.path,
                    format!("torn record at {} inside the committed extent", self.pos),
                )))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

pub(crate) fn verify_record(io: &dyn FileIo, path: &Path, location: StorageLocation) -> Result<()> {
    let verified = match frame::frame_start(&location) {
        Some(start) => matches!(
            frame::read_frame(io, location.generation, start, location.end())?,
            FrameRead::Complete(record) if record.location == location
        ),
        None => false,
    };
    if verified {
        Ok(())
    } else {
        Err(StoreError::invalid_contents(
            path,
            format!("committed record {location} does not verify"),
        ))
    }
}
