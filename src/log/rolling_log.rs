#![forbid(unsafe_code)]

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::append_log::verify_record;
use super::frame::{self, FrameRead, LogRecord, FRAME_HEADER_LEN};
use crate::primitives::fs::{self, FileLayout};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::store::Synchronous;
use crate::types::checksum::crc32;
use crate::types::{LogState, Result, StorageLocation, StoreError};

/// Bytes at the start of every generation file.
pub const GENERATION_HEADER_LEN: u64 = 24;

const GEN_MAGIC: [u8; 4] = *b"ATRG";
const GEN_FORMAT_VERSION: u16 = 1;
const MAGIC: Range<usize> = 0..4;
const FORMAT: Range<usize> = 4..6;
const GENERATION: Range<usize> = 8..16;
const CRC: Range<usize> = 20..24;

/// Which sealed generations survive a prune.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Never prune.
    #[default]
    KeepAll,
    /// Keep this many newest generations, the current one included.
    KeepGenerations(u64),
    /// Keep the fewest newest generations holding at least this many records.
    KeepRecords(u64),
}

/// Rotation and retention settings for one rolling log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollingOptions {
    /// Rotate before an append would grow the generation past this many bytes.
    pub max_generation_bytes: u64,
    /// Rotate once the generation holds this many records.
    pub max_generation_records: u64,
    /// What [`AtomicStore::prune`](crate::AtomicStore::prune) keeps.
    pub retention: RetentionPolicy,
}

impl Default for RollingOptions {
    fn default() -> Self {
        Self {
            max_generation_bytes: 16 * 1024 * 1024,
            max_generation_records: u64::MAX,
            retention: RetentionPolicy::KeepAll,
        }
    }
}

fn encode_generation_header(generation: u64) -> [u8; GENERATION_HEADER_LEN as usize] {
    let mut buf = [0u8; GENERATION_HEADER_LEN as usize];
    buf[MAGIC].copy_from_slice(&GEN_MAGIC);
    buf[FORMAT].copy_from_slice(&GEN_FORMAT_VERSION.to_be_bytes());
    buf[GENERATION].copy_from_slice(&generation.to_be_bytes());
    let crc = crc32(&buf[..CRC.start]);
    buf[CRC].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn check_generation_header(io: &dyn FileIo, path: &Path, generation: u64) -> Result<()> {
    if io.len()? < GENERATION_HEADER_LEN {
        return Err(StoreError::invalid_contents(path, "generation header truncated"));
    }
    let mut buf = [0u8; GENERATION_HEADER_LEN as usize];
    io.read_at(0, &mut buf)?;
    if buf[MAGIC] != GEN_MAGIC {
        return Err(StoreError::invalid_contents(path, "bad generation magic"));
    }
    let crc = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
    if crc32(&buf[..CRC.start]) != crc {
        return Err(StoreError::invalid_contents(path, "generation header checksum mismatch"));
    }
    let format = u16::from_be_bytes([buf[4], buf[5]]);
    if format != GEN_FORMAT_VERSION {
        return Err(StoreError::FeatureNotYetImplemented {
            description: format!("generation format version {format}"),
        });
    }
    let mut stored = [0u8; 8];
    stored.copy_from_slice(&buf[GENERATION]);
    let stored = u64::from_be_bytes(stored);
    if stored != generation {
        return Err(StoreError::invalid_contents(
            path,
            format!("header names generation {stored}, expected {generation}"),
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Cursor {
    generation: u64,
    end: u64,
    generation_records: u64,
    records: u64,
    last: Option<StorageLocation>,
}

impl Cursor {
    fn from_state(state: &LogState) -> Self {
        Self {
            generation: state.current_generation(),
            end: state
                .location
                .map(|loc| loc.end())
                .unwrap_or(GENERATION_HEADER_LEN),
            generation_records: state.generation_records,
            records: state.records,
            last: state.location,
        }
    }
}

/// An unbounded logical log stored as a sequence of size-capped generation files.
///
/// Only the highest generation is ever written; a generation is synced and
/// closed before its successor is created.
pub struct RollingLog {
    key: String,
    layout: FileLayout,
    options: RollingOptions,
    synchronous: Synchronous,
    committed: Cursor,
    write: Cursor,
    current: Option<Arc<dyn FileIo>>,
    stale_tail: bool,
    unsynced: bool,
}

impl RollingLog {
    /// Opens the log for `key` at its committed extent.
    pub fn open(
        layout: &FileLayout,
        key: &str,
        options: RollingOptions,
        state: &LogState,
        synchronous: Synchronous,
    ) -> Result<Self> {
        if options.max_generation_bytes == 0 || options.max_generation_records == 0 {
            return Err(StoreError::inconsistent(key, "rotation thresholds must be non-zero"));
        }
        let committed = Cursor::from_state(state);
        let found = layout.generations(key)?;
        let required_to = if state.location.is_some() {
            committed.generation + 1
        } else {
            committed.generation
        };
        for generation in state.first_generation..required_to {
            if !found.contains_key(&generation) {
                return Err(StoreError::FailedToResolvePath {
                    path: layout.generation(key, generation).display().to_string(),
                });
            }
        }
        for (&generation, path) in &found {
            fs::expect_file_or_absent(path)?;
            if generation < state.first_generation {
                debug!(key, generation, "log.rolling.remove_pruned_leftover");
                fs::remove_file(path)?;
            } else if generation > committed.generation {
                warn!(key, generation, "log.rolling.uncommitted_generation");
            }
        }

        let mut log = Self {
            key: key.to_owned(),
            layout: layout.clone(),
            options,
            synchronous,
            committed,
            write: committed,
            current: None,
            stale_tail: false,
            unsynced: false,
        };
        if let Some(last) = state.location {
            let path = layout.generation(key, last.generation);
            let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
            check_generation_header(&*io, &path, last.generation)?;
            let len = io.len()?;
            if len < committed.end {
                return Err(StoreError::LocationOutOfDate {
                    stored: StorageLocation::new(last.generation, len, 0),
                    expected: last,
                });
            }
            verify_record(&*io, &path, last)?;
            if len > committed.end {
                let tail = frame::scan(&*io, last.generation, committed.end, len)?;
                warn!(
                    key,
                    bytes = len - committed.end,
                    records = tail.records,
                    torn = tail.torn,
                    "log.rolling.uncommitted_tail"
                );
                log.stale_tail = true;
            }
            log.current = Some(io);
        }
        debug!(
            key,
            first = state.first_generation,
            generation = committed.generation,
            records = committed.records,
            "log.rolling.open"
        );
        Ok(log)
    }

    /// Resource key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Rotation and retention settings.
    pub fn options(&self) -> &RollingOptions {
        &self.options
    }

    /// Generation currently accepting writes.
    pub fn current_generation(&self) -> u64 {
        self.write.generation
    }

    /// Appends one record, rotating first if the current generation is full.
    pub fn append(&mut self, payload: &[u8]) -> Result<StorageLocation> {
        let Ok(len) = u32::try_from(payload.len()) else {
            return Err(StoreError::FailedToWriteToFile {
                filename: self
                    .layout
                    .generation(&self.key, self.write.generation)
                    .display()
                    .to_string(),
                position: self.write.end,
            });
        };
        let frame_len = FRAME_HEADER_LEN + u64::from(len);
        let full = self.write.generation_records > 0
            && (self.write.end + frame_len > self.options.max_generation_bytes
                || self.write.generation_records >= self.options.max_generation_records);

        let (generation, start, generation_records, io) = if full {
            let io = self.seal_and_open_next()?;
            (self.write.generation + 1, GENERATION_HEADER_LEN, 0, io)
        } else {
            let io = self.current_io()?;
            if self.stale_tail {
                io.truncate(self.write.end)?;
                self.stale_tail = false;
            }
            (
                self.write.generation,
                self.write.end,
                self.write.generation_records,
                io,
            )
        };

        let location = match frame::write_frame(&*io, generation, start, payload) {
            Ok(location) => location,
            Err(err) => {
                if !full {
                    self.stale_tail = true;
                }
                return Err(err);
            }
        };
        if self.synchronous == Synchronous::Full {
            if let Err(err) = io.sync_all() {
                if !full {
                    self.stale_tail = true;
                }
                return Err(err);
            }
        } else {
            self.unsynced = true;
        }
        if full {
            info!(
                key = %self.key,
                sealed = self.write.generation,
                opened = generation,
                "log.rolling.rotate"
            );
            self.current = Some(io);
            self.stale_tail = false;
        }
        self.write = Cursor {
            generation,
            end: location.end(),
            generation_records: generation_records + 1,
            records: self.write.records + 1,
            last: Some(location),
        };
        debug!(key = %self.key, %location, "log.rolling.append");
        Ok(location)
    }

    /// Handle for the write generation, creating the file when nothing lives in it yet.
    fn current_io(&mut self) -> Result<Arc<dyn FileIo>> {
        if let Some(io) = &self.current {
            return Ok(Arc::clone(io));
        }
        let io = if self.write.generation_records == 0 {
            self.stale_tail = false;
            self.create_generation(self.write.generation)?
        } else {
            let path = self.layout.generation(&self.key, self.write.generation);
            let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
            check_generation_header(&*io, &path, self.write.generation)?;
            io
        };
        self.current = Some(Arc::clone(&io));
        Ok(io)
    }

    /// Seals the write generation and creates its successor; the cursor is left unchanged.
    fn seal_and_open_next(&mut self) -> Result<Arc<dyn FileIo>> {
        let io = self.current_io()?;
        if self.stale_tail {
            io.truncate(self.write.end)?;
            self.stale_tail = false;
        }
        if self.synchronous != Synchronous::Off {
            io.sync_all()?;
        }
        self.unsynced = false;
        self.create_generation(self.write.generation + 1)
    }

    fn create_generation(&self, generation: u64) -> Result<Arc<dyn FileIo>> {
        let path = self.layout.generation(&self.key, generation);
        fs::expect_file_or_absent(&path)?;
        let io = StdFileIo::create(&path)?;
        io.write_at(0, &encode_generation_header(generation))?;
        if self.synchronous != Synchronous::Off {
            io.sync_all()?;
            fs::sync_dir(self.layout.dir())?;
        }
        debug!(key = %self.key, generation, "log.rolling.create_generation");
        Ok(Arc::new(io))
    }

    /// Flushes the write generation to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        if self.unsynced && self.synchronous != Synchronous::Off {
            if let Some(io) = &self.current {
                io.sync_all()?;
            }
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
            generation_records: self.write.generation_records,
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

    /// Returns the cursor to the committed extent, abandoning any uncommitted rotation.
    pub fn revert(&mut self) {
        if self.write == self.committed {
            return;
        }
        debug!(
            key = %self.key,
            dropped = self.write.records - self.committed.records,
            "log.rolling.revert"
        );
        if self.write.generation != self.committed.generation {
            self.current = None;
        }
        self.write = self.committed;
        self.stale_tail = true;
    }

    /// First generation to keep under the retention policy, given the committed `state`.
    ///
    /// Never moves past the generation holding the committed location.
    pub fn prune_plan(&self, state: &LogState) -> Result<u64> {
        let first = state.first_generation;
        let last = state.current_generation();
        let keep_from = match self.options.retention {
            RetentionPolicy::KeepAll => first,
            RetentionPolicy::KeepGenerations(n) => (last + 1).saturating_sub(n.max(1)).max(first),
            RetentionPolicy::KeepRecords(n) => {
                let reader = self.reader();
                let mut keep_from = last;
                let mut kept = state.generation_records;
                while kept < n && keep_from > first {
                    keep_from -= 1;
                    kept += reader.count_generation(keep_from, first)?;
                }
                keep_from
            }
        };
        Ok(keep_from.min(last))
    }

    /// Deletes generation files below `first`, which must already be committed as pruned.
    pub(crate) fn remove_generations_below(&self, first: u64) -> Result<usize> {
        let mut removed = 0;
        for (generation, path) in self.layout.generations(&self.key)? {
            if generation >= first {
                break;
            }
            fs::remove_file(&path)?;
            removed += 1;
        }
        if removed > 0 {
            fs::sync_dir(self.layout.dir())?;
        }
        Ok(removed)
    }

    /// Lock-free reader over committed generations.
    pub fn reader(&self) -> RollingLogReader {
        RollingLogReader {
            key: self.key.clone(),
            layout: self.layout.clone(),
        }
    }
}

/// Reads committed records of a [`RollingLog`], opening generation files on demand.
#[derive(Clone)]
pub struct RollingLogReader {
    key: String,
    layout: FileLayout,
}

impl RollingLogReader {
    fn stale(&self, location: StorageLocation, note: &str) -> StoreError {
        StoreError::StaleLocation {
            key: self.key.clone(),
            location,
            note: note.to_owned(),
        }
    }

    fn open_generation(&self, generation: u64, first: u64) -> Result<Arc<dyn FileIo>> {
        let pruned = || self.stale(StorageLocation::new(generation, 0, 0), "generation pruned");
        if generation < first {
            return Err(pruned());
        }
        let path = self.layout.generation(&self.key, generation);
        let io = match StdFileIo::open_read(&path) {
            Ok(io) => io,
            Err(StoreError::StdIoOpen { source })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                return Err(pruned())
            }
            Err(err) => return Err(err),
        };
        check_generation_header(&io, &path, generation)?;
        Ok(Arc::new(io))
    }

    fn count_generation(&self, generation: u64, first: u64) -> Result<u64> {
        let io = self.open_generation(generation, first)?;
        let len = io.len()?;
        Ok(frame::scan(&*io, generation, GENERATION_HEADER_LEN, len)?.records)
    }

    /// Reads the committed record at `location`.
    pub fn read_at(&self, state: &LogState, location: StorageLocation) -> Result<Vec<u8>> {
        let Some(last) = state.location else {
            return Err(self.stale(location, "nothing committed"));
        };
        if location.generation < state.first_generation {
            return Err(self.stale(location, "generation pruned"));
        }
        let Some(location_end) = location.checked_end() else {
            return Err(self.stale(location, "beyond the committed extent"));
        };
        if location.generation > last.generation
            || (location.generation == last.generation && location_end > last.end())
        {
            return Err(self.stale(location, "beyond the committed extent"));
        }
        let io = self.open_generation(location.generation, state.first_generation)?;
        let limit = if location.generation == last.generation {
            last.end()
        } else {
            io.len()?
        };
        let start = frame::frame_start(&location)
            .filter(|start| *start >= GENERATION_HEADER_LEN)
            .ok_or_else(|| self.stale(location, "not a record boundary"))?;
        match frame::read_frame(&*io, location.generation, start, limit)? {
            FrameRead::Complete(record) if record.location == location => Ok(record.payload),
            _ => Err(self.stale(location, "not a record boundary")),
        }
    }

    /// Iterates committed records across generations.
    ///
    /// Starts at `from` (inclusive) or at the oldest retained generation.
    pub fn iter(&self, state: &LogState, from: Option<StorageLocation>) -> Result<RollingIter> {
        let (generation, pos) = match from {
            None => (state.first_generation, GENERATION_HEADER_LEN),
            Some(location) => {
                self.read_at(state, location)?;
                (location.generation, location.offset - FRAME_HEADER_LEN)
            }
        };
        let (last_generation, last_end, exhausted) = match state.location {
            Some(last) => (last.generation, last.end(), false),
            None => (0, 0, true),
        };
        Ok(RollingIter {
            reader: self.clone(),
            first: state.first_generation,
            last_generation,
            last_end,
            generation,
            pos,
            open: None,
            done: exhausted,
        })
    }
}

/// Iterator concatenating committed generations in creation order.
pub struct RollingIter {
    reader: RollingLogReader,
    first: u64,
    last_generation: u64,
    last_end: u64,
    generation: u64,
    pos: u64,
    open: Option<(Arc<dyn FileIo>, u64)>,
    done: bool,
}

impl RollingIter {
    fn fail(&mut self, err: StoreError) -> Option<Result<LogRecord>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for RollingIter {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.generation > self.last_generation {
                return None;
            }
            if self.open.is_none() {
                let io = match self.reader.open_generation(self.generation, self.first) {
                    Ok(io) => io,
                    Err(err) => return self.fail(err),
                };
                let limit = if self.generation == self.last_generation {
                    self.last_end
                } else {
                    match io.len() {
                        Ok(len) => len,
                        Err(err) => return self.fail(err),
                    }
                };
                self.open = Some((io, limit));
            }
            let Some((io, limit)) = self.open.as_ref().map(|(io, limit)| (Arc::clone(io), *limit))
            else {
                return None;
            };
            match frame::read_frame(&*io, self.generation, self.pos, limit) {
                Ok(FrameRead::Complete(record)) => {
                    self.pos = record.location.end();
                    return Some(Ok(record));
                }
                Ok(FrameRead::End) => {
                    self.generation += 1;
                    self.pos = GENERATION_HEADER_LEN;
                    self.open = None;
                }
                Ok(FrameRead::Torn) => {
                    let path = self.reader.layout.generation(&self.reader.key, self.generation);
                    let pos = self.pos;
                    return self.fail(StoreError::invalid_contents(
                        path,
                        format!("torn record at {pos} inside a committed generation"),
                    ));
                }
                Err(err) => return self.fail(err),
            }
        }
    }
}
