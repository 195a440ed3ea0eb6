#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::primitives::fs::FileLayout;
use crate::store::Synchronous;
use crate::types::{LogState, Result, StorageLocation, StoreError};

/// Single-file log of variable-length records.
pub mod append_log;
/// Fixed-size records with a position index.
pub mod fixed_append_log;
/// Record framing shared by the variable-length logs.
pub mod frame;
/// Size-capped generations presented as one log.
pub mod rolling_log;

pub use append_log::{AppendLog, AppendLogIter, AppendLogReader};
pub use fixed_append_log::{FixedAppendLog, FixedAppendLogReader, FixedIter};
pub use frame::LogRecord;
pub use rolling_log::{RetentionPolicy, RollingIter, RollingLog, RollingLogReader, RollingOptions};

/// Backend kind of a registered resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogKind {
    /// [`AppendLog`].
    Append,
    /// [`FixedAppendLog`].
    FixedAppend,
    /// [`RollingLog`].
    Rolling,
}

impl LogKind {
    /// Lowercase name used in messages.
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Append => "append",
            LogKind::FixedAppend => "fixed-append",
            LogKind::Rolling => "rolling",
        }
    }
}

/// What the loader needs to open one resource's log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LogShape {
    Append,
    FixedAppend { record_size: u32 },
    Rolling(RollingOptions),
}

impl LogShape {
    pub(crate) fn kind(&self) -> LogKind {
        match self {
            LogShape::Append => LogKind::Append,
            LogShape::FixedAppend { .. } => LogKind::FixedAppend,
            LogShape::Rolling(_) => LogKind::Rolling,
        }
    }

    pub(crate) fn record_size(&self) -> u32 {
        match self {
            LogShape::FixedAppend { record_size } => *record_size,
            _ => 0,
        }
    }
}

/// The writer side of a resource, dispatched by kind.
pub(crate) enum ResourceLog {
    Append(AppendLog),
    Fixed(FixedAppendLog),
    Rolling(RollingLog),
}

impl ResourceLog {
    pub(crate) fn open(
        layout: &FileLayout,
        key: &str,
        shape: LogShape,
        state: &LogState,
        synchronous: Synchronous,
    ) -> Result<Self> {
        Ok(match shape {
            LogShape::Append => {
                ResourceLog::Append(AppendLog::open(layout, key, state, synchronous)?)
            }
            LogShape::FixedAppend { record_size } => ResourceLog::Fixed(FixedAppendLog::open(
                layout,
                key,
                record_size,
                state,
                synchronous,
            )?),
            LogShape::Rolling(options) => ResourceLog::Rolling(RollingLog::open(
                layout,
                key,
                options,
                state,
                synchronous,
            )?),
        })
    }

    pub(crate) fn append(&mut self, payload: &[u8]) -> Result<StorageLocation> {
        match self {
            ResourceLog::Append(log) => log.append(payload),
            ResourceLog::Fixed(log) => log.append(payload),
            ResourceLog::Rolling(log) => log.append(payload),
        }
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        match self {
            ResourceLog::Append(log) => log.flush(),
            ResourceLog::Fixed(log) => log.flush(),
            ResourceLog::Rolling(log) => log.flush(),
        }
    }

    pub(crate) fn staged_state(&self, base: &LogState) -> LogState {
        match self {
            ResourceLog::Append(log) => log.staged_state(base),
            ResourceLog::Fixed(log) => log.staged_state(base),
            ResourceLog::Rolling(log) => log.staged_state(base),
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        match self {
            ResourceLog::Append(log) => log.has_pending(),
            ResourceLog::Fixed(log) => log.has_pending(),
            ResourceLog::Rolling(log) => log.has_pending(),
        }
    }

    pub(crate) fn mark_committed(&mut self) {
        match self {
            ResourceLog::Append(log) => log.mark_committed(),
            ResourceLog::Fixed(log) => log.mark_committed(),
            ResourceLog::Rolling(log) => log.mark_committed(),
        }
    }

    pub(crate) fn revert(&mut self) {
        match self {
            ResourceLog::Append(log) => log.revert(),
            ResourceLog::Fixed(log) => log.revert(),
            ResourceLog::Rolling(log) => log.revert(),
        }
    }

    pub(crate) fn reader(&self) -> ResourceReader {
        match self {
            ResourceLog::Append(log) => ResourceReader::Append(log.reader()),
            ResourceLog::Fixed(log) => ResourceReader::Fixed(log.reader()),
            ResourceLog::Rolling(log) => ResourceReader::Rolling(log.reader()),
        }
    }

    pub(crate) fn as_rolling(&self) -> Option<&RollingLog> {
        match self {
            ResourceLog::Rolling(log) => Some(log),
            _ => None,
        }
    }
}

/// The lock-free read side of a resource, dispatched by kind.
#[derive(Clone)]
pub(crate) enum ResourceReader {
    Append(AppendLogReader),
    Fixed(FixedAppendLogReader),
    Rolling(RollingLogReader),
}

impl ResourceReader {
    pub(crate) fn iter(&self, state: &LogState, from: Option<StorageLocation>) -> Result<LogIter> {
        Ok(match self {
            ResourceReader::Append(reader) => LogIter::Append(reader.iter(state, from)?),
            ResourceReader::Fixed(reader) => LogIter::Fixed(reader.iter(state, from)?),
            ResourceReader::Rolling(reader) => LogIter::Rolling(reader.iter(state, from)?),
        })
    }

    pub(crate) fn read_at(&self, state: &LogState, location: StorageLocation) -> Result<Vec<u8>> {
        match self {
            ResourceReader::Append(reader) => reader.read_at(state, location),
            ResourceReader::Fixed(reader) => reader.read_at(state, location),
            ResourceReader::Rolling(reader) => reader.read_at(state, location),
        }
    }

    pub(crate) fn read(&self, key: &str, state: &LogState, record: u64) -> Result<Vec<u8>> {
        match self {
            ResourceReader::Fixed(reader) => reader.read(state, record),
            _ => Err(StoreError::FeatureNotYetImplemented {
                description: format!("random access by record number on '{key}'"),
            }),
        }
    }
}

/// Iterator over the committed records of any resource.
pub enum LogIter {
    /// Over an [`AppendLog`].
    Append(AppendLogIter),
    /// Over a [`FixedAppendLog`].
    Fixed(FixedIter),
    /// Over a [`RollingLog`].
    Rolling(RollingIter),
}

impl Iterator for LogIter {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            LogIter::Append(iter) => iter.next(),
            LogIter::Fixed(iter) => iter.next(),
            LogIter::Rolling(iter) => iter.next(),
        }
    }
}
