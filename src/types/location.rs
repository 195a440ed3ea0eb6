#![forbid(unsafe_code)]

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::{Result, StoreError};

/// A durable pointer to one record inside a log.
///
/// `offset` addresses the first payload byte and `length` the payload size. Ordering
/// is by generation, then offset.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StorageLocation {
    /// Generation (file) the record lives in; always 0 for single-file logs.
    pub generation: u64,
    /// Byte offset of the payload within the generation.
    pub offset: u64,
    /// Payload length in bytes.
    pub length: u32,
}

impl StorageLocation {
    /// Encoded size of a location.
    pub const ENCODED_LEN: usize = 20;

    /// Creates a location.
    pub const fn new(generation: u64, offset: u64, length: u32) -> Self {
        Self {
            generation,
            offset,
            length,
        }
    }

    /// Byte offset one past the end of the payload.
    ///
    /// Only meaningful for locations produced by a log; use
    /// [`checked_end`](Self::checked_end) on untrusted input.
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }

    /// Like [`end`](Self::end), but `None` when the range runs past `u64::MAX`.
    pub fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(u64::from(self.length))
    }

    /// Encodes the location into a fixed-size buffer.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.generation.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf[16..20].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decodes a location previously produced by [`StorageLocation::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(StoreError::invalid_contents(
                "<storage location>",
                format!("expected {} bytes, found {}", Self::ENCODED_LEN, buf.len()),
            ));
        }
        Ok(Self {
            generation: read_u64(buf, 0..8),
            offset: read_u64(buf, 8..16),
            length: read_u32(buf, 16..20),
        })
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}{{{}+{}}}", self.generation, self.offset, self.length)
    }
}

/// Encoded size of one [`IndexContents`] entry.
pub const INDEX_CONTENTS_LEN: usize = 24;

const RECORD: Range<usize> = 0..8;
const OFFSET: Range<usize> = 8..16;
const LENGTH: Range<usize> = 16..20;
const CRC: Range<usize> = 20..24;

/// One entry of a fixed-record log's position index.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IndexContents {
    /// Logical record number.
    pub record: u64,
    /// Byte offset of the record in the data file.
    pub offset: u64,
    /// Record length in bytes.
    pub length: u32,
    /// CRC32 of the record bytes.
    pub crc32: u32,
}

impl IndexContents {
    /// Encodes the entry.
    pub fn encode(&self) -> [u8; INDEX_CONTENTS_LEN] {
        let mut buf = [0u8; INDEX_CONTENTS_LEN];
        buf[RECORD].copy_from_slice(&self.record.to_be_bytes());
        buf[OFFSET].copy_from_slice(&self.offset.to_be_bytes());
        buf[LENGTH].copy_from_slice(&self.length.to_be_bytes());
        buf[CRC].copy_from_slice(&self.crc32.to_be_bytes());
        buf
    }

    /// Decodes an entry; `buf` must hold at least [`INDEX_CONTENTS_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < INDEX_CONTENTS_LEN {
            return None;
        }
        Some(Self {
            record: read_u64(buf, RECORD),
            offset: read_u64(buf, OFFSET),
            length: read_u32(buf, LENGTH),
            crc32: read_u32(buf, CRC),
        })
    }

    /// Location of the indexed record.
    pub fn location(&self) -> StorageLocation {
        StorageLocation::new(0, self.offset, self.length)
    }
}

/// Committed extent of one log, as recorded in the root metadata.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogState {
    /// Last committed record, if any.
    pub location: Option<StorageLocation>,
    /// Records appended over the log's lifetime, pruned generations included.
    pub records: u64,
    /// Oldest generation still retained.
    pub first_generation: u64,
    /// Records held by the generation of `location`.
    pub generation_records: u64,
}

impl LogState {
    /// Generation the next append would target absent rotation.
    pub fn current_generation(&self) -> u64 {
        self.location
            .map(|loc| loc.generation)
            .unwrap_or(self.first_generation)
    }
}

fn read_u64(buf: &[u8], range: Range<usize>) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[range]);
    u64::from_be_bytes(bytes)
}

fn read_u32(buf: &[u8], range: Range<usize>) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[range]);
    u32::from_be_bytes(bytes)
}
