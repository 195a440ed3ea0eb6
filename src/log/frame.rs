#![forbid(unsafe_code)]

use std::io::IoSlice;
use std::ops::Range;

use crate::primitives::io::FileIo;
use crate::types::checksum::frame_crc32;
use crate::types::{Result, StorageLocation};

/// Bytes preceding every framed payload: length then CRC.
pub const FRAME_HEADER_LEN: u64 = 8;

const LEN: Range<usize> = 0..4;
const CRC: Range<usize> = 4..8;

/// One decoded record with its position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Where the payload lives.
    pub location: StorageLocation,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

pub(crate) enum FrameRead {
    Complete(LogRecord),
    /// Clean end: no bytes left before the limit.
    End,
    /// Partial or checksum-failing frame.
    Torn,
}

pub(crate) fn encode_header(payload: &[u8]) -> [u8; FRAME_HEADER_LEN as usize] {
    let len = payload.len() as u32;
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    header[LEN].copy_from_slice(&len.to_be_bytes());
    header[CRC].copy_from_slice(&frame_crc32(len, payload).to_be_bytes());
    header
}

/// Writes one frame at `frame_start` and returns the payload location.
pub(crate) fn write_frame(
    io: &dyn FileIo,
    generation: u64,
    frame_start: u64,
    payload: &[u8],
) -> Result<StorageLocation> {
    let header = encode_header(payload);
    io.writev_at(frame_start, &[IoSlice::new(&header), IoSlice::new(payload)])?;
    Ok(StorageLocation::new(
        generation,
        frame_start + FRAME_HEADER_LEN,
        payload.len() as u32,
    ))
}

/// Reads the frame starting at `frame_start`, never looking past `limit`.
pub(crate) fn read_frame(
    io: &dyn FileIo,
    generation: u64,
    frame_start: u64,
    limit: u64,
) -> Result<FrameRead> {
    if frame_start >= limit {
        return Ok(FrameRead::End);
    }
    if frame_start + FRAME_HEADER_LEN > limit {
        return Ok(FrameRead::Torn);
    }
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    io.read_at(frame_start, &mut header)?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let payload_start = frame_start + FRAME_HEADER_LEN;
    if payload_start + u64::from(len) > limit {
        return Ok(FrameRead::Torn);
    }
    let mut payload = vec![0u8; len as usize];
    io.read_at(payload_start, &mut payload)?;
    if frame_crc32(len, &payload) != crc {
        return Ok(FrameRead::Torn);
    }
    Ok(FrameRead::Complete(LogRecord {
        location: StorageLocation::new(generation, payload_start, len),
        payload,
    }))
}

/// Result of walking frames from a known-good position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Scan {
    /// End of the last complete frame.
    pub valid_end: u64,
    /// Complete frames seen.
    pub records: u64,
    /// Last complete frame.
    pub last: Option<StorageLocation>,
    /// Whether bytes after `valid_end` failed to decode.
    pub torn: bool,
}

pub(crate) fn scan(io: &dyn FileIo, generation: u64, start: u64, limit: u64) -> Result<Scan> {
    let mut out = Scan {
        valid_end: start,
        ..Scan::default()
    };
    loop {
        match read_frame(io, generation, out.valid_end, limit)? {
            FrameRead::Complete(record) => {
                out.valid_end = record.location.end();
                out.records += 1;
                out.last = Some(record.location);
            }
            FrameRead::End => return Ok(out),
            FrameRead::Torn => {
                out.torn = true;
                return Ok(out);
            }
        }
    }
}

/// Start of the frame holding the payload at `location`.
pub(crate) fn frame_start(location: &StorageLocation) -> Option<u64> {
    location.offset.checked_sub(FRAME_HEADER_LEN)
}
