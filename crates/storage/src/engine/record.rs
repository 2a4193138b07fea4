//! Value-log record format.
//!
//! Value-log segments are named `NNNNNN.vlog` where `NNNNNN` is a zero-padded
//! segment number. A segment is a plain sequence of records; there is no
//! segment header.
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬───────────┬──────────┬───────────────┬───────┬─────────┐
//! │ Length (4 bytes)│ CRC32 (4) │ Kind (1) │ Key len (4)   │ Key   │ Value   │
//! └─────────────────┴───────────┴──────────┴───────────────┴───────┴─────────┘
//! ```
//!
//! `Length` counts every byte after the CRC field. The CRC covers the same
//! bytes.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

/// Bytes preceding the checksummed body: length + CRC
pub const PREFIX_LEN: usize = 8;

/// Fixed part of the checksummed body: kind + key length
const BODY_FIXED_LEN: usize = 5;

/// Upper bound on a single record body, used to reject garbage lengths
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

/// What a record does to its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Key is set to the record's value
    Put = 1,
    /// Key is removed
    Delete = 2,
}

impl RecordKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordKind::Put),
            2 => Some(RecordKind::Delete),
            _ => None,
        }
    }
}

/// A decoded record borrowing from the read buffer
#[derive(Debug, PartialEq, Eq)]
pub struct Record<'a> {
    /// Put or delete
    pub kind: RecordKind,
    /// Key bytes
    pub key: &'a [u8],
    /// Value bytes (empty for deletes)
    pub value: &'a [u8],
}

/// Record decoding failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Buffer ends before the record does (torn write)
    #[error("incomplete record")]
    Incomplete,

    /// Stored checksum does not match the body
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC stored in the record
        expected: u32,
        /// CRC computed over the body
        actual: u32,
    },

    /// Checksum is valid but the body is not a record
    #[error("malformed record: {0}")]
    Malformed(&'static str),
}

/// Checksummed body length of a record for `key` and `value`
pub fn body_len(key: &[u8], value: &[u8]) -> usize {
    BODY_FIXED_LEN
        .saturating_add(key.len())
        .saturating_add(value.len())
}

/// Encode a record into a freshly allocated buffer.
///
/// The caller must reject bodies longer than [`MAX_BODY_LEN`]; `decode`
/// refuses them.
pub fn encode(kind: RecordKind, key: &[u8], value: &[u8]) -> Vec<u8> {
    let body_len = body_len(key, value);
    debug_assert!(body_len <= MAX_BODY_LEN);
    let mut buf = vec![0u8; PREFIX_LEN + body_len];

    LittleEndian::write_u32(&mut buf[0..4], body_len as u32);
    buf[PREFIX_LEN] = kind as u8;
    LittleEndian::write_u32(&mut buf[PREFIX_LEN + 1..PREFIX_LEN + 5], key.len() as u32);
    let key_start = PREFIX_LEN + BODY_FIXED_LEN;
    buf[key_start..key_start + key.len()].copy_from_slice(key);
    buf[key_start + key.len()..].copy_from_slice(value);

    let crc = checksum(&buf[PREFIX_LEN..]);
    LittleEndian::write_u32(&mut buf[4..8], crc);
    buf
}

/// Decode the record at the start of `buf`.
///
/// Returns the record and the number of bytes it occupies.
pub fn decode(buf: &[u8]) -> Result<(Record<'_>, usize), RecordError> {
    if buf.len() < PREFIX_LEN {
        return Err(RecordError::Incomplete);
    }
    let body_len = LittleEndian::read_u32(&buf[0..4]) as usize;
    if !(BODY_FIXED_LEN..=MAX_BODY_LEN).contains(&body_len) {
        return Err(RecordError::Malformed("body length out of range"));
    }
    let total = PREFIX_LEN + body_len;
    if buf.len() < total {
        return Err(RecordError::Incomplete);
    }

    let body = &buf[PREFIX_LEN..total];
    let expected = LittleEndian::read_u32(&buf[4..8]);
    let actual = checksum(body);
    if expected != actual {
        return Err(RecordError::ChecksumMismatch { expected, actual });
    }

    let kind = RecordKind::from_byte(body[0]).ok_or(RecordError::Malformed("unknown kind"))?;
    let key_len = LittleEndian::read_u32(&body[1..5]) as usize;
    if BODY_FIXED_LEN + key_len > body.len() {
        return Err(RecordError::Malformed("key overruns record"));
    }
    let key = &body[BODY_FIXED_LEN..BODY_FIXED_LEN + key_len];
    let value = &body[BODY_FIXED_LEN + key_len..];

    Ok((Record { kind, key, value }, total))
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
