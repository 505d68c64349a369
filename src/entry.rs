//! Encodes and decodes a single log record.
//!
//! On-disk layout, fixed header followed by variable-length key and value:
//!
//! - `timestamp`: 8 bytes, big-endian `f64` seconds since epoch.
//! - `key_size`: 4 bytes, big-endian `u32`.
//! - `value_size`: 4 bytes, big-endian `u32` (0 for tombstones).
//! - `tombstone`: 1 byte, `0x01` if this entry marks a deletion, else `0x00`.
//! - `key`: `key_size` raw bytes.
//! - `value`: `value_size` raw bytes.

use crate::error::{Error, Result};

/// Size of the fixed header: timestamp(8) + key_size(4) + value_size(4) + tombstone(1).
pub const HEADER_SIZE: usize = 17;

/// A single record in a segment's append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub timestamp: f64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub tombstone: bool,
}

impl Entry {
    /// Builds a live (non-tombstone) entry for `key`/`value` at `timestamp`.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: f64) -> Self {
        Self { timestamp, key: key.into(), value: value.into(), tombstone: false }
    }

    /// Builds a tombstone entry marking `key` as deleted at `timestamp`.
    pub fn tombstone(key: impl Into<Vec<u8>>, timestamp: f64) -> Self {
        Self { timestamp, key: key.into(), value: Vec::new(), tombstone: true }
    }

    pub fn key_size(&self) -> u32 {
        self.key.len() as u32
    }

    pub fn value_size(&self) -> u32 {
        self.value.len() as u32
    }

    /// Total serialized size in bytes: header plus key and value.
    pub fn size(&self) -> u64 {
        HEADER_SIZE as u64 + self.key.len() as u64 + self.value.len() as u64
    }

    /// Produces the exact on-disk byte layout described above.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.key_size().to_be_bytes());
        buf.extend_from_slice(&self.value_size().to_be_bytes());
        buf.push(if self.tombstone { 0x01 } else { 0x00 });
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Parses an entry out of `buf`. `buf` may carry trailing bytes beyond
    /// the entry; only the leading `size()` bytes are consumed.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::MalformedEntry(format!(
                "header truncated: got {} bytes, need {HEADER_SIZE}",
                buf.len()
            )));
        }
        let timestamp = f64::from_be_bytes(buf[0..8].try_into().unwrap());
        let key_size = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
        let value_size = u32::from_be_bytes(buf[12..16].try_into().unwrap()) as usize;
        let tombstone = buf[16] != 0;

        let expected = HEADER_SIZE + key_size + value_size;
        if buf.len() < expected {
            return Err(Error::MalformedEntry(format!(
                "body truncated: got {} bytes, need {expected}",
                buf.len()
            )));
        }

        let key = buf[HEADER_SIZE..HEADER_SIZE + key_size].to_vec();
        let value = buf[HEADER_SIZE + key_size..expected].to_vec();
        Ok(Self { timestamp, key, value, tombstone })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_put() {
        let e = Entry::put(b"key1".to_vec(), b"value1".to_vec(), 1234.5);
        let buf = e.serialize();
        assert_eq!(buf.len(), e.size() as usize);
        assert_eq!(Entry::deserialize(&buf).unwrap(), e);
    }

    #[test]
    fn round_trip_tombstone() {
        let e = Entry::tombstone(b"deleted".to_vec(), 42.0);
        assert!(e.tombstone);
        assert_eq!(e.value_size(), 0);
        let buf = e.serialize();
        assert_eq!(Entry::deserialize(&buf).unwrap(), e);
    }

    #[test]
    fn round_trip_empty_key_and_value() {
        let e = Entry::put(Vec::new(), Vec::new(), 0.0);
        let buf = e.serialize();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(Entry::deserialize(&buf).unwrap(), e);
    }

    #[test]
    fn deserialize_rejects_short_header() {
        let buf = vec![0u8; HEADER_SIZE - 1];
        assert!(matches!(Entry::deserialize(&buf), Err(Error::MalformedEntry(_))));
    }

    #[test]
    fn deserialize_rejects_truncated_body() {
        let e = Entry::put(b"key".to_vec(), b"value".to_vec(), 1.0);
        let mut buf = e.serialize();
        buf.truncate(buf.len() - 1);
        assert!(matches!(Entry::deserialize(&buf), Err(Error::MalformedEntry(_))));
    }

    #[test]
    fn deserialize_ignores_trailing_bytes() {
        let e = Entry::put(b"key".to_vec(), b"value".to_vec(), 1.0);
        let mut buf = e.serialize();
        buf.extend_from_slice(b"garbage-past-the-end");
        assert_eq!(Entry::deserialize(&buf).unwrap(), e);
    }
}
