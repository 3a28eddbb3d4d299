//! On-disk record codec.
//!
//! Every entry is framed as a fixed 32-byte little-endian header followed
//! by the bucket, key, and value bytes:
//!
//! ```text
//! | crc32 (4) | timestamp (8) | key_size (4) | value_size (4) |
//! | flag (2) | ttl (4) | bucket_size (4) | reserved (2) |
//! | bucket... | key... | value... |
//! ```
//!
//! The CRC32 (IEEE) covers every byte after the crc field. Records are
//! self-delimiting: a decoder at offset `p` either yields the entry and the
//! offset of the next record, or reports corruption, in which case nothing
//! at or beyond `p` is trusted while everything before `p` stays valid.

use crate::error::{Error, Result};

/// Fixed size of the record header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Whether a record asserts or retracts a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Flag {
    /// The record sets the key to the carried value.
    Put = 0,
    /// The record deletes the key.
    Delete = 1,
}

impl Flag {
    fn from_u16(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(Self::Put),
            1 => Ok(Self::Delete),
            other => Err(Error::invalid_record(format!("unknown flag {other}"))),
        }
    }
}

/// A single logical mutation: the unit the API exposes and the log stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Bucket name (non-empty).
    pub bucket: Vec<u8>,
    /// Key within the bucket (non-empty).
    pub key: Vec<u8>,
    /// Value bytes (empty for deletes; may be empty for puts).
    pub value: Vec<u8>,
    /// Commit time, seconds since the Unix epoch.
    pub timestamp: u64,
    /// Time to live in seconds; 0 means the entry never expires.
    pub ttl: u32,
    /// Put or Delete.
    pub flag: Flag,
}

impl Entry {
    /// Creates a put entry.
    #[must_use]
    pub fn put(bucket: Vec<u8>, key: Vec<u8>, value: Vec<u8>, timestamp: u64, ttl: u32) -> Self {
        Self {
            bucket,
            key,
            value,
            timestamp,
            ttl,
            flag: Flag::Put,
        }
    }

    /// Creates a delete entry.
    #[must_use]
    pub fn delete(bucket: Vec<u8>, key: Vec<u8>, timestamp: u64) -> Self {
        Self {
            bucket,
            key,
            value: Vec::new(),
            timestamp,
            ttl: 0,
            flag: Flag::Delete,
        }
    }

    /// Returns the encoded size of this entry.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.bucket.len() + self.key.len() + self.value.len()
    }

    /// True once wall-clock time has reached `timestamp + ttl`.
    ///
    /// Entries with ttl 0 never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.ttl > 0 && now >= self.timestamp.saturating_add(u64::from(self.ttl))
    }

    /// Encodes the entry into a single contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());

        // crc placeholder, patched after the content is in place
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.flag as u16).to_le_bytes());
        buf.extend_from_slice(&self.ttl.to_le_bytes());
        buf.extend_from_slice(&(self.bucket.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 2]);

        buf.extend_from_slice(&self.bucket);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        let crc = crc32fast::hash(&buf[4..]);
        buf[0..4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes one record starting at `offset` in `data`.
    ///
    /// Returns the entry and the offset of the next record. Truncated
    /// framing yields `InvalidRecord`; a content mismatch yields
    /// `ChecksumMismatch`. Either way the caller must not trust anything at
    /// or beyond `offset`.
    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let Some(rest) = data.get(offset..) else {
            return Err(Error::invalid_record("offset beyond buffer"));
        };
        if rest.len() < HEADER_SIZE {
            return Err(Error::invalid_record("truncated header"));
        }

        let stored_crc = u32::from_le_bytes(rest[0..4].try_into().unwrap());
        let timestamp = u64::from_le_bytes(rest[4..12].try_into().unwrap());
        let key_size = u32::from_le_bytes(rest[12..16].try_into().unwrap()) as usize;
        let value_size = u32::from_le_bytes(rest[16..20].try_into().unwrap()) as usize;
        let raw_flag = u16::from_le_bytes(rest[20..22].try_into().unwrap());
        let ttl = u32::from_le_bytes(rest[22..26].try_into().unwrap());
        let bucket_size = u32::from_le_bytes(rest[26..30].try_into().unwrap()) as usize;

        let body_len = bucket_size
            .checked_add(key_size)
            .and_then(|n| n.checked_add(value_size))
            .ok_or_else(|| Error::invalid_record("body length overflow"))?;
        let total = HEADER_SIZE + body_len;
        if rest.len() < total {
            return Err(Error::invalid_record("truncated body"));
        }

        let actual_crc = crc32fast::hash(&rest[4..total]);
        if stored_crc != actual_crc {
            return Err(Error::ChecksumMismatch {
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        let flag = Flag::from_u16(raw_flag)?;
        let bucket_end = HEADER_SIZE + bucket_size;
        let key_end = bucket_end + key_size;

        let entry = Self {
            bucket: rest[HEADER_SIZE..bucket_end].to_vec(),
            key: rest[bucket_end..key_end].to_vec(),
            value: rest[key_end..total].to_vec(),
            timestamp,
            ttl,
            flag,
        };

        Ok((entry, offset + total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Entry {
        Entry::put(b"users".to_vec(), b"alice".to_vec(), b"payload".to_vec(), 1_700_000_000, 30)
    }

    #[test]
    fn roundtrip_put() {
        let entry = sample();
        let encoded = entry.encode();
        assert_eq!(encoded.len(), entry.encoded_size());

        let (decoded, next) = Entry::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(next, encoded.len());
    }

    #[test]
    fn roundtrip_delete() {
        let entry = Entry::delete(b"users".to_vec(), b"alice".to_vec(), 42);
        let (decoded, _) = Entry::decode(&entry.encode(), 0).unwrap();
        assert_eq!(decoded.flag, Flag::Delete);
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn empty_value_roundtrips() {
        let entry = Entry::put(b"b".to_vec(), b"k".to_vec(), Vec::new(), 7, 0);
        let (decoded, _) = Entry::decode(&entry.encode(), 0).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn decode_at_offset() {
        let first = sample();
        let second = Entry::delete(b"b2".to_vec(), b"gone".to_vec(), 9);

        let mut buf = first.encode();
        let split = buf.len();
        buf.extend_from_slice(&second.encode());

        let (d1, next) = Entry::decode(&buf, 0).unwrap();
        assert_eq!(d1, first);
        assert_eq!(next, split);

        let (d2, end) = Entry::decode(&buf, next).unwrap();
        assert_eq!(d2, second);
        assert_eq!(end, buf.len());
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let mut encoded = sample().encode();
        encoded[HEADER_SIZE + 2] ^= 0xFF;

        let err = Entry::decode(&encoded, 0).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn truncated_tail_is_invalid_record() {
        let encoded = sample().encode();

        let err = Entry::decode(&encoded[..HEADER_SIZE - 5], 0).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { .. }));

        let err = Entry::decode(&encoded[..encoded.len() - 1], 0).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { .. }));
    }

    #[test]
    fn expiry() {
        let entry = Entry::put(b"b".to_vec(), b"k".to_vec(), b"v".to_vec(), 100, 10);
        assert!(!entry.is_expired_at(100));
        assert!(!entry.is_expired_at(109));
        assert!(entry.is_expired_at(110));

        let persistent = Entry::put(b"b".to_vec(), b"k".to_vec(), b"v".to_vec(), 100, 0);
        assert!(!persistent.is_expired_at(u64::MAX));
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary(
            bucket in proptest::collection::vec(any::<u8>(), 1..32),
            key in proptest::collection::vec(any::<u8>(), 1..64),
            value in proptest::collection::vec(any::<u8>(), 0..256),
            timestamp in any::<u64>(),
            ttl in any::<u32>(),
            is_delete in any::<bool>(),
        ) {
            let entry = Entry {
                bucket,
                key,
                value,
                timestamp,
                ttl,
                flag: if is_delete { Flag::Delete } else { Flag::Put },
            };
            let encoded = entry.encode();
            let (decoded, next) = Entry::decode(&encoded, 0).unwrap();
            prop_assert_eq!(decoded, entry);
            prop_assert_eq!(next, encoded.len());
        }
    }
}
