//! Database manifest.
//!
//! A tiny binary file pinning the properties that must not drift between
//! opens. Today that is the segment size: every segment on disk was written
//! against it, so reopening with a different value is refused.

use crate::error::{Error, Result};

/// Magic bytes at the start of the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"LOAM";

/// Current manifest format version.
pub const MANIFEST_VERSION: u16 = 1;

const MANIFEST_LEN: usize = 4 + 2 + 8;

/// Persistent database metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Manifest format version.
    pub version: u16,
    /// Maximum segment file size the database was created with.
    pub segment_size: u64,
}

impl Manifest {
    /// Creates a manifest for a new database.
    #[must_use]
    pub fn new(segment_size: u64) -> Self {
        Self {
            version: MANIFEST_VERSION,
            segment_size,
        }
    }

    /// Encodes the manifest to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MANIFEST_LEN);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.segment_size.to_le_bytes());
        buf
    }

    /// Decodes a manifest from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MANIFEST_LEN {
            return Err(Error::invalid_format("manifest too short"));
        }
        if data[0..4] != MANIFEST_MAGIC {
            return Err(Error::invalid_format("invalid manifest magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > MANIFEST_VERSION {
            return Err(Error::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }
        let segment_size = u64::from_le_bytes(data[6..14].try_into().unwrap());
        Ok(Self {
            version,
            segment_size,
        })
    }
}
