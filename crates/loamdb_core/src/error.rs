//! Error types for loamdb.

use std::io;
use thiserror::Error;

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the database.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] loamdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No visible entry for the (bucket, key) pair.
    #[error("key not found")]
    NotFound,

    /// An entry exists but its TTL has elapsed.
    #[error("entry expired")]
    Expired,

    /// Empty bucket or key, or a value too large for a segment.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected argument.
        message: String,
    },

    /// Mutation attempted on a read transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// Operation on a committed, rolled-back, or closed transaction.
    #[error("transaction is closed")]
    TransactionClosed,

    /// A record failed to decode: truncated framing or bad field.
    #[error("invalid record: {message}")]
    InvalidRecord {
        /// Description of the corruption.
        message: String,
    },

    /// A record's stored CRC32 does not match its content.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the record header.
        expected: u32,
        /// Checksum computed over the record content.
        actual: u32,
    },

    /// An append would push the segment past its size limit.
    #[error("append of {requested} bytes exceeds segment limit, {remaining} remaining")]
    WouldExceedLimit {
        /// Size of the rejected append.
        requested: u64,
        /// Bytes left before the segment limit.
        remaining: u64,
    },

    /// The durability barrier failed; on-disk state is indeterminate
    /// until the next open.
    #[error("commit failed: {message}")]
    CommitFailed {
        /// Description of the barrier failure.
        message: String,
    },

    /// Another process holds the database directory lock.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// The database handle has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// The directory does not hold a readable database of this format.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

impl Error {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Creates a commit failed error.
    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// True when the error means "no visible entry": either the key is
    /// absent or its TTL elapsed.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotFound | Self::Expired)
    }

    /// True for corruption-class errors recovery handles by truncation.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::InvalidRecord { .. } | Self::ChecksumMismatch { .. }
        )
    }
}
