//! Error types for storage backends.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read that extends past the end of the store.
    #[error("read out of bounds: offset {offset}, len {len}, size {size}")]
    ReadOutOfBounds {
        /// Requested read offset.
        offset: u64,
        /// Requested read length.
        len: usize,
        /// Current store size.
        size: u64,
    },

    /// A truncation target larger than the current size.
    #[error("cannot truncate to {requested} bytes, store holds {size}")]
    TruncateBeyondEnd {
        /// Requested new size.
        requested: u64,
        /// Current store size.
        size: u64,
    },
}
