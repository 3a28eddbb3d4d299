//! Storage backend trait.

use crate::error::StorageResult;

/// An opaque append-only byte store.
///
/// Segment files in `loamdb_core` are built on this trait. Backends must
/// uphold:
///
/// - `append` returns the offset the bytes landed at, which equals the
///   size before the call
/// - `read_at` returns exactly the bytes previously appended at that range
/// - after `sync` returns, all previously appended bytes survive a crash
/// - implementations are `Send + Sync`; concurrent `read_at` calls are safe
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// `ReadOutOfBounds` if the range extends past the current size, or an
    /// I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends bytes at the end of the store and returns their offset.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the OS.
    ///
    /// Weaker than [`sync`](Self::sync): data may still sit in OS caches.
    fn flush(&mut self) -> StorageResult<()>;

    /// Syncs data and metadata to durable storage.
    ///
    /// This is the durability barrier: once it returns, appended bytes
    /// survive process or power failure.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes (the next append offset).
    fn size(&self) -> StorageResult<u64>;

    /// Discards all bytes at and after `new_size`.
    ///
    /// Used by recovery to cut a corrupt tail off a segment.
    ///
    /// # Errors
    ///
    /// `TruncateBeyondEnd` if `new_size` exceeds the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
