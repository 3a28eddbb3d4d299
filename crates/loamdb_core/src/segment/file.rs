//! A bounded append-only segment file.

use crate::error::{Error, Result};
use crate::record::{Entry, HEADER_SIZE};
use loamdb_storage::{FileBackend, StorageBackend};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One segment of the log: a bounded append-only file of records.
///
/// At most one segment per database is writable (the active segment); all
/// others are sealed. Appends go through the writer only, so the interior
/// lock is uncontended on the write path; positional reads are safe from
/// any thread, on sealed and active segments alike.
pub struct SegmentFile {
    id: u64,
    max_size: u64,
    sealed: AtomicBool,
    size: AtomicU64,
    backend: RwLock<Box<dyn StorageBackend>>,
}

impl SegmentFile {
    /// Opens the segment file at `path`, creating it if absent.
    ///
    /// With `writable` false the segment starts sealed. The underlying
    /// file stays read-write either way, because recovery may need to cut
    /// a corrupt tail off a sealed segment.
    pub fn open(path: &Path, id: u64, max_size: u64, writable: bool) -> Result<Self> {
        let backend = Box::new(FileBackend::open(path)?);
        Self::from_backend(backend, id, max_size, writable)
    }

    /// Wraps an existing backend as a segment. Used by recovery and tests.
    pub fn from_backend(
        backend: Box<dyn StorageBackend>,
        id: u64,
        max_size: u64,
        writable: bool,
    ) -> Result<Self> {
        let size = backend.size()?;
        Ok(Self {
            id,
            max_size,
            sealed: AtomicBool::new(!writable),
            size: AtomicU64::new(size),
            backend: RwLock::new(backend),
        })
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// True when the segment holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes left before the size limit.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.max_size.saturating_sub(self.len())
    }

    /// True once the segment has been sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Marks the segment immutable. Further appends fail.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Appends encoded bytes, returning the offset they were written at.
    ///
    /// Filling the segment to exactly its limit succeeds; one byte more
    /// returns `WouldExceedLimit`, as does any append on a sealed segment.
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let requested = bytes.len() as u64;
        if self.is_sealed() {
            return Err(Error::WouldExceedLimit {
                requested,
                remaining: 0,
            });
        }
        let remaining = self.remaining();
        if requested > remaining {
            return Err(Error::WouldExceedLimit {
                requested,
                remaining,
            });
        }

        let mut backend = self.backend.write();
        let offset = backend.append(bytes)?;
        backend.flush()?;
        self.size.store(offset + requested, Ordering::Release);
        Ok(offset)
    }

    /// Reads `len` raw bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.backend.read().read_at(offset, len)?)
    }

    /// Reads and decodes the record of `size` bytes at `offset`.
    pub fn read_entry(&self, offset: u64, size: u32) -> Result<Entry> {
        let bytes = self.read_at(offset, size as usize)?;
        let (entry, _) = Entry::decode(&bytes, 0)?;
        Ok(entry)
    }

    /// Returns a lazy scan over all records, in append order.
    ///
    /// Each item is the record's offset and its decode result. After the
    /// first corrupt record the scan stops; the yielded offset is where a
    /// recovery truncation should cut.
    #[must_use]
    pub fn scan(&self) -> SegmentScan<'_> {
        SegmentScan {
            segment: self,
            offset: 0,
            end: self.len(),
            done: false,
        }
    }

    /// Issues the durability barrier for this segment.
    pub fn sync(&self) -> Result<()> {
        self.backend.write().sync()?;
        Ok(())
    }

    /// Cuts the file at `new_len`, discarding the tail.
    pub fn truncate(&self, new_len: u64) -> Result<()> {
        self.backend.write().truncate(new_len)?;
        self.size.store(new_len, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for SegmentFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentFile")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("sealed", &self.is_sealed())
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Lazy record scan over one segment. See [`SegmentFile::scan`].
pub struct SegmentScan<'a> {
    segment: &'a SegmentFile,
    offset: u64,
    end: u64,
    done: bool,
}

impl Iterator for SegmentScan<'_> {
    type Item = (u64, Result<Entry>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.end {
            return None;
        }

        let offset = self.offset;
        match self.read_record(offset) {
            Ok((entry, next_offset)) => {
                self.offset = next_offset;
                Some((offset, Ok(entry)))
            }
            Err(err) => {
                self.done = true;
                Some((offset, Err(err)))
            }
        }
    }
}

impl SegmentScan<'_> {
    fn read_record(&self, offset: u64) -> Result<(Entry, u64)> {
        if self.end - offset < HEADER_SIZE as u64 {
            return Err(Error::invalid_record("truncated header at segment tail"));
        }

        let header = self.segment.read_at(offset, HEADER_SIZE)?;
        let key_size = u64::from(u32::from_le_bytes(header[12..16].try_into().unwrap()));
        let value_size = u64::from(u32::from_le_bytes(header[16..20].try_into().unwrap()));
        let bucket_size = u64::from(u32::from_le_bytes(header[26..30].try_into().unwrap()));
        let total = HEADER_SIZE as u64 + bucket_size + key_size + value_size;

        if offset + total > self.end {
            return Err(Error::invalid_record("truncated body at segment tail"));
        }

        let bytes = self.segment.read_at(offset, total as usize)?;
        let (entry, _) = Entry::decode(&bytes, 0)?;
        Ok((entry, offset + total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Flag;
    use loamdb_storage::InMemoryBackend;

    fn mem_segment(max_size: u64) -> SegmentFile {
        SegmentFile::from_backend(Box::new(InMemoryBackend::new()), 1, max_size, true).unwrap()
    }

    fn entry(key: &[u8], value: &[u8]) -> Entry {
        Entry::put(b"b".to_vec(), key.to_vec(), value.to_vec(), 100, 0)
    }

    #[test]
    fn append_then_read_back() {
        let segment = mem_segment(1024);
        let e = entry(b"k", b"v");
        let encoded = e.encode();

        let offset = segment.append(&encoded).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(segment.len(), encoded.len() as u64);

        let read = segment.read_entry(offset, encoded.len() as u32).unwrap();
        assert_eq!(read, e);
    }

    #[test]
    fn append_exactly_to_limit_succeeds() {
        let e = entry(b"key", b"value");
        let encoded = e.encode();
        let segment = mem_segment(encoded.len() as u64);

        segment.append(&encoded).unwrap();
        assert_eq!(segment.remaining(), 0);

        // One more byte of anything rolls over
        let err = segment.append(&[0]).unwrap_err();
        assert!(matches!(err, Error::WouldExceedLimit { .. }));
    }

    #[test]
    fn sealed_rejects_appends() {
        let segment = mem_segment(1024);
        segment.seal();
        assert!(segment.is_sealed());

        let err = segment.append(b"x").unwrap_err();
        assert!(matches!(err, Error::WouldExceedLimit { remaining: 0, .. }));
    }

    #[test]
    fn scan_yields_records_in_order() {
        let segment = mem_segment(4096);
        let entries: Vec<Entry> = (0..5u8)
            .map(|i| entry(format!("k{i}").as_bytes(), &[i]))
            .collect();
        for e in &entries {
            segment.append(&e.encode()).unwrap();
        }

        let scanned: Vec<Entry> = segment.scan().map(|(_, r)| r.unwrap()).collect();
        assert_eq!(scanned, entries);
    }

    #[test]
    fn scan_stops_at_corrupt_record() {
        let good = entry(b"good", b"v");
        let bad = entry(b"bad", b"v");
        let mut bytes = good.encode();
        let cut = bytes.len() as u64;
        let mut corrupted = bad.encode();
        corrupted[HEADER_SIZE + 1] ^= 0xFF;
        bytes.extend_from_slice(&corrupted);

        let segment =
            SegmentFile::from_backend(Box::new(InMemoryBackend::with_data(bytes)), 1, 4096, true)
                .unwrap();

        let mut scan = segment.scan();
        let (off0, first) = scan.next().unwrap();
        assert_eq!(off0, 0);
        assert_eq!(first.unwrap().flag, Flag::Put);

        let (off1, second) = scan.next().unwrap();
        assert_eq!(off1, cut);
        assert!(second.unwrap_err().is_corruption());

        assert!(scan.next().is_none());
    }

    #[test]
    fn scan_reports_truncated_tail() {
        let e = entry(b"k", b"a longer value to truncate");
        let mut bytes = e.encode();
        bytes.truncate(bytes.len() - 3);

        let segment =
            SegmentFile::from_backend(Box::new(InMemoryBackend::with_data(bytes)), 1, 4096, true)
                .unwrap();

        let (offset, result) = segment.scan().next().unwrap();
        assert_eq!(offset, 0);
        assert!(matches!(result.unwrap_err(), Error::InvalidRecord { .. }));
    }

    #[test]
    fn truncate_drops_tail_records() {
        let segment = mem_segment(4096);
        let first = entry(b"a", b"1");
        let keep = segment.append(&first.encode()).unwrap();
        let cut = segment.len();
        segment.append(&entry(b"b", b"2").encode()).unwrap();

        segment.truncate(cut).unwrap();
        assert_eq!(segment.len(), cut);

        let scanned: Vec<Entry> = segment.scan().map(|(_, r)| r.unwrap()).collect();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].key, b"a");
        assert_eq!(keep, 0);
    }
}
