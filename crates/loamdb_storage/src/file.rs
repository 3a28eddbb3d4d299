//! File-backed storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A storage backend over an OS file.
///
/// The size is cached in memory so bounds checks never hit the file system.
/// Internal locking makes concurrent positional reads safe while a single
/// writer appends.
///
/// # Example
///
/// ```no_run
/// use loamdb_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("000.seg")).unwrap();
/// backend.append(b"bytes").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens the file at `path`, creating it if absent.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadOutOfBounds { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.write();
        let mut size = self.size.write();

        let offset = *size;
        if data.is_empty() {
            return Ok(offset);
        }
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        *size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.write().flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.write().sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();

        if new_size > *size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: *size,
            });
        }
        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.seg");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn append_returns_prior_size() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("a.seg")).unwrap();

        assert_eq!(backend.append(b"first").unwrap(), 0);
        assert_eq!(backend.append(b"second").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
    }

    #[test]
    fn read_at_slices() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("a.seg")).unwrap();
        backend.append(b"hello world").unwrap();

        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
        assert!(backend.read_at(2, 0).unwrap().is_empty());
    }

    #[test]
    fn read_past_end_rejected() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("a.seg")).unwrap();
        backend.append(b"short").unwrap();

        let err = backend.read_at(3, 10).unwrap_err();
        assert!(matches!(err, StorageError::ReadOutOfBounds { .. }));
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.seg");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"durable").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 7);
        assert_eq!(backend.read_at(0, 7).unwrap(), b"durable");
    }

    #[test]
    fn truncate_cuts_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.seg");
        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"keep+drop").unwrap();

        backend.truncate(4).unwrap();
        assert_eq!(backend.size().unwrap(), 4);
        assert_eq!(backend.read_at(0, 4).unwrap(), b"keep");

        let err = backend.truncate(100).unwrap_err();
        assert!(matches!(err, StorageError::TruncateBeyondEnd { .. }));
    }

}
