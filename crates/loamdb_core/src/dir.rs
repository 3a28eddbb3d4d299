//! Database directory management.
//!
//! Layout of a database directory:
//!
//! ```text
//! <db_path>/
//! ├─ LOCK                      # advisory lock, single process
//! ├─ MANIFEST                  # pinned metadata (segment size)
//! ├─ 00000000000000000001.seg  # sealed segment
//! └─ 00000000000000000002.seg  # active segment (highest id)
//! ```
//!
//! Segment files are named by their zero-padded 64-bit id, so a plain
//! lexicographic listing yields them in id order.

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TEMP: &str = "MANIFEST.tmp";
const SEGMENT_EXT: &str = "seg";

/// Returns the file name of the segment with `id`.
#[must_use]
pub fn segment_file_name(id: u64) -> String {
    format!("{id:020}.{SEGMENT_EXT}")
}

/// Writes a manifest into `dir_path` atomically (temp file, sync, rename,
/// directory sync). Also used by backup to stamp the copied directory.
pub(crate) fn write_manifest(dir_path: &Path, manifest: &Manifest) -> Result<()> {
    let temp_path = dir_path.join(MANIFEST_TEMP);
    let mut file = File::create(&temp_path)?;
    file.write_all(&manifest.encode())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, dir_path.join(MANIFEST_FILE))?;
    sync_dir_path(dir_path)
}

/// Fsyncs a directory so file creations, renames, and deletions survive a
/// crash.
#[cfg(unix)]
pub(crate) fn sync_dir_path(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// NTFS journals metadata operations, so no explicit directory sync.
#[cfg(not(unix))]
pub(crate) fn sync_dir_path(_path: &Path) -> Result<()> {
    Ok(())
}

/// An opened database directory, held under an exclusive advisory lock.
#[derive(Debug)]
pub struct DbDir {
    path: PathBuf,
    _lock_file: File,
}

impl DbDir {
    /// Opens or creates the database directory and takes its lock.
    ///
    /// Fails with `DatabaseLocked` when another process holds the lock and
    /// with `InvalidFormat` when the directory is missing and
    /// `create_if_missing` is false.
    pub fn open(path: &Path, create_if_missing: bool) -> Result<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(Error::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(Error::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the segment file with `id`.
    #[must_use]
    pub fn segment_path(&self, id: u64) -> PathBuf {
        self.path.join(segment_file_name(id))
    }

    /// Lists the ids of all segment files in the directory, ascending.
    pub fn list_segment_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for dirent in fs::read_dir(&self.path)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{SEGMENT_EXT}")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<u64>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Loads the manifest, or `None` for a freshly created database.
    pub fn load_manifest(&self) -> Result<Option<Manifest>> {
        let manifest_path = self.path.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(None);
        }
        let mut data = Vec::new();
        File::open(&manifest_path)?.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Manifest::decode(&data)?))
    }

    /// Saves the manifest atomically: write a temp file, sync it, rename
    /// over the old manifest, sync the directory.
    pub fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        write_manifest(&self.path, manifest)
    }

    /// Deletes the segment file with `id` and syncs the directory.
    pub fn remove_segment_file(&self, id: u64) -> Result<()> {
        let segment_path = self.segment_path(id);
        if segment_path.exists() {
            fs::remove_file(&segment_path)?;
            self.sync_dir()?;
        }
        Ok(())
    }

    /// Fsyncs the directory so file creations, renames, and deletions
    /// survive a crash.
    pub fn sync_dir(&self) -> Result<()> {
        sync_dir_path(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("db");

        let dir = DbDir::open(&db_path, true).unwrap();
        assert!(db_path.is_dir());
        drop(dir);
    }

    #[test]
    fn open_without_create_fails_on_missing() {
        let temp = tempdir().unwrap();
        let result = DbDir::open(&temp.path().join("missing"), false);
        assert!(matches!(result, Err(Error::InvalidFormat { .. })));
    }

    #[test]
    fn second_open_is_locked_out() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("db");

        let _held = DbDir::open(&db_path, true).unwrap();
        assert!(matches!(
            DbDir::open(&db_path, true),
            Err(Error::DatabaseLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("db");
        {
            let _dir = DbDir::open(&db_path, true).unwrap();
        }
        assert!(DbDir::open(&db_path, true).is_ok());
    }

    #[test]
    fn segment_names_sort_lexicographically() {
        assert_eq!(segment_file_name(1), "00000000000000000001.seg");
        assert!(segment_file_name(9) < segment_file_name(10));
        assert!(segment_file_name(99) < segment_file_name(100));
    }

    #[test]
    fn list_segment_ids_ignores_other_files() {
        let temp = tempdir().unwrap();
        let dir = DbDir::open(temp.path(), true).unwrap();

        for id in [3u64, 1, 2] {
            fs::write(dir.segment_path(id), b"").unwrap();
        }
        fs::write(temp.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(dir.list_segment_ids().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn manifest_roundtrip_through_disk() {
        let temp = tempdir().unwrap();
        let dir = DbDir::open(temp.path(), true).unwrap();

        assert!(dir.load_manifest().unwrap().is_none());

        let manifest = Manifest::new(8192);
        dir.save_manifest(&manifest).unwrap();
        assert_eq!(dir.load_manifest().unwrap(), Some(manifest));
    }

    #[test]
    fn remove_segment_file_is_idempotent() {
        let temp = tempdir().unwrap();
        let dir = DbDir::open(temp.path(), true).unwrap();

        fs::write(dir.segment_path(1), b"").unwrap();
        dir.remove_segment_file(1).unwrap();
        assert!(!dir.segment_path(1).exists());
        dir.remove_segment_file(1).unwrap();
    }
}
