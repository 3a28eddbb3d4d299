//! Database facade, recovery, merge, and backup.

use crate::config::{IndexMode, Options};
use crate::dir::{segment_file_name, sync_dir_path, write_manifest, DbDir};
use crate::error::{Error, Result};
use crate::index::{Index, IndexEntry};
use crate::manifest::Manifest;
use crate::record::{Entry, Flag, HEADER_SIZE};
use crate::segment::{SegmentFile, SegmentSet};
use crate::transaction::Tx;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const COPY_CHUNK: u64 = 64 * 1024;

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The copy-on-write root of the database: the index plus the segment set.
///
/// Commits and merge build a new `DbState` and publish it in one swap, so
/// a reader's `Arc<DbState>` is a stable snapshot for its whole lifetime.
#[derive(Debug, Clone)]
pub(crate) struct DbState {
    pub(crate) index: Index,
    pub(crate) segments: SegmentSet,
}

/// Statistics returned by [`Db::merge`].
#[derive(Debug, Clone, Default)]
pub struct MergeStats {
    /// Segments retired and unlinked.
    pub segments_retired: usize,
    /// Segments written, including the new active segment.
    pub segments_created: usize,
    /// Live records carried into the new segments.
    pub live_records: usize,
    /// Index entries dropped because their TTL elapsed.
    pub expired_dropped: usize,
    /// Bytes of segment data reclaimed.
    pub bytes_reclaimed: u64,
}

/// An open database.
///
/// `Db` is thread-safe: any number of read transactions run concurrently
/// with each other and with the single writer. Share it between threads
/// behind an `Arc` or borrow it from a scope.
///
/// # Example
///
/// ```no_run
/// use loamdb_core::{Db, Options};
/// use std::path::Path;
///
/// let db = Db::open(Path::new("my.db"), Options::default())?;
/// db.update(|tx| tx.put(b"users", b"alice", b"42", 0))?;
/// let value = db.view(|tx| tx.get(b"users", b"alice"))?;
/// assert_eq!(value, b"42");
/// # Ok::<(), loamdb_core::Error>(())
/// ```
pub struct Db {
    pub(crate) dir: DbDir,
    pub(crate) options: Options,
    pub(crate) state: RwLock<Arc<DbState>>,
    pub(crate) write_lock: Mutex<()>,
    next_segment_id: AtomicU64,
    last_commit_ts: AtomicU64,
    open: AtomicBool,
}

impl Db {
    /// Opens the database at `path`, running recovery.
    ///
    /// The segment size is pinned by the manifest at first open; reopening
    /// with a different `segment_size` fails.
    pub fn open(path: &Path, options: Options) -> Result<Self> {
        let min_segment = HEADER_SIZE as u64 + 2;
        if options.segment_size < min_segment {
            return Err(Error::invalid_argument(format!(
                "segment size must be at least {min_segment} bytes"
            )));
        }

        let dir = DbDir::open(path, options.create_if_missing)?;
        match dir.load_manifest()? {
            Some(manifest) if manifest.segment_size != options.segment_size => {
                return Err(Error::invalid_argument(format!(
                    "segment size {} does not match the database's {}",
                    options.segment_size, manifest.segment_size
                )));
            }
            Some(_) => {}
            None => dir.save_manifest(&Manifest::new(options.segment_size))?,
        }

        let (state, next_segment_id, max_timestamp) = recover(&dir, &options)?;
        info!(
            path = %path.display(),
            segments = state.segments.len(),
            entries = state.index.entry_count(),
            "database opened"
        );

        Ok(Self {
            dir,
            options,
            state: RwLock::new(Arc::new(state)),
            write_lock: Mutex::new(()),
            next_segment_id: AtomicU64::new(next_segment_id),
            last_commit_ts: AtomicU64::new(max_timestamp),
            open: AtomicBool::new(true),
        })
    }

    /// Begins a transaction.
    ///
    /// With `writable` true this blocks until the exclusive writer lock is
    /// available; with false it takes a snapshot and returns immediately.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        self.ensure_open()?;
        Ok(Tx::new(self, writable))
    }

    /// Runs `f` inside a read transaction.
    ///
    /// The snapshot is released on return; an error from `f` rolls back
    /// and propagates.
    pub fn view<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(false)?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback()?;
                Err(err)
            }
        }
    }

    /// Runs `f` inside a write transaction, committing on `Ok` and rolling
    /// back on `Err`.
    pub fn update<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(true)?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback()?;
                Err(err)
            }
        }
    }

    /// Rewrites live records into fresh segments and retires every old
    /// one, reclaiming the space held by superseded, deleted, and expired
    /// records.
    ///
    /// Runs under the writer lock. Snapshots taken before the merge keep
    /// reading the retired files through their own handles.
    pub fn merge(&self) -> Result<MergeStats> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        let current = self.current_state();

        let old_ids = current.segments.ids();
        let before_bytes = current.segments.total_len();
        if before_bytes == 0 {
            return Ok(MergeStats::default());
        }

        let now = unix_now();

        // Live records, straight from the index in (bucket, key) order.
        // Each is re-read and validated before it is carried forward.
        let mut live: Vec<(Vec<u8>, Vec<u8>, Vec<u8>, IndexEntry)> = Vec::new();
        let mut expired_dropped = 0usize;
        for (bucket, key, entry) in current.index.iter() {
            if entry.is_expired_at(now) {
                expired_dropped += 1;
                continue;
            }
            let segment = current.segments.get(entry.segment_id).ok_or_else(|| {
                Error::invalid_format(format!("segment {} missing from index", entry.segment_id))
            })?;
            let bytes = segment.read_at(entry.offset, entry.size as usize)?;
            Entry::decode(&bytes, 0)?;
            live.push((bucket.to_vec(), key.to_vec(), bytes, entry.clone()));
        }
        let live_records = live.len();

        // Rewrite into fresh sealed segments with ids above every old id.
        let mut new_segments: BTreeMap<u64, Arc<SegmentFile>> = BTreeMap::new();
        let mut index = Index::new();
        let mut out: Option<Arc<SegmentFile>> = None;
        for (bucket, key, bytes, mut entry) in live {
            loop {
                let target = match &out {
                    Some(segment) => Arc::clone(segment),
                    None => {
                        let id = self.allocate_segment_id();
                        let fresh = self.create_segment(id)?;
                        new_segments.insert(id, Arc::clone(&fresh));
                        out = Some(Arc::clone(&fresh));
                        fresh
                    }
                };
                match target.append(&bytes) {
                    Ok(offset) => {
                        entry.segment_id = target.id();
                        entry.offset = offset;
                        index.put(&bucket, key, entry);
                        break;
                    }
                    Err(Error::WouldExceedLimit { .. }) if !target.is_empty() => {
                        out = None;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Everything rewritten is synced before any old file is retired.
        for segment in new_segments.values() {
            segment.sync()?;
            segment.seal();
        }

        // The empty active segment is allocated last so it carries the
        // highest id.
        let active_id = self.allocate_segment_id();
        let active = self.create_segment(active_id)?;
        new_segments.insert(active_id, active);
        self.dir.sync_dir()?;

        let segments = SegmentSet::new(new_segments);
        let after_bytes = segments.total_len();
        let segments_created = segments.len();
        self.publish(DbState { index, segments });

        // Unlink ascending: if we crash part-way, the surviving suffix
        // still replays deletes and overwrites after the puts they mask.
        for id in &old_ids {
            self.dir.remove_segment_file(*id)?;
        }

        let stats = MergeStats {
            segments_retired: old_ids.len(),
            segments_created,
            live_records,
            expired_dropped,
            bytes_reclaimed: before_bytes.saturating_sub(after_bytes),
        };
        info!(
            retired = stats.segments_retired,
            live = stats.live_records,
            reclaimed = stats.bytes_reclaimed,
            "merge finished"
        );
        Ok(stats)
    }

    /// Writes a consistent copy of the database into `target`.
    ///
    /// The copy equals the database as of the moment the snapshot was
    /// taken: sealed segments are copied whole, the active segment up to
    /// its committed length. Readers and the writer are never blocked.
    /// The target directory opens as a normal database afterwards.
    pub fn backup(&self, target: &Path) -> Result<()> {
        self.ensure_open()?;
        let snapshot = self.current_state();
        fs::create_dir_all(target)?;

        let mut copied_bytes = 0u64;
        for segment in snapshot.segments.iter() {
            let limit = if segment.id() == snapshot.segments.active_id() {
                snapshot.segments.active_committed_len()
            } else {
                segment.len()
            };

            let mut out = File::create(target.join(segment_file_name(segment.id())))?;
            let mut offset = 0u64;
            while offset < limit {
                let chunk = (limit - offset).min(COPY_CHUNK) as usize;
                let bytes = segment.read_at(offset, chunk)?;
                out.write_all(&bytes)?;
                offset += chunk as u64;
            }
            out.sync_all()?;
            copied_bytes += limit;
        }

        write_manifest(target, &Manifest::new(self.options.segment_size))?;
        sync_dir_path(target)?;

        info!(
            target = %target.display(),
            segments = snapshot.segments.len(),
            bytes = copied_bytes,
            "backup finished"
        );
        Ok(())
    }

    /// Closes the database: waits for an in-flight commit, syncs the
    /// active segment, and rejects further transactions.
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let state = self.current_state();
        if let Some(active) = state.segments.active() {
            active.sync()?;
        }
        Ok(())
    }

    /// True until [`close`](Self::close) is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The options this handle was opened with.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Number of live entries across all buckets.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.current_state().index.entry_count()
    }

    /// Total bytes across all segment files.
    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.current_state().segments.total_len()
    }

    /// Number of segment files.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.current_state().segments.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::DatabaseClosed)
        }
    }

    pub(crate) fn current_state(&self) -> Arc<DbState> {
        Arc::clone(&self.state.read())
    }

    pub(crate) fn publish(&self, state: DbState) {
        *self.state.write() = Arc::new(state);
    }

    pub(crate) fn allocate_segment_id(&self) -> u64 {
        self.next_segment_id.fetch_add(1, Ordering::SeqCst)
    }

    /// One non-decreasing timestamp per commit, shared by every record in
    /// it. Shields record ordering from a clock stepping backwards.
    pub(crate) fn commit_timestamp(&self) -> u64 {
        let now = unix_now();
        let prev = self.last_commit_ts.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }

    pub(crate) fn caches_values(&self) -> bool {
        self.options.index_mode == IndexMode::Ram
    }

    pub(crate) fn create_segment(&self, id: u64) -> Result<Arc<SegmentFile>> {
        create_segment_at(&self.dir, id, self.options.segment_size)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.dir.path())
            .field("is_open", &self.is_open())
            .field("segments", &self.segment_count())
            .field("entries", &self.entry_count())
            .finish_non_exhaustive()
    }
}

fn create_segment_at(dir: &DbDir, id: u64, max_size: u64) -> Result<Arc<SegmentFile>> {
    let segment = SegmentFile::open(&dir.segment_path(id), id, max_size, true)?;
    dir.sync_dir()?;
    Ok(Arc::new(segment))
}

/// Rebuilds the index by scanning every segment in id order.
///
/// Returns the recovered state, the next segment id, and the highest
/// record timestamp seen.
fn recover(dir: &DbDir, options: &Options) -> Result<(DbState, u64, u64)> {
    let ids = dir.list_segment_ids()?;
    if ids.is_empty() {
        let first = create_segment_at(dir, 1, options.segment_size)?;
        let segments = SegmentSet::new(BTreeMap::from([(1, first)]));
        return Ok((
            DbState {
                index: Index::new(),
                segments,
            },
            2,
            0,
        ));
    }

    let highest = ids.last().copied().unwrap_or(0);
    let now = unix_now();
    let mut segments: BTreeMap<u64, Arc<SegmentFile>> = BTreeMap::new();
    let mut index = Index::new();
    let mut max_timestamp = 0u64;

    for &id in &ids {
        let writable = id == highest;
        let segment = Arc::new(SegmentFile::open(
            &dir.segment_path(id),
            id,
            options.segment_size,
            writable,
        )?);

        let mut corrupt_at = None;
        for (offset, outcome) in segment.scan() {
            let entry = match outcome {
                Ok(entry) => entry,
                Err(err) => {
                    // Corruption invalidates this offset and everything
                    // after it within the segment, nothing before it.
                    corrupt_at = Some(offset);
                    warn!(segment = id, offset, error = %err, "corrupt record, truncating segment");
                    break;
                }
            };

            max_timestamp = max_timestamp.max(entry.timestamp);
            let size = entry.encoded_size() as u32;
            let expired = entry.is_expired_at(now);
            let Entry {
                bucket,
                key,
                value,
                timestamp,
                ttl,
                flag,
            } = entry;

            match flag {
                Flag::Put if !expired => {
                    let cached = (options.index_mode == IndexMode::Ram)
                        .then(|| Bytes::from(value));
                    index.put(
                        &bucket,
                        key,
                        IndexEntry {
                            segment_id: id,
                            offset,
                            size,
                            timestamp,
                            ttl,
                            value: cached,
                        },
                    );
                }
                // An expired put still supersedes whatever came before it,
                // and a delete always does.
                Flag::Put | Flag::Delete => index.remove(&bucket, &key),
            }
        }

        if let Some(offset) = corrupt_at {
            segment.truncate(offset)?;
            if id != highest {
                warn!(
                    segment = id,
                    "recoverable corruption in sealed segment, newer segments still scanned"
                );
            }
        }

        segments.insert(id, segment);
    }

    Ok((
        DbState {
            index,
            segments: SegmentSet::new(segments),
        },
        highest + 1,
        max_timestamp,
    ))
}
