//! Transactions.
//!
//! Write transactions are serialized by an exclusive writer lock acquired
//! at `begin` and held until commit or rollback. Read transactions take an
//! O(1) snapshot of the database state (index root plus segment handles)
//! and never block the writer; a snapshot observes either all of a
//! concurrent commit or none of it, because commits publish a new state
//! root in one swap after the durability barrier.

use crate::database::{unix_now, Db, DbState};
use crate::error::{Error, Result};
use crate::index::IndexEntry;
use crate::record::{Entry, HEADER_SIZE};
use bytes::Bytes;
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting operations.
    Active,
    /// Writer committed successfully.
    Committed,
    /// Buffer discarded, locks released.
    RolledBack,
    /// Reader released its snapshot.
    Closed,
}

/// A buffered, not-yet-committed mutation.
#[derive(Debug, Clone)]
enum Pending {
    Put { value: Vec<u8>, ttl: u32 },
    Delete,
}

/// A transaction handle.
///
/// Obtained from [`Db::begin`](crate::Db::begin) or the
/// [`view`](crate::Db::view)/[`update`](crate::Db::update) wrappers.
/// Dropping an active handle rolls it back.
pub struct Tx<'db> {
    db: &'db Db,
    snapshot: Arc<DbState>,
    writable: bool,
    writer_guard: Option<MutexGuard<'db, ()>>,
    pending: BTreeMap<(Vec<u8>, Vec<u8>), Pending>,
    state: TxState,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(db: &'db Db, writable: bool) -> Self {
        // Writers take the lock first so the snapshot includes every
        // previously committed transaction.
        let writer_guard = writable.then(|| db.write_lock.lock());
        let snapshot = db.current_state();
        Self {
            db,
            snapshot,
            writable,
            writer_guard,
            pending: BTreeMap::new(),
            state: TxState::Active,
        }
    }

    /// Returns the transaction state.
    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    /// True for write transactions.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(Error::TransactionClosed)
        }
    }

    /// Returns the value for (bucket, key) as of this transaction's view.
    ///
    /// A writer's own buffered mutations shadow the snapshot. Returns
    /// `NotFound` for absent keys and `Expired` when the located entry's
    /// TTL has elapsed.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_active()?;

        if self.writable {
            if let Some(pending) = self.pending.get(&(bucket.to_vec(), key.to_vec())) {
                return match pending {
                    Pending::Put { value, .. } => Ok(value.clone()),
                    Pending::Delete => Err(Error::NotFound),
                };
            }
        }

        let entry = self.snapshot.index.get(bucket, key).ok_or(Error::NotFound)?;
        if entry.is_expired_at(unix_now()) {
            return Err(Error::Expired);
        }
        self.load_value(entry)
    }

    /// Buffers a put of (bucket, key) -> value with the given TTL.
    pub fn put(&mut self, bucket: &[u8], key: &[u8], value: &[u8], ttl: u32) -> Result<()> {
        self.ensure_active()?;
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if bucket.is_empty() {
            return Err(Error::invalid_argument("bucket must not be empty"));
        }
        if key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        let encoded = HEADER_SIZE as u64 + (bucket.len() + key.len() + value.len()) as u64;
        if encoded > self.db.options.segment_size {
            return Err(Error::invalid_argument(format!(
                "record of {encoded} bytes exceeds segment size {}",
                self.db.options.segment_size
            )));
        }

        self.pending.insert(
            (bucket.to_vec(), key.to_vec()),
            Pending::Put {
                value: value.to_vec(),
                ttl,
            },
        );
        Ok(())
    }

    /// Buffers a delete of (bucket, key).
    ///
    /// Fails with `NotFound` when no entry is visible to this transaction.
    pub fn delete(&mut self, bucket: &[u8], key: &[u8]) -> Result<()> {
        self.ensure_active()?;
        if !self.writable {
            return Err(Error::ReadOnly);
        }

        let pair = (bucket.to_vec(), key.to_vec());
        let visible = match self.pending.get(&pair) {
            Some(Pending::Put { .. }) => true,
            Some(Pending::Delete) => false,
            None => self
                .snapshot
                .index
                .get(bucket, key)
                .is_some_and(|e| !e.is_expired_at(unix_now())),
        };
        if !visible {
            return Err(Error::NotFound);
        }

        self.pending.insert(pair, Pending::Delete);
        Ok(())
    }

    /// Returns up to `limit` (key, value) pairs whose keys start with
    /// `prefix`, in ascending key order, merged with the write buffer.
    pub fn prefix_scan(
        &self,
        bucket: &[u8],
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_active()?;
        let now = unix_now();
        let hits = self
            .snapshot
            .index
            .prefix_scan(bucket, prefix, usize::MAX, now);
        self.materialize(bucket, hits, |key| key.starts_with(prefix), limit)
    }

    /// Returns all (key, value) pairs with `start <= key <= end`, in
    /// ascending key order, merged with the write buffer.
    pub fn range_scan(
        &self,
        bucket: &[u8],
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_active()?;
        let now = unix_now();
        let hits = self.snapshot.index.range_scan(bucket, start, end, now);
        self.materialize(
            bucket,
            hits,
            |key| start <= key && key <= end,
            usize::MAX,
        )
    }

    /// Overlays the write buffer on snapshot hits and loads values.
    fn materialize(
        &self,
        bucket: &[u8],
        hits: Vec<(Vec<u8>, IndexEntry)>,
        in_range: impl Fn(&[u8]) -> bool,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        enum Source {
            Located(IndexEntry),
            Buffered(Vec<u8>),
        }

        let mut merged: BTreeMap<Vec<u8>, Source> = hits
            .into_iter()
            .map(|(key, entry)| (key, Source::Located(entry)))
            .collect();

        if self.writable {
            for ((pending_bucket, key), pending) in &self.pending {
                if pending_bucket != bucket || !in_range(key) {
                    continue;
                }
                match pending {
                    Pending::Put { value, .. } => {
                        merged.insert(key.clone(), Source::Buffered(value.clone()));
                    }
                    Pending::Delete => {
                        merged.remove(key);
                    }
                }
            }
        }

        merged
            .into_iter()
            .take(limit)
            .map(|(key, source)| {
                let value = match source {
                    Source::Buffered(value) => value,
                    Source::Located(entry) => self.load_value(&entry)?,
                };
                Ok((key, value))
            })
            .collect()
    }

    /// Fetches an entry's value: from the index cache in RAM mode, from
    /// the segment in mapped mode.
    fn load_value(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        if let Some(cached) = &entry.value {
            return Ok(cached.to_vec());
        }
        let segment = self
            .snapshot
            .segments
            .get(entry.segment_id)
            .ok_or_else(|| {
                Error::invalid_format(format!("segment {} missing from snapshot", entry.segment_id))
            })?;
        let record = segment.read_entry(entry.offset, entry.size)?;
        Ok(record.value)
    }

    /// Commits the transaction.
    ///
    /// Writers append all buffered records to the log, issue the
    /// durability barrier, then publish the index update; readers just
    /// release their snapshot. Any failure rolls the transaction back and
    /// surfaces as `CommitFailed`.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;

        if !self.writable {
            self.state = TxState::Closed;
            return Ok(());
        }
        if self.pending.is_empty() {
            self.finish(TxState::Committed);
            return Ok(());
        }

        match self.commit_writes() {
            Ok(()) => {
                self.finish(TxState::Committed);
                Ok(())
            }
            Err(err) => {
                self.finish(TxState::RolledBack);
                Err(Error::commit_failed(err.to_string()))
            }
        }
    }

    fn commit_writes(&mut self) -> Result<()> {
        let timestamp = self.db.commit_timestamp();

        // The writer lock has been held since begin, so the current state
        // is exactly this transaction's snapshot plus nothing.
        let current = self.db.current_state();
        let mut segments = current.segments.clone();
        let mut index = current.index.clone();

        let mut synced: Vec<Arc<crate::segment::SegmentFile>> = Vec::new();
        // (bucket, key, locator, put value); a `None` value is a delete.
        type Staged<'a> = (&'a [u8], &'a [u8], IndexEntry, Option<&'a [u8]>);
        let mut staged: Vec<Staged<'_>> = Vec::new();

        for ((bucket, key), pending) in &self.pending {
            let entry = match pending {
                Pending::Put { value, ttl } => {
                    Entry::put(bucket.clone(), key.clone(), value.clone(), timestamp, *ttl)
                }
                Pending::Delete => Entry::delete(bucket.clone(), key.clone(), timestamp),
            };
            let encoded = entry.encode();

            // Append, rolling the active segment over when it would
            // overflow. An exact fit is an ordinary append.
            let (segment, offset) = loop {
                let active = segments
                    .active()
                    .ok_or_else(|| Error::invalid_format("no active segment"))?
                    .clone();
                match active.append(&encoded) {
                    Ok(offset) => break (active, offset),
                    Err(Error::WouldExceedLimit { .. }) => {
                        active.seal();
                        let id = self.db.allocate_segment_id();
                        let fresh = self.db.create_segment(id)?;
                        tracing::debug!(sealed = active.id(), active = id, "segment rollover");
                        segments.insert(fresh);
                    }
                    Err(err) => return Err(err),
                }
            };

            if !synced.iter().any(|s| Arc::ptr_eq(s, &segment)) {
                synced.push(Arc::clone(&segment));
            }

            let locator = IndexEntry {
                segment_id: segment.id(),
                offset,
                size: encoded.len() as u32,
                timestamp,
                ttl: match pending {
                    Pending::Put { ttl, .. } => *ttl,
                    Pending::Delete => 0,
                },
                value: None,
            };
            let put_value = match pending {
                Pending::Put { value, .. } => Some(value.as_slice()),
                Pending::Delete => None,
            };
            staged.push((bucket.as_slice(), key.as_slice(), locator, put_value));
        }

        // Durability barrier: nothing becomes visible unless it survives
        // a crash.
        if self.db.options.sync_enable {
            for segment in &synced {
                segment.sync()?;
            }
        }

        // Apply the buffer to the index and publish the new root. This is
        // purely in-memory and cannot fail.
        for (bucket, key, mut locator, put_value) in staged {
            match put_value {
                Some(value) => {
                    if self.db.caches_values() {
                        locator.value = Some(Bytes::copy_from_slice(value));
                    }
                    index.put(bucket, key.to_vec(), locator);
                }
                None => index.remove(bucket, key),
            }
        }
        let committed_len = segments.active().map_or(0, |s| s.len());
        segments.set_active_committed_len(committed_len);
        self.db.publish(DbState { index, segments });
        Ok(())
    }

    /// Discards the buffer and releases locks. Idempotent.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Ok(());
        }
        self.pending.clear();
        self.finish(TxState::RolledBack);
        Ok(())
    }

    fn finish(&mut self, state: TxState) {
        self.state = state;
        self.writer_guard = None;
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        // A handle discarded while active counts as rolled back.
        if self.state == TxState::Active {
            let _ = self.rollback();
        }
    }
}

impl std::fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("writable", &self.writable)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}
