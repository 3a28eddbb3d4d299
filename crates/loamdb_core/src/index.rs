//! In-memory ordered index over live records.
//!
//! The index maps (bucket, key) to the location of the latest Put record
//! whose TTL has not elapsed. Keys within a bucket are ordered by raw byte
//! comparison, which gives point lookups, prefix scans, and range scans in
//! key order.
//!
//! Buckets are held behind `Arc` so the whole index clones in O(number of
//! buckets). The committing writer mutates its clone through
//! [`Arc::make_mut`], deep-copying only the buckets a commit touches;
//! readers keep their snapshot untouched.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound::{Included, Unbounded};
use std::sync::Arc;

/// Locator for the latest record of a (bucket, key) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Segment holding the record.
    pub segment_id: u64,
    /// Byte offset of the record within the segment.
    pub offset: u64,
    /// Encoded size of the record.
    pub size: u32,
    /// Commit timestamp, seconds since the Unix epoch.
    pub timestamp: u64,
    /// Time to live in seconds; 0 means persistent.
    pub ttl: u32,
    /// Value bytes, cached in RAM mode; `None` in mapped mode.
    pub value: Option<Bytes>,
}

impl IndexEntry {
    /// True once wall-clock time has reached `timestamp + ttl`.
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.ttl > 0 && now >= self.timestamp.saturating_add(u64::from(self.ttl))
    }
}

type BucketMap = BTreeMap<Vec<u8>, IndexEntry>;

/// Ordered index over all live entries, grouped by bucket.
#[derive(Debug, Clone, Default)]
pub struct Index {
    buckets: BTreeMap<Vec<u8>, Arc<BucketMap>>,
}

impl Index {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point lookup. Returns expired entries too; callers classify them.
    #[must_use]
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Option<&IndexEntry> {
        self.buckets.get(bucket)?.get(key)
    }

    /// Inserts or replaces the entry for (bucket, key).
    pub fn put(&mut self, bucket: &[u8], key: Vec<u8>, entry: IndexEntry) {
        let map = self
            .buckets
            .entry(bucket.to_vec())
            .or_insert_with(|| Arc::new(BTreeMap::new()));
        Arc::make_mut(map).insert(key, entry);
    }

    /// Removes the entry for (bucket, key), dropping the bucket if it
    /// becomes empty.
    pub fn remove(&mut self, bucket: &[u8], key: &[u8]) {
        let Some(map) = self.buckets.get_mut(bucket) else {
            return;
        };
        let inner = Arc::make_mut(map);
        inner.remove(key);
        if inner.is_empty() {
            self.buckets.remove(bucket);
        }
    }

    /// Returns up to `limit` non-expired entries whose keys start with
    /// `prefix`, in ascending key order.
    #[must_use]
    pub fn prefix_scan(
        &self,
        bucket: &[u8],
        prefix: &[u8],
        limit: usize,
        now: u64,
    ) -> Vec<(Vec<u8>, IndexEntry)> {
        let Some(map) = self.buckets.get(bucket) else {
            return Vec::new();
        };
        map.range::<[u8], _>((Included(prefix), Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .take(limit)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Returns all non-expired entries with `start <= key <= end`, in
    /// ascending key order.
    #[must_use]
    pub fn range_scan(
        &self,
        bucket: &[u8],
        start: &[u8],
        end: &[u8],
        now: u64,
    ) -> Vec<(Vec<u8>, IndexEntry)> {
        if start > end {
            return Vec::new();
        }
        let Some(map) = self.buckets.get(bucket) else {
            return Vec::new();
        };
        map.range::<[u8], _>((Included(start), Included(end)))
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Iterates every entry as (bucket, key, entry), bucket-major in key
    /// order. Used by merge to collect live records.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8], &IndexEntry)> {
        self.buckets.iter().flat_map(|(bucket, map)| {
            map.iter()
                .map(move |(key, entry)| (bucket.as_slice(), key.as_slice(), entry))
        })
    }

    /// Total number of entries across all buckets.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.buckets.values().map(|m| m.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(segment_id: u64, ttl: u32) -> IndexEntry {
        IndexEntry {
            segment_id,
            offset: 0,
            size: 40,
            timestamp: 1000,
            ttl,
            value: Some(Bytes::from_static(b"v")),
        }
    }

    #[test]
    fn put_get_remove() {
        let mut index = Index::new();
        index.put(b"b1", b"k".to_vec(), entry(1, 0));

        assert!(index.get(b"b1", b"k").is_some());
        assert!(index.get(b"b2", b"k").is_none());

        index.remove(b"b1", b"k");
        assert!(index.get(b"b1", b"k").is_none());
        assert_eq!(index.entry_count(), 0);
    }

    #[test]
    fn buckets_are_independent_namespaces() {
        let mut index = Index::new();
        index.put(b"a", b"k".to_vec(), entry(1, 0));
        index.put(b"b", b"k".to_vec(), entry(2, 0));

        assert_eq!(index.get(b"a", b"k").unwrap().segment_id, 1);
        assert_eq!(index.get(b"b", b"k").unwrap().segment_id, 2);

        index.remove(b"a", b"k");
        assert!(index.get(b"b", b"k").is_some());
    }

    #[test]
    fn range_scan_is_inclusive_and_ordered() {
        let mut index = Index::new();
        for key in ["u_0010005", "u_0010001", "u_0010010", "u_0009999", "u_0010006"] {
            index.put(b"u", key.as_bytes().to_vec(), entry(1, 0));
        }

        let keys: Vec<Vec<u8>> = index
            .range_scan(b"u", b"u_0010001", b"u_0010006", 2000)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"u_0010001".to_vec(), b"u_0010005".to_vec(), b"u_0010006".to_vec()]);
    }

    #[test]
    fn range_scan_empty_when_start_after_end() {
        let mut index = Index::new();
        index.put(b"u", b"k".to_vec(), entry(1, 0));
        assert!(index.range_scan(b"u", b"z", b"a", 2000).is_empty());
    }

    #[test]
    fn prefix_scan_honors_prefix_and_limit() {
        let mut index = Index::new();
        for key in ["app_1", "app_2", "app_3", "web_1"] {
            index.put(b"svc", key.as_bytes().to_vec(), entry(1, 0));
        }

        let hits = index.prefix_scan(b"svc", b"app_", 2, 2000);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, b"app_1");
        assert_eq!(hits[1].0, b"app_2");

        let all = index.prefix_scan(b"svc", b"app_", usize::MAX, 2000);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn scans_skip_expired_entries() {
        let mut index = Index::new();
        index.put(b"b", b"k1".to_vec(), entry(1, 10)); // expires at 1010
        index.put(b"b", b"k2".to_vec(), entry(1, 0));

        let live = index.range_scan(b"b", b"k1", b"k2", 1010);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, b"k2");

        let both = index.range_scan(b"b", b"k1", b"k2", 1005);
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn clone_isolates_snapshots() {
        let mut index = Index::new();
        index.put(b"b", b"k".to_vec(), entry(1, 0));

        let snapshot = index.clone();
        index.put(b"b", b"k".to_vec(), entry(9, 0));
        index.put(b"b", b"new".to_vec(), entry(9, 0));

        assert_eq!(snapshot.get(b"b", b"k").unwrap().segment_id, 1);
        assert!(snapshot.get(b"b", b"new").is_none());
        assert_eq!(index.get(b"b", b"k").unwrap().segment_id, 9);
    }

    #[test]
    fn iter_walks_bucket_major() {
        let mut index = Index::new();
        index.put(b"a", b"k2".to_vec(), entry(1, 0));
        index.put(b"a", b"k1".to_vec(), entry(1, 0));
        index.put(b"b", b"k0".to_vec(), entry(1, 0));

        let seen: Vec<(Vec<u8>, Vec<u8>)> = index
            .iter()
            .map(|(b, k, _)| (b.to_vec(), k.to_vec()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"k1".to_vec()),
                (b"a".to_vec(), b"k2".to_vec()),
                (b"b".to_vec(), b"k0".to_vec()),
            ]
        );
    }
}
