//! The ordered collection of segments on disk.

use crate::segment::SegmentFile;
use std::collections::BTreeMap;
use std::sync::Arc;

/// All segments of a database, ordered by id.
///
/// Exactly one segment is active (the one with the highest id); the rest
/// are sealed. The set is part of the copy-on-write database state:
/// snapshots hold clones of it, so their `Arc<SegmentFile>` handles keep
/// retired files readable until every snapshot referencing them is gone.
#[derive(Debug, Clone, Default)]
pub struct SegmentSet {
    segments: BTreeMap<u64, Arc<SegmentFile>>,
    active_id: u64,
    /// Length of the active segment covered by the last commit barrier.
    active_committed_len: u64,
}

impl SegmentSet {
    /// Builds a set from recovered segments; the highest id becomes active.
    pub fn new(segments: BTreeMap<u64, Arc<SegmentFile>>) -> Self {
        let active_id = segments.keys().next_back().copied().unwrap_or(0);
        let active_committed_len = segments.get(&active_id).map_or(0, |s| s.len());
        Self {
            segments,
            active_id,
            active_committed_len,
        }
    }

    /// Looks up a segment by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&Arc<SegmentFile>> {
        self.segments.get(&id)
    }

    /// Returns the active segment, if the set is non-empty.
    #[must_use]
    pub fn active(&self) -> Option<&Arc<SegmentFile>> {
        self.segments.get(&self.active_id)
    }

    /// Returns the active segment id.
    #[must_use]
    pub fn active_id(&self) -> u64 {
        self.active_id
    }

    /// Length of the active segment as of the last completed commit.
    #[must_use]
    pub fn active_committed_len(&self) -> u64 {
        self.active_committed_len
    }

    pub(crate) fn set_active_committed_len(&mut self, len: u64) {
        self.active_committed_len = len;
    }

    /// Inserts a segment and makes it active when its id is the highest.
    pub fn insert(&mut self, segment: Arc<SegmentFile>) {
        let id = segment.id();
        self.segments.insert(id, segment);
        if id >= self.active_id {
            self.active_id = id;
            self.active_committed_len = 0;
        }
    }

    /// Removes a segment by id.
    pub fn remove(&mut self, id: u64) -> Option<Arc<SegmentFile>> {
        self.segments.remove(&id)
    }

    /// All segment ids, ascending.
    #[must_use]
    pub fn ids(&self) -> Vec<u64> {
        self.segments.keys().copied().collect()
    }

    /// Ids of all sealed segments (everything but the active one).
    #[must_use]
    pub fn sealed_ids(&self) -> Vec<u64> {
        self.segments
            .keys()
            .copied()
            .filter(|&id| id != self.active_id)
            .collect()
    }

    /// Iterates segments in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SegmentFile>> {
        self.segments.values()
    }

    /// Number of segments in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True when the set holds no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sum of all segment sizes in bytes.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.segments.values().map(|s| s.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loamdb_storage::InMemoryBackend;

    fn segment(id: u64) -> Arc<SegmentFile> {
        Arc::new(
            SegmentFile::from_backend(Box::new(InMemoryBackend::new()), id, 1024, true).unwrap(),
        )
    }

    #[test]
    fn highest_id_is_active() {
        let mut segments = BTreeMap::new();
        for id in [3, 1, 2] {
            segments.insert(id, segment(id));
        }
        let set = SegmentSet::new(segments);

        assert_eq!(set.active_id(), 3);
        assert_eq!(set.sealed_ids(), vec![1, 2]);
        assert_eq!(set.ids(), vec![1, 2, 3]);
    }

    #[test]
    fn insert_rotates_active() {
        let mut set = SegmentSet::new(BTreeMap::from([(1, segment(1))]));
        assert_eq!(set.active_id(), 1);

        set.insert(segment(2));
        assert_eq!(set.active_id(), 2);
        assert_eq!(set.sealed_ids(), vec![1]);
    }

    #[test]
    fn remove_and_lookup() {
        let mut set = SegmentSet::new(BTreeMap::from([(1, segment(1)), (2, segment(2))]));
        assert!(set.get(1).is_some());

        set.remove(1);
        assert!(set.get(1).is_none());
        assert_eq!(set.len(), 1);
    }
}
