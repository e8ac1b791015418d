//! Per-segment version counters.

use crate::types::{EntryVersion, SegmentId, SegmentVersion, TopologyId};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct SegmentVersionStore {
    counters: Box<[AtomicU64]>,
    // topology in which this node became owner of the segment
    owner_topologies: Box<[AtomicU32]>,
}

impl SegmentVersionStore {
    pub fn new(num_segments: u16) -> Self {
        let len = usize::from(num_segments);
        Self {
            counters: (0..len).map(|_| AtomicU64::new(0)).collect(),
            owner_topologies: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn num_segments(&self) -> u16 {
        self.counters.len() as u16
    }

    fn index(&self, segment: SegmentId) -> usize {
        let index = usize::from(segment);
        assert!(
            index < self.counters.len(),
            "segment {} out of range (num_segments={})",
            segment,
            self.counters.len()
        );
        index
    }

    /// Mint the next version of `segment`.
    pub fn increment_version(&self, segment: SegmentId, topology_id: TopologyId) -> SegmentVersion {
        let index = self.index(segment);
        let counter = self.counters[index].fetch_add(1, Ordering::AcqRel) + 1;
        SegmentVersion {
            segment,
            topology_id,
            counter,
        }
    }

    /// Adopt a counter learned from peers. Returns false when `counter` is
    /// lower than the current value; the store never goes backwards.
    pub fn set_segment_version(&self, segment: SegmentId, counter: u64) -> bool {
        let index = self.index(segment);
        let previous = self.counters[index].fetch_max(counter, Ordering::AcqRel);
        if counter < previous {
            tracing::debug!(
                "Ignoring lower version for segment {}: current={} offered={}",
                segment,
                previous,
                counter
            );
            return false;
        }
        true
    }

    pub fn is_version_actual(&self, segment: SegmentId, version: EntryVersion) -> bool {
        version >= self.baseline(segment)
    }

    /// Oldest version this node still trusts for `segment`.
    pub fn baseline(&self, segment: SegmentId) -> EntryVersion {
        let index = self.index(segment);
        EntryVersion::new(self.owner_topologies[index].load(Ordering::Acquire), 0)
    }

    pub fn reset_owner(&self, segment: SegmentId, topology_id: TopologyId) {
        let index = self.index(segment);
        self.owner_topologies[index].store(topology_id, Ordering::Release);
    }

    pub fn current(&self, segment: SegmentId) -> u64 {
        let index = self.index(segment);
        self.counters[index].load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.counters
            .iter()
            .map(|counter| counter.load(Ordering::Acquire))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_increment_is_strictly_monotonic() {
        let store = SegmentVersionStore::new(8);
        let first = store.increment_version(4, 2);
        let second = store.increment_version(4, 2);
        assert!(second.counter > first.counter);
        assert_eq!(second.segment, 4);
        assert_eq!(store.current(4), 2);
        assert_eq!(store.current(3), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_never_collide() {
        let store = Arc::new(SegmentVersionStore::new(2));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                (0..500)
                    .map(|_| store.increment_version(1, 1).counter)
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for counter in handle.await.unwrap() {
                assert!(seen.insert(counter), "duplicate counter {}", counter);
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(store.current(1), 4000);
    }

    #[test]
    fn test_set_segment_version_never_goes_backwards() {
        let store = SegmentVersionStore::new(4);
        assert!(store.set_segment_version(0, 10));
        assert!(!store.set_segment_version(0, 3));
        assert_eq!(store.current(0), 10);
        assert_eq!(store.increment_version(0, 1).counter, 11);
    }

    #[test]
    fn test_version_actual_against_owner_topology() {
        let store = SegmentVersionStore::new(4);
        store.reset_owner(2, 5);
        assert!(!store.is_version_actual(2, EntryVersion::new(4, 100)));
        assert!(store.is_version_actual(2, EntryVersion::new(5, 0)));
        assert!(store.is_version_actual(2, EntryVersion::new(6, 1)));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_segment_fails_fast() {
        let store = SegmentVersionStore::new(4);
        store.increment_version(4, 1);
    }
}
