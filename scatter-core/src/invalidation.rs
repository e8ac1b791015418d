//! Batched invalidation of stale copies.
//!
//! Writes committed on a primary leave older copies of the key on nodes that
//! are neither the primary nor its backup. Those copies are invalidated
//! lazily: the key is queued here with its new version and shipped in
//! batches. Keys whose write was a removal come back a second time, in a
//! removal batch, once the regular batch was acknowledged, so the tombstone
//! left on the primary and backup can be purged.

use crate::command::InvalidateVersionsCommand;
use crate::topology::segment_for_key;
use crate::types::{EntryVersion, Key, SegmentId};
use dashmap::DashMap;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvalidation {
    pub key: Key,
    pub version: EntryVersion,
    pub removal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scheduled {
    version: EntryVersion,
    removal: bool,
}

impl Scheduled {
    fn merge(&mut self, other: Scheduled) {
        if other.version > self.version {
            *self = other;
        } else if other.version == self.version {
            self.removal |= other.removal;
        }
    }
}

#[derive(Default)]
pub struct InvalidationQueue {
    scheduled: DashMap<Key, Scheduled>,
    removed: DashMap<Key, EntryVersion>,
}

impl InvalidationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key`. Returns the number of keys now waiting.
    pub fn schedule(&self, key: Key, version: EntryVersion, removal: bool) -> usize {
        let incoming = Scheduled { version, removal };
        self.scheduled
            .entry(key)
            .and_modify(|existing| existing.merge(incoming))
            .or_insert(incoming);
        self.scheduled.len()
    }

    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn removed_len(&self) -> usize {
        self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.removed.is_empty()
    }

    pub fn scheduled_version(&self, key: &[u8]) -> Option<(EntryVersion, bool)> {
        self.scheduled
            .get(key)
            .map(|entry| (entry.version, entry.removal))
    }

    /// Take every scheduled key. Keys scheduled while draining either land
    /// in this batch or stay queued for the next one.
    pub fn drain_scheduled(&self) -> Vec<PendingInvalidation> {
        let keys: Vec<Key> = self.scheduled.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.scheduled.remove(&key))
            .map(|(key, scheduled)| PendingInvalidation {
                key,
                version: scheduled.version,
                removal: scheduled.removal,
            })
            .collect()
    }

    /// Put a batch back after a failed send, without overriding newer
    /// versions scheduled in the meantime.
    pub fn requeue(&self, batch: Vec<PendingInvalidation>) {
        for pending in batch {
            self.schedule(pending.key, pending.version, pending.removal);
        }
    }

    /// Remember the removals of an acknowledged regular batch.
    pub fn regular_batch_acknowledged(&self, batch: &[PendingInvalidation]) -> usize {
        for pending in batch.iter().filter(|pending| pending.removal) {
            self.removed
                .entry(pending.key.clone())
                .and_modify(|version| {
                    if pending.version > *version {
                        *version = pending.version;
                    }
                })
                .or_insert(pending.version);
        }
        self.removed.len()
    }

    pub fn drain_removed(&self) -> Vec<PendingInvalidation> {
        let keys: Vec<Key> = self.removed.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.removed.remove(&key))
            .map(|(key, version)| PendingInvalidation {
                key,
                version,
                removal: true,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.scheduled.clear();
        self.removed.clear();
    }

    /// Drop queued keys that hash into `segments`.
    pub fn clear_segments(&self, segments: &BTreeSet<SegmentId>, num_segments: u16) {
        self.scheduled
            .retain(|key, _| !segments.contains(&segment_for_key(key, num_segments)));
        self.removed
            .retain(|key, _| !segments.contains(&segment_for_key(key, num_segments)));
    }
}

pub fn to_command(batch: &[PendingInvalidation], removal: bool) -> InvalidateVersionsCommand {
    InvalidateVersionsCommand {
        keys: batch.iter().map(|pending| pending.key.clone()).collect(),
        versions: batch.iter().map(|pending| pending.version).collect(),
        removal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn key(name: &str) -> Key {
        Bytes::copy_from_slice(name.as_bytes())
    }

    #[test]
    fn test_higher_version_wins() {
        let queue = InvalidationQueue::new();
        queue.schedule(key("k"), EntryVersion::new(1, 1), false);
        queue.schedule(key("k"), EntryVersion::new(1, 2), false);
        assert_eq!(queue.schedule(key("k"), EntryVersion::new(1, 1), true), 1);

        assert_eq!(
            queue.scheduled_version(b"k"),
            Some((EntryVersion::new(1, 2), false))
        );
    }

    #[test]
    fn test_removal_wins_on_equal_version() {
        let queue = InvalidationQueue::new();
        queue.schedule(key("k"), EntryVersion::new(2, 5), true);
        queue.schedule(key("k"), EntryVersion::new(2, 5), false);
        assert_eq!(
            queue.scheduled_version(b"k"),
            Some((EntryVersion::new(2, 5), true))
        );
    }

    #[test]
    fn test_drain_then_acknowledge_moves_removals() {
        let queue = InvalidationQueue::new();
        queue.schedule(key("a"), EntryVersion::new(1, 1), false);
        queue.schedule(key("b"), EntryVersion::new(1, 2), true);

        let batch = queue.drain_scheduled();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.scheduled_len(), 0);

        assert_eq!(queue.regular_batch_acknowledged(&batch), 1);
        let removed = queue.drain_removed();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, key("b"));
        assert!(removed[0].removal);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_newer_schedule() {
        let queue = InvalidationQueue::new();
        queue.schedule(key("k"), EntryVersion::new(1, 1), false);
        let batch = queue.drain_scheduled();
        queue.schedule(key("k"), EntryVersion::new(1, 4), false);
        queue.requeue(batch);
        assert_eq!(
            queue.scheduled_version(b"k"),
            Some((EntryVersion::new(1, 4), false))
        );
    }

    #[test]
    fn test_clear_segments_only_drops_matching_keys() {
        let queue = InvalidationQueue::new();
        let keys: Vec<Key> = (0..32).map(|i| key(&format!("key-{}", i))).collect();
        for k in &keys {
            queue.schedule(k.clone(), EntryVersion::new(1, 1), false);
        }

        let target = segment_for_key(&keys[0], 4);
        queue.clear_segments(&BTreeSet::from([target]), 4);

        for k in &keys {
            let queued = queue.scheduled_version(k).is_some();
            assert_eq!(queued, segment_for_key(k, 4) != target);
        }
    }

    #[test]
    fn test_to_command_keeps_order() {
        let batch = vec![
            PendingInvalidation {
                key: key("x"),
                version: EntryVersion::new(3, 1),
                removal: false,
            },
            PendingInvalidation {
                key: key("y"),
                version: EntryVersion::new(3, 2),
                removal: true,
            },
        ];
        let command = to_command(&batch, false);
        assert_eq!(command.keys, vec![key("x"), key("y")]);
        assert_eq!(command.versions[1], EntryVersion::new(3, 2));
        assert!(!command.removal);
    }
}
