//! Per-node data container.
//!
//! Every mutation is a per-key compare-and-commit on a `DashMap` shard, so
//! writes to different keys never contend and a single key is always
//! updated atomically against the version it carries.

use crate::error::{Result, ScatterError};
use crate::topology::segment_for_key;
use crate::types::{EntryVersion, Key, NodeId, SegmentId, Value};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryMetadata {
    /// The value is held by this node.
    Local { version: EntryVersion },
    /// Only the version is known; `holder` has the value. Present while a
    /// segment is in value transfer.
    Remote {
        version: EntryVersion,
        holder: NodeId,
    },
}

impl EntryMetadata {
    pub fn version(&self) -> EntryVersion {
        match self {
            Self::Local { version } | Self::Remote { version, .. } => *version,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Option<Value>,
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    pub fn local(value: Value, version: EntryVersion) -> Self {
        Self {
            value: Some(value),
            metadata: EntryMetadata::Local { version },
        }
    }

    pub fn tombstone(version: EntryVersion) -> Self {
        Self {
            value: None,
            metadata: EntryMetadata::Local { version },
        }
    }

    pub fn remote(version: EntryVersion, holder: NodeId) -> Self {
        Self {
            value: None,
            metadata: EntryMetadata::Remote { version, holder },
        }
    }

    pub fn version(&self) -> EntryVersion {
        self.metadata.version()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none() && !self.metadata.is_remote()
    }

    pub fn is_remote(&self) -> bool {
        self.metadata.is_remote()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { previous: Option<CacheEntry> },
    /// The container already holds this or a newer version.
    Skipped { current: EntryVersion },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

pub struct DataContainer {
    entries: DashMap<Key, CacheEntry>,
    num_segments: u16,
}

impl DataContainer {
    pub fn new(num_segments: u16) -> Self {
        Self {
            entries: DashMap::new(),
            num_segments,
        }
    }

    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        segment_for_key(key, self.num_segments)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn version_of(&self, key: &[u8]) -> Option<EntryVersion> {
        self.entries.get(key).map(|entry| entry.version())
    }

    /// Store `entry` unless the container already holds a newer version.
    /// A locally held value replaces remote metadata of the same version.
    pub fn commit_if_newer(&self, key: Key, entry: CacheEntry) -> CommitOutcome {
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                CommitOutcome::Committed { previous: None }
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                let replace = current.version() < entry.version()
                    || (current.version() == entry.version()
                        && current.is_remote()
                        && !entry.is_remote());
                if replace {
                    let previous = slot.insert(entry);
                    CommitOutcome::Committed {
                        previous: Some(previous),
                    }
                } else {
                    CommitOutcome::Skipped {
                        current: current.version(),
                    }
                }
            }
        }
    }

    /// Store a value fetched during state transfer. It replaces remote
    /// metadata of any version, since a holder with a newer copy may have
    /// failed to deliver it.
    pub fn commit_transferred(&self, key: Key, entry: CacheEntry) -> CommitOutcome {
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.is_remote() || current.version() < entry.version() {
                    let previous = slot.insert(entry);
                    CommitOutcome::Committed {
                        previous: Some(previous),
                    }
                } else {
                    CommitOutcome::Skipped {
                        current: current.version(),
                    }
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                CommitOutcome::Committed { previous: None }
            }
        }
    }

    /// Store `entry` only if the key still carries the version observed when
    /// the previous value was loaded.
    pub fn commit_if_unchanged(
        &self,
        key: Key,
        entry: CacheEntry,
        seen: Option<EntryVersion>,
    ) -> Result<Option<CacheEntry>> {
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                if seen.is_some() {
                    return Err(ScatterError::ConcurrentChange {
                        key: String::from_utf8_lossy(slot.key()).into_owned(),
                    });
                }
                slot.insert(entry);
                Ok(None)
            }
            Entry::Occupied(mut slot) => {
                if Some(slot.get().version()) != seen {
                    tracing::debug!(
                        "Version of {} moved from {:?} to {} before commit",
                        String::from_utf8_lossy(slot.key()),
                        seen,
                        slot.get().version()
                    );
                    return Err(ScatterError::ConcurrentChange {
                        key: String::from_utf8_lossy(slot.key()).into_owned(),
                    });
                }
                Ok(Some(slot.insert(entry)))
            }
        }
    }

    /// Apply one key of an invalidation batch. Regular invalidations drop
    /// anything strictly older than `version`; removal invalidations also
    /// drop the entry written with exactly `version`. Newer entries are
    /// never touched.
    pub fn apply_invalidation(&self, key: &[u8], version: EntryVersion, removal: bool) -> bool {
        self.entries
            .remove_if(key, |_, entry| {
                entry.version() < version || (removal && entry.version() == version)
            })
            .is_some()
    }

    /// Drop remote metadata for `key`; a locally held entry stays.
    pub fn remove_if_remote(&self, key: &[u8]) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.is_remote())
            .is_some()
    }

    pub fn remove(&self, key: &[u8]) -> Option<CacheEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Versions of locally held keys (tombstones included) in `segments`.
    pub fn keys_in_segments(&self, segments: &BTreeSet<SegmentId>) -> Vec<(Key, EntryVersion)> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_remote())
            .filter(|entry| segments.contains(&self.segment_of(entry.key())))
            .map(|entry| (entry.key().clone(), entry.version()))
            .collect()
    }

    pub fn entries_in_segments(&self, segments: &BTreeSet<SegmentId>) -> Vec<(Key, CacheEntry)> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_remote())
            .filter(|entry| segments.contains(&self.segment_of(entry.key())))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Keys of `segment` whose value still has to be fetched.
    pub fn remote_entries(&self, segment: SegmentId) -> Vec<(Key, EntryVersion, NodeId)> {
        self.entries
            .iter()
            .filter(|entry| self.segment_of(entry.key()) == segment)
            .filter_map(|entry| match &entry.metadata {
                EntryMetadata::Remote { version, holder } => {
                    Some((entry.key().clone(), *version, holder.clone()))
                }
                EntryMetadata::Local { .. } => None,
            })
            .collect()
    }

    pub fn discard_remote(&self, segments: &BTreeSet<SegmentId>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            !(entry.is_remote() && segments.contains(&segment_for_key(key, self.num_segments)))
        });
        before - self.entries.len()
    }

    /// Highest counter stored locally per segment.
    pub fn max_version_per_segment(&self) -> Vec<u64> {
        let mut max = vec![0u64; usize::from(self.num_segments)];
        for entry in self.entries.iter() {
            let segment = usize::from(self.segment_of(entry.key()));
            max[segment] = max[segment].max(entry.version().counter);
        }
        max
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
