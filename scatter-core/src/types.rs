use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::fmt;

/// Cache key. Keys are opaque bytes; the partitioner maps them to segments.
pub type Key = Bytes;

/// Cache value.
pub type Value = Bytes;

pub type SegmentId = u16;

pub type TopologyId = u32;

/// Address of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(SmolStr);

impl NodeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(SmolStr::from(value))
    }
}

/// Version stamped on every cached entry.
///
/// Versions minted in a newer topology always compare greater, so a counter
/// that was reconciled differently by two owners can never be confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntryVersion {
    pub topology_id: TopologyId,
    pub counter: u64,
}

impl EntryVersion {
    pub const fn new(topology_id: TopologyId, counter: u64) -> Self {
        Self {
            topology_id,
            counter,
        }
    }
}

impl Ord for EntryVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.topology_id
            .cmp(&other.topology_id)
            .then(self.counter.cmp(&other.counter))
    }
}

impl PartialOrd for EntryVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topology_id, self.counter)
    }
}

/// A freshly minted version together with the segment it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentVersion {
    pub segment: SegmentId,
    pub topology_id: TopologyId,
    pub counter: u64,
}

impl SegmentVersion {
    pub fn entry_version(&self) -> EntryVersion {
        EntryVersion::new(self.topology_id, self.counter)
    }
}
