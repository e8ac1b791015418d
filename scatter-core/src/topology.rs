//! Cluster membership and segment ownership.
//!
//! Scattered mode has exactly one primary owner per segment. The backup for
//! every write made by a node is the member that follows it in the member
//! list, so there is no fixed replica set per segment.

use crate::error::{Result, ScatterError};
use crate::types::{NodeId, SegmentId, TopologyId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

/// Map a key to its segment.
pub fn segment_for_key(key: &[u8], num_segments: u16) -> SegmentId {
    let digest = Sha256::digest(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(num_segments.max(1))) as SegmentId
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    id: TopologyId,
    members: Vec<NodeId>,
    primaries: Vec<Option<NodeId>>,
}

impl Topology {
    pub fn new(
        id: TopologyId,
        members: Vec<NodeId>,
        primaries: Vec<Option<NodeId>>,
    ) -> Result<Self> {
        if primaries.is_empty() || primaries.len() > usize::from(u16::MAX) {
            return Err(ScatterError::InvalidRequest(format!(
                "topology {} has an invalid segment count {}",
                id,
                primaries.len()
            )));
        }

        for (segment, primary) in primaries.iter().enumerate() {
            if let Some(primary) = primary {
                if !members.contains(primary) {
                    return Err(ScatterError::InvalidRequest(format!(
                        "primary {} of segment {} is not a member of topology {}",
                        primary, segment, id
                    )));
                }
            }
        }

        Ok(Self {
            id,
            members,
            primaries,
        })
    }

    /// Spread segments evenly over the members, in member order.
    pub fn balanced(id: TopologyId, members: Vec<NodeId>, num_segments: u16) -> Self {
        let primaries = (0..usize::from(num_segments))
            .map(|segment| {
                if members.is_empty() {
                    None
                } else {
                    Some(members[segment % members.len()].clone())
                }
            })
            .collect();

        Self {
            id,
            members,
            primaries,
        }
    }

    /// Derive the next topology for a new member list, moving as few
    /// segments as possible: surviving owners keep their segments up to an
    /// even share, the rest goes to the least loaded members.
    pub fn rebalance(&self, id: TopologyId, members: Vec<NodeId>) -> Self {
        if members.is_empty() {
            return Self {
                id,
                members,
                primaries: vec![None; self.primaries.len()],
            };
        }

        let num_segments = self.primaries.len();
        let quota = num_segments.div_ceil(members.len());
        let mut load: HashMap<&NodeId, usize> = members.iter().map(|node| (node, 0)).collect();
        let mut primaries: Vec<Option<NodeId>> = vec![None; num_segments];

        for (segment, current) in self.primaries.iter().enumerate() {
            let Some(current) = current else { continue };
            if let Some(count) = load.get_mut(current) {
                if *count < quota {
                    *count += 1;
                    primaries[segment] = Some(current.clone());
                }
            }
        }

        for primary in primaries.iter_mut().filter(|primary| primary.is_none()) {
            let least_loaded = members
                .iter()
                .min_by_key(|node| load.get(node).copied().unwrap_or(0))
                .cloned();
            if let Some(node) = least_loaded {
                if let Some(count) = load.get_mut(&node) {
                    *count += 1;
                }
                *primary = Some(node);
            }
        }

        Self {
            id,
            members,
            primaries,
        }
    }

    pub fn with_primary(mut self, segment: SegmentId, node: NodeId) -> Self {
        if !self.members.contains(&node) {
            self.members.push(node.clone());
        }
        self.primaries[usize::from(segment)] = Some(node);
        self
    }

    pub fn with_id(mut self, id: TopologyId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> TopologyId {
        self.id
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn is_member(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub fn num_segments(&self) -> u16 {
        self.primaries.len() as u16
    }

    pub fn segment_for_key(&self, key: &[u8]) -> SegmentId {
        segment_for_key(key, self.num_segments())
    }

    pub fn primary(&self, segment: SegmentId) -> Option<&NodeId> {
        self.primaries
            .get(usize::from(segment))
            .and_then(Option::as_ref)
    }

    pub fn is_primary(&self, node: &NodeId, segment: SegmentId) -> bool {
        self.primary(segment) == Some(node)
    }

    pub fn owned_segments(&self, node: &NodeId) -> BTreeSet<SegmentId> {
        self.primaries
            .iter()
            .enumerate()
            .filter(|(_, primary)| primary.as_ref() == Some(node))
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// The backup target for writes committed on `node`.
    pub fn next_member(&self, node: &NodeId) -> Option<&NodeId> {
        if self.members.len() <= 1 {
            return None;
        }

        let position = self.members.iter().position(|member| member == node)?;
        Some(&self.members[(position + 1) % self.members.len()])
    }

    /// Members other than `node` and its backup.
    pub fn non_backup_members(&self, node: &NodeId) -> Vec<NodeId> {
        let backup = self.next_member(node);
        self.members
            .iter()
            .filter(|member| *member != node && Some(*member) != backup)
            .cloned()
            .collect()
    }

    pub fn other_members(&self, node: &NodeId) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|member| *member != node)
            .cloned()
            .collect()
    }
}
