//! Rebalance after a topology change.
//!
//! The provider side answers state requests and pushes data to a new backup
//! when a node keeps its segments but its next member changed. The consumer
//! side takes over segments this node became primary of.

mod consumer;
mod provider;

pub use consumer::StateConsumer;
pub use provider::StateProvider;

use crate::topology::Topology;
use crate::types::{NodeId, SegmentId};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipChange {
    pub gained: BTreeSet<SegmentId>,
    pub lost: BTreeSet<SegmentId>,
    pub kept: BTreeSet<SegmentId>,
}

pub fn ownership_change(previous: &Topology, topology: &Topology, node: &NodeId) -> OwnershipChange {
    let before = previous.owned_segments(node);
    let after = topology.owned_segments(node);
    OwnershipChange {
        gained: after.difference(&before).copied().collect(),
        lost: before.difference(&after).copied().collect(),
        kept: before.intersection(&after).copied().collect(),
    }
}

/// Segments whose primary differs between the two topologies.
pub fn moved_segments(previous: &Topology, topology: &Topology) -> BTreeSet<SegmentId> {
    (0..topology.num_segments())
        .filter(|segment| previous.primary(*segment) != topology.primary(*segment))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_change_on_join() {
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        let previous = Topology::balanced(1, vec![a.clone()], 4);
        let topology = previous.rebalance(2, vec![a.clone(), b.clone()]);

        let change = ownership_change(&previous, &topology, &a);
        assert!(change.gained.is_empty());
        assert_eq!(change.kept.len() + change.lost.len(), 4);
        assert_eq!(change.lost, topology.owned_segments(&b));
        assert_eq!(moved_segments(&previous, &topology), change.lost);

        let joined = ownership_change(&previous, &topology, &b);
        assert_eq!(joined.gained, change.lost);
    }
}
