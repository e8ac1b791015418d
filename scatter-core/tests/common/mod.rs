#![allow(dead_code)]

use bytes::Bytes;
use scatter_core::{LocalCluster, ScatteredConfig, ScatteredNode, SegmentId, segment_for_key};
use std::sync::Arc;

pub const NUM_SEGMENTS: u16 = 16;

/// Short timeouts, and a flush interval long enough that tests decide when
/// invalidations go out.
pub fn test_config() -> ScatteredConfig {
    ScatteredConfig {
        num_segments: NUM_SEGMENTS,
        invalidation_flush_interval_ms: 60_000,
        remote_timeout_ms: 2_000,
        state_transfer_timeout_ms: 10_000,
        ..ScatteredConfig::default()
    }
}

pub fn bytes(data: &str) -> Bytes {
    Bytes::copy_from_slice(data.as_bytes())
}

pub fn key_in_segment(segment: SegmentId) -> Bytes {
    (0u32..)
        .map(|i| Bytes::from(format!("key-{}", i)))
        .find(|key| segment_for_key(key, NUM_SEGMENTS) == segment)
        .unwrap()
}

pub fn primary_of(cluster: &LocalCluster, key: &[u8]) -> Arc<ScatteredNode> {
    let topology = cluster.topology();
    let segment = topology.segment_for_key(key);
    let primary = topology.primary(segment).unwrap();
    cluster.node(primary.as_str()).unwrap()
}

pub fn backup_of(cluster: &LocalCluster, key: &[u8]) -> Arc<ScatteredNode> {
    let primary = primary_of(cluster, key);
    let backup = cluster.topology().next_member(primary.id()).unwrap();
    cluster.node(backup.as_str()).unwrap()
}

/// A member that is neither primary nor backup of `key`.
pub fn bystander_of(cluster: &LocalCluster, key: &[u8]) -> Arc<ScatteredNode> {
    let primary = primary_of(cluster, key);
    let backup = backup_of(cluster, key);
    cluster
        .nodes()
        .find(|node| node.id() != primary.id() && node.id() != backup.id())
        .cloned()
        .unwrap()
}

/// Number of nodes holding a live value for `key`.
pub fn holders(cluster: &LocalCluster, key: &[u8]) -> usize {
    cluster
        .nodes()
        .filter(|node| {
            node.container()
                .get(key)
                .is_some_and(|entry| entry.value.is_some())
        })
        .count()
}
