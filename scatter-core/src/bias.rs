//! Read bias.
//!
//! A node that is neither primary nor backup for a key may be granted the
//! right to serve reads of that key from its own container. The primary
//! remembers whom it granted bias to (remote bias) and revokes it before the
//! next write of the key commits. The granted node tracks its own bias
//! (local bias), tagged with the topology it was granted in.

use crate::config::ScatteredConfig;
use crate::topology::segment_for_key;
use crate::types::{Key, NodeId, SegmentId, TopologyId};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct LocalBias {
    topology_id: TopologyId,
    last_read: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationOutcome {
    Completed,
    Failed,
}

/// Revocation of remote bias on one key. Resolves exactly once; later calls
/// to [`complete`](Self::complete) or [`fail`](Self::fail) are no-ops.
#[derive(Debug)]
pub struct Revocation {
    key: Key,
    biased: Vec<NodeId>,
    new_biased: Option<NodeId>,
    resolved: AtomicBool,
    completed: AtomicBool,
    remote: Arc<DashMap<Key, BTreeSet<NodeId>>>,
}

impl Revocation {
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Nodes that must drop their bias.
    pub fn biased(&self) -> &[NodeId] {
        &self.biased
    }

    /// All biased nodes acknowledged. They lose their bias and the new
    /// holder gains it; bias granted while the revocation was in flight
    /// stays recorded.
    pub fn complete(&self) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.completed.store(true, Ordering::Release);

        let empty = {
            let mut holders = self.remote.entry(self.key.clone()).or_default();
            holders.retain(|holder| !self.biased.contains(holder));
            if let Some(holder) = &self.new_biased {
                holders.insert(holder.clone());
            }
            holders.is_empty()
        };
        if empty {
            self.remote.remove_if(&self.key, |_, holders| holders.is_empty());
        }
        true
    }

    /// Revocation did not go through; the old holders keep their bias.
    pub fn fail(&self) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::warn!(
            "Bias revocation on {} failed, holders {:?} keep their bias",
            String::from_utf8_lossy(&self.key),
            self.biased
        );
        true
    }

    pub fn outcome(&self) -> Option<RevocationOutcome> {
        if !self.resolved.load(Ordering::Acquire) {
            return None;
        }
        if self.completed.load(Ordering::Acquire) {
            Some(RevocationOutcome::Completed)
        } else {
            Some(RevocationOutcome::Failed)
        }
    }
}

/// Marks a write to one key between collecting its bias holders and
/// committing. Dropping the guard ends the write.
pub struct PendingWrite {
    key: Key,
    writes: Arc<DashMap<Key, usize>>,
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if let Some(mut count) = self.writes.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        self.writes.remove_if(&self.key, |_, count| *count == 0);
    }
}

pub struct BiasManager {
    local: DashMap<Key, LocalBias>,
    remote: Arc<DashMap<Key, BTreeSet<NodeId>>>,
    writes: Arc<DashMap<Key, usize>>,
    topology_id: AtomicU32,
    lifespan: Duration,
    max_local: usize,
}

impl BiasManager {
    pub fn new(config: &ScatteredConfig) -> Self {
        Self {
            local: DashMap::new(),
            remote: Arc::new(DashMap::new()),
            writes: Arc::new(DashMap::new()),
            topology_id: AtomicU32::new(0),
            lifespan: config.bias_lifespan(),
            max_local: config.max_local_biases.max(1),
        }
    }

    pub fn set_topology(&self, topology_id: TopologyId) {
        self.topology_id.fetch_max(topology_id, Ordering::AcqRel);
    }

    pub fn add_local_bias(&self, key: Key, topology_id: TopologyId) {
        self.local.insert(
            key,
            LocalBias {
                topology_id,
                last_read: Instant::now(),
            },
        );
        if self.local.len() > self.max_local {
            self.evict_least_recent(self.local.len() - self.max_local);
        }
    }

    /// Whether reads of `key` may be served locally. Refreshes the bias; a
    /// bias granted in an older topology or past its lifespan is dropped.
    pub fn has_local_bias(&self, key: &[u8]) -> bool {
        let current = self.topology_id.load(Ordering::Acquire);
        let now = Instant::now();
        let mut stale = false;

        let valid = match self.local.get_mut(key) {
            Some(mut bias) => {
                if bias.topology_id < current
                    || now.saturating_duration_since(bias.last_read) > self.lifespan
                {
                    stale = true;
                    false
                } else {
                    bias.last_read = now;
                    true
                }
            }
            None => false,
        };

        if stale {
            self.local.remove(key);
        }
        valid
    }

    pub fn revoke_local_bias(&self, key: &[u8]) -> bool {
        self.local.remove(key).is_some()
    }

    pub fn revoke_local_bias_for_segments(&self, segments: &BTreeSet<SegmentId>, num_segments: u16) {
        self.local
            .retain(|key, _| !segments.contains(&segment_for_key(key, num_segments)));
    }

    pub fn local_bias_count(&self) -> usize {
        self.local.len()
    }

    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.local.len();
        self.local
            .retain(|_, bias| now.saturating_duration_since(bias.last_read) <= self.lifespan);
        before - self.local.len()
    }

    /// Drop expired local bias once per lifespan, including bias on keys
    /// that are never read again.
    pub fn spawn_expiry(self: &Arc<Self>) -> JoinHandle<()> {
        let bias: Weak<Self> = Arc::downgrade(self);
        let period = self.lifespan.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(bias) = bias.upgrade() else {
                    break;
                };
                let evicted = bias.evict_expired(Instant::now());
                if evicted > 0 {
                    tracing::debug!("Dropped {} expired local biases", evicted);
                }
            }
        })
    }

    fn evict_least_recent(&self, count: usize) {
        let mut by_age: Vec<(Instant, Key)> = self
            .local
            .iter()
            .map(|entry| (entry.last_read, entry.key().clone()))
            .collect();
        by_age.sort_by_key(|(last_read, _)| *last_read);
        for (_, key) in by_age.into_iter().take(count) {
            self.local.remove(&key);
        }
    }

    /// Start revoking bias on `key` before a write from `new_biased` (or
    /// from the primary itself when `None`). Returns `None` when nobody else
    /// holds bias.
    pub fn start_revoking_remote_bias(&self, key: &Key, new_biased: Option<&NodeId>) -> Option<Revocation> {
        let biased: Vec<NodeId> = match self.remote.get(key) {
            Some(holders) => holders
                .iter()
                .filter(|holder| Some(*holder) != new_biased)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        if biased.is_empty() {
            if let Some(holder) = new_biased {
                self.renew_remote_bias(key.clone(), holder.clone());
            }
            return None;
        }

        Some(Revocation {
            key: key.clone(),
            biased,
            new_biased: new_biased.cloned(),
            resolved: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            remote: self.remote.clone(),
        })
    }

    /// Start a write of `key`. Bias granted while the returned guard lives
    /// must not be handed out, since the holders were already collected.
    pub fn begin_write(&self, key: &Key) -> PendingWrite {
        *self.writes.entry(key.clone()).or_default() += 1;
        PendingWrite {
            key: key.clone(),
            writes: self.writes.clone(),
        }
    }

    pub fn is_write_pending(&self, key: &[u8]) -> bool {
        self.writes.contains_key(key)
    }

    /// Record that `origin` was granted bias on `key`.
    pub fn renew_remote_bias(&self, key: Key, origin: NodeId) {
        self.remote.entry(key).or_default().insert(origin);
    }

    pub fn remote_holders(&self, key: &[u8]) -> Vec<NodeId> {
        self.remote
            .get(key)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_remote_for_segments(&self, segments: &BTreeSet<SegmentId>, num_segments: u16) {
        self.remote
            .retain(|key, _| !segments.contains(&segment_for_key(key, num_segments)));
    }

    pub fn clear(&self) {
        self.local.clear();
        self.remote.clear();
    }
}

/// Group revocations by the node they have to reach, so every biased node
/// gets a single revoke command.
pub fn group_by_holder(revocations: &[Revocation]) -> HashMap<NodeId, Vec<Key>> {
    let mut grouped: HashMap<NodeId, Vec<Key>> = HashMap::new();
    for revocation in revocations {
        for holder in revocation.biased() {
            grouped
                .entry(holder.clone())
                .or_default()
                .push(revocation.key().clone());
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn manager() -> BiasManager {
        BiasManager::new(&ScatteredConfig {
            bias_lifespan_ms: 1_000,
            max_local_biases: 3,
            ..ScatteredConfig::default()
        })
    }

    fn key(name: &str) -> Key {
        Bytes::copy_from_slice(name.as_bytes())
    }

    #[tokio::test]
    async fn test_local_bias_is_dropped_in_newer_topology() {
        let bias = manager();
        bias.set_topology(1);
        bias.add_local_bias(key("k"), 1);
        assert!(bias.has_local_bias(b"k"));

        bias.set_topology(2);
        assert!(!bias.has_local_bias(b"k"));
        assert_eq!(bias.local_bias_count(), 0);
    }

    #[tokio::test]
    async fn test_local_bias_capacity_evicts_least_recent() {
        let bias = manager();
        bias.set_topology(1);
        for name in ["a", "b", "c"] {
            bias.add_local_bias(key(name), 1);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(bias.has_local_bias(b"a"));
        tokio::time::sleep(Duration::from_millis(2)).await;
        bias.add_local_bias(key("d"), 1);

        assert_eq!(bias.local_bias_count(), 3);
        assert!(bias.has_local_bias(b"a"));
        assert!(!bias.has_local_bias(b"b"));
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let bias = manager();
        bias.add_local_bias(key("k"), 0);
        assert_eq!(bias.evict_expired(Instant::now()), 0);
        assert_eq!(
            bias.evict_expired(Instant::now() + Duration::from_secs(2)),
            1
        );
    }

    #[tokio::test]
    async fn test_expiry_task_drops_unread_bias() {
        let bias = Arc::new(BiasManager::new(&ScatteredConfig {
            bias_lifespan_ms: 50,
            ..ScatteredConfig::default()
        }));
        let task = bias.spawn_expiry();
        bias.add_local_bias(key("k"), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(bias.local_bias_count(), 0);
        task.abort();
    }

    #[tokio::test]
    async fn test_revoking_local_bias_twice_is_a_noop() {
        let bias = manager();
        bias.add_local_bias(key("k"), 0);

        assert!(bias.revoke_local_bias(b"k"));
        assert!(!bias.revoke_local_bias(b"k"));
        assert!(!bias.has_local_bias(b"k"));
        assert_eq!(bias.local_bias_count(), 0);
    }

    #[test]
    fn test_bias_granted_during_revocation_survives_completion() {
        let bias = manager();
        let x = NodeId::from("x");
        let y = NodeId::from("y");
        bias.renew_remote_bias(key("k"), x.clone());

        let revocation = bias.start_revoking_remote_bias(&key("k"), None).unwrap();
        assert_eq!(revocation.biased(), &[x]);
        bias.renew_remote_bias(key("k"), y.clone());

        assert!(revocation.complete());
        assert_eq!(bias.remote_holders(b"k"), vec![y]);
    }

    #[test]
    fn test_pending_write_ends_when_last_guard_drops() {
        let bias = manager();
        let first = bias.begin_write(&key("k"));
        let second = bias.begin_write(&key("k"));
        assert!(bias.is_write_pending(b"k"));
        assert!(!bias.is_write_pending(b"other"));

        drop(first);
        assert!(bias.is_write_pending(b"k"));
        drop(second);
        assert!(!bias.is_write_pending(b"k"));
    }

    #[test]
    fn test_completed_revocation_without_new_holder_forgets_key() {
        let bias = manager();
        bias.renew_remote_bias(key("k"), NodeId::from("x"));
        let revocation = bias.start_revoking_remote_bias(&key("k"), None).unwrap();
        assert!(revocation.complete());
        assert!(bias.remote_holders(b"k").is_empty());
        assert!(bias.start_revoking_remote_bias(&key("k"), None).is_none());
    }

    #[test]
    fn test_clear_forgets_local_and_remote_bias() {
        let bias = manager();
        bias.add_local_bias(key("a"), 0);
        bias.renew_remote_bias(key("b"), NodeId::from("x"));
        bias.clear();
        assert_eq!(bias.local_bias_count(), 0);
        assert!(bias.remote_holders(b"b").is_empty());
    }

    #[test]
    fn test_no_revocation_without_other_holders() {
        let bias = manager();
        let a = NodeId::from("a");
        assert!(bias.start_revoking_remote_bias(&key("k"), Some(&a)).is_none());
        assert_eq!(bias.remote_holders(b"k"), vec![a.clone()]);
        assert!(bias.start_revoking_remote_bias(&key("k"), Some(&a)).is_none());
    }

    #[test]
    fn test_revocation_resolves_once() {
        let bias = manager();
        bias.renew_remote_bias(key("k"), NodeId::from("a"));
        bias.renew_remote_bias(key("k"), NodeId::from("b"));

        let revocation = bias
            .start_revoking_remote_bias(&key("k"), Some(&NodeId::from("c")))
            .unwrap();
        assert_eq!(revocation.biased().len(), 2);
        assert_eq!(revocation.outcome(), None);

        assert!(revocation.complete());
        assert!(!revocation.complete());
        assert!(!revocation.fail());
        assert_eq!(revocation.outcome(), Some(RevocationOutcome::Completed));
        assert_eq!(bias.remote_holders(b"k"), vec![NodeId::from("c")]);
    }

    #[test]
    fn test_failed_revocation_keeps_holders() {
        let bias = manager();
        bias.renew_remote_bias(key("k"), NodeId::from("a"));
        let revocation = bias.start_revoking_remote_bias(&key("k"), None).unwrap();
        assert!(revocation.fail());
        assert!(!revocation.complete());
        assert_eq!(bias.remote_holders(b"k"), vec![NodeId::from("a")]);
    }

    #[test]
    fn test_group_by_holder_batches_keys() {
        let bias = manager();
        for name in ["x", "y"] {
            bias.renew_remote_bias(key(name), NodeId::from("a"));
        }
        bias.renew_remote_bias(key("y"), NodeId::from("b"));

        let revocations: Vec<Revocation> = ["x", "y"]
            .iter()
            .filter_map(|name| bias.start_revoking_remote_bias(&key(name), None))
            .collect();
        let grouped = group_by_holder(&revocations);
        assert_eq!(grouped[&NodeId::from("a")].len(), 2);
        assert_eq!(grouped[&NodeId::from("b")], vec![key("y")]);
    }
}
