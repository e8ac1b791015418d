//! Ownership and versioning for one node.
//!
//! The manager owns the per-segment version counters and segment states of
//! its node. Every other component reads them through this type and refers
//! to segments by id only.

use crate::command::{Command, Response, StateRequest};
use crate::config::ScatteredConfig;
use crate::container::DataContainer;
use crate::error::{Result, ScatterError};
use crate::events::{EventBus, ScatterEvent};
use crate::invalidation::{self, InvalidationQueue, PendingInvalidation};
use crate::segment_state::{SegmentState, SegmentStateMachine, Transition};
use crate::topology::Topology;
use crate::transport::{self, Transport};
use crate::types::{EntryVersion, Key, NodeId, SegmentId, SegmentVersion, TopologyId};
use crate::version_store::SegmentVersionStore;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

pub struct ScatteredVersionManager {
    local: NodeId,
    config: ScatteredConfig,
    topology: RwLock<Arc<Topology>>,
    installed: watch::Sender<TopologyId>,
    versions: SegmentVersionStore,
    states: SegmentStateMachine,
    invalidations: InvalidationQueue,
    flushing: AtomicBool,
    flush_requested: Arc<Notify>,
    degraded: RwLock<BTreeSet<SegmentId>>,
    preloaded_topology_id: AtomicU32,
    container: Arc<DataContainer>,
    transport: Arc<dyn Transport>,
    events: EventBus,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ScatteredVersionManager {
    pub fn new(
        local: NodeId,
        config: ScatteredConfig,
        container: Arc<DataContainer>,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        let num_segments = config.num_segments;
        let (installed, _) = watch::channel(0);
        Self {
            topology: RwLock::new(Arc::new(Topology::balanced(0, Vec::new(), num_segments))),
            installed,
            versions: SegmentVersionStore::new(num_segments),
            states: SegmentStateMachine::new(num_segments),
            invalidations: InvalidationQueue::new(),
            flushing: AtomicBool::new(false),
            flush_requested: Arc::new(Notify::new()),
            degraded: RwLock::new(BTreeSet::new()),
            preloaded_topology_id: AtomicU32::new(0),
            local,
            config,
            container,
            transport,
            events,
        }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn config(&self) -> &ScatteredConfig {
        &self.config
    }

    pub fn num_segments(&self) -> u16 {
        self.config.num_segments
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.topology.read().clone()
    }

    pub fn topology_id(&self) -> TopologyId {
        *self.installed.borrow()
    }

    /// Install a newer topology. Topology ids must strictly increase.
    pub fn set_topology(&self, topology: Topology) -> Result<()> {
        let id = topology.id();
        if id <= self.topology_id() {
            return Err(ScatterError::InvalidRequest(format!(
                "topology id must increase: current={} offered={}",
                self.topology_id(),
                id
            )));
        }
        if topology.num_segments() != self.num_segments() {
            return Err(ScatterError::InvalidRequest(format!(
                "topology {} has {} segments, expected {}",
                id,
                topology.num_segments(),
                self.num_segments()
            )));
        }

        *self.topology.write() = Arc::new(topology);
        self.set_topology_id(id)
    }

    pub fn set_topology_id(&self, topology_id: TopologyId) -> Result<()> {
        let mut result = Ok(());
        self.installed.send_if_modified(|current| {
            if topology_id <= *current {
                result = Err(ScatterError::InvalidRequest(format!(
                    "topology id must increase: current={} offered={}",
                    current, topology_id
                )));
                return false;
            }
            *current = topology_id;
            true
        });
        result?;

        tracing::info!("Node {} installed topology {}", self.local, topology_id);
        self.events.publish(ScatterEvent::TopologyInstalled {
            topology_id,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Resolve once `topology_id` (or a newer one) is installed locally.
    pub async fn wait_for_topology(&self, topology_id: TopologyId) -> Result<()> {
        let mut receiver = self.installed.subscribe();
        let wait = receiver.wait_for(|installed| *installed >= topology_id);
        match tokio::time::timeout(self.config.remote_timeout(), wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ScatterError::Stopping),
            Err(_) => Err(ScatterError::Timeout(format!(
                "node {} did not install topology {}",
                self.local, topology_id
            ))),
        }
    }

    pub fn segment_state(&self, segment: SegmentId) -> SegmentState {
        self.states.state(segment)
    }

    pub fn states(&self) -> &SegmentStateMachine {
        &self.states
    }

    /// Mint a version for a write to `segment`.
    pub fn increment_version(&self, segment: SegmentId) -> Result<SegmentVersion> {
        if self.is_degraded(segment) {
            return Err(ScatterError::Unavailable(segment));
        }

        match self.states.state(segment) {
            SegmentState::NotOwned => Err(ScatterError::NotOwner {
                segment,
                node: self.local.clone(),
            }),
            SegmentState::Blocked => Err(ScatterError::SegmentBlocked(segment)),
            SegmentState::KeyTransfer | SegmentState::ValueTransfer | SegmentState::Owned => {
                Ok(self.versions.increment_version(segment, self.topology_id()))
            }
        }
    }

    /// Like [`increment_version`](Self::increment_version), but waits while
    /// the previous owner has not confirmed revocation yet.
    pub async fn increment_version_when_unblocked(&self, segment: SegmentId) -> Result<SegmentVersion> {
        loop {
            match self.increment_version(segment) {
                Err(ScatterError::SegmentBlocked(_)) => {
                    self.wait_unblocked(segment).await?;
                }
                other => return other,
            }
        }
    }

    /// Wait up to `remote_timeout` for `segment` to leave `Blocked`. The
    /// caller gets a retriable `SegmentBlocked` when it does not.
    pub async fn wait_unblocked(&self, segment: SegmentId) -> Result<SegmentState> {
        match tokio::time::timeout(self.config.remote_timeout(), self.states.wait_unblocked(segment)).await {
            Ok(state) => state,
            Err(_) => Err(ScatterError::SegmentBlocked(segment)),
        }
    }

    pub fn is_version_actual(&self, segment: SegmentId, version: EntryVersion) -> bool {
        self.versions.is_version_actual(segment, version)
    }

    pub fn set_segment_version(&self, segment: SegmentId, counter: u64) -> bool {
        self.versions.set_segment_version(segment, counter)
    }

    pub fn segment_version(&self, segment: SegmentId) -> u64 {
        self.versions.current(segment)
    }

    fn record(&self, segment: SegmentId, topology_id: TopologyId, transition: Transition) -> Transition {
        if let Transition::Applied { from, to } = transition {
            tracing::debug!(
                "Node {} segment {} {:?} -> {:?} in topology {}",
                self.local,
                segment,
                from,
                to,
                topology_id
            );
            self.events.segment_changed(segment, from, to, topology_id);
        }
        transition
    }

    /// This node becomes owner of `segment`; writes wait until the old owner
    /// confirmed revocation.
    pub fn register_segment(&self, segment: SegmentId, topology_id: TopologyId) -> Result<Transition> {
        let transition = self.states.block(segment, topology_id)?;
        self.versions.reset_owner(segment, topology_id);
        Ok(self.record(segment, topology_id, transition))
    }

    pub fn unregister_segment(&self, segment: SegmentId, topology_id: TopologyId) {
        let previous = self.states.unregister(segment, topology_id);
        if previous != SegmentState::NotOwned {
            self.record(
                segment,
                topology_id,
                Transition::Applied {
                    from: previous,
                    to: SegmentState::NotOwned,
                },
            );
        }
    }

    /// Take ownership without state transfer.
    pub fn set_owned_segments(&self, segments: &BTreeSet<SegmentId>, topology_id: TopologyId) -> Result<()> {
        for segment in segments {
            if self.states.state(*segment) == SegmentState::Owned {
                continue;
            }
            let transition = self.states.set_owned(*segment, topology_id)?;
            self.versions.reset_owner(*segment, topology_id);
            self.record(*segment, topology_id, transition);
        }
        Ok(())
    }

    pub fn set_non_owned_segments(&self, segments: &BTreeSet<SegmentId>, topology_id: TopologyId) {
        for segment in segments {
            self.unregister_segment(*segment, topology_id);
        }
    }

    pub fn start_key_transfer(&self, segments: &BTreeSet<SegmentId>, topology_id: TopologyId) -> Result<()> {
        for segment in segments {
            let transition = self.states.start_key_transfer(*segment, topology_id)?;
            self.record(*segment, topology_id, transition);
        }
        Ok(())
    }

    pub fn key_transfer_finished(
        &self,
        segment: SegmentId,
        topology_id: TopologyId,
        expect_values: bool,
    ) -> Result<Transition> {
        let transition = self
            .states
            .finish_key_transfer(segment, topology_id, expect_values)?;
        Ok(self.record(segment, topology_id, transition))
    }

    pub fn value_transfer_finished(&self, segment: SegmentId, topology_id: TopologyId) -> Result<Transition> {
        let transition = self.states.finish_value_transfer(segment, topology_id)?;
        Ok(self.record(segment, topology_id, transition))
    }

    /// Queue an invalidation of `key` on non-backup members.
    pub fn schedule_key_invalidation(&self, key: Key, version: EntryVersion, removal: bool) {
        let queued = self.invalidations.schedule(key, version, removal);
        if queued > self.config.invalidation_batch_size {
            self.flush_requested.notify_one();
        }
    }

    pub fn pending_invalidations(&self) -> &InvalidationQueue {
        &self.invalidations
    }

    pub fn clear_invalidations(&self) {
        self.invalidations.clear();
    }

    pub fn clear_invalidations_for_segments(&self, segments: &BTreeSet<SegmentId>) {
        self.invalidations
            .clear_segments(segments, self.num_segments());
    }

    /// Flush both invalidation queues now. Returns false if another flush is
    /// already running.
    pub async fn start_flush(&self) -> bool {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _guard = FlushGuard(&self.flushing);

        self.flush_regular().await;
        self.flush_removed().await;
        true
    }

    async fn flush_regular(&self) {
        let batch = self.invalidations.drain_scheduled();
        if batch.is_empty() {
            return;
        }

        let targets = self.topology().non_backup_members(&self.local);
        let command = Command::InvalidateVersions(invalidation::to_command(&batch, false));
        if self.send_with_retries(&targets, &command).await {
            tracing::debug!(
                "Node {} invalidated {} keys on {} members",
                self.local,
                batch.len(),
                targets.len()
            );
            self.invalidations.regular_batch_acknowledged(&batch);
        } else {
            self.invalidations.requeue(batch);
        }
    }

    async fn flush_removed(&self) {
        let batch = self.invalidations.drain_removed();
        if batch.is_empty() {
            return;
        }

        let targets = self.topology().other_members(&self.local);
        let command = Command::InvalidateVersions(invalidation::to_command(&batch, true));
        if self.send_with_retries(&targets, &command).await {
            self.purge_tombstones(&batch);
        } else {
            self.invalidations.regular_batch_acknowledged(&batch);
        }
    }

    fn purge_tombstones(&self, batch: &[PendingInvalidation]) {
        for pending in batch {
            self.container
                .apply_invalidation(&pending.key, pending.version, true);
        }
    }

    async fn send_with_retries(&self, targets: &[NodeId], command: &Command) -> bool {
        let mut remaining = targets.to_vec();
        let attempts = self.config.invalidation_retries + 1;

        for attempt in 1..=attempts {
            if remaining.is_empty() {
                break;
            }

            let results = transport::broadcast(self.transport.as_ref(), &remaining, command).await;
            remaining = results
                .into_iter()
                .filter_map(|(node, result)| match result {
                    Ok(_) => None,
                    Err(error) => {
                        tracing::warn!(
                            "Failed to invalidate on {} (attempt {}/{}): {}",
                            node,
                            attempt,
                            attempts,
                            error
                        );
                        Some(node)
                    }
                })
                .collect();
        }

        remaining.is_empty()
    }

    /// Flush invalidations periodically and whenever a batch fills up.
    pub fn spawn_invalidation_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let requested = self.flush_requested.clone();
        let period = self.config.invalidation_flush_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = requested.notified() => {}
                }

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.start_flush().await;
            }
        })
    }

    /// Ask every member of `topology` for its highest counter per segment.
    /// A member that does not answer within the per-request timeout counts
    /// as zero; exceeding the overall deadline fails the whole computation.
    pub async fn compute_max_versions(&self, topology: &Topology) -> Result<Vec<u64>> {
        let mut max = self.local_max_versions();
        let others = topology.other_members(&self.local);
        let command = Command::State(StateRequest::MaxVersions {
            topology_id: topology.id(),
        });

        let requests = others.iter().map(|node| {
            let command = command.clone();
            async move { (node, self.transport.send(node, command).await) }
        });

        let responses = tokio::time::timeout(
            self.config.state_transfer_timeout(),
            join_all(requests),
        )
        .await
        .map_err(|_| {
            ScatterError::Timeout(format!(
                "max versions for topology {} not collected within {:?}",
                topology.id(),
                self.config.state_transfer_timeout()
            ))
        })?;

        for (node, response) in responses {
            match response {
                Ok(Response::MaxVersions(versions)) => {
                    for (current, reported) in max.iter_mut().zip(versions) {
                        *current = (*current).max(reported);
                    }
                }
                Ok(other) => {
                    tracing::warn!("Unexpected max versions response from {}: {:?}", node, other);
                }
                Err(error) => {
                    tracing::warn!(
                        "No max versions from {} for topology {}, assuming 0: {}",
                        node,
                        topology.id(),
                        error
                    );
                }
            }
        }

        Ok(max)
    }

    /// Highest counter this node knows of for every segment, from its
    /// counters and its stored entries.
    pub fn local_max_versions(&self) -> Vec<u64> {
        self.versions
            .snapshot()
            .into_iter()
            .zip(self.container.max_version_per_segment())
            .map(|(counter, stored)| counter.max(stored))
            .collect()
    }

    pub fn enter_degraded(&self, segments: &BTreeSet<SegmentId>) {
        if segments.is_empty() {
            return;
        }
        tracing::warn!(
            "Node {} entering degraded mode for {} segments",
            self.local,
            segments.len()
        );
        self.degraded.write().extend(segments.iter().copied());
    }

    pub fn clear_degraded(&self) {
        self.degraded.write().clear();
    }

    pub fn is_degraded(&self, segment: SegmentId) -> bool {
        self.degraded.read().contains(&segment)
    }

    pub fn degraded_segments(&self) -> BTreeSet<SegmentId> {
        self.degraded.read().clone()
    }

    /// Track versions of entries loaded from persistence, so the first
    /// topology can start above every preloaded one.
    pub fn update_preloaded_entry_version(&self, version: EntryVersion) {
        self.preloaded_topology_id
            .fetch_max(version.topology_id, Ordering::AcqRel);
    }

    pub fn preloaded_topology_id(&self) -> TopologyId {
        self.preloaded_topology_id.load(Ordering::Acquire)
    }

    pub fn print_table(&self) -> String {
        let table = format!(
            "node {} topology {}{}",
            self.local,
            self.topology_id(),
            self.states.table()
        );
        tracing::debug!("{}", table);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::InvalidateVersionsCommand;
    use crate::container::CacheEntry;
    use crate::transport::{CommandHandler, InMemoryNetwork};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recorder {
        max_versions: Vec<u64>,
        invalidations: Mutex<Vec<InvalidateVersionsCommand>>,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn handle(&self, _origin: NodeId, command: Command) -> Result<Response> {
            match command {
                Command::InvalidateVersions(command) => {
                    self.invalidations.lock().push(command);
                    Ok(Response::Ack)
                }
                Command::State(StateRequest::MaxVersions { .. }) => {
                    Ok(Response::MaxVersions(self.max_versions.clone()))
                }
                _ => Ok(Response::Ack),
            }
        }
    }

    fn config() -> ScatteredConfig {
        ScatteredConfig {
            num_segments: 8,
            invalidation_batch_size: 4,
            remote_timeout_ms: 100,
            state_transfer_timeout_ms: 1_000,
            ..ScatteredConfig::default()
        }
    }

    fn key(name: &str) -> Key {
        Bytes::copy_from_slice(name.as_bytes())
    }

    struct Fixture {
        network: Arc<InMemoryNetwork>,
        manager: ScatteredVersionManager,
        peers: Vec<Arc<Recorder>>,
    }

    fn fixture(peer_versions: &[Vec<u64>]) -> Fixture {
        let network = InMemoryNetwork::new();
        let config = config();
        let mut members = vec![NodeId::from("a")];
        let mut peers = Vec::new();

        for (index, versions) in peer_versions.iter().enumerate() {
            let node = NodeId::from(format!("p{}", index));
            let recorder = Arc::new(Recorder {
                max_versions: versions.clone(),
                invalidations: Mutex::new(Vec::new()),
            });
            let handler: Arc<dyn CommandHandler> = recorder.clone();
            network.register(node.clone(), Arc::downgrade(&handler));
            members.push(node);
            peers.push(recorder);
        }

        let transport = Arc::new(network.endpoint(NodeId::from("a"), config.remote_timeout()));
        let manager = ScatteredVersionManager::new(
            NodeId::from("a"),
            config.clone(),
            Arc::new(DataContainer::new(config.num_segments)),
            transport,
            EventBus::default(),
        );
        manager
            .set_topology(Topology::balanced(1, members, config.num_segments))
            .unwrap();

        Fixture {
            network,
            manager,
            peers,
        }
    }

    #[test]
    fn test_increment_requires_ownership() {
        let fixture = fixture(&[]);
        let manager = &fixture.manager;

        assert!(matches!(
            manager.increment_version(4),
            Err(ScatterError::NotOwner { segment: 4, .. })
        ));

        manager.register_segment(4, 1).unwrap();
        assert!(matches!(
            manager.increment_version(4),
            Err(ScatterError::SegmentBlocked(4))
        ));

        manager.start_key_transfer(&BTreeSet::from([4]), 1).unwrap();
        let first = manager.increment_version(4).unwrap();
        let second = manager.increment_version(4).unwrap();
        assert!(second.entry_version() > first.entry_version());
        assert_eq!(first.topology_id, 1);
    }

    #[tokio::test]
    async fn test_blocked_write_gives_up_after_remote_timeout() {
        let fixture = fixture(&[]);
        fixture.manager.register_segment(2, 1).unwrap();

        let error = fixture
            .manager
            .increment_version_when_unblocked(2)
            .await
            .unwrap_err();
        assert!(matches!(error, ScatterError::SegmentBlocked(2)));
        assert!(error.is_retriable());
        assert_eq!(fixture.manager.segment_version(2), 0);
    }

    #[test]
    fn test_clearing_invalidations_of_lost_segments() {
        let fixture = fixture(&[]);
        let manager = &fixture.manager;
        let lost = key("lost");
        let kept = (0..)
            .map(|i| key(&format!("kept-{}", i)))
            .find(|candidate| manager.container.segment_of(candidate) != manager.container.segment_of(&lost))
            .unwrap();

        manager.schedule_key_invalidation(lost.clone(), EntryVersion::new(1, 1), false);
        manager.schedule_key_invalidation(kept.clone(), EntryVersion::new(1, 1), true);
        manager.clear_invalidations_for_segments(&BTreeSet::from([manager.container.segment_of(&lost)]));
        assert_eq!(manager.pending_invalidations().scheduled_version(&lost), None);
        assert!(manager.pending_invalidations().scheduled_version(&kept).is_some());

        manager.clear_invalidations();
        assert!(manager.pending_invalidations().is_empty());
    }

    #[test]
    fn test_topology_id_must_increase() {
        let fixture = fixture(&[]);
        assert!(fixture.manager.set_topology_id(1).is_err());
        fixture.manager.set_topology_id(3).unwrap();
        assert_eq!(fixture.manager.topology_id(), 3);
    }

    #[tokio::test]
    async fn test_flush_sends_merged_batch_to_non_backup_members() {
        let fixture = fixture(&[vec![], vec![]]);
        let manager = &fixture.manager;
        manager.set_owned_segments(&(0..8).collect(), 1).unwrap();

        let k = key("k");
        let segment = fixture.manager.container.segment_of(&k);
        let first = manager.increment_version(segment).unwrap();
        manager.schedule_key_invalidation(k.clone(), first.entry_version(), false);
        let second = manager.increment_version(segment).unwrap();
        manager.schedule_key_invalidation(k.clone(), second.entry_version(), false);

        assert!(manager.start_flush().await);

        // p0 is the backup of a, only p1 is invalidated.
        assert!(fixture.peers[0].invalidations.lock().is_empty());
        let received = fixture.peers[1].invalidations.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].keys, vec![k]);
        assert_eq!(received[0].versions, vec![second.entry_version()]);
    }

    #[tokio::test]
    async fn test_removal_batch_follows_acknowledged_regular_batch() {
        let fixture = fixture(&[vec![], vec![]]);
        let manager = &fixture.manager;
        let version = EntryVersion::new(1, 9);
        manager
            .container
            .commit_if_newer(key("gone"), CacheEntry::tombstone(version));
        manager.schedule_key_invalidation(key("gone"), version, true);

        assert!(manager.start_flush().await);

        let received = fixture.peers[0].invalidations.lock().clone();
        assert_eq!(received.len(), 1);
        assert!(received[0].removal);
        assert_eq!(fixture.peers[1].invalidations.lock().len(), 2);
        assert!(manager.container.get(b"gone").is_none());
        assert!(manager.pending_invalidations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_requeues() {
        let fixture = fixture(&[vec![], vec![]]);
        fixture.network.crash(&NodeId::from("p1"));
        fixture
            .manager
            .schedule_key_invalidation(key("k"), EntryVersion::new(1, 1), false);

        assert!(fixture.manager.start_flush().await);
        assert_eq!(fixture.manager.pending_invalidations().scheduled_len(), 1);
    }

    #[tokio::test]
    async fn test_max_versions_treat_silent_member_as_zero() {
        let fixture = fixture(&[vec![10; 8], vec![99; 8], vec![15; 8]]);
        fixture.network.hang(&NodeId::from("p1"));

        let topology = fixture.manager.topology();
        let max = fixture.manager.compute_max_versions(&topology).await.unwrap();
        assert_eq!(max[2], 15);
        assert!(max.iter().all(|version| *version == 15));
    }

    #[tokio::test]
    async fn test_wait_for_topology_resolves_on_install() {
        let fixture = fixture(&[]);
        let manager = Arc::new(fixture.manager);
        let waiter = manager.clone();
        let wait = tokio::spawn(async move { waiter.wait_for_topology(2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.set_topology_id(2).unwrap();
        wait.await.unwrap().unwrap();
    }

    #[test]
    fn test_degraded_segments_reject_writes() {
        let fixture = fixture(&[]);
        fixture.manager.set_owned_segments(&BTreeSet::from([1]), 1).unwrap();
        fixture.manager.enter_degraded(&BTreeSet::from([1]));
        assert!(matches!(
            fixture.manager.increment_version(1),
            Err(ScatterError::Unavailable(1))
        ));
        fixture.manager.clear_degraded();
        assert!(fixture.manager.increment_version(1).is_ok());
    }

    #[test]
    fn test_preloaded_topology_tracking() {
        let fixture = fixture(&[]);
        fixture
            .manager
            .update_preloaded_entry_version(EntryVersion::new(7, 3));
        fixture
            .manager
            .update_preloaded_entry_version(EntryVersion::new(4, 30));
        assert_eq!(fixture.manager.preloaded_topology_id(), 7);
        assert!(fixture.manager.print_table().starts_with("node a topology 1"));
    }
}
