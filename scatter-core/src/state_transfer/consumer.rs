use crate::bias::BiasManager;
use crate::command::{BackupCommand, Command, InvalidateVersionsCommand, Response, StateRequest};
use crate::container::{CacheEntry, DataContainer};
use crate::error::{Result, ScatterError};
use crate::segment_state::SegmentState;
use crate::state_transfer::{StateProvider, moved_segments};
use crate::topology::Topology;
use crate::transport::{self, Transport};
use crate::types::{EntryVersion, Key, NodeId, SegmentId, TopologyId};
use crate::version_manager::ScatteredVersionManager;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Holders of a key reported during key transfer, highest version first.
type Candidates = HashMap<Key, Vec<(EntryVersion, NodeId)>>;

pub struct StateConsumer {
    manager: Arc<ScatteredVersionManager>,
    container: Arc<DataContainer>,
    bias: Arc<BiasManager>,
    transport: Arc<dyn Transport>,
    provider: Arc<StateProvider>,
    running: Mutex<Option<JoinHandle<()>>>,
    completed: watch::Sender<TopologyId>,
}

impl StateConsumer {
    pub fn new(
        manager: Arc<ScatteredVersionManager>,
        container: Arc<DataContainer>,
        bias: Arc<BiasManager>,
        transport: Arc<dyn Transport>,
        provider: Arc<StateProvider>,
    ) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            manager,
            container,
            bias,
            transport,
            provider,
            running: Mutex::new(None),
            completed,
        }
    }

    /// React to a newly installed topology: drop segments this node lost,
    /// reset transfers the previous rebalance left unfinished and start
    /// taking over the segments it gained.
    pub fn on_topology_update(self: &Arc<Self>, previous: Arc<Topology>, topology: Arc<Topology>) -> Result<()> {
        if let Some(task) = self.running.lock().take() {
            task.abort();
        }

        let local = self.manager.local().clone();
        let topology_id = topology.id();
        let num_segments = self.manager.num_segments();
        let owned = topology.owned_segments(&local);

        let mut lost = BTreeSet::new();
        for segment in 0..num_segments {
            if !owned.contains(&segment) && self.manager.segment_state(segment) != SegmentState::NotOwned {
                self.manager.unregister_segment(segment, topology_id);
                lost.insert(segment);
            }
        }
        if !lost.is_empty() {
            self.manager.clear_invalidations_for_segments(&lost);
            self.container.discard_remote(&lost);
            self.bias.clear_remote_for_segments(&lost, num_segments);
        }

        self.bias
            .revoke_local_bias_for_segments(&moved_segments(&previous, &topology), num_segments);

        let mut gained = BTreeSet::new();
        for segment in &owned {
            match self.manager.segment_state(*segment) {
                SegmentState::Owned => {}
                SegmentState::NotOwned => {
                    gained.insert(*segment);
                }
                unfinished => {
                    tracing::debug!(
                        "Restarting transfer of segment {} left in {:?}",
                        segment,
                        unfinished
                    );
                    self.manager.unregister_segment(*segment, topology_id);
                    self.container.discard_remote(&BTreeSet::from([*segment]));
                    gained.insert(*segment);
                }
            }
        }

        // Alone in the cluster there is nobody to fetch state from.
        let transfer = !gained.is_empty()
            && !topology.other_members(&local).is_empty()
            && self.manager.config().fetch_in_memory_state;

        if transfer {
            for segment in &gained {
                self.manager.register_segment(*segment, topology_id)?;
            }
        } else {
            let max = self.manager.local_max_versions();
            for segment in &gained {
                self.manager
                    .set_segment_version(*segment, max[usize::from(*segment)]);
            }
            self.manager.set_owned_segments(&gained, topology_id)?;
        }

        tracing::info!(
            "Node {} topology {}: owns {} segments, gained {}, lost {}",
            local,
            topology_id,
            owned.len(),
            gained.len(),
            lost.len()
        );

        let consumer = self.clone();
        let task = tokio::spawn(async move {
            if let Err(error) = consumer.provider.push_to_new_backup(&previous, &topology).await {
                tracing::warn!(
                    "Pushing entries to the new backup for topology {} failed: {}",
                    topology_id,
                    error
                );
            }

            if transfer {
                match consumer.transfer(&topology, gained).await {
                    Ok(()) => {
                        tracing::info!(
                            "Node {} finished state transfer for topology {}",
                            consumer.manager.local(),
                            topology_id
                        );
                    }
                    Err(error) => {
                        tracing::warn!(
                            "State transfer for topology {} on {} incomplete: {}",
                            topology_id,
                            consumer.manager.local(),
                            error
                        );
                    }
                }
            }

            consumer
                .completed
                .send_if_modified(|completed| {
                    if topology_id > *completed {
                        *completed = topology_id;
                        true
                    } else {
                        false
                    }
                });
        });
        *self.running.lock() = Some(task);
        Ok(())
    }

    /// Resolve once the rebalance for `topology_id` (or a newer one) ran to
    /// its end.
    pub async fn wait_for_transfer(&self, topology_id: TopologyId) -> Result<()> {
        let mut receiver = self.completed.subscribe();
        let timeout = self.manager.config().state_transfer_timeout();
        match tokio::time::timeout(timeout, receiver.wait_for(|done| *done >= topology_id)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ScatterError::Stopping),
            Err(_) => Err(ScatterError::Timeout(format!(
                "state transfer for topology {} did not finish within {:?}",
                topology_id, timeout
            ))),
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.running.lock().take() {
            task.abort();
        }
    }

    async fn transfer(&self, topology: &Topology, segments: BTreeSet<SegmentId>) -> Result<()> {
        let topology_id = topology.id();
        let local = self.manager.local().clone();
        let others = topology.other_members(&local);

        self.confirm_revocation(topology, &segments, &others).await?;
        self.manager.start_key_transfer(&segments, topology_id)?;

        let max = self.max_versions(topology, &segments).await?;
        for segment in &segments {
            self.manager
                .set_segment_version(*segment, max[usize::from(*segment)]);
        }

        let candidates = self.collect_keys(topology, &segments, &others).await;
        let mut expecting = BTreeSet::new();
        for segment in &segments {
            let expect_values = !self.container.remote_entries(*segment).is_empty();
            let transition = self
                .manager
                .key_transfer_finished(*segment, topology_id, expect_values)?;
            if transition.is_applied() && expect_values {
                expecting.insert(*segment);
            }
        }

        let stuck = self.fetch_values(&expecting, &candidates).await;
        self.invalidate_and_backup(topology, &segments, &candidates)
            .await;

        for segment in expecting.difference(&stuck) {
            self.manager.value_transfer_finished(*segment, topology_id)?;
        }

        match stuck.first() {
            Some(segment) => Err(ScatterError::StateTransferInProgress(*segment)),
            None => Ok(()),
        }
    }

    /// Every other member of `topology` must confirm before the segments
    /// leave `Blocked`. Members that do not answer are asked again until
    /// they do or a newer topology replaces this one.
    async fn confirm_revocation(&self, topology: &Topology, segments: &BTreeSet<SegmentId>, others: &[NodeId]) -> Result<()> {
        let command = Command::State(StateRequest::ConfirmRevokedSegments {
            topology_id: topology.id(),
            segments: segments.clone(),
        });
        let mut pending = others.to_vec();
        let mut attempt: u64 = 0;

        while !pending.is_empty() {
            let current = self.manager.topology_id();
            if current != topology.id() {
                return Err(ScatterError::OutdatedTopology {
                    command: topology.id(),
                    current,
                });
            }

            attempt += 1;
            pending = transport::broadcast(self.transport.as_ref(), &pending, &command)
                .await
                .into_iter()
                .filter_map(|(node, result)| match result {
                    Ok(_) => None,
                    Err(error) => {
                        tracing::warn!(
                            "{} did not confirm revocation of {} segments for topology {} (attempt {}): {}",
                            node,
                            segments.len(),
                            topology.id(),
                            attempt,
                            error
                        );
                        Some(node)
                    }
                })
                .collect();

            if !pending.is_empty() {
                tokio::time::sleep(Duration::from_millis(10 * attempt.min(10))).await;
            }
        }
        Ok(())
    }

    async fn max_versions(&self, topology: &Topology, segments: &BTreeSet<SegmentId>) -> Result<Vec<u64>> {
        let attempts = self.manager.config().max_command_retries;
        for attempt in 1..=attempts {
            match self.manager.compute_max_versions(topology).await {
                Ok(max) => return Ok(max),
                Err(error) if error.is_retriable() && attempt < attempts => {
                    tracing::warn!(
                        "Computing max versions for topology {} failed (attempt {}/{}): {}",
                        topology.id(),
                        attempt,
                        attempts,
                        error
                    );
                }
                Err(error) => {
                    tracing::warn!("Giving up on max versions for topology {}: {}", topology.id(), error);
                    break;
                }
            }
        }

        let segment = segments.first().copied().unwrap_or_default();
        Err(ScatterError::StateTransferInProgress(segment))
    }

    /// Ask every member for the keys it holds in `segments` and record them
    /// as remote metadata unless this node already holds a newer version.
    async fn collect_keys(&self, topology: &Topology, segments: &BTreeSet<SegmentId>, others: &[NodeId]) -> Candidates {
        let command = Command::State(StateRequest::KeysInSegments {
            topology_id: topology.id(),
            segments: segments.clone(),
        });

        let mut candidates = Candidates::new();
        for (node, result) in transport::broadcast(self.transport.as_ref(), others, &command).await {
            match result {
                Ok(Response::Keys(keys)) => {
                    for (key, version) in keys {
                        self.container
                            .commit_if_newer(key.clone(), CacheEntry::remote(version, node.clone()));
                        candidates
                            .entry(key)
                            .or_default()
                            .push((version, node.clone()));
                    }
                }
                Ok(other) => {
                    tracing::warn!("Unexpected response to key request from {}: {:?}", node, other);
                }
                Err(error) => {
                    tracing::warn!("No keys from {} for topology {}: {}", node, topology.id(), error);
                }
            }
        }

        for holders in candidates.values_mut() {
            holders.sort_by(|a, b| b.0.cmp(&a.0));
        }
        candidates
    }

    /// Fetch every value still known only as remote metadata, falling back
    /// to the next holder when one fails. Returns the segments left with
    /// unfetched values.
    async fn fetch_values(&self, segments: &BTreeSet<SegmentId>, candidates: &Candidates) -> BTreeSet<SegmentId> {
        let chunk_size = self.manager.config().state_transfer_chunk_size;
        let mut pending: Vec<Key> = segments
            .iter()
            .flat_map(|segment| self.container.remote_entries(*segment))
            .map(|(key, _, _)| key)
            .collect();
        let mut failed: HashSet<Key> = HashSet::new();
        let mut stuck = BTreeSet::new();
        let mut round = 0;

        while !pending.is_empty() {
            let mut by_holder: HashMap<NodeId, Vec<Key>> = HashMap::new();
            for key in pending.drain(..) {
                match candidates.get(&key).and_then(|holders| holders.get(round)) {
                    Some((_, holder)) => by_holder.entry(holder.clone()).or_default().push(key),
                    None if failed.contains(&key) => {
                        stuck.insert(self.container.segment_of(&key));
                    }
                    None => {
                        // Every holder answered without the key.
                        self.container.remove_if_remote(&key);
                    }
                }
            }

            let requests = by_holder.iter().flat_map(|(holder, keys)| {
                keys.chunks(chunk_size).map(move |chunk| async move {
                    let command = Command::State(StateRequest::GetValues { keys: chunk.to_vec() });
                    (holder, chunk, self.transport.send(holder, command).await)
                })
            });

            for (holder, chunk, result) in join_all(requests).await {
                match result {
                    Ok(Response::Entries(entries)) => {
                        for (key, entry) in entries {
                            if !entry.is_remote() {
                                self.container.commit_transferred(key, entry);
                            }
                        }
                    }
                    Ok(other) => {
                        tracing::warn!("Unexpected response to value request from {}: {:?}", holder, other);
                        failed.extend(chunk.iter().cloned());
                    }
                    Err(error) => {
                        tracing::warn!(
                            "Fetching {} values from {} failed, trying next holder: {}",
                            chunk.len(),
                            holder,
                            error
                        );
                        failed.extend(chunk.iter().cloned());
                    }
                }

                pending.extend(
                    chunk
                        .iter()
                        .filter(|key| self.container.get(key).is_some_and(|entry| entry.is_remote()))
                        .cloned(),
                );
            }
            round += 1;
        }

        stuck
    }

    /// Entries fetched from a holder stay there as its second copy; every
    /// other holder drops its copy. Entries this node was already
    /// authoritative for are copied to its backup instead.
    async fn invalidate_and_backup(&self, topology: &Topology, segments: &BTreeSet<SegmentId>, candidates: &Candidates) {
        let local = self.manager.local().clone();
        let backup = topology.next_member(&local).cloned();
        let mut invalidations: HashMap<NodeId, Vec<(Key, EntryVersion)>> = HashMap::new();
        let mut backups = Vec::new();

        for (key, entry) in self.container.entries_in_segments(segments) {
            let version = entry.version();
            let holders = candidates.get(&key).map(Vec::as_slice).unwrap_or_default();
            let source = holders
                .iter()
                .find(|(held, _)| *held == version)
                .map(|(_, node)| node.clone());

            let keep = match source {
                Some(source) => Some(source),
                None => {
                    backups.push((key.clone(), entry));
                    backup.clone()
                }
            };

            for (_, node) in holders {
                if Some(node) != keep.as_ref() {
                    invalidations
                        .entry(node.clone())
                        .or_default()
                        .push((key.clone(), version));
                }
            }
        }

        let chunk_size = self.manager.config().state_transfer_chunk_size;
        if let Some(backup) = &backup {
            for chunk in backups.chunks(chunk_size) {
                let command = Command::Backup(BackupCommand {
                    topology_id: topology.id(),
                    entries: chunk.to_vec(),
                });
                if let Err(error) = self.transport.send(backup, command).await {
                    tracing::warn!("Backing up {} transferred entries to {} failed: {}", chunk.len(), backup, error);
                }
            }
        }

        for (node, keys) in invalidations {
            for chunk in keys.chunks(chunk_size) {
                let command = Command::InvalidateVersions(InvalidateVersionsCommand {
                    keys: chunk.iter().map(|(key, _)| key.clone()).collect(),
                    versions: chunk.iter().map(|(_, version)| *version).collect(),
                    removal: true,
                });
                if let Err(error) = self.transport.send(&node, command).await {
                    tracing::warn!("Dropping old copies on {} failed: {}", node, error);
                }
            }
        }
    }
}
