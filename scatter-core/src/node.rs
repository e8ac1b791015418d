//! A cluster member.
//!
//! Writes are routed to the primary owner of the key's segment. On the
//! primary a write mints a version, revokes read bias held by other nodes,
//! commits locally, replicates to the backup (the next member) and queues
//! an invalidation for every other member. Reads go to the primary unless
//! this node holds read bias for the key.

use crate::bias::{self, BiasManager, Revocation};
use crate::command::{
    BackupCommand, Command, GetCommand, InvalidateVersionsCommand, PutMapCommand, Response,
    RevokeBiasCommand, WriteCommand, WriteOp, WriteResult,
};
use crate::config::{BiasAcquisition, NUM_OWNERS, ScatteredConfig};
use crate::container::{CacheEntry, CommitOutcome, DataContainer};
use crate::error::{Result, ScatterError};
use crate::events::{EventBus, ScatterEvent};
use crate::segment_state::SegmentState;
use crate::state_transfer::{StateConsumer, StateProvider};
use crate::topology::Topology;
use crate::transport::{self, CommandHandler, Transport};
use crate::types::{EntryVersion, Key, NodeId, SegmentId, TopologyId, Value};
use crate::version_manager::ScatteredVersionManager;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A write that passed its condition check on the primary and waits to be
/// committed.
#[derive(Debug, Clone)]
pub struct ReadyWrite {
    command: WriteCommand,
    segment: SegmentId,
    topology_id: TopologyId,
    /// Version of the entry the previous value was loaded from; `None` when
    /// the write does not depend on it.
    seen: Option<Option<EntryVersion>>,
    previous: Option<Value>,
    new_value: Option<Value>,
}

impl ReadyWrite {
    pub fn seen_version(&self) -> Option<EntryVersion> {
        self.seen.flatten()
    }
}

#[derive(Debug, Clone)]
pub enum PreparedWrite {
    /// The condition did not hold; nothing will be written.
    NotApplied(WriteResult),
    Ready(ReadyWrite),
}

pub struct ScatteredNode {
    id: NodeId,
    config: ScatteredConfig,
    container: Arc<DataContainer>,
    manager: Arc<ScatteredVersionManager>,
    bias: Arc<BiasManager>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    consumer: Arc<StateConsumer>,
    provider: Arc<StateProvider>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ScatteredNode {
    pub fn new(id: NodeId, config: ScatteredConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;

        let events = EventBus::default();
        let container = Arc::new(DataContainer::new(config.num_segments));
        let manager = Arc::new(ScatteredVersionManager::new(
            id.clone(),
            config.clone(),
            container.clone(),
            transport.clone(),
            events.clone(),
        ));
        let bias = Arc::new(BiasManager::new(&config));
        let provider = Arc::new(StateProvider::new(
            manager.clone(),
            container.clone(),
            bias.clone(),
            transport.clone(),
        ));
        let consumer = Arc::new(StateConsumer::new(
            manager.clone(),
            container.clone(),
            bias.clone(),
            transport.clone(),
            provider.clone(),
        ));

        Ok(Arc::new(Self {
            id,
            config,
            container,
            manager,
            bias,
            transport,
            events,
            consumer,
            provider,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Start background work. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            tasks.push(self.manager.spawn_invalidation_flusher());
            tasks.push(self.bias.spawn_expiry());
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.consumer.stop();
        tracing::info!("Node {} stopped", self.id);
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &ScatteredConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ScatteredVersionManager> {
        &self.manager
    }

    pub fn container(&self) -> &Arc<DataContainer> {
        &self.container
    }

    pub fn bias(&self) -> &Arc<BiasManager> {
        &self.bias
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.manager.topology()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScatterEvent> {
        self.events.subscribe()
    }

    /// Load entries restored from persistence before joining.
    pub fn preload(&self, entries: Vec<(Key, Value, EntryVersion)>) {
        for (key, value, version) in entries {
            self.manager.update_preloaded_entry_version(version);
            self.container
                .commit_if_newer(key, CacheEntry::local(value, version));
        }
    }

    pub fn install_topology(&self, topology: Topology) -> Result<()> {
        let previous = self.manager.topology();
        self.manager.set_topology(topology)?;
        let current = self.manager.topology();
        self.bias.set_topology(current.id());

        let lost: Vec<&NodeId> = previous
            .members()
            .iter()
            .filter(|member| !current.is_member(member))
            .collect();
        if lost.len() >= NUM_OWNERS {
            let segments: BTreeSet<SegmentId> = lost
                .iter()
                .flat_map(|member| previous.owned_segments(member))
                .collect();
            tracing::warn!(
                "Node {} lost {} members at once in topology {}",
                self.id,
                lost.len(),
                current.id()
            );
            self.manager.enter_degraded(&segments);
        }

        self.consumer.on_topology_update(previous, current)
    }

    pub fn clear_degraded(&self) {
        tracing::info!("Node {} leaving degraded mode", self.id);
        self.manager.clear_degraded();
    }

    pub async fn wait_for_transfer(&self, topology_id: TopologyId) -> Result<()> {
        self.consumer.wait_for_transfer(topology_id).await
    }

    /// Drop every entry on every member. Pending invalidations and all bias
    /// state go with them; segment versions keep counting up.
    pub async fn clear(&self) -> Result<()> {
        self.clear_local();

        let others = self.manager.topology().other_members(&self.id);
        let failed: Vec<NodeId> = transport::broadcast(self.transport.as_ref(), &others, &Command::Clear)
            .await
            .into_iter()
            .filter_map(|(node, result)| {
                result.err().map(|error| {
                    tracing::warn!("Clear on {} failed: {}", node, error);
                    node
                })
            })
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ScatterError::Transport(format!("clear failed on {:?}", failed)))
        }
    }

    fn clear_local(&self) {
        self.manager.clear_invalidations();
        let dropped = self.container.len();
        self.container.clear();
        self.bias.clear();
        tracing::info!("Node {} cleared {} entries", self.id, dropped);
    }

    pub async fn put(&self, key: Key, value: Value) -> Result<()> {
        self.write(key, WriteOp::Put(value), false).await?;
        Ok(())
    }

    /// Store `value` and return the value it replaced.
    pub async fn put_returning(&self, key: Key, value: Value) -> Result<Option<Value>> {
        Ok(self.write(key, WriteOp::Put(value), true).await?.previous)
    }

    pub async fn put_if_absent(&self, key: Key, value: Value) -> Result<bool> {
        Ok(self
            .write(key, WriteOp::PutIfAbsent(value), false)
            .await?
            .applied)
    }

    pub async fn replace(&self, key: Key, expected: Value, value: Value) -> Result<bool> {
        Ok(self
            .write(key, WriteOp::Replace { expected, value }, false)
            .await?
            .applied)
    }

    pub async fn remove(&self, key: Key) -> Result<Option<Value>> {
        Ok(self.write(key, WriteOp::Remove, true).await?.previous)
    }

    async fn write(&self, key: Key, op: WriteOp, return_previous: bool) -> Result<WriteResult> {
        let max_attempts = self.config.max_command_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let topology = self.manager.topology();
            let segment = topology.segment_for_key(&key);
            let primary = topology
                .primary(segment)
                .cloned()
                .ok_or(ScatterError::Unavailable(segment))?;

            let command = WriteCommand {
                key: key.clone(),
                op: op.clone(),
                origin: self.id.clone(),
                topology_id: topology.id(),
                return_previous,
            };

            let result = if primary == self.id {
                self.execute_write(command).await
            } else {
                match self.transport.send(&primary, Command::Write(command)).await {
                    Ok(Response::Written(result)) => Ok(result),
                    Ok(other) => Err(unexpected(&primary, &other)),
                    Err(error) => Err(error),
                }
            };

            match result {
                Ok(result) => {
                    if result.bias_granted && primary != self.id {
                        self.accept_write_bias(&key, &op, &result, topology.id());
                    }
                    return Ok(result);
                }
                Err(error) if error.is_retriable() && attempt < max_attempts => {
                    tracing::debug!(
                        "Retrying write of {} on {} (attempt {}/{}): {}",
                        String::from_utf8_lossy(&key),
                        primary,
                        attempt,
                        max_attempts,
                        error
                    );
                    backoff(&error, attempt).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn accept_write_bias(&self, key: &Key, op: &WriteOp, result: &WriteResult, topology_id: TopologyId) {
        let value = match op {
            WriteOp::Put(value) | WriteOp::PutIfAbsent(value) | WriteOp::Replace { value, .. } => value,
            WriteOp::Remove => return,
        };
        if let Some(version) = result.version {
            self.container
                .commit_if_newer(key.clone(), CacheEntry::local(value.clone(), version));
            self.bias.add_local_bias(key.clone(), topology_id);
        }
    }

    /// Run a single-key write on this node as primary owner.
    pub async fn execute_write(&self, command: WriteCommand) -> Result<WriteResult> {
        match self.prepare_write(command).await? {
            PreparedWrite::NotApplied(result) => Ok(result),
            PreparedWrite::Ready(ready) => self.commit_write(ready).await,
        }
    }

    /// Check ownership and, when the write depends on it, load the current
    /// value and evaluate the condition.
    pub async fn prepare_write(&self, command: WriteCommand) -> Result<PreparedWrite> {
        let topology = self.primary_topology(command.topology_id).await?;
        let segment = self.ensure_primary(&topology, &command.key, command.topology_id)?;

        let (seen, previous) = if command.loads_previous() {
            let entry = self.load_entry(&command.key, segment).await?;
            let version = entry.as_ref().map(CacheEntry::version);
            (Some(version), entry.and_then(|entry| entry.value))
        } else {
            (None, None)
        };

        let Some(new_value) = command.op.resolve(previous.as_ref()) else {
            return Ok(PreparedWrite::NotApplied(WriteResult::not_applied(previous)));
        };

        Ok(PreparedWrite::Ready(ReadyWrite {
            command,
            segment,
            topology_id: topology.id(),
            seen,
            previous,
            new_value,
        }))
    }

    /// Mint the version, revoke bias, commit, back up and schedule the
    /// invalidation. Fails with `ConcurrentChange` when the entry moved
    /// since [`prepare_write`](Self::prepare_write) loaded it.
    pub async fn commit_write(&self, ready: ReadyWrite) -> Result<WriteResult> {
        let ReadyWrite {
            command,
            segment,
            topology_id,
            seen,
            previous,
            new_value,
        } = ready;
        let WriteCommand { key, origin, .. } = command;

        let version = self
            .manager
            .increment_version_when_unblocked(segment)
            .await?
            .entry_version();

        let grant = origin != self.id
            && self.config.bias_acquisition == BiasAcquisition::OnWrite
            && new_value.is_some();
        let _writing = self.bias.begin_write(&key);
        let revocation = self
            .bias
            .start_revoking_remote_bias(&key, grant.then_some(&origin));
        self.revoke(revocation.into_iter().collect()).await?;

        let removal = new_value.is_none();
        let entry = match new_value {
            Some(value) => CacheEntry::local(value, version),
            None => CacheEntry::tombstone(version),
        };

        let replaced = match seen {
            Some(seen) => Some(
                self.container
                    .commit_if_unchanged(key.clone(), entry.clone(), seen)?,
            ),
            None => match self.container.commit_if_newer(key.clone(), entry.clone()) {
                CommitOutcome::Committed { previous } => Some(previous),
                CommitOutcome::Skipped { current } => {
                    tracing::debug!(
                        "Write of {} at {} superseded by {}",
                        String::from_utf8_lossy(&key),
                        version,
                        current
                    );
                    None
                }
            },
        };

        if let Some(replaced) = replaced {
            self.publish_change(&key, replaced.as_ref(), &entry);
            self.backup(topology_id, vec![(key.clone(), entry)]).await;
            self.manager
                .schedule_key_invalidation(key.clone(), version, removal);
        }

        self.ensure_still_primary(segment, topology_id)?;

        Ok(WriteResult {
            previous,
            applied: true,
            version: Some(version),
            bias_granted: grant,
        })
    }

    pub async fn put_all(&self, entries: Vec<(Key, Value)>) -> Result<usize> {
        let max_attempts = self.config.max_command_retries;
        let mut remaining = entries;
        let mut written = 0;
        let mut attempt = 0;

        while !remaining.is_empty() {
            attempt += 1;
            let topology = self.manager.topology();
            let mut by_primary: HashMap<NodeId, Vec<(Key, Value)>> = HashMap::new();
            for (key, value) in remaining.drain(..) {
                let segment = topology.segment_for_key(&key);
                let primary = topology
                    .primary(segment)
                    .cloned()
                    .ok_or(ScatterError::Unavailable(segment))?;
                by_primary.entry(primary).or_default().push((key, value));
            }

            let batches = by_primary.into_iter().map(|(primary, entries)| {
                let command = PutMapCommand {
                    entries: entries.clone(),
                    origin: self.id.clone(),
                    topology_id: topology.id(),
                };
                async move {
                    let result = if primary == self.id {
                        self.execute_put_map(command).await
                    } else {
                        match self.transport.send(&primary, Command::PutMap(command)).await {
                            Ok(Response::WrittenMany(count)) => Ok(count),
                            Ok(other) => Err(unexpected(&primary, &other)),
                            Err(error) => Err(error),
                        }
                    };
                    (entries, result)
                }
            });

            let mut last_error = None;
            for (entries, result) in join_all(batches).await {
                match result {
                    Ok(count) => written += count,
                    Err(error) if error.is_retriable() && attempt < max_attempts => {
                        tracing::debug!("Retrying {} entries of put_all: {}", entries.len(), error);
                        remaining.extend(entries);
                        last_error = Some(error);
                    }
                    Err(error) => return Err(error),
                }
            }

            if let Some(error) = last_error {
                backoff(&error, attempt).await;
            }
        }

        Ok(written)
    }

    /// Write several keys this node is primary for. Bias held on any of the
    /// keys is revoked with one command per biased node.
    pub async fn execute_put_map(&self, command: PutMapCommand) -> Result<usize> {
        let topology = self.primary_topology(command.topology_id).await?;
        let mut segments = Vec::with_capacity(command.entries.len());
        for (key, _) in &command.entries {
            segments.push(self.ensure_primary(&topology, key, command.topology_id)?);
        }

        let mut versions = Vec::with_capacity(segments.len());
        for segment in &segments {
            versions.push(
                self.manager
                    .increment_version_when_unblocked(*segment)
                    .await?
                    .entry_version(),
            );
        }

        let _writing: Vec<_> = command
            .entries
            .iter()
            .map(|(key, _)| self.bias.begin_write(key))
            .collect();
        let revocations: Vec<Revocation> = command
            .entries
            .iter()
            .filter_map(|(key, _)| self.bias.start_revoking_remote_bias(key, None))
            .collect();
        self.revoke(revocations).await?;

        let mut committed = Vec::new();
        for ((key, value), version) in command.entries.into_iter().zip(versions) {
            let entry = CacheEntry::local(value, version);
            if let CommitOutcome::Committed { previous } =
                self.container.commit_if_newer(key.clone(), entry.clone())
            {
                self.publish_change(&key, previous.as_ref(), &entry);
                committed.push((key, entry));
            }
        }

        let count = committed.len();
        for (key, entry) in &committed {
            self.manager
                .schedule_key_invalidation(key.clone(), entry.version(), false);
        }
        self.backup(topology.id(), committed).await;

        for segment in segments {
            self.ensure_still_primary(segment, topology.id())?;
        }
        Ok(count)
    }

    pub async fn get(&self, key: Key) -> Result<Option<Value>> {
        let max_attempts = self.config.max_command_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_get(&key).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retriable() && attempt < max_attempts => {
                    tracing::debug!(
                        "Retrying read of {} (attempt {}/{}): {}",
                        String::from_utf8_lossy(&key),
                        attempt,
                        max_attempts,
                        error
                    );
                    backoff(&error, attempt).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn try_get(&self, key: &Key) -> Result<Option<Value>> {
        let topology = self.manager.topology();
        let segment = topology.segment_for_key(key);
        let primary = topology
            .primary(segment)
            .cloned()
            .ok_or(ScatterError::Unavailable(segment))?;

        if primary == self.id {
            let entry = self.load_entry(key, segment).await?;
            return Ok(entry.and_then(|entry| entry.value));
        }

        if self.bias.has_local_bias(key) {
            if let Some(entry) = self.container.get(key).filter(|entry| !entry.is_remote()) {
                return Ok(entry.value);
            }
        }

        let command = Command::Get(GetCommand {
            key: key.clone(),
            origin: self.id.clone(),
            topology_id: topology.id(),
            acquire_bias: self.config.bias_acquisition == BiasAcquisition::OnRead,
        });
        match self.transport.send(&primary, command).await? {
            Response::Entry {
                entry,
                bias_granted,
            } => {
                if let (true, Some(entry)) = (bias_granted, &entry) {
                    self.container.commit_if_newer(key.clone(), entry.clone());
                    self.bias.add_local_bias(key.clone(), topology.id());
                }
                Ok(entry.and_then(|entry| entry.value))
            }
            other => Err(unexpected(&primary, &other)),
        }
    }

    async fn handle_get(&self, command: GetCommand) -> Result<Response> {
        let GetCommand {
            key,
            origin,
            topology_id,
            acquire_bias,
        } = command;
        let topology = self.primary_topology(topology_id).await?;
        let segment = self.ensure_primary(&topology, &key, topology_id)?;
        let entry = self.load_entry(&key, segment).await?;

        let mut bias_granted = acquire_bias
            && origin != self.id
            && self.config.bias_acquisition == BiasAcquisition::OnRead
            && entry.as_ref().is_some_and(|entry| entry.value.is_some());
        if bias_granted {
            self.bias.renew_remote_bias(key.clone(), origin);
            // A write that already collected its holders, or committed since
            // the load, would leave the origin caching an outdated value.
            bias_granted = !self.bias.is_write_pending(&key)
                && self.container.version_of(&key) == entry.as_ref().map(CacheEntry::version);
        }

        Ok(Response::Entry {
            entry,
            bias_granted,
        })
    }

    /// Current local entry of a key this node is primary for. Waits while
    /// the segment is blocked and fetches the key ahead of the bulk transfer
    /// while the segment is still being transferred.
    async fn load_entry(&self, key: &Key, segment: SegmentId) -> Result<Option<CacheEntry>> {
        if self.manager.is_degraded(segment) {
            return Err(ScatterError::Unavailable(segment));
        }

        match self.manager.segment_state(segment) {
            SegmentState::NotOwned => {
                return Err(ScatterError::NotOwner {
                    segment,
                    node: self.id.clone(),
                });
            }
            SegmentState::Blocked => {
                self.manager.wait_unblocked(segment).await?;
            }
            _ => {}
        }

        match self.manager.segment_state(segment) {
            SegmentState::NotOwned => return Err(ScatterError::SegmentNoLongerOwned(segment)),
            SegmentState::KeyTransfer if !self.written_since_ownership(key, segment) => self.prefetch(key).await,
            SegmentState::ValueTransfer
                if self
                    .container
                    .get(key)
                    .is_some_and(|entry| entry.is_remote()) =>
            {
                self.prefetch(key).await
            }
            _ => {}
        }

        match self.container.get(key) {
            Some(entry) if entry.is_remote() => Err(ScatterError::StateTransferInProgress(segment)),
            entry => Ok(entry),
        }
    }

    /// Whether this node wrote `key` after becoming its owner, so no other
    /// member can hold a newer copy.
    fn written_since_ownership(&self, key: &[u8], segment: SegmentId) -> bool {
        self.container
            .get(key)
            .is_some_and(|entry| !entry.is_remote() && self.manager.is_version_actual(segment, entry.version()))
    }

    /// Fetch the newest copy of `key` held anywhere in the cluster.
    async fn prefetch(&self, key: &Key) {
        let others = self.manager.topology().other_members(&self.id);
        let command = Command::FetchEntry { key: key.clone() };
        let mut newest: Option<CacheEntry> = None;

        for (node, result) in transport::broadcast(self.transport.as_ref(), &others, &command).await {
            match result {
                Ok(Response::Entry {
                    entry: Some(entry), ..
                }) if !entry.is_remote() => {
                    if newest
                        .as_ref()
                        .is_none_or(|newest| entry.version() > newest.version())
                    {
                        newest = Some(entry);
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::debug!(
                        "Prefetch of {} from {} failed: {}",
                        String::from_utf8_lossy(key),
                        node,
                        error
                    );
                }
            }
        }

        if let Some(entry) = newest {
            self.container.commit_if_newer(key.clone(), entry);
        }
    }

    async fn primary_topology(&self, command_topology: TopologyId) -> Result<Arc<Topology>> {
        if command_topology > self.manager.topology_id() {
            self.manager.wait_for_topology(command_topology).await?;
        }
        Ok(self.manager.topology())
    }

    fn ensure_primary(&self, topology: &Topology, key: &[u8], command_topology: TopologyId) -> Result<SegmentId> {
        let segment = topology.segment_for_key(key);
        if topology.is_primary(&self.id, segment) {
            return Ok(segment);
        }

        if command_topology < topology.id() {
            Err(ScatterError::OutdatedTopology {
                command: command_topology,
                current: topology.id(),
            })
        } else {
            Err(ScatterError::NotOwner {
                segment,
                node: self.id.clone(),
            })
        }
    }

    /// A topology installed while the write ran may have moved the segment;
    /// the origin then retries against the new primary.
    fn ensure_still_primary(&self, segment: SegmentId, topology_id: TopologyId) -> Result<()> {
        let topology = self.manager.topology();
        if topology.id() != topology_id && !topology.is_primary(&self.id, segment) {
            return Err(ScatterError::OutdatedTopology {
                command: topology_id,
                current: topology.id(),
            });
        }
        Ok(())
    }

    async fn revoke(&self, revocations: Vec<Revocation>) -> Result<()> {
        if revocations.is_empty() {
            return Ok(());
        }

        let topology = self.manager.topology();
        let grouped = bias::group_by_holder(&revocations);
        let sends = grouped.into_iter().map(|(holder, keys)| {
            let topology = &topology;
            async move {
                if !topology.is_member(&holder) {
                    return (holder, Ok(Response::Ack));
                }
                let result = self
                    .transport
                    .send(&holder, Command::RevokeBias(RevokeBiasCommand { keys }))
                    .await;
                (holder, result)
            }
        });

        let failed: Vec<NodeId> = join_all(sends)
            .await
            .into_iter()
            .filter_map(|(holder, result)| result.err().map(|_| holder))
            .collect();

        if failed.is_empty() {
            for revocation in &revocations {
                revocation.complete();
            }
            return Ok(());
        }

        for revocation in &revocations {
            revocation.fail();
        }
        Err(ScatterError::Transport(format!(
            "bias revocation failed on {:?}",
            failed
        )))
    }

    async fn backup(&self, topology_id: TopologyId, entries: Vec<(Key, CacheEntry)>) {
        if entries.is_empty() {
            return;
        }
        let Some(backup) = self.manager.topology().next_member(&self.id).cloned() else {
            return;
        };

        let count = entries.len();
        let command = Command::Backup(BackupCommand {
            topology_id,
            entries,
        });
        if let Err(error) = self.transport.send(&backup, command).await {
            tracing::warn!("Backup of {} entries to {} failed: {}", count, backup, error);
        }
    }

    fn apply_backup(&self, command: BackupCommand) {
        for (key, entry) in command.entries {
            if let CommitOutcome::Committed { previous } =
                self.container.commit_if_newer(key.clone(), entry.clone())
            {
                self.publish_change(&key, previous.as_ref(), &entry);
            }
        }
    }

    fn apply_invalidations(&self, command: InvalidateVersionsCommand) -> Result<()> {
        if command.keys.len() != command.versions.len() {
            return Err(ScatterError::InvalidRequest(format!(
                "invalidation carries {} keys but {} versions",
                command.keys.len(),
                command.versions.len()
            )));
        }

        for (key, version) in command.keys.into_iter().zip(command.versions) {
            if self
                .container
                .apply_invalidation(&key, version, command.removal)
            {
                self.bias.revoke_local_bias(&key);
                self.events.publish(ScatterEvent::EntryInvalidated {
                    key,
                    version,
                    at: Utc::now(),
                });
            }
        }
        Ok(())
    }

    fn publish_change(&self, key: &Key, previous: Option<&CacheEntry>, entry: &CacheEntry) {
        let key = key.clone();
        let version = entry.version();
        let at = Utc::now();
        let existed = previous.is_some_and(|previous| previous.value.is_some());

        let event = if entry.is_tombstone() {
            ScatterEvent::EntryRemoved { key, version, at }
        } else if existed {
            ScatterEvent::EntryModified { key, version, at }
        } else {
            ScatterEvent::EntryCreated { key, version, at }
        };
        self.events.publish(event);
    }
}

#[async_trait]
impl CommandHandler for ScatteredNode {
    async fn handle(&self, origin: NodeId, command: Command) -> Result<Response> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ScatterError::Stopping);
        }
        tracing::trace!("Node {} handling {} from {}", self.id, command.name(), origin);

        match command {
            Command::Write(write) => Ok(Response::Written(self.execute_write(write).await?)),
            Command::PutMap(put_map) => Ok(Response::WrittenMany(self.execute_put_map(put_map).await?)),
            Command::Backup(backup) => {
                self.apply_backup(backup);
                Ok(Response::Ack)
            }
            Command::Get(get) => self.handle_get(get).await,
            Command::FetchEntry { key } => Ok(Response::Entry {
                entry: self.container.get(&key).filter(|entry| !entry.is_remote()),
                bias_granted: false,
            }),
            Command::InvalidateVersions(invalidation) => {
                self.apply_invalidations(invalidation)?;
                Ok(Response::Ack)
            }
            Command::Clear => {
                self.clear_local();
                Ok(Response::Ack)
            }
            Command::RevokeBias(revoke) => {
                for key in &revoke.keys {
                    self.bias.revoke_local_bias(key);
                }
                Ok(Response::Ack)
            }
            Command::State(request) => self.provider.handle(request).await,
        }
    }
}

fn unexpected(node: &NodeId, response: &Response) -> ScatterError {
    ScatterError::Internal(format!("unexpected response from {}: {:?}", node, response))
}

async fn backoff(error: &ScatterError, attempt: usize) {
    if matches!(error, ScatterError::ConcurrentChange { .. }) {
        return;
    }
    let delay = Duration::from_millis(10 * attempt.min(10) as u64);
    tokio::time::sleep(delay).await;
}
