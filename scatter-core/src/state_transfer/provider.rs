use crate::bias::BiasManager;
use crate::command::{BackupCommand, Command, InvalidateVersionsCommand, Response, StateRequest};
use crate::container::{CacheEntry, DataContainer};
use crate::error::Result;
use crate::state_transfer::ownership_change;
use crate::topology::Topology;
use crate::transport::{self, Transport};
use crate::types::{EntryVersion, Key, SegmentId, TopologyId};
use crate::version_manager::ScatteredVersionManager;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct StateProvider {
    manager: Arc<ScatteredVersionManager>,
    container: Arc<DataContainer>,
    bias: Arc<BiasManager>,
    transport: Arc<dyn Transport>,
}

impl StateProvider {
    pub fn new(
        manager: Arc<ScatteredVersionManager>,
        container: Arc<DataContainer>,
        bias: Arc<BiasManager>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            manager,
            container,
            bias,
            transport,
        }
    }

    pub async fn handle(&self, request: StateRequest) -> Result<Response> {
        match request {
            StateRequest::ConfirmRevokedSegments {
                topology_id,
                segments,
            } => {
                self.confirm_revoked_segments(topology_id, &segments).await?;
                Ok(Response::Ack)
            }
            StateRequest::MaxVersions { .. } => Ok(Response::MaxVersions(self.manager.local_max_versions())),
            StateRequest::KeysInSegments {
                topology_id,
                segments,
            } => Ok(Response::Keys(
                self.keys_in_segments(topology_id, &segments).await?,
            )),
            StateRequest::GetValues { keys } => Ok(Response::Entries(self.get_values(&keys))),
        }
    }

    /// Resolves once this node runs `topology_id`: from then on it sends
    /// writes for `segments` to the new primary only, and its reads of those
    /// segments no longer rely on bias granted by the old one.
    pub async fn confirm_revoked_segments(
        &self,
        topology_id: TopologyId,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<()> {
        self.manager.wait_for_topology(topology_id).await?;

        let num_segments = self.manager.num_segments();
        self.bias
            .revoke_local_bias_for_segments(segments, num_segments);
        self.bias.clear_remote_for_segments(segments, num_segments);
        tracing::debug!(
            "Node {} confirmed revocation of {} segments for topology {}",
            self.manager.local(),
            segments.len(),
            topology_id
        );
        Ok(())
    }

    pub async fn keys_in_segments(
        &self,
        topology_id: TopologyId,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<Vec<(Key, EntryVersion)>> {
        self.manager.wait_for_topology(topology_id).await?;
        Ok(self.container.keys_in_segments(segments))
    }

    pub fn get_values(&self, keys: &[Key]) -> Vec<(Key, CacheEntry)> {
        keys.iter()
            .filter_map(|key| {
                self.container
                    .get(key)
                    .filter(|entry| !entry.is_remote())
                    .map(|entry| (key.clone(), entry))
            })
            .collect()
    }

    /// When this node keeps its segments but its backup changed, copy their
    /// entries to the new backup and drop the copies held elsewhere.
    pub async fn push_to_new_backup(&self, previous: &Topology, topology: &Topology) -> Result<usize> {
        let local = self.manager.local().clone();
        let Some(backup) = topology.next_member(&local).cloned() else {
            return Ok(0);
        };
        if previous.next_member(&local) == Some(&backup) {
            return Ok(0);
        }

        let kept = ownership_change(previous, topology, &local).kept;
        if kept.is_empty() {
            return Ok(0);
        }

        let entries = self.container.entries_in_segments(&kept);
        let chunk_size = self.manager.config().state_transfer_chunk_size;
        for chunk in entries.chunks(chunk_size) {
            self.transport
                .send(
                    &backup,
                    Command::Backup(BackupCommand {
                        topology_id: topology.id(),
                        entries: chunk.to_vec(),
                    }),
                )
                .await?;
        }

        let others = topology.non_backup_members(&local);
        for chunk in entries.chunks(chunk_size) {
            let command = Command::InvalidateVersions(InvalidateVersionsCommand {
                keys: chunk.iter().map(|(key, _)| key.clone()).collect(),
                versions: chunk.iter().map(|(_, entry)| entry.version()).collect(),
                removal: true,
            });
            for (node, result) in transport::broadcast(self.transport.as_ref(), &others, &command).await {
                if let Err(error) = result {
                    tracing::warn!("Failed to drop stale copies on {}: {}", node, error);
                }
            }
        }

        tracing::info!(
            "Node {} pushed {} entries of {} segments to new backup {}",
            local,
            entries.len(),
            kept.len(),
            backup
        );
        Ok(entries.len())
    }
}
