//! A cluster of nodes running in one process over [`InMemoryNetwork`].

use crate::config::ScatteredConfig;
use crate::error::{Result, ScatterError};
use crate::node::ScatteredNode;
use crate::topology::Topology;
use crate::transport::{CommandHandler, InMemoryNetwork};
use crate::types::{EntryVersion, Key, NodeId, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct LocalCluster {
    network: Arc<InMemoryNetwork>,
    config: ScatteredConfig,
    nodes: BTreeMap<NodeId, Arc<ScatteredNode>>,
    topology: Topology,
}

impl LocalCluster {
    pub async fn start(config: ScatteredConfig, names: &[&str]) -> Result<Self> {
        Self::start_with_preload(config, names, HashMap::new()).await
    }

    /// Start a cluster whose nodes restored `preload` from persistence. The
    /// first topology is numbered above every preloaded version.
    pub async fn start_with_preload(
        config: ScatteredConfig,
        names: &[&str],
        mut preload: HashMap<NodeId, Vec<(Key, Value, EntryVersion)>>,
    ) -> Result<Self> {
        if names.is_empty() {
            return Err(ScatterError::Config("a cluster needs at least one node".to_string()));
        }

        let network = InMemoryNetwork::new();
        let mut nodes = BTreeMap::new();
        for name in names {
            let node = Self::spawn_node(&network, &config, NodeId::from(*name))?;
            if let Some(entries) = preload.remove(node.id()) {
                node.preload(entries);
            }
            nodes.insert(node.id().clone(), node);
        }

        let first_id = nodes
            .values()
            .map(|node| node.manager().preloaded_topology_id())
            .max()
            .unwrap_or(0)
            + 1;
        let members: Vec<NodeId> = nodes.keys().cloned().collect();
        let topology = Topology::balanced(first_id, members, config.num_segments);

        let mut cluster = Self {
            network,
            config,
            nodes,
            topology: topology.clone(),
        };
        cluster.install(topology).await?;
        Ok(cluster)
    }

    fn spawn_node(network: &Arc<InMemoryNetwork>, config: &ScatteredConfig, id: NodeId) -> Result<Arc<ScatteredNode>> {
        let transport = Arc::new(network.endpoint(id.clone(), config.remote_timeout()));
        let node = ScatteredNode::new(id.clone(), config.clone(), transport)?;
        let handler: Arc<dyn CommandHandler> = node.clone();
        network.register(id, Arc::downgrade(&handler));
        node.start();
        Ok(node)
    }

    pub fn node(&self, name: &str) -> Option<Arc<ScatteredNode>> {
        self.nodes.get(&NodeId::from(name)).cloned()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ScatteredNode>> {
        self.nodes.values()
    }

    pub fn network(&self) -> &Arc<InMemoryNetwork> {
        &self.network
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Install `topology` on every member and wait for the rebalance.
    pub async fn install(&mut self, topology: Topology) -> Result<()> {
        for member in topology.members() {
            let node = self
                .nodes
                .get(member)
                .ok_or_else(|| ScatterError::InvalidRequest(format!("unknown member {}", member)))?;
            node.install_topology(topology.clone())?;
        }
        self.topology = topology;
        self.wait_for_rebalance().await
    }

    pub async fn join(&mut self, name: &str) -> Result<Arc<ScatteredNode>> {
        let id = NodeId::from(name);
        if self.nodes.contains_key(&id) {
            return Err(ScatterError::InvalidRequest(format!("{} is already a member", id)));
        }

        let node = Self::spawn_node(&self.network, &self.config, id.clone())?;
        self.nodes.insert(id.clone(), node.clone());

        let mut members = self.topology.members().to_vec();
        members.push(id);
        let topology = self.topology.rebalance(self.topology.id() + 1, members);
        tracing::info!("{} joining, installing topology {}", name, topology.id());
        self.install(topology).await?;
        Ok(node)
    }

    /// Crash `names` at once and rebalance over the survivors.
    pub async fn leave(&mut self, names: &[&str]) -> Result<()> {
        for name in names {
            let id = NodeId::from(*name);
            let node = self
                .nodes
                .remove(&id)
                .ok_or_else(|| ScatterError::InvalidRequest(format!("{} is not a member", id)))?;
            self.network.crash(&id);
            node.stop();
        }

        let members: Vec<NodeId> = self
            .topology
            .members()
            .iter()
            .filter(|member| self.nodes.contains_key(*member))
            .cloned()
            .collect();
        let topology = self.topology.rebalance(self.topology.id() + 1, members);
        tracing::info!("{:?} left, installing topology {}", names, topology.id());
        self.install(topology).await
    }

    pub async fn wait_for_rebalance(&self) -> Result<()> {
        let topology_id = self.topology.id();
        for member in self.topology.members() {
            if let Some(node) = self.nodes.get(member) {
                node.wait_for_transfer(topology_id).await?;
            }
        }
        Ok(())
    }

    /// Push every queued invalidation out without waiting for the flusher.
    pub async fn flush_invalidations(&self) {
        for node in self.nodes.values() {
            node.manager().start_flush().await;
        }
    }

    pub fn stop(&self) {
        for node in self.nodes.values() {
            node.stop();
        }
    }
}
