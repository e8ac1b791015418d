//! Node-to-node messaging.

use crate::command::{Command, Response};
use crate::error::{Result, ScatterError};
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `command` to `target` and wait for its response.
    async fn send(&self, target: &NodeId, command: Command) -> Result<Response>;
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, origin: NodeId, command: Command) -> Result<Response>;
}

/// Send the same command to every target concurrently. Results come back in
/// target order.
pub async fn broadcast(
    transport: &dyn Transport,
    targets: &[NodeId],
    command: &Command,
) -> Vec<(NodeId, Result<Response>)> {
    let sends = targets.iter().map(|target| async move {
        let result = transport.send(target, command.clone()).await;
        (target.clone(), result)
    });
    join_all(sends).await
}

/// In-process network connecting handlers registered under their node id.
/// Supports crashing nodes, hanging nodes and pairwise partitions.
#[derive(Default)]
pub struct InMemoryNetwork {
    handlers: DashMap<NodeId, Weak<dyn CommandHandler>>,
    crashed: DashSet<NodeId>,
    hung: DashSet<NodeId>,
    partitions: DashSet<(NodeId, NodeId)>,
    wire_encoding: AtomicBool,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: NodeId, handler: Weak<dyn CommandHandler>) {
        self.crashed.remove(&node);
        self.handlers.insert(node, handler);
    }

    pub fn unregister(&self, node: &NodeId) {
        self.handlers.remove(node);
    }

    pub fn endpoint(self: &Arc<Self>, local: NodeId, timeout: Duration) -> InMemoryTransport {
        InMemoryTransport {
            local,
            network: self.clone(),
            timeout,
        }
    }

    /// Sends to `node` fail immediately.
    pub fn crash(&self, node: &NodeId) {
        self.crashed.insert(node.clone());
    }

    /// Sends to `node` never complete and run into the sender's timeout.
    pub fn hang(&self, node: &NodeId) {
        self.hung.insert(node.clone());
    }

    pub fn recover(&self, node: &NodeId) {
        self.crashed.remove(node);
        self.hung.remove(node);
    }

    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        self.partitions.insert((a.clone(), b.clone()));
        self.partitions.insert((b.clone(), a.clone()));
    }

    pub fn heal(&self) {
        self.partitions.clear();
    }

    /// Round-trip every message through its serialized form.
    pub fn set_wire_encoding(&self, enabled: bool) {
        self.wire_encoding.store(enabled, Ordering::Relaxed);
    }

    fn handler(&self, from: &NodeId, target: &NodeId) -> Result<Arc<dyn CommandHandler>> {
        if self.crashed.contains(target)
            || self.partitions.contains(&(from.clone(), target.clone()))
        {
            return Err(ScatterError::NodeUnreachable(target.clone()));
        }

        self.handlers
            .get(target)
            .and_then(|handler| handler.upgrade())
            .ok_or_else(|| ScatterError::NodeUnreachable(target.clone()))
    }
}

pub struct InMemoryTransport {
    local: NodeId,
    network: Arc<InMemoryNetwork>,
    timeout: Duration,
}

impl InMemoryTransport {
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    async fn deliver(&self, target: &NodeId, command: Command) -> Result<Response> {
        if self.network.hung.contains(target) {
            std::future::pending::<()>().await;
        }

        let handler = self.network.handler(&self.local, target)?;
        if !self.network.wire_encoding.load(Ordering::Relaxed) {
            return handler.handle(self.local.clone(), command).await;
        }

        let command = Command::decode(&command.encode()?)?;
        let response = handler.handle(self.local.clone(), command).await?;
        Response::decode(&response.encode()?)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, target: &NodeId, command: Command) -> Result<Response> {
        let name = command.name();
        match tokio::time::timeout(self.timeout, self.deliver(target, command)).await {
            Ok(result) => {
                if let Err(error) = &result {
                    tracing::debug!(
                        "{} from {} to {} failed: {}",
                        name,
                        self.local,
                        target,
                        error
                    );
                }
                result
            }
            Err(_) => {
                tracing::warn!(
                    "{} from {} to {} timed out after {:?}",
                    name,
                    self.local,
                    target,
                    self.timeout
                );
                Err(ScatterError::Timeout(format!(
                    "{} to {} after {:?}",
                    name, target, self.timeout
                )))
            }
        }
    }
}
