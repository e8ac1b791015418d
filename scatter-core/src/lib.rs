//! Scatter Core - ownership and versioning engine for a scattered key-value cache
//!
//! Every entry lives on exactly two nodes:
//! - the primary owner of its segment, which orders writes with per-segment versions
//! - a backup, which is always the primary's next member in the topology
//!
//! Stale copies left anywhere else are removed by batched invalidations. After
//! a topology change the new primary reconciles versions and pulls the newest
//! copy of every key in the segments it gained.

pub mod bias;
pub mod cluster;
pub mod command;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod invalidation;
pub mod node;
pub mod segment_state;
pub mod state_transfer;
pub mod topology;
pub mod transport;
pub mod types;
pub mod version_manager;
pub mod version_store;

pub use bias::{BiasManager, PendingWrite, Revocation, RevocationOutcome, group_by_holder};
pub use cluster::LocalCluster;
pub use command::{Command, Response, StateRequest, WriteCommand, WriteOp, WriteResult};
pub use config::{BiasAcquisition, NUM_OWNERS, ScatteredConfig};
pub use container::{CacheEntry, CommitOutcome, DataContainer, EntryMetadata};
pub use error::{Result, ScatterError};
pub use events::{EventBus, ScatterEvent};
pub use invalidation::{InvalidationQueue, PendingInvalidation};
pub use node::{PreparedWrite, ReadyWrite, ScatteredNode};
pub use segment_state::{SegmentState, SegmentStateMachine, Transition};
pub use state_transfer::{OwnershipChange, StateConsumer, StateProvider, moved_segments, ownership_change};
pub use topology::{Topology, segment_for_key};
pub use transport::{CommandHandler, InMemoryNetwork, InMemoryTransport, Transport, broadcast};
pub use types::{EntryVersion, Key, NodeId, SegmentId, SegmentVersion, TopologyId, Value};
pub use version_manager::ScatteredVersionManager;
pub use version_store::SegmentVersionStore;
