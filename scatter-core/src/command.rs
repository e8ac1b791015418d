//! Messages exchanged between nodes.
//!
//! The set of commands is closed: a node handles every variant in a single
//! `match`. All payloads are serde types so a network transport can ship
//! them as opaque bytes.

use crate::container::CacheEntry;
use crate::error::Result;
use crate::types::{EntryVersion, Key, NodeId, SegmentId, TopologyId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put(Value),
    PutIfAbsent(Value),
    Replace { expected: Value, value: Value },
    Remove,
}

impl WriteOp {
    /// Whether the outcome depends on the value currently stored.
    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::PutIfAbsent(_) | Self::Replace { .. })
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Remove)
    }

    /// Resolve the operation against the current value. `None` means the
    /// condition failed and nothing is written; `Some(None)` writes a
    /// tombstone.
    pub fn resolve(&self, current: Option<&Value>) -> Option<Option<Value>> {
        match self {
            Self::Put(value) => Some(Some(value.clone())),
            Self::PutIfAbsent(value) => match current {
                None => Some(Some(value.clone())),
                Some(_) => None,
            },
            Self::Replace { expected, value } => match current {
                Some(current) if current == expected => Some(Some(value.clone())),
                _ => None,
            },
            Self::Remove => Some(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCommand {
    pub key: Key,
    pub op: WriteOp,
    pub origin: NodeId,
    pub topology_id: TopologyId,
    /// Return the previous value; forces the versioned commit path.
    pub return_previous: bool,
}

impl WriteCommand {
    pub fn loads_previous(&self) -> bool {
        self.return_previous || self.op.is_conditional()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutMapCommand {
    pub entries: Vec<(Key, Value)>,
    pub origin: NodeId,
    pub topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCommand {
    pub topology_id: TopologyId,
    pub entries: Vec<(Key, CacheEntry)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCommand {
    pub key: Key,
    pub origin: NodeId,
    pub topology_id: TopologyId,
    pub acquire_bias: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateVersionsCommand {
    pub keys: Vec<Key>,
    pub versions: Vec<EntryVersion>,
    pub removal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeBiasCommand {
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateRequest {
    /// Resolves once the receiver installed `topology_id` and dropped its
    /// bias on `segments`.
    ConfirmRevokedSegments {
        topology_id: TopologyId,
        segments: BTreeSet<SegmentId>,
    },
    MaxVersions { topology_id: TopologyId },
    KeysInSegments {
        topology_id: TopologyId,
        segments: BTreeSet<SegmentId>,
    },
    GetValues { keys: Vec<Key> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Write(WriteCommand),
    PutMap(PutMapCommand),
    Backup(BackupCommand),
    Get(GetCommand),
    /// Single-key fetch ahead of the bulk value transfer.
    FetchEntry { key: Key },
    InvalidateVersions(InvalidateVersionsCommand),
    RevokeBias(RevokeBiasCommand),
    /// Drop every entry, pending invalidation and bias on the receiver.
    Clear,
    State(StateRequest),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Write(_) => "write",
            Self::PutMap(_) => "put_map",
            Self::Backup(_) => "backup",
            Self::Get(_) => "get",
            Self::FetchEntry { .. } => "fetch_entry",
            Self::InvalidateVersions(_) => "invalidate_versions",
            Self::RevokeBias(_) => "revoke_bias",
            Self::Clear => "clear",
            Self::State(StateRequest::ConfirmRevokedSegments { .. }) => "confirm_revoked_segments",
            Self::State(StateRequest::MaxVersions { .. }) => "max_versions",
            Self::State(StateRequest::KeysInSegments { .. }) => "keys_in_segments",
            Self::State(StateRequest::GetValues { .. }) => "get_values",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub previous: Option<Value>,
    /// False when a conditional write did not match.
    pub applied: bool,
    pub version: Option<EntryVersion>,
    /// The origin may serve further reads of the key locally.
    pub bias_granted: bool,
}

impl WriteResult {
    pub fn not_applied(previous: Option<Value>) -> Self {
        Self {
            previous,
            applied: false,
            version: None,
            bias_granted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Written(WriteResult),
    WrittenMany(usize),
    Entry {
        entry: Option<CacheEntry>,
        bias_granted: bool,
    },
    MaxVersions(Vec<u64>),
    Keys(Vec<(Key, EntryVersion)>),
    Entries(Vec<(Key, CacheEntry)>),
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
