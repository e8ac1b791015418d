use crate::segment_state::SegmentState;
use crate::types::{NodeId, SegmentId, TopologyId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScatterError {
    /// The entry changed between reading the previous value and committing.
    #[error("concurrent change detected for key {key}")]
    ConcurrentChange { key: String },

    #[error("segment {segment} is not owned by {node}")]
    NotOwner { segment: SegmentId, node: NodeId },

    #[error("segment {0} is currently blocked")]
    SegmentBlocked(SegmentId),

    #[error("segment {0} is no longer owned")]
    SegmentNoLongerOwned(SegmentId),

    #[error("state transfer in progress for segment {0}")]
    StateTransferInProgress(SegmentId),

    #[error("illegal transition of segment {segment} from {from:?} to {to:?}")]
    IllegalTransition {
        segment: SegmentId,
        from: SegmentState,
        to: SegmentState,
    },

    #[error("outdated topology: command has {command}, node has {current}")]
    OutdatedTopology {
        command: TopologyId,
        current: TopologyId,
    },

    #[error("segment {0} is unavailable: too many owners were lost")]
    Unavailable(SegmentId),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("node {0} is unreachable")]
    NodeUnreachable(NodeId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cache is stopping")]
    Stopping,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScatterError {
    /// Whether the caller may retry the whole operation later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentChange { .. }
                | Self::NotOwner { .. }
                | Self::SegmentBlocked(_)
                | Self::SegmentNoLongerOwned(_)
                | Self::StateTransferInProgress(_)
                | Self::OutdatedTopology { .. }
                | Self::Timeout(_)
                | Self::NodeUnreachable(_)
                | Self::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScatterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(ScatterError::StateTransferInProgress(3).is_retriable());
        assert!(ScatterError::Timeout("max versions".to_string()).is_retriable());
        assert!(!ScatterError::Unavailable(3).is_retriable());
        assert!(!ScatterError::Config("bad".to_string()).is_retriable());
    }
}
