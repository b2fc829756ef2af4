//! Error types for the data streamer.
//!
//! One failure usually fans out to many completion handles (every caller whose
//! entries rode in the failed batch), so `StreamerError` is `Clone` and nested
//! causes are shared through `Arc`.

use crate::cluster::{NodeId, TopologyVersion};
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamerError>;

#[derive(Debug, Clone, Error)]
pub enum StreamerError {
    /// No server node owns the key's partition.
    #[error("failed to find server node for cache '{cache}' (all affinity nodes have left the grid or cache was stopped)")]
    NoRoute { cache: String },

    /// A stripe was opened under an assignment that changed before it was sent.
    #[error("topology changed during batch preparation [batch_topology={batch}, topology={current}]")]
    TopologyChanged {
        batch: TopologyVersion,
        current: TopologyVersion,
    },

    /// The destination's ready topology differs from the batch's.
    #[error("batch topology {requested} does not match local topology {local}, will retry at stable topology")]
    StaleTopology {
        requested: TopologyVersion,
        local: TopologyVersion,
    },

    #[error("failed to send request to node {node}: {reason}")]
    Transport { node: NodeId, reason: String },

    #[error("failed to wait for request completion (node has left): {node}")]
    NodeLeft { node: NodeId },

    #[error("data streamer request failed on node {node}: {message}")]
    Remote { node: NodeId, message: String },

    #[error("topology mismatch on node {node}: {message}")]
    RemoteTopology { node: NodeId, message: String },

    #[error("data streamer exceeded timeout {0}")]
    Timeout(&'static str),

    #[error("failed to finish operation (too many remaps): {remaps}")]
    TooManyRemaps {
        remaps: u32,
        #[source]
        cause: Arc<StreamerError>,
    },

    #[error("data streamer has been cancelled")]
    Cancelled {
        #[source]
        cause: Option<Arc<StreamerError>>,
    },

    #[error("data streamer has been closed")]
    Closed {
        #[source]
        cause: Option<Arc<StreamerError>>,
    },

    #[error("client node disconnected")]
    ClientDisconnected,

    #[error("some of data streamer operations failed [failed_count={count}]")]
    OperationsFailed { count: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid streamer configuration: {0}")]
    Config(String),

    #[error("failed to marshal streamer payload: {0}")]
    Codec(String),

    #[error("failed to apply entries: {0}")]
    Store(String),
}

impl StreamerError {
    pub fn cancelled() -> Self {
        StreamerError::Cancelled { cause: None }
    }

    pub fn cancelled_by(cause: StreamerError) -> Self {
        StreamerError::Cancelled {
            cause: Some(Arc::new(cause)),
        }
    }

    /// Failures that send the batch back through routing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StreamerError::TopologyChanged { .. }
                | StreamerError::StaleTopology { .. }
                | StreamerError::Transport { .. }
                | StreamerError::NodeLeft { .. }
                | StreamerError::Remote { .. }
                | StreamerError::RemoteTopology { .. }
                | StreamerError::Store(_)
        )
    }

    /// Batch never left the client; retried without charging the remap budget.
    pub fn is_topology_race(&self) -> bool {
        matches!(self, StreamerError::TopologyChanged { .. })
    }

    /// Errors a destination reports back as topology mismatches.
    pub fn is_topology_mismatch(&self) -> bool {
        matches!(
            self,
            StreamerError::TopologyChanged { .. }
                | StreamerError::StaleTopology { .. }
                | StreamerError::RemoteTopology { .. }
        )
    }
}

/// Failure reported by the messaging collaborator.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    NodeUnreachable(NodeId),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Failure reported by the local storage collaborator.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("partition {0} is not owned by this node")]
    PartitionNotOwned(u32),
    #[error("{0}")]
    Failed(String),
}

impl From<StoreError> for StreamerError {
    fn from(e: StoreError) -> Self {
        StreamerError::Store(e.to_string())
    }
}

impl From<bincode::Error> for StreamerError {
    fn from(e: bincode::Error) -> Self {
        StreamerError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let race = StreamerError::TopologyChanged {
            batch: TopologyVersion(1),
            current: TopologyVersion(2),
        };
        assert!(race.is_recoverable());
        assert!(race.is_topology_race());

        let left = StreamerError::NodeLeft { node: NodeId(3) };
        assert!(left.is_recoverable());
        assert!(!left.is_topology_race());

        assert!(!StreamerError::Timeout("on flush").is_recoverable());
        assert!(!StreamerError::cancelled().is_recoverable());
        assert!(!StreamerError::ClientDisconnected.is_recoverable());
    }

    #[test]
    fn test_nested_cause_display() {
        let err = StreamerError::TooManyRemaps {
            remaps: 32,
            cause: Arc::new(StreamerError::NodeLeft { node: NodeId(7) }),
        };
        assert_eq!(err.to_string(), "failed to finish operation (too many remaps): 32");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("failed to wait for request completion (node has left): 7")
        );
    }
}
