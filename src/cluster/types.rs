use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Cluster-wide node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic counter identifying one stable partition-to-node mapping.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TopologyVersion(pub u64);

impl TopologyVersion {
    pub fn next(self) -> Self {
        TopologyVersion(self.0 + 1)
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

pub type PartitionId = u32;

/// Partition index -> ordered owners (primary first).
pub type Assignments = Arc<Vec<Vec<NodeId>>>;

/// Compares two assignment snapshots, short-circuiting on the shared pointer.
pub fn same_assignments(a: &Assignments, b: &Assignments) -> bool {
    Arc::ptr_eq(a, b) || a.as_slice() == b.as_slice()
}

/// A server node as seen by the streamer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: NodeId,
    /// Size of the node's streamer worker pool, if it advertises one.
    pub streamer_pool_size: Option<usize>,
    pub total_cpus: usize,
}

impl ClusterNode {
    pub fn new(id: NodeId, total_cpus: usize) -> Self {
        ClusterNode {
            id,
            streamer_pool_size: None,
            total_cpus,
        }
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.streamer_pool_size = Some(size);
        self
    }

    /// Number of partition stripes a buffer for this node keeps.
    pub fn stripe_count(&self) -> usize {
        self.streamer_pool_size.unwrap_or(self.total_cpus).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    NodeJoined {
        node: NodeId,
        topology_version: TopologyVersion,
    },
    NodeLeft {
        node: NodeId,
        topology_version: TopologyVersion,
    },
    NodeFailed {
        node: NodeId,
        topology_version: TopologyVersion,
    },
}

/// Messaging priority class for streamer requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IoPolicy {
    #[default]
    DataStreamer,
    Public,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Put,
    Remove,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Put => write!(f, "CACHE_PUT"),
            Permission::Remove => write!(f, "CACHE_REMOVE"),
        }
    }
}
