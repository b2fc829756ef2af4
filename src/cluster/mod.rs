//! Collaborator interfaces the streamer consumes.
//!
//! Membership, affinity, messaging, local storage and security all belong to
//! the surrounding grid. The streamer only sees them through the traits below,
//! bundled into a [`ClusterContext`]. `simulation::SimulatedCluster` provides
//! an in-memory implementation of every one of them.

mod types;

pub use types::{
    same_assignments, Assignments, ClusterNode, DiscoveryEvent, IoPolicy, NodeId, PartitionId,
    Permission, TopologyVersion,
};

use crate::error::{StoreError, TransportError};
use crate::protocol::{StreamerRequest, StreamerResponse};
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Key and partition to node mapping.
pub trait AffinityResolver: Send + Sync {
    fn partition_of(&self, cache: &str, key: &[u8]) -> PartitionId;

    /// Owners of `partition` at `version`, primary first.
    fn nodes_for(
        &self,
        cache: &str,
        partition: PartitionId,
        version: TopologyVersion,
    ) -> Vec<ClusterNode>;

    fn primary_node_for(
        &self,
        cache: &str,
        key: &[u8],
        version: TopologyVersion,
    ) -> Option<ClusterNode>;

    fn assignments(&self, cache: &str, version: TopologyVersion) -> Assignments;
}

/// Topology versions, readiness and membership events.
pub trait TopologyService: Send + Sync {
    fn local_node(&self) -> NodeId;

    fn current_version(&self) -> TopologyVersion;

    /// Latest version whose affinity is ready on the local node.
    fn ready_version(&self) -> TopologyVersion;

    /// Resolves once affinity for `version` is ready locally.
    fn affinity_ready(&self, version: TopologyVersion) -> BoxFuture<'static, TopologyVersion>;

    fn is_alive(&self, node: NodeId) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;

    /// Held for reading while a local batch is applied; partition migration
    /// takes it for writing.
    fn migration_lock(&self) -> Arc<RwLock<()>>;
}

/// Request/response transport between the client and server nodes.
pub trait MessagingService: Send + Sync {
    fn send(
        &self,
        node: NodeId,
        topic: &str,
        request: StreamerRequest,
        policy: IoPolicy,
    ) -> std::result::Result<(), TransportError>;

    /// Inbound responses addressed to `topic`, tagged with the sender.
    fn register_listener(&self, topic: &str) -> mpsc::UnboundedReceiver<(NodeId, StreamerResponse)>;

    fn remove_listener(&self, topic: &str);
}

/// Partition storage of the local node.
pub trait CacheStore: Send + Sync {
    fn owns_partition(&self, partition: PartitionId) -> bool;

    /// Stores `value` only if `key` is absent. Returns whether it was stored.
    fn put_if_absent(
        &self,
        partition: PartitionId,
        key: &Bytes,
        value: &Bytes,
        skip_store: bool,
    ) -> std::result::Result<bool, StoreError>;

    fn put(
        &self,
        partition: PartitionId,
        key: &Bytes,
        value: &Bytes,
        skip_store: bool,
    ) -> std::result::Result<(), StoreError>;

    fn remove(
        &self,
        partition: PartitionId,
        key: &Bytes,
        skip_store: bool,
    ) -> std::result::Result<bool, StoreError>;
}

pub trait SecurityCheck: Send + Sync {
    fn authorize(&self, cache: &str, permission: Permission) -> std::result::Result<(), String>;
}

/// Everything a streamer needs from the grid.
#[derive(Clone)]
pub struct ClusterContext {
    pub affinity: Arc<dyn AffinityResolver>,
    pub topology: Arc<dyn TopologyService>,
    pub messaging: Arc<dyn MessagingService>,
    pub store: Arc<dyn CacheStore>,
    pub security: Option<Arc<dyn SecurityCheck>>,
}

impl ClusterContext {
    pub fn local_node(&self) -> NodeId {
        self.topology.local_node()
    }
}
