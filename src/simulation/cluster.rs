//! In-memory grid with rendezvous affinity, a loopback transport and fault
//! injection.
//!
//! Every topology change runs under the migration write lock: it bumps the
//! version, recomputes assignments, copies partitions to their new owners and
//! only then publishes the new ready version. Server-side request processing
//! holds the migration read lock, so a request is either applied before a
//! change (and migrated with its partition) or rejected as stale after it.

use super::rng::DeterministicRng;
use super::store::MemoryStore;
use crate::cluster::{
    AffinityResolver, Assignments, CacheStore, ClusterContext, ClusterNode, DiscoveryEvent,
    IoPolicy, MessagingService, NodeId, PartitionId, TopologyService, TopologyVersion,
};
use crate::error::{StreamerError, TransportError};
use crate::protocol::{StreamerRequest, StreamerResponse};
use crate::receiver::{ReceiverRegistry, RequestProcessor};
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

/// Node id used by [`SimulatedCluster::client_context`].
pub const CLIENT_NODE: NodeId = NodeId(0);

const EVENT_CAPACITY: usize = 256;

pub struct SimulatedClusterBuilder {
    servers: usize,
    backups: usize,
    partitions: u32,
    pool_size: Option<usize>,
    cpus: usize,
    seed: u64,
}

impl Default for SimulatedClusterBuilder {
    fn default() -> Self {
        SimulatedClusterBuilder {
            servers: 3,
            backups: 0,
            partitions: 32,
            pool_size: None,
            cpus: 4,
            seed: 0,
        }
    }
}

impl SimulatedClusterBuilder {
    pub fn servers(mut self, servers: usize) -> Self {
        self.servers = servers;
        self
    }

    pub fn backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }

    pub fn partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    /// Streamer pool size every server advertises.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> SimulatedCluster {
        let servers: BTreeSet<NodeId> = (1..=self.servers as u64).map(NodeId).collect();
        let assignments = Arc::new(compute_assignments(
            &servers,
            self.partitions,
            self.backups,
            0,
        ));
        let version = TopologyVersion(1);
        let stores = servers
            .iter()
            .map(|id| (*id, Arc::new(MemoryStore::new())))
            .collect();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready, _) = watch::channel(version);

        let shared = Arc::new(Shared {
            partitions: self.partitions,
            backups: self.backups,
            pool_size: self.pool_size,
            cpus: self.cpus,
            topology: RwLock::new(Topology {
                version,
                alive: servers,
                salt: 0,
                assignments: assignments.clone(),
                history: BTreeMap::from([(version, assignments.clone())]),
            }),
            events,
            ready,
            migration: Arc::new(RwLock::new(())),
            stores: RwLock::new(stores),
            client_store: Arc::new(MemoryStore::new()),
            listeners: Mutex::new(HashMap::new()),
            receivers: ReceiverRegistry::new(),
            faults: Mutex::new(Faults::default()),
            held: Mutex::new(Vec::new()),
            rng: Mutex::new(DeterministicRng::new(self.seed)),
            attempts: Mutex::new(AHashMap::new()),
            delivered: Mutex::new(AHashMap::new()),
            policies: Mutex::new(Vec::new()),
            next_node: AtomicU64::new(self.servers as u64 + 1),
        });
        shared.update_ownership(&assignments);

        SimulatedCluster { shared }
    }
}

struct Topology {
    version: TopologyVersion,
    alive: BTreeSet<NodeId>,
    /// Mixed into rendezvous scores; bumping it reshuffles assignments.
    salt: u64,
    assignments: Assignments,
    history: BTreeMap<TopologyVersion, Assignments>,
}

#[derive(Default)]
struct Faults {
    failing_sends: AHashSet<NodeId>,
    held: AHashSet<NodeId>,
    send_failure_rate: f64,
    remote_error_rate: f64,
    /// Keeps the ready version behind the topology version while set.
    ready_held: bool,
}

struct HeldResponse {
    node: NodeId,
    topic: String,
    response: StreamerResponse,
}

struct Shared {
    partitions: u32,
    backups: usize,
    pool_size: Option<usize>,
    cpus: usize,
    topology: RwLock<Topology>,
    events: broadcast::Sender<DiscoveryEvent>,
    ready: watch::Sender<TopologyVersion>,
    migration: Arc<RwLock<()>>,
    stores: RwLock<BTreeMap<NodeId, Arc<MemoryStore>>>,
    client_store: Arc<MemoryStore>,
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<(NodeId, StreamerResponse)>>>,
    receivers: ReceiverRegistry,
    faults: Mutex<Faults>,
    held: Mutex<Vec<HeldResponse>>,
    rng: Mutex<DeterministicRng>,
    attempts: Mutex<AHashMap<NodeId, u64>>,
    delivered: Mutex<AHashMap<NodeId, u64>>,
    policies: Mutex<Vec<(NodeId, IoPolicy)>>,
    next_node: AtomicU64,
}

fn rendezvous_score(partition: PartitionId, node: NodeId, salt: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    (partition, node.0, salt).hash(&mut hasher);
    hasher.finish()
}

fn compute_assignments(
    alive: &BTreeSet<NodeId>,
    partitions: u32,
    backups: usize,
    salt: u64,
) -> Vec<Vec<NodeId>> {
    (0..partitions)
        .map(|p| {
            let mut scored: Vec<(u64, NodeId)> = alive
                .iter()
                .map(|n| (rendezvous_score(p, *n, salt), *n))
                .collect();
            scored.sort_unstable_by(|a, b| b.cmp(a));
            scored
                .into_iter()
                .take(backups + 1)
                .map(|(_, n)| n)
                .collect()
        })
        .collect()
}

impl Shared {
    fn node(&self, id: NodeId) -> ClusterNode {
        let node = ClusterNode::new(id, self.cpus);
        match self.pool_size {
            Some(size) => node.with_pool_size(size),
            None => node,
        }
    }

    fn is_alive(&self, node: NodeId) -> bool {
        node == CLIENT_NODE || self.topology.read().alive.contains(&node)
    }

    fn ready_version(&self) -> TopologyVersion {
        *self.ready.borrow()
    }

    fn assignments_at(&self, version: TopologyVersion) -> Assignments {
        let topology = self.topology.read();
        topology
            .history
            .range(..=version)
            .next_back()
            .map(|(_, a)| a.clone())
            .unwrap_or_else(|| topology.assignments.clone())
    }

    fn partition_of(&self, key: &[u8]) -> PartitionId {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as PartitionId
    }

    fn store(&self, node: NodeId) -> Option<Arc<MemoryStore>> {
        self.stores.read().get(&node).cloned()
    }

    /// Applies `mutate` and publishes a new version. Without `recompute` the
    /// new version shares the previous assignment table.
    fn change_topology(
        &self,
        mutate: impl FnOnce(&mut Topology),
        recompute: bool,
    ) -> TopologyVersion {
        let migration = self.migration.clone();
        let _exclusive = migration.write();

        let (old, new, version) = {
            let mut topology = self.topology.write();
            mutate(&mut topology);
            let old = topology.assignments.clone();
            let new = if recompute {
                Arc::new(compute_assignments(
                    &topology.alive,
                    self.partitions,
                    self.backups,
                    topology.salt,
                ))
            } else {
                old.clone()
            };
            let version = topology.version.next();
            topology.version = version;
            topology.assignments = new.clone();
            topology.history.insert(version, new.clone());
            (old, new, version)
        };

        if !Arc::ptr_eq(&old, &new) {
            self.rebalance(&old, &new);
            self.update_ownership(&new);
        }
        if !self.faults.lock().ready_held {
            self.ready.send_replace(version);
        }
        debug!("Simulated topology advanced to {}", version);
        version
    }

    /// Copies every partition to owners that did not have it before.
    fn rebalance(&self, old: &Assignments, new: &Assignments) {
        let alive = self.topology.read().alive.clone();
        for (p, owners) in new.iter().enumerate() {
            let previous = old.get(p).map(Vec::as_slice).unwrap_or_default();
            let Some(source) = previous
                .iter()
                .find(|n| alive.contains(*n))
                .and_then(|n| self.store(*n))
            else {
                continue;
            };
            let entries = source.partition_entries(p as PartitionId);
            if entries.is_empty() {
                continue;
            }
            for owner in owners.iter().filter(|n| !previous.contains(*n)) {
                if let Some(target) = self.store(*owner) {
                    target.import(p as PartitionId, entries.clone());
                }
            }
        }
    }

    fn update_ownership(&self, assignments: &Assignments) {
        for (id, store) in self.stores.read().iter() {
            store.set_owned(
                assignments
                    .iter()
                    .enumerate()
                    .filter(|(_, owners)| owners.contains(id))
                    .map(|(p, _)| p as PartitionId),
            );
        }
    }

    fn deliver(self: &Arc<Self>, node: NodeId, wire: Bytes) {
        let request = match StreamerRequest::from_bytes(&wire) {
            Ok(request) => request,
            Err(e) => {
                warn!("Simulated node {} dropped undecodable request: {}", node, e);
                return;
            }
        };
        if !self.is_alive(node) {
            debug!(
                "Dropping request {} to dead node {}",
                request.request_id, node
            );
            return;
        }
        *self.delivered.lock().entry(node).or_default() += 1;

        let error_rate = self.faults.lock().remote_error_rate;
        let response = if self.rng.lock().gen_bool(error_rate) {
            StreamerResponse::failed(
                request.request_id,
                &StreamerError::Store("injected remote failure".to_string()),
            )
        } else {
            let Some(store) = self.store(node) else {
                return;
            };
            let processor = RequestProcessor::new(node, store, self.receivers.clone());
            let _shared = self.migration.read();
            processor.process(&request, self.ready_version())
        };

        self.respond(node, request.response_topic, response);
    }

    fn respond(&self, node: NodeId, topic: String, response: StreamerResponse) {
        if self.faults.lock().held.contains(&node) {
            self.held.lock().push(HeldResponse {
                node,
                topic,
                response,
            });
            return;
        }
        if !self.is_alive(node) {
            return;
        }
        let response = match response.to_bytes().and_then(|b| StreamerResponse::from_bytes(&b)) {
            Ok(response) => response,
            Err(e) => {
                warn!("Simulated node {} failed to encode response: {}", node, e);
                return;
            }
        };
        match self.listeners.lock().get(&topic) {
            Some(tx) => {
                let _ = tx.send((node, response));
            }
            None => debug!("No listener for topic {}, response dropped", topic),
        }
    }
}

/// Handle to a simulated grid. Clones share the same state.
#[derive(Clone)]
pub struct SimulatedCluster {
    shared: Arc<Shared>,
}

impl SimulatedCluster {
    pub fn builder() -> SimulatedClusterBuilder {
        SimulatedClusterBuilder::default()
    }

    pub fn affinity(&self) -> Arc<dyn AffinityResolver> {
        Arc::new(SimAffinity {
            shared: self.shared.clone(),
        })
    }

    fn context(&self, local: NodeId, store: Arc<dyn CacheStore>) -> ClusterContext {
        ClusterContext {
            affinity: self.affinity(),
            topology: Arc::new(SimTopology {
                shared: self.shared.clone(),
                local,
            }),
            messaging: Arc::new(SimMessaging {
                shared: self.shared.clone(),
            }),
            store,
            security: None,
        }
    }

    /// View of a client node that owns no data.
    pub fn client_context(&self) -> ClusterContext {
        self.context(CLIENT_NODE, self.shared.client_store.clone())
    }

    /// View of server `id`; batches routed to it are applied locally.
    pub fn server_context(&self, id: NodeId) -> Option<ClusterContext> {
        let store = self.shared.store(id)?;
        Some(self.context(id, store))
    }

    pub fn current_version(&self) -> TopologyVersion {
        self.shared.topology.read().version
    }

    /// Live server ids, ascending.
    pub fn server_ids(&self) -> Vec<NodeId> {
        self.shared.topology.read().alive.iter().copied().collect()
    }

    pub fn partition_of(&self, key: &[u8]) -> PartitionId {
        self.shared.partition_of(key)
    }

    pub fn owners_of(&self, key: &[u8]) -> Vec<NodeId> {
        let partition = self.partition_of(key);
        self.shared.topology.read().assignments[partition as usize].clone()
    }

    pub fn primary_for(&self, key: &[u8]) -> Option<NodeId> {
        self.owners_of(key).first().copied()
    }

    /// Value of `key` at its current primary.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let primary = self.primary_for(key)?;
        self.shared.store(primary)?.get(key)
    }

    pub fn node_store(&self, id: NodeId) -> Option<Arc<MemoryStore>> {
        self.shared.store(id)
    }

    /// Receivers servers resolve request receiver ids against.
    pub fn receivers(&self) -> ReceiverRegistry {
        self.shared.receivers.clone()
    }

    /// Removes `id` from the topology and announces it as failed. Its
    /// withheld responses are lost.
    pub fn kill_node(&self, id: NodeId) -> TopologyVersion {
        if !self.shared.topology.read().alive.contains(&id) {
            return self.current_version();
        }
        let version = self.shared.change_topology(
            |t| {
                t.alive.remove(&id);
            },
            true,
        );
        self.shared.held.lock().retain(|h| h.node != id);
        let _ = self.shared.events.send(DiscoveryEvent::NodeFailed {
            node: id,
            topology_version: version,
        });
        version
    }

    pub fn add_node(&self) -> NodeId {
        let id = NodeId(self.shared.next_node.fetch_add(1, Ordering::Relaxed));
        self.shared
            .stores
            .write()
            .insert(id, Arc::new(MemoryStore::new()));
        let version = self.shared.change_topology(
            |t| {
                t.alive.insert(id);
            },
            true,
        );
        let _ = self.shared.events.send(DiscoveryEvent::NodeJoined {
            node: id,
            topology_version: version,
        });
        id
    }

    /// New version with the same assignment table.
    pub fn bump_version(&self) -> TopologyVersion {
        self.shared.change_topology(|_| {}, false)
    }

    /// New version with reshuffled assignments and migrated partitions.
    pub fn reassign(&self) -> TopologyVersion {
        self.shared.change_topology(|t| t.salt += 1, true)
    }

    /// Makes every send to `node` fail while set.
    pub fn fail_sends(&self, node: NodeId, fail: bool) {
        let mut faults = self.shared.faults.lock();
        if fail {
            faults.failing_sends.insert(node);
        } else {
            faults.failing_sends.remove(&node);
        }
    }

    /// Withholds responses from `node` while set; clearing releases them.
    pub fn hold_responses(&self, node: NodeId, hold: bool) {
        {
            let mut faults = self.shared.faults.lock();
            if hold {
                faults.held.insert(node);
                return;
            }
            faults.held.remove(&node);
        }
        let released: Vec<HeldResponse> = {
            let mut held = self.shared.held.lock();
            let (released, kept): (Vec<_>, Vec<_>) =
                held.drain(..).partition(|h| h.node == node);
            *held = kept;
            released
        };
        for h in released {
            self.shared.respond(h.node, h.topic, h.response);
        }
    }

    /// Holds back affinity readiness for later versions while set; clearing
    /// publishes the current version as ready.
    pub fn hold_ready(&self, hold: bool) {
        self.shared.faults.lock().ready_held = hold;
        if !hold {
            let version = self.shared.topology.read().version;
            self.shared.ready.send_replace(version);
        }
    }

    pub fn set_send_failure_rate(&self, rate: f64) {
        self.shared.faults.lock().send_failure_rate = rate;
    }

    pub fn set_remote_error_rate(&self, rate: f64) {
        self.shared.faults.lock().remote_error_rate = rate;
    }

    /// Send calls addressed to `node`, including failed ones.
    pub fn send_attempts(&self, node: NodeId) -> u64 {
        self.shared.attempts.lock().get(&node).copied().unwrap_or(0)
    }

    /// Requests that reached `node`.
    pub fn requests_to(&self, node: NodeId) -> u64 {
        self.shared.delivered.lock().get(&node).copied().unwrap_or(0)
    }

    /// Policies requests to `node` were sent with, in order.
    pub fn io_policies(&self, node: NodeId) -> Vec<IoPolicy> {
        self.shared
            .policies
            .lock()
            .iter()
            .filter(|(n, _)| *n == node)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Fault-injection randomness, seeded by the builder.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut DeterministicRng) -> R) -> R {
        f(&mut self.shared.rng.lock())
    }
}

struct SimAffinity {
    shared: Arc<Shared>,
}

impl AffinityResolver for SimAffinity {
    fn partition_of(&self, _cache: &str, key: &[u8]) -> PartitionId {
        self.shared.partition_of(key)
    }

    fn nodes_for(
        &self,
        _cache: &str,
        partition: PartitionId,
        version: TopologyVersion,
    ) -> Vec<ClusterNode> {
        self.shared
            .assignments_at(version)
            .get(partition as usize)
            .map(|owners| owners.iter().map(|id| self.shared.node(*id)).collect())
            .unwrap_or_default()
    }

    fn primary_node_for(
        &self,
        cache: &str,
        key: &[u8],
        version: TopologyVersion,
    ) -> Option<ClusterNode> {
        let partition = self.partition_of(cache, key);
        self.nodes_for(cache, partition, version).into_iter().next()
    }

    fn assignments(&self, _cache: &str, version: TopologyVersion) -> Assignments {
        self.shared.assignments_at(version)
    }
}

struct SimTopology {
    shared: Arc<Shared>,
    local: NodeId,
}

impl TopologyService for SimTopology {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn current_version(&self) -> TopologyVersion {
        self.shared.topology.read().version
    }

    fn ready_version(&self) -> TopologyVersion {
        self.shared.ready_version()
    }

    fn affinity_ready(&self, version: TopologyVersion) -> BoxFuture<'static, TopologyVersion> {
        let mut rx = self.shared.ready.subscribe();
        Box::pin(async move {
            let ready = rx.wait_for(|ready| *ready >= version).await.map(|r| *r);
            ready.unwrap_or(version)
        })
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.shared.is_alive(node)
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    fn migration_lock(&self) -> Arc<RwLock<()>> {
        self.shared.migration.clone()
    }
}

struct SimMessaging {
    shared: Arc<Shared>,
}

impl MessagingService for SimMessaging {
    fn send(
        &self,
        node: NodeId,
        _topic: &str,
        request: StreamerRequest,
        policy: IoPolicy,
    ) -> Result<(), TransportError> {
        let shared = &self.shared;
        if !shared.is_alive(node) {
            return Err(TransportError::NodeUnreachable(node));
        }
        *shared.attempts.lock().entry(node).or_default() += 1;
        shared.policies.lock().push((node, policy));

        let inject = {
            let faults = shared.faults.lock();
            faults.failing_sends.contains(&node)
                || shared.rng.lock().gen_bool(faults.send_failure_rate)
        };
        if inject {
            return Err(TransportError::SendFailed(format!(
                "injected send failure to node {}",
                node
            )));
        }

        let wire = request
            .to_bytes()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let shared = shared.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            shared.deliver(node, wire);
        });
        Ok(())
    }

    fn register_listener(
        &self,
        topic: &str,
    ) -> mpsc::UnboundedReceiver<(NodeId, StreamerResponse)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.listeners.lock().insert(topic.to_string(), tx);
        rx
    }

    fn remove_listener(&self, topic: &str) {
        self.shared.listeners.lock().remove(topic);
    }
}
