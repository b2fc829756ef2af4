//! Local and remote submission paths, plus the listener tasks that feed
//! responses and membership changes back into the streamer.

use super::buffer::{LocalJob, NodeBuffer};
use super::completion::Completion;
use super::{StreamerEntry, StreamerInner};
use crate::cluster::{DiscoveryEvent, NodeId, TopologyVersion};
use crate::error::{StreamerError, TransportError};
use crate::observability::StreamerStats;
use crate::protocol::{encode_entries, StreamerRequest, StreamerResponse, STREAMER_TOPIC};
use crate::receiver::ApplyFlags;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

impl NodeBuffer {
    /// Applies a batch on this node. Isolated loads run under the migration
    /// read lock and only at the exact ready topology.
    pub(super) fn local_update(
        self: &Arc<Self>,
        entries: Vec<StreamerEntry>,
        topology: TopologyVersion,
        completion: Completion,
    ) {
        let ctx = &self.ctx;
        let isolated = !ctx.allow_overwrite();

        if isolated && ctx.cluster.topology.ready_version() < topology {
            let ready = ctx.cluster.topology.affinity_ready(topology);
            let this = self.clone();
            tokio::spawn(async move {
                ready.await;
                this.local_update(entries, topology, completion);
            });
            return;
        }

        StreamerStats::incr(&ctx.stats.local_batches, 1);
        let receiver = ctx.receiver();
        let store = ctx.cluster.store.clone();
        let topology_service = ctx.cluster.topology.clone();
        let flags = ApplyFlags {
            skip_store: ctx.config.skip_store,
            keep_binary: ctx.config.keep_binary,
            topology_version: topology,
        };
        let job = tokio::task::spawn_blocking(move || {
            let migration = topology_service.migration_lock();
            let _guard = isolated.then(|| migration.read());
            if isolated {
                let local = topology_service.ready_version();
                if local != topology {
                    return Err(StreamerError::StaleTopology {
                        requested: topology,
                        local,
                    });
                }
            }
            receiver.receive(store.as_ref(), &entries, flags)
        });

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        self.local_jobs.lock().insert(
            job_id,
            LocalJob {
                abort: job.abort_handle(),
                completion: completion.clone(),
            },
        );

        let jobs = self.local_jobs.clone();
        tokio::spawn(async move {
            let result = match job.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(StreamerError::cancelled()),
                Err(e) => Err(StreamerError::Store(format!("local apply job failed: {}", e))),
            };
            jobs.lock().remove(&job_id);
            completion.complete(result);
        });
    }

    /// Marshals the batch once and sends it; the response listener resolves
    /// `completion` by request id.
    pub(super) fn remote_update(
        &self,
        entries: Vec<StreamerEntry>,
        topology: TopologyVersion,
        completion: Completion,
        stripe: usize,
    ) {
        let ctx = &self.ctx;
        let node = self.node.id;

        let payload = match encode_entries(&entries) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to marshal streamer batch for node {}: {}", node, e);
                completion.fail(e);
                return;
            }
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.requests.lock().insert(request_id, completion.clone());
        let requests = Arc::downgrade(&self.requests);
        completion.listen(move |_| {
            if let Some(requests) = requests.upgrade() {
                requests.lock().remove(&request_id);
            }
        });

        let request = StreamerRequest {
            request_id,
            response_topic: ctx.response_topic.clone(),
            cache_name: ctx.config.cache_name.clone(),
            receiver_id: ctx.receiver().id().to_string(),
            entries: payload,
            skip_store: ctx.config.skip_store,
            keep_binary: ctx.config.keep_binary,
            topology_version: topology,
            stripe: Some(stripe as u32),
        };
        let policy = ctx.io_policy_for(&self.node);

        StreamerStats::incr(&ctx.stats.remote_batches, 1);
        match ctx.cluster.messaging.send(node, STREAMER_TOPIC, request, policy) {
            Ok(()) => debug!(
                "Sent request to node [node={}, request_id={}, entries={}]",
                node,
                request_id,
                entries.len()
            ),
            Err(TransportError::NodeUnreachable(_)) => {
                completion.fail(StreamerError::NodeLeft { node });
            }
            Err(e) => {
                let err = if ctx.cluster.topology.is_alive(node) {
                    StreamerError::Transport {
                        node,
                        reason: e.to_string(),
                    }
                } else {
                    StreamerError::NodeLeft { node }
                };
                completion.fail(err);
            }
        }
    }
}

/// Routes responses arriving on the streamer's private topic to the
/// buffer of the node that sent them.
pub(super) fn spawn_response_listener(
    inner: Weak<StreamerInner>,
    mut rx: mpsc::UnboundedReceiver<(NodeId, StreamerResponse)>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (node, response) = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.on_response(node, response);
        }
        debug!("Streamer response listener stopped");
    })
}

/// Evicts buffers of nodes that leave the cluster.
pub(super) fn spawn_discovery_listener(
    inner: Weak<StreamerInner>,
    mut rx: broadcast::Receiver<DiscoveryEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(DiscoveryEvent::NodeLeft {
                    node,
                    topology_version,
                })
                | Ok(DiscoveryEvent::NodeFailed {
                    node,
                    topology_version,
                }) => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.on_node_left(node, topology_version);
                }
                Ok(DiscoveryEvent::NodeJoined { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Streamer discovery listener lagged, missed {} events", missed);
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.evict_dead_nodes();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Streamer discovery listener stopped");
    })
}
