//! Per-node buffer.
//!
//! Entries bound for one node are spread over `stripe_count` stripes by
//! partition. A stripe accumulates a batch together with the topology and
//! assignment snapshot it was opened under and the completion every entry in
//! it shares. Reaching `per_node_buffer_size` detaches the batch ("renew")
//! and submits it outside the stripe lock.

use super::completion::{Completion, CompoundCompletion};
use super::context::SharedContext;
use super::flow::{ParallelGate, RemapGate};
use super::StreamerEntry;
use crate::cluster::{same_assignments, Assignments, ClusterNode, TopologyVersion};
use crate::error::{Result, StreamerError};
use crate::observability::StreamerStats;
use crate::protocol::{FailureKind, StreamerResponse};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

struct Stripe {
    entries: Vec<StreamerEntry>,
    completion: Completion,
    batch_topology: Option<TopologyVersion>,
    assignments: Option<Assignments>,
}

/// A batch cut from a stripe, no longer reachable by appenders.
pub(super) struct DetachedBatch {
    pub(super) entries: Vec<StreamerEntry>,
    pub(super) completion: Completion,
    pub(super) topology: Option<TopologyVersion>,
}

impl Stripe {
    fn new(capacity: usize) -> Self {
        Stripe {
            entries: Vec::with_capacity(capacity),
            completion: Completion::new(),
            batch_topology: None,
            assignments: None,
        }
    }

    /// Swaps in a fresh generation. Entries and completion always move together.
    fn renew(&mut self, capacity: usize) -> DetachedBatch {
        let fresh = Stripe::new(capacity);
        let old = std::mem::replace(self, fresh);
        DetachedBatch {
            entries: old.entries,
            completion: old.completion,
            topology: old.batch_topology,
        }
    }
}

pub(super) struct LocalJob {
    pub(super) abort: AbortHandle,
    pub(super) completion: Completion,
}

pub(crate) struct NodeBuffer {
    pub(crate) node: ClusterNode,
    pub(super) is_local: bool,
    stripes: Box<[Mutex<Stripe>]>,
    /// In-flight remote requests by id.
    pub(super) requests: Arc<Mutex<AHashMap<u64, Completion>>>,
    pub(super) local_jobs: Arc<Mutex<AHashMap<u64, LocalJob>>>,
    pub(super) next_request_id: AtomicU64,
    pub(super) next_job_id: AtomicU64,
    gate: ParallelGate,
    pub(super) ctx: Arc<SharedContext>,
}

impl NodeBuffer {
    pub(crate) fn new(node: ClusterNode, is_local: bool, ctx: Arc<SharedContext>) -> Self {
        let stripe_count = node.stripe_count();
        let capacity = ctx.config.per_node_buffer_size;
        let gate = ParallelGate::new(ctx.config.parallel_ops_for(stripe_count));
        debug!(
            "Created buffer for node {} [local={}, stripes={}, parallel_ops={}]",
            node.id,
            is_local,
            stripe_count,
            gate.capacity()
        );
        NodeBuffer {
            node,
            is_local,
            stripes: (0..stripe_count)
                .map(|_| Mutex::new(Stripe::new(capacity)))
                .collect(),
            requests: Arc::new(Mutex::new(AHashMap::new())),
            local_jobs: Arc::new(Mutex::new(AHashMap::new())),
            next_request_id: AtomicU64::new(0),
            next_job_id: AtomicU64::new(0),
            gate,
            ctx,
        }
    }

    /// Appends routed entries, adding every stripe completion they land in
    /// to `op`. Returns those completions.
    pub(crate) async fn update(
        self: &Arc<Self>,
        entries: Vec<StreamerEntry>,
        topology: TopologyVersion,
        assignments: &Assignments,
        op: &CompoundCompletion,
        remap: bool,
    ) -> Result<Vec<Completion>> {
        let capacity = self.ctx.config.per_node_buffer_size;
        let check_topology = !self.ctx.allow_overwrite();
        let mut touched: Vec<Option<Completion>> = vec![None; self.stripes.len()];

        for entry in entries {
            debug_assert!(entry.partition.is_some(), "entry reached buffer unrouted");
            let idx = entry.partition.unwrap_or_default() as usize % self.stripes.len();

            let (current, batch_topology, detached) = {
                let mut stripe = self.stripes[idx].lock();

                let opened_under = match (stripe.batch_topology, stripe.assignments.as_ref()) {
                    (Some(v), Some(a)) => Some((v, same_assignments(a, assignments))),
                    _ => None,
                };
                match opened_under {
                    None => {
                        stripe.batch_topology = Some(topology);
                        stripe.assignments = Some(assignments.clone());
                    }
                    // Version bump without an assignment change
                    Some((v, true)) if v != topology => stripe.batch_topology = Some(topology),
                    Some(_) => {}
                }

                let current = stripe.completion.clone();
                let batch_topology = stripe.batch_topology.unwrap_or(topology);
                stripe.entries.push(entry);
                let detached = (stripe.entries.len() >= capacity).then(|| stripe.renew(capacity));
                (current, batch_topology, detached)
            };

            if touched[idx].as_ref() != Some(&current) {
                op.add(&current);
                touched[idx] = Some(current.clone());
            }

            if check_topology && batch_topology != topology {
                let err = StreamerError::TopologyChanged {
                    batch: batch_topology,
                    current: topology,
                };
                for stale in self.renew_stale_stripes(topology) {
                    stale.fail(err.clone());
                }
                // The stripe may be newer than this load and survive the
                // sweep. Its completion is about to fail, so detach it too.
                {
                    let mut stripe = self.stripes[idx].lock();
                    if stripe.completion == current {
                        stripe.renew(capacity);
                    }
                }
                current.fail(err);
            } else if let Some(batch) = detached {
                self.submit(batch, idx, remap).await?;
                if self.ctx.is_cancelled() {
                    current.fail(StreamerError::cancelled());
                }
            }
        }

        Ok(touched.into_iter().flatten().collect())
    }

    /// Renews every stripe opened before `topology`, returning their completions.
    fn renew_stale_stripes(&self, topology: TopologyVersion) -> Vec<Completion> {
        let capacity = self.ctx.config.per_node_buffer_size;
        let mut stale = Vec::new();
        for stripe in self.stripes.iter() {
            let mut stripe = stripe.lock();
            if matches!(stripe.batch_topology, Some(v) if v < topology) {
                stale.push(stripe.renew(capacity).completion);
            }
        }
        StreamerStats::incr(&self.ctx.stats.topology_renewals, stale.len() as u64);
        stale
    }

    async fn submit(
        self: &Arc<Self>,
        batch: DetachedBatch,
        stripe: usize,
        remap: bool,
    ) -> Result<()> {
        let DetachedBatch {
            entries,
            completion,
            topology,
        } = batch;
        debug_assert!(!entries.is_empty());

        if !remap {
            match self.gate.acquire(self.ctx.config.timeout).await {
                Ok(permit) => completion.listen(move |_| drop(permit)),
                Err(e) => {
                    completion.fail(e.clone());
                    return Err(e);
                }
            }
        }

        let topology = topology.unwrap_or_else(|| self.ctx.cluster.topology.ready_version());
        StreamerStats::incr(&self.ctx.stats.entries_submitted, entries.len() as u64);

        if self.is_local {
            self.local_update(entries, topology, completion);
        } else {
            self.remote_update(entries, topology, completion, stripe);
        }
        Ok(())
    }

    /// Sends every non-empty stripe and returns a join over everything in
    /// flight, or `None` when nothing is.
    pub(crate) async fn flush(
        self: &Arc<Self>,
        remap_gate: &RemapGate,
    ) -> Result<Option<CompoundCompletion>> {
        remap_gate.wait_idle(self.ctx.config.timeout).await?;

        let capacity = self.ctx.config.per_node_buffer_size;
        for idx in 0..self.stripes.len() {
            let detached = {
                let mut stripe = self.stripes[idx].lock();
                (!stripe.entries.is_empty()).then(|| stripe.renew(capacity))
            };
            if let Some(batch) = detached {
                self.submit(batch, idx, false).await?;
            }
        }

        let mut inflight: Vec<Completion> = self
            .local_jobs
            .lock()
            .values()
            .map(|job| job.completion.clone())
            .collect();
        inflight.extend(self.requests.lock().values().cloned());
        if inflight.is_empty() {
            return Ok(None);
        }

        let pending = CompoundCompletion::new();
        for completion in &inflight {
            pending.add(completion);
        }
        pending.mark_initialized();
        Ok(Some(pending))
    }

    pub(crate) fn on_response(&self, response: StreamerResponse) {
        StreamerStats::incr(&self.ctx.stats.responses, 1);
        let Some(completion) = self.requests.lock().remove(&response.request_id) else {
            warn!(
                "Future for request has not been found [node={}, request_id={}]",
                self.node.id, response.request_id
            );
            return;
        };

        let node = self.node.id;
        let result = match response.error {
            None => Ok(()),
            Some(failure) => match failure.kind {
                FailureKind::Topology => Err(StreamerError::RemoteTopology {
                    node,
                    message: failure.message,
                }),
                FailureKind::Application => Err(StreamerError::Remote {
                    node,
                    message: failure.message,
                }),
            },
        };
        completion.complete(result);
    }

    /// Fails in-flight requests and every stripe's open batch.
    pub(crate) fn on_node_left(&self) {
        let err = StreamerError::NodeLeft { node: self.node.id };
        let requests: Vec<Completion> = self.requests.lock().values().cloned().collect();
        debug!(
            "Failing {} in-flight requests to node {} that left",
            requests.len(),
            self.node.id
        );
        for completion in requests {
            completion.fail(err.clone());
        }
        self.fail_open_batches(&err);
    }

    fn fail_open_batches(&self, err: &StreamerError) {
        for stripe in self.stripes.iter() {
            let current = stripe.lock().completion.clone();
            current.fail(err.clone());
        }
    }

    /// Aborts local jobs and fails everything outstanding with `err`.
    pub(crate) fn cancel_all(&self, err: &StreamerError) {
        let jobs: Vec<LocalJob> = self.local_jobs.lock().drain().map(|(_, job)| job).collect();
        for job in jobs {
            job.abort.abort();
            job.completion.fail(err.clone());
        }

        let requests: Vec<Completion> = self
            .requests
            .lock()
            .drain()
            .map(|(_, completion)| completion)
            .collect();
        for completion in requests {
            completion.fail(err.clone());
        }

        self.fail_open_batches(err);
    }

    #[cfg(test)]
    fn stripe_state(&self, idx: usize) -> (usize, Completion, Option<TopologyVersion>) {
        let stripe = self.stripes[idx].lock();
        (
            stripe.entries.len(),
            stripe.completion.clone(),
            stripe.batch_topology,
        )
    }
}
