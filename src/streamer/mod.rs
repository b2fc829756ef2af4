//! Data streamer.
//!
//! ```text
//! add_data ──► producer micro-batch ──► routing ──► NodeBuffer stripe
//!                                         ▲            │ full / flush
//!                                         │            ▼
//!                                   remap worker ◄── ParallelGate ──► local apply
//!                                   (on failure)                  └─► remote request
//!                                                                        │
//!                          completion resolved ◄── response listener ◄───┘
//! ```
//!
//! One `load` routes a batch of entries at the current topology and appends
//! each node's share to that node's buffer. Each share is tracked by a
//! compound completion over the stripe batches it landed in; when that
//! resolves, the share either acknowledges its keys or is handed to the
//! remap worker, which runs `load` again with the retry count bumped.

mod auto_flush;
mod buffer;
mod completion;
mod context;
mod entry;
mod flow;
mod producer;
mod remap;
mod routing;
mod transport;

pub use completion::{Completion, CompoundCompletion};
pub use context::IoPolicyResolver;
pub use entry::StreamerEntry;
pub use producer::Producer;

use crate::cluster::{ClusterContext, ClusterNode, NodeId, Permission, TopologyVersion};
use crate::config::StreamerConfig;
use crate::error::{Result, StreamerError};
use crate::observability::{StatsSnapshot, StreamerStats};
use crate::protocol::StreamerResponse;
use crate::receiver::{IndividualReceiver, IsolatedReceiver, StreamReceiver};
use buffer::NodeBuffer;
use bytes::Bytes;
use completion::ActiveOperations;
use context::SharedContext;
use entry::PendingKeys;
use flow::RemapGate;
use parking_lot::{Mutex, RwLock};
use producer::{ProducerRegistry, SharedBatch};
use remap::{LoadAttempt, RemapHandle};
use routing::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static NEXT_STREAMER_ID: AtomicU64 = AtomicU64::new(1);
static OVERWRITE_WARNED: AtomicBool = AtomicBool::new(false);

/// How long a flush pass waits for progress before scanning buffers again.
const FLUSH_RESCAN_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct StreamerInner {
    ctx: Arc<SharedContext>,
    router: Router,
    buffers: RwLock<HashMap<NodeId, Arc<NodeBuffer>>>,
    active: ActiveOperations,
    producers: ProducerRegistry,
    default_batch: SharedBatch,
    remap_gate: RemapGate,
    remapper: RemapHandle,
    /// Read by ingest calls while they append; close takes it for writing
    /// once so no entry lands in a micro-batch after the final drain.
    admission: RwLock<bool>,
    closed: AtomicBool,
    failures: AtomicU64,
    cancellation_reason: Mutex<Option<StreamerError>>,
    disconnect_error: Mutex<Option<StreamerError>>,
    session: Completion,
    last_flush: Mutex<Instant>,
    auto_flush_ms: AtomicU64,
    auto_flush: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

/// Bulk loader for one cache.
///
/// Cloning is cheap and every clone drives the same streamer.
#[derive(Clone)]
pub struct Streamer {
    inner: Arc<StreamerInner>,
}

impl Streamer {
    /// Creates a streamer and starts its background tasks. Must be called
    /// from within a tokio runtime.
    pub fn new(config: StreamerConfig, cluster: ClusterContext) -> Result<Self> {
        config.validate()?;

        let topic = format!(
            "grid.datastreamer.{}.{}",
            cluster.local_node(),
            NEXT_STREAMER_ID.fetch_add(1, Ordering::Relaxed)
        );
        let responses = cluster.messaging.register_listener(&topic);
        let events = cluster.topology.subscribe();
        let (remapper, remap_rx) = remap::remap_channel();

        let router = Router::new(config.cache_name.clone(), cluster.affinity.clone());
        let producers = ProducerRegistry::default();
        let default_batch = producers.register(config.per_batch_buffer_size);
        let auto_flush_frequency = config.auto_flush_frequency;
        let allow_overwrite = config.allow_overwrite;
        let ctx = Arc::new(SharedContext::new(config, cluster, topic));

        let inner = Arc::new(StreamerInner {
            ctx,
            router,
            buffers: RwLock::new(HashMap::new()),
            active: ActiveOperations::default(),
            producers,
            default_batch,
            remap_gate: RemapGate::new(),
            remapper,
            admission: RwLock::new(true),
            closed: AtomicBool::new(false),
            failures: AtomicU64::new(0),
            cancellation_reason: Mutex::new(None),
            disconnect_error: Mutex::new(None),
            session: Completion::new(),
            last_flush: Mutex::new(Instant::now()),
            auto_flush_ms: AtomicU64::new(0),
            auto_flush: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&inner);
        transport::spawn_response_listener(weak.clone(), responses, inner.shutdown.clone());
        transport::spawn_discovery_listener(weak.clone(), events, inner.shutdown.clone());
        remap::spawn_remap_worker(weak, remap_rx);
        inner.set_auto_flush_frequency(auto_flush_frequency);

        if !allow_overwrite && !OVERWRITE_WARNED.swap(true, Ordering::Relaxed) {
            warn!(
                "Data streamer will not overwrite existing cache entries for better performance \
                 (to change, set allow_overwrite to true)"
            );
        }
        debug!(
            "Started data streamer [cache={}, topic={}]",
            inner.ctx.config.cache_name, inner.ctx.response_topic
        );

        Ok(Streamer { inner })
    }

    pub fn cache_name(&self) -> &str {
        &self.inner.ctx.config.cache_name
    }

    /// A new producer handle with its own micro-batch.
    pub fn producer(&self) -> Producer {
        Producer::new(self.inner.clone())
    }

    /// Buffers one entry. The returned completion is shared by every entry
    /// in the same micro-batch.
    pub async fn add_data(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Completion> {
        self.inner
            .add_single(
                &self.inner.default_batch,
                StreamerEntry::put(key, value),
                Permission::Put,
            )
            .await
    }

    pub async fn remove_data(&self, key: impl Into<Bytes>) -> Result<Completion> {
        self.inner
            .add_single(
                &self.inner.default_batch,
                StreamerEntry::remove(key),
                Permission::Remove,
            )
            .await
    }

    /// Routes a collection right away under one completion.
    pub async fn add_all<I, K, V>(&self, entries: I) -> Result<Completion>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        let entries = entries
            .into_iter()
            .map(|(k, v)| StreamerEntry::put(k, v))
            .collect();
        self.inner.add_entries(entries).await
    }

    /// Like [`add_all`](Self::add_all), but entries may be removals.
    pub async fn add_entries(&self, entries: Vec<StreamerEntry>) -> Result<Completion> {
        self.inner.add_entries(entries).await
    }

    /// Sends everything buffered and waits until it is applied.
    pub async fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.drain_producers().await?;
        self.inner.do_flush().await
    }

    /// Sends everything buffered without waiting. Errors are logged.
    pub async fn try_flush(&self) {
        self.inner.try_flush().await
    }

    /// Closes the streamer. With `cancel` outstanding work is failed,
    /// otherwise it is flushed first. Only the first call has any effect.
    pub async fn close(&self, cancel: bool) -> Result<()> {
        self.inner.close_with(cancel, None).await
    }

    /// Fails everything with `ClientDisconnected` and closes.
    pub async fn on_client_disconnected(&self) {
        let err = StreamerError::ClientDisconnected;
        *self.inner.disconnect_error.lock() = Some(err.clone());
        self.inner.cancel_all(&err);
        let _ = self.inner.close_with(true, Some(err)).await;
    }

    /// Resolves when the streamer closes.
    pub fn future(&self) -> Completion {
        self.inner.session.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn set_receiver(&self, receiver: Arc<dyn StreamReceiver>) {
        self.inner.ctx.set_receiver(receiver);
    }

    pub fn set_allow_overwrite(&self, allow: bool) {
        let receiver: Arc<dyn StreamReceiver> = if allow {
            Arc::new(IndividualReceiver)
        } else {
            Arc::new(IsolatedReceiver)
        };
        self.inner.ctx.set_receiver(receiver);
    }

    pub fn allow_overwrite(&self) -> bool {
        self.inner.ctx.allow_overwrite()
    }

    /// Zero disables periodic flushing.
    pub fn set_auto_flush_frequency(&self, frequency: Duration) {
        self.inner.set_auto_flush_frequency(frequency);
    }

    pub fn auto_flush_frequency(&self) -> Duration {
        Duration::from_millis(self.inner.auto_flush_ms.load(Ordering::Relaxed))
    }

    pub fn set_io_policy_resolver(&self, resolver: IoPolicyResolver) {
        self.inner.ctx.set_io_policy_resolver(resolver);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.ctx.stats.snapshot(self.inner.active.len())
    }
}

impl StreamerInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire)
            || self.ctx.is_cancelled()
            || self.disconnect_error.lock().is_some()
        {
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// A disconnect takes precedence over the cancellation cause.
    fn closed_error(&self) -> StreamerError {
        if let Some(err) = self.disconnect_error.lock().clone() {
            return err;
        }
        StreamerError::Closed {
            cause: self.cancellation_reason.lock().clone().map(Arc::new),
        }
    }

    fn cancellation_cause(&self) -> StreamerError {
        self.cancellation_reason
            .lock()
            .clone()
            .unwrap_or_else(StreamerError::cancelled)
    }

    fn authorize(&self, permission: Permission) -> Result<()> {
        match &self.ctx.cluster.security {
            Some(security) => security
                .authorize(&self.ctx.config.cache_name, permission)
                .map_err(StreamerError::PermissionDenied),
            None => Ok(()),
        }
    }

    fn validate_key(entry: &StreamerEntry) -> Result<()> {
        if entry.key.is_empty() {
            return Err(StreamerError::InvalidArgument(
                "key must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn add_single(
        self: &Arc<Self>,
        batch: &SharedBatch,
        entry: StreamerEntry,
        permission: Permission,
    ) -> Result<Completion> {
        Self::validate_key(&entry)?;
        self.authorize(permission)?;

        let (completion, cut) = {
            let admission = self.admission.read();
            if !*admission {
                return Err(self.closed_error());
            }
            self.ensure_open()?;

            let mut batch = batch.lock();
            let completion = batch.completion().clone();
            if !batch.tracked {
                batch.tracked = true;
                self.track(&completion);
            }
            (completion, batch.push(entry))
        };

        if let Some((entries, cut_completion)) = cut {
            debug_assert_eq!(cut_completion, completion);
            self.load_batch(entries, cut_completion).await?;
        }
        Ok(completion)
    }

    async fn add_entries(self: &Arc<Self>, entries: Vec<StreamerEntry>) -> Result<Completion> {
        if entries.is_empty() {
            return Err(StreamerError::InvalidArgument(
                "entries collection must not be empty".to_string(),
            ));
        }
        for entry in &entries {
            Self::validate_key(entry)?;
        }
        self.authorize(Permission::Put)?;
        if entries.iter().any(StreamerEntry::is_removal) {
            self.authorize(Permission::Remove)?;
        }

        let result = Completion::new();
        {
            let admission = self.admission.read();
            if !*admission {
                return Err(self.closed_error());
            }
            self.ensure_open()?;
            self.track(&result);
        }

        self.load_batch(entries, result.clone()).await?;
        Ok(result)
    }

    /// Adds `completion` to the active set until it resolves.
    fn track(self: &Arc<Self>, completion: &Completion) {
        self.active.insert(completion);
        let inner = Arc::downgrade(self);
        let id = completion.id();
        completion.listen(move |outcome| {
            if let Some(inner) = inner.upgrade() {
                inner.on_operation_done(id, outcome);
            }
        });
    }

    fn on_operation_done(&self, id: u64, outcome: &Result<()>) {
        let removed = self.active.remove(id);
        debug_assert!(removed, "operation {} finished twice", id);

        let Err(err) = outcome else {
            return;
        };
        if matches!(err, StreamerError::ClientDisconnected) {
            return;
        }
        if matches!(err, StreamerError::Cancelled { .. }) {
            debug!("DataStreamer operation cancelled: {}", err);
        } else {
            error!("DataStreamer operation failed: {}", err);
        }

        StreamerStats::incr(&self.ctx.stats.failed_operations, 1);
        self.failures.fetch_add(1, Ordering::Relaxed);
        {
            let mut reason = self.cancellation_reason.lock();
            if reason.is_none() {
                *reason = Some(err.clone());
            }
        }
        self.ctx.mark_cancelled();
    }

    async fn load_batch(
        self: &Arc<Self>,
        entries: Vec<StreamerEntry>,
        result: Completion,
    ) -> Result<()> {
        let pending = (entries.len() > 1).then(|| Arc::new(PendingKeys::new(&entries)));
        self.load(entries, result, pending, 0, false).await
    }

    /// Routes `entries` at the current topology and appends them to the
    /// destination buffers. Fresh loads (`retry == false`) first wait for
    /// outstanding retries to drain.
    async fn load(
        self: &Arc<Self>,
        entries: Vec<StreamerEntry>,
        result: Completion,
        pending: Option<Arc<PendingKeys>>,
        remaps: u32,
        retry: bool,
    ) -> Result<()> {
        if !retry {
            if let Err(e) = self.remap_gate.wait_idle(self.ctx.config.timeout).await {
                result.fail(e.clone());
                return Err(e);
            }
        }

        let topology = self.ctx.cluster.topology.current_version();
        let routed = match self
            .router
            .route(entries, topology, self.ctx.allow_overwrite())
        {
            Ok(routed) => routed,
            Err(e) => {
                result.fail(e);
                return Ok(());
            }
        };

        for (node, node_entries) in routed.per_node {
            let buffer = self.buffer_for(&node);
            let op = CompoundCompletion::new();

            let attempt = LoadAttempt {
                entries: node_entries.clone(),
                result: result.clone(),
                pending: pending.clone(),
                remaps,
            };
            let inner = Arc::downgrade(self);
            op.completion().listen(move |outcome| match inner.upgrade() {
                Some(inner) => inner.on_node_batch_done(attempt, outcome),
                None => match outcome {
                    Ok(()) => attempt.acknowledged(),
                    Err(e) => {
                        attempt.result.fail(e.clone());
                    }
                },
            });

            let touched = match buffer
                .update(node_entries, routed.topology, &routed.assignments, &op, retry)
                .await
            {
                Ok(touched) => touched,
                Err(e) => {
                    op.mark_initialized();
                    result.fail(e.clone());
                    return Err(e);
                }
            };
            op.mark_initialized();

            if !self.ctx.cluster.topology.is_alive(node.id) {
                self.on_node_left(node.id, topology);
                let err = StreamerError::NodeLeft { node: node.id };
                for completion in touched {
                    completion.fail(err.clone());
                }
            }
        }
        Ok(())
    }

    fn buffer_for(&self, node: &ClusterNode) -> Arc<NodeBuffer> {
        if let Some(buffer) = self.buffers.read().get(&node.id) {
            return buffer.clone();
        }
        let is_local = node.id == self.ctx.cluster.local_node();
        self.buffers
            .write()
            .entry(node.id)
            .or_insert_with(|| Arc::new(NodeBuffer::new(node.clone(), is_local, self.ctx.clone())))
            .clone()
    }

    fn buffer_snapshot(&self) -> Vec<Arc<NodeBuffer>> {
        self.buffers.read().values().cloned().collect()
    }

    fn on_response(&self, node: NodeId, response: StreamerResponse) {
        let buffer = self.buffers.read().get(&node).cloned();
        match buffer {
            Some(buffer) => buffer.on_response(response),
            None => debug!(
                "Ignoring response since node has left [node={}, request_id={}]",
                node, response.request_id
            ),
        }
    }

    /// Drops the node's buffer and, once affinity for `topology` is ready,
    /// fails everything it still had outstanding.
    fn on_node_left(&self, node: NodeId, topology: TopologyVersion) {
        let removed = self.buffers.write().remove(&node);
        let Some(buffer) = removed else {
            return;
        };
        debug!(
            "Node left, will fail its outstanding batches [node={}, topology={}]",
            node, topology
        );
        let ready = self.ctx.cluster.topology.affinity_ready(topology);
        tokio::spawn(async move {
            ready.await;
            buffer.on_node_left();
        });
    }

    fn evict_dead_nodes(&self) {
        let topology = self.ctx.cluster.topology.current_version();
        let dead: Vec<NodeId> = self
            .buffers
            .read()
            .keys()
            .copied()
            .filter(|node| !self.ctx.cluster.topology.is_alive(*node))
            .collect();
        for node in dead {
            self.on_node_left(node, topology);
        }
    }

    async fn drain_producers(self: &Arc<Self>) -> Result<()> {
        for (entries, completion) in self.producers.drain() {
            self.load_batch(entries, completion).await?;
        }
        Ok(())
    }

    /// Flushes every buffer until all operations that were active on entry
    /// have resolved and no retries are outstanding.
    async fn do_flush(self: &Arc<Self>) -> Result<()> {
        *self.last_flush.lock() = Instant::now();

        let mut outstanding = Vec::new();
        for op in self.active.snapshot() {
            match op.result() {
                Some(Err(e)) => return Err(e),
                Some(Ok(())) => {}
                None => outstanding.push(op),
            }
        }

        // One deadline covers every pass, remaps included
        let deadline = self.ctx.config.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let retries_before = self.remap_gate.started();
            let mut waits = Vec::new();
            for buffer in self.buffer_snapshot() {
                if let Some(pending) = buffer.flush(&self.remap_gate).await? {
                    waits.push(pending);
                }
            }

            let mut failed = false;
            for pending in waits {
                let outcome = match deadline {
                    Some(deadline) => pending
                        .completion()
                        .wait_for(deadline.saturating_duration_since(Instant::now()))
                        .await
                        .ok_or(StreamerError::Timeout("on flush"))?,
                    None => pending.wait().await,
                };
                match outcome {
                    Ok(()) => {}
                    Err(StreamerError::ClientDisconnected) => {
                        return Err(StreamerError::ClientDisconnected)
                    }
                    Err(e) => {
                        debug!("Failed to flush buffer: {}", e);
                        failed = true;
                    }
                }
            }
            // Failed batches are being remapped; pick them up on the next pass
            if failed {
                continue;
            }

            let mut first_err = None;
            outstanding.retain(|op| match op.result() {
                None => true,
                Some(Ok(())) => false,
                Some(Err(e)) => {
                    first_err.get_or_insert(e);
                    false
                }
            });
            if let Some(e) = first_err {
                return Err(e);
            }

            let quiet = self.remap_gate.outstanding() == 0
                && self.remap_gate.started() == retries_before;
            if outstanding.is_empty() && quiet {
                return Ok(());
            }
            let rescan = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(StreamerError::Timeout("on flush"));
                    }
                    remaining.min(FLUSH_RESCAN_INTERVAL)
                }
                None => FLUSH_RESCAN_INTERVAL,
            };
            match outstanding.first() {
                None => {
                    let _ = self.remap_gate.wait_idle(Some(rescan)).await;
                }
                Some(op) => {
                    let _ = op.wait_for(rescan).await;
                }
            }
        }
    }

    async fn try_flush(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) || self.ctx.is_cancelled() {
            return;
        }
        for (entries, completion) in self.producers.drain() {
            if let Err(e) = self.load_batch(entries, completion).await {
                debug!("Failed to route micro-batch on try_flush: {}", e);
            }
        }
        for buffer in self.buffer_snapshot() {
            if let Err(e) = buffer.flush(&self.remap_gate).await {
                debug!("Failed to flush buffer for node {}: {}", buffer.node.id, e);
            }
        }
        *self.last_flush.lock() = Instant::now();
    }

    fn cancel_all(&self, err: &StreamerError) {
        for buffer in self.buffer_snapshot() {
            buffer.cancel_all(err);
        }
        for op in self.active.snapshot() {
            op.fail(err.clone());
        }
    }

    async fn close_with(
        self: &Arc<Self>,
        cancel: bool,
        err: Option<StreamerError>,
    ) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.admission.write() = false;
        let drained = self.producers.drain();

        info!(
            "Closing data streamer [cache={}, cancel={}]",
            self.ctx.config.cache_name, cancel
        );

        let outcome = if cancel {
            self.ctx.mark_cancelled();
            let err = err.unwrap_or_else(StreamerError::cancelled);
            for (_, completion) in drained {
                completion.fail(err.clone());
            }
            self.cancel_all(&err);
            Err(err)
        } else {
            let mut outcome = Ok(());
            for (entries, completion) in drained {
                if let Err(e) = self.load_batch(entries, completion).await {
                    outcome = Err(e);
                    break;
                }
            }
            match outcome {
                Ok(()) => self.do_flush().await,
                Err(e) => Err(e),
            }
        };

        self.stop_background();

        match outcome {
            Err(e) if cancel => {
                self.session.fail(e);
                Ok(())
            }
            Err(e) => {
                self.session.fail(e.clone());
                Err(e)
            }
            Ok(()) => {
                let failed = self.failures.load(Ordering::Relaxed);
                if failed > 0 {
                    self.session
                        .fail(StreamerError::OperationsFailed { count: failed });
                } else {
                    self.session.succeed(());
                }
                Ok(())
            }
        }
    }

    fn stop_background(&self) {
        self.shutdown.cancel();
        if let Some(token) = self.auto_flush.lock().take() {
            token.cancel();
        }
        self.ctx
            .cluster
            .messaging
            .remove_listener(&self.ctx.response_topic);
    }

    fn set_auto_flush_frequency(self: &Arc<Self>, frequency: Duration) {
        self.auto_flush_ms
            .store(frequency.as_millis() as u64, Ordering::Relaxed);

        let mut running = self.auto_flush.lock();
        if frequency.is_zero() {
            if let Some(token) = running.take() {
                token.cancel();
            }
            return;
        }
        if running.is_none() && !self.closed.load(Ordering::Acquire) {
            let token = self.shutdown.child_token();
            auto_flush::spawn_auto_flusher(Arc::downgrade(self), token.clone());
            *running = Some(token);
        }
    }

    /// `None` when auto-flush is off.
    fn next_flush_time(&self) -> Option<Instant> {
        let millis = self.auto_flush_ms.load(Ordering::Relaxed);
        if millis == 0 {
            return None;
        }
        Some(*self.last_flush.lock() + Duration::from_millis(millis))
    }
}

impl Drop for StreamerInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.stop_background();
        }
    }
}
