use crate::cluster::{ClusterContext, ClusterNode, IoPolicy};
use crate::config::StreamerConfig;
use crate::observability::StreamerStats;
use crate::receiver::{IndividualReceiver, IsolatedReceiver, StreamReceiver};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type IoPolicyResolver = Arc<dyn Fn(&ClusterNode) -> IoPolicy + Send + Sync>;

/// State shared by the streamer and every per-node buffer.
pub(crate) struct SharedContext {
    pub(crate) config: StreamerConfig,
    pub(crate) cluster: ClusterContext,
    /// Private topic responses for this streamer arrive on.
    pub(crate) response_topic: String,
    pub(crate) stats: StreamerStats,
    cancelled: AtomicBool,
    receiver: RwLock<Arc<dyn StreamReceiver>>,
    io_policy: RwLock<Option<IoPolicyResolver>>,
}

impl SharedContext {
    pub(crate) fn new(
        config: StreamerConfig,
        cluster: ClusterContext,
        response_topic: String,
    ) -> Self {
        let receiver: Arc<dyn StreamReceiver> = if config.allow_overwrite {
            Arc::new(IndividualReceiver)
        } else {
            Arc::new(IsolatedReceiver)
        };
        SharedContext {
            config,
            cluster,
            response_topic,
            stats: StreamerStats::default(),
            cancelled: AtomicBool::new(false),
            receiver: RwLock::new(receiver),
            io_policy: RwLock::new(None),
        }
    }

    pub(crate) fn receiver(&self) -> Arc<dyn StreamReceiver> {
        self.receiver.read().clone()
    }

    pub(crate) fn set_receiver(&self, receiver: Arc<dyn StreamReceiver>) {
        *self.receiver.write() = receiver;
    }

    /// Any receiver other than the isolated one may overwrite entries.
    pub(crate) fn allow_overwrite(&self) -> bool {
        !self.receiver.read().is_isolated()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn set_io_policy_resolver(&self, resolver: IoPolicyResolver) {
        *self.io_policy.write() = Some(resolver);
    }

    pub(crate) fn io_policy_for(&self, node: &ClusterNode) -> IoPolicy {
        match &*self.io_policy.read() {
            Some(resolver) => resolver(node),
            None => IoPolicy::default(),
        }
    }
}
