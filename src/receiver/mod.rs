//! Apply strategies run on the destination node.
//!
//! Requests name their receiver by id; the destination resolves it through a
//! [`ReceiverRegistry`]. Two receivers ship with the crate:
//!
//! - [`IsolatedReceiver`]: initial-value load. Never touches an existing
//!   entry, skips partitions the node no longer owns, ignores removals.
//! - [`IndividualReceiver`]: plain per-entry put/remove with overwrite.

mod processor;

pub use processor::RequestProcessor;

use crate::cluster::{CacheStore, TopologyVersion};
use crate::error::Result;
use crate::streamer::StreamerEntry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Flags a batch is applied with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyFlags {
    pub skip_store: bool,
    pub keep_binary: bool,
    pub topology_version: TopologyVersion,
}

pub trait StreamReceiver: Send + Sync + 'static {
    /// Stable id carried in requests.
    fn id(&self) -> &str;

    /// Whether the receiver only loads initial values. Such receivers demand
    /// that batches be applied at the topology they were routed under.
    fn is_isolated(&self) -> bool {
        false
    }

    fn receive(&self, store: &dyn CacheStore, entries: &[StreamerEntry], flags: ApplyFlags)
        -> Result<()>;
}

#[derive(Debug, Default)]
pub struct IsolatedReceiver;

impl IsolatedReceiver {
    pub const ID: &'static str = "isolated";
}

impl StreamReceiver for IsolatedReceiver {
    fn id(&self) -> &str {
        Self::ID
    }

    fn is_isolated(&self) -> bool {
        true
    }

    fn receive(
        &self,
        store: &dyn CacheStore,
        entries: &[StreamerEntry],
        flags: ApplyFlags,
    ) -> Result<()> {
        let mut skipped = 0usize;
        for entry in entries {
            let Some(partition) = entry.partition else {
                skipped += 1;
                continue;
            };
            if !store.owns_partition(partition) {
                skipped += 1;
                continue;
            }
            let Some(value) = &entry.value else {
                continue;
            };
            // One bad entry must not sink the rest of the batch
            if let Err(e) = store.put_if_absent(partition, &entry.key, value, flags.skip_store) {
                error!("Failed to set initial value for cache entry: {}", e);
            }
        }
        if skipped > 0 {
            debug!(
                "Skipped {} entries for partitions not owned locally at {}",
                skipped, flags.topology_version
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct IndividualReceiver;

impl IndividualReceiver {
    pub const ID: &'static str = "individual";
}

impl StreamReceiver for IndividualReceiver {
    fn id(&self) -> &str {
        Self::ID
    }

    fn receive(
        &self,
        store: &dyn CacheStore,
        entries: &[StreamerEntry],
        flags: ApplyFlags,
    ) -> Result<()> {
        for entry in entries {
            let partition = entry.partition.unwrap_or_default();
            match &entry.value {
                Some(value) => store.put(partition, &entry.key, value, flags.skip_store)?,
                None => {
                    store.remove(partition, &entry.key, flags.skip_store)?;
                }
            }
        }
        Ok(())
    }
}

/// Receivers known to a node, by id.
#[derive(Clone)]
pub struct ReceiverRegistry {
    receivers: Arc<RwLock<HashMap<String, Arc<dyn StreamReceiver>>>>,
}

impl Default for ReceiverRegistry {
    fn default() -> Self {
        let registry = ReceiverRegistry {
            receivers: Arc::new(RwLock::new(HashMap::new())),
        };
        registry.register(Arc::new(IsolatedReceiver));
        registry.register(Arc::new(IndividualReceiver));
        registry
    }
}

impl ReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, receiver: Arc<dyn StreamReceiver>) {
        self.receivers
            .write()
            .insert(receiver.id().to_string(), receiver);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn StreamReceiver>> {
        self.receivers.read().get(id).cloned()
    }
}
