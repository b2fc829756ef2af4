//! Producer handles.
//!
//! Single-entry calls accumulate into a micro-batch owned by the producer
//! that made them. Every entry in one micro-batch shares the same completion,
//! and the batch is routed once it reaches `per_batch_buffer_size` or when
//! the streamer flushes.

use super::completion::Completion;
use super::{StreamerEntry, StreamerInner};
use crate::cluster::Permission;
use crate::error::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct MicroBatch {
    entries: Vec<StreamerEntry>,
    completion: Completion,
    /// Whether `completion` is in the active operation set yet.
    pub(crate) tracked: bool,
    capacity: usize,
}

impl MicroBatch {
    pub(crate) fn new(capacity: usize) -> Self {
        MicroBatch {
            entries: Vec::with_capacity(capacity),
            completion: Completion::new(),
            tracked: false,
            capacity,
        }
    }

    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Appends and, once full, cuts the batch.
    pub(crate) fn push(
        &mut self,
        entry: StreamerEntry,
    ) -> Option<(Vec<StreamerEntry>, Completion)> {
        self.entries.push(entry);
        if self.entries.len() >= self.capacity {
            self.take()
        } else {
            None
        }
    }

    pub(crate) fn take(&mut self) -> Option<(Vec<StreamerEntry>, Completion)> {
        if self.entries.is_empty() {
            return None;
        }
        let fresh = MicroBatch::new(self.capacity);
        let old = std::mem::replace(self, fresh);
        Some((old.entries, old.completion))
    }
}

pub(crate) type SharedBatch = Arc<Mutex<MicroBatch>>;

/// Micro-batches of every producer, drained on flush and close.
#[derive(Default)]
pub(crate) struct ProducerRegistry {
    batches: Mutex<Vec<SharedBatch>>,
}

impl ProducerRegistry {
    pub(crate) fn register(&self, capacity: usize) -> SharedBatch {
        let batch = Arc::new(Mutex::new(MicroBatch::new(capacity)));
        let mut batches = self.batches.lock();
        // Forget batches of dropped producers once they are empty
        batches.retain(|b| Arc::strong_count(b) > 1 || !b.lock().entries.is_empty());
        batches.push(batch.clone());
        batch
    }

    /// Cuts every non-empty micro-batch.
    pub(crate) fn drain(&self) -> Vec<(Vec<StreamerEntry>, Completion)> {
        let batches: Vec<SharedBatch> = self.batches.lock().clone();
        batches.iter().filter_map(|b| b.lock().take()).collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.batches.lock().len()
    }
}

/// An ingest handle with its own micro-batch.
///
/// Entries buffered by a dropped producer are still routed by the next
/// streamer flush or close.
pub struct Producer {
    inner: Arc<StreamerInner>,
    batch: SharedBatch,
}

impl Producer {
    pub(crate) fn new(inner: Arc<StreamerInner>) -> Self {
        let batch = inner
            .producers
            .register(inner.ctx.config.per_batch_buffer_size);
        Producer { inner, batch }
    }

    pub async fn add_data(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Completion> {
        self.inner
            .add_single(&self.batch, StreamerEntry::put(key, value), Permission::Put)
            .await
    }

    pub async fn remove_data(&self, key: impl Into<Bytes>) -> Result<Completion> {
        self.inner
            .add_single(&self.batch, StreamerEntry::remove(key), Permission::Remove)
            .await
    }

    /// Flushes the whole streamer. Other producers' micro-batches are routed
    /// too, since the flush waits on every active operation.
    pub async fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.drain_producers().await?;
        self.inner.do_flush().await
    }
}
