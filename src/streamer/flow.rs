//! Backpressure gates.
//!
//! `ParallelGate` bounds in-flight fresh batches per node. `RemapGate` counts
//! retries in progress; fresh data waits for it to drain so failed data is
//! resent before new data is accepted.

use crate::error::{Result, StreamerError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

pub(crate) struct ParallelGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ParallelGate {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ParallelGate {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// The permit must live until the batch's completion resolves.
    pub(crate) async fn acquire(&self, timeout: Option<Duration>) -> Result<OwnedSemaphorePermit> {
        let acquire = self.permits.clone().acquire_owned();
        let permit = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| StreamerError::Timeout("when starts parallel operation"))?,
            None => acquire.await,
        };
        // Closed only if the semaphore were closed, which it never is
        permit.map_err(|_| StreamerError::cancelled())
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Count of retries in flight.
pub(crate) struct RemapGate {
    outstanding: Arc<watch::Sender<usize>>,
    /// Retries ever started; lets a flush notice one that came and went.
    started: AtomicU64,
}

/// Held by one retry; releases its slot on drop.
pub(crate) struct RemapPermit {
    outstanding: Arc<watch::Sender<usize>>,
}

impl Drop for RemapPermit {
    fn drop(&mut self) {
        self.outstanding.send_modify(|n| *n -= 1);
    }
}

impl RemapGate {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0usize);
        RemapGate {
            outstanding: Arc::new(tx),
            started: AtomicU64::new(0),
        }
    }

    pub(crate) fn begin_retry(&self) -> RemapPermit {
        self.started.fetch_add(1, Ordering::AcqRel);
        self.outstanding.send_modify(|n| *n += 1);
        RemapPermit {
            outstanding: self.outstanding.clone(),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    pub(crate) fn started(&self) -> u64 {
        self.started.load(Ordering::Acquire)
    }

    /// Waits until no retry is in flight.
    pub(crate) async fn wait_idle(&self, timeout: Option<Duration>) -> Result<()> {
        let mut rx = self.outstanding.subscribe();
        let idle = async move {
            // The sender lives as long as the gate, so this cannot fail
            let _ = rx.wait_for(|n| *n == 0).await;
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, idle).await.map_err(|_| {
                StreamerError::Timeout("while was waiting for failed data resending finished")
            }),
            None => {
                idle.await;
                Ok(())
            }
        }
    }
}
