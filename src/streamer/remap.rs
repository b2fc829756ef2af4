//! Remap coordinator.
//!
//! A failed node batch either terminates its load or becomes a [`RemapTask`]
//! that re-enters routing. Tasks are consumed by one worker task per
//! streamer, so retries never run concurrently with each other. Each task
//! holds a remap-gate permit until it is resubmitted, which keeps fresh data
//! waiting while retries are outstanding.

use super::completion::Completion;
use super::entry::PendingKeys;
use super::flow::RemapPermit;
use super::{StreamerEntry, StreamerInner};
use crate::error::StreamerError;
use crate::observability::StreamerStats;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Everything needed to resubmit one node's share of a load.
pub(crate) struct LoadAttempt {
    pub(crate) entries: Vec<StreamerEntry>,
    pub(crate) result: Completion,
    pub(crate) pending: Option<Arc<PendingKeys>>,
    pub(crate) remaps: u32,
}

impl LoadAttempt {
    /// A node acknowledged `entries`.
    pub(crate) fn acknowledged(&self) {
        match &self.pending {
            Some(pending) => {
                if pending.acknowledge(&self.entries) {
                    self.result.succeed(());
                }
            }
            None => {
                self.result.succeed(());
            }
        }
    }
}

pub(crate) struct RemapTask {
    attempt: LoadAttempt,
    _permit: RemapPermit,
}

#[derive(Clone)]
pub(crate) struct RemapHandle {
    tx: mpsc::UnboundedSender<RemapTask>,
}

impl RemapHandle {
    fn submit(&self, task: RemapTask) {
        if let Err(mpsc::error::SendError(task)) = self.tx.send(task) {
            task.attempt
                .result
                .fail(StreamerError::Closed { cause: None });
        }
    }
}

pub(crate) fn remap_channel() -> (RemapHandle, mpsc::UnboundedReceiver<RemapTask>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RemapHandle { tx }, rx)
}

pub(crate) fn spawn_remap_worker(
    inner: Weak<StreamerInner>,
    mut rx: mpsc::UnboundedReceiver<RemapTask>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            let Some(streamer) = inner.upgrade() else {
                task.attempt
                    .result
                    .fail(StreamerError::Closed { cause: None });
                continue;
            };
            streamer.run_remap(task).await;
        }
        debug!("Streamer remap worker stopped");
    })
}

impl StreamerInner {
    /// Outcome of one node's share of a load.
    pub(crate) fn on_node_batch_done(
        &self,
        attempt: LoadAttempt,
        outcome: &Result<(), StreamerError>,
    ) {
        let err = match outcome {
            Ok(()) => {
                attempt.acknowledged();
                return;
            }
            Err(e) => e,
        };

        debug!("Node batch finished with error: {}", err);

        if matches!(err, StreamerError::ClientDisconnected) || !err.is_recoverable() {
            attempt.result.fail(err.clone());
            return;
        }

        if self.ctx.is_cancelled() {
            attempt
                .result
                .fail(StreamerError::cancelled_by(err.clone()));
            return;
        }

        let remaps = if err.is_topology_race() {
            attempt.remaps
        } else {
            attempt.remaps + 1
        };
        if remaps > self.ctx.config.max_remap_count {
            attempt.result.fail(StreamerError::TooManyRemaps {
                remaps: attempt.remaps,
                cause: Arc::new(err.clone()),
            });
            return;
        }

        StreamerStats::incr(&self.ctx.stats.remaps, 1);
        let permit = self.remap_gate.begin_retry();
        self.remapper.submit(RemapTask {
            attempt: LoadAttempt { remaps, ..attempt },
            _permit: permit,
        });
    }

    async fn run_remap(self: &Arc<Self>, task: RemapTask) {
        let RemapTask { attempt, _permit } = task;

        if self.ctx.is_cancelled() {
            attempt
                .result
                .fail(StreamerError::cancelled_by(self.cancellation_cause()));
            return;
        }

        let result = attempt.result.clone();
        if let Err(e) = self
            .load(attempt.entries, attempt.result, attempt.pending, attempt.remaps, true)
            .await
        {
            result.fail(e);
        }
        // _permit released here
    }
}
