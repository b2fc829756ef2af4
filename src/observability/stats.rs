use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Streamer counters, updated on the data path with relaxed atomics.
#[derive(Debug, Default)]
pub struct StreamerStats {
    pub(crate) entries_submitted: AtomicU64,
    pub(crate) local_batches: AtomicU64,
    pub(crate) remote_batches: AtomicU64,
    pub(crate) responses: AtomicU64,
    pub(crate) remaps: AtomicU64,
    pub(crate) topology_renewals: AtomicU64,
    pub(crate) failed_operations: AtomicU64,
}

impl StreamerStats {
    pub(crate) fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_operations: usize) -> StatsSnapshot {
        StatsSnapshot {
            entries_submitted: self.entries_submitted.load(Ordering::Relaxed),
            local_batches: self.local_batches.load(Ordering::Relaxed),
            remote_batches: self.remote_batches.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            remaps: self.remaps.load(Ordering::Relaxed),
            topology_renewals: self.topology_renewals.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            active_operations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Entries handed to a node (local or remote), counting retries
    pub entries_submitted: u64,
    pub local_batches: u64,
    pub remote_batches: u64,
    /// Responses received for remote batches
    pub responses: u64,
    pub remaps: u64,
    /// Stripes renewed because assignments changed under them
    pub topology_renewals: u64,
    pub failed_operations: u64,
    pub active_operations: usize,
}

impl StatsSnapshot {
    pub fn batches_submitted(&self) -> u64 {
        self.local_batches + self.remote_batches
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries in {} batches ({} local, {} remote), {} responses, {} remaps, {} renewals, {} failed, {} active",
            self.entries_submitted,
            self.batches_submitted(),
            self.local_batches,
            self.remote_batches,
            self.responses,
            self.remaps,
            self.topology_renewals,
            self.failed_operations,
            self.active_operations
        )
    }
}
