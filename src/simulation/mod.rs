//! In-memory cluster for tests, the simulation binary and the DST harness.

mod cluster;
mod dst;
mod rng;
mod store;

pub use cluster::{SimulatedCluster, SimulatedClusterBuilder, CLIENT_NODE};
pub use dst::{
    run_dst_batch, summarize_batch, StreamerDstConfig, StreamerDstHarness, StreamerDstResult,
    StreamerOperation,
};
pub use rng::DeterministicRng;
pub use store::MemoryStore;
