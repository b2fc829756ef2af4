//! Bulk data streamer for a partitioned in-memory data grid.
//!
//! Producers hand the [`Streamer`] individual entries or collections. Entries
//! are routed to the nodes owning their partitions, buffered per node in
//! partition stripes, and shipped as batches, applied in place when the
//! destination is the local node. Failed batches are re-routed at the
//! current topology up to `max_remap_count` times.
//!
//! The surrounding grid (affinity, membership, messaging, storage) is
//! reached only through the traits in [`cluster`]; [`simulation`] provides
//! an in-memory implementation used by the tests and the `grid-streamer-sim`
//! binary.

pub mod cluster;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod receiver;
pub mod simulation;
pub mod streamer;

pub use cluster::{ClusterContext, NodeId, TopologyVersion};
pub use config::StreamerConfig;
pub use error::{Result, StreamerError};
pub use observability::{init_tracing, LogFormat, StatsSnapshot};
pub use receiver::{IndividualReceiver, IsolatedReceiver, StreamReceiver};
pub use streamer::{Completion, CompoundCompletion, Producer, Streamer, StreamerEntry};
