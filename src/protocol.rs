//! Streamer wire messages.
//!
//! Entries are marshalled once per batch into an opaque payload so the cost
//! is paid per submission, not per entry. Whole messages round-trip through
//! bincode as well, which is what `SimulatedCluster` puts on its wire.

use crate::cluster::TopologyVersion;
use crate::error::{Result, StreamerError};
use crate::streamer::StreamerEntry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Well-known topic server nodes listen on for streamer batches.
pub const STREAMER_TOPIC: &str = "grid.datastreamer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerRequest {
    pub request_id: u64,
    /// Private topic the response must be sent to.
    pub response_topic: String,
    pub cache_name: String,
    pub receiver_id: String,
    /// Bincode-encoded `Vec<StreamerEntry>`.
    pub entries: Bytes,
    pub skip_store: bool,
    pub keep_binary: bool,
    pub topology_version: TopologyVersion,
    /// Stripe the batch came from, so the destination can keep stripes apart.
    pub stripe: Option<u32>,
}

impl StreamerRequest {
    pub fn decode_entries(&self) -> Result<Vec<StreamerEntry>> {
        Ok(bincode::deserialize(&self.entries)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub fn encode_entries(entries: &[StreamerEntry]) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(entries)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The destination's topology disagrees with the batch.
    Topology,
    Application,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerResponse {
    pub request_id: u64,
    pub error: Option<RemoteFailure>,
}

impl StreamerResponse {
    pub fn ok(request_id: u64) -> Self {
        StreamerResponse {
            request_id,
            error: None,
        }
    }

    pub fn failed(request_id: u64, err: &StreamerError) -> Self {
        let kind = if err.is_topology_mismatch() {
            FailureKind::Topology
        } else {
            FailureKind::Application
        };
        StreamerResponse {
            request_id,
            error: Some(RemoteFailure {
                kind,
                message: err.to_string(),
            }),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
