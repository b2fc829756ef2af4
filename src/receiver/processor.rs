use super::{ApplyFlags, ReceiverRegistry};
use crate::cluster::{CacheStore, NodeId, TopologyVersion};
use crate::error::{Result, StreamerError};
use crate::protocol::{StreamerRequest, StreamerResponse};
use std::sync::Arc;
use tracing::debug;

/// Applies inbound streamer requests on a server node.
pub struct RequestProcessor {
    node: NodeId,
    store: Arc<dyn CacheStore>,
    receivers: ReceiverRegistry,
}

impl RequestProcessor {
    pub fn new(node: NodeId, store: Arc<dyn CacheStore>, receivers: ReceiverRegistry) -> Self {
        RequestProcessor {
            node,
            store,
            receivers,
        }
    }

    /// Applies `request` against local storage. `ready_version` is the
    /// node's current ready topology.
    pub fn process(
        &self,
        request: &StreamerRequest,
        ready_version: TopologyVersion,
    ) -> StreamerResponse {
        match self.apply(request, ready_version) {
            Ok(()) => StreamerResponse::ok(request.request_id),
            Err(e) => {
                debug!(
                    "Node {} failed to process streamer request {}: {}",
                    self.node, request.request_id, e
                );
                StreamerResponse::failed(request.request_id, &e)
            }
        }
    }

    fn apply(&self, request: &StreamerRequest, ready_version: TopologyVersion) -> Result<()> {
        let receiver = self.receivers.get(&request.receiver_id).ok_or_else(|| {
            StreamerError::InvalidArgument(format!(
                "unknown stream receiver '{}'",
                request.receiver_id
            ))
        })?;

        if receiver.is_isolated() && ready_version != request.topology_version {
            return Err(StreamerError::StaleTopology {
                requested: request.topology_version,
                local: ready_version,
            });
        }

        let entries = request.decode_entries()?;
        receiver.receive(
            self.store.as_ref(),
            &entries,
            ApplyFlags {
                skip_store: request.skip_store,
                keep_binary: request.keep_binary,
                topology_version: request.topology_version,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_entries, FailureKind};
    use crate::receiver::{IndividualReceiver, IsolatedReceiver};
    use crate::simulation::MemoryStore;
    use crate::streamer::StreamerEntry;
    use bytes::Bytes;

    fn processor() -> (RequestProcessor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.set_owned(0..4);
        let processor = RequestProcessor::new(NodeId(1), store.clone(), ReceiverRegistry::new());
        (processor, store)
    }

    fn request(receiver: &str, version: u64) -> StreamerRequest {
        StreamerRequest {
            request_id: 9,
            response_topic: "t".into(),
            cache_name: "c".into(),
            receiver_id: receiver.into(),
            entries: encode_entries(&[StreamerEntry::put("k", "v").with_partition(1)]).unwrap(),
            skip_store: false,
            keep_binary: false,
            topology_version: TopologyVersion(version),
            stripe: None,
        }
    }

    #[test]
    fn test_applies_request() {
        let (processor, store) = processor();
        let res = processor.process(&request(IsolatedReceiver::ID, 3), TopologyVersion(3));
        assert_eq!(res, StreamerResponse::ok(9));
        assert_eq!(store.get(b"k"), Some(Bytes::from("v")));
    }

    #[test]
    fn test_isolated_rejects_other_topology() {
        let (processor, store) = processor();
        let res = processor.process(&request(IsolatedReceiver::ID, 2), TopologyVersion(3));
        assert_eq!(res.error.unwrap().kind, FailureKind::Topology);
        assert_eq!(store.get(b"k"), None);

        // Overwriting receivers do not care about topology
        let res = processor.process(&request(IndividualReceiver::ID, 2), TopologyVersion(3));
        assert!(res.error.is_none());
    }

    #[test]
    fn test_unknown_receiver_is_application_error() {
        let (processor, _) = processor();
        let res = processor.process(&request("nope", 1), TopologyVersion(1));
        let failure = res.error.unwrap();
        assert_eq!(failure.kind, FailureKind::Application);
        assert!(failure.message.contains("nope"));
    }
}
