use super::StreamerEntry;
use crate::cluster::{AffinityResolver, Assignments, ClusterNode, NodeId, TopologyVersion};
use crate::error::{Result, StreamerError};
use std::collections::HashMap;
use std::sync::Arc;

/// Entries of one load grouped by destination.
#[derive(Debug)]
pub(crate) struct RoutedLoad {
    pub(crate) topology: TopologyVersion,
    pub(crate) assignments: Assignments,
    pub(crate) per_node: Vec<(ClusterNode, Vec<StreamerEntry>)>,
}

pub(crate) struct Router {
    cache_name: String,
    affinity: Arc<dyn AffinityResolver>,
}

impl Router {
    pub(crate) fn new(cache_name: String, affinity: Arc<dyn AffinityResolver>) -> Self {
        Router {
            cache_name,
            affinity,
        }
    }

    /// Without overwrite every owner receives the entry so backups are
    /// loaded through the streamer; with overwrite only the primary does.
    pub(crate) fn route(
        &self,
        entries: Vec<StreamerEntry>,
        topology: TopologyVersion,
        allow_overwrite: bool,
    ) -> Result<RoutedLoad> {
        let mut per_node: HashMap<NodeId, (ClusterNode, Vec<StreamerEntry>)> = HashMap::new();

        for entry in entries {
            let partition = match entry.partition {
                Some(p) => p,
                None => self.affinity.partition_of(&self.cache_name, &entry.key),
            };
            let entry = entry.with_partition(partition);

            let nodes = if allow_overwrite {
                self.affinity
                    .primary_node_for(&self.cache_name, &entry.key, topology)
                    .into_iter()
                    .collect()
            } else {
                self.affinity.nodes_for(&self.cache_name, partition, topology)
            };

            if nodes.is_empty() {
                return Err(StreamerError::NoRoute {
                    cache: self.cache_name.clone(),
                });
            }

            for node in nodes {
                per_node
                    .entry(node.id)
                    .or_insert_with(|| (node, Vec::new()))
                    .1
                    .push(entry.clone());
            }
        }

        Ok(RoutedLoad {
            topology,
            assignments: self.affinity.assignments(&self.cache_name, topology),
            per_node: per_node.into_values().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedCluster;

    #[test]
    fn test_routes_to_all_owners_without_overwrite() {
        let cluster = SimulatedCluster::builder().servers(3).backups(1).build();
        let router = Router::new("c".into(), cluster.affinity());
        let version = cluster.current_version();

        let entries: Vec<_> = (0..50)
            .map(|i| StreamerEntry::put(format!("key-{i}"), "v"))
            .collect();
        let routed = router.route(entries.clone(), version, false).unwrap();
        let total: usize = routed.per_node.iter().map(|(_, e)| e.len()).sum();
        assert_eq!(total, 100);
        assert!(routed
            .per_node
            .iter()
            .flat_map(|(_, e)| e)
            .all(|e| e.partition.is_some()));

        let routed = router.route(entries, version, true).unwrap();
        let total: usize = routed.per_node.iter().map(|(_, e)| e.len()).sum();
        assert_eq!(total, 50);
        for (node, entries) in &routed.per_node {
            for e in entries {
                assert_eq!(cluster.primary_for(&e.key), Some(node.id));
            }
        }
    }

    #[test]
    fn test_no_servers_is_routing_error() {
        let cluster = SimulatedCluster::builder().servers(1).build();
        cluster.kill_node(cluster.server_ids()[0]);
        let router = Router::new("c".into(), cluster.affinity());
        let err = router
            .route(vec![StreamerEntry::put("k", "v")], cluster.current_version(), false)
            .unwrap_err();
        assert!(matches!(err, StreamerError::NoRoute { .. }));
    }
}
