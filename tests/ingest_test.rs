//! Ingest paths against a simulated grid: micro-batching, routing to every
//! owner, receivers, producers and the closed-streamer contract.

use bytes::Bytes;
use grid_streamer::cluster::{CacheStore, IoPolicy, NodeId, Permission, SecurityCheck};
use grid_streamer::receiver::ApplyFlags;
use grid_streamer::simulation::SimulatedCluster;
use grid_streamer::{Streamer, StreamerConfig, StreamerEntry, StreamerError, StreamReceiver};
use std::sync::Arc;
use std::time::Duration;

fn key(i: usize) -> String {
    format!("key_{:04}", i)
}

#[tokio::test]
async fn test_micro_batch_shares_completion() {
    let cluster = SimulatedCluster::builder().servers(2).build();
    let streamer = Streamer::new(
        StreamerConfig {
            per_batch_buffer_size: 4,
            ..StreamerConfig::test()
        },
        cluster.client_context(),
    )
    .unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(streamer.add_data(key(i), "v").await.unwrap());
    }

    assert_eq!(handles[0], handles[1]);
    assert_eq!(handles[0], handles[3]);
    assert_ne!(handles[3], handles[4]);

    streamer.flush().await.unwrap();
    for handle in &handles {
        assert!(matches!(handle.result(), Some(Ok(()))));
    }
    streamer.close(false).await.unwrap();
}

#[tokio::test]
async fn test_entries_reach_every_owner() {
    let cluster = SimulatedCluster::builder().servers(3).backups(1).build();
    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();

    for i in 0..100 {
        streamer
            .add_data(key(i), format!("value_{}", i))
            .await
            .unwrap();
    }
    streamer.flush().await.unwrap();

    for i in 0..100 {
        let k = key(i);
        let owners = cluster.owners_of(k.as_bytes());
        assert_eq!(owners.len(), 2);
        for owner in owners {
            let stored = cluster.node_store(owner).unwrap().get(k.as_bytes());
            assert_eq!(stored, Some(Bytes::from(format!("value_{}", i))), "{} at {}", k, owner);
        }
    }

    let stats = streamer.stats();
    assert_eq!(stats.entries_submitted, 200);
    assert_eq!(stats.active_operations, 0);
    assert_eq!(stats.failed_operations, 0);
    assert_eq!(stats.local_batches, 0);

    streamer.close(false).await.unwrap();
    assert!(streamer.future().wait().await.is_ok());
}

#[tokio::test]
async fn test_full_stripes_are_sent_before_flush() {
    let cluster = SimulatedCluster::builder().servers(1).pool_size(1).build();
    let streamer = Streamer::new(
        StreamerConfig {
            per_node_buffer_size: 10,
            per_batch_buffer_size: 1,
            ..StreamerConfig::test()
        },
        cluster.client_context(),
    )
    .unwrap();

    for i in 0..35 {
        streamer.add_data(key(i), "v").await.unwrap();
    }
    // Three full stripes so far, the last five entries wait for flush
    assert_eq!(streamer.stats().remote_batches, 3);

    streamer.flush().await.unwrap();
    assert_eq!(cluster.requests_to(NodeId(1)), 4);
    assert_eq!(streamer.stats().remote_batches, 4);
    assert_eq!(cluster.node_store(NodeId(1)).unwrap().len(), 35);
}

#[tokio::test]
async fn test_stripe_cuts_do_not_depend_on_add_path() {
    fn ten_entry_stripes(cluster: &SimulatedCluster) -> Streamer {
        Streamer::new(
            StreamerConfig {
                per_node_buffer_size: 10,
                per_batch_buffer_size: 1,
                ..StreamerConfig::test()
            },
            cluster.client_context(),
        )
        .unwrap()
    }

    let bulk = SimulatedCluster::builder().servers(1).pool_size(1).build();
    let streamer = ten_entry_stripes(&bulk);
    streamer
        .add_all((0..35).map(|i| (key(i), "v")))
        .await
        .unwrap();
    streamer.flush().await.unwrap();
    assert_eq!(bulk.requests_to(NodeId(1)), 4);
    assert_eq!(bulk.node_store(NodeId(1)).unwrap().len(), 35);

    let single = SimulatedCluster::builder().servers(1).pool_size(1).build();
    let streamer = ten_entry_stripes(&single);
    for i in 0..35 {
        streamer.add_data(key(i), "v").await.unwrap();
    }
    streamer.flush().await.unwrap();
    assert_eq!(single.requests_to(NodeId(1)), 4);
    assert_eq!(single.node_store(NodeId(1)).unwrap().len(), 35);
}

#[tokio::test]
async fn test_remove_with_overwrite() {
    let cluster = SimulatedCluster::builder().servers(2).build();
    let streamer = Streamer::new(
        StreamerConfig {
            allow_overwrite: true,
            ..StreamerConfig::test()
        },
        cluster.client_context(),
    )
    .unwrap();
    assert!(streamer.allow_overwrite());

    streamer.add_data("doomed", "v").await.unwrap();
    streamer.flush().await.unwrap();
    assert_eq!(cluster.get(b"doomed"), Some(Bytes::from("v")));

    streamer.remove_data("doomed").await.unwrap();
    streamer.flush().await.unwrap();
    assert_eq!(cluster.get(b"doomed"), None);
}

#[tokio::test]
async fn test_isolated_load_ignores_removals() {
    let cluster = SimulatedCluster::builder().servers(2).build();
    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();
    assert!(!streamer.allow_overwrite());

    streamer.add_data("kept", "v").await.unwrap();
    streamer.flush().await.unwrap();
    streamer.remove_data("kept").await.unwrap();
    streamer.flush().await.unwrap();

    assert_eq!(cluster.get(b"kept"), Some(Bytes::from("v")));
}

#[tokio::test]
async fn test_isolated_keeps_existing_value() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let primary = cluster.primary_for(b"k").unwrap();
    let partition = cluster.partition_of(b"k");
    cluster
        .node_store(primary)
        .unwrap()
        .put(partition, &Bytes::from("k"), &Bytes::from("old"), false)
        .unwrap();

    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();
    streamer.add_data("k", "new").await.unwrap();
    streamer.flush().await.unwrap();
    assert_eq!(cluster.get(b"k"), Some(Bytes::from("old")));

    streamer.set_allow_overwrite(true);
    streamer.add_data("k", "newer").await.unwrap();
    streamer.flush().await.unwrap();
    assert_eq!(cluster.get(b"k"), Some(Bytes::from("newer")));
}

#[tokio::test]
async fn test_closed_streamer_rejects_work() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();

    streamer.add_data("a", "1").await.unwrap();
    streamer.close(false).await.unwrap();
    assert!(streamer.is_closed());
    assert_eq!(cluster.get(b"a"), Some(Bytes::from("1")));

    assert!(matches!(
        streamer.add_data("b", "2").await,
        Err(StreamerError::Closed { cause: None })
    ));
    assert!(matches!(
        streamer.flush().await,
        Err(StreamerError::Closed { cause: None })
    ));

    // Later closes are no-ops
    streamer.close(false).await.unwrap();
    streamer.close(true).await.unwrap();
    assert!(matches!(streamer.future().result(), Some(Ok(()))));
}

#[tokio::test]
async fn test_add_all_and_add_entries() {
    let cluster = SimulatedCluster::builder().servers(2).build();
    let streamer = Streamer::new(
        StreamerConfig {
            allow_overwrite: true,
            ..StreamerConfig::test()
        },
        cluster.client_context(),
    )
    .unwrap();

    let empty: Vec<(String, String)> = Vec::new();
    assert!(matches!(
        streamer.add_all(empty).await,
        Err(StreamerError::InvalidArgument(_))
    ));

    let all = streamer
        .add_all((0..10).map(|i| (key(i), format!("v{}", i))))
        .await
        .unwrap();
    streamer.flush().await.unwrap();
    assert!(matches!(all.result(), Some(Ok(()))));
    for i in 0..10 {
        assert_eq!(cluster.get(key(i).as_bytes()), Some(Bytes::from(format!("v{}", i))));
    }

    let mixed = streamer
        .add_entries(vec![
            StreamerEntry::remove(key(0)),
            StreamerEntry::put(key(1), "updated"),
        ])
        .await
        .unwrap();
    streamer.flush().await.unwrap();
    assert!(matches!(mixed.result(), Some(Ok(()))));
    assert_eq!(cluster.get(key(0).as_bytes()), None);
    assert_eq!(cluster.get(key(1).as_bytes()), Some(Bytes::from("updated")));
}

#[tokio::test]
async fn test_empty_key_rejected() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();

    assert!(matches!(
        streamer.add_data("", "v").await,
        Err(StreamerError::InvalidArgument(_))
    ));
    assert!(matches!(
        streamer.add_entries(vec![StreamerEntry::put("", "v")]).await,
        Err(StreamerError::InvalidArgument(_))
    ));
    // A rejected argument does not poison the streamer
    streamer.add_data("fine", "v").await.unwrap();
    streamer.close(false).await.unwrap();
    assert!(streamer.future().wait().await.is_ok());
}

#[tokio::test]
async fn test_local_node_applies_in_place() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let ctx = cluster.server_context(NodeId(1)).unwrap();
    let streamer = Streamer::new(StreamerConfig::test(), ctx).unwrap();

    for i in 0..20 {
        streamer.add_data(key(i), "v").await.unwrap();
    }
    streamer.flush().await.unwrap();

    let stats = streamer.stats();
    assert!(stats.local_batches > 0);
    assert_eq!(stats.remote_batches, 0);
    assert_eq!(cluster.requests_to(NodeId(1)), 0);
    assert_eq!(cluster.node_store(NodeId(1)).unwrap().len(), 20);
}

#[tokio::test]
async fn test_local_isolated_batch_waits_for_ready_topology() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let ctx = cluster.server_context(NodeId(1)).unwrap();
    let streamer = Streamer::new(StreamerConfig::test(), ctx).unwrap();
    assert!(!streamer.allow_overwrite());

    // The topology moves on but affinity for it is not ready yet
    cluster.hold_ready(true);
    cluster.bump_version();

    let completion = streamer.add_data("held", "v").await.unwrap();
    streamer.try_flush().await;
    assert!(completion
        .wait_for(Duration::from_millis(200))
        .await
        .is_none());
    assert_eq!(cluster.node_store(NodeId(1)).unwrap().len(), 0);

    cluster.hold_ready(false);
    assert!(matches!(
        completion.wait_for(Duration::from_secs(5)).await,
        Some(Ok(()))
    ));
    assert_eq!(cluster.get(b"held"), Some(Bytes::from("v")));

    streamer.flush().await.unwrap();
    let stats = streamer.stats();
    assert_eq!(stats.local_batches, 1);
    assert_eq!(stats.remaps, 0);
    assert_eq!(stats.failed_operations, 0);
}

#[tokio::test]
async fn test_producers_and_dropped_producer() {
    let cluster = SimulatedCluster::builder().servers(2).build();
    let streamer = Streamer::new(
        StreamerConfig {
            per_batch_buffer_size: 100,
            ..StreamerConfig::test()
        },
        cluster.client_context(),
    )
    .unwrap();

    let first = streamer.producer();
    let second = streamer.producer();
    let a = first.add_data("from_first", "1").await.unwrap();
    let b = second.add_data("from_second", "2").await.unwrap();
    assert_ne!(a, b);

    // Flushing through one producer routes the other's micro-batch too
    first.flush().await.unwrap();
    assert!(matches!(a.result(), Some(Ok(()))));
    assert!(matches!(b.result(), Some(Ok(()))));
    assert_eq!(cluster.get(b"from_second"), Some(Bytes::from("2")));

    let orphan = streamer.producer();
    let c = orphan.add_data("orphaned", "3").await.unwrap();
    drop(orphan);

    streamer.close(false).await.unwrap();
    assert!(matches!(c.result(), Some(Ok(()))));
    assert_eq!(cluster.get(b"orphaned"), Some(Bytes::from("3")));
}

struct UpperCase;

impl StreamReceiver for UpperCase {
    fn id(&self) -> &str {
        "upper"
    }

    fn receive(
        &self,
        store: &dyn CacheStore,
        entries: &[StreamerEntry],
        flags: ApplyFlags,
    ) -> grid_streamer::Result<()> {
        for entry in entries {
            if let Some(value) = &entry.value {
                let upper = Bytes::from(value.to_ascii_uppercase());
                store.put(
                    entry.partition.unwrap_or_default(),
                    &entry.key,
                    &upper,
                    flags.skip_store,
                )?;
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_custom_receiver() {
    let cluster = SimulatedCluster::builder().servers(2).build();
    cluster.receivers().register(Arc::new(UpperCase));

    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();
    streamer.set_receiver(Arc::new(UpperCase));
    assert!(streamer.allow_overwrite());

    streamer.add_data("shout", "quiet").await.unwrap();
    streamer.flush().await.unwrap();
    assert_eq!(cluster.get(b"shout"), Some(Bytes::from("QUIET")));
}

struct DenyRemove;

impl SecurityCheck for DenyRemove {
    fn authorize(&self, _cache: &str, permission: Permission) -> Result<(), String> {
        match permission {
            Permission::Put => Ok(()),
            Permission::Remove => Err(format!("{} not granted", permission)),
        }
    }
}

#[tokio::test]
async fn test_security_check() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let mut ctx = cluster.client_context();
    ctx.security = Some(Arc::new(DenyRemove));
    let streamer = Streamer::new(StreamerConfig::test(), ctx).unwrap();

    streamer.add_data("a", "1").await.unwrap();
    assert!(matches!(
        streamer.remove_data("a").await,
        Err(StreamerError::PermissionDenied(_))
    ));
    assert!(matches!(
        streamer
            .add_entries(vec![StreamerEntry::put("b", "2"), StreamerEntry::remove("a")])
            .await,
        Err(StreamerError::PermissionDenied(_))
    ));

    streamer.flush().await.unwrap();
    assert_eq!(cluster.get(b"a"), Some(Bytes::from("1")));
}

#[tokio::test]
async fn test_io_policy_resolver() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();
    streamer.set_io_policy_resolver(Arc::new(|_node| IoPolicy::System));

    for i in 0..8 {
        streamer.add_data(key(i), "v").await.unwrap();
    }
    streamer.flush().await.unwrap();

    let policies = cluster.io_policies(NodeId(1));
    assert!(!policies.is_empty());
    assert!(policies.iter().all(|p| *p == IoPolicy::System));
}
