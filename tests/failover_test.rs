//! Remapping, node loss, cancellation and disconnect handling.

use bytes::Bytes;
use grid_streamer::cluster::NodeId;
use grid_streamer::simulation::SimulatedCluster;
use grid_streamer::{Streamer, StreamerConfig, StreamerError};
use std::time::Duration;

fn single_entry_batches() -> StreamerConfig {
    StreamerConfig {
        per_node_buffer_size: 1,
        per_batch_buffer_size: 1,
        ..StreamerConfig::test()
    }
}

#[tokio::test]
async fn test_batch_to_dead_primary_is_remapped() {
    let cluster = SimulatedCluster::builder().servers(2).backups(0).build();
    let streamer = Streamer::new(single_entry_batches(), cluster.client_context()).unwrap();

    let primary = cluster.primary_for(b"survivor").unwrap();
    cluster.hold_responses(primary, true);

    let completion = streamer.add_data("survivor", "v").await.unwrap();
    streamer.try_flush().await;
    assert!(!completion.is_done());

    cluster.kill_node(primary);
    streamer.flush().await.unwrap();

    assert!(matches!(completion.result(), Some(Ok(()))));
    let new_primary = cluster.primary_for(b"survivor").unwrap();
    assert_ne!(new_primary, primary);
    assert_eq!(cluster.get(b"survivor"), Some(Bytes::from("v")));
    assert!(streamer.stats().remaps >= 1);

    streamer.close(false).await.unwrap();
    assert!(streamer.future().wait().await.is_ok());
}

#[tokio::test]
async fn test_remap_budget_exhausted() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let streamer = Streamer::new(
        StreamerConfig {
            max_remap_count: 3,
            ..single_entry_batches()
        },
        cluster.client_context(),
    )
    .unwrap();
    cluster.fail_sends(NodeId(1), true);

    let completion = streamer.add_data("k", "v").await.unwrap();
    let outcome = completion
        .wait_for(Duration::from_secs(5))
        .await
        .expect("completion resolves");

    match outcome {
        Err(StreamerError::TooManyRemaps { remaps, cause }) => {
            assert_eq!(remaps, 3);
            assert!(matches!(*cause, StreamerError::Transport { .. }));
        }
        other => panic!("expected remap exhaustion, got {:?}", other),
    }
    // First attempt plus three remaps
    assert_eq!(cluster.send_attempts(NodeId(1)), 4);
    assert_eq!(streamer.stats().remaps, 3);

    // The failure cancels the streamer for further ingest
    match streamer.add_data("later", "v").await {
        Err(StreamerError::Closed { cause: Some(cause) }) => {
            assert!(matches!(*cause, StreamerError::TooManyRemaps { .. }));
        }
        other => panic!("expected closed streamer, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reassignment_mid_stream() {
    let cluster = SimulatedCluster::builder()
        .servers(3)
        .backups(1)
        .seed(7)
        .build();
    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();

    for i in 0..200 {
        streamer
            .add_data(format!("key_{}", i), format!("value_{}", i))
            .await
            .unwrap();
        if i == 100 {
            cluster.reassign();
        }
    }
    streamer.flush().await.unwrap();

    for i in 0..200 {
        assert_eq!(
            cluster.get(format!("key_{}", i).as_bytes()),
            Some(Bytes::from(format!("value_{}", i))),
            "key_{} missing at primary",
            i
        );
    }
    streamer.close(false).await.unwrap();
    assert!(streamer.future().wait().await.is_ok());
}

#[tokio::test]
async fn test_cancel_fails_outstanding_work() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();
    cluster.hold_responses(NodeId(1), true);

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(streamer.add_data(format!("k{}", i), "v").await.unwrap());
    }
    streamer.try_flush().await;

    streamer.close(true).await.unwrap();

    for handle in &handles {
        assert!(matches!(
            handle.result(),
            Some(Err(StreamerError::Cancelled { .. }))
        ));
    }
    assert!(matches!(
        streamer.future().result(),
        Some(Err(StreamerError::Cancelled { .. }))
    ));
    assert!(matches!(
        streamer.add_data("late", "v").await,
        Err(StreamerError::Closed { .. })
    ));
}

#[tokio::test]
async fn test_client_disconnect() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let streamer = Streamer::new(StreamerConfig::test(), cluster.client_context()).unwrap();
    cluster.hold_responses(NodeId(1), true);

    let pending = streamer.add_data("k", "v").await.unwrap();
    streamer.try_flush().await;

    streamer.on_client_disconnected().await;

    assert!(matches!(
        pending.result(),
        Some(Err(StreamerError::ClientDisconnected))
    ));
    assert!(matches!(
        streamer.future().result(),
        Some(Err(StreamerError::ClientDisconnected))
    ));
    assert!(matches!(
        streamer.add_data("k2", "v").await,
        Err(StreamerError::ClientDisconnected)
    ));
    assert!(matches!(
        streamer.flush().await,
        Err(StreamerError::ClientDisconnected)
    ));
    // Disconnects do not count as failed operations
    assert_eq!(streamer.stats().failed_operations, 0);
}

#[tokio::test]
async fn test_graceful_close_reports_failures() {
    let cluster = SimulatedCluster::builder().servers(1).build();
    let streamer = Streamer::new(
        StreamerConfig {
            max_remap_count: 0,
            ..single_entry_batches()
        },
        cluster.client_context(),
    )
    .unwrap();
    cluster.fail_sends(NodeId(1), true);

    let failed = streamer.add_data("k", "v").await.unwrap();
    assert!(failed.wait().await.is_err());

    streamer.close(false).await.unwrap();
    assert!(matches!(
        streamer.future().wait().await,
        Err(StreamerError::OperationsFailed { count: 1 })
    ));
}
