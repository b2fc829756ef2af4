//! Streams a synthetic load into a simulated cluster and prints the counters.
//!
//! ```text
//! STREAMER_ENTRIES=100000 STREAMER_KILL_NODE=1 grid-streamer-sim
//! STREAMER_CONFIG=streamer.toml STREAMER_LOG_FORMAT=json grid-streamer-sim
//! ```

use grid_streamer::simulation::SimulatedCluster;
use grid_streamer::{init_tracing, LogFormat, Streamer, StreamerConfig};
use std::time::Instant;
use tracing::{info, warn};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogFormat::from_env());

    let config = match std::env::var("STREAMER_CONFIG") {
        Ok(path) => StreamerConfig::from_toml_file(&path)?,
        Err(_) => StreamerConfig::from_env(),
    };
    let servers: usize = env_or("STREAMER_SERVERS", 3);
    let backups: usize = env_or("STREAMER_BACKUPS", 1);
    let entries: u64 = env_or("STREAMER_ENTRIES", 10_000);
    let kill_node: bool = env_or("STREAMER_KILL_NODE", false);

    let cluster = SimulatedCluster::builder()
        .servers(servers)
        .backups(backups)
        .seed(env_or("STREAMER_SEED", 42))
        .build();
    let streamer = Streamer::new(config, cluster.client_context())?;

    info!(
        "Streaming {} entries into {} servers (backups={})",
        entries, servers, backups
    );
    let started = Instant::now();
    for i in 0..entries {
        streamer
            .add_data(format!("key-{i}"), format!("value-{i}"))
            .await?;
        if kill_node && i == entries / 2 {
            if let Some(victim) = cluster.server_ids().last().copied() {
                warn!("Killing node {} mid-stream", victim);
                cluster.kill_node(victim);
            }
        }
    }
    streamer.close(false).await?;
    let session = streamer.future().wait().await;

    let elapsed = started.elapsed();
    let stats = streamer.stats();
    info!("Done in {:?}: {}", elapsed, stats);
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let missing = (0..entries)
        .filter(|i| cluster.get(format!("key-{i}").as_bytes()).is_none())
        .count();
    if missing > 0 {
        warn!("{} entries missing at their primary", missing);
    }
    session?;
    Ok(())
}
