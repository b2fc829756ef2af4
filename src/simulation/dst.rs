//! Deterministic simulation harness for the streamer.
//!
//! A seeded workload streams unique keys into a [`SimulatedCluster`] while
//! injecting send failures, remote errors, topology changes and node kills.
//! After a final flush and close every entry whose completion succeeded must
//! be readable at its current primary.
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = StreamerDstHarness::new(StreamerDstConfig::chaos(seed))?;
//!     harness.run(500).await;
//!     harness.check_invariants().await;   // violations carry the seed
//! }
//! ```

use super::cluster::SimulatedCluster;
use super::rng::DeterministicRng;
use crate::config::StreamerConfig;
use crate::error::Result;
use crate::streamer::{Completion, Streamer};
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StreamerDstConfig {
    pub seed: u64,
    pub servers: usize,
    pub backups: usize,
    pub partitions: u32,
    /// Probability a send fails before reaching the node
    pub send_failure_rate: f64,
    /// Probability a delivered request is answered with an error
    pub remote_error_rate: f64,
    pub flush_probability: f64,
    /// Version bump that keeps assignments
    pub bump_probability: f64,
    pub reassign_probability: f64,
    pub kill_probability: f64,
    /// Kills never take the cluster below one server
    pub max_kills: usize,
    pub streamer: StreamerConfig,
}

impl Default for StreamerDstConfig {
    fn default() -> Self {
        StreamerDstConfig {
            seed: 0,
            servers: 3,
            backups: 1,
            partitions: 32,
            send_failure_rate: 0.0,
            remote_error_rate: 0.0,
            flush_probability: 0.02,
            bump_probability: 0.0,
            reassign_probability: 0.0,
            kill_probability: 0.0,
            max_kills: 0,
            streamer: StreamerConfig {
                max_remap_count: 32,
                ..StreamerConfig::test()
            },
        }
    }
}

impl StreamerDstConfig {
    /// No faults
    pub fn calm(seed: u64) -> Self {
        StreamerDstConfig {
            seed,
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        StreamerDstConfig {
            seed,
            send_failure_rate: 0.02,
            remote_error_rate: 0.02,
            bump_probability: 0.01,
            reassign_probability: 0.005,
            ..Default::default()
        }
    }

    pub fn chaos(seed: u64) -> Self {
        StreamerDstConfig {
            seed,
            send_failure_rate: 0.05,
            remote_error_rate: 0.05,
            flush_probability: 0.05,
            bump_probability: 0.02,
            reassign_probability: 0.01,
            kill_probability: 0.005,
            max_kills: 1,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamerOperation {
    Add { key: String, value: String },
    Flush,
    BumpVersion,
    Reassign,
    KillNode,
}

#[derive(Debug, Clone)]
pub struct StreamerDstResult {
    pub seed: u64,
    pub total_operations: u64,
    pub entries_added: u64,
    /// Entries whose completion resolved with an error
    pub entries_failed: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub topology_changes: u64,
    pub kills: u64,
    pub remaps: u64,
    pub invariant_violations: Vec<String>,
}

impl StreamerDstResult {
    pub fn new(seed: u64) -> Self {
        StreamerDstResult {
            seed,
            total_operations: 0,
            entries_added: 0,
            entries_failed: 0,
            flushes: 0,
            failed_flushes: 0,
            topology_changes: 0,
            kills: 0,
            remaps: 0,
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops, {} entries ({} failed), {} flushes ({} failed), {} topology changes, {} kills, {} remaps, {} violations",
            self.seed,
            self.total_operations,
            self.entries_added,
            self.entries_failed,
            self.flushes,
            self.failed_flushes,
            self.topology_changes,
            self.kills,
            self.remaps,
            self.invariant_violations.len()
        )
    }
}

struct Submitted {
    key: String,
    value: String,
    completion: Completion,
}

pub struct StreamerDstHarness {
    config: StreamerDstConfig,
    cluster: SimulatedCluster,
    streamer: Streamer,
    rng: DeterministicRng,
    submitted: Vec<Submitted>,
    next_key: u64,
    result: StreamerDstResult,
}

impl StreamerDstHarness {
    /// Must be called from within a tokio runtime.
    pub fn new(config: StreamerDstConfig) -> Result<Self> {
        let cluster = SimulatedCluster::builder()
            .servers(config.servers)
            .backups(config.backups)
            .partitions(config.partitions)
            .seed(config.seed.wrapping_add(1))
            .build();
        cluster.set_send_failure_rate(config.send_failure_rate);
        cluster.set_remote_error_rate(config.remote_error_rate);

        let streamer = Streamer::new(config.streamer.clone(), cluster.client_context())?;

        Ok(StreamerDstHarness {
            rng: DeterministicRng::new(config.seed),
            result: StreamerDstResult::new(config.seed),
            config,
            cluster,
            streamer,
            submitted: Vec::new(),
            next_key: 0,
        })
    }

    pub fn cluster(&self) -> &SimulatedCluster {
        &self.cluster
    }

    pub fn next_operation(&mut self) -> StreamerOperation {
        let c = &self.config;
        let roll = self.rng.next_u64() as f64 / u64::MAX as f64;

        let mut edge = c.kill_probability;
        if roll < edge && self.result.kills < c.max_kills as u64 {
            return StreamerOperation::KillNode;
        }
        edge += c.reassign_probability;
        if roll < edge {
            return StreamerOperation::Reassign;
        }
        edge += c.bump_probability;
        if roll < edge {
            return StreamerOperation::BumpVersion;
        }
        edge += c.flush_probability;
        if roll < edge {
            return StreamerOperation::Flush;
        }

        self.next_key += 1;
        StreamerOperation::Add {
            key: format!("key_{:06}", self.next_key),
            value: format!("value_{}_{}", self.config.seed, self.next_key),
        }
    }

    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.next_operation();
            self.execute(op).await;
        }
    }

    async fn execute(&mut self, op: StreamerOperation) {
        self.result.total_operations += 1;
        match op {
            StreamerOperation::Add { key, value } => {
                self.result.entries_added += 1;
                match self.streamer.add_data(key.clone(), value.clone()).await {
                    Ok(completion) => self.submitted.push(Submitted {
                        key,
                        value,
                        completion,
                    }),
                    Err(_) => self.result.entries_failed += 1,
                }
            }
            StreamerOperation::Flush => {
                self.result.flushes += 1;
                if self.streamer.flush().await.is_err() {
                    self.result.failed_flushes += 1;
                }
            }
            StreamerOperation::BumpVersion => {
                self.cluster.bump_version();
                self.result.topology_changes += 1;
            }
            StreamerOperation::Reassign => {
                self.cluster.reassign();
                self.result.topology_changes += 1;
            }
            StreamerOperation::KillNode => {
                let servers = self.cluster.server_ids();
                if servers.len() <= 1 || self.config.backups == 0 {
                    return;
                }
                if let Some(victim) = self.rng.choose(&servers).copied() {
                    self.cluster.kill_node(victim);
                    self.result.kills += 1;
                    self.result.topology_changes += 1;
                }
            }
        }
    }

    /// Flushes, closes and checks every acknowledged entry landed.
    pub async fn check_invariants(&mut self) {
        let flushed = self.streamer.flush().await;
        let closed = self.streamer.close(false).await;
        self.result.remaps = self.streamer.stats().remaps;

        // Invariant 1: close resolves the session
        let session = self.streamer.future();
        let session = match session.wait_for(Duration::from_secs(5)).await {
            Some(outcome) => outcome,
            None => {
                self.violation("session did not resolve after close".to_string());
                return;
            }
        };

        // Invariant 2: after close nothing is left unresolved, and every
        // acknowledged entry is stored by a current owner. Once the streamer
        // has failed, retries to the remaining owners stop, so the primary
        // is only required on clean runs.
        let mut failed = 0u64;
        let mut unresolved = Vec::new();
        let mut acknowledged = Vec::new();
        for s in &self.submitted {
            match s.completion.result() {
                None => unresolved.push(s.key.clone()),
                Some(Err(_)) => failed += 1,
                Some(Ok(())) => acknowledged.push((s.key.clone(), Bytes::from(s.value.clone()))),
            }
        }
        self.result.entries_failed += failed;
        let clean = self.result.entries_failed == 0 && self.result.failed_flushes == 0;

        for key in unresolved {
            self.violation(format!("{} unresolved after close", key));
        }
        for (key, value) in acknowledged {
            let at_primary = self.cluster.get(key.as_bytes()) == Some(value.clone());
            let at_owner = at_primary
                || self.cluster.owners_of(key.as_bytes()).iter().any(|owner| {
                    self.cluster
                        .node_store(*owner)
                        .and_then(|store| store.get(key.as_bytes()))
                        == Some(value.clone())
                });
            if (clean && !at_primary) || !at_owner {
                self.violation(format!("{} acknowledged but not stored at its primary", key));
            }
        }

        // Invariant 3: a clean run closes cleanly, a failed one never does
        if clean {
            if let Err(e) = &flushed {
                self.violation(format!("final flush failed on a clean run: {}", e));
            }
            if let Err(e) = &closed {
                self.violation(format!("close failed on a clean run: {}", e));
            }
            if let Err(e) = &session {
                self.violation(format!("session failed on a clean run: {}", e));
            }
        } else if self.result.entries_failed > 0 && session.is_ok() {
            self.violation("session succeeded despite failed entries".to_string());
        }
    }

    fn violation(&mut self, message: String) {
        self.result
            .invariant_violations
            .push(format!("seed {}: {}", self.config.seed, message));
    }

    pub fn result(&self) -> &StreamerDstResult {
        &self.result
    }

    pub fn into_result(self) -> StreamerDstResult {
        self.result
    }
}

/// Runs `count` seeds starting at `base_seed`.
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> StreamerDstConfig,
) -> Result<Vec<StreamerDstResult>> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let mut harness = StreamerDstHarness::new(config_fn(base_seed + i as u64))?;
        harness.run(ops_per_run).await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }
    Ok(results)
}

pub fn summarize_batch(results: &[StreamerDstResult]) -> String {
    let passed = results.iter().filter(|r| r.is_success()).count();
    let entries: u64 = results.iter().map(|r| r.entries_added).sum();
    let failed: u64 = results.iter().map(|r| r.entries_failed).sum();
    let remaps: u64 = results.iter().map(|r| r.remaps).sum();
    let kills: u64 = results.iter().map(|r| r.kills).sum();

    let mut summary = format!(
        "DST batch: {}/{} passed, {} entries ({} failed), {} remaps, {} kills",
        passed,
        results.len(),
        entries,
        failed,
        remaps,
        kills
    );
    for r in results.iter().filter(|r| !r.is_success()).take(5) {
        summary.push_str(&format!("\n  {}", r.summary()));
        for v in r.invariant_violations.iter().take(3) {
            summary.push_str(&format!("\n    {}", v));
        }
    }
    summary
}
