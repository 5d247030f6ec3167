//! Runtime configuration for the analysis daemon.
//!
//! Every knob has a built-in default and can be overridden through
//! `CODEGRAPHD_*` environment variables. Invalid values are logged and
//! ignored rather than failing startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Process-wide analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Maximum concurrently running jobs in this process.
    pub max_active_jobs: usize,

    /// Worker parallelism within a single job.
    pub workers: usize,

    /// Close the current batch once it holds this many nodes.
    pub batch_nodes: usize,

    /// Close the current batch once it holds this many edges.
    pub batch_edges: usize,

    /// Close the current batch after this much wall time.
    pub batch_interval: Duration,

    /// Per-file retry ceiling before the file is hard-failed.
    pub max_retries: u32,

    /// Deadline for a single LSP request.
    pub lsp_request_timeout: Duration,

    /// Files larger than this are excluded from analysis.
    pub max_file_bytes: u64,

    /// Discovery refuses to enqueue beyond this many files.
    pub max_queue_files: usize,

    /// Batches retained per job for subscriber replay.
    pub broker_ring: usize,

    /// Outbound buffer per subscriber before it is dropped as slow.
    pub subscriber_buffer: usize,

    /// Respawn attempts allowed per language within `respawn_window`.
    pub max_respawn: u32,

    /// Sliding window for the respawn budget.
    pub respawn_window: Duration,

    /// Hot servers kept per language.
    pub max_servers_per_lang: usize,

    /// Grace period for worker unwinding and child shutdown escalation.
    pub grace: Duration,

    /// Nodes per graph-store transaction when splitting a batch.
    pub store_batch_nodes: usize,

    /// Edges per graph-store transaction when splitting a batch.
    pub store_batch_edges: usize,

    /// Store transaction retries (exponential backoff) before the job fails.
    pub store_retry_attempts: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_active_jobs: 4,
            workers: 8.min(num_cpus::get().max(1)),
            batch_nodes: 200,
            batch_edges: 400,
            batch_interval: Duration::from_millis(500),
            max_retries: 3,
            lsp_request_timeout: Duration::from_secs(30),
            max_file_bytes: 2 * 1024 * 1024,
            max_queue_files: 10_000,
            broker_ring: 256,
            subscriber_buffer: 64,
            max_respawn: 3,
            respawn_window: Duration::from_secs(300),
            max_servers_per_lang: 1,
            grace: Duration::from_secs(5),
            store_batch_nodes: 500,
            store_batch_edges: 1000,
            store_retry_attempts: 5,
        }
    }
}

impl AnalysisConfig {
    /// Build a configuration from defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = read_env("CODEGRAPHD_MAX_ACTIVE_JOBS") {
            config.max_active_jobs = v;
        }
        if let Some(v) = read_env("CODEGRAPHD_WORKERS") {
            config.workers = v;
        }
        if let Some(v) = read_env("CODEGRAPHD_BATCH_NODES") {
            config.batch_nodes = v;
        }
        if let Some(v) = read_env("CODEGRAPHD_BATCH_EDGES") {
            config.batch_edges = v;
        }
        if let Some(v) = read_env::<u64>("CODEGRAPHD_BATCH_INTERVAL_MS") {
            config.batch_interval = Duration::from_millis(v);
        }
        if let Some(v) = read_env("CODEGRAPHD_MAX_RETRIES") {
            config.max_retries = v;
        }
        if let Some(v) = read_env::<u64>("CODEGRAPHD_LSP_TIMEOUT_SECS") {
            config.lsp_request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = read_env("CODEGRAPHD_MAX_FILE_BYTES") {
            config.max_file_bytes = v;
        }
        if let Some(v) = read_env("CODEGRAPHD_MAX_QUEUE_FILES") {
            config.max_queue_files = v;
        }
        if let Some(v) = read_env("CODEGRAPHD_BROKER_RING") {
            config.broker_ring = v;
        }
        if let Some(v) = read_env("CODEGRAPHD_SUBSCRIBER_BUFFER") {
            config.subscriber_buffer = v;
        }
        if let Some(v) = read_env::<u64>("CODEGRAPHD_GRACE_SECS") {
            config.grace = Duration::from_secs(v);
        }

        config
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = AnalysisConfig::default();
        assert_eq!(config.max_active_jobs, 4);
        assert!(config.workers >= 1 && config.workers <= 8);
        assert_eq!(config.batch_nodes, 200);
        assert_eq!(config.batch_edges, 400);
        assert_eq!(config.batch_interval, Duration::from_millis(500));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_file_bytes, 2 * 1024 * 1024);
        assert_eq!(config.broker_ring, 256);
        assert_eq!(config.subscriber_buffer, 64);
        assert_eq!(config.max_respawn, 3);
        assert_eq!(config.respawn_window, Duration::from_secs(300));
    }

    #[test]
    fn env_override_is_applied() {
        std::env::set_var("CODEGRAPHD_BATCH_NODES", "50");
        let config = AnalysisConfig::from_env();
        assert_eq!(config.batch_nodes, 50);
        std::env::remove_var("CODEGRAPHD_BATCH_NODES");
    }

    #[test]
    fn invalid_env_value_is_ignored() {
        std::env::set_var("CODEGRAPHD_MAX_RETRIES", "not-a-number");
        let config = AnalysisConfig::from_env();
        assert_eq!(config.max_retries, 3);
        std::env::remove_var("CODEGRAPHD_MAX_RETRIES");
    }
}
