//! Streamer configuration.
//!
//! Settings can come from code, from `STREAMER_*` environment variables, or
//! from a TOML file. Durations are expressed in milliseconds on the wire.

use crate::error::{Result, StreamerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DFLT_PER_NODE_BUFFER_SIZE: usize = 512;
pub const DFLT_PER_BATCH_BUFFER_SIZE: usize = 64;
pub const DFLT_PARALLEL_OPS_MULTIPLIER: usize = 4;
pub const DFLT_MAX_REMAP_COUNT: u32 = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Destination cache
    pub cache_name: String,
    /// Entries per stripe before a batch is sent to a node
    pub per_node_buffer_size: usize,
    /// Entries a producer accumulates before routing them
    pub per_batch_buffer_size: usize,
    /// In-flight batches per node (0 = derive from the node's pool size)
    pub per_node_parallel_operations: usize,
    /// Multiplier applied to the node's pool size when deriving parallelism
    pub parallel_ops_multiplier: usize,
    /// Bound on gate waits and flush passes (None = wait forever)
    #[serde(with = "duration_millis_opt")]
    pub timeout: Option<Duration>,
    /// Background flush period (zero disables)
    #[serde(with = "duration_millis")]
    pub auto_flush_frequency: Duration,
    /// Retries allowed per submission before failing it
    pub max_remap_count: u32,
    /// Overwrite existing entries (individual receiver) instead of isolated load
    pub allow_overwrite: bool,
    pub skip_store: bool,
    pub keep_binary: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        StreamerConfig {
            cache_name: "default".to_string(),
            per_node_buffer_size: DFLT_PER_NODE_BUFFER_SIZE,
            per_batch_buffer_size: DFLT_PER_BATCH_BUFFER_SIZE,
            per_node_parallel_operations: 0,
            parallel_ops_multiplier: DFLT_PARALLEL_OPS_MULTIPLIER,
            timeout: None,
            auto_flush_frequency: Duration::ZERO,
            max_remap_count: DFLT_MAX_REMAP_COUNT,
            allow_overwrite: false,
            skip_store: false,
            keep_binary: false,
        }
    }
}

impl StreamerConfig {
    pub fn new(cache_name: impl Into<String>) -> Self {
        StreamerConfig {
            cache_name: cache_name.into(),
            ..Default::default()
        }
    }

    /// Configuration for tests (small buffers, bounded waits)
    pub fn test() -> Self {
        StreamerConfig {
            cache_name: "test".to_string(),
            per_node_buffer_size: 16,
            per_batch_buffer_size: 4,
            timeout: Some(Duration::from_secs(10)),
            max_remap_count: 8,
            ..Default::default()
        }
    }

    /// High-throughput configuration (large batches, periodic flush)
    pub fn high_throughput() -> Self {
        StreamerConfig {
            per_node_buffer_size: 4096,
            per_batch_buffer_size: 512,
            parallel_ops_multiplier: 8,
            auto_flush_frequency: Duration::from_millis(500),
            ..Default::default()
        }
    }

    /// Load configuration from `STREAMER_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let dflt = StreamerConfig::default();
        StreamerConfig {
            cache_name: std::env::var("STREAMER_CACHE_NAME").unwrap_or(dflt.cache_name),
            per_node_buffer_size: env_parse("STREAMER_PER_NODE_BUFFER_SIZE")
                .unwrap_or(dflt.per_node_buffer_size),
            per_batch_buffer_size: env_parse("STREAMER_PER_BATCH_BUFFER_SIZE")
                .unwrap_or(dflt.per_batch_buffer_size),
            per_node_parallel_operations: env_parse("STREAMER_PER_NODE_PARALLEL_OPS")
                .unwrap_or(dflt.per_node_parallel_operations),
            parallel_ops_multiplier: env_parse("STREAMER_PARALLEL_OPS_MULTIPLIER")
                .unwrap_or(dflt.parallel_ops_multiplier),
            timeout: env_parse::<u64>("STREAMER_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            auto_flush_frequency: env_parse::<u64>("STREAMER_AUTO_FLUSH_MS")
                .map(Duration::from_millis)
                .unwrap_or(dflt.auto_flush_frequency),
            max_remap_count: env_parse("STREAMER_MAX_REMAP_COUNT")
                .unwrap_or(dflt.max_remap_count),
            allow_overwrite: env_flag("STREAMER_ALLOW_OVERWRITE").unwrap_or(dflt.allow_overwrite),
            skip_store: env_flag("STREAMER_SKIP_STORE").unwrap_or(dflt.skip_store),
            keep_binary: env_flag("STREAMER_KEEP_BINARY").unwrap_or(dflt.keep_binary),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StreamerConfig =
            toml::from_str(s).map_err(|e| StreamerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StreamerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_name.is_empty() {
            return Err(StreamerError::Config("cache_name must not be empty".into()));
        }
        if self.per_node_buffer_size == 0 {
            return Err(StreamerError::Config(
                "per_node_buffer_size must be positive".into(),
            ));
        }
        if self.per_batch_buffer_size == 0 {
            return Err(StreamerError::Config(
                "per_batch_buffer_size must be positive".into(),
            ));
        }
        if self.parallel_ops_multiplier == 0 {
            return Err(StreamerError::Config(
                "parallel_ops_multiplier must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Size of the in-flight gate for a node with the given pool size.
    pub fn parallel_ops_for(&self, node_pool_size: usize) -> usize {
        self.per_node_parallel_operations
            .max(node_pool_size * self.parallel_ops_multiplier)
            .max(1)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "true" || v == "1")
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Optional duration as milliseconds; zero or absent means unbounded
mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok((millis > 0).then(|| Duration::from_millis(millis)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StreamerConfig::default();
        assert_eq!(config.per_node_buffer_size, 512);
        assert_eq!(config.max_remap_count, 32);
        assert_eq!(config.timeout, None);
        assert!(config.auto_flush_frequency.is_zero());
        assert!(!config.allow_overwrite);
        assert!(config.validate().is_ok());
        assert!(StreamerConfig::test().validate().is_ok());
        assert!(StreamerConfig::high_throughput().validate().is_ok());
    }

    #[test]
    fn test_parallel_ops_takes_larger_bound() {
        let mut config = StreamerConfig::default();
        assert_eq!(config.parallel_ops_for(2), 8);
        config.per_node_parallel_operations = 16;
        assert_eq!(config.parallel_ops_for(2), 16);
        config.per_node_parallel_operations = 0;
        assert_eq!(config.parallel_ops_for(0), 1);
    }

    #[test]
    fn test_toml_partial_overrides() {
        let config = StreamerConfig::from_toml_str(
            r#"
            cache_name = "orders"
            per_node_buffer_size = 1024
            timeout = 2500
            auto_flush_frequency = 100
            allow_overwrite = true
            "#,
        )
        .unwrap();
        assert_eq!(config.cache_name, "orders");
        assert_eq!(config.per_node_buffer_size, 1024);
        assert_eq!(config.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.auto_flush_frequency, Duration::from_millis(100));
        assert!(config.allow_overwrite);
        assert_eq!(config.per_batch_buffer_size, DFLT_PER_BATCH_BUFFER_SIZE);
    }

    #[test]
    fn test_toml_file_roundtrip() {
        let config = StreamerConfig {
            cache_name: "people".into(),
            timeout: Some(Duration::from_secs(3)),
            ..StreamerConfig::high_throughput()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", toml::to_string(&config).unwrap()).unwrap();

        let loaded = StreamerConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validation_rejects_zero_sizes() {
        let config = StreamerConfig {
            per_node_buffer_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StreamerError::Config(_))));

        let err = StreamerConfig::from_toml_str("per_batch_buffer_size = 0").unwrap_err();
        assert!(err.to_string().contains("per_batch_buffer_size"));
    }
}
