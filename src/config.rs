//! Engine configuration.
//!
//! Aggregates the per-component configurations and the data directory layout,
//! with overrides loaded from `CRAWL_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::batch::RateLimitConfig;
use crate::monitor::MonitorConfig;
use crate::scheduler::{QueueConfig, WorkerPoolConfig};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the whole crawl engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for queue files, checkpoints, history and output.
    pub data_dir: PathBuf,
    pub queue: QueueConfig,
    pub pool: WorkerPoolConfig,
    pub monitor: MonitorConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            queue: QueueConfig::default(),
            pool: WorkerPoolConfig::default(),
            monitor: MonitorConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CRAWL_DATA_DIR`: Data directory (default: ./data)
    /// - `CRAWL_INITIAL_CONCURRENCY`: Starting worker concurrency (default: 2)
    /// - `CRAWL_MAX_CONCURRENCY`: Upper concurrency bound (default: 10)
    /// - `CRAWL_ADJUSTMENT_INTERVAL_SECS`: Adjustment cycle period (default: 60)
    /// - `CRAWL_CPU_HIGH` / `CRAWL_CPU_LOW`: CPU thresholds in percent (default: 80 / 50)
    /// - `CRAWL_MEMORY_HIGH` / `CRAWL_MEMORY_LOW`: Memory thresholds (default: 80 / 60)
    /// - `CRAWL_CHECKPOINT_INTERVAL_SECS`: Checkpoint period (default: 300)
    /// - `CRAWL_POLL_INTERVAL_MS`: Idle worker poll period (default: 5000)
    /// - `CRAWL_CHECK_INTERVAL_SECS`: Resource monitor period (default: 30)
    /// - `CRAWL_CPU_CRITICAL` / `CRAWL_MEMORY_CRITICAL` / `CRAWL_DISK_CRITICAL`:
    ///   Monitor pause thresholds (default: 90 / 90 / 95)
    /// - `CRAWL_MAX_RETRIES`: Attempts before a job fails permanently (default: 3)
    /// - `CRAWL_REQUESTS_PER_MINUTE`: Batch runner rate limit (default: 100)
    /// - `CRAWL_BATCH_SIZE`: Batch runner chunk size (default: 50)
    /// - `CRAWL_MAX_CONCURRENT_REQUESTS`: Batch runner parallelism (default: 10)
    /// - `CRAWL_COOLDOWN_MS`: Pause between batch chunks (default: 1000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary key lookup.
    ///
    /// Uses the same keys as [`EngineConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(val) = get("CRAWL_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        // Worker pool
        if let Some(val) = get("CRAWL_INITIAL_CONCURRENCY") {
            config.pool.initial_concurrency = parse_env_value(&val, "CRAWL_INITIAL_CONCURRENCY")?;
        }
        if let Some(val) = get("CRAWL_MAX_CONCURRENCY") {
            config.pool.max_concurrency = parse_env_value(&val, "CRAWL_MAX_CONCURRENCY")?;
        }
        if let Some(val) = get("CRAWL_ADJUSTMENT_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "CRAWL_ADJUSTMENT_INTERVAL_SECS")?;
            config.pool.adjustment_interval = Duration::from_secs(secs);
        }
        if let Some(val) = get("CRAWL_CPU_HIGH") {
            config.pool.cpu_threshold_high = parse_env_value(&val, "CRAWL_CPU_HIGH")?;
        }
        if let Some(val) = get("CRAWL_CPU_LOW") {
            config.pool.cpu_threshold_low = parse_env_value(&val, "CRAWL_CPU_LOW")?;
        }
        if let Some(val) = get("CRAWL_MEMORY_HIGH") {
            config.pool.memory_threshold_high = parse_env_value(&val, "CRAWL_MEMORY_HIGH")?;
        }
        if let Some(val) = get("CRAWL_MEMORY_LOW") {
            config.pool.memory_threshold_low = parse_env_value(&val, "CRAWL_MEMORY_LOW")?;
        }
        if let Some(val) = get("CRAWL_CHECKPOINT_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "CRAWL_CHECKPOINT_INTERVAL_SECS")?;
            config.pool.checkpoint_interval = Duration::from_secs(secs);
        }
        if let Some(val) = get("CRAWL_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "CRAWL_POLL_INTERVAL_MS")?;
            config.pool.poll_interval = Duration::from_millis(millis);
        }

        // Resource monitor
        if let Some(val) = get("CRAWL_CHECK_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "CRAWL_CHECK_INTERVAL_SECS")?;
            config.monitor.check_interval = Duration::from_secs(secs);
        }
        if let Some(val) = get("CRAWL_CPU_CRITICAL") {
            config.monitor.cpu_critical = parse_env_value(&val, "CRAWL_CPU_CRITICAL")?;
        }
        if let Some(val) = get("CRAWL_MEMORY_CRITICAL") {
            config.monitor.memory_critical = parse_env_value(&val, "CRAWL_MEMORY_CRITICAL")?;
        }
        if let Some(val) = get("CRAWL_DISK_CRITICAL") {
            config.monitor.disk_critical = parse_env_value(&val, "CRAWL_DISK_CRITICAL")?;
        }

        // Queue
        if let Some(val) = get("CRAWL_MAX_RETRIES") {
            config.queue.max_retries = parse_env_value(&val, "CRAWL_MAX_RETRIES")?;
        }

        // Batch runner
        if let Some(val) = get("CRAWL_REQUESTS_PER_MINUTE") {
            config.rate_limit.requests_per_minute =
                parse_env_value(&val, "CRAWL_REQUESTS_PER_MINUTE")?;
        }
        if let Some(val) = get("CRAWL_BATCH_SIZE") {
            config.rate_limit.batch_size = parse_env_value(&val, "CRAWL_BATCH_SIZE")?;
        }
        if let Some(val) = get("CRAWL_MAX_CONCURRENT_REQUESTS") {
            config.rate_limit.max_concurrent_requests =
                parse_env_value(&val, "CRAWL_MAX_CONCURRENT_REQUESTS")?;
        }
        if let Some(val) = get("CRAWL_COOLDOWN_MS") {
            let millis: u64 = parse_env_value(&val, "CRAWL_COOLDOWN_MS")?;
            config.rate_limit.cooldown_period = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates every component configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "data_dir cannot be empty".to_string(),
            ));
        }

        if self.queue.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        self.pool
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;
        self.monitor
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;
        self.rate_limit
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;

        Ok(())
    }

    /// Builder method to set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Directory holding the queue's pending, completed and failure files.
    pub fn queue_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory the worker pool writes checkpoints into.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Directory the resource monitor appends history files into.
    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Directory fetched pages are stored in.
    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("pages")
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
