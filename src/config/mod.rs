
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String)
}

/// Tunables for the whole pipeline. Every field has a default, so an empty
/// file (or no file at all) yields a working configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub buffer: BufferConfig,
    pub settlement: SettlementConfig,
    pub publisher: PublisherConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    pub queue_key: String,
    pub batch_size: usize,
    pub workers: usize,
    pub pop_timeout_ms: u64,
    /// How long a worker keeps filling a non-empty batch before flushing it.
    pub linger_ms: u64,
    pub retry_backoff_ms: u64,
    pub shutdown_grace_ms: u64
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            queue_key: "ledger:transfer-buffer".to_string(),
            batch_size: 2000,
            workers: 10,
            pop_timeout_ms: 5000,
            linger_ms: 50,
            retry_backoff_ms: 1000,
            shutdown_grace_ms: 5000
        }
    }
}

impl BufferConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Prefix shared by every worker's in-flight list.
    pub fn processing_prefix(&self) -> String {
        format!("{}:processing:", self.queue_key)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettlementConfig {
    pub workers: usize,
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub target_cycle_ms: u64,
    pub saturation_threshold: f64,
    pub lock_timeout_ms: u64,
    pub max_retries: u32,
    pub poll_interval_ms: u64
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            initial_batch_size: 500,
            min_batch_size: 50,
            max_batch_size: 2000,
            target_cycle_ms: 500,
            saturation_threshold: 0.90,
            lock_timeout_ms: 60_000,
            max_retries: 5,
            poll_interval_ms: 10
        }
    }
}

impl SettlementConfig {
    pub fn target_cycle(&self) -> Duration {
        Duration::from_millis(self.target_cycle_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub publish_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub poll_interval_ms: u64
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            publish_timeout_ms: 5000,
            lock_timeout_ms: 60_000,
            poll_interval_ms: 100
        }
    }
}

impl PublisherConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    /// Upper bound on waiting for every account row lock taken in one call.
    pub lock_wait_ms: u64
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            pool_size: 20,
            acquire_timeout_ms: 5000,
            lock_wait_ms: 10_000
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub capacity: u64,
    pub time_to_live_ms: u64
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            time_to_live_ms: 60_000
        }
    }
}

impl CacheConfig {
    pub fn time_to_live(&self) -> Duration {
        Duration::from_millis(self.time_to_live_ms)
    }
}

impl LedgerConfig {
    /// Loads the configuration from `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_toml_str(&fs::read_to_string(path)?)?
            }
            None => Self::default()
        };

        config.validate()?;

        Ok(config)
    }

    /// How long shutdown waits for the worker loops to finish their current
    /// iteration. A settlement cycle can block on the connection pool and then
    /// on row locks before it saves, so the wait always covers both.
    pub fn worker_grace(&self) -> Duration {
        self.database.acquire_timeout() + self.database.lock_wait() + self.buffer.shutdown_grace()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let settlement = &self.settlement;

        if self.buffer.queue_key.trim().is_empty() {
            return Err(ConfigError::Validation("buffer.queue_key cannot be blank".to_string()))
        }

        if self.buffer.batch_size == 0 || self.buffer.workers == 0 {
            return Err(ConfigError::Validation("buffer.batch_size and buffer.workers must be positive".to_string()))
        }

        if settlement.workers == 0 {
            return Err(ConfigError::Validation("settlement.workers must be positive".to_string()))
        }

        if settlement.min_batch_size == 0 || settlement.min_batch_size > settlement.max_batch_size {
            return Err(ConfigError::Validation(format!(
                "settlement batch bounds are inconsistent: min {} max {}",
                settlement.min_batch_size,
                settlement.max_batch_size
            )))
        }

        if !(settlement.min_batch_size..=settlement.max_batch_size).contains(&settlement.initial_batch_size) {
            return Err(ConfigError::Validation(format!(
                "settlement.initial_batch_size {} is outside [{}, {}]",
                settlement.initial_batch_size,
                settlement.min_batch_size,
                settlement.max_batch_size
            )))
        }

        if !(settlement.saturation_threshold > 0.0 && settlement.saturation_threshold <= 1.0) {
            return Err(ConfigError::Validation("settlement.saturation_threshold must be in (0, 1]".to_string()))
        }

        if settlement.target_cycle_ms == 0 {
            return Err(ConfigError::Validation("settlement.target_cycle_ms must be positive".to_string()))
        }

        if settlement.max_retries == 0 || self.publisher.max_retries == 0 {
            return Err(ConfigError::Validation("max_retries must be positive".to_string()))
        }

        if self.publisher.batch_size == 0 {
            return Err(ConfigError::Validation("publisher.batch_size must be positive".to_string()))
        }

        if self.database.pool_size == 0 {
            return Err(ConfigError::Validation("database.pool_size must be positive".to_string()))
        }

        Ok(())
    }
}
