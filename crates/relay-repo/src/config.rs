//! Configuration management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RepoError, RepoResult};

// ============================================================================
// Store Configuration Constants
// ============================================================================

/// Default database file, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "relay-repo.db";

/// Default interval between maintenance passes (1 hour).
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 3600;

/// Lock acquisition time after which a warning is logged.
pub const DEFAULT_BUSY_WARN_THRESHOLD_SECS: u64 = 10;

/// Default number of pooled read connections.
pub const DEFAULT_READER_POOL_SIZE: usize = 4;

/// Default maximum items in a single aggregate.
pub const DEFAULT_MAX_ITEMS_PER_AGGREGATE: i64 = 1000;

/// Default maximum uncompressed bytes in a single aggregate (1 GiB).
pub const DEFAULT_MAX_UNCOMPRESSED_BYTE_SIZE: i64 = 1024 * 1024 * 1024;

/// Default maximum aggregate age before a forced close (10 minutes).
pub const DEFAULT_MAX_AGGREGATE_AGE_SECS: u64 = 600;

/// Default cap on aggregates closed by one sweep.
pub const DEFAULT_CLOSE_BATCH_LIMIT: usize = 1000;

/// Statements executed by a maintenance pass.
pub const DEFAULT_MAINTENANCE_STATEMENTS: &[&str] =
    &["PRAGMA optimize", "PRAGMA wal_checkpoint(TRUNCATE)"];

/// Staging store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    pub database: DbConfig,
    pub aggregation: AggregationConfig,
    pub forwarding: ForwardingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub path: PathBuf,
    /// `None` disables the background maintenance task
    pub maintenance_interval_secs: Option<u64>,
    pub maintenance_statements: Vec<String>,
    pub busy_warn_threshold_secs: u64,
    pub reader_pool_size: usize,
}

/// Bounds applied when grouping items into aggregates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub max_items_per_aggregate: i64,
    pub max_uncompressed_byte_size: i64,
    pub max_aggregate_age_secs: u64,
    pub close_batch_limit: usize,
}

/// Forwarding destinations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardingConfig {
    pub destinations: Vec<String>,
    /// Forward whole sources instead of aggregating their items
    #[serde(default)]
    pub direct: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DB_PATH),
            maintenance_interval_secs: Some(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            maintenance_statements: DEFAULT_MAINTENANCE_STATEMENTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            busy_warn_threshold_secs: DEFAULT_BUSY_WARN_THRESHOLD_SECS,
            reader_pool_size: DEFAULT_READER_POOL_SIZE,
        }
    }
}

impl DbConfig {
    /// Database config for a given file with every other setting defaulted
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn maintenance_interval(&self) -> Option<Duration> {
        self.maintenance_interval_secs.map(Duration::from_secs)
    }

    pub fn busy_warn_threshold(&self) -> Duration {
        Duration::from_secs(self.busy_warn_threshold_secs)
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_items_per_aggregate: DEFAULT_MAX_ITEMS_PER_AGGREGATE,
            max_uncompressed_byte_size: DEFAULT_MAX_UNCOMPRESSED_BYTE_SIZE,
            max_aggregate_age_secs: DEFAULT_MAX_AGGREGATE_AGE_SECS,
            close_batch_limit: DEFAULT_CLOSE_BATCH_LIMIT,
        }
    }
}

impl AggregationConfig {
    pub fn max_aggregate_age(&self) -> Duration {
        Duration::from_secs(self.max_aggregate_age_secs)
    }
}

impl RepoConfig {
    /// Config for a store at `path` with every other setting defaulted
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            database: DbConfig::at(path),
            ..Self::default()
        }
    }

    /// Load configuration from `.env`, environment variables and defaults
    ///
    /// Environment variables:
    /// - `RELAY_DB_PATH`
    /// - `RELAY_MAINTENANCE_INTERVAL` (seconds, `0` disables)
    /// - `RELAY_BUSY_WARN_THRESHOLD` (seconds)
    /// - `RELAY_READER_POOL_SIZE`
    /// - `RELAY_MAX_ITEMS_PER_AGGREGATE`
    /// - `RELAY_MAX_UNCOMPRESSED_BYTE_SIZE`
    /// - `RELAY_MAX_AGGREGATE_AGE` (seconds)
    /// - `RELAY_CLOSE_BATCH_LIMIT`
    /// - `RELAY_FORWARD_DESTINATIONS` (comma separated)
    /// - `RELAY_FORWARD_DIRECT` (true/false)
    pub fn load() -> RepoResult<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(path) = std::env::var("RELAY_DB_PATH") {
            config.database.path = PathBuf::from(path);
        }
        if let Some(secs) = env_parse::<u64>("RELAY_MAINTENANCE_INTERVAL")? {
            config.database.maintenance_interval_secs = (secs > 0).then_some(secs);
        }
        if let Some(secs) = env_parse("RELAY_BUSY_WARN_THRESHOLD")? {
            config.database.busy_warn_threshold_secs = secs;
        }
        if let Some(size) = env_parse("RELAY_READER_POOL_SIZE")? {
            config.database.reader_pool_size = size;
        }
        if let Some(max) = env_parse("RELAY_MAX_ITEMS_PER_AGGREGATE")? {
            config.aggregation.max_items_per_aggregate = max;
        }
        if let Some(max) = env_parse("RELAY_MAX_UNCOMPRESSED_BYTE_SIZE")? {
            config.aggregation.max_uncompressed_byte_size = max;
        }
        if let Some(secs) = env_parse("RELAY_MAX_AGGREGATE_AGE")? {
            config.aggregation.max_aggregate_age_secs = secs;
        }
        if let Some(limit) = env_parse("RELAY_CLOSE_BATCH_LIMIT")? {
            config.aggregation.close_batch_limit = limit;
        }
        if let Ok(dests) = std::env::var("RELAY_FORWARD_DESTINATIONS") {
            config.forwarding.destinations = dests
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(direct) = env_parse("RELAY_FORWARD_DIRECT")? {
            config.forwarding.direct = direct;
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> RepoResult<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(RepoError::config("Database path cannot be empty"));
        }

        if self.database.reader_pool_size == 0 {
            return Err(RepoError::config("Reader pool size must be greater than 0"));
        }

        if self.aggregation.max_items_per_aggregate <= 0 {
            return Err(RepoError::config(
                "max_items_per_aggregate must be greater than 0",
            ));
        }

        if self.aggregation.max_uncompressed_byte_size <= 0 {
            return Err(RepoError::config(
                "max_uncompressed_byte_size must be greater than 0",
            ));
        }

        if self.aggregation.close_batch_limit == 0 {
            return Err(RepoError::config("close_batch_limit must be greater than 0"));
        }

        if let Some(blank) = self
            .forwarding
            .destinations
            .iter()
            .position(|d| d.trim().is_empty())
        {
            return Err(RepoError::config(format!(
                "Forward destination {} is blank",
                blank
            )));
        }

        if self.forwarding.destinations.is_empty() {
            tracing::warn!("No forward destinations configured - data will be held until one is added");
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> RepoResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RepoError::config(format!("{} has an invalid value: '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
