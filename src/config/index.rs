//! Index lifecycle configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted retention window (100 years)
pub const MAX_RETENTION_HOURS: u64 = 100 * 365 * 24;

/// Hour-sharded index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Path prefix for shard directories (`<prefix>-YYYY-MM-DD-HH.log`)
    #[serde(default = "default_base_prefix")]
    pub base_prefix: PathBuf,
    /// Shards older than this many hours are evicted by the retention sweep
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Upper bound on a single shard open before it is reported busy
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Indexing attempts per record before it is dropped
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Fixed delay between indexing attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_base_prefix() -> PathBuf {
    PathBuf::from("index-storage/index")
}

fn default_retention_hours() -> u64 {
    12 * 24
}

fn default_open_timeout_secs() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            base_prefix: default_base_prefix(),
            retention_hours: default_retention_hours(),
            open_timeout_secs: default_open_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl IndexConfig {
    /// Retention window, saturating at [`MAX_RETENTION_HOURS`]
    pub fn retention(&self) -> chrono::Duration {
        let hours = self.retention_hours.min(MAX_RETENTION_HOURS) as i64;
        chrono::Duration::hours(hours)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
