//! Daemon, HTTP API, and processor configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address for HTTP server (e.g., "0.0.0.0:8080")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Deadline for the whole shutdown sequence
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_shutdown_deadline_secs() -> u64 {
    5
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
        }
    }
}

impl HttpConfig {
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

/// Log processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Maximum number of records indexed concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    64
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}
