//! Sharding proxy configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How broadcast search responses are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Parse, deduplicate and rank backend results, reporting failed backends
    Merge,
    /// Write every backend body back to back
    Concatenate,
}

/// Sharding proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Backend base URLs, e.g. "http://127.0.0.1:8082"
    #[serde(default)]
    pub backends: Vec<String>,
    /// Virtual nodes per backend on the hash ring
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    #[serde(default = "default_search_mode")]
    pub search_mode: SearchMode,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8256".to_string()
}

fn default_virtual_nodes() -> usize {
    150
}

fn default_search_mode() -> SearchMode {
    SearchMode::Merge
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backends: Vec::new(),
            virtual_nodes: default_virtual_nodes(),
            search_mode: default_search_mode(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
