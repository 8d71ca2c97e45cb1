//! HTTP API Request/Response Types
//!
//! Search responses reuse [`crate::types::SearchResults`]; the types here
//! cover the remaining endpoints.

use serde::{Deserialize, Serialize};

use crate::daemon::processor::ProcessorStats;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
}

/// Index and processor status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Shard currently receiving writes, absent during a rollover gap
    pub active_shard: Option<String>,
    /// Every shard in the federation view
    pub shards: Vec<String>,
    pub retention_hours: u64,
    pub processor: ProcessorStats,
}

/// Result of the document-level cleanup endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: usize,
}
