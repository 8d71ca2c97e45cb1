//! Core types for the logfed system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of an indexed document (derived from the record timestamp)
pub type DocumentId = String;

/// Name of a shard directory, e.g. `index-storage/index-2024-01-01-10.log`
pub type ShardName = String;

/// Timestamp layout used for document ids (millisecond precision)
pub const DOCUMENT_ID_FORMAT: &str = "%Y%m%d%H%M%S%.3f";

/// Default number of hits returned by a search
pub const DEFAULT_SEARCH_SIZE: usize = 10;

/// Upper bound on hits per search; larger requested sizes are clamped
pub const MAX_SEARCH_SIZE: usize = 10_000;

// ============================================================================
// Log Records
// ============================================================================

/// A single structured log line as received on the ingest API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
}

impl Default for LogRecord {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            level: String::new(),
            message: String::new(),
        }
    }
}

impl LogRecord {
    pub fn new(timestamp: DateTime<Utc>, level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level: level.into(),
            message: message.into(),
        }
    }

    /// Deterministic document id. Two records with the same millisecond
    /// timestamp share an id, so the later write replaces the earlier one.
    pub fn document_id(&self) -> DocumentId {
        self.timestamp.format(DOCUMENT_ID_FORMAT).to_string()
    }

    /// Key used by the sharding proxy to pick a backend
    pub fn routing_key(&self) -> String {
        format!("{}-{}", self.timestamp.to_rfc3339(), self.message)
    }
}

// ============================================================================
// Search
// ============================================================================

/// Free-text search request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub query: String,
    /// Maximum number of hits to return
    #[serde(default = "default_search_size")]
    pub size: usize,
}

fn default_search_size() -> usize {
    DEFAULT_SEARCH_SIZE
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            size: DEFAULT_SEARCH_SIZE,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Requested size, clamped to [`MAX_SEARCH_SIZE`]
    pub fn limit(&self) -> usize {
        self.size.min(MAX_SEARCH_SIZE)
    }
}

/// Stored fields projected into every hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitFields {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// A matching document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: DocumentId,
    /// Shard the hit was read from
    pub shard: String,
    pub score: f32,
    pub fields: HitFields,
}

/// Merged result of a search across one or more shards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub total_hits: usize,
    pub hits: Vec<SearchHit>,
    #[serde(default)]
    pub shards_searched: usize,
    #[serde(default)]
    pub took_ms: u64,
}

impl SearchResults {
    /// Union hit sets, keeping one hit per document id (highest score wins),
    /// ordered by score descending and truncated to `size`.
    pub fn merge(hits: impl IntoIterator<Item = SearchHit>, size: usize) -> Self {
        let mut by_id: HashMap<DocumentId, SearchHit> = HashMap::new();
        for hit in hits {
            match by_id.get(&hit.id) {
                Some(existing) if existing.score >= hit.score => {}
                _ => {
                    by_id.insert(hit.id.clone(), hit);
                }
            }
        }

        let mut hits: Vec<SearchHit> = by_id.into_values().collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total_hits = hits.len();
        hits.truncate(size);

        Self {
            total_hits,
            hits,
            shards_searched: 0,
            took_ms: 0,
        }
    }
}
