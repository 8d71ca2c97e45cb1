//! Query evaluation against the lifecycle manager's shards

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::index::{IndexLifecycleManager, ShardError, ShardResult};
use crate::types::{SearchQuery, SearchResults};

/// Hits fetched per pass when deleting a range
const DELETE_BATCH: usize = 1_000;

/// Which shards a range search covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    /// Only the shard currently receiving writes
    ActiveShard,
    /// Every live shard
    #[default]
    Federation,
}

/// Search entry point used by the HTTP API
#[derive(Clone)]
pub struct SearchFederation {
    ilm: Arc<IndexLifecycleManager>,
}

impl SearchFederation {
    pub fn new(ilm: Arc<IndexLifecycleManager>) -> Self {
        Self { ilm }
    }

    /// Free-text search over every live shard, merged and deduplicated
    pub async fn search_with_query(&self, query: &SearchQuery) -> ShardResult<SearchResults> {
        let federation = self.ilm.federation();
        let text = query.query.clone();
        let size = query.limit();

        let results = blocking(move || federation.search_text(&text, size)).await?;
        debug!(
            query = %query.query,
            hits = results.hits.len(),
            shards = results.shards_searched,
            "search complete"
        );
        Ok(results)
    }

    /// Hits whose timestamp falls in `[start, end]`, from the given scope
    pub async fn search_with_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        size: usize,
        scope: SearchScope,
    ) -> ShardResult<SearchResults> {
        match scope {
            SearchScope::Federation => {
                let federation = self.ilm.federation();
                blocking(move || federation.search_range(start, end, size)).await
            }
            SearchScope::ActiveShard => {
                let shard = self.ilm.active_shard().ok_or(ShardError::NoActiveShard)?;
                blocking(move || {
                    let timer = Instant::now();
                    let hits = shard.search_range(start, end, size)?;
                    let mut results = SearchResults::merge(hits, size);
                    results.shards_searched = 1;
                    results.took_ms = timer.elapsed().as_millis() as u64;
                    Ok(results)
                })
                .await
            }
        }
    }

    /// Delete every document in the active shard older than `retention`.
    /// Whole-shard eviction handles past shards; this only trims the shard
    /// still receiving writes. Returns the number of documents removed.
    pub async fn delete_expired(&self, retention: chrono::Duration) -> ShardResult<usize> {
        let shard = self.ilm.active_shard().ok_or(ShardError::NoActiveShard)?;
        let cutoff = Utc::now() - retention;

        let deleted = blocking(move || {
            let mut deleted = 0;
            loop {
                let hits = shard.search_range(DateTime::<Utc>::UNIX_EPOCH, cutoff, DELETE_BATCH)?;
                if hits.is_empty() {
                    break;
                }
                for hit in &hits {
                    shard.delete_document(&hit.id)?;
                }
                deleted += hits.len();
            }
            Ok(deleted)
        })
        .await?;

        info!(deleted, cutoff = %cutoff, "deleted expired documents from active shard");
        Ok(deleted)
    }
}

async fn blocking<T, F>(f: F) -> ShardResult<T>
where
    F: FnOnce() -> ShardResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ShardError::Task(e.to_string()))?
}
