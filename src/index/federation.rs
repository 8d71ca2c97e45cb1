//! Federation view: the set of live shards searched as one logical index

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::error::{ShardError, ShardResult};
use super::shard::Shard;
use crate::types::{SearchHit, SearchResults};

/// Concurrent shard set. Searches take a snapshot of the member list and
/// iterate it without holding the lock, so adds and removes never block
/// behind a long-running query.
#[derive(Debug, Default)]
pub struct FederationView {
    shards: RwLock<BTreeMap<String, Arc<Shard>>>,
}

impl FederationView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a shard under its name
    pub fn add(&self, shard: Arc<Shard>) {
        let name = shard.name().to_string();
        let replaced = self.shards.write().insert(name.clone(), shard).is_some();
        debug!(shard = %name, replaced, "shard added to federation");
    }

    /// Remove a shard; it stops being searchable once this returns
    pub fn remove(&self, name: &str) -> Option<Arc<Shard>> {
        let removed = self.shards.write().remove(name);
        if removed.is_some() {
            debug!(shard = %name, "shard removed from federation");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shards.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    /// Names of every member, sorted
    pub fn shard_names(&self) -> Vec<String> {
        self.shards.read().keys().cloned().collect()
    }

    /// Point-in-time copy of the member list
    pub fn snapshot(&self) -> Vec<Arc<Shard>> {
        self.shards.read().values().cloned().collect()
    }

    /// Free-text search across every member shard
    pub fn search_text(&self, query_text: &str, size: usize) -> ShardResult<SearchResults> {
        self.fan_in(size, |shard| shard.search_text(query_text, size))
    }

    /// Timestamp range search across every member shard
    pub fn search_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        size: usize,
    ) -> ShardResult<SearchResults> {
        self.fan_in(size, |shard| shard.search_range(start, end, size))
    }

    /// Run `search` against a snapshot of the members and merge the hits.
    /// A query that fails to parse fails the whole search; any other
    /// per-shard failure is logged and that shard is skipped.
    fn fan_in<F>(&self, size: usize, search: F) -> ShardResult<SearchResults>
    where
        F: Fn(&Shard) -> ShardResult<Vec<SearchHit>>,
    {
        let start = Instant::now();
        let shards = self.snapshot();

        let mut all_hits = Vec::new();
        for shard in &shards {
            match search(shard) {
                Ok(hits) => all_hits.extend(hits),
                Err(e @ ShardError::Query(_)) => return Err(e),
                Err(e) => warn!(shard = %shard.name(), "shard search failed: {}", e),
            }
        }

        let mut results = SearchResults::merge(all_hits, size);
        results.shards_searched = shards.len();
        results.took_ms = start.elapsed().as_millis() as u64;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::shard::shard_path;
    use crate::types::LogRecord;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn shard_with(dir: &TempDir, hour: u32, records: &[(&str, &str)]) -> Arc<Shard> {
        let path = shard_path(&dir.path().join("index"), at(hour, 0));
        let shard = Shard::create(&path).unwrap();
        for (i, (level, message)) in records.iter().enumerate() {
            shard
                .index_record(&LogRecord::new(at(hour, i as u32), *level, *message))
                .unwrap();
        }
        Arc::new(shard)
    }

    #[test]
    fn test_search_unions_shards() {
        let temp_dir = TempDir::new().unwrap();
        let view = FederationView::new();
        view.add(shard_with(&temp_dir, 10, &[("INFO", "boot")]));
        view.add(shard_with(&temp_dir, 11, &[("INFO", "tick")]));

        let results = view.search_text("boot OR tick", 10).unwrap();
        assert_eq!(results.total_hits, 2);
        assert_eq!(results.shards_searched, 2);

        let shards: std::collections::HashSet<_> =
            results.hits.iter().map(|h| h.shard.clone()).collect();
        assert_eq!(shards.len(), 2);
    }

    #[test]
    fn test_removed_shard_is_not_searched() {
        let temp_dir = TempDir::new().unwrap();
        let view = FederationView::new();
        let old = shard_with(&temp_dir, 10, &[("INFO", "boot")]);
        view.add(old.clone());
        view.add(shard_with(&temp_dir, 11, &[("INFO", "tick")]));

        assert!(view.remove(old.name()).is_some());
        assert!(!view.contains(old.name()));
        assert_eq!(view.search_text("boot", 10).unwrap().total_hits, 0);
    }

    #[test]
    fn test_bad_query_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let view = FederationView::new();
        view.add(shard_with(&temp_dir, 10, &[("INFO", "boot")]));

        assert!(view.search_text("message:(", 10).is_err());
    }

    #[test]
    fn test_empty_view_returns_no_hits() {
        let view = FederationView::new();
        let results = view.search_text("anything", 10).unwrap();
        assert!(results.hits.is_empty());
        assert_eq!(results.shards_searched, 0);
    }
}
