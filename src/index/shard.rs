//! Hour-bucket shard backed by a Tantivy index
//!
//! A shard lives in its own directory named `<prefix>-YYYY-MM-DD-HH.log`.
//! While open it holds Tantivy's writer lock, which makes opening exclusive:
//! a second open of the same directory fails with [`ShardError::Busy`]
//! instead of waiting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use parking_lot::Mutex;
use tantivy::{
    collector::TopDocs,
    directory::{error::LockError, MmapDirectory},
    query::{Query, QueryParser},
    schema::{DateOptions, Field, Schema, Value, STORED, STRING, TEXT},
    Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, TantivyError, Term,
};
use tracing::{debug, info};

use super::error::{ShardError, ShardResult};
use crate::types::{HitFields, LogRecord, SearchHit, MAX_SEARCH_SIZE};

/// Suffix shared by every shard directory
pub const SHARD_SUFFIX: &str = ".log";

/// Hour bucket layout embedded in shard names
const BUCKET_FORMAT: &str = "%Y-%m-%d-%H";

/// Writer heap budget. Tantivy's per-thread minimum is 15MB.
const WRITER_MEMORY_BYTES: usize = 15_000_000;

// ============================================================================
// Naming
// ============================================================================

/// Truncate an instant to the start of its hour
pub fn hour_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// Shard directory path for the hour containing `now`
pub fn shard_path(base_prefix: &Path, now: DateTime<Utc>) -> PathBuf {
    PathBuf::from(format!(
        "{}-{}{}",
        base_prefix.display(),
        hour_bucket(now).format(BUCKET_FORMAT),
        SHARD_SUFFIX
    ))
}

/// Parse the hour bucket embedded at the end of a shard name
pub fn parse_bucket(name: &str) -> ShardResult<DateTime<Utc>> {
    let invalid = || ShardError::InvalidName(name.to_string());

    let stem = name.strip_suffix(SHARD_SUFFIX).ok_or_else(invalid)?;
    // "YYYY-MM-DD-HH" is 13 bytes
    let split = stem.len().checked_sub(13).ok_or_else(invalid)?;
    let tail = stem.get(split..).ok_or_else(invalid)?;

    let naive = NaiveDateTime::parse_from_str(&format!("{}-00", tail), "%Y-%m-%d-%H-%M")
        .map_err(|_| invalid())?;
    Ok(naive.and_utc())
}

// ============================================================================
// Schema
// ============================================================================

/// Schema fields shared by every shard
#[derive(Debug, Clone, Copy)]
struct ShardFields {
    id: Field,
    timestamp: Field,
    level: Field,
    message: Field,
}

fn build_schema() -> (Schema, ShardFields) {
    let mut builder = Schema::builder();

    let id = builder.add_text_field("id", STRING | STORED);
    let timestamp = builder.add_date_field(
        "timestamp",
        DateOptions::default().set_indexed().set_stored().set_fast(),
    );
    let level = builder.add_text_field("level", TEXT | STORED);
    let message = builder.add_text_field("message", TEXT | STORED);

    let fields = ShardFields {
        id,
        timestamp,
        level,
        message,
    };
    (builder.build(), fields)
}

// ============================================================================
// Shard
// ============================================================================

/// A named, searchable document store bound to one hour bucket
pub struct Shard {
    name: String,
    path: PathBuf,
    bucket: DateTime<Utc>,
    index: Index,
    reader: IndexReader,
    /// `None` once the shard has been closed
    writer: Mutex<Option<IndexWriter>>,
    fields: ShardFields,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("name", &self.name)
            .field("bucket", &self.bucket)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Shard {
    /// Create a new empty shard at `path`
    pub fn create(path: &Path) -> ShardResult<Self> {
        std::fs::create_dir_all(path)?;
        let (schema, _) = build_schema();
        let dir = MmapDirectory::open(path).map_err(|e| ShardError::Engine(e.into()))?;
        let index = Index::open_or_create(dir, schema)?;
        info!(shard = %path.display(), "created shard");
        Self::from_index(path, index)
    }

    /// Open an existing shard, failing fast if another writer holds it
    pub fn open(path: &Path) -> ShardResult<Self> {
        if !path.is_dir() {
            return Err(ShardError::NotFound(path.to_path_buf()));
        }
        let index = Index::open_in_dir(path)?;
        debug!(shard = %path.display(), "opened shard");
        Self::from_index(path, index)
    }

    /// Open the shard if its directory exists, otherwise create it
    pub fn open_or_create(path: &Path) -> ShardResult<Self> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Open or create on the blocking pool, bounded by `timeout`
    pub async fn open_with_timeout(path: PathBuf, timeout: Duration) -> ShardResult<Self> {
        let name = path.display().to_string();
        let task = tokio::task::spawn_blocking(move || Self::open_or_create(&path));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ShardError::Task(join_err.to_string())),
            Err(_) => Err(ShardError::OpenTimeout { name, timeout }),
        }
    }

    fn from_index(path: &Path, index: Index) -> ShardResult<Self> {
        let name = path.display().to_string();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let bucket = parse_bucket(&file_name)?;

        let (_, fields) = build_schema();

        let writer = match index.writer_with_num_threads(1, WRITER_MEMORY_BYTES) {
            Ok(writer) => writer,
            Err(TantivyError::LockFailure(LockError::LockBusy, _)) => {
                return Err(ShardError::Busy { name });
            }
            Err(e) => return Err(e.into()),
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;

        Ok(Self {
            name,
            path: path.to_path_buf(),
            bucket,
            index,
            reader,
            writer: Mutex::new(Some(writer)),
            fields,
        })
    }

    /// Full shard name (its directory path)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start of the hour this shard covers
    pub fn bucket(&self) -> DateTime<Utc> {
        self.bucket
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }

    /// Number of live documents visible to searches
    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Index a record under its deterministic id, replacing any previous
    /// document with the same id, and make it visible to searches.
    pub fn index_record(&self, record: &LogRecord) -> ShardResult<String> {
        let id = record.document_id();

        let mut doc = TantivyDocument::new();
        doc.add_text(self.fields.id, &id);
        doc.add_date(
            self.fields.timestamp,
            tantivy::DateTime::from_timestamp_millis(record.timestamp.timestamp_millis()),
        );
        doc.add_text(self.fields.level, &record.level);
        doc.add_text(self.fields.message, &record.message);

        {
            let mut guard = self.writer.lock();
            let writer = guard
                .as_mut()
                .ok_or_else(|| ShardError::Closed(self.name.clone()))?;
            writer.delete_term(Term::from_field_text(self.fields.id, &id));
            writer.add_document(doc)?;
            writer.commit()?;
        }
        self.reader.reload()?;

        debug!(shard = %self.name, id = %id, "indexed record");
        Ok(id)
    }

    /// Remove a document by id
    pub fn delete_document(&self, id: &str) -> ShardResult<()> {
        {
            let mut guard = self.writer.lock();
            let writer = guard
                .as_mut()
                .ok_or_else(|| ShardError::Closed(self.name.clone()))?;
            writer.delete_term(Term::from_field_text(self.fields.id, id));
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }

    /// Parse a free-text query over `message` and `level`
    pub fn parse_text_query(&self, query_text: &str) -> ShardResult<Box<dyn Query>> {
        let parser = QueryParser::for_index(&self.index, vec![self.fields.message, self.fields.level]);
        parser
            .parse_query(query_text)
            .map_err(|e| ShardError::Query(e.to_string()))
    }

    /// Build an inclusive date range query over `timestamp`
    pub fn parse_range_query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ShardResult<Box<dyn Query>> {
        let parser = QueryParser::for_index(&self.index, vec![self.fields.timestamp]);
        let expr = format!(
            "timestamp:[{} TO {}]",
            start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        parser
            .parse_query(&expr)
            .map_err(|e| ShardError::Query(e.to_string()))
    }

    /// Free-text search
    pub fn search_text(&self, query_text: &str, limit: usize) -> ShardResult<Vec<SearchHit>> {
        let query = self.parse_text_query(query_text)?;
        self.search(query.as_ref(), limit)
    }

    /// Date range search over `[start, end]`
    pub fn search_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> ShardResult<Vec<SearchHit>> {
        let query = self.parse_range_query(start, end)?;
        self.search(query.as_ref(), limit)
    }

    /// Run a query and project `{timestamp, level, message}` into each hit.
    /// `limit` is clamped to [`MAX_SEARCH_SIZE`].
    pub fn search(&self, query: &dyn Query, limit: usize) -> ShardResult<Vec<SearchHit>> {
        let limit = limit.min(MAX_SEARCH_SIZE);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let top_docs = searcher.search(query, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;

            let text = |field: Field| {
                doc.get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            let timestamp = doc
                .get_first(self.fields.timestamp)
                .and_then(|v| v.as_datetime())
                .and_then(|dt| DateTime::<Utc>::from_timestamp_millis(dt.into_timestamp_millis()))
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

            hits.push(SearchHit {
                id: text(self.fields.id),
                shard: self.name.clone(),
                score,
                fields: HitFields {
                    timestamp,
                    level: text(self.fields.level),
                    message: text(self.fields.message),
                },
            });
        }

        debug!(shard = %self.name, hits = hits.len(), "shard search complete");
        Ok(hits)
    }

    /// Commit and release the writer lock. The shard stays searchable but
    /// rejects further writes. Closing twice is a no-op.
    pub fn close(&self) -> ShardResult<()> {
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            writer.commit()?;
            writer.wait_merging_threads()?;
            info!(shard = %self.name, "closed shard");
        }
        Ok(())
    }

    /// Delete the shard's backing directory. The shard must be closed.
    pub fn destroy(&self) -> ShardResult<()> {
        if !self.is_closed() {
            return Err(ShardError::Task(format!(
                "refusing to delete open shard {}",
                self.name
            )));
        }
        std::fs::remove_dir_all(&self.path)?;
        info!(shard = %self.name, "deleted shard storage");
        Ok(())
    }
}

/// List shard directories matching `<base_prefix>*.log`
pub fn discover_shards(base_prefix: &Path) -> ShardResult<Vec<PathBuf>> {
    // Joined paths must render exactly like `shard_path` so names match
    let parent = base_prefix.parent().map(Path::to_path_buf).unwrap_or_default();
    let scan_dir = if parent.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        parent.clone()
    };
    let stem = base_prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !scan_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(&scan_dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with(&stem)
            && file_name.ends_with(SHARD_SUFFIX)
            && entry.file_type()?.is_dir()
        {
            found.push(parent.join(&file_name));
        }
    }
    found.sort();
    Ok(found)
}
