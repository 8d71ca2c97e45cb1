//! Shard error taxonomy

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias for shard and lifecycle operations
pub type ShardResult<T> = Result<T, ShardError>;

/// Errors raised by shards and the index lifecycle manager
#[derive(Debug, Error)]
pub enum ShardError {
    /// Another writer (this or another process) holds the shard lock
    #[error("Shard {name} is busy: already opened by another writer")]
    Busy { name: String },

    #[error("Timed out after {timeout:?} opening shard {name}; it may already be open")]
    OpenTimeout { name: String, timeout: Duration },

    #[error("Shard not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Shard {0} is closed")]
    Closed(String),

    #[error("No active shard")]
    NoActiveShard,

    #[error("Invalid shard name: {0}")]
    InvalidName(String),

    #[error("Invalid query: {0}")]
    Query(String),

    #[error("Index engine error: {0}")]
    Engine(#[from] tantivy::TantivyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ShardError {
    /// Busy and timed-out opens are reported distinctly from missing or
    /// corrupted shards; both mean "someone else has it".
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::OpenTimeout { .. })
    }

    /// Errors worth retrying on the indexing path. A closed or missing
    /// active shard is transient: rollover is swapping it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. } | Self::Closed(_) | Self::NoActiveShard | Self::Engine(_) | Self::Io(_)
        )
    }
}
