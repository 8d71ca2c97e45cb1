//! Hour-sharded full-text index
//!
//! - `shard`: one Tantivy index per hour bucket, exclusively opened
//! - `federation`: the live shard set searched as one logical index
//! - `lifecycle`: active shard, rollover, retention and startup recovery

mod error;
mod federation;
mod lifecycle;
mod shard;

pub use error::{ShardError, ShardResult};
pub use federation::FederationView;
pub use lifecycle::IndexLifecycleManager;
pub use shard::{discover_shards, hour_bucket, parse_bucket, shard_path, Shard, SHARD_SUFFIX};
