//! logfed: hour-sharded log ingestion and federated full-text search
//!
//! - Time-partitioned Tantivy shards with hourly rollover and age-based
//!   retention, searched together through a federation view
//! - Asynchronous ingestion through an in-process or NATS JetStream queue,
//!   drained by a bounded worker pool with retry
//! - A sharding proxy that routes ingest by consistent hashing and fans
//!   search out to every backend

pub mod config;
pub mod daemon;
pub mod index;
pub mod proxy;
pub mod query;
pub mod queue;
pub mod routing;
pub mod types;

pub use config::Config;
pub use types::*;
