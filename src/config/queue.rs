//! Ingest queue configuration

use serde::{Deserialize, Serialize};

/// Which queue implementation carries records from ingest to the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-process channel, no durability
    Channel,
    /// NATS JetStream durable stream
    Nats,
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_backend")]
    pub backend: QueueBackend,
    /// Channel capacity (1 is the closest to an unbuffered handoff)
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub nats: NatsConfig,
}

fn default_backend() -> QueueBackend {
    QueueBackend::Channel
}

fn default_capacity() -> usize {
    1
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            capacity: default_capacity(),
            nats: NatsConfig::default(),
        }
    }
}

/// NATS JetStream connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Durable consumer name shared by every instance of the consumer group
    #[serde(default = "default_consumer")]
    pub consumer: String,
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_subject() -> String {
    "logs.ingest".to_string()
}

fn default_stream() -> String {
    "LOGS".to_string()
}

fn default_consumer() -> String {
    "logfed-indexer".to_string()
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            subject: default_subject(),
            stream: default_stream(),
            consumer: default_consumer(),
        }
    }
}
