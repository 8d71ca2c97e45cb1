//! Ingest queue
//!
//! Records flow from the HTTP ingest handler to the log processor through a
//! [`Queue`]. Two backends exist: an in-process bounded channel and a NATS
//! JetStream durable stream with explicit acknowledgment.

mod channel;
mod nats;

pub use channel::ChannelQueue;
pub use nats::NatsQueue;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{QueueBackend, QueueConfig};
use crate::types::LogRecord;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed and fully drained
    #[error("Queue is closed")]
    Closed,

    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(String),
}

/// Settles a delivered message with the backend that produced it
#[async_trait]
pub trait Acker: Send {
    /// Confirm the record was processed
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    /// Give up on the record; it is not redelivered
    async fn reject(self: Box<Self>) -> Result<(), QueueError>;
}

/// A dequeued record plus the means to settle it
pub struct Delivery {
    pub record: LogRecord,
    acker: Option<Box<dyn Acker>>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("record", &self.record)
            .field("acknowledged", &self.acker.is_some())
            .finish()
    }
}

impl Delivery {
    /// Delivery from a backend without acknowledgments
    pub fn unacked(record: LogRecord) -> Self {
        Self {
            record,
            acker: None,
        }
    }

    pub fn with_acker(record: LogRecord, acker: Box<dyn Acker>) -> Self {
        Self {
            record,
            acker: Some(acker),
        }
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn reject(self) -> Result<(), QueueError> {
        match self.acker {
            Some(acker) => acker.reject().await,
            None => Ok(()),
        }
    }
}

/// FIFO handoff of log records between producers and consumers
#[async_trait]
pub trait Queue: Send + Sync {
    /// Add a record. May wait for capacity.
    async fn enqueue(&self, record: LogRecord) -> Result<(), QueueError>;

    /// Wait for the next record. Returns [`QueueError::Closed`] once the
    /// queue is closed and nothing remains to deliver.
    async fn dequeue(&self) -> Result<Delivery, QueueError>;

    /// Stop accepting records and wake blocked consumers. Idempotent.
    async fn close(&self);
}

/// Build the queue selected by `config.backend`
pub async fn connect(config: &QueueConfig) -> Result<Arc<dyn Queue>, QueueError> {
    let queue: Arc<dyn Queue> = match config.backend {
        QueueBackend::Channel => Arc::new(ChannelQueue::new(config.capacity)),
        QueueBackend::Nats => Arc::new(NatsQueue::connect(&config.nats).await?),
    };
    info!(backend = ?config.backend, "ingest queue ready");
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagAcker {
        acked: Arc<AtomicBool>,
        rejected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Acker for FlagAcker {
        async fn ack(self: Box<Self>) -> Result<(), QueueError> {
            self.acked.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(self: Box<Self>) -> Result<(), QueueError> {
            self.rejected.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivery_routes_to_acker() {
        let acked = Arc::new(AtomicBool::new(false));
        let rejected = Arc::new(AtomicBool::new(false));
        let acker = || {
            Box::new(FlagAcker {
                acked: acked.clone(),
                rejected: rejected.clone(),
            })
        };

        Delivery::with_acker(LogRecord::default(), acker()).ack().await.unwrap();
        assert!(acked.load(Ordering::SeqCst));
        assert!(!rejected.load(Ordering::SeqCst));

        Delivery::with_acker(LogRecord::default(), acker()).reject().await.unwrap();
        assert!(rejected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unacked_delivery_settles_trivially() {
        Delivery::unacked(LogRecord::default()).ack().await.unwrap();
        Delivery::unacked(LogRecord::default()).reject().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_channel_backend() {
        let queue = connect(&QueueConfig::default()).await.unwrap();
        queue.enqueue(LogRecord::default()).await.unwrap();
        let delivery = queue.dequeue().await.unwrap();
        assert_eq!(delivery.record, LogRecord::default());
    }
}
