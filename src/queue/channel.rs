//! In-process channel queue

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use super::{Delivery, Queue, QueueError};
use crate::types::LogRecord;

/// Bounded tokio channel. With capacity 1 a producer waits as soon as one
/// record is pending, so slow consumers push back on ingest immediately.
/// Nothing survives a crash.
pub struct ChannelQueue {
    sender: Mutex<Option<mpsc::Sender<LogRecord>>>,
    receiver: AsyncMutex<mpsc::Receiver<LogRecord>>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: AsyncMutex::new(rx),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

#[async_trait]
impl Queue for ChannelQueue {
    async fn enqueue(&self, record: LogRecord) -> Result<(), QueueError> {
        let sender = self.sender.lock().clone().ok_or(QueueError::Closed)?;
        sender.send(record).await.map_err(|_| QueueError::Closed)
    }

    async fn dequeue(&self) -> Result<Delivery, QueueError> {
        let mut receiver = self.receiver.lock().await;
        receiver
            .recv()
            .await
            .map(Delivery::unacked)
            .ok_or(QueueError::Closed)
    }

    async fn close(&self) {
        // Dropping the last sender ends the stream once buffered records drain
        if self.sender.lock().take().is_some() {
            debug!("channel queue closed");
        }
    }
}
