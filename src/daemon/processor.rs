//! Log Processor
//!
//! Drains the ingest queue into the index. A single dispatcher task
//! dequeues records and spawns one indexing task per record, with at most
//! `max_concurrency` in flight. Shutdown waits for the dispatcher to see the
//! queue closed and for every spawned task to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::index::IndexLifecycleManager;
use crate::queue::{Queue, QueueError};

/// Pause after a broker error before dequeuing again
const BROKER_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    indexed: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
}

/// Point-in-time processor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub dispatched: u64,
    pub indexed: u64,
    pub dropped: u64,
    pub decode_errors: u64,
}

pub struct LogProcessor {
    queue: Arc<dyn Queue>,
    ilm: Arc<IndexLifecycleManager>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    counters: Arc<Counters>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LogProcessor {
    pub fn new(
        queue: Arc<dyn Queue>,
        ilm: Arc<IndexLifecycleManager>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            queue,
            ilm,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tracker: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Launch the dispatcher loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }

        let queue = self.queue.clone();
        let ilm = self.ilm.clone();
        let semaphore = self.semaphore.clone();
        let tracker = self.tracker.clone();
        let counters = self.counters.clone();

        *dispatcher = Some(tokio::spawn(async move {
            dispatch(queue, ilm, semaphore, tracker, counters).await;
        }));
        info!(
            max_concurrency = self.semaphore.available_permits(),
            "log processor started"
        );
    }

    /// Wait for every dispatched record to be processed.
    ///
    /// The queue must be closed first: the dispatcher only exits once
    /// dequeue reports the queue closed, so this waits forever on an open
    /// queue.
    pub async fn shutdown(&self) {
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("processor dispatcher task failed: {}", e);
            }
        }

        self.tracker.close();
        self.tracker.wait().await;

        let stats = self.stats();
        info!(
            dispatched = stats.dispatched,
            indexed = stats.indexed,
            dropped = stats.dropped,
            "log processor drained"
        );
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            indexed: self.counters.indexed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
        }
    }

    /// Records currently being indexed
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

async fn dispatch(
    queue: Arc<dyn Queue>,
    ilm: Arc<IndexLifecycleManager>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    counters: Arc<Counters>,
) {
    loop {
        let delivery = match queue.dequeue().await {
            Ok(delivery) => delivery,
            Err(QueueError::Closed) => {
                debug!("queue closed, dispatcher exiting");
                break;
            }
            Err(QueueError::Decode(e)) => {
                counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("discarding undecodable queue message: {}", e);
                continue;
            }
            Err(e) => {
                warn!("dequeue failed: {}", e);
                tokio::time::sleep(BROKER_BACKOFF).await;
                continue;
            }
        };

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let ilm = ilm.clone();
        let counters = counters.clone();
        tracker.spawn(async move {
            let _permit = permit;

            let settled = if ilm.index_with_retry(&delivery.record).await {
                counters.indexed.fetch_add(1, Ordering::Relaxed);
                delivery.ack().await
            } else {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                delivery.reject().await
            };

            if let Err(e) = settled {
                warn!("failed to settle queue delivery: {}", e);
            }
        });
    }
}
