//! NATS JetStream queue
//!
//! Records are published as JSON to a durable stream and consumed through a
//! durable pull consumer with explicit acknowledgment. A record that is
//! dequeued but never acked is redelivered after the ack wait, which is safe
//! because indexing is an upsert on the record's deterministic id.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Acker, Delivery, Queue, QueueError};
use crate::config::NatsConfig;
use crate::types::LogRecord;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RECONNECTS: usize = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const ACK_WAIT: Duration = Duration::from_secs(30);

fn broker_err(e: impl std::fmt::Display) -> QueueError {
    QueueError::Broker(e.to_string())
}

/// Client handle and JetStream context; `None` once closed
struct Connection {
    client: async_nats::Client,
    context: jetstream::Context,
}

pub struct NatsQueue {
    connection: RwLock<Option<Connection>>,
    subject: String,
    messages: Mutex<Option<pull::Stream>>,
    cancel: CancellationToken,
}

impl NatsQueue {
    /// Connect, then create or reuse the stream and durable consumer
    pub async fn connect(config: &NatsConfig) -> Result<Self, QueueError> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(CONNECT_TIMEOUT)
            .max_reconnects(MAX_RECONNECTS)
            .reconnect_delay_callback(|_attempts| RECONNECT_DELAY)
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Connected => info!("NATS reconnected"),
                    async_nats::Event::Disconnected => warn!("NATS disconnected"),
                    other => warn!("NATS event: {}", other),
                }
            })
            .connect(config.url.as_str())
            .await
            .map_err(broker_err)?;
        info!(url = %config.url, "connected to NATS");

        let context = jetstream::new(client.clone());
        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream.clone(),
                subjects: vec![config.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(broker_err)?;

        let consumer = stream
            .get_or_create_consumer(
                &config.consumer,
                pull::Config {
                    durable_name: Some(config.consumer.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    filter_subject: config.subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(broker_err)?;

        let messages = consumer.messages().await.map_err(broker_err)?;
        info!(
            stream = %config.stream,
            consumer = %config.consumer,
            subject = %config.subject,
            "subscribed to JetStream consumer"
        );

        Ok(Self {
            connection: RwLock::new(Some(Connection { client, context })),
            subject: config.subject.clone(),
            messages: Mutex::new(Some(messages)),
            cancel: CancellationToken::new(),
        })
    }
}

impl NatsQueue {
    /// True once [`Queue::close`] has released the connection
    pub fn is_closed(&self) -> bool {
        self.connection.read().is_none()
    }
}

#[async_trait]
impl Queue for NatsQueue {
    async fn enqueue(&self, record: LogRecord) -> Result<(), QueueError> {
        let context = self
            .connection
            .read()
            .as_ref()
            .map(|c| c.context.clone())
            .ok_or(QueueError::Closed)?;

        let payload = serde_json::to_vec(&record).map_err(QueueError::Encode)?;
        let ack = context
            .publish(self.subject.clone(), Bytes::from(payload))
            .await
            .map_err(broker_err)?
            .await
            .map_err(broker_err)?;

        debug!(stream = %ack.stream, sequence = ack.sequence, "published record");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Delivery, QueueError> {
        let mut guard = tokio::select! {
            guard = self.messages.lock() => guard,
            _ = self.cancel.cancelled() => return Err(QueueError::Closed),
        };
        let Some(messages) = guard.as_mut() else {
            return Err(QueueError::Closed);
        };

        let next = tokio::select! {
            next = messages.next() => next,
            _ = self.cancel.cancelled() => return Err(QueueError::Closed),
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(broker_err(e)),
            None => return Err(QueueError::Closed),
        };

        match serde_json::from_slice::<LogRecord>(&message.payload) {
            Ok(record) => Ok(Delivery::with_acker(record, Box::new(JetStreamAcker(message)))),
            Err(e) => {
                // Undecodable payloads would be redelivered forever
                if let Err(term_err) = message.ack_with(AckKind::Term).await {
                    warn!("failed to terminate undecodable message: {}", term_err);
                }
                Err(QueueError::Decode(e))
            }
        }
    }

    /// Unsubscribe, flush pending publishes, then drop every handle on the
    /// connection so it disconnects.
    async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.messages.lock().await.take();

        let connection = self.connection.write().take();
        if let Some(Connection { client, context }) = connection {
            drop(context);
            if let Err(e) = client.flush().await {
                warn!("failed to flush NATS connection on close: {}", e);
            }
        }
        info!("NATS queue closed and disconnected");
    }
}

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.0.ack().await.map_err(broker_err)
    }

    async fn reject(self: Box<Self>) -> Result<(), QueueError> {
        self.0.ack_with(AckKind::Term).await.map_err(broker_err)
    }
}
