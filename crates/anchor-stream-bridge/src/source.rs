//! Message sources.
//!
//! The bridge consumes through a small trait so deployments ride Kafka
//! while tests ride an in-memory queue with identical semantics: fetch
//! up to `max` messages, waiting at most `timeout` for the first one.

use anchor::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use std::collections::VecDeque;
use std::time::Duration;

/// One message off the topic.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeMessage {
    pub payload: Vec<u8>,
    pub key: Option<String>,
    /// Broker timestamp when available.
    pub timestamp_ms: Option<i64>,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch up to `max` messages. Returns an empty batch on timeout;
    /// broker-level failures surface as `Transient`.
    async fn fetch(&self, max: usize, timeout: Duration) -> Result<Vec<BridgeMessage>>;
}

/// Kafka source over one subscribed topic.
pub struct KafkaMessageSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaMessageSource {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<KafkaMessageSource> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .create()
            .map_err(|err| Error::Transient(format!("kafka consumer create: {err}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|err| Error::Transient(format!("kafka subscribe {topic}: {err}")))?;
        Ok(KafkaMessageSource {
            consumer,
            topic: topic.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl MessageSource for KafkaMessageSource {
    async fn fetch(&self, max: usize, timeout: Duration) -> Result<Vec<BridgeMessage>> {
        let mut batch = Vec::with_capacity(max);
        let deadline = tokio::time::Instant::now() + timeout;
        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    batch.push(BridgeMessage {
                        payload: message.payload().unwrap_or_default().to_vec(),
                        key: message
                            .key()
                            .map(|k| String::from_utf8_lossy(k).into_owned()),
                        timestamp_ms: message.timestamp().to_millis(),
                    });
                }
                Ok(Err(err)) => {
                    return Err(Error::Transient(format!(
                        "kafka recv on {}: {err}",
                        self.topic
                    )))
                }
                Err(_) => break, // server-side timeout, return what we have
            }
        }
        Ok(batch)
    }
}

/// In-memory source for tests: push messages, the bridge drains them.
#[derive(Default)]
pub struct MemoryMessageSource {
    queue: Mutex<VecDeque<BridgeMessage>>,
    /// When set, the next fetch fails once with a transient error.
    poisoned: Mutex<Option<String>>,
}

impl MemoryMessageSource {
    pub fn new() -> MemoryMessageSource {
        MemoryMessageSource::default()
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        self.queue.lock().push_back(BridgeMessage {
            payload: payload.into(),
            key: None,
            timestamp_ms: Some(chrono::Utc::now().timestamp_millis()),
        });
    }

    pub fn poison(&self, error: impl Into<String>) {
        *self.poisoned.lock() = Some(error.into());
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[async_trait]
impl MessageSource for MemoryMessageSource {
    async fn fetch(&self, max: usize, _timeout: Duration) -> Result<Vec<BridgeMessage>> {
        if let Some(error) = self.poisoned.lock().take() {
            return Err(Error::Transient(error));
        }
        let mut queue = self.queue.lock();
        let take = queue.len().min(max);
        Ok(queue.drain(..take).collect())
    }
}
