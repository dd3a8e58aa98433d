//! The supervised consume -> transform -> insert loop.

use crate::source::MessageSource;
use anchor::adapter::Connection;
use anchor::prelude::*;
use anchor::transform::{transform_row, TransformRule};
use anchor::value::{row_from_json, Value};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Loop tunables. Defaults match the platform conventions: 100-message
/// batches, 5s server-side poll, 5s error backoff.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub topic: String,
    pub target_table: String,
    pub max_batch: usize,
    pub poll_timeout: Duration,
    pub error_backoff: Duration,
    pub rules: Vec<TransformRule>,
    pub transform_endpoint: Option<String>,
}

impl BridgeConfig {
    pub fn new(topic: impl Into<String>, target_table: impl Into<String>) -> BridgeConfig {
        BridgeConfig {
            topic: topic.into(),
            target_table: target_table.into(),
            max_batch: 100,
            poll_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            rules: Vec::new(),
            transform_endpoint: None,
        }
    }
}

/// Per-loop counters, updated atomically by the consumer task.
#[derive(Default)]
pub struct BridgeMetrics {
    pub messages_read: AtomicU64,
    pub messages_written: AtomicU64,
    pub messages_failed: AtomicU64,
    pub total_latency_ms: AtomicU64,
    pub last_message_unix_ms: AtomicI64,
}

/// Point-in-time copy for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeMetricsSnapshot {
    pub messages_read: u64,
    pub messages_written: u64,
    pub messages_failed: u64,
    pub total_latency_ms: u64,
    pub last_message_unix_ms: i64,
}

impl BridgeMetrics {
    pub fn snapshot(&self) -> BridgeMetricsSnapshot {
        BridgeMetricsSnapshot {
            messages_read: self.messages_read.load(Ordering::Relaxed),
            messages_written: self.messages_written.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
            last_message_unix_ms: self.last_message_unix_ms.load(Ordering::Relaxed),
        }
    }
}

/// A long-running consumer draining one topic into one target table.
pub struct StreamBridge {
    config: BridgeConfig,
    source: Arc<dyn MessageSource>,
    target: Arc<Connection>,
    metrics: Arc<BridgeMetrics>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamBridge {
    pub fn new(
        config: BridgeConfig,
        source: Arc<dyn MessageSource>,
        target: Arc<Connection>,
    ) -> StreamBridge {
        let (shutdown, _) = watch::channel(false);
        StreamBridge {
            config,
            source,
            target,
            metrics: Arc::new(BridgeMetrics::default()),
            running: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> BridgeMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the loop. Idempotent: a second start on a running bridge is
    /// a no-op.
    pub fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(topic = %self.config.topic, "bridge already running");
            return;
        }
        let config = self.config.clone();
        let source = Arc::clone(&self.source);
        let target = Arc::clone(&self.target);
        let metrics = Arc::clone(&self.metrics);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            info!(topic = %config.topic, table = %config.target_table, "stream bridge started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    outcome = run_batch(&config, source.as_ref(), &target, &metrics) => {
                        if let Err(err) = outcome {
                            warn!(topic = %config.topic, error = %err, "batch failed, backing off");
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                _ = tokio::time::sleep(config.error_backoff) => {}
                            }
                        }
                    }
                }
            }
            info!(topic = %config.topic, "stream bridge stopped");
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop with close-and-join: signal the loop, then wait for it to
    /// finish its in-flight batch and exit.
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown.send(true);
            let _ = handle.await;
        }
        self.running.store(false, Ordering::Release);
    }
}

async fn run_batch(
    config: &BridgeConfig,
    source: &dyn MessageSource,
    target: &Connection,
    metrics: &BridgeMetrics,
) -> anchor::Result<()> {
    let batch = source.fetch(config.max_batch, config.poll_timeout).await?;
    if batch.is_empty() {
        return Ok(());
    }
    let data = target.data()?;
    for message in batch {
        let started = tokio::time::Instant::now();
        metrics.messages_read.fetch_add(1, Ordering::Relaxed);
        if let Some(ts) = message.timestamp_ms {
            metrics.last_message_unix_ms.store(ts, Ordering::Relaxed);
        }

        let row = match decode_envelope(&message.payload) {
            Ok(row) => row,
            Err(err) => {
                warn!(topic = %config.topic, error = %err, "undecodable message, skipping");
                metrics.messages_failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let row = match transform_row(&row, &config.rules, config.transform_endpoint.as_deref())
            .await
        {
            Ok(row) => row,
            Err(err) => {
                warn!(topic = %config.topic, error = %err, "transform failed, writing original record");
                row
            }
        };
        let row = stringify_nested(row);

        match data.insert(&config.target_table, &[row]).await {
            Ok(_) => {
                metrics.messages_written.fetch_add(1, Ordering::Relaxed);
                metrics
                    .total_latency_ms
                    .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                metrics.messages_failed.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Envelope rule: a JSON object with a `data` sub-object contributes that
/// sub-object as the record; any other payload is wrapped under `data`.
fn decode_envelope(payload: &[u8]) -> anchor::Result<Row> {
    let json: serde_json::Value = serde_json::from_slice(payload)?;
    match json {
        serde_json::Value::Object(mut envelope) => {
            match envelope.remove("data") {
                Some(serde_json::Value::Object(data)) => {
                    Ok(row_from_json(serde_json::Value::Object(data)))
                }
                Some(other) => {
                    // `data` present but unstructured: keep it wrapped.
                    let mut row = Row::new();
                    row.insert("data".into(), Value::from_json(other));
                    Ok(row)
                }
                None => Ok(row_from_json(serde_json::Value::Object(envelope))),
            }
        }
        other => Ok(row_from_json(other)),
    }
}

/// Engines that take flat records get nested structures as JSON text.
fn stringify_nested(row: Row) -> Row {
    row.into_iter()
        .map(|(name, value)| match value {
            Value::List(_) | Value::Map(_) => {
                let rendered = value.to_json().to_string();
                (name, Value::String(rendered))
            }
            other => (name, other),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryMessageSource;
    use anchor::adapter::Adapter as _;
    use anchor::transform::TransformKind;
    use anchor_testing::MemoryAdapter;

    fn conn_config(id: &str) -> ConnectionConfig {
        ConnectionConfig {
            id: id.into(),
            engine: EngineType::Postgres,
            host: "localhost".into(),
            database: "testdb".into(),
            ..Default::default()
        }
    }

    fn lowercase_rule(field: &str) -> TransformRule {
        TransformRule {
            source: field.into(),
            target: field.into(),
            kind: TransformKind::Lowercase,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition never held");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn envelope_extracts_data_subobject() {
        let row = decode_envelope(br#"{"data": {"k": "V"}, "meta": 1}"#).unwrap();
        assert_eq!(row.get("k"), Some(&Value::String("V".into())));
        assert!(row.get("meta").is_none());
    }

    #[test]
    fn envelope_without_data_uses_whole_object() {
        let row = decode_envelope(br#"{"k": 1, "j": 2}"#).unwrap();
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn unstructured_payloads_wrap_under_data() {
        let row = decode_envelope(br#""bare text""#).unwrap();
        assert_eq!(row.get("data"), Some(&Value::String("bare text".into())));
    }

    #[test]
    fn nested_structures_become_json_strings() {
        let row = decode_envelope(br#"{"nested": {"a": 1}, "flat": 2}"#).unwrap();
        let flattened = stringify_nested(row);
        assert_eq!(
            flattened.get("nested"),
            Some(&Value::String(r#"{"a":1}"#.into()))
        );
        assert_eq!(flattened.get("flat"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn bridge_writes_transformed_records() {
        let adapter = MemoryAdapter::new();
        let target = Arc::new(adapter.connect(conn_config("db_bridge")).await.unwrap());
        let source = Arc::new(MemoryMessageSource::new());
        source.push(br#"{"data": {"k": "V"}}"#.to_vec());

        let mut config = BridgeConfig::new("events", "records");
        config.rules = vec![lowercase_rule("k")];
        config.poll_timeout = Duration::from_millis(20);
        let bridge = StreamBridge::new(config, Arc::clone(&source) as Arc<dyn MessageSource>, Arc::clone(&target));
        bridge.start();
        bridge.start(); // idempotent

        wait_for(|| bridge.metrics().messages_written == 1).await;
        bridge.stop().await;

        let rows = target.data().unwrap().fetch("records", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("k"), Some(&Value::String("v".into())));

        let metrics = bridge.metrics();
        assert_eq!(metrics.messages_read, 1);
        assert_eq!(metrics.messages_failed, 0);
        assert!(metrics.last_message_unix_ms > 0);
    }

    #[tokio::test]
    async fn undecodable_messages_count_as_failed_not_fatal() {
        let adapter = MemoryAdapter::new();
        let target = Arc::new(adapter.connect(conn_config("db_bad")).await.unwrap());
        let source = Arc::new(MemoryMessageSource::new());
        source.push(b"not json".to_vec());
        source.push(br#"{"k": 1}"#.to_vec());

        let mut config = BridgeConfig::new("events", "records");
        config.poll_timeout = Duration::from_millis(20);
        let bridge = StreamBridge::new(config, Arc::clone(&source) as Arc<dyn MessageSource>, Arc::clone(&target));
        bridge.start();

        wait_for(|| bridge.metrics().messages_written == 1).await;
        bridge.stop().await;

        let metrics = bridge.metrics();
        assert_eq!(metrics.messages_read, 2);
        assert_eq!(metrics.messages_failed, 1);
    }

    #[tokio::test]
    async fn transient_source_failure_backs_off_and_recovers() {
        let adapter = MemoryAdapter::new();
        let target = Arc::new(adapter.connect(conn_config("db_backoff")).await.unwrap());
        let source = Arc::new(MemoryMessageSource::new());
        source.poison("broker unavailable");
        source.push(br#"{"k": 1}"#.to_vec());

        let mut config = BridgeConfig::new("events", "records");
        config.poll_timeout = Duration::from_millis(20);
        config.error_backoff = Duration::from_millis(30);
        let bridge = StreamBridge::new(config, Arc::clone(&source) as Arc<dyn MessageSource>, Arc::clone(&target));
        bridge.start();

        wait_for(|| bridge.metrics().messages_written == 1).await;
        bridge.stop().await;
        assert!(source.is_empty());
    }
}
