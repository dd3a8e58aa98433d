//! Keyspace-notification replication.
//!
//! Pub/sub carries no history, so this mechanism cannot resume: the source
//! declares `resume_capable = false`, `get_position` always returns the
//! empty token, and `set_position` is a typed unsupported error. Write
//! commands surface as `Upsert` with the key's current hash as end-state;
//! `del`/`expired`/`evicted` surface as `Delete` carrying only `_key`.

use crate::redis_adapter::RedisHandle;
use anchor::adapter::{ConnState, ReplicationOperator};
use anchor::prelude::*;
use anchor::replication::Provenance;
use anchor::transform::transform_row;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub const MECHANISM: &str = "keyspace_notification";

pub(crate) struct RedisReplication {
    state: Arc<ConnState>,
    handle: Arc<RedisHandle>,
}

impl RedisReplication {
    pub(crate) fn new(state: Arc<ConnState>, handle: Arc<RedisHandle>) -> RedisReplication {
        RedisReplication { state, handle }
    }
}

#[async_trait]
impl ReplicationOperator for RedisReplication {
    fn is_supported(&self) -> bool {
        true
    }

    fn supported_mechanisms(&self) -> Vec<String> {
        vec![MECHANISM.to_string()]
    }

    async fn check_prerequisites(&self) -> Result<()> {
        self.state.ensure_open()?;
        let mut conn = self.handle.conn();
        let config: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("notify-keyspace-events")
            .query_async(&mut conn)
            .await
            .map_err(|err| Error::query("CONFIG GET notify-keyspace-events", err))?;
        let flags = config.get(1).cloned().unwrap_or_default();
        // K = keyspace channel, A = all event classes (or at least g+h+x).
        let keyspace = flags.contains('K');
        let classes = flags.contains('A') || (flags.contains('g') && flags.contains('h'));
        if !(keyspace && classes) {
            return Err(Error::InvalidConfiguration(format!(
                "notify-keyspace-events is {flags:?}; need at least \"KA\" for capture"
            )));
        }
        Ok(())
    }

    async fn connect(&self, config: ReplicationConfig) -> Result<Arc<dyn ReplicationSource>> {
        self.state.ensure_open()?;
        if config.start_position.is_some() {
            return Err(Error::unsupported(
                EngineType::Redis,
                "set_position",
                "keyspace notifications are fire-and-forget; there is no history to resume from",
            ));
        }
        Ok(Arc::new(RedisSource::new(Arc::clone(&self.handle), config)))
    }

    async fn status(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut status = BTreeMap::new();
        status.insert("mechanism".into(), Value::String(MECHANISM.into()));
        Ok(status)
    }

    async fn lag(&self) -> Result<ReplicationLag> {
        Ok(ReplicationLag::Unknown)
    }

    async fn list_slots(&self) -> Result<Vec<String>> {
        Err(Error::unsupported(
            EngineType::Redis,
            "list_slots",
            "keyspace notifications have no slot objects",
        ))
    }

    async fn drop_slot(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported(
            EngineType::Redis,
            "drop_slot",
            "keyspace notifications have no slot objects",
        ))
    }

    async fn list_publications(&self) -> Result<Vec<String>> {
        Err(Error::unsupported(
            EngineType::Redis,
            "list_publications",
            "keyspace notifications have no publication objects",
        ))
    }

    async fn drop_publication(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported(
            EngineType::Redis,
            "drop_publication",
            "keyspace notifications have no publication objects",
        ))
    }

    /// Raw events are `<channel>\n<command>` pairs as published on
    /// `__keyspace@<db>__:<key>`.
    fn parse_event(&self, raw: &[u8]) -> Result<CdcEvent> {
        let text = std::str::from_utf8(raw)
            .map_err(|err| Error::InvalidConfiguration(format!("non-utf8 notification: {err}")))?;
        let (channel, command) = text.split_once('\n').ok_or_else(|| {
            Error::InvalidConfiguration("notification must be <channel>\\n<command>".into())
        })?;
        let key = channel
            .split_once("__:")
            .map(|(_, key)| key)
            .unwrap_or(channel);
        let (container, operation) = classify(key, command);
        let mut fields = Row::new();
        fields.insert("_key".into(), Value::String(key.to_string()));
        Ok(CdcEvent {
            operation,
            container,
            fields,
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            provenance: Provenance {
                engine: EngineType::Redis,
                mechanism: MECHANISM.to_string(),
            },
        })
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<u64> {
        self.state.ensure_open()?;
        let Some(Value::String(key)) = event.fields.get("_key") else {
            return Err(Error::InvalidConfiguration(
                "redis apply needs a _key field".into(),
            ));
        };
        let mut conn = self.handle.conn();
        match event.operation {
            CdcOperation::Delete => {
                let removed: i64 = redis::cmd("DEL")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| Error::query("DEL", err))?;
                Ok(removed as u64)
            }
            _ => {
                let fields: Vec<(String, String)> = event
                    .fields
                    .iter()
                    .filter(|(name, _)| name.as_str() != "_key")
                    .map(|(name, value)| (name.clone(), value.to_parameter_string()))
                    .collect();
                if fields.is_empty() {
                    return Ok(0);
                }
                redis::cmd("HSET")
                    .arg(key)
                    .arg(&fields)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|err| Error::query("HSET", err))?;
                Ok(1)
            }
        }
    }
}

fn classify(key: &str, command: &str) -> (String, CdcOperation) {
    let container = key.split_once(':').map(|(p, _)| p).unwrap_or(key).to_string();
    let operation = match command {
        "del" | "expired" | "evicted" => CdcOperation::Delete,
        // Write commands cannot be split into insert-vs-update.
        _ => CdcOperation::Upsert,
    };
    (container, operation)
}

/// A running keyspace-notification source.
pub struct RedisSource {
    handle: Arc<RedisHandle>,
    config: ReplicationConfig,
    active: AtomicBool,
    status: RwLock<SourceStatus>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisSource {
    fn new(handle: Arc<RedisHandle>, config: ReplicationConfig) -> RedisSource {
        let (shutdown, _) = watch::channel(false);
        RedisSource {
            handle,
            config,
            active: AtomicBool::new(false),
            status: RwLock::new(SourceStatus::Created),
            shutdown,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ReplicationSource for RedisSource {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn status(&self) -> SourceStatus {
        *self.status.read()
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            mechanism: MECHANISM.to_string(),
            resume_capable: false,
            operations: vec![CdcOperation::Upsert, CdcOperation::Delete],
            ordered_across_containers: false,
            extra: BTreeMap::new(),
        }
    }

    async fn start(&self) -> Result<()> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyExists(format!(
                "replication source {} already active",
                self.config.id
            )));
        }
        if *self.status.read() == SourceStatus::Stopped {
            self.active.store(false, Ordering::Release);
            return Err(Error::Fatal("source is stopped".into()));
        }

        let mut pubsub = self
            .handle
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| {
                Error::connection(EngineType::Redis, &self.handle.host, self.handle.port, err)
            })?;
        let db = self.handle.db_index;
        let patterns: Vec<String> = if self.config.containers.is_empty() {
            vec![format!("__keyspace@{db}__:*")]
        } else {
            self.config
                .containers
                .iter()
                .map(|prefix| format!("__keyspace@{db}__:{prefix}:*"))
                .collect()
        };
        for pattern in &patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .map_err(|err| Error::query("PSUBSCRIBE", err))?;
        }

        let handle = Arc::clone(&self.handle);
        let config = self.config.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = messages.next() => {
                        let Some(message) = message else { break };
                        let channel: String = message.get_channel_name().to_string();
                        let command: String = match message.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                warn!(error = %err, "undecodable notification payload");
                                continue;
                            }
                        };
                        let key = channel
                            .split_once("__:")
                            .map(|(_, key)| key)
                            .unwrap_or(&channel)
                            .to_string();
                        let (container, operation) = classify(&key, &command);
                        let mut fields = Row::new();
                        fields.insert("_key".into(), Value::String(key.clone()));
                        if operation != CdcOperation::Delete {
                            // End-state read; the key may already be gone.
                            match handle.read_hash(&key).await {
                                Ok(row) => fields = row,
                                Err(err) => {
                                    warn!(error = %err, key = %key, "failed to read end-state");
                                }
                            }
                        }
                        if !config.rules.is_empty() {
                            match transform_row(&fields, &config.rules, config.transform_endpoint.as_deref()).await {
                                Ok(transformed) => fields = transformed,
                                Err(err) => warn!(error = %err, "transform failed, delivering original row"),
                            }
                        }
                        let event = CdcEvent {
                            operation,
                            container,
                            fields,
                            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                            provenance: Provenance {
                                engine: EngineType::Redis,
                                mechanism: MECHANISM.to_string(),
                            },
                        };
                        (config.on_event)(event).await;
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
        *self.status.write() = SourceStatus::Active;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let task = self.task.lock().take();
        self.active.store(false, Ordering::Release);
        *self.status.write() = SourceStatus::Stopped;
        if let Some(task) = task {
            let _ = self.shutdown.send(true);
            let _ = task.await;
        }
        Ok(())
    }

    async fn get_position(&self) -> Result<String> {
        // No history, no token.
        Ok(String::new())
    }

    async fn set_position(&self, _token: &str) -> Result<()> {
        Err(Error::unsupported(
            EngineType::Redis,
            "set_position",
            "keyspace notifications are fire-and-forget; there is no history to resume from",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_splits_prefix_and_operation() {
        assert_eq!(
            classify("users:42", "hset"),
            ("users".to_string(), CdcOperation::Upsert)
        );
        assert_eq!(
            classify("users:42", "del"),
            ("users".to_string(), CdcOperation::Delete)
        );
        assert_eq!(
            classify("lonekey", "expired"),
            ("lonekey".to_string(), CdcOperation::Delete)
        );
    }
}
