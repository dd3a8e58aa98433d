//! Replication over the memory store's change log.
//!
//! The store assigns a global sequence number to every mutation; a source's
//! continuation token is that number as a decimal string. Resuming replays
//! log entries after the token and then follows the live broadcast, which
//! yields the same at-least-once semantics a WAL slot gives.

use crate::store::{MemoryStore, MECHANISM};
use anchor::adapter::{ConnState, ReplicationOperator};
use anchor::prelude::*;
use anchor::transform::transform_row;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub struct MemoryReplication {
    state: Arc<ConnState>,
    store: MemoryStore,
}

impl MemoryReplication {
    pub fn new(state: Arc<ConnState>, store: MemoryStore) -> MemoryReplication {
        MemoryReplication { state, store }
    }
}

#[async_trait]
impl ReplicationOperator for MemoryReplication {
    fn is_supported(&self) -> bool {
        true
    }

    fn supported_mechanisms(&self) -> Vec<String> {
        vec![MECHANISM.to_string()]
    }

    async fn check_prerequisites(&self) -> Result<()> {
        self.state.ensure_open()
    }

    async fn connect(&self, config: ReplicationConfig) -> Result<Arc<dyn ReplicationSource>> {
        self.state.ensure_open()?;
        Ok(Arc::new(MemorySource::new(self.store.clone(), config)?))
    }

    async fn status(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut status = BTreeMap::new();
        status.insert("mechanism".into(), Value::String(MECHANISM.into()));
        status.insert("head".into(), Value::Int(self.store.head() as i64));
        Ok(status)
    }

    async fn lag(&self) -> Result<ReplicationLag> {
        Ok(ReplicationLag::Bytes(0))
    }

    async fn list_slots(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn drop_slot(&self, name: &str) -> Result<()> {
        Err(Error::NotFound(format!("slot {name}")))
    }

    async fn list_publications(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn drop_publication(&self, name: &str) -> Result<()> {
        Err(Error::NotFound(format!("publication {name}")))
    }

    fn parse_event(&self, raw: &[u8]) -> Result<CdcEvent> {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        let operation = match value.get("operation").and_then(|v| v.as_str()) {
            Some("create") => CdcOperation::Create,
            Some("update") => CdcOperation::Update,
            Some("delete") => CdcOperation::Delete,
            Some("upsert") | None => CdcOperation::Upsert,
            Some(other) => {
                return Err(Error::InvalidConfiguration(format!(
                    "unknown cdc operation {other:?}"
                )))
            }
        };
        let container = value
            .get("container")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let fields = value
            .get("fields")
            .cloned()
            .map(anchor::value::row_from_json)
            .unwrap_or_default();
        Ok(CdcEvent {
            operation,
            container,
            fields,
            timestamp_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            provenance: anchor::replication::Provenance {
                engine: self.store.engine(),
                mechanism: MECHANISM.to_string(),
            },
        })
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<u64> {
        self.state.ensure_open()?;
        match event.operation {
            CdcOperation::Create => {
                self.store
                    .insert_rows(&event.container, vec![event.fields.clone()]);
                Ok(1)
            }
            CdcOperation::Update | CdcOperation::Upsert => {
                // Apply end-state keyed on `id` when present, append otherwise.
                if event.fields.contains_key("id") {
                    let mut tables = self.store.inner.tables.write();
                    if let Some(data) = tables.get_mut(&event.container) {
                        if let Some(row) = data
                            .rows
                            .iter_mut()
                            .find(|r| r.get("id") == event.fields.get("id"))
                        {
                            for (k, v) in &event.fields {
                                row.insert(k.clone(), v.clone());
                            }
                            return Ok(1);
                        }
                    }
                }
                self.store
                    .insert_rows(&event.container, vec![event.fields.clone()]);
                Ok(1)
            }
            CdcOperation::Delete => {
                let mut tables = self.store.inner.tables.write();
                let Some(data) = tables.get_mut(&event.container) else {
                    return Ok(0);
                };
                let before = data.rows.len();
                data.rows
                    .retain(|row| !event.fields.iter().all(|(k, v)| row.get(k) == Some(v)));
                Ok((before - data.rows.len()) as u64)
            }
        }
    }
}

/// A running source over the store's change log.
pub struct MemorySource {
    store: MemoryStore,
    config: ReplicationConfig,
    active: AtomicBool,
    status: RwLock<SourceStatus>,
    /// Last delivered sequence number.
    position: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemorySource {
    fn new(store: MemoryStore, config: ReplicationConfig) -> Result<MemorySource> {
        let position = match &config.start_position {
            Some(token) => token.parse::<u64>().map_err(|_| {
                Error::InvalidConfiguration(format!("bad continuation token {token:?}"))
            })?,
            None => store.head(),
        };
        let (shutdown, _) = watch::channel(false);
        Ok(MemorySource {
            store,
            config,
            active: AtomicBool::new(false),
            status: RwLock::new(SourceStatus::Created),
            position: Arc::new(AtomicU64::new(position)),
            shutdown,
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ReplicationSource for MemorySource {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn status(&self) -> SourceStatus {
        *self.status.read()
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            mechanism: MECHANISM.to_string(),
            resume_capable: true,
            operations: vec![
                CdcOperation::Create,
                CdcOperation::Update,
                CdcOperation::Delete,
            ],
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

        // Subscribe before the backlog snapshot so nothing between the two
        // is lost; duplicates are filtered by sequence number below.
        let mut live = self.store.subscribe();
        let backlog = self.store.log_after(self.position.load(Ordering::Acquire));

        let store = self.store.clone();
        let config = self.config.clone();
        let position = Arc::clone(&self.position);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            for (seq, event) in backlog {
                deliver(&config, &position, seq, event).await;
            }
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = live.recv() => match received {
                        Ok((seq, event)) => {
                            if seq <= position.load(Ordering::Acquire) {
                                continue;
                            }
                            deliver(&config, &position, seq, event).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            // Fall back to the log for anything the channel
                            // dropped.
                            warn!(missed, "event channel lagged, replaying from log");
                            for (seq, event) in store.log_after(position.load(Ordering::Acquire)) {
                                deliver(&config, &position, seq, event).await;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        *self.task.lock() = Some(handle);
        *self.status.write() = SourceStatus::Active;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let handle = self.task.lock().take();
        self.active.store(false, Ordering::Release);
        *self.status.write() = SourceStatus::Stopped;
        if let Some(handle) = handle {
            let _ = self.shutdown.send(true);
            let _ = handle.await;
        }
        Ok(())
    }

    async fn get_position(&self) -> Result<String> {
        Ok(self.position.load(Ordering::Acquire).to_string())
    }

    async fn set_position(&self, token: &str) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            return Err(Error::InvalidConfiguration(
                "cannot reposition an active source".into(),
            ));
        }
        let seq = token.parse::<u64>().map_err(|_| {
            Error::InvalidConfiguration(format!("bad continuation token {token:?}"))
        })?;
        self.position.store(seq, Ordering::Release);
        Ok(())
    }
}

/// Filter, transform, and hand one event to the callback. The position
/// advances for filtered events too, so checkpoints never point at
/// containers the source does not watch.
async fn deliver(config: &ReplicationConfig, position: &AtomicU64, seq: u64, mut event: CdcEvent) {
    if !config.containers.is_empty() && !config.containers.contains(&event.container) {
        position.store(seq, Ordering::Release);
        return;
    }
    if !config.rules.is_empty() {
        match transform_row(
            &event.fields,
            &config.rules,
            config.transform_endpoint.as_deref(),
        )
        .await
        {
            Ok(fields) => event.fields = fields,
            Err(err) => {
                warn!(error = %err, container = %event.container, "transform failed, delivering original row");
            }
        }
    }
    (config.on_event)(event).await;
    position.store(seq, Ordering::Release);
    if let Some(checkpoint) = &config.on_checkpoint {
        checkpoint(seq.to_string()).await;
    }
}
