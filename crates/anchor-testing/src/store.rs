//! Shared in-memory store behind the memory adapter.
//!
//! Tables are plain row vectors guarded by an RW-lock. Every mutation is
//! appended to a sequence-numbered change log and broadcast to live
//! replication sources, which is what makes checkpoint/resume testable
//! without a real WAL.

use anchor::prelude::*;
use anchor::replication::Provenance;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Mechanism tag reported by memory replication sources.
pub const MECHANISM: &str = "event_log";

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default)]
pub(crate) struct TableData {
    pub schema: Table,
    pub rows: Vec<Row>,
}

pub(crate) struct StoreInner {
    pub engine: EngineType,
    pub tables: RwLock<BTreeMap<String, TableData>>,
    pub databases: RwLock<BTreeSet<String>>,
    pub log: RwLock<Vec<(u64, CdcEvent)>>,
    seq: AtomicU64,
    events: broadcast::Sender<(u64, CdcEvent)>,
}

/// Handle to one in-memory engine. Cloning shares the underlying data, so a
/// test can mutate "externally" while a connection or replication source is
/// watching.
#[derive(Clone)]
pub struct MemoryStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new(engine: EngineType) -> MemoryStore {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MemoryStore {
            inner: Arc::new(StoreInner {
                engine,
                tables: RwLock::new(BTreeMap::new()),
                databases: RwLock::new(BTreeSet::new()),
                log: RwLock::new(Vec::new()),
                seq: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn engine(&self) -> EngineType {
        self.inner.engine
    }

    /// Highest sequence number assigned so far.
    pub fn head(&self) -> u64 {
        self.inner.seq.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<(u64, CdcEvent)> {
        self.inner.events.subscribe()
    }

    /// Log entries strictly after `position`, oldest first.
    pub(crate) fn log_after(&self, position: u64) -> Vec<(u64, CdcEvent)> {
        self.inner
            .log
            .read()
            .iter()
            .filter(|(seq, _)| *seq > position)
            .cloned()
            .collect()
    }

    pub(crate) fn record(&self, operation: CdcOperation, container: &str, fields: Row) -> u64 {
        let seq = self.inner.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let event = CdcEvent {
            operation,
            container: container.to_string(),
            fields,
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            provenance: Provenance {
                engine: self.inner.engine,
                mechanism: MECHANISM.to_string(),
            },
        };
        self.inner.log.write().push((seq, event.clone()));
        // No receivers is fine; the log is the durable record.
        let _ = self.inner.events.send((seq, event));
        seq
    }

    /// Test convenience: insert rows without going through a connection.
    /// Events are recorded after the table lock is released, matching the
    /// adapter's own lock order.
    pub fn insert_rows(&self, table: &str, rows: Vec<Row>) {
        {
            let mut tables = self.inner.tables.write();
            let data = tables.entry(table.to_string()).or_insert_with(|| TableData {
                schema: infer_schema(table, rows.first()),
                rows: Vec::new(),
            });
            data.rows.extend(rows.iter().cloned());
        }
        for row in rows {
            self.record(CdcOperation::Create, table, row);
        }
    }
}

pub(crate) fn infer_schema(table: &str, first_row: Option<&Row>) -> Table {
    let mut schema = Table::new(table);
    if let Some(row) = first_row {
        for (name, value) in row {
            let data_type = match value {
                Value::Bool(_) => UnifiedDataType::Boolean,
                Value::Int(_) => UnifiedDataType::Bigint,
                Value::Float(_) => UnifiedDataType::Float,
                Value::Bytes(_) => UnifiedDataType::Bytes,
                Value::Timestamp(_) => UnifiedDataType::Timestamp,
                Value::List(_) | Value::Map(_) => UnifiedDataType::Json,
                Value::Null | Value::String(_) => UnifiedDataType::String,
            };
            schema.columns.push(Column::new(name.clone(), data_type));
        }
    }
    schema
}
