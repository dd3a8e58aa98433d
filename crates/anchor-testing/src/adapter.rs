//! The in-memory engine adapter.
//!
//! Implements the full operator surface over [`MemoryStore`] so invariant
//! tests for registries and coordinators run hermetically. The adapter can
//! masquerade as any engine tag, and an append-only variant mimics
//! columnar stores that refuse row updates.

use crate::replication::MemoryReplication;
use crate::store::{infer_schema, MemoryStore, TableData};
use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, InstanceOperator,
    MetadataOperator, NativeHandle, ReplicationOperator, SchemaOperator, StreamParams,
    StreamResult, UnsupportedReplication,
};
use anchor::prelude::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Adapter over a shared [`MemoryStore`].
pub struct MemoryAdapter {
    engine: EngineType,
    store: MemoryStore,
    append_only: bool,
}

impl MemoryAdapter {
    /// Full-capability adapter masquerading as PostgreSQL.
    pub fn new() -> MemoryAdapter {
        MemoryAdapter::with_engine(EngineType::Postgres)
    }

    pub fn with_engine(engine: EngineType) -> MemoryAdapter {
        MemoryAdapter {
            engine,
            store: MemoryStore::new(engine),
            append_only: false,
        }
    }

    /// Append-only variant: inserts succeed, updates and deletes fail the
    /// way a columnar engine refuses them.
    pub fn append_only() -> MemoryAdapter {
        MemoryAdapter {
            engine: EngineType::ClickHouse,
            store: MemoryStore::new(EngineType::ClickHouse),
            append_only: true,
        }
    }

    /// The backing store, for out-of-band mutation and inspection.
    pub fn store(&self) -> MemoryStore {
        self.store.clone()
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        MemoryAdapter::new()
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn engine(&self) -> EngineType {
        self.engine
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        let state = ConnState::new(config.id.clone(), self.engine);
        let ops = Arc::new(MemoryOps {
            state: Arc::clone(&state),
            store: self.store.clone(),
            database: config.database.clone(),
            append_only: self.append_only,
        });
        let replication: Arc<dyn ReplicationOperator> = if self.append_only {
            Arc::new(UnsupportedReplication::new(
                self.engine,
                "append-only engine exposes no change log",
            ))
        } else {
            Arc::new(MemoryReplication::new(
                Arc::clone(&state),
                self.store.clone(),
            ))
        };
        Ok(Connection::new(
            config,
            state,
            Arc::clone(&ops) as Arc<dyn NativeHandle>,
            Arc::clone(&ops) as Arc<dyn SchemaOperator>,
            Arc::clone(&ops) as Arc<dyn DataOperator>,
            Arc::clone(&ops) as Arc<dyn MetadataOperator>,
            replication,
        ))
    }

    async fn connect_instance(&self, config: InstanceConfig) -> Result<InstanceConnection> {
        config.validate()?;
        let state = ConnState::new(config.id.clone(), self.engine);
        let ops = Arc::new(MemoryOps {
            state: Arc::clone(&state),
            store: self.store.clone(),
            database: String::new(),
            append_only: self.append_only,
        });
        Ok(InstanceConnection::new(
            config,
            state,
            Arc::clone(&ops) as Arc<dyn NativeHandle>,
            Arc::clone(&ops) as Arc<dyn InstanceOperator>,
            ops as Arc<dyn MetadataOperator>,
        ))
    }
}

struct MemoryOps {
    state: Arc<ConnState>,
    store: MemoryStore,
    database: String,
    append_only: bool,
}

impl MemoryOps {
    fn engine(&self) -> EngineType {
        self.store.engine()
    }
}

fn row_matches(row: &Row, conditions: &Row) -> bool {
    conditions.iter().all(|(k, v)| row.get(k) == Some(v))
}

fn project(row: &Row, columns: &[String]) -> Row {
    if columns.is_empty() {
        return row.clone();
    }
    columns
        .iter()
        .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
        .collect()
}

#[async_trait]
impl NativeHandle for MemoryOps {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SchemaOperator for MemoryOps {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new(self.database.clone());
        for (name, data) in self.store.inner.tables.read().iter() {
            let mut table = data.schema.clone();
            table.name = name.clone();
            model.add_table(table);
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        let mut tables = self.store.inner.tables.write();
        for (name, table) in &model.tables {
            tables.entry(name.clone()).or_insert_with(|| TableData {
                schema: table.clone(),
                rows: Vec::new(),
            });
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        Ok(self.store.inner.tables.read().keys().cloned().collect())
    }

    async fn get_table_schema(&self, table: &str) -> Result<Table> {
        self.state.ensure_open()?;
        self.store
            .inner
            .tables
            .read()
            .get(table)
            .map(|data| {
                let mut schema = data.schema.clone();
                schema.name = table.to_string();
                schema
            })
            .ok_or_else(|| Error::NotFound(format!("table {table}")))
    }
}

#[async_trait]
impl DataOperator for MemoryOps {
    async fn fetch(&self, table: &str, limit: usize) -> Result<Vec<Row>> {
        self.fetch_with_columns(table, &[], limit).await
    }

    async fn fetch_with_columns(
        &self,
        table: &str,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        let tables = self.store.inner.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| Error::NotFound(format!("table {table}")))?;
        Ok(data
            .rows
            .iter()
            .take(limit)
            .map(|row| project(row, columns))
            .collect())
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        {
            let mut tables = self.store.inner.tables.write();
            let data = tables.entry(table.to_string()).or_insert_with(|| TableData {
                schema: infer_schema(table, rows.first()),
                rows: Vec::new(),
            });
            data.rows.extend(rows.iter().cloned());
        }
        for row in rows {
            self.store.record(CdcOperation::Create, table, row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if self.append_only {
            return Err(Error::unsupported(
                self.engine(),
                "update",
                "parts are immutable once written; rewrite the partition instead",
            ));
        }
        if rows.is_empty() {
            return Ok(0);
        }
        if where_columns.is_empty() {
            return Err(Error::InvalidConfiguration(
                "update requires at least one where column".into(),
            ));
        }
        let mut affected = 0u64;
        let mut events = Vec::new();
        {
            let mut tables = self.store.inner.tables.write();
            let data = tables
                .get_mut(table)
                .ok_or_else(|| Error::NotFound(format!("table {table}")))?;
            for update in rows {
                let conditions: Row = where_columns
                    .iter()
                    .filter_map(|c| update.get(c).map(|v| (c.clone(), v.clone())))
                    .collect();
                if conditions.len() != where_columns.len() {
                    return Err(Error::InvalidConfiguration(
                        "update row is missing a where column".into(),
                    ));
                }
                for row in data.rows.iter_mut().filter(|r| row_matches(r, &conditions)) {
                    for (k, v) in update {
                        if !where_columns.contains(k) {
                            row.insert(k.clone(), v.clone());
                        }
                    }
                    affected += 1;
                    events.push(row.clone());
                }
            }
        }
        for row in events {
            self.store.record(CdcOperation::Update, table, row);
        }
        Ok(affected)
    }

    async fn upsert(&self, table: &str, rows: &[Row], unique_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        if unique_columns.is_empty() {
            return Err(Error::InvalidConfiguration(
                "upsert requires at least one unique column".into(),
            ));
        }
        let mut events = Vec::new();
        {
            let mut tables = self.store.inner.tables.write();
            let data = tables.entry(table.to_string()).or_insert_with(|| TableData {
                schema: infer_schema(table, rows.first()),
                rows: Vec::new(),
            });
            for row in rows {
                let key: Row = unique_columns
                    .iter()
                    .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                    .collect();
                match data.rows.iter_mut().find(|r| row_matches(r, &key)) {
                    Some(existing) => {
                        for (k, v) in row {
                            if !unique_columns.contains(k) {
                                existing.insert(k.clone(), v.clone());
                            }
                        }
                        events.push((CdcOperation::Update, existing.clone()));
                    }
                    None => {
                        data.rows.push(row.clone());
                        events.push((CdcOperation::Create, row.clone()));
                    }
                }
            }
        }
        for (op, row) in events {
            self.store.record(op, table, row);
        }
        // 1 per input row, insert or update alike.
        Ok(rows.len() as u64)
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if self.append_only {
            return Err(Error::unsupported(
                self.engine(),
                "delete",
                "rows expire through the retention policy, not row deletes",
            ));
        }
        if conditions.is_empty() {
            return Ok(0);
        }
        let removed: Vec<Row>;
        {
            let mut tables = self.store.inner.tables.write();
            let data = tables
                .get_mut(table)
                .ok_or_else(|| Error::NotFound(format!("table {table}")))?;
            let (matched, kept): (Vec<Row>, Vec<Row>) = data
                .rows
                .drain(..)
                .partition(|row| row_matches(row, conditions));
            data.rows = kept;
            removed = matched;
        }
        let affected = removed.len() as u64;
        for row in removed {
            self.store.record(CdcOperation::Delete, table, row);
        }
        Ok(affected)
    }

    async fn stream(&self, params: &StreamParams) -> Result<StreamResult> {
        self.state.ensure_open()?;
        if params.filter.is_some() {
            return Err(Error::unsupported(
                self.engine(),
                "stream",
                "filter predicates are not part of the memory engine",
            ));
        }
        let offset = params.offset()?;
        let tables = self.store.inner.tables.read();
        let data = tables
            .get(&params.table)
            .ok_or_else(|| Error::NotFound(format!("table {}", params.table)))?;
        let rows: Vec<Row> = data
            .rows
            .iter()
            .skip(offset)
            .take(params.batch_size)
            .map(|row| project(row, &params.columns))
            .collect();
        Ok(StreamResult::offset_page(rows, params.batch_size, offset))
    }

    async fn execute_query(&self, query: &str, _args: &[Value]) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        let trimmed = query.trim();
        let upper = trimmed.to_uppercase();
        if let Some(rest) = upper.strip_prefix("SELECT * FROM ") {
            let table = &trimmed[trimmed.len() - rest.len()..];
            return self.fetch(table.trim(), usize::MAX).await;
        }
        Err(Error::unsupported(
            self.engine(),
            "execute_query",
            "memory engine only answers SELECT * FROM <table>",
        ))
    }

    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        let table = query
            .split_whitespace()
            .last()
            .ok_or_else(|| Error::InvalidConfiguration("empty count query".into()))?;
        let tables = self.store.inner.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| Error::NotFound(format!("table {table}")))?;
        Ok(data.rows.len() as i64)
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        if where_clause.is_some_and(|w| !w.trim().is_empty()) {
            return Err(Error::unsupported(
                self.engine(),
                "get_row_count",
                "predicates are not part of the memory engine",
            ));
        }
        let tables = self.store.inner.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| Error::NotFound(format!("table {table}")))?;
        Ok((data.rows.len() as i64, true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        self.store.inner.tables.write().clear();
        Ok(())
    }
}

#[async_trait]
impl MetadataOperator for MemoryOps {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let tables = self.store.inner.tables.read();
        let rows: usize = tables.values().map(|d| d.rows.len()).sum();
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "database_type".into(),
            Value::String(self.engine().as_tag().into()),
        );
        metadata.insert("database_name".into(), Value::String(self.database.clone()));
        metadata.insert("table_count".into(), Value::Int(tables.len() as i64));
        metadata.insert("row_count".into(), Value::Int(rows as i64));
        Ok(metadata)
    }

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "database_type".into(),
            Value::String(self.engine().as_tag().into()),
        );
        metadata.insert(
            "database_count".into(),
            Value::Int(self.store.inner.databases.read().len() as i64),
        );
        Ok(metadata)
    }

    async fn get_version(&self) -> Result<String> {
        Ok("memory/1".into())
    }

    fn unique_identifier(&self) -> String {
        format!("{}::memory::{}", self.engine().as_tag(), self.database)
    }

    async fn get_database_size(&self) -> Result<i64> {
        self.state.ensure_open()?;
        let tables = self.store.inner.tables.read();
        Ok(tables.values().map(|d| d.rows.len() as i64).sum())
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        Ok(self.store.inner.tables.read().len() as i64)
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        Ok(format!("ok: {command}").into_bytes())
    }
}

#[async_trait]
impl InstanceOperator for MemoryOps {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        Ok(self.store.inner.databases.read().iter().cloned().collect())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        if !self.store.inner.databases.write().insert(name.to_string()) {
            return Err(Error::AlreadyExists(format!("database {name}")));
        }
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        if !self.store.inner.databases.write().remove(name) {
            return Err(Error::NotFound(format!("database {name}")));
        }
        Ok(())
    }
}
