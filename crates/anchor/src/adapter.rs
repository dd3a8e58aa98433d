//! The adapter capability contract.
//!
//! Each engine crate implements [`Adapter`] once and registers it with the
//! [`crate::registry::AdapterRegistry`] at process start. A successful
//! [`Adapter::connect`] yields a [`Connection`] envelope exposing four
//! operator handles; the envelope owns the native client and an atomic
//! connected flag, and is the only place allowed to close the client.
//!
//! Operator calls are async and cancel-safe: dropping the future aborts the
//! in-flight network operation. Deadlines are applied by callers with
//! `tokio::time::timeout`; coordinators additionally carry shutdown channels.

use crate::capability::{CapabilityDescriptor, EngineType};
use crate::config::{ConnectionConfig, InstanceConfig};
use crate::error::{Error, Result};
use crate::model::{Table, UnifiedModel};
use crate::replication::{
    CdcEvent, ReplicationConfig, ReplicationLag, ReplicationSource,
};
use crate::transform::TransformRule;
use crate::value::{Row, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The opened native client, opaque to everything but its adapter.
///
/// A connection envelope holds exactly one and calls `close` exactly once,
/// after winning the connected-flag CAS.
#[async_trait]
pub trait NativeHandle: Send + Sync {
    /// Liveness probe against the back-end.
    async fn ping(&self) -> Result<()>;

    /// Release network resources. Called at most once.
    async fn close(&self) -> Result<()>;
}

/// Shared open/closed state between a connection envelope and its operators.
///
/// Operators call [`ConnState::ensure_open`] at the top of every method so
/// calls racing a close fail with `ConnectionClosed` instead of touching a
/// released client.
#[derive(Debug)]
pub struct ConnState {
    id: String,
    engine: EngineType,
    connected: AtomicBool,
}

impl ConnState {
    pub fn new(id: impl Into<String>, engine: EngineType) -> Arc<ConnState> {
        Arc::new(ConnState {
            id: id.into(),
            engine,
            connected: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> EngineType {
        self.engine
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Fail with `ConnectionClosed` once the flag is cleared.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    /// Transition connected 1 -> 0. Returns true for the single winner.
    pub fn close_once(&self) -> bool {
        self.connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Batched-read cursor parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    pub table: String,
    /// Column projection; empty means all columns.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Engine-native filter predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub batch_size: usize,
    /// Stringified numeric offset or an engine-specific token from a
    /// previous [`StreamResult::next_cursor`]. `None` starts from the top.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl StreamParams {
    pub fn new(table: impl Into<String>, batch_size: usize) -> StreamParams {
        StreamParams {
            table: table.into(),
            columns: Vec::new(),
            filter: None,
            batch_size,
            cursor: None,
        }
    }

    /// Continue from a previous result.
    pub fn after(mut self, cursor: Option<String>) -> StreamParams {
        self.cursor = cursor;
        self
    }

    /// Parse the cursor as a numeric offset, for offset-paginated engines.
    pub fn offset(&self) -> Result<usize> {
        match &self.cursor {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| {
                Error::InvalidConfiguration(format!("stream cursor {raw:?} is not a numeric offset"))
            }),
        }
    }
}

/// One page of a bounded-pagination read.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamResult {
    pub rows: Vec<Row>,
    /// `rows.len() == batch_size` by contract.
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

impl StreamResult {
    /// Page for offset-paginated engines: cursor advances by rows returned.
    pub fn offset_page(rows: Vec<Row>, batch_size: usize, offset: usize) -> StreamResult {
        let has_more = rows.len() == batch_size;
        let next_cursor = has_more.then(|| (offset + rows.len()).to_string());
        StreamResult {
            rows,
            has_more,
            next_cursor,
        }
    }

    /// Page for token-paginated engines (object stores, change feeds).
    pub fn token_page(rows: Vec<Row>, batch_size: usize, token: Option<String>) -> StreamResult {
        let has_more = rows.len() == batch_size;
        StreamResult {
            rows,
            has_more,
            next_cursor: if has_more { token } else { None },
        }
    }
}

/// Schema discovery and structure creation.
#[async_trait]
pub trait SchemaOperator: Send + Sync {
    /// Enumerate the engine's schema objects into a [`UnifiedModel`].
    ///
    /// Engines without declared schemas synthesise pseudo-tables: one per
    /// collection with sampled columns, one per object prefix, one per key
    /// pattern. Object stores also populate the blob map.
    async fn discover_schema(&self) -> Result<UnifiedModel>;

    /// Materialize a model into native structures. Idempotent where the
    /// engine supports it, `Unsupported` otherwise.
    async fn create_structure(&self, model: &UnifiedModel) -> Result<()>;

    /// Enumerate leaf containers (tables, collections, prefixes, indices).
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Per-container projection.
    async fn get_table_schema(&self, table: &str) -> Result<Table>;
}

/// Row-level data access.
///
/// Empty inputs to `insert` / `update` / `upsert` / `delete` return 0
/// affected rows and no error. `upsert` returns 1 per input row regardless
/// of whether the engine reports insert or update.
#[async_trait]
pub trait DataOperator: Send + Sync {
    /// Small-batch read of all columns.
    async fn fetch(&self, table: &str, limit: usize) -> Result<Vec<Row>>;

    /// Small-batch read with projection; empty projection means all
    /// columns. Engine-native byte buffers for text columns are coerced to
    /// strings.
    async fn fetch_with_columns(
        &self,
        table: &str,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Batched insert. Rows may have heterogeneous column sets; engines
    /// that need a fixed column list infer it from the first row.
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64>;

    /// SET from `rows` minus `where_columns`, WHERE equality on
    /// `where_columns`.
    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64>;

    /// Insert-or-update matching on `unique_columns`.
    async fn upsert(&self, table: &str, rows: &[Row], unique_columns: &[String]) -> Result<u64>;

    /// Delete rows matching the equality-AND condition map.
    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64>;

    /// Bounded pagination; see [`StreamParams`].
    async fn stream(&self, params: &StreamParams) -> Result<StreamResult>;

    /// Engine-native query pass-through.
    async fn execute_query(&self, query: &str, args: &[Value]) -> Result<Vec<Row>>;

    /// Engine-native count query; extracts the first scalar of the first
    /// row.
    async fn execute_count_query(&self, query: &str) -> Result<i64>;

    /// Row count with an optional engine-native predicate. The boolean is
    /// false when the engine can only estimate.
    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)>;

    /// Delete all data within the connection's scope. Instance-scoped
    /// wipes are always refused.
    async fn wipe(&self) -> Result<()>;
}

/// Engine metadata and admin commands.
#[async_trait]
pub trait MetadataOperator: Send + Sync {
    /// Free-form map; always carries `database_type` plus engine-natural
    /// identifiers, optionally size / created time / object count.
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>>;

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>>;

    async fn get_version(&self) -> Result<String>;

    /// Stable across restarts and deterministic from the connection,
    /// typically `<type>::<instance>::<db>`.
    fn unique_identifier(&self) -> String;

    async fn get_database_size(&self) -> Result<i64>;

    async fn get_table_count(&self) -> Result<i64>;

    /// Engine-native admin command; raw response bytes.
    async fn execute_command(&self, command: &str) -> Result<Vec<u8>>;
}

/// CDC attachment surface. Engines without a mechanism return a stub whose
/// `is_supported` is false and whose operations all fail `Unsupported`.
#[async_trait]
pub trait ReplicationOperator: Send + Sync {
    fn is_supported(&self) -> bool;

    fn supported_mechanisms(&self) -> Vec<String>;

    /// Verify server-side prerequisites (wal_level, oplog, notification
    /// flags) before a source is created.
    async fn check_prerequisites(&self) -> Result<()>;

    /// Create a source for the given config. The source is `Created` until
    /// `start`.
    async fn connect(&self, config: ReplicationConfig) -> Result<Arc<dyn ReplicationSource>>;

    async fn status(&self) -> Result<BTreeMap<String, Value>>;

    async fn lag(&self) -> Result<ReplicationLag>;

    /// WAL-slot engines only.
    async fn list_slots(&self) -> Result<Vec<String>>;

    async fn drop_slot(&self, name: &str) -> Result<()>;

    async fn list_publications(&self) -> Result<Vec<String>>;

    async fn drop_publication(&self, name: &str) -> Result<()>;

    /// Decode one raw mechanism event into a normalized record.
    fn parse_event(&self, raw: &[u8]) -> Result<CdcEvent>;

    /// Apply a normalized event to this connection's scope.
    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<u64>;

    /// Transform an event row, delegating to the external service when
    /// `rules` is non-empty and an endpoint is given.
    async fn transform_data(
        &self,
        row: &Row,
        rules: &[TransformRule],
        endpoint: Option<&str>,
    ) -> Result<Row> {
        crate::transform::transform_row(row, rules, endpoint).await
    }
}

/// Stub [`ReplicationOperator`] for engines without a CDC mechanism.
pub struct UnsupportedReplication {
    engine: EngineType,
    reason: String,
}

impl UnsupportedReplication {
    pub fn new(engine: EngineType, reason: impl Into<String>) -> UnsupportedReplication {
        UnsupportedReplication {
            engine,
            reason: reason.into(),
        }
    }

    fn err(&self, operation: &'static str) -> Error {
        Error::unsupported(self.engine, operation, self.reason.clone())
    }
}

#[async_trait]
impl ReplicationOperator for UnsupportedReplication {
    fn is_supported(&self) -> bool {
        false
    }

    fn supported_mechanisms(&self) -> Vec<String> {
        Vec::new()
    }

    async fn check_prerequisites(&self) -> Result<()> {
        Err(self.err("check_prerequisites"))
    }

    async fn connect(&self, _config: ReplicationConfig) -> Result<Arc<dyn ReplicationSource>> {
        Err(self.err("replication_connect"))
    }

    async fn status(&self) -> Result<BTreeMap<String, Value>> {
        Err(self.err("replication_status"))
    }

    async fn lag(&self) -> Result<ReplicationLag> {
        Ok(ReplicationLag::Unknown)
    }

    async fn list_slots(&self) -> Result<Vec<String>> {
        Err(self.err("list_slots"))
    }

    async fn drop_slot(&self, _name: &str) -> Result<()> {
        Err(self.err("drop_slot"))
    }

    async fn list_publications(&self) -> Result<Vec<String>> {
        Err(self.err("list_publications"))
    }

    async fn drop_publication(&self, _name: &str) -> Result<()> {
        Err(self.err("drop_publication"))
    }

    fn parse_event(&self, _raw: &[u8]) -> Result<CdcEvent> {
        Err(self.err("parse_event"))
    }

    async fn apply_cdc_event(&self, _event: &CdcEvent) -> Result<u64> {
        Err(self.err("apply_cdc_event"))
    }
}

/// A live handle to one database/bucket/dataset scope.
///
/// Owns the native client exclusively; the connection registry holds the
/// envelope, never the client. Once `close` wins the 1 -> 0 flag
/// transition it releases native resources exactly once; every operator
/// accessor and call after that fails with `ConnectionClosed`.
pub struct Connection {
    config: ConnectionConfig,
    state: Arc<ConnState>,
    native: Arc<dyn NativeHandle>,
    schema: Arc<dyn SchemaOperator>,
    data: Arc<dyn DataOperator>,
    metadata: Arc<dyn MetadataOperator>,
    replication: Arc<dyn ReplicationOperator>,
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        state: Arc<ConnState>,
        native: Arc<dyn NativeHandle>,
        schema: Arc<dyn SchemaOperator>,
        data: Arc<dyn DataOperator>,
        metadata: Arc<dyn MetadataOperator>,
        replication: Arc<dyn ReplicationOperator>,
    ) -> Connection {
        Connection {
            config,
            state,
            native,
            schema,
            data,
            metadata,
            replication,
        }
    }

    pub fn id(&self) -> &str {
        self.state.id()
    }

    pub fn engine(&self) -> EngineType {
        self.state.engine()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn schema(&self) -> Result<Arc<dyn SchemaOperator>> {
        self.state.ensure_open()?;
        Ok(Arc::clone(&self.schema))
    }

    pub fn data(&self) -> Result<Arc<dyn DataOperator>> {
        self.state.ensure_open()?;
        Ok(Arc::clone(&self.data))
    }

    pub fn metadata(&self) -> Result<Arc<dyn MetadataOperator>> {
        self.state.ensure_open()?;
        Ok(Arc::clone(&self.metadata))
    }

    pub fn replication(&self) -> Result<Arc<dyn ReplicationOperator>> {
        self.state.ensure_open()?;
        Ok(Arc::clone(&self.replication))
    }

    /// Short-circuits to `ConnectionClosed` when the flag is clear,
    /// otherwise delegates to the native client.
    pub async fn ping(&self) -> Result<()> {
        self.state.ensure_open()?;
        self.native.ping().await
    }

    /// Release the native client. The second and later calls return
    /// `ConnectionClosed` and perform no network I/O.
    pub async fn close(&self) -> Result<()> {
        if self.state.close_once() {
            self.native.close().await
        } else {
            Err(Error::ConnectionClosed)
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("engine", &self.engine())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Database lifecycle operations at instance scope.
#[async_trait]
pub trait InstanceOperator: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn create_database(&self, name: &str) -> Result<()>;

    async fn drop_database(&self, name: &str) -> Result<()>;
}

/// A live handle to a server/project/workspace scope. Exposes database
/// lifecycle plus metadata; it has no schema/data/replication operators.
pub struct InstanceConnection {
    config: InstanceConfig,
    state: Arc<ConnState>,
    native: Arc<dyn NativeHandle>,
    instance: Arc<dyn InstanceOperator>,
    metadata: Arc<dyn MetadataOperator>,
}

impl InstanceConnection {
    pub fn new(
        config: InstanceConfig,
        state: Arc<ConnState>,
        native: Arc<dyn NativeHandle>,
        instance: Arc<dyn InstanceOperator>,
        metadata: Arc<dyn MetadataOperator>,
    ) -> InstanceConnection {
        InstanceConnection {
            config,
            state,
            native,
            instance,
            metadata,
        }
    }

    pub fn id(&self) -> &str {
        self.state.id()
    }

    pub fn engine(&self) -> EngineType {
        self.state.engine()
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn instance(&self) -> Result<Arc<dyn InstanceOperator>> {
        self.state.ensure_open()?;
        Ok(Arc::clone(&self.instance))
    }

    pub fn metadata(&self) -> Result<Arc<dyn MetadataOperator>> {
        self.state.ensure_open()?;
        Ok(Arc::clone(&self.metadata))
    }

    pub async fn ping(&self) -> Result<()> {
        self.state.ensure_open()?;
        self.native.ping().await
    }

    pub async fn close(&self) -> Result<()> {
        if self.state.close_once() {
            self.native.close().await
        } else {
            Err(Error::ConnectionClosed)
        }
    }
}

impl std::fmt::Debug for InstanceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceConnection")
            .field("id", &self.id())
            .field("engine", &self.engine())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// One value per engine, registered at process start.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn engine(&self) -> EngineType;

    fn capabilities(&self) -> CapabilityDescriptor {
        crate::capability::capabilities(self.engine())
    }

    /// Open a database-scoped connection.
    async fn connect(&self, config: ConnectionConfig) -> Result<Connection>;

    /// Open an instance-scoped connection.
    async fn connect_instance(&self, config: InstanceConfig) -> Result<InstanceConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_once_is_single_winner() {
        let state = ConnState::new("db_1", EngineType::Postgres);
        assert!(state.is_connected());
        assert!(state.close_once());
        assert!(!state.close_once());
        assert!(matches!(
            state.ensure_open().unwrap_err(),
            Error::ConnectionClosed
        ));
    }

    #[test]
    fn offset_page_contract() {
        let rows = vec![Row::new(); 5];
        let page = StreamResult::offset_page(rows, 5, 10);
        assert!(page.has_more);
        assert_eq!(page.next_cursor.as_deref(), Some("15"));

        let last = StreamResult::offset_page(vec![Row::new(); 3], 5, 15);
        assert!(!last.has_more);
        assert_eq!(last.next_cursor, None);
    }

    #[test]
    fn token_page_drops_cursor_on_final_page() {
        let page = StreamResult::token_page(vec![Row::new(); 2], 5, Some("k2".into()));
        assert!(!page.has_more);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn stream_params_offset_parsing() {
        let params = StreamParams::new("t", 100).after(Some("250".into()));
        assert_eq!(params.offset().unwrap(), 250);
        let bad = StreamParams::new("t", 100).after(Some("s3-key".into()));
        assert!(bad.offset().is_err());
    }

    #[tokio::test]
    async fn unsupported_replication_reports_engine_and_reason() {
        let stub = UnsupportedReplication::new(EngineType::Sqlite, "no write-ahead log hooks");
        assert!(!stub.is_supported());
        let err = stub.check_prerequisites().await.unwrap_err();
        match err {
            Error::Unsupported { engine, reason, .. } => {
                assert_eq!(engine, EngineType::Sqlite);
                assert!(reason.contains("write-ahead"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stub.lag().await.unwrap(), ReplicationLag::Unknown);
    }
}
