//! Adapter and connection registries.
//!
//! The adapter registry is written once at process start and read
//! concurrently thereafter. The connection registry owns the `Connection`
//! envelopes for the life of the process; it does not pool: one logical id
//! maps to one open native client until an explicit disconnect.
//!
//! Locking discipline: the maps are the only thing the locks protect.
//! Handles are cloned out under the lock and every adapter call happens
//! after release, so a slow back-end can never stall unrelated lookups.

use crate::adapter::{Adapter, Connection, InstanceConnection};
use crate::capability::EngineType;
use crate::config::{ConnectionConfig, InstanceConfig};
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Process-wide directory of engine adapters.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<EngineType, Arc<dyn Adapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> AdapterRegistry {
        AdapterRegistry::default()
    }

    /// Register one adapter. Fails with `AlreadyExists` on a duplicate
    /// engine; registration is expected to happen before serving traffic.
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> Result<()> {
        let engine = adapter.engine();
        let mut adapters = self.adapters.write();
        if adapters.contains_key(&engine) {
            return Err(Error::AlreadyExists(format!("adapter for {engine}")));
        }
        debug!(engine = %engine, "registered adapter");
        adapters.insert(engine, adapter);
        Ok(())
    }

    pub fn get(&self, engine: EngineType) -> Result<Arc<dyn Adapter>> {
        self.adapters
            .read()
            .get(&engine)
            .map(Arc::clone)
            .ok_or_else(|| Error::UnknownEngine(engine.as_tag().to_string()))
    }

    pub fn engines(&self) -> Vec<EngineType> {
        self.adapters.read().keys().copied().collect()
    }
}

/// Owner of live connections and instance connections, keyed by their
/// configuration's stable identifier.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    instances: Mutex<HashMap<String, Arc<InstanceConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    /// Open a connection through the adapter and store it under the
    /// config id. Fails with `AlreadyExists` when the id is taken; the
    /// half-open connection is closed before the error is returned.
    pub async fn connect(
        &self,
        adapter: &Arc<dyn Adapter>,
        config: ConnectionConfig,
    ) -> Result<Arc<Connection>> {
        config.validate()?;
        let id = config.id.clone();
        if self.connections.lock().contains_key(&id) {
            return Err(Error::AlreadyExists(format!("connection {id}")));
        }
        let connection = Arc::new(adapter.connect(config).await?);

        let mut connections = self.connections.lock();
        if connections.contains_key(&id) {
            // Lost the race to a concurrent connect with the same id.
            drop(connections);
            let _ = connection.close().await;
            return Err(Error::AlreadyExists(format!("connection {id}")));
        }
        connections.insert(id.clone(), Arc::clone(&connection));
        drop(connections);
        info!(id = %id, engine = %connection.engine(), "connection opened");
        Ok(connection)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Connection>> {
        self.connections
            .lock()
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))
    }

    /// Remove and close. The close happens outside the map lock.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let connection = self
            .connections
            .lock()
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))?;
        connection.close().await?;
        info!(id = %id, "connection closed");
        Ok(())
    }

    pub async fn connect_instance(
        &self,
        adapter: &Arc<dyn Adapter>,
        config: InstanceConfig,
    ) -> Result<Arc<InstanceConnection>> {
        config.validate()?;
        let id = config.id.clone();
        if self.instances.lock().contains_key(&id) {
            return Err(Error::AlreadyExists(format!("instance {id}")));
        }
        let connection = Arc::new(adapter.connect_instance(config).await?);

        let mut instances = self.instances.lock();
        if instances.contains_key(&id) {
            drop(instances);
            let _ = connection.close().await;
            return Err(Error::AlreadyExists(format!("instance {id}")));
        }
        instances.insert(id.clone(), Arc::clone(&connection));
        drop(instances);
        info!(id = %id, engine = %connection.engine(), "instance connection opened");
        Ok(connection)
    }

    pub fn get_instance(&self, id: &str) -> Result<Arc<InstanceConnection>> {
        self.instances
            .lock()
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))
    }

    pub async fn disconnect_instance(&self, id: &str) -> Result<()> {
        let connection = self
            .instances
            .lock()
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
        connection.close().await?;
        Ok(())
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }

    /// Close everything, tolerating already-closed handles. Used on
    /// graceful shutdown.
    pub async fn close_all(&self) {
        let connections: Vec<_> = self.connections.lock().drain().collect();
        for (id, connection) in connections {
            match connection.close().await {
                Ok(()) | Err(Error::ConnectionClosed) => {}
                Err(err) => warn!(id = %id, error = %err, "error closing connection"),
            }
        }
        let instances: Vec<_> = self.instances.lock().drain().collect();
        for (id, connection) in instances {
            match connection.close().await {
                Ok(()) | Err(Error::ConnectionClosed) => {}
                Err(err) => warn!(id = %id, error = %err, "error closing instance connection"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        ConnState, DataOperator, MetadataOperator, NativeHandle, SchemaOperator, StreamParams,
        StreamResult, UnsupportedReplication,
    };
    use crate::model::{Table, UnifiedModel};
    use crate::value::{Row, Value};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullHandle {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NativeHandle for NullHandle {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullSchema;

    #[async_trait]
    impl SchemaOperator for NullSchema {
        async fn discover_schema(&self) -> Result<UnifiedModel> {
            Ok(UnifiedModel::default())
        }
        async fn create_structure(&self, _model: &UnifiedModel) -> Result<()> {
            Ok(())
        }
        async fn list_tables(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn get_table_schema(&self, table: &str) -> Result<Table> {
            Err(Error::NotFound(format!("table {table}")))
        }
    }

    struct NullData;

    #[async_trait]
    impl DataOperator for NullData {
        async fn fetch(&self, _table: &str, _limit: usize) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
        async fn fetch_with_columns(
            &self,
            _table: &str,
            _columns: &[String],
            _limit: usize,
        ) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
        async fn insert(&self, _table: &str, rows: &[Row]) -> Result<u64> {
            Ok(rows.len() as u64)
        }
        async fn update(&self, _table: &str, _rows: &[Row], _where: &[String]) -> Result<u64> {
            Ok(0)
        }
        async fn upsert(&self, _table: &str, rows: &[Row], _unique: &[String]) -> Result<u64> {
            Ok(rows.len() as u64)
        }
        async fn delete(&self, _table: &str, _conditions: &Row) -> Result<u64> {
            Ok(0)
        }
        async fn stream(&self, params: &StreamParams) -> Result<StreamResult> {
            Ok(StreamResult::offset_page(Vec::new(), params.batch_size, 0))
        }
        async fn execute_query(&self, _query: &str, _args: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
        async fn execute_count_query(&self, _query: &str) -> Result<i64> {
            Ok(0)
        }
        async fn get_row_count(&self, _table: &str, _w: Option<&str>) -> Result<(i64, bool)> {
            Ok((0, true))
        }
        async fn wipe(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NullMetadata;

    #[async_trait]
    impl MetadataOperator for NullMetadata {
        async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
            Ok(BTreeMap::new())
        }
        async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
            Ok(BTreeMap::new())
        }
        async fn get_version(&self) -> Result<String> {
            Ok("0".into())
        }
        fn unique_identifier(&self) -> String {
            "null::test::db".into()
        }
        async fn get_database_size(&self) -> Result<i64> {
            Ok(0)
        }
        async fn get_table_count(&self) -> Result<i64> {
            Ok(0)
        }
        async fn execute_command(&self, _command: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct NullAdapter {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Adapter for NullAdapter {
        fn engine(&self) -> EngineType {
            EngineType::Sqlite
        }

        async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
            let state = ConnState::new(config.id.clone(), self.engine());
            Ok(Connection::new(
                config,
                state,
                Arc::new(NullHandle {
                    closes: Arc::clone(&self.closes),
                }),
                Arc::new(NullSchema),
                Arc::new(NullData),
                Arc::new(NullMetadata),
                Arc::new(UnsupportedReplication::new(EngineType::Sqlite, "test")),
            ))
        }

        async fn connect_instance(&self, _config: InstanceConfig) -> Result<InstanceConnection> {
            Err(Error::unsupported(
                EngineType::Sqlite,
                "connect_instance",
                "single-file engine",
            ))
        }
    }

    fn test_config(id: &str) -> ConnectionConfig {
        ConnectionConfig {
            id: id.into(),
            engine: EngineType::Sqlite,
            host: "localhost".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn adapter_registry_rejects_duplicates() {
        let registry = AdapterRegistry::new();
        let closes = Arc::new(AtomicUsize::new(0));
        registry
            .register(Arc::new(NullAdapter {
                closes: Arc::clone(&closes),
            }))
            .unwrap();
        let err = registry
            .register(Arc::new(NullAdapter { closes }))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(registry.get(EngineType::Sqlite).is_ok());
        assert!(matches!(
            registry.get(EngineType::Postgres).unwrap_err(),
            Error::UnknownEngine(_)
        ));
    }

    #[tokio::test]
    async fn second_close_returns_connection_closed_without_io() {
        let closes = Arc::new(AtomicUsize::new(0));
        let adapter: Arc<dyn Adapter> = Arc::new(NullAdapter {
            closes: Arc::clone(&closes),
        });
        let registry = ConnectionRegistry::new();
        let connection = registry.connect(&adapter, test_config("db_a")).await.unwrap();

        connection.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let err = connection.close().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(closes.load(Ordering::SeqCst), 1, "no second native close");
    }

    #[tokio::test]
    async fn operators_fail_after_close() {
        let adapter: Arc<dyn Adapter> = Arc::new(NullAdapter {
            closes: Arc::new(AtomicUsize::new(0)),
        });
        let registry = ConnectionRegistry::new();
        let connection = registry.connect(&adapter, test_config("db_b")).await.unwrap();

        assert!(connection.data().is_ok());
        connection.close().await.unwrap();
        assert!(matches!(
            connection.data().unwrap_err(),
            Error::ConnectionClosed
        ));
        assert!(matches!(
            connection.ping().await.unwrap_err(),
            Error::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn duplicate_connection_id_is_rejected() {
        let adapter: Arc<dyn Adapter> = Arc::new(NullAdapter {
            closes: Arc::new(AtomicUsize::new(0)),
        });
        let registry = ConnectionRegistry::new();
        registry.connect(&adapter, test_config("db_c")).await.unwrap();
        let err = registry
            .connect(&adapter, test_config("db_c"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn disconnect_removes_and_closes() {
        let closes = Arc::new(AtomicUsize::new(0));
        let adapter: Arc<dyn Adapter> = Arc::new(NullAdapter {
            closes: Arc::clone(&closes),
        });
        let registry = ConnectionRegistry::new();
        registry.connect(&adapter, test_config("db_d")).await.unwrap();

        registry.disconnect("db_d").await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(registry.get("db_d").unwrap_err(), Error::NotFound(_)));
        assert!(matches!(
            registry.disconnect("db_d").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
