//! Connection plumbing and the adapter entry point.

use crate::data::PostgresData;
use crate::metadata::PostgresMetadata;
use crate::replication::PostgresReplication;
use crate::schema::PostgresSchema;
use crate::sql::row_from_pg;
use anchor::adapter::{
    Adapter, ConnState, Connection, InstanceConnection, InstanceOperator, NativeHandle,
};
use anchor::prelude::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

/// Shared native handle: one client plus the driver task that pumps its
/// socket. Closing aborts the driver, which tears the session down.
pub(crate) struct PgHandle {
    pub client: tokio_postgres::Client,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl PgHandle {
    pub(crate) async fn open(
        host: &str,
        port: u16,
        database: &str,
        credentials: &Credentials,
        tls: &TlsOptions,
    ) -> Result<Arc<PgHandle>> {
        if tls.enabled {
            // The workspace links no TLS connector for postgres; sessions
            // ride the network fabric's encryption instead.
            warn!(host, "TLS requested for postgres but this build connects plain; proceeding");
        }
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(host).port(port).dbname(database);
        if let Some(user) = &credentials.username {
            pg_config.user(user);
        }
        if let Some(password) = &credentials.password {
            pg_config.password(password);
        }
        pg_config.application_name("anchor");

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|err| Error::connection(EngineType::Postgres, host, port, err))?;

        let driver_host = host.to_string();
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(host = %driver_host, error = %err, "postgres connection task ended");
            }
        });

        Ok(Arc::new(PgHandle {
            client,
            driver: Mutex::new(Some(driver)),
            host: host.to_string(),
            port,
            database: database.to_string(),
        }))
    }

    pub(crate) async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        self.client
            .query(sql, params)
            .await
            .map_err(|err| Error::query(sql, err))
    }

    pub(crate) async fn query_rows(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        Ok(self.query(sql, params).await?.iter().map(row_from_pg).collect())
    }

    pub(crate) async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64> {
        self.client
            .execute(sql, params)
            .await
            .map_err(|err| Error::query(sql, err))
    }

    /// First scalar of the first row, as i64.
    pub(crate) async fn query_scalar(&self, sql: &str) -> Result<i64> {
        let rows = self.query(sql, &[]).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::query(sql, std::io::Error::other("empty result")))?;
        row.try_get::<_, i64>(0)
            .or_else(|_| row.try_get::<_, i32>(0).map(i64::from))
            .map_err(|err| Error::query(sql, err))
    }
}

#[async_trait]
impl NativeHandle for PgHandle {
    async fn ping(&self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|err| Error::connection(EngineType::Postgres, &self.host, self.port, err))
    }

    async fn close(&self) -> Result<()> {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        Ok(())
    }
}

/// The PostgreSQL adapter value registered at process start.
#[derive(Default)]
pub struct PostgresAdapter;

impl PostgresAdapter {
    pub fn new() -> PostgresAdapter {
        PostgresAdapter
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    fn engine(&self) -> EngineType {
        EngineType::Postgres
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        if config.database.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "connection {}: postgres requires a database name",
                config.id
            )));
        }
        let handle = PgHandle::open(
            &config.host,
            config.port,
            &config.database,
            &config.credentials,
            &config.tls,
        )
        .await?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::Postgres);
        let schema = Arc::new(PostgresSchema::new(Arc::clone(&state), Arc::clone(&handle)));
        let data = Arc::new(PostgresData::new(Arc::clone(&state), Arc::clone(&handle)));
        let metadata = Arc::new(PostgresMetadata::new(Arc::clone(&state), Arc::clone(&handle)));
        let replication = Arc::new(PostgresReplication::new(
            Arc::clone(&state),
            Arc::clone(&handle),
            config.credentials.clone(),
            config.tls.clone(),
        ));
        Ok(Connection::new(
            config, state, handle, schema, data, metadata, replication,
        ))
    }

    async fn connect_instance(&self, config: InstanceConfig) -> Result<InstanceConnection> {
        config.validate()?;
        // Instance scope rides the maintenance database.
        let handle = PgHandle::open(
            &config.host,
            config.port,
            "postgres",
            &config.credentials,
            &config.tls,
        )
        .await?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::Postgres);
        let instance = Arc::new(PostgresInstance {
            state: Arc::clone(&state),
            handle: Arc::clone(&handle),
        });
        let metadata = Arc::new(PostgresMetadata::new(Arc::clone(&state), Arc::clone(&handle)));
        Ok(InstanceConnection::new(
            config, state, handle, instance, metadata,
        ))
    }
}

struct PostgresInstance {
    state: Arc<ConnState>,
    handle: Arc<PgHandle>,
}

#[async_trait]
impl InstanceOperator for PostgresInstance {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let rows = self
            .handle
            .query(
                "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname",
                &[],
            )
            .await?;
        Ok(rows.iter().filter_map(|r| r.try_get(0).ok()).collect())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        let sql = format!("CREATE DATABASE {}", crate::sql::quote_ident(name));
        self.handle.execute(&sql, &[]).await.map(|_| ())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        let sql = format!("DROP DATABASE {}", crate::sql::quote_ident(name));
        self.handle.execute(&sql, &[]).await.map(|_| ())
    }
}
