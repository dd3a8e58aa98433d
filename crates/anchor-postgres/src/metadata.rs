//! Database and instance metadata.

use crate::postgres::PgHandle;
use anchor::adapter::{ConnState, MetadataOperator};
use anchor::prelude::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) struct PostgresMetadata {
    state: Arc<ConnState>,
    handle: Arc<PgHandle>,
}

impl PostgresMetadata {
    pub(crate) fn new(state: Arc<ConnState>, handle: Arc<PgHandle>) -> PostgresMetadata {
        PostgresMetadata { state, handle }
    }
}

#[async_trait]
impl MetadataOperator for PostgresMetadata {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("postgres".into()));
        metadata.insert(
            "database_name".into(),
            Value::String(self.handle.database.clone()),
        );
        metadata.insert("size_bytes".into(), Value::Int(self.get_database_size().await?));
        metadata.insert("table_count".into(), Value::Int(self.get_table_count().await?));
        metadata.insert("version".into(), Value::String(self.get_version().await?));
        Ok(metadata)
    }

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("postgres".into()));
        metadata.insert(
            "host".into(),
            Value::String(format!("{}:{}", self.handle.host, self.handle.port)),
        );
        let count = self
            .handle
            .query_scalar("SELECT COUNT(*) FROM pg_database WHERE datistemplate = false")
            .await?;
        metadata.insert("database_count".into(), Value::Int(count));
        metadata.insert("version".into(), Value::String(self.get_version().await?));
        Ok(metadata)
    }

    async fn get_version(&self) -> Result<String> {
        self.state.ensure_open()?;
        let rows = self.handle.query("SHOW server_version", &[]).await?;
        rows.first()
            .and_then(|r| r.try_get::<_, String>(0).ok())
            .ok_or_else(|| Error::Fatal("server_version missing".into()))
    }

    fn unique_identifier(&self) -> String {
        format!(
            "postgres::{}:{}::{}",
            self.handle.host, self.handle.port, self.handle.database
        )
    }

    async fn get_database_size(&self) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle
            .query_scalar("SELECT pg_database_size(current_database())")
            .await
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle
            .query_scalar(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
            )
            .await
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        let rows = self.handle.query_rows(command, &[]).await?;
        let rendered: Vec<serde_json::Value> =
            rows.iter().map(anchor::value::row_to_json).collect();
        Ok(serde_json::to_vec(&rendered)?)
    }
}
