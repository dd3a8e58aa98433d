//! MySQL adapter, connection handle, and operators.

use crate::sql::{
    bind_value, build_create_table, build_delete, build_insert, build_update, build_upsert,
    quote_ident, row_from_mysql, unified_type_from_mysql,
};
use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, InstanceOperator,
    MetadataOperator, NativeHandle, SchemaOperator, StreamParams, StreamResult,
    UnsupportedReplication,
};
use anchor::prelude::*;
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row as _;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

// One native client per logical connection; the pool exists for driver
// ergonomics, not for sharing.
const POOL_SIZE: u32 = 1;

const CDC_REASON: &str =
    "binlog access is not part of this build; use a WAL-capable engine for capture";

pub(crate) struct MySqlHandle {
    pub pool: MySqlPool,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl MySqlHandle {
    async fn open(
        host: &str,
        port: u16,
        database: Option<&str>,
        credentials: &Credentials,
    ) -> Result<Arc<MySqlHandle>> {
        let mut options = MySqlConnectOptions::new().host(host).port(port);
        if let Some(db) = database {
            options = options.database(db);
        }
        if let Some(user) = &credentials.username {
            options = options.username(user);
        }
        if let Some(password) = &credentials.password {
            options = options.password(password);
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .map_err(|err| Error::connection(EngineType::MySql, host, port, err))?;
        Ok(Arc::new(MySqlHandle {
            pool,
            host: host.to_string(),
            port,
            database: database.unwrap_or_default().to_string(),
        }))
    }

    pub(crate) async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<MySqlRow>> {
        let mut query = sqlx::query(sql);
        for value in args {
            query = bind_value(query, value);
        }
        query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| Error::query(sql, err))
    }

    pub(crate) async fn execute(&self, sql: &str, args: &[Value]) -> Result<u64> {
        let mut query = sqlx::query(sql);
        for value in args {
            query = bind_value(query, value);
        }
        query
            .execute(&self.pool)
            .await
            .map(|done| done.rows_affected())
            .map_err(|err| Error::query(sql, err))
    }

    pub(crate) async fn query_scalar(&self, sql: &str) -> Result<i64> {
        let rows = self.query(sql, &[]).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::query(sql, std::io::Error::other("empty result")))?;
        row.try_get::<i64, _>(0)
            .or_else(|_| row.try_get::<i32, _>(0).map(i64::from))
            .or_else(|_| row.try_get::<u64, _>(0).map(|n| n as i64))
            .map_err(|err| Error::query(sql, err))
    }
}

#[async_trait]
impl NativeHandle for MySqlHandle {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| Error::connection(EngineType::MySql, &self.host, self.port, err))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// The MySQL adapter value registered at process start.
#[derive(Default)]
pub struct MySqlAdapter;

impl MySqlAdapter {
    pub fn new() -> MySqlAdapter {
        MySqlAdapter
    }
}

#[async_trait]
impl Adapter for MySqlAdapter {
    fn engine(&self) -> EngineType {
        EngineType::MySql
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        if config.database.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "connection {}: mysql requires a database name",
                config.id
            )));
        }
        let handle = MySqlHandle::open(
            &config.host,
            config.port,
            Some(&config.database),
            &config.credentials,
        )
        .await?;
        handle.ping().await?;
        debug!(id = %config.id, "mysql connection established");

        let state = ConnState::new(config.id.clone(), EngineType::MySql);
        let ops = Arc::new(MySqlOps {
            state: Arc::clone(&state),
            handle: Arc::clone(&handle),
        });
        Ok(Connection::new(
            config,
            state,
            handle,
            Arc::clone(&ops) as Arc<dyn SchemaOperator>,
            Arc::clone(&ops) as Arc<dyn DataOperator>,
            ops as Arc<dyn MetadataOperator>,
            Arc::new(UnsupportedReplication::new(EngineType::MySql, CDC_REASON)),
        ))
    }

    async fn connect_instance(&self, config: InstanceConfig) -> Result<InstanceConnection> {
        config.validate()?;
        let handle =
            MySqlHandle::open(&config.host, config.port, None, &config.credentials).await?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::MySql);
        let ops = Arc::new(MySqlOps {
            state: Arc::clone(&state),
            handle: Arc::clone(&handle),
        });
        Ok(InstanceConnection::new(
            config,
            state,
            handle,
            Arc::clone(&ops) as Arc<dyn InstanceOperator>,
            ops as Arc<dyn MetadataOperator>,
        ))
    }
}

struct MySqlOps {
    state: Arc<ConnState>,
    handle: Arc<MySqlHandle>,
}

#[async_trait]
impl SchemaOperator for MySqlOps {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new(self.handle.database.clone());
        const SQL: &str = "SELECT table_name, column_name, data_type, \
             is_nullable = 'YES', column_key = 'PRI', extra LIKE '%auto_increment%', column_default \
             FROM information_schema.columns \
             WHERE table_schema = DATABASE() ORDER BY table_name, ordinal_position";
        for row in self.handle.query(SQL, &[]).await? {
            let table_name: String = row.try_get(0).map_err(|e| Error::query(SQL, e))?;
            let column_name: String = row.try_get(1).map_err(|e| Error::query(SQL, e))?;
            let data_type: String = row.try_get(2).map_err(|e| Error::query(SQL, e))?;
            let nullable: bool = row.try_get::<i64, _>(3).map(|v| v != 0).unwrap_or(true);
            let primary: bool = row.try_get::<i64, _>(4).map(|v| v != 0).unwrap_or(false);
            let auto: bool = row.try_get::<i64, _>(5).map(|v| v != 0).unwrap_or(false);
            let default_value: Option<String> = row.try_get(6).ok();

            let table = model
                .tables
                .entry(table_name.clone())
                .or_insert_with(|| Table::new(table_name));
            let mut column = Column::new(column_name, unified_type_from_mysql(&data_type));
            column.nullable = nullable && !primary;
            column.primary_key = primary;
            column.auto_increment = auto;
            column.default_value = default_value;
            table.columns.push(column);
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        for table in model.tables.values() {
            self.handle.execute(&build_create_table(table), &[]).await?;
            for index in &table.indexes {
                // MySQL has no CREATE INDEX IF NOT EXISTS; probe first.
                let exists = self
                    .handle
                    .query(
                        "SELECT 1 FROM information_schema.statistics \
                         WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?",
                        &[
                            Value::String(table.name.clone()),
                            Value::String(index.name.clone()),
                        ],
                    )
                    .await?;
                if !exists.is_empty() {
                    continue;
                }
                let unique = if index.unique { "UNIQUE " } else { "" };
                let sql = format!(
                    "CREATE {}INDEX {} ON {} ({})",
                    unique,
                    quote_ident(&index.name),
                    quote_ident(&table.name),
                    index
                        .columns
                        .iter()
                        .map(|c| quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                self.handle.execute(&sql, &[]).await?;
            }
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        const SQL: &str = "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' ORDER BY table_name";
        let rows = self.handle.query(SQL, &[]).await?;
        Ok(rows.iter().filter_map(|r| r.try_get(0).ok()).collect())
    }

    async fn get_table_schema(&self, table: &str) -> Result<Table> {
        let model = self.discover_schema().await?;
        model
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("table {table}")))
    }
}

#[async_trait]
impl DataOperator for MySqlOps {
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
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        };
        let sql = format!("SELECT {} FROM {} LIMIT {}", projection, quote_ident(table), limit);
        Ok(self.handle.query(&sql, &[]).await?.iter().map(row_from_mysql).collect())
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let columns: Vec<String> = first.keys().cloned().collect();
        let sql = build_insert(table, &columns, rows.len());
        let mut args = Vec::with_capacity(columns.len() * rows.len());
        for row in rows {
            for column in &columns {
                args.push(row.get(column).cloned().unwrap_or(Value::Null));
            }
        }
        self.handle.execute(&sql, &args).await
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        if where_columns.is_empty() {
            return Err(Error::InvalidConfiguration(
                "update requires at least one where column".into(),
            ));
        }
        let mut affected = 0u64;
        for row in rows {
            let set_columns: Vec<String> = row
                .keys()
                .filter(|k| !where_columns.contains(k))
                .cloned()
                .collect();
            if set_columns.is_empty() {
                continue;
            }
            let mut args: Vec<Value> = set_columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            for column in where_columns {
                args.push(row.get(column).cloned().ok_or_else(|| {
                    Error::InvalidConfiguration(format!("update row is missing where column {column}"))
                })?);
            }
            affected += self
                .handle
                .execute(&build_update(table, &set_columns, where_columns), &args)
                .await?;
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
        for row in rows {
            let columns: Vec<String> = row.keys().cloned().collect();
            let args: Vec<Value> = columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            self.handle
                .execute(&build_upsert(table, &columns, unique_columns), &args)
                .await?;
        }
        // MySQL reports 1 for insert and 2 for update; normalize to 1xN.
        Ok(rows.len() as u64)
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = conditions.keys().cloned().collect();
        let args: Vec<Value> = columns
            .iter()
            .map(|c| conditions.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        self.handle.execute(&build_delete(table, &columns), &args).await
    }

    async fn stream(&self, params: &StreamParams) -> Result<StreamResult> {
        self.state.ensure_open()?;
        let offset = params.offset()?;
        let projection = if params.columns.is_empty() {
            "*".to_string()
        } else {
            params
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", projection, quote_ident(&params.table));
        if let Some(filter) = &params.filter {
            if !filter.trim().is_empty() {
                sql.push_str(&format!(" WHERE {filter}"));
            }
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", params.batch_size, offset));
        let rows: Vec<Row> = self.handle.query(&sql, &[]).await?.iter().map(row_from_mysql).collect();
        Ok(StreamResult::offset_page(rows, params.batch_size, offset))
    }

    async fn execute_query(&self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        Ok(self.handle.query(query, args).await?.iter().map(row_from_mysql).collect())
    }

    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle.query_scalar(query).await
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        if let Some(clause) = where_clause {
            if !clause.trim().is_empty() {
                sql.push_str(&format!(" WHERE {clause}"));
            }
        }
        Ok((self.handle.query_scalar(&sql).await?, true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        let tables = self.list_tables().await?;
        self.handle.execute("SET FOREIGN_KEY_CHECKS = 0", &[]).await?;
        for table in &tables {
            let sql = format!("TRUNCATE TABLE {}", quote_ident(table));
            self.handle.execute(&sql, &[]).await?;
        }
        self.handle.execute("SET FOREIGN_KEY_CHECKS = 1", &[]).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataOperator for MySqlOps {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("mysql".into()));
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
        metadata.insert("database_type".into(), Value::String("mysql".into()));
        metadata.insert(
            "host".into(),
            Value::String(format!("{}:{}", self.handle.host, self.handle.port)),
        );
        let count = self
            .handle
            .query_scalar(
                "SELECT COUNT(*) FROM information_schema.schemata \
                 WHERE schema_name NOT IN ('mysql','sys','information_schema','performance_schema')",
            )
            .await?;
        metadata.insert("database_count".into(), Value::Int(count));
        Ok(metadata)
    }

    async fn get_version(&self) -> Result<String> {
        self.state.ensure_open()?;
        let rows = self.handle.query("SELECT VERSION()", &[]).await?;
        rows.first()
            .and_then(|r| r.try_get::<String, _>(0).ok())
            .ok_or_else(|| Error::Fatal("VERSION() returned nothing".into()))
    }

    fn unique_identifier(&self) -> String {
        format!(
            "mysql::{}:{}::{}",
            self.handle.host, self.handle.port, self.handle.database
        )
    }

    async fn get_database_size(&self) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle
            .query_scalar(
                "SELECT COALESCE(SUM(data_length + index_length), 0) \
                 FROM information_schema.tables WHERE table_schema = DATABASE()",
            )
            .await
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle
            .query_scalar(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'",
            )
            .await
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        let rows = self.handle.query(command, &[]).await?;
        let rendered: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| anchor::value::row_to_json(&row_from_mysql(row)))
            .collect();
        Ok(serde_json::to_vec(&rendered)?)
    }
}

#[async_trait]
impl InstanceOperator for MySqlOps {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        const SQL: &str = "SELECT schema_name FROM information_schema.schemata \
             WHERE schema_name NOT IN ('mysql','sys','information_schema','performance_schema') \
             ORDER BY schema_name";
        let rows = self.handle.query(SQL, &[]).await?;
        Ok(rows.iter().filter_map(|r| r.try_get(0).ok()).collect())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        let sql = format!("CREATE DATABASE {}", quote_ident(name));
        self.handle.execute(&sql, &[]).await.map(|_| ())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        let sql = format!("DROP DATABASE {}", quote_ident(name));
        self.handle.execute(&sql, &[]).await.map(|_| ())
    }
}
