//! ClickHouse adapter, handle, and operators.

use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, InstanceOperator,
    MetadataOperator, NativeHandle, SchemaOperator, StreamParams, StreamResult,
    UnsupportedReplication,
};
use anchor::prelude::*;
use anchor::value::{row_from_json, row_to_json};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

const CDC_REASON: &str = "MergeTree has no row-level change log to attach to";
const IMMUTABLE_REASON: &str = "parts are immutable once written; rewrite the partition instead";
const RETENTION_REASON: &str = "rows expire through the table's retention policy, not row deletes";

/// Backtick-quote an identifier.
fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "\\`"))
}

fn unified_type_from_clickhouse(native: &str) -> UnifiedDataType {
    // Strip Nullable(...) and LowCardinality(...) wrappers.
    let mut inner = native;
    for wrapper in ["Nullable(", "LowCardinality("] {
        if let Some(rest) = inner.strip_prefix(wrapper) {
            inner = rest.trim_end_matches(')');
        }
    }
    match inner {
        "Int8" | "Int16" | "Int32" | "UInt8" | "UInt16" | "UInt32" => UnifiedDataType::Integer,
        "Int64" | "UInt64" => UnifiedDataType::Bigint,
        "Float32" | "Float64" => UnifiedDataType::Float,
        "Bool" => UnifiedDataType::Boolean,
        "Date" | "Date32" => UnifiedDataType::Date,
        "String" | "FixedString" | "UUID" => UnifiedDataType::String,
        "JSON" => UnifiedDataType::Json,
        other if other.starts_with("DateTime64") => UnifiedDataType::Timestamp,
        other if other.starts_with("DateTime") => UnifiedDataType::Datetime,
        other if other.starts_with("Decimal") => UnifiedDataType::Numeric,
        other if other.starts_with("FixedString") => UnifiedDataType::String,
        other => UnifiedDataType::from_tag(other),
    }
}

fn clickhouse_type_from_unified(data_type: &UnifiedDataType) -> String {
    match data_type {
        UnifiedDataType::String => "String".into(),
        UnifiedDataType::Integer => "Int32".into(),
        UnifiedDataType::Bigint => "Int64".into(),
        UnifiedDataType::Float => "Float64".into(),
        UnifiedDataType::Boolean => "Bool".into(),
        UnifiedDataType::Timestamp => "DateTime64(6, 'UTC')".into(),
        UnifiedDataType::Date => "Date32".into(),
        UnifiedDataType::Time => "String".into(),
        UnifiedDataType::Datetime => "DateTime".into(),
        UnifiedDataType::Bytes => "String".into(),
        UnifiedDataType::Numeric => "Decimal(38, 9)".into(),
        UnifiedDataType::Json => "String".into(),
        UnifiedDataType::Extension(tag) => tag.clone(),
        _ => "String".into(),
    }
}

struct ChHandle {
    http: reqwest::Client,
    base: String,
    user: Option<String>,
    password: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl ChHandle {
    fn open(
        host: &str,
        port: u16,
        database: &str,
        credentials: &Credentials,
    ) -> Result<Arc<ChHandle>> {
        Ok(Arc::new(ChHandle {
            http: reqwest::Client::new(),
            base: format!("http://{host}:{port}/"),
            user: credentials.username.clone(),
            password: credentials.password.clone(),
            host: host.to_string(),
            port,
            database: database.to_string(),
        }))
    }

    /// Run one statement; the response body is returned verbatim.
    async fn run(&self, sql: &str) -> Result<String> {
        let mut request = self
            .http
            .post(&self.base)
            .query(&[("database", self.database.as_str())])
            .body(sql.to_string());
        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }
        let response = request.send().await.map_err(|err| {
            Error::connection(EngineType::ClickHouse, &self.host, self.port, err)
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            Error::connection(EngineType::ClickHouse, &self.host, self.port, err)
        })?;
        if !status.is_success() {
            return Err(Error::query(sql, std::io::Error::other(body)));
        }
        Ok(body)
    }

    /// Run a SELECT with `FORMAT JSONEachRow` appended and parse the rows.
    async fn query_rows(&self, sql: &str) -> Result<Vec<Row>> {
        let body = self.run(&format!("{sql} FORMAT JSONEachRow")).await?;
        let mut rows = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let json: serde_json::Value = serde_json::from_str(line)?;
            rows.push(row_from_json(json));
        }
        Ok(rows)
    }

    async fn query_scalar(&self, sql: &str) -> Result<i64> {
        let body = self.run(sql).await?;
        body.trim()
            .parse::<i64>()
            .or_else(|_| body.trim().parse::<f64>().map(|f| f as i64))
            .map_err(|_| Error::query(sql, std::io::Error::other(format!("non-numeric reply {body:?}"))))
    }
}

#[async_trait]
impl NativeHandle for ChHandle {
    async fn ping(&self) -> Result<()> {
        self.run("SELECT 1").await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        // Stateless HTTP; nothing held open.
        Ok(())
    }
}

/// The ClickHouse adapter value registered at process start.
#[derive(Default)]
pub struct ClickHouseAdapter;

impl ClickHouseAdapter {
    pub fn new() -> ClickHouseAdapter {
        ClickHouseAdapter
    }
}

#[async_trait]
impl Adapter for ClickHouseAdapter {
    fn engine(&self) -> EngineType {
        EngineType::ClickHouse
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        if config.database.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "connection {}: clickhouse requires a database name",
                config.id
            )));
        }
        let handle = ChHandle::open(
            &config.host,
            config.port,
            &config.database,
            &config.credentials,
        )?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::ClickHouse);
        let ops = Arc::new(ChOps {
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
            Arc::new(UnsupportedReplication::new(
                EngineType::ClickHouse,
                CDC_REASON,
            )),
        ))
    }

    async fn connect_instance(&self, config: InstanceConfig) -> Result<InstanceConnection> {
        config.validate()?;
        let handle = ChHandle::open(&config.host, config.port, "default", &config.credentials)?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::ClickHouse);
        let ops = Arc::new(ChOps {
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

struct ChOps {
    state: Arc<ConnState>,
    handle: Arc<ChHandle>,
}

#[async_trait]
impl SchemaOperator for ChOps {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new(self.handle.database.clone());
        let rows = self
            .handle
            .query_rows(
                "SELECT table, name, type, is_in_primary_key FROM system.columns \
                 WHERE database = currentDatabase() ORDER BY table, position",
            )
            .await?;
        for row in rows {
            let table_name = row.get("table").and_then(Value::as_str).unwrap_or_default().to_string();
            let column_name = row.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let native = row.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
            let in_pk = row.get("is_in_primary_key").and_then(Value::as_i64).unwrap_or(0) != 0;
            if table_name.is_empty() || column_name.is_empty() {
                continue;
            }
            let table = model
                .tables
                .entry(table_name.clone())
                .or_insert_with(|| Table::new(table_name));
            let mut column = Column::new(column_name, unified_type_from_clickhouse(&native));
            column.nullable = native.starts_with("Nullable(");
            column.primary_key = in_pk;
            column.options.insert("native_type".into(), native);
            table.columns.push(column);
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        for table in model.tables.values() {
            let defs: Vec<String> = table
                .columns
                .iter()
                .map(|column| {
                    let mut native = clickhouse_type_from_unified(&column.data_type);
                    if column.nullable && !column.primary_key {
                        native = format!("Nullable({native})");
                    }
                    format!("{} {}", quote_ident(&column.name), native)
                })
                .collect();
            let pk = table.primary_key_columns();
            let order_by = if pk.is_empty() {
                "tuple()".to_string()
            } else {
                format!(
                    "({})",
                    pk.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
                )
            };
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = MergeTree ORDER BY {}",
                quote_ident(&table.name),
                defs.join(", "),
                order_by
            );
            self.handle.run(&ddl).await?;
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let rows = self
            .handle
            .query_rows(
                "SELECT name FROM system.tables \
                 WHERE database = currentDatabase() AND engine NOT LIKE '%View' ORDER BY name",
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string))
            .collect())
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
impl DataOperator for ChOps {
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
        self.handle
            .query_rows(&format!(
                "SELECT {} FROM {} LIMIT {}",
                projection,
                quote_ident(table),
                limit
            ))
            .await
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut body = format!("INSERT INTO {} FORMAT JSONEachRow\n", quote_ident(table));
        for row in rows {
            body.push_str(&row_to_json(row).to_string());
            body.push('\n');
        }
        self.handle.run(&body).await?;
        Ok(rows.len() as u64)
    }

    async fn update(&self, _table: &str, rows: &[Row], _where_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        Err(Error::unsupported(
            EngineType::ClickHouse,
            "update",
            IMMUTABLE_REASON,
        ))
    }

    async fn upsert(&self, _table: &str, rows: &[Row], _unique_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        Err(Error::unsupported(
            EngineType::ClickHouse,
            "upsert",
            IMMUTABLE_REASON,
        ))
    }

    async fn delete(&self, _table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        Err(Error::unsupported(
            EngineType::ClickHouse,
            "delete",
            RETENTION_REASON,
        ))
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
        let rows = self.handle.query_rows(&sql).await?;
        Ok(StreamResult::offset_page(rows, params.batch_size, offset))
    }

    async fn execute_query(&self, query: &str, _args: &[Value]) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        self.handle.query_rows(query).await
    }

    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle.query_scalar(query).await
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        let mut sql = format!("SELECT count() FROM {}", quote_ident(table));
        if let Some(clause) = where_clause {
            if !clause.trim().is_empty() {
                sql.push_str(&format!(" WHERE {clause}"));
            }
        }
        Ok((self.handle.query_scalar(&sql).await?, true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        for table in self.list_tables().await? {
            self.handle
                .run(&format!("TRUNCATE TABLE {}", quote_ident(&table)))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataOperator for ChOps {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("clickhouse".into()));
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
        metadata.insert("database_type".into(), Value::String("clickhouse".into()));
        metadata.insert(
            "host".into(),
            Value::String(format!("{}:{}", self.handle.host, self.handle.port)),
        );
        let count = self
            .handle
            .query_scalar("SELECT count() FROM system.databases WHERE name NOT IN ('system', 'INFORMATION_SCHEMA', 'information_schema')")
            .await?;
        metadata.insert("database_count".into(), Value::Int(count));
        Ok(metadata)
    }

    async fn get_version(&self) -> Result<String> {
        self.state.ensure_open()?;
        let body = self.handle.run("SELECT version()").await?;
        Ok(body.trim().to_string())
    }

    fn unique_identifier(&self) -> String {
        format!(
            "clickhouse::{}:{}::{}",
            self.handle.host, self.handle.port, self.handle.database
        )
    }

    async fn get_database_size(&self) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle
            .query_scalar(
                "SELECT coalesce(sum(bytes_on_disk), 0) FROM system.parts \
                 WHERE database = currentDatabase() AND active",
            )
            .await
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle
            .query_scalar(
                "SELECT count() FROM system.tables \
                 WHERE database = currentDatabase() AND engine NOT LIKE '%View'",
            )
            .await
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        Ok(self.handle.run(command).await?.into_bytes())
    }
}

#[async_trait]
impl InstanceOperator for ChOps {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let rows = self
            .handle
            .query_rows(
                "SELECT name FROM system.databases \
                 WHERE name NOT IN ('system', 'INFORMATION_SCHEMA', 'information_schema') \
                 ORDER BY name",
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        self.handle
            .run(&format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(name)))
            .await
            .map(|_| ())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        self.handle
            .run(&format!("DROP DATABASE {}", quote_ident(name)))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nullable_wrappers_are_unwrapped() {
        assert_eq!(
            unified_type_from_clickhouse("Nullable(Int64)"),
            UnifiedDataType::Bigint
        );
        assert_eq!(
            unified_type_from_clickhouse("LowCardinality(String)"),
            UnifiedDataType::String
        );
        assert_eq!(
            unified_type_from_clickhouse("DateTime64(6, 'UTC')"),
            UnifiedDataType::Timestamp
        );
        assert_eq!(
            unified_type_from_clickhouse("Map(String, String)"),
            UnifiedDataType::Extension("Map(String, String)".into())
        );
    }

    #[test]
    fn reverse_map_produces_mergetree_types() {
        assert_eq!(clickhouse_type_from_unified(&UnifiedDataType::Bigint), "Int64");
        assert_eq!(
            clickhouse_type_from_unified(&UnifiedDataType::Timestamp),
            "DateTime64(6, 'UTC')"
        );
    }
}
