//! SQLite adapter, handle, and operators.

use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, MetadataOperator,
    NativeHandle, SchemaOperator, StreamParams, StreamResult, UnsupportedReplication,
};
use anchor::prelude::*;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use std::collections::BTreeMap;
use std::sync::Arc;

const CDC_REASON: &str = "single-file engine exposes no change log to attach to";

/// Double-quote an identifier.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn unified_type_from_sqlite(declared: &str) -> UnifiedDataType {
    let upper = declared.to_uppercase();
    if upper.contains("INT") {
        UnifiedDataType::Bigint
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        UnifiedDataType::String
    } else if upper.contains("BLOB") || upper.is_empty() {
        UnifiedDataType::Bytes
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        UnifiedDataType::Float
    } else if upper.contains("BOOL") {
        UnifiedDataType::Boolean
    } else if upper.contains("NUMERIC") || upper.contains("DECIMAL") {
        UnifiedDataType::Numeric
    } else if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
        UnifiedDataType::Datetime
    } else if upper.contains("DATE") {
        UnifiedDataType::Date
    } else if upper.contains("JSON") {
        UnifiedDataType::Json
    } else {
        UnifiedDataType::from_tag(declared)
    }
}

fn sqlite_type_from_unified(data_type: &UnifiedDataType) -> &'static str {
    match data_type {
        UnifiedDataType::Integer | UnifiedDataType::Bigint | UnifiedDataType::Boolean => "INTEGER",
        UnifiedDataType::Float => "REAL",
        UnifiedDataType::Bytes => "BLOB",
        UnifiedDataType::Numeric => "NUMERIC",
        _ => "TEXT",
    }
}

fn to_sqlite(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Int(n) => Sql::Integer(*n),
        Value::Float(f) => Sql::Real(*f),
        Value::Bytes(b) => Sql::Blob(b.clone()),
        Value::String(s) => Sql::Text(s.clone()),
        Value::Timestamp(ts) => Sql::Text(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        Value::List(_) | Value::Map(_) => Sql::Text(value.to_json().to_string()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Int(n),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => {
            // Text columns always surface as strings, even when stored as
            // raw byte buffers.
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    }
}

struct SqliteHandle {
    conn: Arc<Mutex<Option<rusqlite::Connection>>>,
    path: String,
}

impl SqliteHandle {
    fn open(path: &str) -> Result<Arc<SqliteHandle>> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|err| Error::connection(EngineType::Sqlite, path, 0, err))?;
        Ok(Arc::new(SqliteHandle {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: path.to_string(),
        }))
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard.as_ref().ok_or(Error::ConnectionClosed)?;
            f(conn)
        })
        .await
        .map_err(|err| Error::Fatal(format!("blocking task panicked: {err}")))?
    }

    fn query_rows(
        conn: &rusqlite::Connection,
        sql: &str,
        params: &[rusqlite::types::Value],
    ) -> Result<Vec<Row>> {
        let mut stmt = conn.prepare(sql).map_err(|err| Error::query(sql, err))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|err| Error::query(sql, err))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|err| Error::query(sql, err))? {
            let mut map = Row::new();
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i).map_err(|err| Error::query(sql, err))?;
                map.insert(name.clone(), from_sqlite(value));
            }
            out.push(map);
        }
        Ok(out)
    }

    fn execute(
        conn: &rusqlite::Connection,
        sql: &str,
        params: &[rusqlite::types::Value],
    ) -> Result<u64> {
        conn.execute(sql, rusqlite::params_from_iter(params.iter()))
            .map(|n| n as u64)
            .map_err(|err| Error::query(sql, err))
    }
}

#[async_trait]
impl NativeHandle for SqliteHandle {
    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|err| Error::query("SELECT 1", err))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // Dropping the connection closes the file handle.
            conn.lock().take();
        })
        .await
        .map_err(|err| Error::Fatal(format!("blocking task panicked: {err}")))?;
        Ok(())
    }
}

/// The SQLite adapter value registered at process start.
#[derive(Default)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    pub fn new() -> SqliteAdapter {
        SqliteAdapter
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    fn engine(&self) -> EngineType {
        EngineType::Sqlite
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        // The generic host/endpoint requirement does not apply to a file
        // engine; the database path is the whole address.
        if config.id.is_empty() {
            return Err(Error::InvalidConfiguration(
                "connection id must not be empty".into(),
            ));
        }
        if config.database.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "connection {}: sqlite requires a database file path",
                config.id
            )));
        }
        let handle = SqliteHandle::open(&config.database)?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::Sqlite);
        let ops = Arc::new(SqliteOps {
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
            Arc::new(UnsupportedReplication::new(EngineType::Sqlite, CDC_REASON)),
        ))
    }

    async fn connect_instance(&self, _config: InstanceConfig) -> Result<InstanceConnection> {
        Err(Error::unsupported(
            EngineType::Sqlite,
            "connect_instance",
            "a database file has no server instance to manage",
        ))
    }
}

struct SqliteOps {
    state: Arc<ConnState>,
    handle: Arc<SqliteHandle>,
}

impl SqliteOps {
    fn insert_values(columns: &[String], rows: &[Row]) -> Vec<rusqlite::types::Value> {
        let mut values = Vec::with_capacity(columns.len() * rows.len());
        for row in rows {
            for column in columns {
                values.push(to_sqlite(row.get(column).unwrap_or(&Value::Null)));
            }
        }
        values
    }
}

#[async_trait]
impl SchemaOperator for SqliteOps {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let path = self.handle.path.clone();
        self.handle
            .with_conn(move |conn| {
                let mut model = UnifiedModel::new(path);
                const TABLES: &str = "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
                let names: Vec<String> = {
                    let mut stmt = conn.prepare(TABLES).map_err(|e| Error::query(TABLES, e))?;
                    let rows = stmt
                        .query_map([], |row| row.get::<_, String>(0))
                        .map_err(|e| Error::query(TABLES, e))?;
                    rows.filter_map(|r| r.ok()).collect()
                };
                for name in names {
                    let info_sql = format!("PRAGMA table_info({})", quote_ident(&name));
                    let mut table = Table::new(name.clone());
                    let mut stmt =
                        conn.prepare(&info_sql).map_err(|e| Error::query(&info_sql, e))?;
                    let mut rows = stmt.query([]).map_err(|e| Error::query(&info_sql, e))?;
                    while let Some(row) = rows.next().map_err(|e| Error::query(&info_sql, e))? {
                        let column_name: String =
                            row.get(1).map_err(|e| Error::query(&info_sql, e))?;
                        let declared: String = row.get(2).unwrap_or_default();
                        let not_null: bool = row.get::<_, i64>(3).map(|v| v != 0).unwrap_or(false);
                        let default_value: Option<String> = row.get(4).ok();
                        let pk: bool = row.get::<_, i64>(5).map(|v| v != 0).unwrap_or(false);

                        let mut column =
                            Column::new(column_name, unified_type_from_sqlite(&declared));
                        column.nullable = !not_null && !pk;
                        column.primary_key = pk;
                        column.default_value = default_value;
                        table.columns.push(column);
                    }
                    model.add_table(table);
                }
                Ok(model)
            })
            .await
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        let tables: Vec<Table> = model.tables.values().cloned().collect();
        self.handle
            .with_conn(move |conn| {
                for table in &tables {
                    let mut defs: Vec<String> = table
                        .columns
                        .iter()
                        .map(|column| {
                            let mut def = format!(
                                "{} {}",
                                quote_ident(&column.name),
                                sqlite_type_from_unified(&column.data_type)
                            );
                            if !column.nullable {
                                def.push_str(" NOT NULL");
                            }
                            if let Some(default) = &column.default_value {
                                def.push_str(&format!(" DEFAULT {default}"));
                            }
                            def
                        })
                        .collect();
                    let pk = table.primary_key_columns();
                    if !pk.is_empty() {
                        defs.push(format!(
                            "PRIMARY KEY ({})",
                            pk.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
                        ));
                    }
                    let ddl = format!(
                        "CREATE TABLE IF NOT EXISTS {} ({})",
                        quote_ident(&table.name),
                        defs.join(", ")
                    );
                    SqliteHandle::execute(conn, &ddl, &[])?;
                    for index in &table.indexes {
                        let unique = if index.unique { "UNIQUE " } else { "" };
                        let sql = format!(
                            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
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
                        SqliteHandle::execute(conn, &sql, &[])?;
                    }
                }
                Ok(())
            })
            .await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        self.handle
            .with_conn(|conn| {
                const SQL: &str = "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
                let mut stmt = conn.prepare(SQL).map_err(|e| Error::query(SQL, e))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|e| Error::query(SQL, e))?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            })
            .await
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
impl DataOperator for SqliteOps {
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
        self.handle
            .with_conn(move |conn| SqliteHandle::query_rows(conn, &sql, &[]))
            .await
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let columns: Vec<String> = first.keys().cloned().collect();
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(table),
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            vec![placeholders; rows.len()].join(", ")
        );
        let values = Self::insert_values(&columns, rows);
        self.handle
            .with_conn(move |conn| SqliteHandle::execute(conn, &sql, &values))
            .await
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
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                quote_ident(table),
                set_columns
                    .iter()
                    .map(|c| format!("{} = ?", quote_ident(c)))
                    .collect::<Vec<_>>()
                    .join(", "),
                where_columns
                    .iter()
                    .map(|c| format!("{} = ?", quote_ident(c)))
                    .collect::<Vec<_>>()
                    .join(" AND ")
            );
            let mut values: Vec<rusqlite::types::Value> = set_columns
                .iter()
                .map(|c| to_sqlite(row.get(c).unwrap_or(&Value::Null)))
                .collect();
            for column in where_columns {
                let value = row.get(column).ok_or_else(|| {
                    Error::InvalidConfiguration(format!("update row is missing where column {column}"))
                })?;
                values.push(to_sqlite(value));
            }
            affected += self
                .handle
                .with_conn(move |conn| SqliteHandle::execute(conn, &sql, &values))
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
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !unique_columns.contains(c))
                .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
                .collect();
            let action = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
                quote_ident(table),
                columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
                vec!["?"; columns.len()].join(", "),
                unique_columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", "),
                action
            );
            let values: Vec<rusqlite::types::Value> = columns
                .iter()
                .map(|c| to_sqlite(row.get(c).unwrap_or(&Value::Null)))
                .collect();
            self.handle
                .with_conn(move |conn| SqliteHandle::execute(conn, &sql, &values))
                .await?;
        }
        Ok(rows.len() as u64)
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = conditions.keys().cloned().collect();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(table),
            columns
                .iter()
                .map(|c| format!("{} = ?", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(" AND ")
        );
        let values: Vec<rusqlite::types::Value> = columns
            .iter()
            .map(|c| to_sqlite(conditions.get(c).unwrap_or(&Value::Null)))
            .collect();
        self.handle
            .with_conn(move |conn| SqliteHandle::execute(conn, &sql, &values))
            .await
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
        let rows = self
            .handle
            .with_conn(move |conn| SqliteHandle::query_rows(conn, &sql, &[]))
            .await?;
        Ok(StreamResult::offset_page(rows, params.batch_size, offset))
    }

    async fn execute_query(&self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        let sql = query.to_string();
        let values: Vec<rusqlite::types::Value> = args.iter().map(to_sqlite).collect();
        self.handle
            .with_conn(move |conn| SqliteHandle::query_rows(conn, &sql, &values))
            .await
    }

    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        let sql = query.to_string();
        self.handle
            .with_conn(move |conn| {
                conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                    .map_err(|err| Error::query(&sql, err))
            })
            .await
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        if let Some(clause) = where_clause {
            if !clause.trim().is_empty() {
                sql.push_str(&format!(" WHERE {clause}"));
            }
        }
        let count = self
            .handle
            .with_conn(move |conn| {
                conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                    .map_err(|err| Error::query(&sql, err))
            })
            .await?;
        Ok((count, true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        let tables = self.list_tables().await?;
        self.handle
            .with_conn(move |conn| {
                for table in &tables {
                    let sql = format!("DELETE FROM {}", quote_ident(table));
                    SqliteHandle::execute(conn, &sql, &[])?;
                }
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl MetadataOperator for SqliteOps {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("sqlite".into()));
        metadata.insert("database_path".into(), Value::String(self.handle.path.clone()));
        metadata.insert("size_bytes".into(), Value::Int(self.get_database_size().await?));
        metadata.insert("table_count".into(), Value::Int(self.get_table_count().await?));
        metadata.insert("version".into(), Value::String(self.get_version().await?));
        Ok(metadata)
    }

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
        Err(Error::unsupported(
            EngineType::Sqlite,
            "collect_instance_metadata",
            "a database file has no server instance",
        ))
    }

    async fn get_version(&self) -> Result<String> {
        self.state.ensure_open()?;
        self.handle
            .with_conn(|conn| {
                conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))
                    .map_err(|err| Error::query("SELECT sqlite_version()", err))
            })
            .await
    }

    fn unique_identifier(&self) -> String {
        format!("sqlite::file::{}", self.handle.path)
    }

    async fn get_database_size(&self) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(|err| Error::query("pragma_page_count", err))
            })
            .await
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        self.handle
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(|err| Error::query("sqlite_master count", err))
            })
            .await
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        let sql = command.to_string();
        let rows = self
            .handle
            .with_conn(move |conn| SqliteHandle::query_rows(conn, &sql, &[]))
            .await?;
        let rendered: Vec<serde_json::Value> =
            rows.iter().map(anchor::value::row_to_json).collect();
        Ok(serde_json::to_vec(&rendered)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor::adapter::Adapter as _;

    fn config(path: &std::path::Path) -> ConnectionConfig {
        ConnectionConfig {
            id: "db_sqlite".into(),
            engine: EngineType::Sqlite,
            database: path.to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    fn row(id: i64, name: &str) -> Row {
        Row::from([
            ("id".to_string(), Value::Int(id)),
            ("name".to_string(), Value::String(name.into())),
        ])
    }

    fn users_model() -> UnifiedModel {
        let mut model = UnifiedModel::new("test");
        model.add_table(
            Table::new("users")
                .with_column(Column::new("id", UnifiedDataType::Bigint).primary_key())
                .with_column(Column::new("name", UnifiedDataType::String)),
        );
        model
    }

    #[tokio::test]
    async fn round_trip_create_insert_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let conn = SqliteAdapter::new()
            .connect(config(&dir.path().join("t.db")))
            .await
            .unwrap();

        let discovered = conn.schema().unwrap().discover_schema().await.unwrap();
        assert!(discovered.tables.is_empty());

        conn.schema().unwrap().create_structure(&users_model()).await.unwrap();
        // Idempotent re-create.
        conn.schema().unwrap().create_structure(&users_model()).await.unwrap();

        let discovered = conn.schema().unwrap().discover_schema().await.unwrap();
        assert_eq!(discovered.tables["users"].primary_key_columns(), vec!["id"]);

        let data = conn.data().unwrap();
        assert_eq!(data.insert("users", &[row(1, "a"), row(2, "b")]).await.unwrap(), 2);
        let rows = data.fetch("users", 10).await.unwrap();
        assert_eq!(rows, vec![row(1, "a"), row(2, "b")]);
        assert_eq!(data.get_row_count("users", None).await.unwrap(), (2, true));

        conn.close().await.unwrap();
        assert!(matches!(conn.close().await.unwrap_err(), Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn upsert_and_update_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let conn = SqliteAdapter::new()
            .connect(config(&dir.path().join("t.db")))
            .await
            .unwrap();
        conn.schema().unwrap().create_structure(&users_model()).await.unwrap();
        let data = conn.data().unwrap();

        data.insert("users", &[row(1, "a")]).await.unwrap();
        assert_eq!(
            data.upsert("users", &[row(1, "a2"), row(2, "b")], &["id".into()])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            data.fetch("users", 10).await.unwrap(),
            vec![row(1, "a2"), row(2, "b")]
        );

        assert_eq!(
            data.update("users", &[row(2, "b2")], &["id".into()]).await.unwrap(),
            1
        );
        let conditions = Row::from([("id".to_string(), Value::Int(1))]);
        assert_eq!(data.delete("users", &conditions).await.unwrap(), 1);
        assert_eq!(data.get_row_count("users", None).await.unwrap(), (1, true));
    }

    #[tokio::test]
    async fn stream_pagination_collects_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let conn = SqliteAdapter::new()
            .connect(config(&dir.path().join("t.db")))
            .await
            .unwrap();
        conn.schema().unwrap().create_structure(&users_model()).await.unwrap();
        let data = conn.data().unwrap();
        let rows: Vec<Row> = (0..17).map(|i| row(i, "x")).collect();
        data.insert("users", &rows).await.unwrap();

        let mut collected = 0;
        let mut params = StreamParams::new("users", 4);
        loop {
            let page = data.stream(&params).await.unwrap();
            collected += page.rows.len();
            if !page.has_more {
                break;
            }
            params = params.after(page.next_cursor);
        }
        assert_eq!(collected, 17);
    }

    #[tokio::test]
    async fn replication_is_a_typed_gap() {
        let dir = tempfile::tempdir().unwrap();
        let conn = SqliteAdapter::new()
            .connect(config(&dir.path().join("t.db")))
            .await
            .unwrap();
        let replication = conn.replication().unwrap();
        assert!(!replication.is_supported());
        let err = replication.check_prerequisites().await.unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn empty_inputs_are_no_ops() {
        let dir = tempfile::tempdir().unwrap();
        let conn = SqliteAdapter::new()
            .connect(config(&dir.path().join("t.db")))
            .await
            .unwrap();
        conn.schema().unwrap().create_structure(&users_model()).await.unwrap();
        let data = conn.data().unwrap();
        assert_eq!(data.insert("users", &[]).await.unwrap(), 0);
        assert_eq!(data.update("users", &[], &["id".into()]).await.unwrap(), 0);
        assert_eq!(data.delete("users", &Row::new()).await.unwrap(), 0);
    }
}
