//! Cassandra adapter, handle, and operators.

use crate::literal::{
    cql_to_value, cql_type_from_unified, literal, quote_ident, unified_type_from_cql,
};
use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, InstanceOperator,
    MetadataOperator, NativeHandle, SchemaOperator, StreamParams, StreamResult,
    UnsupportedReplication,
};
use anchor::prelude::*;
use async_trait::async_trait;
use scylla::{Session, SessionBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;

const CDC_REASON: &str =
    "commitlog CDC tables are not wired into this build; capture from the write path instead";

struct CassandraHandle {
    session: Session,
    pub host: String,
    pub port: u16,
    pub keyspace: String,
}

impl CassandraHandle {
    async fn open(
        host: &str,
        port: u16,
        keyspace: &str,
        credentials: &Credentials,
    ) -> Result<Arc<CassandraHandle>> {
        let mut builder = SessionBuilder::new().known_node(format!("{host}:{port}"));
        if let (Some(user), Some(password)) = (&credentials.username, &credentials.password) {
            builder = builder.user(user, password);
        }
        let session = builder
            .build()
            .await
            .map_err(|err| Error::connection(EngineType::Cassandra, host, port, err))?;
        Ok(Arc::new(CassandraHandle {
            session,
            host: host.to_string(),
            port,
            keyspace: keyspace.to_string(),
        }))
    }

    /// Fully-qualified table name within the connection's keyspace.
    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.keyspace), quote_ident(table))
    }

    async fn query_rows(&self, cql: &str) -> Result<Vec<Row>> {
        let result = self
            .session
            .query_unpaged(cql, ())
            .await
            .map_err(|err| Error::query(cql, err))?;
        let names: Vec<String> = result
            .col_specs
            .iter()
            .map(|spec| spec.name.clone())
            .collect();
        let mut out = Vec::new();
        for row in result.rows.unwrap_or_default() {
            let mut map = Row::new();
            for (i, column) in row.columns.into_iter().enumerate() {
                let name = names.get(i).cloned().unwrap_or_else(|| format!("col{i}"));
                map.insert(
                    name,
                    column.as_ref().map(cql_to_value).unwrap_or(Value::Null),
                );
            }
            out.push(map);
        }
        Ok(out)
    }

    async fn execute(&self, cql: &str) -> Result<()> {
        self.session
            .query_unpaged(cql, ())
            .await
            .map(|_| ())
            .map_err(|err| Error::query(cql, err))
    }

    async fn query_scalar(&self, cql: &str) -> Result<i64> {
        let rows = self.query_rows(cql).await?;
        rows.first()
            .and_then(|row| row.values().next())
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::query(cql, std::io::Error::other("non-integer reply")))
    }
}

#[async_trait]
impl NativeHandle for CassandraHandle {
    async fn ping(&self) -> Result<()> {
        self.session
            .query_unpaged("SELECT release_version FROM system.local", ())
            .await
            .map(|_| ())
            .map_err(|err| Error::connection(EngineType::Cassandra, &self.host, self.port, err))
    }

    async fn close(&self) -> Result<()> {
        // The driver tears the pool down on drop.
        Ok(())
    }
}

/// The Cassandra adapter value registered at process start.
#[derive(Default)]
pub struct CassandraAdapter;

impl CassandraAdapter {
    pub fn new() -> CassandraAdapter {
        CassandraAdapter
    }
}

#[async_trait]
impl Adapter for CassandraAdapter {
    fn engine(&self) -> EngineType {
        EngineType::Cassandra
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        if config.database.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "connection {}: cassandra requires a keyspace name",
                config.id
            )));
        }
        let handle = CassandraHandle::open(
            &config.host,
            config.port,
            &config.database,
            &config.credentials,
        )
        .await?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::Cassandra);
        let ops = Arc::new(CassandraOps {
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
                EngineType::Cassandra,
                CDC_REASON,
            )),
        ))
    }

    async fn connect_instance(&self, config: InstanceConfig) -> Result<InstanceConnection> {
        config.validate()?;
        let handle =
            CassandraHandle::open(&config.host, config.port, "system", &config.credentials).await?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::Cassandra);
        let ops = Arc::new(CassandraOps {
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

struct CassandraOps {
    state: Arc<ConnState>,
    handle: Arc<CassandraHandle>,
}

#[async_trait]
impl SchemaOperator for CassandraOps {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new(self.handle.keyspace.clone());
        let cql = format!(
            "SELECT table_name, column_name, type, kind FROM system_schema.columns \
             WHERE keyspace_name = '{}' ALLOW FILTERING",
            self.handle.keyspace.replace('\'', "''")
        );
        for row in self.handle.query_rows(&cql).await? {
            let table_name = row.get("table_name").and_then(Value::as_str).unwrap_or_default().to_string();
            let column_name = row.get("column_name").and_then(Value::as_str).unwrap_or_default().to_string();
            let native = row.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
            let kind = row.get("kind").and_then(Value::as_str).unwrap_or_default();
            if table_name.is_empty() || column_name.is_empty() {
                continue;
            }
            let table = model
                .tables
                .entry(table_name.clone())
                .or_insert_with(|| Table::new(table_name));
            let mut column = Column::new(column_name, unified_type_from_cql(&native));
            column.primary_key = kind == "partition_key" || kind == "clustering";
            column.nullable = !column.primary_key;
            column.options.insert("kind".into(), kind.to_string());
            table.columns.push(column);
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        for table in model.tables.values() {
            let pk = table.primary_key_columns();
            if pk.is_empty() {
                return Err(Error::InvalidConfiguration(format!(
                    "table {}: cassandra tables need a primary key",
                    table.name
                )));
            }
            let defs: Vec<String> = table
                .columns
                .iter()
                .map(|column| {
                    format!(
                        "{} {}",
                        quote_ident(&column.name),
                        cql_type_from_unified(&column.data_type)
                    )
                })
                .collect();
            let cql = format!(
                "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
                self.handle.qualified(&table.name),
                defs.join(", "),
                pk.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
            );
            self.handle.execute(&cql).await?;
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let cql = format!(
            "SELECT table_name FROM system_schema.tables WHERE keyspace_name = '{}'",
            self.handle.keyspace.replace('\'', "''")
        );
        let mut names: Vec<String> = self
            .handle
            .query_rows(&cql)
            .await?
            .iter()
            .filter_map(|r| r.get("table_name").and_then(Value::as_str).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
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
impl DataOperator for CassandraOps {
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
        let cql = format!(
            "SELECT {} FROM {} LIMIT {}",
            projection,
            self.handle.qualified(table),
            limit
        );
        self.handle.query_rows(&cql).await
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        for row in rows {
            let columns: Vec<&String> = row.keys().collect();
            let cql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.handle.qualified(table),
                columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
                columns
                    .iter()
                    .map(|c| literal(row.get(*c).unwrap_or(&Value::Null)))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            self.handle.execute(&cql).await?;
        }
        Ok(rows.len() as u64)
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
        for row in rows {
            let set: Vec<String> = row
                .iter()
                .filter(|(name, _)| !where_columns.contains(name))
                .map(|(name, value)| format!("{} = {}", quote_ident(name), literal(value)))
                .collect();
            if set.is_empty() {
                continue;
            }
            let mut wher = Vec::with_capacity(where_columns.len());
            for column in where_columns {
                let value = row.get(column).ok_or_else(|| {
                    Error::InvalidConfiguration(format!("update row is missing where column {column}"))
                })?;
                wher.push(format!("{} = {}", quote_ident(column), literal(value)));
            }
            let cql = format!(
                "UPDATE {} SET {} WHERE {}",
                self.handle.qualified(table),
                set.join(", "),
                wher.join(" AND ")
            );
            self.handle.execute(&cql).await?;
        }
        // Cassandra UPDATE is an upsert and reports nothing; 1xN.
        Ok(rows.len() as u64)
    }

    async fn upsert(&self, table: &str, rows: &[Row], unique_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if unique_columns.is_empty() {
            return Err(Error::InvalidConfiguration(
                "upsert requires at least one unique column".into(),
            ));
        }
        // INSERT is upsert semantics natively; the unique columns must be
        // the table's primary key for the overwrite to land.
        self.insert(table, rows).await
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        let wher: Vec<String> = conditions
            .iter()
            .map(|(name, value)| format!("{} = {}", quote_ident(name), literal(value)))
            .collect();
        let count_cql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} ALLOW FILTERING",
            self.handle.qualified(table),
            wher.join(" AND ")
        );
        let affected = self.handle.query_scalar(&count_cql).await.unwrap_or(0);
        let cql = format!(
            "DELETE FROM {} WHERE {}",
            self.handle.qualified(table),
            wher.join(" AND ")
        );
        self.handle.execute(&cql).await?;
        Ok(affected.max(0) as u64)
    }

    /// CQL has no OFFSET; over-fetch to the cursor and skip client-side.
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
        let mut cql = format!(
            "SELECT {} FROM {}",
            projection,
            self.handle.qualified(&params.table)
        );
        if let Some(filter) = &params.filter {
            if !filter.trim().is_empty() {
                cql.push_str(&format!(" WHERE {filter} ALLOW FILTERING"));
            }
        }
        cql.push_str(&format!(" LIMIT {}", offset + params.batch_size));
        let rows: Vec<Row> = self
            .handle
            .query_rows(&cql)
            .await?
            .into_iter()
            .skip(offset)
            .collect();
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
        let mut cql = format!("SELECT COUNT(*) FROM {}", self.handle.qualified(table));
        if let Some(clause) = where_clause {
            if !clause.trim().is_empty() {
                cql.push_str(&format!(" WHERE {clause} ALLOW FILTERING"));
            }
        }
        Ok((self.handle.query_scalar(&cql).await?, true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        for table in self.list_tables().await? {
            let cql = format!("TRUNCATE {}", self.handle.qualified(&table));
            self.handle.execute(&cql).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataOperator for CassandraOps {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("cassandra".into()));
        metadata.insert(
            "keyspace".into(),
            Value::String(self.handle.keyspace.clone()),
        );
        metadata.insert("table_count".into(), Value::Int(self.get_table_count().await?));
        metadata.insert("version".into(), Value::String(self.get_version().await?));
        Ok(metadata)
    }

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("cassandra".into()));
        metadata.insert(
            "host".into(),
            Value::String(format!("{}:{}", self.handle.host, self.handle.port)),
        );
        let count = self
            .handle
            .query_scalar("SELECT COUNT(*) FROM system_schema.keyspaces")
            .await?;
        metadata.insert("keyspace_count".into(), Value::Int(count));
        Ok(metadata)
    }

    async fn get_version(&self) -> Result<String> {
        self.state.ensure_open()?;
        let rows = self
            .handle
            .query_rows("SELECT release_version FROM system.local")
            .await?;
        rows.first()
            .and_then(|r| r.get("release_version"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Fatal("release_version missing".into()))
    }

    fn unique_identifier(&self) -> String {
        format!(
            "cassandra::{}:{}::{}",
            self.handle.host, self.handle.port, self.handle.keyspace
        )
    }

    async fn get_database_size(&self) -> Result<i64> {
        // Size lives in nodetool/JMX territory, not CQL.
        Err(Error::unsupported(
            EngineType::Cassandra,
            "get_database_size",
            "table sizes are a nodetool metric, not a CQL query",
        ))
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        Ok(self.list_tables().await?.len() as i64)
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        let rows = self.handle.query_rows(command).await?;
        let rendered: Vec<serde_json::Value> =
            rows.iter().map(anchor::value::row_to_json).collect();
        Ok(serde_json::to_vec(&rendered)?)
    }
}

#[async_trait]
impl InstanceOperator for CassandraOps {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let mut names: Vec<String> = self
            .handle
            .query_rows("SELECT keyspace_name FROM system_schema.keyspaces")
            .await?
            .iter()
            .filter_map(|r| {
                r.get("keyspace_name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .filter(|name| !name.starts_with("system"))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        let cql = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = \
             {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
            quote_ident(name)
        );
        self.handle.execute(&cql).await
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        let cql = format!("DROP KEYSPACE {}", quote_ident(name));
        self.handle.execute(&cql).await
    }
}
