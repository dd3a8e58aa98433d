//! Redis adapter, handle, and operators.

use crate::replication::RedisReplication;
use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, InstanceOperator,
    MetadataOperator, NativeHandle, SchemaOperator, StreamParams, StreamResult,
};
use anchor::prelude::*;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Hashes sampled per prefix when synthesising a pseudo-schema.
const SCHEMA_SAMPLE: usize = 100;

/// SCAN page size used by full-keyspace walks.
const SCAN_COUNT: usize = 200;

pub(crate) struct RedisHandle {
    pub manager: ConnectionManager,
    pub client: redis::Client,
    pub host: String,
    pub port: u16,
    pub db_index: i64,
}

impl RedisHandle {
    pub(crate) async fn open(
        host: &str,
        port: u16,
        database: &str,
        credentials: &Credentials,
    ) -> Result<Arc<RedisHandle>> {
        let db_index: i64 = database.parse().unwrap_or(0);
        let auth = match (&credentials.username, &credentials.password) {
            (Some(user), Some(password)) => format!("{user}:{password}@"),
            (None, Some(password)) => format!(":{password}@"),
            _ => String::new(),
        };
        let url = format!("redis://{auth}{host}:{port}/{db_index}");
        let client = redis::Client::open(url)
            .map_err(|err| Error::connection(EngineType::Redis, host, port, err))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| Error::connection(EngineType::Redis, host, port, err))?;
        Ok(Arc::new(RedisHandle {
            manager,
            client,
            host: host.to_string(),
            port,
            db_index,
        }))
    }

    pub(crate) fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// All keys matching the pattern, walked with SCAN.
    pub(crate) async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|err| Error::query("SCAN", err))?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    pub(crate) async fn read_hash(&self, key: &str) -> Result<Row> {
        let mut conn = self.conn();
        let fields: BTreeMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|err| Error::query("HGETALL", err))?;
        let mut row: Row = fields
            .into_iter()
            .map(|(k, v)| (k, parse_scalar(&v)))
            .collect();
        row.insert("_key".into(), Value::String(key.to_string()));
        Ok(row)
    }
}

/// Stored strings come back typed when they parse cleanly.
fn parse_scalar(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Int(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

fn key_for(table: &str, row: &Row, unique_columns: &[String]) -> String {
    if let Some(Value::String(key)) = row.get("_key") {
        return key.clone();
    }
    if !unique_columns.is_empty() {
        let suffix: Vec<String> = unique_columns
            .iter()
            .map(|c| row.get(c).map(Value::to_parameter_string).unwrap_or_default())
            .collect();
        return format!("{table}:{}", suffix.join(":"));
    }
    format!("{table}:{}", Uuid::new_v4().simple())
}

fn hash_fields(row: &Row) -> Vec<(String, String)> {
    row.iter()
        .filter(|(name, _)| name.as_str() != "_key")
        .map(|(name, value)| (name.clone(), value.to_parameter_string()))
        .collect()
}

fn row_matches(row: &Row, conditions: &Row) -> bool {
    conditions.iter().all(|(k, v)| row.get(k) == Some(v))
}

/// The Redis adapter value registered at process start.
#[derive(Default)]
pub struct RedisAdapter;

impl RedisAdapter {
    pub fn new() -> RedisAdapter {
        RedisAdapter
    }
}

#[async_trait]
impl Adapter for RedisAdapter {
    fn engine(&self) -> EngineType {
        EngineType::Redis
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        let handle = RedisHandle::open(
            &config.host,
            config.port,
            &config.database,
            &config.credentials,
        )
        .await?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::Redis);
        let ops = Arc::new(RedisOps {
            state: Arc::clone(&state),
            handle: Arc::clone(&handle),
        });
        let replication = Arc::new(RedisReplication::new(
            Arc::clone(&state),
            Arc::clone(&handle),
        ));
        Ok(Connection::new(
            config,
            state,
            handle,
            Arc::clone(&ops) as Arc<dyn SchemaOperator>,
            Arc::clone(&ops) as Arc<dyn DataOperator>,
            ops as Arc<dyn MetadataOperator>,
            replication,
        ))
    }

    async fn connect_instance(&self, config: InstanceConfig) -> Result<InstanceConnection> {
        config.validate()?;
        let handle = RedisHandle::open(&config.host, config.port, "0", &config.credentials).await?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::Redis);
        let ops = Arc::new(RedisOps {
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

struct RedisOps {
    state: Arc<ConnState>,
    handle: Arc<RedisHandle>,
}

#[async_trait]
impl NativeHandle for RedisHandle {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|err| Error::connection(EngineType::Redis, &self.host, self.port, err))
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager tears down with the last clone.
        Ok(())
    }
}

#[async_trait]
impl SchemaOperator for RedisOps {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new(format!("db{}", self.handle.db_index));
        for table in self.list_tables().await? {
            model.add_table(self.get_table_schema(&table).await?);
        }
        Ok(model)
    }

    async fn create_structure(&self, _model: &UnifiedModel) -> Result<()> {
        // Keys materialize on first write; nothing to pre-create.
        self.state.ensure_open()
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let keys = self.handle.keys_matching("*").await?;
        let mut prefixes: Vec<String> = keys
            .iter()
            .filter_map(|key| key.split_once(':').map(|(prefix, _)| prefix.to_string()))
            .collect();
        prefixes.sort();
        prefixes.dedup();
        Ok(prefixes)
    }

    async fn get_table_schema(&self, table: &str) -> Result<Table> {
        self.state.ensure_open()?;
        let keys = self.handle.keys_matching(&format!("{table}:*")).await?;
        let mut schema = Table::new(table);
        let mut key_column = Column::new("_key", UnifiedDataType::String);
        key_column.primary_key = true;
        key_column.nullable = false;
        schema.columns.push(key_column);

        let mut seen: Vec<String> = Vec::new();
        for key in keys.iter().take(SCHEMA_SAMPLE) {
            let row = self.handle.read_hash(key).await?;
            for (field, value) in &row {
                if field == "_key" || seen.iter().any(|s| s == field) {
                    continue;
                }
                seen.push(field.clone());
                let data_type = match value {
                    Value::Int(_) => UnifiedDataType::Bigint,
                    Value::Float(_) => UnifiedDataType::Float,
                    Value::Bool(_) => UnifiedDataType::Boolean,
                    _ => UnifiedDataType::String,
                };
                schema.columns.push(Column::new(field.clone(), data_type));
            }
        }
        schema.options.insert("sampled".into(), "true".into());
        Ok(schema)
    }
}

#[async_trait]
impl DataOperator for RedisOps {
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
        let mut keys = self.handle.keys_matching(&format!("{table}:*")).await?;
        keys.sort();
        keys.truncate(limit);
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let row = self.handle.read_hash(&key).await?;
            if columns.is_empty() {
                rows.push(row);
            } else {
                rows.push(
                    columns
                        .iter()
                        .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                        .collect(),
                );
            }
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.handle.conn();
        for row in rows {
            let key = key_for(table, row, &[]);
            let fields = hash_fields(row);
            if fields.is_empty() {
                continue;
            }
            conn.hset_multiple::<_, _, _, ()>(&key, &fields)
                .await
                .map_err(|err| Error::query("HSET", err))?;
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
        let existing = self.fetch(table, usize::MAX).await?;
        let mut conn = self.handle.conn();
        let mut affected = 0u64;
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
            for row in existing.iter().filter(|r| row_matches(r, &conditions)) {
                let Some(Value::String(key)) = row.get("_key") else {
                    continue;
                };
                let fields: Vec<(String, String)> = update
                    .iter()
                    .filter(|(name, _)| {
                        name.as_str() != "_key" && !where_columns.contains(*name)
                    })
                    .map(|(name, value)| (name.clone(), value.to_parameter_string()))
                    .collect();
                if fields.is_empty() {
                    continue;
                }
                conn.hset_multiple::<_, _, _, ()>(key, &fields)
                    .await
                    .map_err(|err| Error::query("HSET", err))?;
                affected += 1;
            }
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
        let mut conn = self.handle.conn();
        for row in rows {
            let key = key_for(table, row, unique_columns);
            let fields = hash_fields(row);
            if fields.is_empty() {
                continue;
            }
            conn.hset_multiple::<_, _, _, ()>(&key, &fields)
                .await
                .map_err(|err| Error::query("HSET", err))?;
        }
        Ok(rows.len() as u64)
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        let existing = self.fetch(table, usize::MAX).await?;
        let mut conn = self.handle.conn();
        let mut affected = 0u64;
        for row in existing.iter().filter(|r| row_matches(r, conditions)) {
            let Some(Value::String(key)) = row.get("_key") else {
                continue;
            };
            let removed: i64 = conn.del(key).await.map_err(|err| Error::query("DEL", err))?;
            affected += removed as u64;
        }
        Ok(affected)
    }

    /// The cursor is the native SCAN cursor; `has_more` follows the cursor,
    /// not the page size, because SCAN's COUNT is a hint.
    async fn stream(&self, params: &StreamParams) -> Result<StreamResult> {
        self.state.ensure_open()?;
        let cursor: u64 = match &params.cursor {
            None => 0,
            Some(raw) => raw.parse().map_err(|_| {
                Error::InvalidConfiguration(format!("stream cursor {raw:?} is not a SCAN cursor"))
            })?,
        };
        let mut conn = self.handle.conn();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(format!("{}:*", params.table))
            .arg("COUNT")
            .arg(params.batch_size)
            .query_async(&mut conn)
            .await
            .map_err(|err| Error::query("SCAN", err))?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let row = self.handle.read_hash(&key).await?;
            if params.columns.is_empty() {
                rows.push(row);
            } else {
                rows.push(
                    params
                        .columns
                        .iter()
                        .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                        .collect(),
                );
            }
        }
        let has_more = next != 0;
        Ok(StreamResult {
            rows,
            has_more,
            next_cursor: has_more.then(|| next.to_string()),
        })
    }

    /// Raw command pass-through, whitespace-tokenized.
    async fn execute_query(&self, query: &str, _args: &[Value]) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        let mut tokens = query.split_whitespace();
        let Some(name) = tokens.next() else {
            return Err(Error::InvalidConfiguration("empty command".into()));
        };
        let mut cmd = redis::cmd(name);
        for token in tokens {
            cmd.arg(token);
        }
        let mut conn = self.handle.conn();
        let value: redis::Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| Error::query(query, err))?;
        let mut row = Row::new();
        row.insert("result".into(), redis_value_to_value(&value));
        Ok(vec![row])
    }

    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        let rows = self.execute_query(query, &[]).await?;
        rows.first()
            .and_then(|row| row.get("result"))
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::query(query, std::io::Error::other("non-integer reply")))
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        if where_clause.is_some_and(|w| !w.trim().is_empty()) {
            return Err(Error::unsupported(
                EngineType::Redis,
                "get_row_count",
                "predicates do not apply to a keyspace",
            ));
        }
        let keys = self.handle.keys_matching(&format!("{table}:*")).await?;
        Ok((keys.len() as i64, true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        let mut conn = self.handle.conn();
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|err| Error::query("FLUSHDB", err))
    }
}

fn redis_value_to_value(value: &redis::Value) -> Value {
    match value {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(n) => Value::Int(*n),
        redis::Value::Double(f) => Value::Float(*f),
        redis::Value::Boolean(b) => Value::Bool(*b),
        redis::Value::BulkString(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::Bytes(bytes.clone()),
        },
        redis::Value::SimpleString(s) => Value::String(s.clone()),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            Value::List(items.iter().map(redis_value_to_value).collect())
        }
        redis::Value::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| {
                    (
                        redis_value_to_value(k).to_parameter_string(),
                        redis_value_to_value(v),
                    )
                })
                .collect(),
        ),
        other => Value::String(format!("{other:?}")),
    }
}

#[async_trait]
impl MetadataOperator for RedisOps {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut conn = self.handle.conn();
        let size: i64 = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(|err| Error::query("DBSIZE", err))?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("redis".into()));
        metadata.insert(
            "database_name".into(),
            Value::String(format!("db{}", self.handle.db_index)),
        );
        metadata.insert("key_count".into(), Value::Int(size));
        metadata.insert("version".into(), Value::String(self.get_version().await?));
        Ok(metadata)
    }

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("redis".into()));
        metadata.insert(
            "host".into(),
            Value::String(format!("{}:{}", self.handle.host, self.handle.port)),
        );
        metadata.insert("version".into(), Value::String(self.get_version().await?));
        Ok(metadata)
    }

    async fn get_version(&self) -> Result<String> {
        self.state.ensure_open()?;
        let mut conn = self.handle.conn();
        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut conn)
            .await
            .map_err(|err| Error::query("INFO", err))?;
        Ok(info
            .lines()
            .find_map(|line| line.strip_prefix("redis_version:"))
            .unwrap_or("unknown")
            .trim()
            .to_string())
    }

    fn unique_identifier(&self) -> String {
        format!(
            "redis::{}:{}::db{}",
            self.handle.host, self.handle.port, self.handle.db_index
        )
    }

    async fn get_database_size(&self) -> Result<i64> {
        self.state.ensure_open()?;
        let mut conn = self.handle.conn();
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(|err| Error::query("INFO", err))?;
        Ok(info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0))
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        Ok(self.list_tables().await?.len() as i64)
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        let rows = self.execute_query(command, &[]).await?;
        let rendered: Vec<serde_json::Value> =
            rows.iter().map(anchor::value::row_to_json).collect();
        Ok(serde_json::to_vec(&rendered)?)
    }
}

#[async_trait]
impl InstanceOperator for RedisOps {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let mut conn = self.handle.conn();
        let config: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("databases")
            .query_async(&mut conn)
            .await
            .map_err(|err| Error::query("CONFIG GET databases", err))?;
        let count: usize = config
            .get(1)
            .and_then(|v| v.parse().ok())
            .unwrap_or(16);
        Ok((0..count).map(|i| i.to_string()).collect())
    }

    async fn create_database(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported(
            EngineType::Redis,
            "create_database",
            "logical databases are a fixed numbered set",
        ))
    }

    async fn drop_database(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported(
            EngineType::Redis,
            "drop_database",
            "logical databases are a fixed numbered set; FLUSHDB clears one",
        ))
    }
}
