//! S3 adapter, handle, and operators.

use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, InstanceOperator,
    MetadataOperator, NativeHandle, SchemaOperator, StreamParams, StreamResult,
    UnsupportedReplication,
};
use anchor::model::Blob;
use anchor::prelude::*;
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials as AwsCredentials, Region};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

const CDC_REASON: &str =
    "bucket notifications route through an external queue, not a pollable log";

/// Bodies above this size are never inlined into a row.
const SMALL_BODY_CAP: i64 = 1 << 20;

const DEFAULT_REGION: &str = "us-east-1";

struct S3Handle {
    client: Client,
    pub bucket: String,
    pub endpoint: String,
}

impl S3Handle {
    async fn open(
        endpoint: Option<&str>,
        host: &str,
        port: u16,
        bucket: &str,
        credentials: &Credentials,
    ) -> Result<Arc<S3Handle>> {
        let region = credentials
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region));
        if let (Some(key), Some(secret)) =
            (&credentials.access_key_id, &credentials.secret_access_key)
        {
            loader = loader.credentials_provider(AwsCredentials::new(
                key,
                secret,
                credentials.session_token.clone(),
                None,
                "anchor-config",
            ));
        }
        let base = loader.load().await;

        let endpoint_url = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| format!("http://{host}:{port}"));
        let mut builder = aws_sdk_s3::config::Builder::from(&base);
        if endpoint.is_some() || !host.is_empty() {
            builder = builder.endpoint_url(&endpoint_url);
        }
        if credentials.path_style {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        Ok(Arc::new(S3Handle {
            client,
            bucket: bucket.to_string(),
            endpoint: endpoint_url,
        }))
    }

    fn wrap<E>(&self, op: &str, err: E) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::query(op, err)
    }

    /// One listing page. `after` is exclusive, mirroring `start-after`.
    async fn list_page(
        &self,
        prefix: &str,
        after: Option<&str>,
        max: i32,
    ) -> Result<Vec<(String, i64, Option<String>, Option<i64>)>> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(max);
        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }
        if let Some(after) = after {
            request = request.start_after(after);
        }
        let response = request
            .send()
            .await
            .map_err(|err| self.wrap("list_objects_v2", err))?;
        Ok(response
            .contents()
            .iter()
            .filter_map(|object| {
                object.key().map(|key| {
                    (
                        key.to_string(),
                        object.size().unwrap_or(0),
                        object.e_tag().map(str::to_string),
                        object.last_modified().map(|t| t.to_millis().unwrap_or(0)),
                    )
                })
            })
            .collect())
    }

    /// Walk the whole prefix.
    async fn list_all(&self, prefix: &str) -> Result<Vec<(String, i64, Option<String>, Option<i64>)>> {
        let mut out = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self.list_page(prefix, after.as_deref(), 1000).await?;
            let Some(last) = page.last().map(|(key, ..)| key.clone()) else {
                break;
            };
            out.extend(page);
            after = Some(last);
        }
        Ok(out)
    }
}

#[async_trait]
impl NativeHandle for S3Handle {
    async fn ping(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| Error::connection(EngineType::S3, &self.endpoint, 0, err))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn object_row(key: &str, size: i64, etag: Option<String>, modified_ms: Option<i64>) -> Row {
    let mut row = Row::new();
    row.insert("_key".into(), Value::String(key.to_string()));
    row.insert("size".into(), Value::Int(size));
    row.insert(
        "etag".into(),
        etag.map(Value::String).unwrap_or(Value::Null),
    );
    row.insert(
        "last_modified".into(),
        modified_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
    );
    row
}

fn prefix_of(key: &str) -> Option<&str> {
    key.split_once('/').map(|(prefix, _)| prefix)
}

/// The S3 adapter value registered at process start.
#[derive(Default)]
pub struct S3Adapter;

impl S3Adapter {
    pub fn new() -> S3Adapter {
        S3Adapter
    }
}

#[async_trait]
impl Adapter for S3Adapter {
    fn engine(&self) -> EngineType {
        EngineType::S3
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        if config.database.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "connection {}: s3 requires a bucket name",
                config.id
            )));
        }
        let handle = S3Handle::open(
            config.endpoint.as_deref(),
            &config.host,
            config.port,
            &config.database,
            &config.credentials,
        )
        .await?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::S3);
        let ops = Arc::new(S3Ops {
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
            Arc::new(UnsupportedReplication::new(EngineType::S3, CDC_REASON)),
        ))
    }

    async fn connect_instance(&self, config: InstanceConfig) -> Result<InstanceConnection> {
        config.validate()?;
        let handle = S3Handle::open(
            config.endpoint.as_deref(),
            &config.host,
            config.port,
            "",
            &config.credentials,
        )
        .await?;

        let state = ConnState::new(config.id.clone(), EngineType::S3);
        let ops = Arc::new(S3Ops {
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

struct S3Ops {
    state: Arc<ConnState>,
    handle: Arc<S3Handle>,
}

impl S3Ops {
    async fn body_of(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .handle
            .client
            .get_object()
            .bucket(&self.handle.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| self.handle.wrap("get_object", err))?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|err| self.handle.wrap("get_object_body", err))?;
        Ok(bytes.into_bytes().to_vec())
    }
}

#[async_trait]
impl SchemaOperator for S3Ops {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new(self.handle.bucket.clone());
        let objects = self.handle.list_all("").await?;
        let mut prefixes: Vec<String> = Vec::new();
        for (key, size, etag, modified_ms) in &objects {
            model.blobs.insert(
                key.clone(),
                Blob {
                    key: key.clone(),
                    size: *size,
                    etag: etag.clone(),
                    last_modified: modified_ms
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                    content_type: None,
                },
            );
            if let Some(prefix) = prefix_of(key) {
                if !prefixes.iter().any(|p| p == prefix) {
                    prefixes.push(prefix.to_string());
                }
            }
        }
        for prefix in prefixes {
            model.add_table(object_table(&prefix));
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        // Prefixes materialize with their first object; seed a zero-byte
        // marker so the pseudo-table is listable immediately.
        for name in model.tables.keys() {
            let key = format!("{name}/");
            self.handle
                .client
                .put_object()
                .bucket(&self.handle.bucket)
                .key(&key)
                .body(Vec::new().into())
                .send()
                .await
                .map_err(|err| self.handle.wrap("put_object", err))?;
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let objects = self.handle.list_all("").await?;
        let mut prefixes: Vec<String> = objects
            .iter()
            .filter_map(|(key, ..)| prefix_of(key).map(str::to_string))
            .collect();
        prefixes.sort();
        prefixes.dedup();
        Ok(prefixes)
    }

    async fn get_table_schema(&self, table: &str) -> Result<Table> {
        self.state.ensure_open()?;
        Ok(object_table(table))
    }
}

fn object_table(name: &str) -> Table {
    let mut table = Table::new(name);
    let mut key = Column::new("_key", UnifiedDataType::String);
    key.primary_key = true;
    key.nullable = false;
    table.columns.push(key);
    table.columns.push(Column::new("size", UnifiedDataType::Bigint));
    table.columns.push(Column::new("etag", UnifiedDataType::String));
    table
        .columns
        .push(Column::new("last_modified", UnifiedDataType::Timestamp));
    table.columns.push(Column::new("content", UnifiedDataType::Bytes));
    table
}

#[async_trait]
impl DataOperator for S3Ops {
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
        let prefix = format!("{table}/");
        let objects = self
            .handle
            .list_page(&prefix, None, limit.min(i32::MAX as usize) as i32)
            .await?;
        let want_content = columns.iter().any(|c| c == "content");
        let mut rows = Vec::with_capacity(objects.len());
        for (key, size, etag, modified_ms) in objects.into_iter().take(limit) {
            let mut row = object_row(&key, size, etag, modified_ms);
            if want_content && size <= SMALL_BODY_CAP {
                row.insert("content".into(), Value::Bytes(self.body_of(&key).await?));
            }
            if !columns.is_empty() {
                row.retain(|name, _| columns.contains(name));
            }
            rows.push(row);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        for row in rows {
            let key = match row.get("_key").and_then(Value::as_str) {
                Some(key) if key.starts_with(&format!("{table}/")) => key.to_string(),
                Some(key) => format!("{table}/{key}"),
                None => {
                    return Err(Error::InvalidConfiguration(
                        "object rows need a _key column".into(),
                    ))
                }
            };
            let body = match row.get("content") {
                Some(Value::Bytes(bytes)) => bytes.clone(),
                Some(Value::String(text)) => text.clone().into_bytes(),
                Some(other) => other.to_json().to_string().into_bytes(),
                None => anchor::value::row_to_json(row).to_string().into_bytes(),
            };
            self.handle
                .client
                .put_object()
                .bucket(&self.handle.bucket)
                .key(&key)
                .body(body.into())
                .send()
                .await
                .map_err(|err| self.handle.wrap("put_object", err))?;
        }
        Ok(rows.len() as u64)
    }

    async fn update(&self, _table: &str, rows: &[Row], _where_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        Err(Error::unsupported(
            EngineType::S3,
            "update",
            "objects are replaced wholesale with PUT; partial row updates do not exist",
        ))
    }

    async fn upsert(&self, table: &str, rows: &[Row], unique_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        if unique_columns != ["_key".to_string()] {
            return Err(Error::unsupported(
                EngineType::S3,
                "upsert",
                "objects key on _key; PUT is the only identity",
            ));
        }
        self.insert(table, rows).await
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        let Some(Value::String(key)) = conditions.get("_key") else {
            return Err(Error::unsupported(
                EngineType::S3,
                "delete",
                "objects delete by _key equality only",
            ));
        };
        let key = if key.starts_with(&format!("{table}/")) {
            key.clone()
        } else {
            format!("{table}/{key}")
        };
        self.handle
            .client
            .delete_object()
            .bucket(&self.handle.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| self.handle.wrap("delete_object", err))?;
        Ok(1)
    }

    /// The cursor is the last key of the previous page (`start-after`).
    async fn stream(&self, params: &StreamParams) -> Result<StreamResult> {
        self.state.ensure_open()?;
        if params.filter.is_some() {
            return Err(Error::unsupported(
                EngineType::S3,
                "stream",
                "listings filter by prefix only",
            ));
        }
        let prefix = format!("{}/", params.table);
        let objects = self
            .handle
            .list_page(
                &prefix,
                params.cursor.as_deref(),
                params.batch_size.min(i32::MAX as usize) as i32,
            )
            .await?;
        let rows: Vec<Row> = objects
            .iter()
            .map(|(key, size, etag, modified_ms)| {
                object_row(key, *size, etag.clone(), *modified_ms)
            })
            .collect();
        let last_key = objects.last().map(|(key, ..)| key.clone());
        Ok(StreamResult::token_page(rows, params.batch_size, last_key))
    }

    async fn execute_query(&self, _query: &str, _args: &[Value]) -> Result<Vec<Row>> {
        Err(Error::unsupported(
            EngineType::S3,
            "execute_query",
            "buckets have no query language; use fetch or stream",
        ))
    }

    /// The query text is a prefix; counts objects under it.
    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        Ok(self.handle.list_all(query.trim()).await?.len() as i64)
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        if where_clause.is_some_and(|w| !w.trim().is_empty()) {
            return Err(Error::unsupported(
                EngineType::S3,
                "get_row_count",
                "listings filter by prefix only",
            ));
        }
        let count = self.handle.list_all(&format!("{table}/")).await?.len();
        Ok((count as i64, true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        let objects = self.handle.list_all("").await?;
        for chunk in objects.chunks(1000) {
            let identifiers: Vec<ObjectIdentifier> = chunk
                .iter()
                .filter_map(|(key, ..)| {
                    ObjectIdentifier::builder().key(key.clone()).build().ok()
                })
                .collect();
            if identifiers.is_empty() {
                continue;
            }
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(|err| self.handle.wrap("delete_builder", err))?;
            self.handle
                .client
                .delete_objects()
                .bucket(&self.handle.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| self.handle.wrap("delete_objects", err))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataOperator for S3Ops {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let objects = self.handle.list_all("").await?;
        let total: i64 = objects.iter().map(|(_, size, ..)| size).sum();
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("s3".into()));
        metadata.insert("bucket".into(), Value::String(self.handle.bucket.clone()));
        metadata.insert("object_count".into(), Value::Int(objects.len() as i64));
        metadata.insert("size_bytes".into(), Value::Int(total));
        Ok(metadata)
    }

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let response = self
            .handle
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|err| self.handle.wrap("list_buckets", err))?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("s3".into()));
        metadata.insert(
            "bucket_count".into(),
            Value::Int(response.buckets().len() as i64),
        );
        metadata.insert(
            "endpoint".into(),
            Value::String(self.handle.endpoint.clone()),
        );
        Ok(metadata)
    }

    async fn get_version(&self) -> Result<String> {
        // The protocol has no version probe; report the API family.
        Ok("s3/2006-03-01".into())
    }

    fn unique_identifier(&self) -> String {
        format!("s3::{}::{}", self.handle.endpoint, self.handle.bucket)
    }

    async fn get_database_size(&self) -> Result<i64> {
        self.state.ensure_open()?;
        let objects = self.handle.list_all("").await?;
        Ok(objects.iter().map(|(_, size, ..)| size).sum())
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        let objects = self.handle.list_all("").await?;
        let mut prefixes: Vec<&str> = objects
            .iter()
            .filter_map(|(key, ..)| prefix_of(key))
            .collect();
        prefixes.sort_unstable();
        prefixes.dedup();
        Ok(prefixes.len() as i64)
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        // `head <key>` is the one admin probe the protocol offers.
        let Some(key) = command.strip_prefix("head ") else {
            return Err(Error::unsupported(
                EngineType::S3,
                "execute_command",
                "only `head <key>` is available against a bucket",
            ));
        };
        let response = self
            .handle
            .client
            .head_object()
            .bucket(&self.handle.bucket)
            .key(key.trim())
            .send()
            .await
            .map_err(|err| self.handle.wrap("head_object", err))?;
        let rendered = serde_json::json!({
            "key": key.trim(),
            "size": response.content_length().unwrap_or(0),
            "etag": response.e_tag(),
            "content_type": response.content_type(),
        });
        Ok(serde_json::to_vec(&rendered)?)
    }
}

#[async_trait]
impl InstanceOperator for S3Ops {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let response = self
            .handle
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|err| self.handle.wrap("list_buckets", err))?;
        let mut names: Vec<String> = response
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        self.handle
            .client
            .create_bucket()
            .bucket(name)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| self.handle.wrap("create_bucket", err))
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        self.handle
            .client
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| self.handle.wrap("delete_bucket", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_split_on_first_slash() {
        assert_eq!(prefix_of("logs/2024/01.json"), Some("logs"));
        assert_eq!(prefix_of("toplevel"), None);
    }

    #[test]
    fn object_rows_carry_reserved_columns() {
        let row = object_row("logs/a.json", 42, Some("\"abc\"".into()), Some(0));
        assert_eq!(row.get("_key"), Some(&Value::String("logs/a.json".into())));
        assert_eq!(row.get("size"), Some(&Value::Int(42)));
        assert!(matches!(row.get("last_modified"), Some(Value::Timestamp(_))));
    }
}
