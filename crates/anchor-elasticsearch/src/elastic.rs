//! Elasticsearch adapter, handle, and operators.

use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, MetadataOperator,
    NativeHandle, SchemaOperator, StreamParams, StreamResult, UnsupportedReplication,
};
use anchor::prelude::*;
use anchor::value::{row_from_json, row_to_json};
use async_trait::async_trait;
use elasticsearch::cat::CatIndicesParts;
use elasticsearch::http::transport::Transport;
use elasticsearch::indices::{
    IndicesCreateParts, IndicesDeleteParts, IndicesGetMappingParts,
};
use elasticsearch::{
    BulkOperation, BulkParts, CountParts, DeleteByQueryParts, Elasticsearch, SearchParts,
};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;

const CDC_REASON: &str = "no change feed is exposed; reindex from the source of truth instead";

fn unified_type_from_es(mapping_type: &str) -> UnifiedDataType {
    match mapping_type {
        "integer" | "short" | "byte" => UnifiedDataType::Integer,
        "long" => UnifiedDataType::Bigint,
        "float" | "double" | "half_float" | "scaled_float" => UnifiedDataType::Float,
        "boolean" => UnifiedDataType::Boolean,
        "date" => UnifiedDataType::Timestamp,
        "binary" => UnifiedDataType::Bytes,
        "object" | "nested" | "flattened" => UnifiedDataType::Json,
        "text" | "keyword" | "ip" | "wildcard" => UnifiedDataType::String,
        other => UnifiedDataType::from_tag(other),
    }
}

fn es_type_from_unified(data_type: &UnifiedDataType) -> &'static str {
    match data_type {
        UnifiedDataType::Integer => "integer",
        UnifiedDataType::Bigint => "long",
        UnifiedDataType::Float => "double",
        UnifiedDataType::Boolean => "boolean",
        UnifiedDataType::Timestamp | UnifiedDataType::Datetime | UnifiedDataType::Date => "date",
        UnifiedDataType::Bytes => "binary",
        UnifiedDataType::Json => "object",
        _ => "keyword",
    }
}

struct EsHandle {
    client: Elasticsearch,
    pub host: String,
    pub port: u16,
}

impl EsHandle {
    fn open(
        host: &str,
        port: u16,
        endpoint: Option<&str>,
        credentials: &Credentials,
    ) -> Result<Arc<EsHandle>> {
        let url = match endpoint {
            Some(url) => url.to_string(),
            None => match (&credentials.username, &credentials.password) {
                (Some(user), Some(password)) => {
                    format!("http://{user}:{password}@{host}:{port}")
                }
                _ => format!("http://{host}:{port}"),
            },
        };
        let transport = Transport::single_node(&url)
            .map_err(|err| Error::connection(EngineType::Elasticsearch, host, port, err))?;
        Ok(Arc::new(EsHandle {
            client: Elasticsearch::new(transport),
            host: host.to_string(),
            port,
        }))
    }

    async fn json_of(
        &self,
        response: elasticsearch::http::response::Response,
        op: &str,
    ) -> Result<Json> {
        let status = response.status_code();
        let body: Json = response
            .json()
            .await
            .map_err(|err| Error::query(op, err))?;
        if !status.is_success() {
            return Err(Error::query(op, std::io::Error::other(body.to_string())));
        }
        Ok(body)
    }
}

#[async_trait]
impl NativeHandle for EsHandle {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .send()
            .await
            .map(|_| ())
            .map_err(|err| {
                Error::connection(EngineType::Elasticsearch, &self.host, self.port, err)
            })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Hit source plus the reserved `_id` column.
fn hit_to_row(hit: &Json) -> Row {
    let mut row = hit
        .get("_source")
        .cloned()
        .map(row_from_json)
        .unwrap_or_default();
    if let Some(id) = hit.get("_id").and_then(Json::as_str) {
        row.insert("_id".into(), Value::String(id.to_string()));
    }
    row
}

/// Split the reserved `_id` column from the document body.
fn row_to_doc(row: &Row) -> (Option<String>, Json) {
    let id = row.get("_id").and_then(|v| v.as_str().map(str::to_string));
    let body: Row = row
        .iter()
        .filter(|(name, _)| name.as_str() != "_id")
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    (id, row_to_json(&body))
}

/// The Elasticsearch adapter value registered at process start.
#[derive(Default)]
pub struct ElasticsearchAdapter;

impl ElasticsearchAdapter {
    pub fn new() -> ElasticsearchAdapter {
        ElasticsearchAdapter
    }
}

#[async_trait]
impl Adapter for ElasticsearchAdapter {
    fn engine(&self) -> EngineType {
        EngineType::Elasticsearch
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        let handle = EsHandle::open(
            &config.host,
            config.port,
            config.endpoint.as_deref(),
            &config.credentials,
        )?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::Elasticsearch);
        let ops = Arc::new(EsOps {
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
                EngineType::Elasticsearch,
                CDC_REASON,
            )),
        ))
    }

    async fn connect_instance(&self, _config: InstanceConfig) -> Result<InstanceConnection> {
        Err(Error::unsupported(
            EngineType::Elasticsearch,
            "connect_instance",
            "a cluster has indices, not databases; use a database-scoped connection",
        ))
    }
}

struct EsOps {
    state: Arc<ConnState>,
    handle: Arc<EsHandle>,
}

impl EsOps {
    async fn index_names(&self) -> Result<Vec<String>> {
        let response = self
            .handle
            .client
            .cat()
            .indices(CatIndicesParts::None)
            .format("json")
            .send()
            .await
            .map_err(|err| Error::query("cat_indices", err))?;
        let body = self.handle.json_of(response, "cat_indices").await?;
        let mut names: Vec<String> = body
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("index").and_then(Json::as_str))
                    .filter(|name| !name.starts_with('.'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl SchemaOperator for EsOps {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new("elasticsearch".to_string());
        for name in self.index_names().await? {
            model.add_table(self.get_table_schema(&name).await?);
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        let existing = self.index_names().await?;
        for table in model.tables.values() {
            if existing.contains(&table.name) {
                continue;
            }
            let mut properties = serde_json::Map::new();
            for column in &table.columns {
                if column.name == "_id" {
                    continue;
                }
                properties.insert(
                    column.name.clone(),
                    json!({"type": es_type_from_unified(&column.data_type)}),
                );
            }
            let response = self
                .handle
                .client
                .indices()
                .create(IndicesCreateParts::Index(&table.name))
                .body(json!({"mappings": {"properties": properties}}))
                .send()
                .await
                .map_err(|err| Error::query("indices_create", err))?;
            self.handle.json_of(response, "indices_create").await?;
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        self.index_names().await
    }

    async fn get_table_schema(&self, table: &str) -> Result<Table> {
        self.state.ensure_open()?;
        let response = self
            .handle
            .client
            .indices()
            .get_mapping(IndicesGetMappingParts::Index(&[table]))
            .send()
            .await
            .map_err(|err| Error::query("get_mapping", err))?;
        let body = self.handle.json_of(response, "get_mapping").await?;
        let properties = body
            .get(table)
            .and_then(|index| index.pointer("/mappings/properties"))
            .and_then(Json::as_object)
            .cloned()
            .unwrap_or_default();

        let mut schema = Table::new(table);
        let mut id_column = Column::new("_id", UnifiedDataType::String);
        id_column.primary_key = true;
        id_column.nullable = false;
        schema.columns.push(id_column);
        for (field, spec) in properties {
            let mapping_type = spec.get("type").and_then(Json::as_str).unwrap_or("object");
            schema
                .columns
                .push(Column::new(field, unified_type_from_es(mapping_type)));
        }
        Ok(schema)
    }
}

#[async_trait]
impl DataOperator for EsOps {
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
        let mut body = json!({"query": {"match_all": {}}, "size": limit});
        if !columns.is_empty() {
            body["_source"] = json!(columns);
        }
        let response = self
            .handle
            .client
            .search(SearchParts::Index(&[table]))
            .body(body)
            .send()
            .await
            .map_err(|err| Error::query("search", err))?;
        let body = self.handle.json_of(response, "search").await?;
        Ok(body
            .pointer("/hits/hits")
            .and_then(Json::as_array)
            .map(|hits| hits.iter().map(hit_to_row).collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut operations: Vec<BulkOperation<Json>> = Vec::with_capacity(rows.len());
        for row in rows {
            let (id, doc) = row_to_doc(row);
            let operation = match id {
                Some(id) => BulkOperation::index(doc).id(id).into(),
                None => BulkOperation::index(doc).into(),
            };
            operations.push(operation);
        }
        let response = self
            .handle
            .client
            .bulk(BulkParts::Index(table))
            .body(operations)
            .refresh(elasticsearch::params::Refresh::True)
            .send()
            .await
            .map_err(|err| Error::query("bulk", err))?;
        let body = self.handle.json_of(response, "bulk").await?;
        if body.get("errors").and_then(Json::as_bool).unwrap_or(false) {
            return Err(Error::query(
                "bulk",
                std::io::Error::other("bulk response reported item errors"),
            ));
        }
        Ok(rows.len() as u64)
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        if where_columns != ["_id".to_string()] {
            return Err(Error::unsupported(
                EngineType::Elasticsearch,
                "update",
                "documents update by _id only; use a query DSL update_by_query for predicates",
            ));
        }
        let mut operations: Vec<BulkOperation<Json>> = Vec::with_capacity(rows.len());
        for row in rows {
            let (id, doc) = row_to_doc(row);
            let id = id.ok_or_else(|| {
                Error::InvalidConfiguration("update row is missing where column _id".into())
            })?;
            operations.push(BulkOperation::update(id, json!({"doc": doc})).into());
        }
        let response = self
            .handle
            .client
            .bulk(BulkParts::Index(table))
            .body(operations)
            .refresh(elasticsearch::params::Refresh::True)
            .send()
            .await
            .map_err(|err| Error::query("bulk_update", err))?;
        self.handle.json_of(response, "bulk_update").await?;
        Ok(rows.len() as u64)
    }

    async fn upsert(&self, table: &str, rows: &[Row], unique_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        if unique_columns != ["_id".to_string()] {
            return Err(Error::unsupported(
                EngineType::Elasticsearch,
                "upsert",
                "documents key on _id; other unique columns have no index-level identity",
            ));
        }
        // Indexing by id is upsert semantics natively.
        self.insert(table, rows).await
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        let term_queries: Vec<Json> = conditions
            .iter()
            .map(|(field, value)| {
                let field = if field == "_id" {
                    "_id".to_string()
                } else {
                    field.clone()
                };
                json!({"term": {field: value.to_json()}})
            })
            .collect();
        let response = self
            .handle
            .client
            .delete_by_query(DeleteByQueryParts::Index(&[table]))
            .body(json!({"query": {"bool": {"must": term_queries}}}))
            .refresh(true)
            .send()
            .await
            .map_err(|err| Error::query("delete_by_query", err))?;
        let body = self.handle.json_of(response, "delete_by_query").await?;
        Ok(body.get("deleted").and_then(Json::as_u64).unwrap_or(0))
    }

    async fn stream(&self, params: &StreamParams) -> Result<StreamResult> {
        self.state.ensure_open()?;
        let offset = params.offset()?;
        let query: Json = match &params.filter {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => json!({"match_all": {}}),
        };
        let mut body = json!({
            "query": query,
            "from": offset,
            "size": params.batch_size,
            "sort": [{"_doc": "asc"}],
        });
        if !params.columns.is_empty() {
            body["_source"] = json!(params.columns);
        }
        let response = self
            .handle
            .client
            .search(SearchParts::Index(&[&params.table]))
            .body(body)
            .send()
            .await
            .map_err(|err| Error::query("stream_search", err))?;
        let body = self.handle.json_of(response, "stream_search").await?;
        let rows: Vec<Row> = body
            .pointer("/hits/hits")
            .and_then(Json::as_array)
            .map(|hits| hits.iter().map(hit_to_row).collect())
            .unwrap_or_default();
        Ok(StreamResult::offset_page(rows, params.batch_size, offset))
    }

    /// The query text is a search body in query DSL; an optional leading
    /// `<index>|` selects the index, else all indices are searched.
    async fn execute_query(&self, query: &str, _args: &[Value]) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        let (index, body_text) = match query.split_once('|') {
            Some((index, rest)) if !index.trim().is_empty() && !index.contains('{') => {
                (Some(index.trim().to_string()), rest)
            }
            _ => (None, query),
        };
        let body: Json = serde_json::from_str(body_text)?;
        let indices: Vec<&str> = index.as_deref().map(|i| vec![i]).unwrap_or_default();
        let parts = if indices.is_empty() {
            SearchParts::None
        } else {
            SearchParts::Index(&indices)
        };
        let response = self
            .handle
            .client
            .search(parts)
            .body(body)
            .send()
            .await
            .map_err(|err| Error::query("search", err))?;
        let body = self.handle.json_of(response, "search").await?;
        Ok(body
            .pointer("/hits/hits")
            .and_then(Json::as_array)
            .map(|hits| hits.iter().map(hit_to_row).collect())
            .unwrap_or_default())
    }

    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        let (index, body_text) = match query.split_once('|') {
            Some((index, rest)) if !index.trim().is_empty() && !index.contains('{') => {
                (Some(index.trim().to_string()), rest)
            }
            _ => (None, query),
        };
        let body: Json = if body_text.trim().is_empty() {
            json!({"query": {"match_all": {}}})
        } else {
            serde_json::from_str(body_text)?
        };
        let indices: Vec<&str> = index.as_deref().map(|i| vec![i]).unwrap_or_default();
        let parts = if indices.is_empty() {
            CountParts::None
        } else {
            CountParts::Index(&indices)
        };
        let response = self
            .handle
            .client
            .count(parts)
            .body(body)
            .send()
            .await
            .map_err(|err| Error::query("count", err))?;
        let body = self.handle.json_of(response, "count").await?;
        Ok(body.get("count").and_then(Json::as_i64).unwrap_or(0))
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        let body: Json = match where_clause {
            Some(raw) if !raw.trim().is_empty() => json!({"query": serde_json::from_str::<Json>(raw)?}),
            _ => json!({"query": {"match_all": {}}}),
        };
        let response = self
            .handle
            .client
            .count(CountParts::Index(&[table]))
            .body(body)
            .send()
            .await
            .map_err(|err| Error::query("count", err))?;
        let body = self.handle.json_of(response, "count").await?;
        Ok((body.get("count").and_then(Json::as_i64).unwrap_or(0), true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        for index in self.index_names().await? {
            let response = self
                .handle
                .client
                .indices()
                .delete(IndicesDeleteParts::Index(&[&index]))
                .send()
                .await
                .map_err(|err| Error::query("indices_delete", err))?;
            self.handle.json_of(response, "indices_delete").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataOperator for EsOps {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "database_type".into(),
            Value::String("elasticsearch".into()),
        );
        metadata.insert(
            "host".into(),
            Value::String(format!("{}:{}", self.handle.host, self.handle.port)),
        );
        metadata.insert("index_count".into(), Value::Int(self.get_table_count().await?));
        metadata.insert("version".into(), Value::String(self.get_version().await?));
        Ok(metadata)
    }

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.collect_database_metadata().await
    }

    async fn get_version(&self) -> Result<String> {
        self.state.ensure_open()?;
        let response = self
            .handle
            .client
            .info()
            .send()
            .await
            .map_err(|err| Error::query("info", err))?;
        let body = self.handle.json_of(response, "info").await?;
        Ok(body
            .pointer("/version/number")
            .and_then(Json::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    fn unique_identifier(&self) -> String {
        format!("elasticsearch::{}:{}::_all", self.handle.host, self.handle.port)
    }

    async fn get_database_size(&self) -> Result<i64> {
        self.state.ensure_open()?;
        let response = self
            .handle
            .client
            .cat()
            .indices(CatIndicesParts::None)
            .format("json")
            .bytes(elasticsearch::params::Bytes::B)
            .send()
            .await
            .map_err(|err| Error::query("cat_indices", err))?;
        let body = self.handle.json_of(response, "cat_indices").await?;
        Ok(body
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item.get("store.size")
                            .and_then(Json::as_str)
                            .and_then(|s| s.parse::<i64>().ok())
                    })
                    .sum()
            })
            .unwrap_or(0))
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        Ok(self.index_names().await?.len() as i64)
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        // Cluster-level GET pass-through, e.g. `_cluster/health`.
        let response = self
            .handle
            .client
            .send::<String, ()>(
                elasticsearch::http::Method::Get,
                command,
                elasticsearch::http::headers::HeaderMap::new(),
                None,
                None,
                None,
            )
            .await
            .map_err(|err| Error::query(command, err))?;
        let body = self.handle.json_of(response, command).await?;
        Ok(serde_json::to_vec(&body)?)
    }
}
