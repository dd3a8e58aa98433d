//! Qdrant adapter, handle, and operators.

use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, MetadataOperator,
    NativeHandle, SchemaOperator, StreamParams, StreamResult, UnsupportedReplication,
};
use anchor::prelude::*;
use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, Condition, CountPointsBuilder,
    CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId, PointStruct,
    ScrollPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
    VectorsConfig,
};
use qdrant_client::Payload;
use qdrant_client::Qdrant;
use std::collections::BTreeMap;
use std::sync::Arc;

const CDC_REASON: &str = "point mutations expose no change feed; re-embed from the source corpus";

/// Points sampled per collection when synthesising a pseudo-schema.
const SCHEMA_SAMPLE: u32 = 100;

const DEFAULT_DIMENSION: u64 = 384;

struct QdrantHandle {
    client: Qdrant,
    pub endpoint: String,
}

impl QdrantHandle {
    fn open(
        endpoint: Option<&str>,
        host: &str,
        port: u16,
        credentials: &Credentials,
    ) -> Result<Arc<QdrantHandle>> {
        let url = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| format!("http://{host}:{port}"));
        let mut builder = Qdrant::from_url(&url);
        if let Some(token) = &credentials.token {
            builder = builder.api_key(token.clone());
        }
        let client = builder
            .build()
            .map_err(|err| Error::connection(EngineType::Qdrant, host, port, err))?;
        Ok(Arc::new(QdrantHandle {
            client,
            endpoint: url,
        }))
    }
}

#[async_trait]
impl NativeHandle for QdrantHandle {
    async fn ping(&self) -> Result<()> {
        self.client
            .health_check()
            .await
            .map(|_| ())
            .map_err(|err| Error::connection(EngineType::Qdrant, &self.endpoint, 0, err))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn qdrant_to_value(value: &QdrantValue) -> Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::IntegerValue(n)) => Value::Int(*n),
        Some(Kind::DoubleValue(f)) => Value::Float(*f),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            Value::List(list.values.iter().map(qdrant_to_value).collect())
        }
        Some(Kind::StructValue(map)) => Value::Map(
            map.fields
                .iter()
                .map(|(k, v)| (k.clone(), qdrant_to_value(v)))
                .collect(),
        ),
    }
}

fn value_to_qdrant(value: &Value) -> QdrantValue {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Int(n) => Kind::IntegerValue(*n),
        Value::Float(f) => Kind::DoubleValue(*f),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Timestamp(ts) => Kind::StringValue(ts.to_rfc3339()),
        Value::Bytes(_) => Kind::StringValue(value.to_json().to_string()),
        Value::List(items) => Kind::ListValue(qdrant_client::qdrant::ListValue {
            values: items.iter().map(value_to_qdrant).collect(),
        }),
        Value::Map(map) => Kind::StructValue(qdrant_client::qdrant::Struct {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_qdrant(v)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

fn point_id_of(value: &Value) -> Result<PointId> {
    match value {
        Value::Int(n) if *n >= 0 => Ok(PointId::from(*n as u64)),
        Value::String(s) => Ok(PointId::from(s.clone())),
        other => Err(Error::InvalidConfiguration(format!(
            "point id must be a non-negative integer or uuid string, got {other}"
        ))),
    }
}

fn point_id_to_value(id: &PointId) -> Value {
    match &id.point_id_options {
        Some(PointIdOptions::Num(n)) => Value::Int(*n as i64),
        Some(PointIdOptions::Uuid(u)) => Value::String(u.clone()),
        None => Value::Null,
    }
}

fn vector_of(row: &Row) -> Result<Vec<f32>> {
    match row.get("vector") {
        Some(Value::List(items)) => items
            .iter()
            .map(|item| {
                item.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| Error::InvalidConfiguration("vector items must be numbers".into()))
            })
            .collect(),
        _ => Err(Error::InvalidConfiguration(
            "point rows need a numeric `vector` column".into(),
        )),
    }
}

fn payload_of(row: &Row) -> Payload {
    let fields: std::collections::HashMap<String, QdrantValue> = row
        .iter()
        .filter(|(name, _)| name.as_str() != "id" && name.as_str() != "vector")
        .map(|(name, value)| (name.clone(), value_to_qdrant(value)))
        .collect();
    Payload::from(fields)
}

fn conditions_to_filter(conditions: &Row) -> Filter {
    let must: Vec<Condition> = conditions
        .iter()
        .filter(|(name, _)| name.as_str() != "id")
        .map(|(name, value)| match value {
            Value::Bool(b) => Condition::matches(name.clone(), *b),
            Value::Int(n) => Condition::matches(name.clone(), *n),
            other => Condition::matches(name.clone(), other.to_parameter_string()),
        })
        .collect();
    Filter::must(must)
}

/// The Qdrant adapter value registered at process start.
#[derive(Default)]
pub struct QdrantAdapter;

impl QdrantAdapter {
    pub fn new() -> QdrantAdapter {
        QdrantAdapter
    }
}

#[async_trait]
impl Adapter for QdrantAdapter {
    fn engine(&self) -> EngineType {
        EngineType::Qdrant
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        let handle = QdrantHandle::open(
            config.endpoint.as_deref(),
            &config.host,
            config.port,
            &config.credentials,
        )?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::Qdrant);
        let ops = Arc::new(QdrantOps {
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
            Arc::new(UnsupportedReplication::new(EngineType::Qdrant, CDC_REASON)),
        ))
    }

    async fn connect_instance(&self, _config: InstanceConfig) -> Result<InstanceConnection> {
        Err(Error::unsupported(
            EngineType::Qdrant,
            "connect_instance",
            "a qdrant node has collections, not databases",
        ))
    }
}

struct QdrantOps {
    state: Arc<ConnState>,
    handle: Arc<QdrantHandle>,
}

impl QdrantOps {
    async fn collection_names(&self) -> Result<Vec<String>> {
        let response = self
            .handle
            .client
            .list_collections()
            .await
            .map_err(|err| Error::query("list_collections", err))?;
        let mut names: Vec<String> = response
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn scroll_page(
        &self,
        collection: &str,
        limit: u32,
        offset: Option<PointId>,
        columns: &[String],
    ) -> Result<(Vec<Row>, Option<PointId>)> {
        let mut builder = ScrollPointsBuilder::new(collection)
            .limit(limit)
            .with_payload(true)
            .with_vectors(true);
        if let Some(offset) = offset {
            builder = builder.offset(offset);
        }
        let response = self
            .handle
            .client
            .scroll(builder)
            .await
            .map_err(|err| Error::query("scroll", err))?;
        let rows: Vec<Row> = response
            .result
            .into_iter()
            .map(|point| {
                let mut row = Row::new();
                if let Some(id) = &point.id {
                    row.insert("id".into(), point_id_to_value(id));
                }
                if let Some(vectors) = &point.vectors {
                    if let Some(qdrant_client::qdrant::vectors_output::VectorsOptions::Vector(v)) =
                        &vectors.vectors_options
                    {
                        row.insert(
                            "vector".into(),
                            Value::List(
                                v.data.iter().map(|f| Value::Float(f64::from(*f))).collect(),
                            ),
                        );
                    }
                }
                for (field, value) in &point.payload {
                    row.insert(field.clone(), qdrant_to_value(value));
                }
                if !columns.is_empty() {
                    row.retain(|name, _| columns.contains(name));
                }
                row
            })
            .collect();
        Ok((rows, response.next_page_offset))
    }

    async fn dimension_of(&self, collection: &str) -> Result<u64> {
        let info = self
            .handle
            .client
            .collection_info(collection)
            .await
            .map_err(|err| Error::query("collection_info", err))?;
        let dimension = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|config| match config {
                qdrant_client::qdrant::vectors_config::Config::Params(params) => Some(params.size),
                qdrant_client::qdrant::vectors_config::Config::ParamsMap(_) => None,
            })
            .unwrap_or(DEFAULT_DIMENSION);
        Ok(dimension)
    }
}

#[async_trait]
impl SchemaOperator for QdrantOps {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new("qdrant".to_string());
        for name in self.collection_names().await? {
            model.add_table(self.get_table_schema(&name).await?);
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        let existing = self.collection_names().await?;
        for table in model.tables.values() {
            if existing.contains(&table.name) {
                continue;
            }
            let dimension = table
                .column("vector")
                .and_then(|column| match &column.data_type {
                    UnifiedDataType::Extension(tag) => tag
                        .strip_prefix("vector(")
                        .and_then(|rest| rest.trim_end_matches(')').parse::<u64>().ok()),
                    _ => None,
                })
                .unwrap_or(DEFAULT_DIMENSION);
            self.handle
                .client
                .create_collection(
                    CreateCollectionBuilder::new(&table.name).vectors_config(
                        VectorsConfig::from(VectorParamsBuilder::new(dimension, Distance::Cosine)),
                    ),
                )
                .await
                .map_err(|err| Error::query("create_collection", err))?;
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        self.collection_names().await
    }

    async fn get_table_schema(&self, table: &str) -> Result<Table> {
        self.state.ensure_open()?;
        let dimension = self.dimension_of(table).await?;
        let mut schema = Table::new(table);
        let mut id = Column::new("id", UnifiedDataType::String);
        id.primary_key = true;
        id.nullable = false;
        schema.columns.push(id);
        schema.columns.push(Column::new(
            "vector",
            UnifiedDataType::Extension(format!("vector({dimension})")),
        ));

        // Payload columns sampled from live points.
        let (rows, _) = self.scroll_page(table, SCHEMA_SAMPLE, None, &[]).await?;
        let mut seen: Vec<String> = Vec::new();
        for row in &rows {
            for (field, value) in row {
                if field == "id" || field == "vector" || seen.iter().any(|s| s == field) {
                    continue;
                }
                seen.push(field.clone());
                let data_type = match value {
                    Value::Bool(_) => UnifiedDataType::Boolean,
                    Value::Int(_) => UnifiedDataType::Bigint,
                    Value::Float(_) => UnifiedDataType::Float,
                    Value::List(_) | Value::Map(_) => UnifiedDataType::Json,
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
impl DataOperator for QdrantOps {
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
        let (rows, _) = self
            .scroll_page(table, limit.min(u32::MAX as usize) as u32, None, columns)
            .await?;
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.get("id").ok_or_else(|| {
                Error::InvalidConfiguration("point rows need an `id` column".into())
            })?;
            points.push(PointStruct::new(
                point_id_of(id)?,
                vector_of(row)?,
                payload_of(row),
            ));
        }
        self.handle
            .client
            .upsert_points(UpsertPointsBuilder::new(table, points).wait(true))
            .await
            .map_err(|err| Error::query("upsert_points", err))?;
        Ok(rows.len() as u64)
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        if where_columns != ["id".to_string()] {
            return Err(Error::unsupported(
                EngineType::Qdrant,
                "update",
                "points rewrite by id only",
            ));
        }
        self.insert(table, rows).await
    }

    async fn upsert(&self, table: &str, rows: &[Row], unique_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if unique_columns != ["id".to_string()] {
            return Err(Error::unsupported(
                EngineType::Qdrant,
                "upsert",
                "points key on id; payload fields have no unique identity",
            ));
        }
        self.insert(table, rows).await
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        if let Some(id) = conditions.get("id") {
            self.handle
                .client
                .delete_points(
                    DeletePointsBuilder::new(table)
                        .points(vec![point_id_of(id)?])
                        .wait(true),
                )
                .await
                .map_err(|err| Error::query("delete_points", err))?;
            return Ok(1);
        }
        let before = self.get_row_count(table, None).await?.0;
        self.handle
            .client
            .delete_points(
                DeletePointsBuilder::new(table)
                    .points(conditions_to_filter(conditions))
                    .wait(true),
            )
            .await
            .map_err(|err| Error::query("delete_points", err))?;
        let after = self.get_row_count(table, None).await?.0;
        Ok((before - after).max(0) as u64)
    }

    /// The continuation token is the next scroll offset's point id.
    async fn stream(&self, params: &StreamParams) -> Result<StreamResult> {
        self.state.ensure_open()?;
        if params.filter.is_some() {
            return Err(Error::unsupported(
                EngineType::Qdrant,
                "stream",
                "scrolling filters are not wired through the cursor contract",
            ));
        }
        let offset = match &params.cursor {
            None => None,
            Some(raw) => Some(match raw.parse::<u64>() {
                Ok(n) => PointId::from(n),
                Err(_) => PointId::from(raw.clone()),
            }),
        };
        let (rows, next) = self
            .scroll_page(
                &params.table,
                params.batch_size.min(u32::MAX as usize) as u32,
                offset,
                &params.columns,
            )
            .await?;
        let token = next.as_ref().map(|id| point_id_to_value(id).to_parameter_string());
        let has_more = token.is_some();
        Ok(StreamResult {
            rows,
            has_more,
            next_cursor: token,
        })
    }

    async fn execute_query(&self, _query: &str, _args: &[Value]) -> Result<Vec<Row>> {
        Err(Error::unsupported(
            EngineType::Qdrant,
            "execute_query",
            "similarity search runs through the vector surface, not a query language",
        ))
    }

    /// The query text is a collection name.
    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        Ok(self.get_row_count(query.trim(), None).await?.0)
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        if where_clause.is_some_and(|w| !w.trim().is_empty()) {
            return Err(Error::unsupported(
                EngineType::Qdrant,
                "get_row_count",
                "predicates are filter objects on the vector surface",
            ));
        }
        let response = self
            .handle
            .client
            .count(CountPointsBuilder::new(table).exact(true))
            .await
            .map_err(|err| Error::query("count_points", err))?;
        Ok((
            response.result.map(|r| r.count as i64).unwrap_or(0),
            true,
        ))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        for name in self.collection_names().await? {
            self.handle
                .client
                .delete_collection(&name)
                .await
                .map_err(|err| Error::query("delete_collection", err))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataOperator for QdrantOps {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("qdrant".into()));
        metadata.insert(
            "endpoint".into(),
            Value::String(self.handle.endpoint.clone()),
        );
        metadata.insert(
            "collection_count".into(),
            Value::Int(self.get_table_count().await?),
        );
        metadata.insert("version".into(), Value::String(self.get_version().await?));
        Ok(metadata)
    }

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.collect_database_metadata().await
    }

    async fn get_version(&self) -> Result<String> {
        self.state.ensure_open()?;
        let health = self
            .handle
            .client
            .health_check()
            .await
            .map_err(|err| Error::query("health_check", err))?;
        Ok(health.version)
    }

    fn unique_identifier(&self) -> String {
        format!("qdrant::{}::collections", self.handle.endpoint)
    }

    async fn get_database_size(&self) -> Result<i64> {
        Err(Error::unsupported(
            EngineType::Qdrant,
            "get_database_size",
            "storage size is a node telemetry metric, not an API field",
        ))
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        Ok(self.collection_names().await?.len() as i64)
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        // `info <collection>` is the one admin probe exposed.
        let Some(name) = command.strip_prefix("info ") else {
            return Err(Error::unsupported(
                EngineType::Qdrant,
                "execute_command",
                "only `info <collection>` is available",
            ));
        };
        let info = self
            .handle
            .client
            .collection_info(name.trim())
            .await
            .map_err(|err| Error::query("collection_info", err))?;
        let rendered = serde_json::json!({
            "collection": name.trim(),
            "points_count": info.result.as_ref().and_then(|r| r.points_count),
            "status": info.result.as_ref().map(|r| r.status),
        });
        Ok(serde_json::to_vec(&rendered)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_accept_integers_and_uuids() {
        assert!(point_id_of(&Value::Int(7)).is_ok());
        assert!(point_id_of(&Value::String("a1b2".into())).is_ok());
        assert!(point_id_of(&Value::Float(1.5)).is_err());
        assert!(point_id_of(&Value::Int(-1)).is_err());
    }

    #[test]
    fn vectors_require_numeric_lists() {
        let mut row = Row::new();
        row.insert(
            "vector".into(),
            Value::List(vec![Value::Float(0.1), Value::Int(2)]),
        );
        assert_eq!(vector_of(&row).unwrap(), vec![0.1f32, 2.0]);

        row.insert("vector".into(), Value::String("nope".into()));
        assert!(vector_of(&row).is_err());
    }

    #[test]
    fn values_round_trip_through_qdrant_kinds() {
        let value = Value::Map(std::collections::BTreeMap::from([
            ("n".to_string(), Value::Int(3)),
            ("s".to_string(), Value::String("x".into())),
            ("l".to_string(), Value::List(vec![Value::Bool(true), Value::Null])),
        ]));
        assert_eq!(qdrant_to_value(&value_to_qdrant(&value)), value);
    }
}
