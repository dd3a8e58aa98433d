//! MongoDB adapter, handle, and operators.

use crate::bson_convert::{document_to_row, row_to_document, unified_type_of, value_to_bson};
use crate::replication::MongoReplication;
use anchor::adapter::{
    Adapter, ConnState, Connection, DataOperator, InstanceConnection, InstanceOperator,
    MetadataOperator, NativeHandle, SchemaOperator, StreamParams, StreamResult,
};
use anchor::prelude::*;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::{ClientOptions, FindOptions};
use mongodb::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Documents sampled per collection when synthesising a pseudo-schema.
const SCHEMA_SAMPLE: usize = 100;

pub(crate) struct MongoHandle {
    pub client: Client,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl MongoHandle {
    pub(crate) async fn open(
        host: &str,
        port: u16,
        database: &str,
        credentials: &Credentials,
    ) -> Result<Arc<MongoHandle>> {
        let uri = match (&credentials.username, &credentials.password) {
            (Some(user), Some(password)) => {
                format!("mongodb://{user}:{password}@{host}:{port}")
            }
            _ => format!("mongodb://{host}:{port}"),
        };
        let options = ClientOptions::parse(&uri)
            .await
            .map_err(|err| Error::connection(EngineType::MongoDb, host, port, err))?;
        let client = Client::with_options(options)
            .map_err(|err| Error::connection(EngineType::MongoDb, host, port, err))?;
        Ok(Arc::new(MongoHandle {
            client,
            host: host.to_string(),
            port,
            database: database.to_string(),
        }))
    }

    pub(crate) fn db(&self) -> mongodb::Database {
        self.client.database(&self.database)
    }

    fn wrap(&self, op: &str, err: mongodb::error::Error) -> Error {
        Error::query(op, err)
    }
}

#[async_trait]
impl NativeHandle for MongoHandle {
    async fn ping(&self) -> Result<()> {
        self.db()
            .run_command(doc! {"ping": 1})
            .await
            .map(|_| ())
            .map_err(|err| Error::connection(EngineType::MongoDb, &self.host, self.port, err))
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

/// The MongoDB adapter value registered at process start.
#[derive(Default)]
pub struct MongoAdapter;

impl MongoAdapter {
    pub fn new() -> MongoAdapter {
        MongoAdapter
    }
}

#[async_trait]
impl Adapter for MongoAdapter {
    fn engine(&self) -> EngineType {
        EngineType::MongoDb
    }

    async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        if config.database.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "connection {}: mongodb requires a database name",
                config.id
            )));
        }
        let handle = MongoHandle::open(
            &config.host,
            config.port,
            &config.database,
            &config.credentials,
        )
        .await?;
        handle.ping().await?;
        debug!(id = %config.id, "mongodb connection established");

        let state = ConnState::new(config.id.clone(), EngineType::MongoDb);
        let ops = Arc::new(MongoOps {
            state: Arc::clone(&state),
            handle: Arc::clone(&handle),
        });
        let replication = Arc::new(MongoReplication::new(
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
        let handle =
            MongoHandle::open(&config.host, config.port, "admin", &config.credentials).await?;
        handle.ping().await?;

        let state = ConnState::new(config.id.clone(), EngineType::MongoDb);
        let ops = Arc::new(MongoOps {
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

struct MongoOps {
    state: Arc<ConnState>,
    handle: Arc<MongoHandle>,
}

impl MongoOps {
    fn conditions_to_filter(conditions: &Row) -> Document {
        row_to_document(conditions)
    }

    /// Structured query payload accepted by the pass-through operations:
    /// `{"collection": "...", "filter": {...}, "limit": 100}`.
    fn parse_query(query: &str) -> Result<(String, Document, Option<i64>)> {
        let parsed: serde_json::Value = serde_json::from_str(query)?;
        let collection = parsed
            .get("collection")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::InvalidConfiguration("query payload needs a \"collection\" field".into())
            })?
            .to_string();
        let filter = parsed
            .get("filter")
            .map(|f| {
                bson::to_document(f).map_err(|err| {
                    Error::InvalidConfiguration(format!("query filter is not a document: {err}"))
                })
            })
            .transpose()?
            .unwrap_or_default();
        let limit = parsed.get("limit").and_then(|v| v.as_i64());
        Ok((collection, filter, limit))
    }
}

#[async_trait]
impl SchemaOperator for MongoOps {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new(self.handle.database.clone());
        for name in self.list_tables().await? {
            model.add_table(self.get_table_schema(&name).await?);
        }
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        let existing = self.list_tables().await?;
        for name in model.tables.keys() {
            if existing.contains(name) {
                continue;
            }
            self.handle
                .db()
                .create_collection(name)
                .await
                .map_err(|err| self.handle.wrap("create_collection", err))?;
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let mut names = self
            .handle
            .db()
            .list_collection_names()
            .await
            .map_err(|err| self.handle.wrap("list_collections", err))?;
        names.sort();
        Ok(names)
    }

    /// Pseudo-schema sampled from up to [`SCHEMA_SAMPLE`] documents: the
    /// column set is the union of fields seen, typed by first occurrence.
    async fn get_table_schema(&self, table: &str) -> Result<Table> {
        self.state.ensure_open()?;
        let collection = self.handle.db().collection::<Document>(table);
        let options = FindOptions::builder().limit(SCHEMA_SAMPLE as i64).build();
        let mut cursor = collection
            .find(doc! {})
            .with_options(options)
            .await
            .map_err(|err| self.handle.wrap("sample_find", err))?;

        let mut schema = Table::new(table);
        let mut seen: BTreeMap<String, UnifiedDataType> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|err| self.handle.wrap("sample_next", err))?
        {
            for (field, value) in doc.iter() {
                if !seen.contains_key(field) {
                    seen.insert(field.clone(), unified_type_of(value));
                    order.push(field.clone());
                }
            }
        }
        for field in order {
            let data_type = seen.remove(&field).unwrap_or(UnifiedDataType::String);
            let mut column = Column::new(field.clone(), data_type);
            if field == "_id" {
                column.primary_key = true;
                column.nullable = false;
            }
            schema.columns.push(column);
        }
        schema.options.insert("sampled".into(), "true".into());
        Ok(schema)
    }
}

#[async_trait]
impl DataOperator for MongoOps {
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
        let collection = self.handle.db().collection::<Document>(table);
        let mut options = FindOptions::builder().limit(limit as i64).build();
        if !columns.is_empty() {
            let mut projection = Document::new();
            for column in columns {
                projection.insert(column.clone(), 1);
            }
            options.projection = Some(projection);
        }
        let cursor = collection
            .find(doc! {})
            .with_options(options)
            .await
            .map_err(|err| self.handle.wrap("find", err))?;
        let docs: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|err| self.handle.wrap("find_collect", err))?;
        Ok(docs.iter().map(document_to_row).collect())
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        let docs: Vec<Document> = rows.iter().map(row_to_document).collect();
        let result = self
            .handle
            .db()
            .collection::<Document>(table)
            .insert_many(docs)
            .await
            .map_err(|err| self.handle.wrap("insert_many", err))?;
        Ok(result.inserted_ids.len() as u64)
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
        let collection = self.handle.db().collection::<Document>(table);
        let mut affected = 0u64;
        for row in rows {
            let mut filter = Document::new();
            for column in where_columns {
                let value = row.get(column).ok_or_else(|| {
                    Error::InvalidConfiguration(format!("update row is missing where column {column}"))
                })?;
                filter.insert(column.clone(), value_to_bson(value));
            }
            let mut set = Document::new();
            for (field, value) in row {
                if !where_columns.contains(field) {
                    set.insert(field.clone(), value_to_bson(value));
                }
            }
            if set.is_empty() {
                continue;
            }
            let result = collection
                .update_many(filter, doc! {"$set": set})
                .await
                .map_err(|err| self.handle.wrap("update_many", err))?;
            affected += result.modified_count;
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
        let collection = self.handle.db().collection::<Document>(table);
        for row in rows {
            let mut filter = Document::new();
            for column in unique_columns {
                filter.insert(
                    column.clone(),
                    value_to_bson(row.get(column).unwrap_or(&Value::Null)),
                );
            }
            let mut set = Document::new();
            for (field, value) in row {
                if !unique_columns.contains(field) {
                    set.insert(field.clone(), value_to_bson(value));
                }
            }
            collection
                .update_one(filter, doc! {"$set": set})
                .upsert(true)
                .await
                .map_err(|err| self.handle.wrap("upsert", err))?;
        }
        Ok(rows.len() as u64)
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        let result = self
            .handle
            .db()
            .collection::<Document>(table)
            .delete_many(Self::conditions_to_filter(conditions))
            .await
            .map_err(|err| self.handle.wrap("delete_many", err))?;
        Ok(result.deleted_count)
    }

    async fn stream(&self, params: &StreamParams) -> Result<StreamResult> {
        self.state.ensure_open()?;
        let offset = params.offset()?;
        let collection = self.handle.db().collection::<Document>(&params.table);
        let filter = match &params.filter {
            Some(raw) if !raw.trim().is_empty() => {
                let json: serde_json::Value = serde_json::from_str(raw)?;
                bson::to_document(&json).map_err(|err| {
                    Error::InvalidConfiguration(format!("stream filter is not a document: {err}"))
                })?
            }
            _ => doc! {},
        };
        let mut options = FindOptions::builder()
            .skip(offset as u64)
            .limit(params.batch_size as i64)
            .build();
        if !params.columns.is_empty() {
            let mut projection = Document::new();
            for column in &params.columns {
                projection.insert(column.clone(), 1);
            }
            options.projection = Some(projection);
        }
        let cursor = collection
            .find(filter)
            .with_options(options)
            .await
            .map_err(|err| self.handle.wrap("stream_find", err))?;
        let docs: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|err| self.handle.wrap("stream_collect", err))?;
        let rows: Vec<Row> = docs.iter().map(document_to_row).collect();
        Ok(StreamResult::offset_page(rows, params.batch_size, offset))
    }

    async fn execute_query(&self, query: &str, _args: &[Value]) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        let (collection, filter, limit) = Self::parse_query(query)?;
        let mut options = FindOptions::default();
        options.limit = limit;
        let cursor = self
            .handle
            .db()
            .collection::<Document>(&collection)
            .find(filter)
            .with_options(options)
            .await
            .map_err(|err| self.handle.wrap("query_find", err))?;
        let docs: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|err| self.handle.wrap("query_collect", err))?;
        Ok(docs.iter().map(document_to_row).collect())
    }

    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        let (collection, filter, _) = Self::parse_query(query)?;
        let count = self
            .handle
            .db()
            .collection::<Document>(&collection)
            .count_documents(filter)
            .await
            .map_err(|err| self.handle.wrap("count_documents", err))?;
        Ok(count as i64)
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        let collection = self.handle.db().collection::<Document>(table);
        let filter = match where_clause {
            Some(raw) if !raw.trim().is_empty() => {
                let json: serde_json::Value = serde_json::from_str(raw)?;
                bson::to_document(&json).map_err(|err| {
                    Error::InvalidConfiguration(format!("count filter is not a document: {err}"))
                })?
            }
            _ => doc! {},
        };
        let count = collection
            .count_documents(filter)
            .await
            .map_err(|err| self.handle.wrap("count_documents", err))?;
        Ok((count as i64, true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        for name in self.list_tables().await? {
            self.handle
                .db()
                .collection::<Document>(&name)
                .drop()
                .await
                .map_err(|err| self.handle.wrap("drop_collection", err))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataOperator for MongoOps {
    async fn collect_database_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let stats = self
            .handle
            .db()
            .run_command(doc! {"dbStats": 1})
            .await
            .map_err(|err| self.handle.wrap("dbStats", err))?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("mongodb".into()));
        metadata.insert(
            "database_name".into(),
            Value::String(self.handle.database.clone()),
        );
        for key in ["collections", "objects", "dataSize", "storageSize"] {
            if let Some(value) = stats.get(key) {
                metadata.insert(key.into(), crate::bson_convert::bson_to_value(value));
            }
        }
        Ok(metadata)
    }

    async fn collect_instance_metadata(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("database_type".into(), Value::String("mongodb".into()));
        metadata.insert(
            "host".into(),
            Value::String(format!("{}:{}", self.handle.host, self.handle.port)),
        );
        let names = self
            .handle
            .client
            .list_database_names()
            .await
            .map_err(|err| self.handle.wrap("list_databases", err))?;
        metadata.insert("database_count".into(), Value::Int(names.len() as i64));
        metadata.insert("version".into(), Value::String(self.get_version().await?));
        Ok(metadata)
    }

    async fn get_version(&self) -> Result<String> {
        self.state.ensure_open()?;
        let info = self
            .handle
            .db()
            .run_command(doc! {"buildInfo": 1})
            .await
            .map_err(|err| self.handle.wrap("buildInfo", err))?;
        Ok(info.get_str("version").unwrap_or("unknown").to_string())
    }

    fn unique_identifier(&self) -> String {
        format!(
            "mongodb::{}:{}::{}",
            self.handle.host, self.handle.port, self.handle.database
        )
    }

    async fn get_database_size(&self) -> Result<i64> {
        self.state.ensure_open()?;
        let stats = self
            .handle
            .db()
            .run_command(doc! {"dbStats": 1})
            .await
            .map_err(|err| self.handle.wrap("dbStats", err))?;
        match stats.get("dataSize") {
            Some(Bson::Int32(n)) => Ok(i64::from(*n)),
            Some(Bson::Int64(n)) => Ok(*n),
            Some(Bson::Double(f)) => Ok(*f as i64),
            _ => Ok(0),
        }
    }

    async fn get_table_count(&self) -> Result<i64> {
        self.state.ensure_open()?;
        Ok(self.list_tables().await?.len() as i64)
    }

    async fn execute_command(&self, command: &str) -> Result<Vec<u8>> {
        self.state.ensure_open()?;
        let json: serde_json::Value = serde_json::from_str(command)?;
        let doc = bson::to_document(&json).map_err(|err| {
            Error::InvalidConfiguration(format!("command is not a document: {err}"))
        })?;
        let reply = self
            .handle
            .db()
            .run_command(doc)
            .await
            .map_err(|err| self.handle.wrap("run_command", err))?;
        let rendered: serde_json::Value = bson::from_document(reply)
            .map_err(|err| Error::Fatal(format!("command reply not serializable: {err}")))?;
        Ok(serde_json::to_vec(&rendered)?)
    }
}

#[async_trait]
impl InstanceOperator for MongoOps {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let mut names = self
            .handle
            .client
            .list_database_names()
            .await
            .map_err(|err| self.handle.wrap("list_databases", err))?;
        names.sort();
        Ok(names)
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        // Databases materialize on first write; seed a marker collection.
        self.handle
            .client
            .database(name)
            .create_collection("_anchor_init")
            .await
            .map_err(|err| self.handle.wrap("create_database", err))
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        self.handle
            .client
            .database(name)
            .drop()
            .await
            .map_err(|err| self.handle.wrap("drop_database", err))
    }
}
