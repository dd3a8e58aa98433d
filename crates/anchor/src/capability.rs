//! Engine types and their declared capabilities.
//!
//! The capability registry is a process-global, insertion-once directory of
//! every engine tag the control plane knows about, whether or not an adapter
//! crate for it is linked in. Adapter registration is separate (see
//! [`crate::registry::AdapterRegistry`]); a capability entry without an
//! adapter means "known engine, no driver in this build".

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Tag identifying one back-end engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EngineType {
    Postgres,
    MySql,
    MariaDb,
    SqlServer,
    Oracle,
    Sqlite,
    CockroachDb,
    Db2,
    MongoDb,
    CosmosDb,
    DynamoDb,
    Cassandra,
    Redis,
    ClickHouse,
    DuckDb,
    Snowflake,
    BigQuery,
    Redshift,
    Elasticsearch,
    OpenSearch,
    Neo4j,
    Milvus,
    Pinecone,
    Qdrant,
    Weaviate,
    Chroma,
    S3,
    Gcs,
    AzureBlob,
    Minio,
    Kafka,
    Iceberg,
}

impl EngineType {
    /// Stable lowercase tag used in identifiers, logs, and wire payloads.
    pub fn as_tag(&self) -> &'static str {
        match self {
            EngineType::Postgres => "postgres",
            EngineType::MySql => "mysql",
            EngineType::MariaDb => "mariadb",
            EngineType::SqlServer => "sqlserver",
            EngineType::Oracle => "oracle",
            EngineType::Sqlite => "sqlite",
            EngineType::CockroachDb => "cockroachdb",
            EngineType::Db2 => "db2",
            EngineType::MongoDb => "mongodb",
            EngineType::CosmosDb => "cosmosdb",
            EngineType::DynamoDb => "dynamodb",
            EngineType::Cassandra => "cassandra",
            EngineType::Redis => "redis",
            EngineType::ClickHouse => "clickhouse",
            EngineType::DuckDb => "duckdb",
            EngineType::Snowflake => "snowflake",
            EngineType::BigQuery => "bigquery",
            EngineType::Redshift => "redshift",
            EngineType::Elasticsearch => "elasticsearch",
            EngineType::OpenSearch => "opensearch",
            EngineType::Neo4j => "neo4j",
            EngineType::Milvus => "milvus",
            EngineType::Pinecone => "pinecone",
            EngineType::Qdrant => "qdrant",
            EngineType::Weaviate => "weaviate",
            EngineType::Chroma => "chroma",
            EngineType::S3 => "s3",
            EngineType::Gcs => "gcs",
            EngineType::AzureBlob => "azure_blob",
            EngineType::Minio => "minio",
            EngineType::Kafka => "kafka",
            EngineType::Iceberg => "iceberg",
        }
    }

    /// All tags known to this build.
    pub fn all() -> &'static [EngineType] {
        use EngineType::*;
        &[
            Postgres, MySql, MariaDb, SqlServer, Oracle, Sqlite, CockroachDb, Db2, MongoDb,
            CosmosDb, DynamoDb, Cassandra, Redis, ClickHouse, DuckDb, Snowflake, BigQuery,
            Redshift, Elasticsearch, OpenSearch, Neo4j, Milvus, Pinecone, Qdrant, Weaviate,
            Chroma, S3, Gcs, AzureBlob, Minio, Kafka, Iceberg,
        ]
    }
}

impl Default for EngineType {
    fn default() -> Self {
        EngineType::Postgres
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl FromStr for EngineType {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        EngineType::all()
            .iter()
            .find(|e| e.as_tag() == tag)
            .copied()
            .ok_or_else(|| Error::UnknownEngine(tag.to_string()))
    }
}

/// Declared abilities of one engine type. Immutable and process-global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub engine: EngineType,
    /// Can enumerate or synthesise a schema.
    pub schema_discovery: bool,
    pub data_read: bool,
    pub data_write: bool,
    /// Supports the bounded-pagination stream cursor.
    pub bulk_stream_read: bool,
    /// Has a CDC mechanism an adapter can attach to.
    pub replication: bool,
    /// Server/project scope with database list/create/drop.
    pub multi_database_instance: bool,
}

impl CapabilityDescriptor {
    /// Descriptor for an engine tag. The table is the authority on what each
    /// family can do; adapters must not claim more than their entry.
    pub fn for_engine(engine: EngineType) -> CapabilityDescriptor {
        use EngineType::*;
        let (replication, multi_database_instance) = match engine {
            Postgres | CockroachDb => (true, true),
            MySql | MariaDb | SqlServer | Oracle | Db2 | Snowflake | Redshift => (false, true),
            MongoDb | CosmosDb => (true, true),
            Redis => (true, true),
            Cassandra | ClickHouse | BigQuery => (false, true),
            DynamoDb | Elasticsearch | OpenSearch | Neo4j => (false, false),
            Milvus | Pinecone | Qdrant | Weaviate | Chroma => (false, false),
            S3 | Gcs | AzureBlob | Minio => (false, true),
            Kafka => (false, false),
            Sqlite | DuckDb | Iceberg => (false, false),
        };
        let data_write = !matches!(engine, Kafka);
        CapabilityDescriptor {
            engine,
            schema_discovery: true,
            data_read: true,
            data_write,
            bulk_stream_read: true,
            replication,
            multi_database_instance,
        }
    }
}

static REGISTRY: OnceLock<HashMap<EngineType, CapabilityDescriptor>> = OnceLock::new();

fn registry() -> &'static HashMap<EngineType, CapabilityDescriptor> {
    REGISTRY.get_or_init(|| {
        EngineType::all()
            .iter()
            .map(|&engine| (engine, CapabilityDescriptor::for_engine(engine)))
            .collect()
    })
}

/// Look up the capability descriptor for an engine type.
pub fn capabilities(engine: EngineType) -> CapabilityDescriptor {
    // Every EngineType variant is seeded at first access, so the map lookup
    // cannot miss for a typed argument.
    registry()
        .get(&engine)
        .copied()
        .unwrap_or_else(|| CapabilityDescriptor::for_engine(engine))
}

/// Look up by string tag; fails with `UnknownEngine` for tags outside the
/// directory.
pub fn capabilities_by_tag(tag: &str) -> Result<CapabilityDescriptor> {
    let engine = EngineType::from_str(tag)?;
    Ok(capabilities(engine))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_engine_has_a_descriptor() {
        for &engine in EngineType::all() {
            let caps = capabilities(engine);
            assert_eq!(caps.engine, engine);
            assert!(caps.data_read);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = capabilities_by_tag("fancydb").unwrap_err();
        assert!(matches!(err, Error::UnknownEngine(tag) if tag == "fancydb"));
    }

    #[test]
    fn tag_round_trip() {
        for &engine in EngineType::all() {
            assert_eq!(EngineType::from_str(engine.as_tag()).unwrap(), engine);
        }
    }

    #[test]
    fn wal_engines_declare_replication() {
        assert!(capabilities(EngineType::Postgres).replication);
        assert!(capabilities(EngineType::MongoDb).replication);
        assert!(!capabilities(EngineType::ClickHouse).replication);
        assert!(!capabilities(EngineType::S3).replication);
    }
}
