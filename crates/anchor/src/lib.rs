//! # Anchor core
//!
//! Engine-neutral foundation of the Anchor control plane: the unified data
//! and schema model, the adapter capability contract, and the process-wide
//! registries for adapters and live connections.
//!
//! The crate has no engine dependencies of its own. Each back-end lives in
//! its own `anchor-<engine>` crate implementing [`adapter::Adapter`];
//! coordinators (`anchor-replication`, `anchor-rag`, `anchor-stream-bridge`)
//! drive connections they obtain from the [`registry::ConnectionRegistry`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use anchor::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(adapter: Arc<dyn Adapter>) -> anchor::Result<()> {
//! let adapters = AdapterRegistry::new();
//! adapters.register(adapter)?;
//!
//! let registry = ConnectionRegistry::new();
//! let config = ConnectionConfig {
//!     id: "db_orders".into(),
//!     engine: EngineType::Postgres,
//!     host: "localhost".into(),
//!     port: 5432,
//!     database: "orders".into(),
//!     ..Default::default()
//! };
//! let conn = registry
//!     .connect(&adapters.get(EngineType::Postgres)?, config)
//!     .await?;
//! let model = conn.schema()?.discover_schema().await?;
//! println!("{} tables", model.tables.len());
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod capability;
pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod registry;
pub mod replication;
pub mod transform;
pub mod value;

pub use error::{Error, Result};

/// Convenient imports for adapter and coordinator crates.
pub mod prelude {
    pub use crate::adapter::{
        Adapter, ConnState, Connection, DataOperator, InstanceConnection, InstanceOperator,
        MetadataOperator, NativeHandle, ReplicationOperator, SchemaOperator, StreamParams,
        StreamResult, UnsupportedReplication,
    };
    pub use crate::capability::{capabilities, CapabilityDescriptor, EngineType};
    pub use crate::config::{ConnectionConfig, Credentials, InstanceConfig, TlsOptions};
    pub use crate::error::{Error, Result};
    pub use crate::model::{Column, Index, Table, UnifiedDataType, UnifiedModel};
    pub use crate::registry::{AdapterRegistry, ConnectionRegistry};
    pub use crate::replication::{
        CdcEvent, CdcOperation, Provenance, ReplicationConfig, ReplicationLag, ReplicationSource,
        SourceMetadata, SourceStatus,
    };
    pub use crate::transform::{TransformKind, TransformRule};
    pub use crate::value::{Row, Value};
}
