//! PostgreSQL adapter for Anchor.
//!
//! Implements the full capability contract against PostgreSQL 12+:
//!
//! - **Schema**: `information_schema` + catalog discovery of tables,
//!   columns, primary keys, indexes, views, sequences, and enums;
//!   `CREATE TABLE IF NOT EXISTS` materialization from a unified model
//! - **Data**: parameterized reads/writes, `ON CONFLICT` upsert,
//!   offset-paginated streaming
//! - **Metadata**: version, `pg_database_size`, table counts, a stable
//!   `postgres::<host:port>::<db>` identifier
//! - **Replication**: logical decoding through a `test_decoding` slot,
//!   polled with `pg_logical_slot_get_changes`; continuation tokens are
//!   WAL LSNs and resume is at-least-once via slot confirm semantics
//!
//! # Prerequisites for replication
//!
//! The server must run with `wal_level=logical` and the connecting role
//! needs `REPLICATION` (or superuser). `check_prerequisites` verifies both
//! before a source is created.

mod data;
mod metadata;
mod postgres;
mod replication;
mod schema;
mod sql;

pub use postgres::PostgresAdapter;
pub use replication::PostgresReplicationSource;
