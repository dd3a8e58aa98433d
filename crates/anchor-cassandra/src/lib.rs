//! Cassandra adapter for Anchor.
//!
//! The connection's "database" is a keyspace. Discovery reads
//! `system_schema`; INSERT is a native upsert in Cassandra, so `upsert`
//! and `insert` share one path and report one row affected per input row.
//! CQL has no OFFSET, so stream pagination over-fetches to the cursor and
//! skips client-side; acceptable for the bounded batch sizes the cursor
//! contract allows.
//!
//! Values are rendered as CQL literals with quote escaping; the statement
//! cache is deliberately not used because column sets vary per row.

mod cassandra;
mod literal;

pub use cassandra::CassandraAdapter;
