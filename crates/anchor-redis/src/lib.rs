//! Redis adapter for Anchor.
//!
//! Redis has no declared schema, so the adapter projects a keyspace
//! convention into pseudo-tables: a "table" is the key prefix before the
//! first `:`, a "row" is the hash stored at `<table>:<suffix>`, and the
//! reserved `_key` column carries the full key. Schema discovery samples
//! live hashes; streaming rides the native SCAN cursor as an opaque
//! continuation token.
//!
//! Replication attaches to keyspace notifications
//! (`notify-keyspace-events`), which are fire-and-forget pub/sub: the
//! source declares `resume_capable = false` and write events surface as
//! `Upsert` carrying the key's end-state.

mod redis_adapter;
mod replication;

pub use redis_adapter::RedisAdapter;
pub use replication::RedisSource;
