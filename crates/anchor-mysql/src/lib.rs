//! MySQL adapter for Anchor.
//!
//! Schema discovery through `information_schema`, parameterized data I/O
//! with `ON DUPLICATE KEY UPDATE` upsert, offset-paginated streaming, and
//! instance-scope database lifecycle. Change capture is not offered:
//! binlog access is outside this build, so the replication operator reports
//! the gap as a typed unsupported error.

mod mysql;
mod sql;

pub use mysql::MySqlAdapter;
