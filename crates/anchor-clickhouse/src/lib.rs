//! ClickHouse adapter for Anchor.
//!
//! Talks to the HTTP interface (port 8123) with `JSONEachRow` framing so
//! dynamic row maps travel without a typed schema. Discovery reads
//! `system.tables`/`system.columns`; inserts batch through one
//! `INSERT ... FORMAT JSONEachRow` body.
//!
//! MergeTree parts are immutable, so row `update` and `delete` are typed
//! capability gaps (data expires through the table's retention policy);
//! `upsert` is unavailable for the same reason. Everything else - reads,
//! streaming, counts, DDL - is first-class.

mod clickhouse;

pub use clickhouse::ClickHouseAdapter;
