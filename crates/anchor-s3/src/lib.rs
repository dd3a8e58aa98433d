//! S3 object-store adapter for Anchor.
//!
//! The connection's "database" is a bucket. Pseudo-tables are the
//! top-level key prefixes (everything before the first `/`); a row is one
//! object with the reserved columns `_key`, `size`, `etag`,
//! `last_modified`, and - when explicitly projected - `content` for bodies
//! up to the small-object cap. Schema discovery also fills the unified
//! model's blob map.
//!
//! Stream pagination uses the last key as the continuation token
//! (`start-after` listing). PUT replaces an object wholesale, so `upsert`
//! keyed on `_key` is native while row `update` is a typed capability
//! gap. Bucket lifecycle lives on the instance connection.

mod s3;

pub use s3::S3Adapter;
