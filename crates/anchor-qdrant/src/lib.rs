//! Qdrant vector-store adapter for Anchor.
//!
//! Collections surface as tables with the reserved columns `id` and
//! `vector` plus payload columns sampled from live points. Upsert is the
//! native write (points overwrite by id); streaming rides the scroll
//! cursor, with the next point id as the continuation token.
//!
//! The client speaks gRPC, so endpoints are `http://host:6334` by
//! default. No change feed exists; replication is a typed gap.

mod qdrant;

pub use qdrant::QdrantAdapter;
