//! Elasticsearch adapter for Anchor.
//!
//! Indices surface as tables with columns derived from the index mapping;
//! documents are rows with the reserved `_id` column carrying the document
//! id. Writes ride the `_bulk` API, reads ride `_search` with
//! from/size pagination, and `execute_query` passes a query-DSL body
//! through verbatim.
//!
//! There is no change feed to attach to, so replication is a typed gap.

mod elastic;

pub use elastic::ElasticsearchAdapter;
