//! MongoDB adapter for Anchor.
//!
//! Collections surface as pseudo-tables with columns sampled from up to
//! 100 documents; data operations map onto the driver's typed collection
//! API; replication attaches change streams per watched collection with
//! resume-token checkpoints.
//!
//! # Prerequisites for replication
//!
//! Change streams require a replica set (a single-node replica set is
//! enough for development) or a sharded cluster; `check_prerequisites`
//! probes `hello` and refuses standalone servers.

mod bson_convert;
mod mongo;
mod replication;

pub use mongo::MongoAdapter;
pub use replication::MongoSource;
