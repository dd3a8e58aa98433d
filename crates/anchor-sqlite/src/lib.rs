//! SQLite adapter for Anchor.
//!
//! The database is the file named by the connection config (or `:memory:`).
//! rusqlite is synchronous, so every operator call hops through
//! `spawn_blocking` with the connection behind a mutex; the async surface
//! stays cancel-safe because cancellation abandons the waiting task, never
//! the C call mid-flight.
//!
//! Single-file engines have no instance scope and no change log, so
//! `connect_instance` and the replication operator report typed
//! unsupported errors.

mod sqlite;

pub use sqlite::SqliteAdapter;
