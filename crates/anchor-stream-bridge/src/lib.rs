//! # Anchor stream bridge
//!
//! A supervised loop that drains a messaging topic into an Anchor target
//! table: consume up to N messages with a server-side timeout, decode the
//! JSON envelope (payloads without structure are wrapped under `data`),
//! apply the transformation rule set, stringify nested structures, and
//! insert one record per message through the target's data operator.
//!
//! Start is idempotent; stop signals the loop and joins it. A failed
//! batch backs off for a fixed interval before the next poll. Metrics
//! (read, written, failed, cumulative latency, last-message time) are
//! atomic counters snapshotted on demand.
//!
//! Production deployments consume Kafka through
//! [`source::KafkaMessageSource`]; tests drive the same loop through
//! [`source::MemoryMessageSource`].

pub mod bridge;
pub mod source;

pub use bridge::{BridgeConfig, BridgeMetrics, BridgeMetricsSnapshot, StreamBridge};
pub use source::{BridgeMessage, KafkaMessageSource, MemoryMessageSource, MessageSource};
