//! # Anchor service engine
//!
//! The lifecycle shell every Anchor service runs inside: initialize with
//! a config, start, serve while counting work atomically, and stop with
//! a bounded grace period that waits for in-flight operations before
//! closing downstream resources in registration order (gRPC clients,
//! database pools, the mesh network).
//!
//! The engine is deliberately boring: no global state, everything
//! injected. Binaries construct one engine, register resources, and hand
//! clones of the counters to their request handlers.

mod engine;

pub use engine::{
    EngineState, HealthReport, HealthState, ManagedResource, OperationGuard, ServiceConfig,
    ServiceCounters, ServiceCountersSnapshot, ServiceEngine,
};
