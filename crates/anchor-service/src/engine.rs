//! Engine lifecycle, counters, and health.

use anchor::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use prometheus::{IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Engine configuration handed to `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// How long `stop` waits for in-flight operations.
    #[serde(default = "default_grace_secs")]
    pub grace_timeout_secs: u64,
    /// Log filter directive, e.g. `info,anchor=debug`.
    #[serde(default)]
    pub log_filter: Option<String>,
}

fn default_grace_secs() -> u64 {
    30
}

impl ServiceConfig {
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// Atomic request/error/in-flight counters shared with handlers.
#[derive(Default)]
pub struct ServiceCounters {
    requests_processed: AtomicU64,
    errors: AtomicU64,
    ongoing: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceCountersSnapshot {
    pub requests_processed: u64,
    pub errors: u64,
    pub ongoing: u64,
}

impl ServiceCounters {
    pub fn snapshot(&self) -> ServiceCountersSnapshot {
        ServiceCountersSnapshot {
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            ongoing: self.ongoing.load(Ordering::Relaxed),
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn begin(&self) {
        self.ongoing.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        self.ongoing.fetch_sub(1, Ordering::AcqRel);
    }
}

/// RAII guard for one in-flight operation.
pub struct OperationGuard {
    counters: Arc<ServiceCounters>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.counters.end();
    }
}

/// A downstream resource closed during graceful shutdown.
pub trait ManagedResource: Send + Sync {
    fn name(&self) -> &str;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

type HealthCheck = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One engine value per service process.
pub struct ServiceEngine {
    config: Mutex<Option<ServiceConfig>>,
    state: Mutex<EngineState>,
    counters: Arc<ServiceCounters>,
    shutdown: watch::Sender<bool>,
    resources: Mutex<Vec<Arc<dyn ManagedResource>>>,
    health_checks: Mutex<Vec<(String, HealthCheck)>>,
    registry: Registry,
    ongoing_gauge: IntGauge,
}

impl ServiceEngine {
    pub fn new() -> ServiceEngine {
        let registry = Registry::new();
        #[allow(clippy::expect_used)] // static metric name, cannot fail
        let ongoing_gauge = IntGauge::with_opts(Opts::new(
            "anchor_ongoing_operations",
            "Operations currently in flight",
        ))
        .expect("static metric definition");
        let _ = registry.register(Box::new(ongoing_gauge.clone()));
        let (shutdown, _) = watch::channel(false);
        ServiceEngine {
            config: Mutex::new(None),
            state: Mutex::new(EngineState::Created),
            counters: Arc::new(ServiceCounters::default()),
            shutdown,
            resources: Mutex::new(Vec::new()),
            health_checks: Mutex::new(Vec::new()),
            registry,
            ongoing_gauge,
        }
    }

    /// Install tracing for the configured filter. Call once per process;
    /// later calls are no-ops because a global subscriber already exists.
    pub fn init_logging(&self) {
        let filter = self
            .config
            .lock()
            .as_ref()
            .and_then(|c| c.log_filter.clone())
            .unwrap_or_else(|| "info".to_string());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_new(filter)
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();
    }

    pub fn initialize(&self, config: ServiceConfig) -> Result<()> {
        let mut state = self.state.lock();
        if *state == EngineState::Running {
            return Err(Error::InvalidConfiguration(
                "cannot re-initialize a running engine".into(),
            ));
        }
        info!(service = %config.name, "engine initialized");
        *self.config.lock() = Some(config);
        *state = EngineState::Initialized;
        Ok(())
    }

    /// Refuses when already running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            EngineState::Running => Err(Error::AlreadyExists("engine is running".into())),
            EngineState::Created => Err(Error::InvalidConfiguration(
                "initialize before start".into(),
            )),
            _ => {
                let _ = self.shutdown.send(false);
                *state = EngineState::Running;
                info!("engine started");
                Ok(())
            }
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn counters(&self) -> Arc<ServiceCounters> {
        Arc::clone(&self.counters)
    }

    /// Handlers wrap each request in a guard so the grace period can wait
    /// on real work.
    pub fn begin_operation(&self) -> OperationGuard {
        self.counters.begin();
        self.ongoing_gauge.inc();
        OperationGuard {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Watch that flips to true when shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Register a downstream resource; closed in registration order on
    /// stop.
    pub fn manage_resource(&self, resource: Arc<dyn ManagedResource>) {
        self.resources.lock().push(resource);
    }

    pub fn add_health_check<F, Fut>(&self, name: impl Into<String>, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.health_checks
            .lock()
            .push((name.into(), Box::new(move || Box::pin(check()))));
    }

    pub async fn health_checks(&self) -> BTreeMap<String, HealthReport> {
        let checks: Vec<(String, BoxFuture<'static, Result<()>>)> = {
            let registered = self.health_checks.lock();
            registered
                .iter()
                .map(|(name, check)| (name.clone(), check()))
                .collect()
        };
        let mut report = BTreeMap::new();
        for (name, check) in checks {
            let outcome = check.await;
            report.insert(
                name,
                match outcome {
                    Ok(()) => HealthReport {
                        state: HealthState::Healthy,
                        detail: None,
                    },
                    Err(err) => HealthReport {
                        state: HealthState::Unhealthy,
                        detail: Some(err.to_string()),
                    },
                },
            );
        }
        report
    }

    /// Counter snapshot plus the prometheus gather, for the metrics
    /// endpoint.
    pub fn collect_metrics(&self) -> (ServiceCountersSnapshot, Vec<prometheus::proto::MetricFamily>) {
        let snapshot = self.counters.snapshot();
        self.ongoing_gauge.set(snapshot.ongoing as i64);
        (snapshot, self.registry.gather())
    }

    /// Graceful shutdown: cancel the service context, wait for in-flight
    /// operations up to the grace timeout, then close resources in
    /// registration order. A stop on a non-running engine is a no-op.
    pub async fn stop(&self, grace_override: Option<Duration>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Running {
                return Ok(());
            }
            *state = EngineState::Stopped;
        }
        let grace = grace_override.unwrap_or_else(|| {
            self.config
                .lock()
                .as_ref()
                .map(ServiceConfig::grace_timeout)
                .unwrap_or(Duration::from_secs(30))
        });
        let _ = self.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        while self.counters.snapshot().ongoing > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    ongoing = self.counters.snapshot().ongoing,
                    "grace period elapsed with operations in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let resources: Vec<Arc<dyn ManagedResource>> = self.resources.lock().drain(..).collect();
        for resource in resources {
            if let Err(err) = resource.close().await {
                warn!(resource = resource.name(), error = %err, "resource close failed");
            } else {
                info!(resource = resource.name(), "resource closed");
            }
        }
        info!("engine stopped");
        Ok(())
    }
}

impl Default for ServiceEngine {
    fn default() -> Self {
        ServiceEngine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config() -> ServiceConfig {
        ServiceConfig {
            name: "anchor-test".into(),
            grace_timeout_secs: 1,
            log_filter: None,
        }
    }

    #[tokio::test]
    async fn start_refuses_when_running_and_stop_is_noop_when_not() {
        let engine = ServiceEngine::new();
        assert!(engine.start().is_err(), "start before initialize");

        engine.initialize(config()).unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.start().unwrap_err(), Error::AlreadyExists(_)));

        engine.stop(None).await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        // Second stop is a no-op.
        engine.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn guards_track_inflight_work() {
        let engine = ServiceEngine::new();
        engine.initialize(config()).unwrap();
        engine.start().unwrap();

        let guard = engine.begin_operation();
        assert_eq!(engine.counters().snapshot().ongoing, 1);
        drop(guard);
        let snapshot = engine.counters().snapshot();
        assert_eq!(snapshot.ongoing, 0);
        assert_eq!(snapshot.requests_processed, 1);

        engine.counters().record_error();
        assert_eq!(engine.counters().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn stop_waits_for_inflight_then_closes_resources_in_order() {
        struct Tracking {
            name: String,
            order: Arc<Mutex<Vec<String>>>,
        }
        impl ManagedResource for Tracking {
            fn name(&self) -> &str {
                &self.name
            }
            fn close(&self) -> BoxFuture<'_, Result<()>> {
                Box::pin(async move {
                    self.order.lock().push(self.name.clone());
                    Ok(())
                })
            }
        }

        let engine = Arc::new(ServiceEngine::new());
        engine.initialize(config()).unwrap();
        engine.start().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["grpc-clients", "db-pool", "mesh"] {
            engine.manage_resource(Arc::new(Tracking {
                name: name.into(),
                order: Arc::clone(&order),
            }));
        }

        // An operation that finishes during the grace window.
        let guard = engine.begin_operation();
        let engine_for_release = Arc::clone(&engine);
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
            let _ = engine_for_release; // keep the engine alive until release
        });

        engine.stop(None).await.unwrap();
        release.await.unwrap();
        assert_eq!(
            *order.lock(),
            vec!["grpc-clients".to_string(), "db-pool".into(), "mesh".into()]
        );
        assert_eq!(engine.counters().snapshot().ongoing, 0);
    }

    #[tokio::test]
    async fn health_checks_report_per_probe() {
        let engine = ServiceEngine::new();
        let flips = Arc::new(AtomicUsize::new(0));
        engine.add_health_check("always-ok", || async { Ok(()) });
        let flips_for_check = Arc::clone(&flips);
        engine.add_health_check("flaky", move || {
            let flips = Arc::clone(&flips_for_check);
            async move {
                if flips.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Transient("warming up".into()))
                } else {
                    Ok(())
                }
            }
        });

        let first = engine.health_checks().await;
        assert_eq!(first["always-ok"].state, HealthState::Healthy);
        assert_eq!(first["flaky"].state, HealthState::Unhealthy);

        let second = engine.health_checks().await;
        assert_eq!(second["flaky"].state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn shutdown_signal_flips_on_stop() {
        let engine = ServiceEngine::new();
        engine.initialize(config()).unwrap();
        engine.start().unwrap();
        let mut signal = engine.shutdown_signal();
        assert!(!*signal.borrow());
        engine.stop(Some(Duration::from_millis(10))).await.unwrap();
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
    }
}
