//! modelgate: a local model gateway with a dynamic lifecycle core.
//!
//! Exposes an OpenAI-compatible HTTP surface backed by interchangeable
//! inference backends (CUDA, Metal, generic CPU). The gateway never
//! touches model math; it decides which models are resident, which engine
//! serves each one, and when an idle model must give way to a requested
//! one, while keeping in-flight generations correct under that churn.
//!
//! # Architecture
//!
//! - [`catalog`]: name → descriptor resolution (storage path, engine,
//!   declared cost).
//! - [`ledger`]: the admission budget (resident bytes and slots) and the
//!   LRU eviction policy.
//! - [`lifecycle`]: the state machine serializing every load, unload, and
//!   eviction; hands out RAII leases.
//! - [`engine`]: the five-operation adapter contract and its backends.
//! - [`router`]: drives one generation per lease and normalizes finish
//!   reasons.
//! - [`health`]: background polling that feeds forced eviction and the
//!   metrics gauges.
//! - [`server`]: the axum HTTP surface (OpenAI-shaped JSON, SSE
//!   streaming).

pub mod catalog;
pub mod config;
pub mod engine;
pub mod health;
pub mod ledger;
pub mod lifecycle;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use catalog::ModelCatalog;
use engine::EngineSet;
use health::{HealthChecker, HealthReport, HealthReporter};
use ledger::{LedgerConfig, ResourceLedger};
use lifecycle::{LifecycleManager, ManagerCounters, ModelSnapshot};
use router::{GenerationParams, GenerationRouter, GenerationStream, ServeError};
use shutdown::{DrainOutcome, ShutdownCoordinator};

/// Knobs for assembling a [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ledger: LedgerConfig,
    /// How long a request waits on a same-name transition before failing.
    pub acquire_timeout: Duration,
    /// Health reporter polling interval.
    pub health_interval: Duration,
    /// Drain bound applied before models are unloaded at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            acquire_timeout: Duration::from_secs(120),
            health_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Read-only view of the whole gateway for monitoring endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub models: Vec<ModelSnapshot>,
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub used_slots: usize,
    pub max_slots: usize,
    pub active_sessions: u32,
    pub counters: ManagerCounters,
    pub uptime_secs: u64,
}

/// The assembled gateway: one explicitly constructed, explicitly owned
/// object passed to every request handler.
pub struct Gateway {
    catalog: Arc<ModelCatalog>,
    manager: Arc<LifecycleManager>,
    router: GenerationRouter,
    shutdown: Arc<ShutdownCoordinator>,
    health: HealthChecker,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(config: GatewayConfig, catalog: ModelCatalog, engines: EngineSet) -> Self {
        let catalog = Arc::new(catalog);
        let ledger = Arc::new(ResourceLedger::new(config.ledger.clone()));
        let engines = Arc::new(engines);
        let manager = Arc::new(LifecycleManager::new(
            catalog.clone(),
            ledger,
            engines,
            config.acquire_timeout,
        ));
        let router = GenerationRouter::new(manager.clone());

        Self {
            catalog,
            manager,
            router,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            health: HealthChecker::new(),
            config,
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Acquire a ready handle for `model` and stream one generation on it.
    ///
    /// The single entry point the HTTP layer uses; every typed failure in
    /// the error taxonomy surfaces through the returned `ServeError`.
    pub async fn serve(
        &self,
        model: &str,
        params: GenerationParams,
    ) -> Result<GenerationStream, ServeError> {
        let guard = self
            .shutdown
            .track_session()
            .ok_or(ServeError::ShuttingDown)?;

        let mut stream = self.router.serve(model, params).await?;
        stream.attach_shutdown_guard(guard);
        Ok(stream)
    }

    /// Point-in-time view of models, budget, and sessions.
    pub fn status(&self) -> GatewaySnapshot {
        let ledger = self.manager.ledger();
        GatewaySnapshot {
            models: self.manager.status(),
            used_bytes: ledger.used_bytes(),
            max_bytes: ledger.config().max_resident_bytes,
            used_slots: ledger.used_slots(),
            max_slots: ledger.config().max_resident_models,
            active_sessions: self.shutdown.in_flight_count(),
            counters: self.manager.counters(),
            uptime_secs: self.health.uptime().as_secs(),
        }
    }

    pub async fn health_report(&self) -> HealthReport {
        self.health.report(
            self.shutdown.state().await,
            &self.manager,
            self.shutdown.in_flight_count(),
        )
    }

    /// Start the background health reporter.
    pub fn spawn_health_reporter(&self) -> tokio::task::JoinHandle<()> {
        HealthReporter::new(
            self.manager.clone(),
            self.shutdown.clone(),
            self.config.health_interval,
        )
        .spawn()
    }

    /// Graceful shutdown: drain sessions, then unload every idle model and
    /// await each adapter's confirmation before returning.
    pub async fn shutdown(&self) -> DrainOutcome {
        let outcome = self.shutdown.initiate(self.config.shutdown_timeout).await;
        if let DrainOutcome::Timeout { remaining } = &outcome {
            tracing::warn!(remaining, "drain timed out, unloading idle models anyway");
        }
        let unloaded = self.manager.evict_all().await;
        tracing::info!(unloaded, "gateway shutdown complete");
        outcome
    }
}
