//! Health and metrics reporting.
//!
//! A background reporter polls every resident instance through its engine
//! adapter: liveness flags feed forced eviction of broken instances, and
//! measured footprints keep `status()` honest. Aggregate figures are
//! published through the `metrics` facade.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::lifecycle::LifecycleManager;
use crate::shutdown::{ShutdownCoordinator, ShutdownState};

/// Overall gateway health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health report served on the monitoring endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub accepting_requests: bool,
    pub resident_models: usize,
    pub unhealthy_models: usize,
    pub memory_used_bytes: u64,
    pub active_sessions: u32,
    pub uptime_secs: u64,
}

/// Builds health reports from the gateway's live components.
pub struct HealthChecker {
    started: Instant,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn report(
        &self,
        shutdown_state: ShutdownState,
        manager: &LifecycleManager,
        active_sessions: u32,
    ) -> HealthReport {
        let instances = manager.resident_instances();
        let unhealthy = instances.iter().filter(|i| !i.is_healthy()).count();
        let memory: u64 = instances.iter().map(|i| i.footprint_bytes()).sum();

        let accepting = shutdown_state == ShutdownState::Running;
        let state = if !accepting {
            HealthState::Unhealthy
        } else if unhealthy > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        HealthReport {
            state,
            accepting_requests: accepting,
            resident_models: instances.len(),
            unhealthy_models: unhealthy,
            memory_used_bytes: memory,
            active_sessions,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Background poller feeding the lifecycle manager's health view.
pub struct HealthReporter {
    manager: Arc<LifecycleManager>,
    shutdown: Arc<ShutdownCoordinator>,
    interval: Duration,
}

impl HealthReporter {
    pub fn new(
        manager: Arc<LifecycleManager>,
        shutdown: Arc<ShutdownCoordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            shutdown,
            interval,
        }
    }

    /// Run the polling loop until shutdown begins.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if self.shutdown.state().await != ShutdownState::Running {
                    break;
                }
                refresh_once(&self.manager, &self.shutdown).await;
            }
        })
    }
}

/// One polling pass: refresh footprints, flag dead instances, sweep idle
/// unhealthy ones, publish gauges.
pub async fn refresh_once(manager: &LifecycleManager, shutdown: &ShutdownCoordinator) {
    let instances = manager.resident_instances();

    for instance in &instances {
        let adapter = match manager.engines().get(instance.engine_kind()) {
            Some(a) => a,
            None => continue,
        };

        if let Some(bytes) = adapter.memory_footprint(instance.handle()).await {
            instance.set_footprint_bytes(bytes);
        }

        if instance.is_healthy() && !adapter.is_healthy(instance.handle()).await {
            tracing::warn!(
                model = %instance.name(),
                engine = %instance.engine_kind(),
                "health check failed, flagging instance"
            );
            instance.mark_unhealthy();
        }
    }

    let swept = manager.sweep_unhealthy().await;
    if swept > 0 {
        tracing::info!(count = swept, "swept unhealthy models");
    }

    let resident = manager.resident_instances();
    let memory: u64 = resident.iter().map(|i| i.footprint_bytes()).sum();
    metrics::gauge!("modelgate_resident_models").set(resident.len() as f64);
    metrics::gauge!("modelgate_resident_bytes").set(memory as f64);
    metrics::gauge!("modelgate_active_sessions").set(shutdown.in_flight_count() as f64);
}
