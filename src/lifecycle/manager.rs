//! The lifecycle manager: single owner of every load/unload/evict decision.
//!
//! One state table maps model names to their slot
//! (`Loading | Ready | Unloading`). The table lock is held only for the
//! brief transition decision, never across an adapter call, so requests
//! for different models proceed independently. For a given name all
//! transitions are totally ordered: the one caller that observes an empty
//! slot performs the load, everyone else waits on that transition and
//! attaches.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::catalog::ModelCatalog;
use crate::engine::EngineSet;
use crate::ledger::{EvictionCandidate, ResourceLedger};

use super::instance::{ModelInstance, ModelSnapshot, ModelState};

/// Upper bound on one wait slice while a same-name transition resolves.
/// A notify fired between the table check and the wait is then at worst a
/// bounded delay, never a hang.
const TRANSITION_POLL_CAP: Duration = Duration::from_millis(25);

/// Errors surfaced by [`LifecycleManager::acquire`].
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("capacity exceeded loading {name}: {reason}")]
    CapacityExceeded { name: String, reason: String },

    #[error("model load failed for {name}: {reason}")]
    ModelLoadFailed { name: String, reason: String },

    #[error("engine unhealthy for model {0}")]
    EngineUnhealthy(String),

    #[error("timed out waiting for model {0} to finish its transition")]
    Timeout(String),
}

/// RAII reference to a ready model instance.
///
/// Dropping the lease releases the reference exactly once and refreshes
/// the instance's idle clock.
#[derive(Debug)]
pub struct ModelLease {
    instance: Arc<ModelInstance>,
}

impl ModelLease {
    fn new(instance: Arc<ModelInstance>) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<ModelInstance> {
        &self.instance
    }

    pub fn model_name(&self) -> &str {
        self.instance.name()
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.instance.release();
    }
}

enum Slot {
    Loading(Arc<Notify>),
    Ready(Arc<ModelInstance>),
    Unloading(Arc<Notify>),
}

enum Decision {
    Attached(Arc<ModelInstance>),
    Unhealthy(Arc<ModelInstance>),
    Wait(Arc<Notify>),
    Load(Arc<Notify>),
}

enum EvictOutcome {
    Evicted,
    NoCandidate,
}

/// Counters exposed through `status()`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ManagerCounters {
    pub loads_total: u64,
    pub load_failures: u64,
    pub evictions_total: u64,
}

pub struct LifecycleManager {
    catalog: Arc<ModelCatalog>,
    ledger: Arc<ResourceLedger>,
    engines: Arc<EngineSet>,
    table: Mutex<HashMap<String, Slot>>,
    acquire_timeout: Duration,
    loads_total: AtomicU64,
    load_failures: AtomicU64,
    evictions_total: AtomicU64,
}

impl LifecycleManager {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        ledger: Arc<ResourceLedger>,
        engines: Arc<EngineSet>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            ledger,
            engines,
            table: Mutex::new(HashMap::new()),
            acquire_timeout,
            loads_total: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            evictions_total: AtomicU64::new(0),
        }
    }

    pub fn engines(&self) -> &Arc<EngineSet> {
        &self.engines
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn counters(&self) -> ManagerCounters {
        ManagerCounters {
            loads_total: self.loads_total.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions_total: self.evictions_total.load(Ordering::Relaxed),
        }
    }

    /// Acquire a ready handle for `name`, loading or evicting as needed.
    ///
    /// The single entry point for all request paths. Blocks while a
    /// same-name transition is in flight, up to the configured timeout.
    pub async fn acquire(&self, name: &str) -> Result<ModelLease, AcquireError> {
        let deadline = Instant::now() + self.acquire_timeout;

        loop {
            let decision = {
                let mut table = self.table.lock();
                match table.get(name) {
                    Some(Slot::Ready(instance)) => {
                        if instance.is_healthy() {
                            // Attach: no new load for an already-resident
                            // model.
                            instance.retain();
                            Decision::Attached(instance.clone())
                        } else {
                            Decision::Unhealthy(instance.clone())
                        }
                    }
                    Some(Slot::Loading(notify)) | Some(Slot::Unloading(notify)) => {
                        Decision::Wait(notify.clone())
                    }
                    None => {
                        // Loader election: this caller owns the transition.
                        let notify = Arc::new(Notify::new());
                        table.insert(name.to_string(), Slot::Loading(notify.clone()));
                        Decision::Load(notify)
                    }
                }
            };

            match decision {
                Decision::Attached(instance) => return Ok(ModelLease::new(instance)),
                Decision::Unhealthy(instance) => {
                    return self.reject_unhealthy(name, instance).await;
                }
                Decision::Load(notify) => return self.run_load(name, notify).await,
                Decision::Wait(notify) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(AcquireError::Timeout(name.to_string()));
                    }
                    let slice = remaining.min(TRANSITION_POLL_CAP);
                    let _ = tokio::time::timeout(slice, notify.notified()).await;
                }
            }
        }
    }

    /// Perform the load this caller was elected for. The `Loading` slot is
    /// already in the table; every exit path must clear or replace it and
    /// wake waiters.
    async fn run_load(&self, name: &str, notify: Arc<Notify>) -> Result<ModelLease, AcquireError> {
        let descriptor = match self.catalog.resolve(name) {
            Ok(d) => d,
            Err(_) => {
                self.clear_slot(name, &notify);
                return Err(AcquireError::NotFound(name.to_string()));
            }
        };
        let cost = descriptor.cost_bytes;

        // Secure budget before the adapter sees the model: reserve first,
        // evicting idle models one at a time until the reservation fits.
        loop {
            match self.ledger.try_reserve(cost) {
                Ok(()) => break,
                Err(ledger_err) => match self.evict_one(name).await {
                    EvictOutcome::Evicted => continue,
                    EvictOutcome::NoCandidate => {
                        self.clear_slot(name, &notify);
                        return Err(AcquireError::CapacityExceeded {
                            name: name.to_string(),
                            reason: ledger_err.to_string(),
                        });
                    }
                },
            }
        }

        let (kind, adapter) = match self.engines.resolve(descriptor.engine) {
            Ok(pair) => pair,
            Err(e) => {
                self.ledger.release(cost);
                self.clear_slot(name, &notify);
                self.load_failures.fetch_add(1, Ordering::Relaxed);
                return Err(AcquireError::ModelLoadFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        match adapter.load(&descriptor).await {
            Ok(handle) => {
                let footprint = adapter.memory_footprint(handle).await.unwrap_or(cost);
                let instance = Arc::new(ModelInstance::new(descriptor, kind, handle, footprint));
                instance.retain();
                {
                    let mut table = self.table.lock();
                    table.insert(name.to_string(), Slot::Ready(instance.clone()));
                }
                notify.notify_waiters();
                self.loads_total.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("modelgate_loads_total").increment(1);
                tracing::info!(model = name, engine = %kind, cost_bytes = cost, "model loaded");
                Ok(ModelLease::new(instance))
            }
            Err(e) => {
                self.ledger.release(cost);
                self.clear_slot(name, &notify);
                self.load_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("modelgate_load_failures_total").increment(1);
                tracing::warn!(model = name, error = %e, "model load failed");
                Err(AcquireError::ModelLoadFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Drop the in-flight transition slot for `name` and wake its waiters
    /// so they re-run their acquire.
    fn clear_slot(&self, name: &str, notify: &Arc<Notify>) {
        self.table.lock().remove(name);
        notify.notify_waiters();
    }

    /// Select and evict one idle victim. Selection and the transition to
    /// `Unloading` happen in a single critical section so a concurrent
    /// eviction search cannot pick the same victim.
    async fn evict_one(&self, requesting: &str) -> EvictOutcome {
        let victim = {
            let mut table = self.table.lock();
            let excluding: HashSet<String> = [requesting.to_string()].into();
            let candidates: Vec<EvictionCandidate> = table
                .iter()
                .filter_map(|(n, slot)| match slot {
                    Slot::Ready(inst) => Some(EvictionCandidate {
                        name: n.clone(),
                        refcount: inst.refcount(),
                        last_used: inst.last_used(),
                        loaded_at: inst.loaded_at(),
                    }),
                    _ => None,
                })
                .collect();

            match self.ledger.pick_eviction_candidate(candidates, &excluding) {
                Some(victim_name) => {
                    let instance = match table.get(&victim_name) {
                        Some(Slot::Ready(inst)) => inst.clone(),
                        _ => return EvictOutcome::NoCandidate,
                    };
                    let notify = Arc::new(Notify::new());
                    table.insert(victim_name.clone(), Slot::Unloading(notify.clone()));
                    Some((victim_name, instance, notify))
                }
                None => None,
            }
        };

        match victim {
            Some((victim_name, instance, notify)) => {
                self.unload_instance(&victim_name, &instance).await;
                self.table.lock().remove(&victim_name);
                notify.notify_waiters();
                self.evictions_total.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("modelgate_evictions_total").increment(1);
                tracing::info!(model = %victim_name, "evicted idle model");
                EvictOutcome::Evicted
            }
            None => EvictOutcome::NoCandidate,
        }
    }

    /// An unhealthy instance never serves a new request. If it is idle it
    /// is evicted on the spot so the next acquire gets a fresh load; the
    /// caller still sees the failure either way.
    async fn reject_unhealthy(
        &self,
        name: &str,
        instance: Arc<ModelInstance>,
    ) -> Result<ModelLease, AcquireError> {
        let marked = {
            let mut table = self.table.lock();
            match table.get(name) {
                Some(Slot::Ready(current))
                    if Arc::ptr_eq(current, &instance) && instance.refcount() == 0 =>
                {
                    let notify = Arc::new(Notify::new());
                    table.insert(name.to_string(), Slot::Unloading(notify.clone()));
                    Some(notify)
                }
                _ => None,
            }
        };

        if let Some(notify) = marked {
            self.unload_instance(name, &instance).await;
            self.table.lock().remove(name);
            notify.notify_waiters();
            self.evictions_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(model = name, "evicted unhealthy model");
        }

        Err(AcquireError::EngineUnhealthy(name.to_string()))
    }

    /// Await the adapter's unload before returning the victim's budget;
    /// eviction is not done until the memory is confirmed back.
    async fn unload_instance(&self, name: &str, instance: &Arc<ModelInstance>) {
        if let Some(adapter) = self.engines.get(instance.engine_kind()) {
            if let Err(e) = adapter.unload(instance.handle()).await {
                tracing::warn!(model = name, error = %e, "engine unload reported failure");
            }
        }
        self.ledger.release(instance.descriptor().cost_bytes);
    }

    /// Evict every idle unhealthy instance. Driven by the health reporter.
    pub async fn sweep_unhealthy(&self) -> usize {
        let victims = {
            let mut table = self.table.lock();
            let mut marked = Vec::new();
            let names: Vec<String> = table
                .iter()
                .filter_map(|(n, slot)| match slot {
                    Slot::Ready(inst) if !inst.is_healthy() && inst.refcount() == 0 => {
                        Some(n.clone())
                    }
                    _ => None,
                })
                .collect();
            for name in names {
                if let Some(Slot::Ready(inst)) = table.get(&name) {
                    let inst = inst.clone();
                    let notify = Arc::new(Notify::new());
                    table.insert(name.clone(), Slot::Unloading(notify.clone()));
                    marked.push((name, inst, notify));
                }
            }
            marked
        };

        let count = victims.len();
        for (name, instance, notify) in victims {
            self.unload_instance(&name, &instance).await;
            self.table.lock().remove(&name);
            notify.notify_waiters();
            self.evictions_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(model = %name, "swept unhealthy model");
        }
        count
    }

    /// Unload every idle instance. Used at shutdown after sessions have
    /// drained; models still pinned are logged and left to their leases.
    pub async fn evict_all(&self) -> usize {
        let mut evicted = 0;
        loop {
            let victim = {
                let mut table = self.table.lock();
                let next = table.iter().find_map(|(n, slot)| match slot {
                    Slot::Ready(inst) if inst.refcount() == 0 => Some((n.clone(), inst.clone())),
                    _ => None,
                });
                match next {
                    Some((name, inst)) => {
                        let notify = Arc::new(Notify::new());
                        table.insert(name.clone(), Slot::Unloading(notify.clone()));
                        Some((name, inst, notify))
                    }
                    None => None,
                }
            };

            match victim {
                Some((name, instance, notify)) => {
                    self.unload_instance(&name, &instance).await;
                    self.table.lock().remove(&name);
                    notify.notify_waiters();
                    evicted += 1;
                }
                None => break,
            }
        }

        let pinned: Vec<String> = {
            let table = self.table.lock();
            table
                .iter()
                .filter_map(|(n, slot)| match slot {
                    Slot::Ready(inst) if inst.refcount() > 0 => Some(n.clone()),
                    _ => None,
                })
                .collect()
        };
        for name in pinned {
            tracing::warn!(model = %name, "model still pinned at shutdown");
        }

        evicted
    }

    /// Ready instances, for the health reporter's polling pass.
    pub fn resident_instances(&self) -> Vec<Arc<ModelInstance>> {
        let table = self.table.lock();
        table
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(inst) => Some(inst.clone()),
                _ => None,
            })
            .collect()
    }

    /// Point-in-time view of every tracked model name.
    pub fn status(&self) -> Vec<ModelSnapshot> {
        let table = self.table.lock();
        let mut snapshots: Vec<ModelSnapshot> = table
            .iter()
            .map(|(name, slot)| match slot {
                Slot::Loading(_) => ModelSnapshot::transitional(name, ModelState::Loading),
                Slot::Unloading(_) => ModelSnapshot::transitional(name, ModelState::Unloading),
                Slot::Ready(inst) => inst.snapshot(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
