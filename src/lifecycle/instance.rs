//! Per-model instance state tracked by the lifecycle manager.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::catalog::ModelDescriptor;
use crate::engine::{EngineHandle, EngineKind};

/// Lifecycle state of a model name as reported by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Loading,
    Ready,
    Unloading,
}

/// One loaded model inside one engine adapter.
///
/// Exactly one instance exists per loaded model name at any time; the
/// manager's state table enforces this even under concurrent requests.
#[derive(Debug)]
pub struct ModelInstance {
    descriptor: Arc<ModelDescriptor>,
    engine: EngineKind,
    handle: EngineHandle,
    loaded_at: Instant,
    loaded_at_wall: DateTime<Utc>,
    /// Refreshed at lease release, not acquire, so LRU reflects true
    /// idleness.
    last_used: Mutex<Instant>,
    refcount: AtomicU32,
    /// Measured footprint; starts at the declared cost and is refreshed by
    /// the health reporter. Reporting only; the ledger stays on the
    /// declared cost.
    footprint_bytes: AtomicU64,
    healthy: AtomicBool,
}

impl ModelInstance {
    pub fn new(
        descriptor: Arc<ModelDescriptor>,
        engine: EngineKind,
        handle: EngineHandle,
        footprint_bytes: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            descriptor,
            engine,
            handle,
            loaded_at: now,
            loaded_at_wall: Utc::now(),
            last_used: Mutex::new(now),
            refcount: AtomicU32::new(0),
            footprint_bytes: AtomicU64::new(footprint_bytes),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn footprint_bytes(&self) -> u64 {
        self.footprint_bytes.load(Ordering::SeqCst)
    }

    pub fn set_footprint_bytes(&self, bytes: u64) {
        self.footprint_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// Take one reference. Only the manager calls this, inside the table
    /// lock, so retains cannot race an eviction of the same instance.
    pub(crate) fn retain(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one reference, refreshing the idle clock. Guarded so a double
    /// release can never drive the count negative.
    pub(crate) fn release(&self) -> u32 {
        match self
            .refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
        {
            Ok(prev) => {
                *self.last_used.lock() = Instant::now();
                prev - 1
            }
            Err(_) => {
                debug_assert!(false, "release on zero refcount");
                tracing::warn!(model = %self.descriptor.name, "ignored release on zero refcount");
                0
            }
        }
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            name: self.descriptor.name.clone(),
            state: ModelState::Ready,
            engine: Some(self.engine),
            refcount: self.refcount(),
            memory_bytes: self.footprint_bytes(),
            healthy: self.is_healthy(),
            loaded_at: Some(self.loaded_at_wall),
            idle_secs: Some(self.last_used().elapsed().as_secs()),
        }
    }
}

/// Point-in-time view of one model name for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSnapshot {
    pub name: String,
    pub state: ModelState,
    pub engine: Option<EngineKind>,
    pub refcount: u32,
    pub memory_bytes: u64,
    pub healthy: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    pub idle_secs: Option<u64>,
}

impl ModelSnapshot {
    /// Snapshot for a name mid-transition, before or after it has an
    /// instance to report on.
    pub fn transitional(name: &str, state: ModelState) -> Self {
        Self {
            name: name.to_string(),
            state,
            engine: None,
            refcount: 0,
            memory_bytes: 0,
            healthy: true,
            loaded_at: None,
            idle_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EnginePreference;
    use std::path::PathBuf;

    fn instance() -> ModelInstance {
        let descriptor = Arc::new(ModelDescriptor {
            name: "test".to_string(),
            path: PathBuf::from("models/test.gguf"),
            engine: EnginePreference::Cpu,
            cost_bytes: 100,
            context_length: 2048,
        });
        ModelInstance::new(descriptor, EngineKind::Cpu, EngineHandle::new(1), 100)
    }

    #[test]
    fn test_retain_release_round_trip() {
        let inst = instance();
        assert_eq!(inst.refcount(), 0);
        assert_eq!(inst.retain(), 1);
        assert_eq!(inst.retain(), 2);
        assert_eq!(inst.release(), 1);
        assert_eq!(inst.release(), 0);
    }

    #[test]
    fn test_release_refreshes_idle_clock() {
        let inst = instance();
        inst.retain();
        let before = inst.last_used();
        std::thread::sleep(std::time::Duration::from_millis(5));
        inst.release();
        assert!(inst.last_used() > before);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_double_release_floors_at_zero() {
        let inst = instance();
        inst.retain();
        assert_eq!(inst.release(), 0);
        // A second release must not wrap the count.
        assert_eq!(inst.release(), 0);
        assert_eq!(inst.refcount(), 0);
    }

    #[test]
    fn test_release_on_zero_does_not_underflow_count() {
        let inst = instance();
        inst.retain();
        inst.release();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| inst.release()));
        // Debug builds assert; release builds floor at zero. Either way the
        // stored count must not wrap.
        let _ = result;
        assert_eq!(inst.refcount(), 0);
    }
}
