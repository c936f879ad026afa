//! Model lifecycle management.
//!
//! Owns the name → instance state machine, serializes load/unload/evict
//! decisions, and hands out RAII leases to ready instances.

mod instance;
mod manager;

pub use instance::{ModelInstance, ModelSnapshot, ModelState};
pub use manager::{AcquireError, LifecycleManager, ManagerCounters, ModelLease};
