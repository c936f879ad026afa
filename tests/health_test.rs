//! Health reporter tests: liveness flagging, forced eviction sweep,
//! footprint refresh.

use std::sync::Arc;
use std::time::Duration;

use modelgate::catalog::{ModelCatalog, ModelDescriptor};
use modelgate::engine::{EngineKind, EnginePreference, EngineSet, MockEngine};
use modelgate::health::refresh_once;
use modelgate::ledger::{LedgerConfig, ResourceLedger};
use modelgate::lifecycle::{AcquireError, LifecycleManager};
use modelgate::shutdown::ShutdownCoordinator;

fn setup(models: &[&str]) -> (Arc<LifecycleManager>, MockEngine, ShutdownCoordinator) {
    let catalog = ModelCatalog::new();
    for name in models {
        catalog
            .register(ModelDescriptor {
                name: name.to_string(),
                path: format!("models/{name}.gguf").into(),
                engine: EnginePreference::Cpu,
                cost_bytes: 100,
                context_length: 2048,
            })
            .unwrap();
    }

    let engine = MockEngine::new(EngineKind::Cpu);
    let mut engines = EngineSet::new();
    engines.install(Arc::new(engine.clone()));

    let manager = Arc::new(LifecycleManager::new(
        Arc::new(catalog),
        Arc::new(ResourceLedger::new(LedgerConfig {
            max_resident_bytes: 1_000,
            max_resident_models: 2,
        })),
        Arc::new(engines),
        Duration::from_secs(5),
    ));
    (manager, engine, ShutdownCoordinator::new())
}

#[tokio::test]
async fn test_pinned_unhealthy_instance_rejects_but_survives() {
    let (manager, engine, shutdown) = setup(&["alpha"]);

    let lease = manager.acquire("alpha").await.unwrap();
    engine.set_unhealthy("alpha");
    refresh_once(&manager, &shutdown).await;

    // The poll flagged the instance.
    assert!(!lease.instance().is_healthy());

    // New acquires fail, but the pinned instance is not torn down.
    let err = manager.acquire("alpha").await.unwrap_err();
    assert!(matches!(err, AcquireError::EngineUnhealthy(_)));
    assert_eq!(manager.resident_instances().len(), 1);
    assert!(engine.unloads().is_empty());
    assert_eq!(lease.instance().refcount(), 1);
}

#[tokio::test]
async fn test_sweep_evicts_idle_unhealthy_instance() {
    let (manager, engine, shutdown) = setup(&["alpha"]);

    drop(manager.acquire("alpha").await.unwrap());
    engine.set_unhealthy("alpha");

    // One pass flags it, and the sweep in the same pass evicts it.
    refresh_once(&manager, &shutdown).await;

    assert!(manager.resident_instances().is_empty());
    assert_eq!(engine.unloads(), vec!["alpha".to_string()]);
    assert_eq!(manager.ledger().used_bytes(), 0);

    // A fresh handle serves the next request.
    let lease = manager.acquire("alpha").await.unwrap();
    assert!(lease.instance().is_healthy());
    assert_eq!(engine.load_count_for("alpha"), 2);
}

#[tokio::test]
async fn test_unhealthy_acquire_evicts_idle_instance_on_the_spot() {
    let (manager, engine, shutdown) = setup(&["alpha"]);

    drop(manager.acquire("alpha").await.unwrap());
    engine.set_unhealthy("alpha");

    // Flag without sweeping: mark through the instances directly.
    use modelgate::engine::EngineAdapter;
    for instance in manager.resident_instances() {
        if !engine.is_healthy(instance.handle()).await {
            instance.mark_unhealthy();
        }
    }

    // Acquire sees the flagged idle instance, evicts it, and reports the
    // failure; the caller's retry then loads fresh.
    let err = manager.acquire("alpha").await.unwrap_err();
    assert!(matches!(err, AcquireError::EngineUnhealthy(_)));
    assert!(manager.resident_instances().is_empty());

    let lease = manager.acquire("alpha").await.unwrap();
    assert!(lease.instance().is_healthy());
    let _ = shutdown;
}

#[tokio::test]
async fn test_footprint_refresh_updates_instance_not_ledger() {
    let (manager, engine, shutdown) = setup(&["alpha"]);

    let lease = manager.acquire("alpha").await.unwrap();
    assert_eq!(lease.instance().footprint_bytes(), 100);

    // The engine measures more than the declared cost once warmed up.
    engine.set_footprint("alpha", 450);
    refresh_once(&manager, &shutdown).await;

    assert_eq!(lease.instance().footprint_bytes(), 450);
    // Admission stays on the declared cost.
    assert_eq!(manager.ledger().used_bytes(), 100);
}

#[tokio::test]
async fn test_healthy_instances_untouched_by_refresh() {
    let (manager, engine, shutdown) = setup(&["alpha", "beta"]);

    drop(manager.acquire("alpha").await.unwrap());
    drop(manager.acquire("beta").await.unwrap());

    refresh_once(&manager, &shutdown).await;

    assert_eq!(manager.resident_instances().len(), 2);
    assert!(engine.unloads().is_empty());
}
