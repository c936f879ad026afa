//! Lifecycle manager tests: loader election, attach, retry, timeout.

use std::sync::Arc;
use std::time::Duration;

use modelgate::catalog::{ModelCatalog, ModelDescriptor};
use modelgate::engine::{EngineKind, EnginePreference, EngineSet, MockEngine};
use modelgate::ledger::{LedgerConfig, ResourceLedger};
use modelgate::lifecycle::{AcquireError, LifecycleManager, ModelState};

fn descriptor(name: &str, cost: u64) -> ModelDescriptor {
    ModelDescriptor {
        name: name.to_string(),
        path: format!("models/{name}.gguf").into(),
        engine: EnginePreference::Cpu,
        cost_bytes: cost,
        context_length: 2048,
    }
}

fn manager_with(
    models: &[(&str, u64)],
    max_models: usize,
    max_bytes: u64,
    acquire_timeout: Duration,
) -> (Arc<LifecycleManager>, MockEngine) {
    let catalog = ModelCatalog::new();
    for (name, cost) in models {
        catalog.register(descriptor(name, *cost)).unwrap();
    }

    let engine = MockEngine::new(EngineKind::Cpu);
    let mut engines = EngineSet::new();
    engines.install(Arc::new(engine.clone()));

    let ledger = Arc::new(ResourceLedger::new(LedgerConfig {
        max_resident_bytes: max_bytes,
        max_resident_models: max_models,
    }));

    let manager = Arc::new(LifecycleManager::new(
        Arc::new(catalog),
        ledger,
        Arc::new(engines),
        acquire_timeout,
    ));
    (manager, engine)
}

#[tokio::test]
async fn test_acquire_loads_then_attaches() {
    let (manager, engine) = manager_with(&[("alpha", 10)], 2, 100, Duration::from_secs(5));

    let lease1 = manager.acquire("alpha").await.unwrap();
    let lease2 = manager.acquire("alpha").await.unwrap();

    // Second acquire attached to the resident instance, no second load.
    assert_eq!(engine.load_count_for("alpha"), 1);
    assert!(Arc::ptr_eq(lease1.instance(), lease2.instance()));
    assert_eq!(lease1.instance().refcount(), 2);

    drop(lease1);
    drop(lease2);
    let resident = manager.resident_instances();
    assert_eq!(resident.len(), 1);
    assert_eq!(resident[0].refcount(), 0);
}

#[tokio::test]
async fn test_concurrent_acquires_trigger_exactly_one_load() {
    let (manager, engine) = manager_with(&[("alpha", 10)], 2, 100, Duration::from_secs(5));
    engine.set_load_delay(Duration::from_millis(50));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(
            async move { manager.acquire("alpha").await },
        ));
    }

    let mut leases = Vec::new();
    for task in tasks {
        leases.push(task.await.unwrap().unwrap());
    }

    assert_eq!(engine.load_count_for("alpha"), 1);
    for lease in &leases {
        assert!(Arc::ptr_eq(lease.instance(), leases[0].instance()));
    }
    assert_eq!(leases[0].instance().refcount(), 8);
}

#[tokio::test]
async fn test_unknown_model_fails_fast() {
    let (manager, engine) = manager_with(&[("alpha", 10)], 2, 100, Duration::from_secs(5));

    let err = manager.acquire("ghost").await.unwrap_err();
    assert!(matches!(err, AcquireError::NotFound(name) if name == "ghost"));
    assert_eq!(engine.load_count(), 0);

    // The failed lookup must not leave a stuck transition behind.
    assert!(manager.status().is_empty());
}

#[tokio::test]
async fn test_failed_load_releases_budget_and_stays_retryable() {
    let (manager, engine) = manager_with(&[("alpha", 10)], 2, 100, Duration::from_secs(5));
    engine.fail_next_load();

    let err = manager.acquire("alpha").await.unwrap_err();
    assert!(matches!(err, AcquireError::ModelLoadFailed { .. }));
    assert_eq!(manager.ledger().used_bytes(), 0);
    assert_eq!(manager.ledger().used_slots(), 0);
    assert!(manager.status().is_empty());

    // Same name loads fine on the next request.
    let lease = manager.acquire("alpha").await.unwrap();
    assert_eq!(lease.instance().refcount(), 1);
    assert_eq!(engine.load_count_for("alpha"), 2);
}

#[tokio::test]
async fn test_waiter_times_out_during_slow_load() {
    let (manager, engine) = manager_with(&[("alpha", 10)], 2, 100, Duration::from_millis(60));
    engine.set_load_delay(Duration::from_millis(300));

    let loader = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire("alpha").await })
    };

    // Let the loader win the election before the waiter arrives.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = manager.acquire("alpha").await.unwrap_err();
    assert!(matches!(err, AcquireError::Timeout(name) if name == "alpha"));

    // The loader itself is not bounded by the waiter timeout.
    let lease = loader.await.unwrap().unwrap();
    assert_eq!(lease.instance().refcount(), 1);
}

#[tokio::test]
async fn test_waiters_attach_after_load_completes() {
    let (manager, engine) = manager_with(&[("alpha", 10)], 2, 100, Duration::from_secs(5));
    engine.set_load_delay(Duration::from_millis(80));

    let loader = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire("alpha").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Mid-load the table reports a loading transition.
    let status = manager.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, ModelState::Loading);

    let waiter = manager.acquire("alpha").await.unwrap();
    let lease = loader.await.unwrap().unwrap();

    assert_eq!(engine.load_count_for("alpha"), 1);
    assert!(Arc::ptr_eq(waiter.instance(), lease.instance()));
}

#[tokio::test]
async fn test_status_reflects_ready_instance() {
    let (manager, _engine) = manager_with(&[("alpha", 10)], 2, 100, Duration::from_secs(5));

    let lease = manager.acquire("alpha").await.unwrap();
    let status = manager.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].name, "alpha");
    assert_eq!(status[0].state, ModelState::Ready);
    assert_eq!(status[0].refcount, 1);
    assert_eq!(status[0].memory_bytes, 10);
    assert!(status[0].healthy);

    drop(lease);
    assert_eq!(manager.status()[0].refcount, 0);
}

#[tokio::test]
async fn test_loads_for_different_models_run_independently() {
    let (manager, engine) = manager_with(
        &[("alpha", 10), ("beta", 10)],
        2,
        100,
        Duration::from_secs(5),
    );
    engine.set_load_delay(Duration::from_millis(100));

    let start = std::time::Instant::now();
    let (a, b) = tokio::join!(
        {
            let m = manager.clone();
            async move { m.acquire("alpha").await }
        },
        {
            let m = manager.clone();
            async move { m.acquire("beta").await }
        }
    );
    a.unwrap();
    b.unwrap();

    // Two 100ms loads overlapping, not serialized through a global lock.
    assert!(
        start.elapsed() < Duration::from_millis(190),
        "loads for different names must not serialize"
    );
    assert_eq!(engine.load_count(), 2);
}
