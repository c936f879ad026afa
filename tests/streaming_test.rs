//! Generation router tests: token streaming, finish mapping, release
//! discipline, cancellation.

use std::sync::Arc;
use std::time::Duration;

use modelgate::catalog::{ModelCatalog, ModelDescriptor};
use modelgate::engine::{EngineKind, EnginePreference, EngineSet, FinishReason, MockEngine};
use modelgate::ledger::{LedgerConfig, ResourceLedger};
use modelgate::lifecycle::LifecycleManager;
use modelgate::router::{GenerationParams, GenerationRouter, ServeError, StreamEvent};

fn setup(models: &[&str]) -> (GenerationRouter, Arc<LifecycleManager>, MockEngine) {
    let catalog = ModelCatalog::new();
    for name in models {
        catalog
            .register(ModelDescriptor {
                name: name.to_string(),
                path: format!("models/{name}.gguf").into(),
                engine: EnginePreference::Cpu,
                cost_bytes: 10,
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
            max_resident_bytes: 100,
            max_resident_models: 2,
        })),
        Arc::new(engines),
        Duration::from_secs(5),
    ));
    (GenerationRouter::new(manager.clone()), manager, engine)
}

fn refcount_of(manager: &LifecycleManager, name: &str) -> u32 {
    manager
        .resident_instances()
        .iter()
        .find(|i| i.name() == name)
        .map(|i| i.refcount())
        .expect("model not resident")
}

#[tokio::test]
async fn test_stream_yields_tokens_then_stop() {
    let (router, manager, engine) = setup(&["alpha"]);
    engine.set_tokens(vec!["Hello", " world"]);

    let mut stream = router
        .serve("alpha", GenerationParams::from_prompt("hi"))
        .await
        .unwrap();

    let mut text = String::new();
    let mut finish = None;
    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::Token(piece) => text.push_str(&piece),
            StreamEvent::Done { finish: f, usage } => {
                finish = Some(f);
                assert_eq!(usage.completion_tokens, 2);
            }
            StreamEvent::Error { message } => panic!("unexpected error: {message}"),
        }
    }

    assert_eq!(text, "Hello world");
    assert_eq!(finish, Some(FinishReason::Stop));
    // The lease was released on the terminal event.
    assert_eq!(refcount_of(&manager, "alpha"), 0);
}

#[tokio::test]
async fn test_non_streaming_buffers_the_same_sequence() {
    let (router, _manager, engine) = setup(&["alpha"]);
    engine.set_tokens(vec!["The", " answer"]);

    let done = router
        .serve("alpha", GenerationParams::from_prompt("one two three"))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(done.text, "The answer");
    assert_eq!(done.finish, FinishReason::Stop);
    assert_eq!(done.usage.prompt_tokens, 3);
    assert_eq!(done.usage.completion_tokens, 2);
    assert_eq!(done.usage.total_tokens, 5);
}

#[tokio::test]
async fn test_max_tokens_maps_to_length_finish() {
    let (router, _manager, engine) = setup(&["alpha"]);
    engine.set_endless(true);

    let mut params = GenerationParams::from_prompt("hi");
    params.max_tokens = 3;

    let done = router
        .serve("alpha", params)
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(done.finish, FinishReason::Length);
    assert_eq!(done.usage.completion_tokens, 3);
}

#[tokio::test]
async fn test_stop_sequence_maps_to_stop_finish() {
    let (router, _manager, engine) = setup(&["alpha"]);
    engine.set_tokens(vec!["foo", "bar", "baz"]);

    let mut params = GenerationParams::from_prompt("hi");
    params.stop = vec!["bar".to_string()];

    let done = router
        .serve("alpha", params)
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(done.text, "foo");
    assert_eq!(done.finish, FinishReason::Stop);
}

#[tokio::test]
async fn test_cancellation_restores_refcount() {
    let (router, manager, engine) = setup(&["alpha"]);
    engine.set_endless(true);
    engine.set_token_delay(Duration::from_millis(5));

    let mut stream = router
        .serve("alpha", GenerationParams::from_prompt("hi"))
        .await
        .unwrap();

    assert!(matches!(
        stream.next_event().await,
        Some(StreamEvent::Token(_))
    ));
    assert_eq!(refcount_of(&manager, "alpha"), 1);

    // Client disconnects mid-stream.
    drop(stream);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(refcount_of(&manager, "alpha"), 0);
    // The instance itself is untouched: still resident and healthy.
    let status = manager.status();
    assert_eq!(status.len(), 1);
    assert!(status[0].healthy);
}

#[tokio::test]
async fn test_midstream_failure_ends_with_error_marker() {
    let (router, manager, engine) = setup(&["alpha"]);
    engine.set_endless(true);
    engine.fail_generation_after(2);

    let mut stream = router
        .serve("alpha", GenerationParams::from_prompt("hi"))
        .await
        .unwrap();

    let mut tokens = 0;
    let mut saw_error = false;
    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::Token(_) => tokens += 1,
            StreamEvent::Error { .. } => saw_error = true,
            StreamEvent::Done { .. } => panic!("stream must not finish cleanly"),
        }
    }

    assert_eq!(tokens, 2);
    assert!(saw_error, "failure must surface as an explicit marker");
    assert_eq!(stream.finish_reason(), Some(FinishReason::Error));
    assert_eq!(refcount_of(&manager, "alpha"), 0);
}

#[tokio::test]
async fn test_midstream_failure_fails_non_streaming_call() {
    let (router, _manager, engine) = setup(&["alpha"]);
    engine.set_endless(true);
    engine.fail_generation_after(1);

    let err = router
        .serve("alpha", GenerationParams::from_prompt("hi"))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert!(matches!(err, ServeError::Generation(_)));
}

#[tokio::test]
async fn test_serve_unknown_model_surfaces_not_found() {
    let (router, _manager, _engine) = setup(&["alpha"]);

    let err = router
        .serve("ghost", GenerationParams::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServeError::Acquire(_)));
}
