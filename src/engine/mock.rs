//! Deterministic in-process engine for tests and wiring verification.
//!
//! Emits a scripted token sequence with configurable delays and fault
//! injection: failed loads, mid-stream backend errors, unhealthy handles.
//! No model math, no filesystem access.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    EngineAdapter, EngineError, EngineHandle, EngineKind, FinishReason, GenerationRequest,
    TokenEvent,
};
use crate::catalog::ModelDescriptor;

#[derive(Clone)]
struct MockModel {
    name: String,
    footprint: Arc<AtomicU64>,
    healthy: Arc<AtomicBool>,
}

struct MockState {
    load_delay: Mutex<Duration>,
    token_delay: Mutex<Duration>,
    tokens: Mutex<Vec<String>>,
    endless: AtomicBool,
    fail_next_load: AtomicBool,
    fail_generation_after: Mutex<Option<u32>>,
    load_log: Mutex<Vec<String>>,
    unload_log: Mutex<Vec<String>>,
    handles: DashMap<u64, MockModel>,
    next_id: AtomicU64,
}

/// Scripted engine adapter. Cloning shares the underlying state so a test
/// can keep a copy for assertions after installing one into an engine set.
#[derive(Clone)]
pub struct MockEngine {
    kind: EngineKind,
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            state: Arc::new(MockState {
                load_delay: Mutex::new(Duration::ZERO),
                token_delay: Mutex::new(Duration::ZERO),
                tokens: Mutex::new(
                    ["The", " answer", " is", " 42", "."]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
                endless: AtomicBool::new(false),
                fail_next_load: AtomicBool::new(false),
                fail_generation_after: Mutex::new(None),
                load_log: Mutex::new(Vec::new()),
                unload_log: Mutex::new(Vec::new()),
                handles: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// How long `load` sleeps before completing.
    pub fn set_load_delay(&self, delay: Duration) {
        *self.state.load_delay.lock() = delay;
    }

    /// Delay between emitted tokens.
    pub fn set_token_delay(&self, delay: Duration) {
        *self.state.token_delay.lock() = delay;
    }

    /// Replace the scripted token sequence.
    pub fn set_tokens(&self, tokens: Vec<&str>) {
        *self.state.tokens.lock() = tokens.into_iter().map(String::from).collect();
    }

    /// Repeat the script forever (until max_tokens or cancellation).
    pub fn set_endless(&self, endless: bool) {
        self.state.endless.store(endless, Ordering::SeqCst);
    }

    /// Make the next `load` call fail with a load error.
    pub fn fail_next_load(&self) {
        self.state.fail_next_load.store(true, Ordering::SeqCst);
    }

    /// Inject a backend failure after `n` tokens of the next generations.
    pub fn fail_generation_after(&self, n: u32) {
        *self.state.fail_generation_after.lock() = Some(n);
    }

    /// Mark every handle serving `name` as unhealthy.
    pub fn set_unhealthy(&self, name: &str) {
        for entry in self.state.handles.iter() {
            if entry.value().name == name {
                entry.value().healthy.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Override the reported footprint for every handle serving `name`.
    pub fn set_footprint(&self, name: &str, bytes: u64) {
        for entry in self.state.handles.iter() {
            if entry.value().name == name {
                entry.value().footprint.store(bytes, Ordering::SeqCst);
            }
        }
    }

    /// Names passed to `load`, in call order.
    pub fn loads(&self) -> Vec<String> {
        self.state.load_log.lock().clone()
    }

    pub fn load_count(&self) -> usize {
        self.state.load_log.lock().len()
    }

    pub fn load_count_for(&self, name: &str) -> usize {
        self.state
            .load_log
            .lock()
            .iter()
            .filter(|n| n.as_str() == name)
            .count()
    }

    /// Names passed to `unload`, in call order.
    pub fn unloads(&self) -> Vec<String> {
        self.state.unload_log.lock().clone()
    }

    /// Names currently resident in this adapter.
    pub fn resident(&self) -> Vec<String> {
        self.state
            .handles
            .iter()
            .map(|e| e.value().name.clone())
            .collect()
    }
}

#[async_trait]
impl EngineAdapter for MockEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<EngineHandle, EngineError> {
        let delay = *self.state.load_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.state.load_log.lock().push(descriptor.name.clone());

        if self.state.fail_next_load.swap(false, Ordering::SeqCst) {
            return Err(EngineError::LoadFailed("injected load failure".to_string()));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.handles.insert(
            id,
            MockModel {
                name: descriptor.name.clone(),
                footprint: Arc::new(AtomicU64::new(descriptor.cost_bytes)),
                healthy: Arc::new(AtomicBool::new(true)),
            },
        );
        Ok(EngineHandle::new(id))
    }

    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError> {
        match self.state.handles.remove(&handle.id()) {
            Some((_, model)) => {
                self.state.unload_log.lock().push(model.name);
                Ok(())
            }
            None => Err(EngineError::UnknownHandle(handle.id())),
        }
    }

    async fn generate(
        &self,
        handle: EngineHandle,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<TokenEvent>, EngineError> {
        if !self.state.handles.contains_key(&handle.id()) {
            return Err(EngineError::UnknownHandle(handle.id()));
        }

        let script = self.state.tokens.lock().clone();
        let token_delay = *self.state.token_delay.lock();
        let endless = self.state.endless.load(Ordering::SeqCst);
        let fail_after = *self.state.fail_generation_after.lock();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut emitted = 0u32;
            let mut accumulated = String::new();

            'outer: loop {
                for piece in &script {
                    if !token_delay.is_zero() {
                        tokio::time::sleep(token_delay).await;
                    }

                    if let Some(limit) = fail_after {
                        if emitted >= limit {
                            let _ = tx
                                .send(TokenEvent::Error("injected backend failure".to_string()))
                                .await;
                            return;
                        }
                    }

                    if emitted >= request.max_tokens {
                        let _ = tx
                            .send(TokenEvent::Done {
                                finish: FinishReason::Length,
                                completion_tokens: emitted,
                            })
                            .await;
                        return;
                    }

                    accumulated.push_str(piece);
                    if request
                        .stop
                        .iter()
                        .any(|s| !s.is_empty() && accumulated.contains(s.as_str()))
                    {
                        let _ = tx
                            .send(TokenEvent::Done {
                                finish: FinishReason::Stop,
                                completion_tokens: emitted,
                            })
                            .await;
                        return;
                    }

                    if tx.send(TokenEvent::Token(piece.clone())).await.is_err() {
                        // Receiver dropped: session cancelled.
                        return;
                    }
                    emitted += 1;
                }

                if !endless {
                    break 'outer;
                }
            }

            let _ = tx
                .send(TokenEvent::Done {
                    finish: FinishReason::Stop,
                    completion_tokens: emitted,
                })
                .await;
        });

        Ok(rx)
    }

    async fn memory_footprint(&self, handle: EngineHandle) -> Option<u64> {
        self.state
            .handles
            .get(&handle.id())
            .map(|m| m.footprint.load(Ordering::SeqCst))
    }

    async fn is_healthy(&self, handle: EngineHandle) -> bool {
        self.state
            .handles
            .get(&handle.id())
            .map(|m| m.healthy.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}
