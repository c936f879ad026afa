//! Graceful shutdown coordination.
//!
//! A small state machine for clean process exit: stop admitting new
//! generation sessions, wait for in-flight ones to drain, then let the
//! gateway unload every resident model before the process ends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};

/// Shutdown phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Outcome of a drain attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Complete,
    Timeout { remaining: u32 },
}

/// Coordinates session admission and drain across the gateway.
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    in_flight: Arc<AtomicU32>,
    drained: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            in_flight: Arc::new(AtomicU32::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Whether new sessions are being admitted.
    pub fn is_accepting(&self) -> bool {
        self.state
            .try_read()
            .map(|s| *s == ShutdownState::Running)
            .unwrap_or(false)
    }

    /// Admit one session. Returns `None` once draining has begun.
    pub fn track_session(&self) -> Option<SessionGuard> {
        if !self.is_accepting() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(SessionGuard {
            counter: self.in_flight.clone(),
            drained: self.drained.clone(),
        })
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop admitting sessions and wait for the in-flight count to reach
    /// zero, bounded by `timeout`.
    pub async fn initiate(&self, timeout: Duration) -> DrainOutcome {
        {
            let mut state = self.state.write().await;
            *state = ShutdownState::Draining;
        }

        let outcome = self.wait_for_drain(timeout).await;

        {
            let mut state = self.state.write().await;
            *state = ShutdownState::Stopped;
        }

        outcome
    }

    async fn wait_for_drain(&self, timeout: Duration) -> DrainOutcome {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight_count() == 0 {
                return DrainOutcome::Complete;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return DrainOutcome::Timeout {
                    remaining: self.in_flight_count(),
                };
            }

            tokio::select! {
                _ = self.drained.notified() => continue,
                _ = tokio::time::sleep(remaining) => {
                    let count = self.in_flight_count();
                    if count == 0 {
                        return DrainOutcome::Complete;
                    }
                    return DrainOutcome::Timeout { remaining: count };
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one admitted session.
#[derive(Debug)]
pub struct SessionGuard {
    counter: Arc<AtomicU32>,
    drained: Arc<Notify>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_one();
    }
}
