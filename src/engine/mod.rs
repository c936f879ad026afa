//! Engine adapter layer for modelgate.
//!
//! Every inference backend is wrapped behind the same five-operation
//! contract: `load`, `unload`, `generate`, `memory_footprint`, `is_healthy`.
//! The gateway core never reaches past this trait; backend-specific
//! behavior is injected here and nowhere else.

pub mod detect;
mod mock;

mod accelerator;
mod cpu;
mod gpu;

#[cfg(feature = "gguf")]
mod gguf;

pub use accelerator::AcceleratorEngine;
pub use cpu::CpuEngine;
pub use detect::detect_engines;
pub use gpu::GpuEngine;
pub use mock::MockEngine;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::catalog::ModelDescriptor;

/// Which backend family an adapter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// CUDA-offloaded engine for discrete GPUs.
    Gpu,
    /// Metal-offloaded engine for Apple silicon.
    Accelerator,
    /// Generic CPU engine, available everywhere.
    Cpu,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::Accelerator => "accelerator",
            Self::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine choice declared by a catalog entry or the gateway config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePreference {
    /// Pick the best engine available on this platform.
    #[default]
    Auto,
    Gpu,
    Accelerator,
    Cpu,
}

impl EnginePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Gpu => "gpu",
            Self::Accelerator => "accelerator",
            Self::Cpu => "cpu",
        }
    }

    /// Parse a preference string, falling back to `Auto` on unknown input.
    pub fn parse_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" | "cuda" => Self::Gpu,
            "accelerator" | "metal" => Self::Accelerator,
            "cpu" | "llama_cpp" | "llama-cpp" => Self::Cpu,
            _ => Self::Auto,
        }
    }
}

/// Opaque reference to a loaded model within one engine adapter.
///
/// A handle is only meaningful to the adapter that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(u64);

impl EngineHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Runtime knobs shared by the native (llama-cpp) adapters.
#[derive(Debug, Clone)]
pub struct NativeEngineConfig {
    /// Context window the backend is created with.
    pub n_ctx: u32,
    /// Inference threads; 0 means auto-detect.
    pub n_threads: u32,
}

impl Default for NativeEngineConfig {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_threads: 0,
        }
    }
}

/// One generation call as seen by an adapter: prompt already rendered,
/// sampling knobs resolved.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

/// Why a token sequence ended, in the uniform vocabulary the gateway
/// reports to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// Natural end of sequence or an explicit stop string matched.
    Stop,
    /// The max_tokens limit was reached.
    Length,
    /// The backend failed mid-stream.
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Error => "error",
        }
    }
}

/// One item of an adapter's token stream.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// A decoded text fragment.
    Token(String),
    /// Terminal event: generation ended normally.
    Done {
        finish: FinishReason,
        completion_tokens: u32,
    },
    /// Terminal event: the backend failed. Always the last item sent.
    Error(String),
}

/// Errors surfaced by engine adapters.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} backend not compiled into this build")]
    Unavailable(EngineKind),

    #[error("model load failed: {0}")]
    LoadFailed(String),

    #[error("unknown engine handle: {0}")]
    UnknownHandle(u64),

    #[error("generation failed: {0}")]
    Generation(String),
}

/// The five-operation contract every backend implements.
///
/// `load` may block for seconds and `generate` streams until a stop
/// condition; neither is ever called while the lifecycle table lock is
/// held.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Load the model described by `descriptor` and return a handle to it.
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<EngineHandle, EngineError>;

    /// Unload a previously loaded model. Completion means the backend has
    /// returned the memory; the caller must not release budget earlier.
    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError>;

    /// Start a generation and return the receiving half of its token
    /// stream. Dropping the receiver cancels the generation.
    async fn generate(
        &self,
        handle: EngineHandle,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<TokenEvent>, EngineError>;

    /// Measured memory footprint of a loaded model, if the backend can
    /// report one.
    async fn memory_footprint(&self, handle: EngineHandle) -> Option<u64>;

    /// Liveness of a loaded model instance.
    async fn is_healthy(&self, handle: EngineHandle) -> bool;
}

/// The set of adapters installed in this gateway process, keyed by kind.
pub struct EngineSet {
    adapters: HashMap<EngineKind, Arc<dyn EngineAdapter>>,
    /// Applied when a model declares no preference of its own.
    default_preference: EnginePreference,
}

impl EngineSet {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            default_preference: EnginePreference::Auto,
        }
    }

    /// Set the gateway-wide preference used for `auto` models.
    pub fn set_default_preference(&mut self, preference: EnginePreference) {
        self.default_preference = preference;
    }

    /// Install an adapter, replacing any previous adapter of the same kind.
    pub fn install(&mut self, adapter: Arc<dyn EngineAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn EngineAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        self.adapters.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Resolve a preference to an installed adapter, falling back along
    /// the platform chain (gpu → accelerator → cpu) when the preferred
    /// engine is not installed.
    pub fn resolve(
        &self,
        preference: EnginePreference,
    ) -> Result<(EngineKind, Arc<dyn EngineAdapter>), EngineError> {
        let preference = if preference == EnginePreference::Auto {
            self.default_preference
        } else {
            preference
        };
        let order: &[EngineKind] = match preference {
            EnginePreference::Gpu => &[EngineKind::Gpu, EngineKind::Cpu],
            EnginePreference::Accelerator => &[EngineKind::Accelerator, EngineKind::Cpu],
            EnginePreference::Cpu => &[EngineKind::Cpu],
            EnginePreference::Auto => &[EngineKind::Gpu, EngineKind::Accelerator, EngineKind::Cpu],
        };

        for kind in order {
            if let Some(adapter) = self.get(*kind) {
                let fell_back =
                    !matches!(preference, EnginePreference::Auto | EnginePreference::Cpu)
                        && *kind == EngineKind::Cpu;
                if fell_back {
                    tracing::warn!(
                        preferred = ?preference,
                        "preferred engine unavailable, falling back to cpu"
                    );
                }
                return Ok((*kind, adapter));
            }
        }

        Err(EngineError::Unavailable(EngineKind::Cpu))
    }
}

impl Default for EngineSet {
    fn default() -> Self {
        Self::new()
    }
}
