//! Accelerator engine adapter (Metal offload for Apple silicon).
//!
//! Same offload-everything policy as the GPU adapter, targeting the
//! system's Metal device. Only installed on builds with the `metal`
//! feature where a device answers the probe.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    EngineAdapter, EngineError, EngineHandle, EngineKind, GenerationRequest, NativeEngineConfig,
    TokenEvent,
};
use crate::catalog::ModelDescriptor;

#[cfg(feature = "metal")]
const OFFLOAD_ALL_LAYERS: u32 = 1_000_000;

#[cfg_attr(not(feature = "metal"), allow(dead_code))]
pub struct AcceleratorEngine {
    config: NativeEngineConfig,
    next_id: AtomicU64,
    #[cfg(feature = "metal")]
    models: dashmap::DashMap<u64, std::sync::Arc<super::gguf::GgufModel>>,
}

impl AcceleratorEngine {
    pub fn new(config: NativeEngineConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            #[cfg(feature = "metal")]
            models: dashmap::DashMap::new(),
        }
    }

    /// Whether a Metal device is present.
    #[cfg(feature = "metal")]
    pub fn metal_available() -> bool {
        metal::Device::system_default().is_some()
    }

    #[cfg(not(feature = "metal"))]
    pub fn metal_available() -> bool {
        false
    }
}

#[async_trait]
impl EngineAdapter for AcceleratorEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Accelerator
    }

    #[cfg(feature = "metal")]
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<EngineHandle, EngineError> {
        let params = super::gguf::GgufParams {
            n_ctx: self.config.n_ctx.min(descriptor.context_length),
            n_threads: self.config.n_threads,
            n_gpu_layers: OFFLOAD_ALL_LAYERS,
        };
        let path = descriptor.path.clone();
        let model = tokio::task::spawn_blocking(move || super::gguf::GgufModel::load(&path, &params))
            .await
            .map_err(|e| EngineError::LoadFailed(format!("load task: {e}")))??;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.models.insert(id, std::sync::Arc::new(model));
        Ok(EngineHandle::new(id))
    }

    #[cfg(not(feature = "metal"))]
    async fn load(&self, _descriptor: &ModelDescriptor) -> Result<EngineHandle, EngineError> {
        Err(EngineError::Unavailable(EngineKind::Accelerator))
    }

    #[cfg(feature = "metal")]
    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError> {
        self.models
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(EngineError::UnknownHandle(handle.id()))
    }

    #[cfg(not(feature = "metal"))]
    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError> {
        Err(EngineError::UnknownHandle(handle.id()))
    }

    #[cfg(feature = "metal")]
    async fn generate(
        &self,
        handle: EngineHandle,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<TokenEvent>, EngineError> {
        let model = self
            .models
            .get(&handle.id())
            .map(|m| m.value().clone())
            .ok_or(EngineError::UnknownHandle(handle.id()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::task::spawn_blocking(move || model.generate_blocking(&request, &tx));
        Ok(rx)
    }

    #[cfg(not(feature = "metal"))]
    async fn generate(
        &self,
        handle: EngineHandle,
        _request: GenerationRequest,
    ) -> Result<mpsc::Receiver<TokenEvent>, EngineError> {
        Err(EngineError::UnknownHandle(handle.id()))
    }

    async fn memory_footprint(&self, handle: EngineHandle) -> Option<u64> {
        #[cfg(feature = "metal")]
        {
            return self.models.get(&handle.id()).map(|m| m.size_bytes());
        }
        #[cfg(not(feature = "metal"))]
        {
            let _ = handle;
            None
        }
    }

    async fn is_healthy(&self, handle: EngineHandle) -> bool {
        #[cfg(feature = "metal")]
        {
            return self.models.contains_key(&handle.id());
        }
        #[cfg(not(feature = "metal"))]
        {
            let _ = handle;
            false
        }
    }
}
