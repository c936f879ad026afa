//! Platform detection and default engine set construction.
//!
//! Mirrors the preference order a local gateway wants: CUDA when a device
//! is present, Metal on Apple silicon, and always the CPU engine as the
//! universal fallback.

use std::sync::Arc;

use super::{AcceleratorEngine, CpuEngine, EngineSet, GpuEngine, NativeEngineConfig};

/// Build the engine set for this process.
///
/// The CPU adapter is always installed. Device-backed adapters are only
/// installed when their feature is compiled in and a probe succeeds, so a
/// cuda build on a machine without a GPU degrades instead of failing.
pub fn detect_engines(config: &NativeEngineConfig) -> EngineSet {
    let mut set = EngineSet::new();
    set.install(Arc::new(CpuEngine::new(config.clone())));

    if cfg!(feature = "cuda") {
        if GpuEngine::cuda_available() {
            tracing::info!("cuda device detected, installing gpu engine");
            set.install(Arc::new(GpuEngine::new(config.clone())));
        } else {
            tracing::warn!("cuda feature compiled in but no device found");
        }
    }

    if cfg!(all(feature = "metal", target_os = "macos", target_arch = "aarch64")) {
        if AcceleratorEngine::metal_available() {
            tracing::info!("metal device detected, installing accelerator engine");
            set.install(Arc::new(AcceleratorEngine::new(config.clone())));
        } else {
            tracing::warn!("metal feature compiled in but no device found");
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;

    #[test]
    fn test_cpu_engine_always_installed() {
        let set = detect_engines(&NativeEngineConfig::default());
        assert!(set.get(EngineKind::Cpu).is_some());
    }
}
