//! Gateway configuration loading from environment variables.
//!
//! All values come from `MODELGATE_*` variables with safe defaults;
//! missing or invalid values fall back without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `MODELGATE_HOST` | 127.0.0.1 | Listen address |
//! | `MODELGATE_PORT` | 8090 | Listen port |
//! | `MODELGATE_CATALOG` | models.toml | Model catalog file |
//! | `MODELGATE_ENGINE` | auto | Engine preference (auto/gpu/accelerator/cpu) |
//! | `MODELGATE_MAX_RESIDENT_BYTES` | 8589934592 | Resident model byte budget |
//! | `MODELGATE_MAX_RESIDENT_MODELS` | 2 | Resident model slot budget |
//! | `MODELGATE_ACQUIRE_TIMEOUT` | 120 | Same-name transition wait (secs) |
//! | `MODELGATE_HEALTH_INTERVAL` | 30 | Health poll interval (secs) |
//! | `MODELGATE_SHUTDOWN_TIMEOUT` | 30 | Graceful drain timeout (secs) |
//! | `MODELGATE_N_CTX` | 4096 | Backend context window |
//! | `MODELGATE_N_THREADS` | 0 | Inference threads (0 = auto) |
//! | `MODELGATE_LOG_LEVEL` | info | Tracing filter |
//! | `MODELGATE_LOG_FORMAT` | pretty | `pretty` or `json` |
//! | `MODELGATE_LOG_FILE` | (stderr) | Optional log file path |

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{EnginePreference, NativeEngineConfig};
use crate::ledger::LedgerConfig;
use crate::telemetry::{LogConfig, LogFormat};

/// All gateway configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub host: String,
    pub port: u16,
    pub catalog_path: PathBuf,
    pub engine: EnginePreference,
    pub ledger: LedgerConfig,
    pub acquire_timeout: Duration,
    pub health_interval: Duration,
    pub shutdown_timeout: Duration,
    pub native: NativeEngineConfig,
    pub log: LogConfig,
}

/// Serializable summary of the effective values, for `config show`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EffectiveConfig {
    pub host: String,
    pub port: u16,
    pub catalog_path: String,
    pub engine: EnginePreference,
    pub max_resident_bytes: u64,
    pub max_resident_models: usize,
    pub acquire_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub n_ctx: u32,
    pub n_threads: u32,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u16(key: &str, default: u16) -> u16 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u16>().unwrap_or(default),
        Err(_) => default,
    }
}

fn load_ledger_config() -> LedgerConfig {
    let bytes = parse_u64("MODELGATE_MAX_RESIDENT_BYTES", 8 * 1024 * 1024 * 1024);
    let models = parse_usize("MODELGATE_MAX_RESIDENT_MODELS", 2);
    LedgerConfig {
        max_resident_bytes: bytes.max(1024 * 1024), // floor: 1 MiB
        max_resident_models: models.max(1),
    }
}

fn load_native_config() -> NativeEngineConfig {
    let n_ctx = parse_u32("MODELGATE_N_CTX", 4096);
    let n_threads = parse_u32("MODELGATE_N_THREADS", 0);
    NativeEngineConfig {
        n_ctx: n_ctx.max(128), // floor: 128 tokens
        n_threads,
    }
}

fn load_log_config() -> LogConfig {
    let level = std::env::var("MODELGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let format = match std::env::var("MODELGATE_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    let output_path = std::env::var("MODELGATE_LOG_FILE").ok().map(PathBuf::from);
    LogConfig {
        level,
        format,
        output_path,
    }
}

/// Load all configuration from environment variables.
pub fn load() -> EnvConfig {
    let host = std::env::var("MODELGATE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = parse_u16("MODELGATE_PORT", 8090);
    let catalog_path = std::env::var("MODELGATE_CATALOG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("models.toml"));
    let engine = std::env::var("MODELGATE_ENGINE")
        .map(|v| EnginePreference::parse_lossy(&v))
        .unwrap_or_default();

    let acquire_secs = parse_u64("MODELGATE_ACQUIRE_TIMEOUT", 120).max(1);
    let health_secs = parse_u64("MODELGATE_HEALTH_INTERVAL", 30).max(1);
    let shutdown_secs = parse_u64("MODELGATE_SHUTDOWN_TIMEOUT", 30).max(1);

    EnvConfig {
        host,
        port,
        catalog_path,
        engine,
        ledger: load_ledger_config(),
        acquire_timeout: Duration::from_secs(acquire_secs),
        health_interval: Duration::from_secs(health_secs),
        shutdown_timeout: Duration::from_secs(shutdown_secs),
        native: load_native_config(),
        log: load_log_config(),
    }
}

impl EnvConfig {
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            host: self.host.clone(),
            port: self.port,
            catalog_path: self.catalog_path.display().to_string(),
            engine: self.engine,
            max_resident_bytes: self.ledger.max_resident_bytes,
            max_resident_models: self.ledger.max_resident_models,
            acquire_timeout_secs: self.acquire_timeout.as_secs(),
            health_interval_secs: self.health_interval.as_secs(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            n_ctx: self.native.n_ctx,
            n_threads: self.native.n_threads,
        }
    }
}
