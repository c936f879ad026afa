//! Model catalog: name → descriptor resolution.
//!
//! The catalog is the read-mostly map from a model name to where its
//! weights live, which engine should serve it, and what it is declared to
//! cost. Entries are immutable once registered; registration and removal
//! are administrative operations off the hot request path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::engine::EnginePreference;

/// Default context length when a catalog entry does not declare one.
const DEFAULT_CONTEXT_LENGTH: u32 = 4096;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("model already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid catalog entry {name}: {reason}")]
    InvalidEntry { name: String, reason: String },

    #[error("failed to read catalog file {path}: {reason}")]
    FileRead { path: PathBuf, reason: String },

    #[error("failed to parse catalog file {path}: {reason}")]
    FileParse { path: PathBuf, reason: String },
}

/// Immutable description of one servable model.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    /// Unique model name, the key callers use in requests.
    pub name: String,
    /// Filesystem path to the model weights.
    pub path: PathBuf,
    /// Preferred engine for this model.
    pub engine: EnginePreference,
    /// Declared memory cost, reserved in the ledger before loading.
    pub cost_bytes: u64,
    /// Maximum context length in tokens.
    pub context_length: u32,
}

/// On-disk shape of one `[[models]]` entry in the catalog file.
#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    path: PathBuf,
    #[serde(default)]
    engine: EnginePreference,
    /// Optional; falls back to the weight file's size on disk.
    cost_bytes: Option<u64>,
    context_length: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<CatalogEntry>,
}

/// Thread-safe catalog of registered models.
///
/// Lookups are lock-free once populated; registration never corrupts
/// concurrent readers.
#[derive(Debug)]
pub struct ModelCatalog {
    entries: DashMap<String, Arc<ModelDescriptor>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Load a catalog from a TOML file.
    ///
    /// Entries without a declared `cost_bytes` take the size of the weight
    /// file on disk; an entry whose weights cannot be found and declares no
    /// cost is rejected.
    pub fn load_file(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CatalogError::FileRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let parsed: CatalogFile = toml::from_str(&raw).map_err(|e| CatalogError::FileParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let catalog = Self::new();
        for entry in parsed.models {
            let descriptor = Self::descriptor_from_entry(entry)?;
            catalog.register(descriptor)?;
        }
        Ok(catalog)
    }

    fn descriptor_from_entry(entry: CatalogEntry) -> Result<ModelDescriptor, CatalogError> {
        if entry.name.is_empty() {
            return Err(CatalogError::InvalidEntry {
                name: "<unnamed>".to_string(),
                reason: "name cannot be empty".to_string(),
            });
        }

        let cost_bytes = match entry.cost_bytes {
            Some(bytes) if bytes > 0 => bytes,
            Some(_) => {
                return Err(CatalogError::InvalidEntry {
                    name: entry.name,
                    reason: "cost_bytes must be non-zero".to_string(),
                })
            }
            None => std::fs::metadata(&entry.path)
                .map(|m| m.len())
                .map_err(|e| CatalogError::InvalidEntry {
                    name: entry.name.clone(),
                    reason: format!(
                        "no cost_bytes declared and weights not readable at {}: {}",
                        entry.path.display(),
                        e
                    ),
                })?,
        };

        Ok(ModelDescriptor {
            name: entry.name,
            path: entry.path,
            engine: entry.engine,
            cost_bytes,
            context_length: entry.context_length.unwrap_or(DEFAULT_CONTEXT_LENGTH),
        })
    }

    /// Resolve a model name to its descriptor.
    pub fn resolve(&self, name: &str) -> Result<Arc<ModelDescriptor>, CatalogError> {
        self.entries
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| CatalogError::NotFound(name.to_string()))
    }

    /// Register a descriptor. Fails if the name is already taken.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<(), CatalogError> {
        let name = descriptor.name.clone();
        match self.entries.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CatalogError::AlreadyRegistered(name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(model = %name, cost_bytes = descriptor.cost_bytes, "registered model");
                slot.insert(Arc::new(descriptor));
                Ok(())
            }
        }
    }

    /// Remove a registration, returning the descriptor if it existed.
    pub fn remove(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.entries.remove(name).map(|(_, d)| d)
    }

    /// All registered descriptors, unordered.
    pub fn list(&self) -> Vec<Arc<ModelDescriptor>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}
