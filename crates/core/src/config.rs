//! # Hive Configuration
//!
//! Centralized configuration types for the store, the bus and the state
//! machines, plus the `.hive` runtime directory they live in.
//!
//! ## Example
//! ```rust,ignore
//! use hive_core::config::HiveConfig;
//!
//! let config = HiveConfig::load().await;
//! let hive = hive_core::Hive::open(config)?;
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Name of the config file inside the runtime directory
const CONFIG_FILE: &str = "config.json";

/// Get the runtime directory path (.hive)
pub fn get_runtime_path() -> PathBuf {
    if let Ok(path) = std::env::var("HIVE_RUNTIME_PATH") {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".hive")
}

/// Location of `config.json` in the runtime directory
pub fn config_path() -> PathBuf {
    get_runtime_path().join(CONFIG_FILE)
}

/// Storage engine selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SQLite file-based (persistent)
    #[default]
    Sqlite,
    /// In-process map (lost on restart)
    Memory,
}

/// Configuration for the durable store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend to open
    pub backend: BackendKind,
    /// SQLite database path (ignored by the memory backend)
    pub path: PathBuf,
    /// Period of the expired-entry sweeper, if any
    pub sweep_interval_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            path: get_runtime_path().join("hive.db"),
            sweep_interval_ms: None,
        }
    }
}

impl StoreConfig {
    /// Volatile store, mostly for tests and throwaway tools.
    pub fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            ..Self::default()
        }
    }

    /// SQLite store at a specific path.
    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self {
            backend: BackendKind::Sqlite,
            path: path.as_ref().to_path_buf(),
            sweep_interval_ms: None,
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms.map(Duration::from_millis)
    }
}

/// Configuration for the priority event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Drain tick period
    pub tick_interval_ms: u64,
    /// Maximum number of delivered messages kept for `get_history`
    pub max_history: usize,
    /// Timeout applied by `request` when the caller gives none
    pub default_request_timeout_ms: u64,
    /// Whether `publish` persists messages unless told otherwise
    pub persist_by_default: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            max_history: 1000,
            default_request_timeout_ms: 30_000,
            persist_by_default: true,
        }
    }
}

impl BusConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }
}

/// Defaults for state machines created through a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Ring-buffer size of the transition history
    pub max_history: usize,
    /// Write state through to the store after every change
    pub persist: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            persist: true,
        }
    }
}

/// Top-level configuration persisted at `.hive/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HiveConfig {
    pub store: StoreConfig,
    pub bus: BusConfig,
    pub machines: MachineConfig,
}

impl HiveConfig {
    /// Fully volatile configuration (memory store)
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig::memory(),
            ..Self::default()
        }
    }

    /// Load `config.json` from the runtime directory, falling back to defaults
    pub async fn load() -> Self {
        Self::load_from(config_path()).await
    }

    /// Load from an explicit path, falling back to defaults
    pub async fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Invalid config, using defaults: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to read config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Write the configuration to `path`, creating parent directories
    pub async fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config: {:?}", path))
    }

    /// Write the configuration to the runtime directory
    pub async fn save(&self) -> Result<PathBuf> {
        let path = config_path();
        self.save_to(&path).await?;
        Ok(path)
    }
}
