//! Service configuration
//!
//! Defaults, overridden by an optional JSON file, overridden by environment
//! variables. Out-of-range values are clamped rather than rejected.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::cache::DEFAULT_CACHE_CAPACITY;
use crate::inference::engine::SamplingConfig;
use crate::inference::registry::EngineRegistry;
use crate::storage::get_data_dir;
use crate::storage::interaction_log::DEFAULT_LOG_PATH;

/// Path of an optional JSON config file
pub const CONFIG_ENV: &str = "MINIVAULT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Runtime configuration of the service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the HTTP server listens on
    pub bind_address: SocketAddr,
    /// Origins allowed to call the API from a browser
    pub allow_origins: Vec<String>,
    /// Model used when a request does not name one
    pub default_model: String,
    /// Maximum number of engines kept resident
    pub cache_capacity: usize,
    /// Sampling parameters applied to every generation
    pub sampling: SamplingConfig,
    /// Pause between streamed characters in milliseconds (0 = no pacing)
    pub stream_delay_ms: u64,
    /// Interaction log file
    pub log_path: PathBuf,
    /// Directory holding model weight files
    pub models_directory: PathBuf,
    /// Models constructed at startup
    pub preload: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let default_model = EngineRegistry::builtin()
            .default_model()
            .map(|m| m.name.clone())
            .unwrap_or_else(|| "distilgpt2".to_string());

        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8000)),
            allow_origins: vec!["http://localhost:3000".to_string()],
            preload: vec![default_model.clone()],
            default_model,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            sampling: SamplingConfig::default(),
            stream_delay_ms: 10,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
        }
    }
}

impl ServiceConfig {
    /// Validate configuration values against the registry
    ///
    /// Clamps numeric values and replaces unknown model names.
    pub fn validate(&mut self, registry: &EngineRegistry) {
        self.sampling.validate();

        if self.cache_capacity == 0 {
            self.cache_capacity = 1;
        }

        if !registry.is_supported(&self.default_model) {
            if let Some(fallback) = registry.default_model() {
                tracing::warn!(
                    "Default model '{}' is not supported, using '{}'",
                    self.default_model,
                    fallback.name
                );
                self.default_model = fallback.name.clone();
            }
        }

        self.preload.retain(|model| {
            let supported = registry.is_supported(model);
            if !supported {
                tracing::warn!("Ignoring unsupported preload model '{}'", model);
            }
            supported
        });

        self.allow_origins = self
            .allow_origins
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
    }

    /// Apply overrides from a variable lookup.
    ///
    /// Takes a lookup function so tests do not have to touch the process
    /// environment. Unparseable values are ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(origins) = lookup("ALLOW_ORIGINS") {
            self.allow_origins = origins.split(',').map(str::to_string).collect();
        }
        if let Some(bind) = lookup("MINIVAULT_BIND") {
            match bind.parse() {
                Ok(addr) => self.bind_address = addr,
                Err(e) => tracing::warn!("Ignoring MINIVAULT_BIND={}: {}", bind, e),
            }
        }
        if let Some(model) = lookup("MINIVAULT_DEFAULT_MODEL") {
            self.default_model = model;
        }
        if let Some(capacity) = lookup("MINIVAULT_CACHE_CAPACITY") {
            match capacity.parse() {
                Ok(n) => self.cache_capacity = n,
                Err(e) => tracing::warn!("Ignoring MINIVAULT_CACHE_CAPACITY={}: {}", capacity, e),
            }
        }
        if let Some(delay) = lookup("MINIVAULT_STREAM_DELAY_MS") {
            match delay.parse() {
                Ok(ms) => self.stream_delay_ms = ms,
                Err(e) => tracing::warn!("Ignoring MINIVAULT_STREAM_DELAY_MS={}: {}", delay, e),
            }
        }
        if let Some(path) = lookup("MINIVAULT_LOG_PATH") {
            self.log_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("MINIVAULT_MODELS_DIR") {
            self.models_directory = PathBuf::from(path);
        }
    }
}

/// Load configuration from disk and the process environment
///
/// Falls back to defaults if the file is missing or corrupted.
pub fn load_config(registry: &EngineRegistry) -> ServiceConfig {
    let mut config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => match load_config_file(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config, using defaults: {}", e);
                ServiceConfig::default()
            }
        },
        None => ServiceConfig::default(),
    };

    config.apply_env(|key| std::env::var(key).ok());
    config.validate(registry);
    config
}

/// Read a JSON config file. A missing file yields the defaults.
pub fn load_config_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
    if !path.exists() {
        tracing::info!("Config file {} not found, using defaults", path.display());
        return Ok(ServiceConfig::default());
    }

    let json = fs::read_to_string(path)?;
    let config: ServiceConfig = serde_json::from_str(&json)?;

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}
