//! Configuration for the router and its engine adapters
//!
//! The configuration is stored as JSON. Missing fields take the defaults from
//! [`crate::constants`], and `ROUTER_*` environment variables override the
//! file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{defaults, ports, timeouts};
use crate::types::ModelType;

/// Error loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Maximum number of simultaneously loaded models, per model type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapacityLimits {
    pub llm: usize,
    pub embedding: usize,
    pub reranking: usize,
    pub audio: usize,
    pub image: usize,
}

impl CapacityLimits {
    /// Same limit for every type
    pub fn uniform(limit: usize) -> Self {
        Self {
            llm: limit,
            embedding: limit,
            reranking: limit,
            audio: limit,
            image: limit,
        }
    }

    pub fn get(&self, model_type: ModelType) -> usize {
        match model_type {
            ModelType::Llm => self.llm,
            ModelType::Embedding => self.embedding,
            ModelType::Reranking => self.reranking,
            ModelType::Audio => self.audio,
            ModelType::Image => self.image,
        }
    }

    pub fn set(&mut self, model_type: ModelType, limit: usize) {
        match model_type {
            ModelType::Llm => self.llm = limit,
            ModelType::Embedding => self.embedding = limit,
            ModelType::Reranking => self.reranking = limit,
            ModelType::Audio => self.audio = limit,
            ModelType::Image => self.image = limit,
        }
    }
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self::uniform(defaults::MAX_LOADED_PER_TYPE)
    }
}

/// Explicit executable paths, one per engine. Unset entries are looked up in
/// `binaries_dir` and then on `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineBinaries {
    pub llama_server: Option<PathBuf>,
    pub oga_server: Option<PathBuf>,
    pub flm: Option<PathBuf>,
    pub whisper_server: Option<PathBuf>,
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Per-type capacity limits
    pub max_loaded_models: CapacityLimits,
    /// First port handed out to backends
    pub port_base: u16,
    /// Number of ports scanned above `port_base`
    pub port_range: u16,
    /// Context size when neither descriptor nor overrides set one
    pub default_context_size: u32,
    /// Upper bound on backend readiness, in seconds
    pub load_timeout_secs: u64,
    /// Interval between readiness probes, in milliseconds
    pub probe_interval_ms: u64,
    /// Timeout for non-streaming requests, in seconds
    pub request_timeout_secs: u64,
    /// Directory holding per-engine install folders (`<dir>/<engine>/<exe>`)
    pub binaries_dir: Option<PathBuf>,
    /// Explicit executable paths
    pub binaries: EngineBinaries,
    /// Installed OGA runtime version, used to detect stale compiled models
    pub oga_runtime_version: Option<String>,
    /// Forward backend process output to the log at info level
    pub debug_backends: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_loaded_models: CapacityLimits::default(),
            port_base: ports::BACKEND_BASE,
            port_range: ports::BACKEND_RANGE,
            default_context_size: defaults::CONTEXT_SIZE,
            load_timeout_secs: timeouts::LOAD_READY_SECS,
            probe_interval_ms: timeouts::PROBE_INTERVAL_MS,
            request_timeout_secs: timeouts::REQUEST_SECS,
            binaries_dir: None,
            binaries: EngineBinaries::default(),
            oga_runtime_version: None,
            debug_backends: false,
        }
    }
}

impl RouterConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist, then apply environment overrides.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            serde_json::from_str(&content)?
        } else {
            log::debug!("No router config at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROUTER_*` overrides. The lookup is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(value) = lookup("ROUTER_MAX_LOADED_MODELS") {
            self.max_loaded_models =
                CapacityLimits::uniform(parse("ROUTER_MAX_LOADED_MODELS", value)?);
        }
        for model_type in ModelType::ALL {
            let key = format!("ROUTER_MAX_{}_MODELS", model_type.as_str().to_uppercase());
            if let Some(value) = lookup(&key) {
                let limit = parse(&key, value)?;
                self.max_loaded_models.set(model_type, limit);
            }
        }
        if let Some(value) = lookup("ROUTER_PORT_BASE") {
            self.port_base = parse("ROUTER_PORT_BASE", value)?;
        }
        if let Some(value) = lookup("ROUTER_CONTEXT_SIZE") {
            self.default_context_size = parse("ROUTER_CONTEXT_SIZE", value)?;
        }
        if let Some(value) = lookup("ROUTER_LOAD_TIMEOUT_SECS") {
            self.load_timeout_secs = parse("ROUTER_LOAD_TIMEOUT_SECS", value)?;
        }
        if let Some(value) = lookup("ROUTER_BINARIES_DIR") {
            self.binaries_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("ROUTER_DEBUG_BACKENDS") {
            self.debug_backends = matches!(value.trim(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for model_type in ModelType::ALL {
            if self.max_loaded_models.get(model_type) == 0 {
                return Err(ConfigError::Invalid(format!(
                    "capacity for {} models must be at least 1",
                    model_type
                )));
            }
        }
        if self.port_range == 0 {
            return Err(ConfigError::Invalid("port_range must be non-zero".to_string()));
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "probe_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
