//! Backend registry for recipe-driven backend instantiation
//!
//! The registry maps each engine to a factory. Engines are registered at
//! compile time via feature flags; the router asks the registry for a fresh
//! adapter every time it loads a model.

use std::collections::HashMap;

use super::{locate_binary, BackendError, BackendInfo, InferenceBackend};
use crate::config::RouterConfig;
use crate::types::{Engine, Recipe};

#[cfg(feature = "backend-llamacpp")]
use super::LlamaCppBackend;

#[cfg(feature = "backend-oga")]
use super::OgaBackend;

#[cfg(feature = "backend-flm")]
use super::FlmBackend;

#[cfg(feature = "backend-whisper")]
use super::WhisperBackend;

#[cfg(any(
    feature = "backend-llamacpp",
    feature = "backend-oga",
    feature = "backend-flm",
    feature = "backend-whisper"
))]
use crate::constants::binaries;

/// Factory trait for creating backend instances
pub trait BackendFactory: Send + Sync {
    /// Create a new, unloaded backend for `recipe`
    fn create(&self, recipe: Recipe) -> Result<Box<dyn InferenceBackend>, BackendError>;

    /// Get information about this backend
    fn info(&self, config: &RouterConfig) -> BackendInfo;
}

/// Availability as reported in [`BackendInfo`]
fn availability(
    config: &RouterConfig,
    engine: Engine,
    executable: &str,
) -> (bool, Option<String>) {
    match locate_binary(config, engine, executable) {
        Ok(_) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    }
}

/// Factory for llama.cpp backend
#[cfg(feature = "backend-llamacpp")]
pub struct LlamaCppFactory;

#[cfg(feature = "backend-llamacpp")]
impl BackendFactory for LlamaCppFactory {
    fn create(&self, _recipe: Recipe) -> Result<Box<dyn InferenceBackend>, BackendError> {
        Ok(Box::new(LlamaCppBackend::new()))
    }

    fn info(&self, config: &RouterConfig) -> BackendInfo {
        let (available, unavailable_reason) =
            availability(config, Engine::LlamaCpp, binaries::LLAMA_SERVER);
        BackendInfo {
            name: Engine::LlamaCpp.as_str().to_string(),
            description: "llama-server with GGUF models".to_string(),
            capabilities: LlamaCppBackend::static_capabilities(),
            available,
            unavailable_reason,
        }
    }
}

/// Factory for the OGA runtime, shared by all `oga-*` recipes
#[cfg(feature = "backend-oga")]
pub struct OgaFactory;

#[cfg(feature = "backend-oga")]
impl BackendFactory for OgaFactory {
    fn create(&self, recipe: Recipe) -> Result<Box<dyn InferenceBackend>, BackendError> {
        Ok(Box::new(OgaBackend::new(recipe)?))
    }

    fn info(&self, config: &RouterConfig) -> BackendInfo {
        let (available, unavailable_reason) =
            availability(config, Engine::Oga, binaries::OGA_SERVER);
        BackendInfo {
            name: Engine::Oga.as_str().to_string(),
            description: "OGA runtime on NPU, hybrid, iGPU or CPU".to_string(),
            capabilities: OgaBackend::static_capabilities(),
            available,
            unavailable_reason,
        }
    }
}

/// Factory for FLM backend
#[cfg(feature = "backend-flm")]
pub struct FlmFactory;

#[cfg(feature = "backend-flm")]
impl BackendFactory for FlmFactory {
    fn create(&self, _recipe: Recipe) -> Result<Box<dyn InferenceBackend>, BackendError> {
        Ok(Box::new(FlmBackend::new()))
    }

    fn info(&self, config: &RouterConfig) -> BackendInfo {
        let (available, unavailable_reason) = availability(config, Engine::Flm, binaries::FLM);
        BackendInfo {
            name: Engine::Flm.as_str().to_string(),
            description: "FLM NPU runtime".to_string(),
            capabilities: FlmBackend::static_capabilities(),
            available,
            unavailable_reason,
        }
    }
}

/// Factory for whisper.cpp backend
#[cfg(feature = "backend-whisper")]
pub struct WhisperFactory;

#[cfg(feature = "backend-whisper")]
impl BackendFactory for WhisperFactory {
    fn create(&self, _recipe: Recipe) -> Result<Box<dyn InferenceBackend>, BackendError> {
        Ok(Box::new(WhisperBackend::new()))
    }

    fn info(&self, config: &RouterConfig) -> BackendInfo {
        let (available, unavailable_reason) =
            availability(config, Engine::Whisper, binaries::WHISPER_SERVER);
        BackendInfo {
            name: Engine::Whisper.as_str().to_string(),
            description: "whisper-server speech to text".to_string(),
            capabilities: WhisperBackend::static_capabilities(),
            available,
            unavailable_reason,
        }
    }
}

/// Registry of inference engines
///
/// Engines are registered at compile time based on feature flags. Hosts and
/// tests can register their own factories on top.
pub struct BackendRegistry {
    factories: HashMap<Engine, Box<dyn BackendFactory>>,
}

impl BackendRegistry {
    /// Create a new registry with all compiled-in engines registered
    pub fn new() -> Self {
        let mut registry = Self::empty();

        #[cfg(feature = "backend-llamacpp")]
        registry.register(Engine::LlamaCpp, Box::new(LlamaCppFactory));

        #[cfg(feature = "backend-oga")]
        registry.register(Engine::Oga, Box::new(OgaFactory));

        #[cfg(feature = "backend-flm")]
        registry.register(Engine::Flm, Box::new(FlmFactory));

        #[cfg(feature = "backend-whisper")]
        registry.register(Engine::Whisper, Box::new(WhisperFactory));

        registry
    }

    /// Registry without any engines
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the factory for an engine
    pub fn register(&mut self, engine: Engine, factory: Box<dyn BackendFactory>) {
        self.factories.insert(engine, factory);
    }

    /// Whether some factory serves `recipe`
    pub fn supports(&self, recipe: Recipe) -> bool {
        self.factories.contains_key(&recipe.engine())
    }

    /// Get information about all registered engines, sorted by name
    pub fn list(&self, config: &RouterConfig) -> Vec<BackendInfo> {
        let mut infos: Vec<BackendInfo> = self.factories.values().map(|f| f.info(config)).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Create an unloaded backend for `recipe`
    pub fn create(&self, recipe: Recipe) -> Result<Box<dyn InferenceBackend>, BackendError> {
        self.factories
            .get(&recipe.engine())
            .ok_or_else(|| {
                BackendError::Config(format!(
                    "no backend compiled in for recipe {} (engine {})",
                    recipe,
                    recipe.engine()
                ))
            })?
            .create(recipe)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
