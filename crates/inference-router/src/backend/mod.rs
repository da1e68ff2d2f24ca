//! Pluggable inference engine abstraction
//!
//! Every engine runs as a sidecar server on a loopback port. All adapters
//! implement [`InferenceBackend`]; engines that can do more than text
//! generation also expose one of the capability traits
//! ([`EmbeddingsCapability`], [`RerankingCapability`], [`AudioCapability`]),
//! which the router queries at dispatch time.

pub mod http;
pub mod registry;

#[cfg(feature = "backend-llamacpp")]
pub mod llamacpp;

#[cfg(feature = "backend-oga")]
pub mod oga;

#[cfg(feature = "backend-flm")]
pub mod flm;

#[cfg(feature = "backend-whisper")]
pub mod whisper;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RouterConfig;
use crate::ports::PortAllocator;
use crate::process::ProcessSpawner;
use crate::telemetry::TelemetryFields;
use crate::types::{Engine, LoadRequest, Recipe};

pub use http::HttpForwarder;
pub use registry::{BackendFactory, BackendRegistry};

#[cfg(feature = "backend-llamacpp")]
pub use llamacpp::LlamaCppBackend;

#[cfg(feature = "backend-oga")]
pub use oga::OgaBackend;

#[cfg(feature = "backend-flm")]
pub use flm::FlmBackend;

#[cfg(feature = "backend-whisper")]
pub use whisper::WhisperBackend;

/// Error types for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend not ready")]
    NotReady,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Model invalidated: {0}")]
    ModelInvalidated(String),

    #[error("Startup failed: {message}")]
    StartupFailed {
        message: String,
        exit_code: Option<i32>,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Out of memory: {message}")]
    OutOfMemory {
        message: String,
        exit_code: Option<i32>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The request itself is malformed for this engine
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend returned HTTP {status}")]
    Status { status: u16, body: Value },

    #[error("Network error: {0}")]
    Network(String),
}

/// How a failed load should be handled by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailureKind {
    /// Missing file or binary; propagate untouched
    NotFound,
    /// Cached artifact unusable; needs user action, never retried
    Invalidated,
    /// Anything else; worth one retry after freeing every device
    Recoverable,
}

impl BackendError {
    pub fn load_failure_kind(&self) -> LoadFailureKind {
        match self {
            BackendError::NotFound(_) => LoadFailureKind::NotFound,
            BackendError::ModelInvalidated(_) => LoadFailureKind::Invalidated,
            _ => LoadFailureKind::Recoverable,
        }
    }

    pub fn unsupported(engine: &str, operation: &str) -> Self {
        BackendError::Unsupported(format!("{} does not support {}", engine, operation))
    }
}

/// Capabilities that a backend may or may not support
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackendCapabilities {
    pub chat: bool,
    pub embeddings: bool,
    pub reranking: bool,
    pub audio: bool,
    pub streaming: bool,
}

/// Backend information for status listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Engine identifier (e.g. "llamacpp", "oga")
    pub name: String,
    pub description: String,
    pub capabilities: BackendCapabilities,
    /// Whether the engine executable can be found
    pub available: bool,
    pub unavailable_reason: Option<String>,
}

/// OpenAI-compatible endpoints that can stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndpoint {
    ChatCompletions,
    Completions,
    Responses,
}

impl StreamEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            StreamEndpoint::ChatCompletions => "/v1/chat/completions",
            StreamEndpoint::Completions => "/v1/completions",
            StreamEndpoint::Responses => "/v1/responses",
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            StreamEndpoint::ChatCompletions => "chat completions",
            StreamEndpoint::Completions => "completions",
            StreamEndpoint::Responses => "responses",
        }
    }
}

/// Raw upstream byte stream of a streaming response
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, BackendError>> + Send>>;

/// Shared resources handed to an adapter while it loads
#[derive(Clone)]
pub struct LoadContext {
    pub spawner: Arc<dyn ProcessSpawner>,
    pub ports: Arc<PortAllocator>,
    pub config: Arc<RouterConfig>,
    pub http: reqwest::Client,
}

/// The core trait every engine adapter implements.
///
/// The request forwarding methods have default implementations on top of
/// [`InferenceBackend::http`], so an HTTP-based adapter only supplies its
/// lifecycle and, where the engine needs it, a request rewrite.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    // ─── IDENTITY ───────────────────────────────────────────────────

    /// Engine name used in logs and errors
    fn name(&self) -> &'static str;

    /// Recipe this adapter was created for
    fn recipe(&self) -> Recipe;

    // ─── LIFECYCLE ──────────────────────────────────────────────────

    /// Start the engine for one model and wait until it answers.
    async fn load(&mut self, request: &LoadRequest, context: &LoadContext)
        -> Result<(), BackendError>;

    /// Attach to an engine someone else started at `url` instead of
    /// spawning one. Unloading an attached adapter leaves the engine running.
    async fn connect_external(
        &mut self,
        _url: &str,
        _context: &LoadContext,
    ) -> Result<(), BackendError> {
        Err(BackendError::unsupported(
            self.name(),
            "attaching to a running server",
        ))
    }

    /// Stop the engine and release its port
    fn unload(&self);

    /// Loaded and answering requests
    fn is_ready(&self) -> bool;

    /// Engine process still running (always true for attached servers)
    fn is_alive(&self) -> bool;

    /// Loopback URL of the engine, once started
    fn base_url(&self) -> Option<String>;

    // ─── FORWARDING ─────────────────────────────────────────────────

    /// HTTP client bound to the running engine
    fn http(&self) -> Result<&HttpForwarder, BackendError>;

    /// Engine-specific request rewriting applied before forwarding
    fn prepare_request(&self, _request: &mut Value) {}

    /// Where the engine reports usage and timings
    fn telemetry_fields(&self) -> TelemetryFields {
        TelemetryFields::OPENAI
    }

    async fn chat_completion(&self, mut request: Value) -> Result<Value, BackendError> {
        self.prepare_request(&mut request);
        self.http()?.post_json("/v1/chat/completions", &request).await
    }

    async fn completion(&self, mut request: Value) -> Result<Value, BackendError> {
        self.prepare_request(&mut request);
        self.http()?.post_json("/v1/completions", &request).await
    }

    async fn responses(&self, mut request: Value) -> Result<Value, BackendError> {
        self.prepare_request(&mut request);
        self.http()?.post_json("/v1/responses", &request).await
    }

    /// Open a streaming request; `stream: true` is forced on the body
    async fn open_stream(
        &self,
        endpoint: StreamEndpoint,
        mut request: Value,
    ) -> Result<ByteStream, BackendError> {
        self.prepare_request(&mut request);
        if let Some(obj) = request.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }
        self.http()?.post_stream(endpoint.path(), &request).await
    }

    // ─── OPTIONAL CAPABILITIES ──────────────────────────────────────

    fn as_embeddings(&self) -> Option<&dyn EmbeddingsCapability> {
        None
    }

    fn as_reranking(&self) -> Option<&dyn RerankingCapability> {
        None
    }

    fn as_audio(&self) -> Option<&dyn AudioCapability> {
        None
    }
}

/// Engines that can produce embeddings
#[async_trait]
pub trait EmbeddingsCapability: Send + Sync {
    async fn embeddings(&self, request: Value) -> Result<Value, BackendError>;
}

/// Engines that can rerank documents against a query
#[async_trait]
pub trait RerankingCapability: Send + Sync {
    async fn reranking(&self, request: Value) -> Result<Value, BackendError>;
}

/// Engines that can transcribe audio
#[async_trait]
pub trait AudioCapability: Send + Sync {
    async fn transcriptions(&self, request: Value) -> Result<Value, BackendError>;
}

/// Replace the `model` field with the engine's own checkpoint identifier
pub(crate) fn rewrite_model(request: &mut Value, checkpoint: &str) {
    if let Some(obj) = request.as_object_mut() {
        obj.insert("model".to_string(), Value::String(checkpoint.to_string()));
    }
}

/// Fail early when the resolved model path does not exist
pub(crate) fn require_model_path(path: &Path) -> Result<(), BackendError> {
    if path.exists() {
        Ok(())
    } else {
        Err(BackendError::NotFound(format!(
            "model file not found: {}",
            path.display()
        )))
    }
}

/// Locate an engine executable.
///
/// Lookup order: explicit path from the config, `<binaries_dir>/<engine>/<exe>`,
/// then `PATH`.
pub fn locate_binary(
    config: &RouterConfig,
    engine: Engine,
    executable: &str,
) -> Result<PathBuf, BackendError> {
    let explicit = match engine {
        Engine::LlamaCpp => config.binaries.llama_server.as_ref(),
        Engine::Oga => config.binaries.oga_server.as_ref(),
        Engine::Flm => config.binaries.flm.as_ref(),
        Engine::Whisper => config.binaries.whisper_server.as_ref(),
    };
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.clone())
        } else {
            Err(BackendError::NotFound(format!(
                "{} executable not found: {}",
                engine,
                path.display()
            )))
        };
    }

    if let Some(dir) = &config.binaries_dir {
        let file_name = if cfg!(windows) {
            format!("{}.exe", executable)
        } else {
            executable.to_string()
        };
        let candidate = dir.join(engine.as_str()).join(file_name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    which::which(executable).map_err(|_| {
        BackendError::NotFound(format!(
            "{} executable '{}' not found in binaries dir or PATH",
            engine, executable
        ))
    })
}
