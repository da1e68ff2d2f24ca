//! Local multiplexer for inference engines
//!
//! The router loads models into sidecar engine servers and routes
//! OpenAI-compatible requests to them:
//! - **llama.cpp**: GGUF chat, embedding and reranking models
//! - **OGA**: ONNX models on NPU, hybrid NPU+GPU, iGPU or CPU
//! - **FLM**: third-party NPU runtime
//! - **whisper.cpp**: speech to text
//!
//! # Example
//!
//! ```rust,ignore
//! use inference_router::{ModelOverrides, Router, RouterConfig, UpgradePolicy};
//!
//! let config = RouterConfig::load(Path::new("router.json")).await?;
//! let router = Router::with_config(config)?;
//!
//! router
//!     .load_model("Qwen3-0.6B-GGUF", &descriptor, UpgradePolicy::Upgrade, &ModelOverrides::default())
//!     .await?;
//! let reply = router
//!     .chat_completion(json!({"model": "Qwen3-0.6B-GGUF", "messages": [...]}))
//!     .await;
//! ```

pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod types;

// Re-exports for convenience
pub use backend::{
    BackendCapabilities, BackendError, BackendFactory, BackendInfo, BackendRegistry,
    InferenceBackend, StreamEndpoint,
};

#[cfg(feature = "backend-llamacpp")]
pub use backend::LlamaCppBackend;

#[cfg(feature = "backend-oga")]
pub use backend::OgaBackend;

#[cfg(feature = "backend-flm")]
pub use backend::FlmBackend;

#[cfg(feature = "backend-whisper")]
pub use backend::WhisperBackend;

pub use config::{CapacityLimits, ConfigError, RouterConfig};
pub use error::RouterError;
pub use ports::PortAllocator;
pub use process::{ProcessCommand, ProcessError, ProcessHandle, ProcessSpawner};
pub use proxy::{ProxyError, StreamSummary, StreamingProxy};
pub use router::{LoadedModel, Router};
pub use server::BackendServer;
pub use telemetry::Telemetry;
pub use types::{
    DeviceMask, Engine, LoadRequest, ModelDescriptor, ModelOverrides, ModelType, Recipe,
    UpgradePolicy,
};

#[cfg(feature = "std-process")]
pub use process::StdProcessSpawner;
