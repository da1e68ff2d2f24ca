//! llama.cpp backend implementation
//!
//! Runs `llama-server` as a sidecar for one GGUF model. The same binary
//! serves chat models, embedding models (`--embeddings`) and rerankers
//! (`--reranking`), so this is the only adapter with more than one optional
//! capability.

use async_trait::async_trait;
use serde_json::Value;

use super::{
    locate_binary, require_model_path, BackendCapabilities, BackendError, EmbeddingsCapability,
    HttpForwarder, InferenceBackend, LoadContext, RerankingCapability,
};
use crate::constants::{binaries, defaults, hosts};
use crate::process::ProcessCommand;
use crate::server::BackendServer;
use crate::telemetry::TelemetryFields;
use crate::types::{Engine, LoadRequest, ModelType, Recipe};

/// Flags owned by the adapter; user-supplied engine args may not repeat them
const RESERVED_FLAGS: &[&str] = &["-m", "--model", "--port", "--host", "-c", "--ctx-size"];

const TELEMETRY: TelemetryFields = TelemetryFields {
    input_tokens: "/timings/prompt_n",
    output_tokens: "/timings/predicted_n",
    time_to_first_token: "/timings/prompt_ms",
    tokens_per_second: "/timings/predicted_per_second",
    ttft_scale: 0.001,
};

/// llama.cpp backend using sidecar process management
pub struct LlamaCppBackend {
    server: BackendServer,
}

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self {
            server: BackendServer::new(binaries::LLAMA_SERVER),
        }
    }

    /// Get static capabilities (for registry info before instantiation)
    pub fn static_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            chat: true,
            embeddings: true,
            reranking: true,
            audio: false,
            streaming: true,
        }
    }


    /// Everything but the port, which is only known once allocated
    fn build_args(request: &LoadRequest) -> Result<Vec<String>, BackendError> {
        if let Some(flag) = request
            .engine_args
            .iter()
            .find(|arg| {
                let flag = arg.split_once('=').map_or(arg.as_str(), |(flag, _)| flag);
                RESERVED_FLAGS.contains(&flag)
            })
        {
            return Err(BackendError::Config(format!(
                "llama-server argument {} is managed by the router",
                flag
            )));
        }

        let cpu_only = request
            .engine_backend
            .as_deref()
            .is_some_and(|b| b.eq_ignore_ascii_case("cpu"));
        let gpu_layers = if cpu_only { 0 } else { defaults::GPU_LAYERS };

        let mut args = vec![
            "-m".to_string(),
            request.descriptor.resolved_path.to_string_lossy().to_string(),
            "--host".to_string(),
            hosts::LOCAL.to_string(),
            "-c".to_string(),
            request.context_size.to_string(),
            "-ngl".to_string(),
            gpu_layers.to_string(),
            "--alias".to_string(),
            request.name.clone(),
        ];

        match request.descriptor.effective_type() {
            ModelType::Embedding => args.push("--embeddings".to_string()),
            ModelType::Reranking => args.push("--reranking".to_string()),
            _ => args.push("--jinja".to_string()),
        }

        args.extend(request.engine_args.iter().cloned());
        Ok(args)
    }
}

impl Default for LlamaCppBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn recipe(&self) -> Recipe {
        Recipe::LlamaCpp
    }

    async fn load(
        &mut self,
        request: &LoadRequest,
        context: &LoadContext,
    ) -> Result<(), BackendError> {
        require_model_path(&request.descriptor.resolved_path)?;
        let program = locate_binary(&context.config, Engine::LlamaCpp, binaries::LLAMA_SERVER)?;

        log::info!(
            "Loading {} with llama-server (ctx={}, backend={})",
            request.name,
            request.context_size,
            request.engine_backend.as_deref().unwrap_or("default")
        );

        let args = Self::build_args(request)?;

        self.server
            .start_sidecar(context, "/health", |port| {
                ProcessCommand::new(program, binaries::LLAMA_SERVER)
                    .args(args)
                    .arg("--port")
                    .arg(port.to_string())
            })
            .await
    }

    async fn connect_external(
        &mut self,
        url: &str,
        context: &LoadContext,
    ) -> Result<(), BackendError> {
        log::info!("Attaching to llama-server at {}", url);
        self.server
            .connect_external(url, context.http.clone(), context.config.request_timeout())
            .await
    }

    fn unload(&self) {
        self.server.stop();
    }

    fn is_ready(&self) -> bool {
        self.server.is_ready()
    }

    fn is_alive(&self) -> bool {
        self.server.is_alive()
    }

    fn base_url(&self) -> Option<String> {
        self.server.base_url()
    }

    fn http(&self) -> Result<&HttpForwarder, BackendError> {
        self.server.http()
    }

    fn telemetry_fields(&self) -> TelemetryFields {
        TELEMETRY
    }

    fn as_embeddings(&self) -> Option<&dyn EmbeddingsCapability> {
        Some(self)
    }

    fn as_reranking(&self) -> Option<&dyn RerankingCapability> {
        Some(self)
    }
}

#[async_trait]
impl EmbeddingsCapability for LlamaCppBackend {
    async fn embeddings(&self, request: Value) -> Result<Value, BackendError> {
        self.server.http()?.post_json("/v1/embeddings", &request).await
    }
}

#[async_trait]
impl RerankingCapability for LlamaCppBackend {
    async fn reranking(&self, request: Value) -> Result<Value, BackendError> {
        self.server.http()?.post_json("/v1/rerank", &request).await
    }
}
