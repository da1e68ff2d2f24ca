//! FLM backend
//!
//! FLM is a third-party NPU runtime that manages its own model cache, so it
//! is started with the checkpoint tag rather than a file path. It has no
//! health endpoint; readiness is a successful `/v1/models`.

use async_trait::async_trait;
use serde_json::Value;

use super::{
    locate_binary, rewrite_model, BackendCapabilities, BackendError, HttpForwarder,
    InferenceBackend, LoadContext,
};
use crate::constants::binaries;
use crate::process::ProcessCommand;
use crate::server::BackendServer;
use crate::telemetry::TelemetryFields;
use crate::types::{Engine, LoadRequest, Recipe};

const TELEMETRY: TelemetryFields = TelemetryFields {
    input_tokens: "/usage/prompt_tokens",
    output_tokens: "/usage/completion_tokens",
    time_to_first_token: "/usage/prefill_duration_ttft",
    tokens_per_second: "/usage/decoding_speed_tps",
    ttft_scale: 1.0,
};

pub struct FlmBackend {
    server: BackendServer,
    checkpoint: String,
}

impl FlmBackend {
    pub fn new() -> Self {
        Self {
            server: BackendServer::new(binaries::FLM),
            checkpoint: String::new(),
        }
    }

    pub fn static_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            chat: true,
            streaming: true,
            ..Default::default()
        }
    }
}

impl Default for FlmBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for FlmBackend {
    fn name(&self) -> &'static str {
        "flm"
    }

    fn recipe(&self) -> Recipe {
        Recipe::Flm
    }

    async fn load(
        &mut self,
        request: &LoadRequest,
        context: &LoadContext,
    ) -> Result<(), BackendError> {
        let program = locate_binary(&context.config, Engine::Flm, binaries::FLM)?;
        let checkpoint = request.descriptor.checkpoint.clone();
        if checkpoint.is_empty() {
            return Err(BackendError::NotFound(format!(
                "{} has no flm checkpoint",
                request.name
            )));
        }

        log::info!("Loading {} with flm ({})", request.name, checkpoint);
        self.checkpoint = checkpoint.clone();

        let context_size = request.context_size.to_string();
        let extra = request.engine_args.clone();
        self.server
            .start_sidecar(context, "/v1/models", |port| {
                ProcessCommand::new(program, binaries::FLM)
                    .arg("serve")
                    .arg(checkpoint)
                    .arg("--port")
                    .arg(port.to_string())
                    .arg("--ctx-len")
                    .arg(context_size)
                    .args(extra)
            })
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

    fn prepare_request(&self, request: &mut Value) {
        rewrite_model(request, &self.checkpoint);
    }

    fn telemetry_fields(&self) -> TelemetryFields {
        TELEMETRY
    }
}
