//! OGA runtime backend
//!
//! Serves ONNX models compiled for the NPU, hybrid NPU+GPU, integrated GPU
//! or CPU through `oga-server`. Compiled models carry a `.runtime_version`
//! stamp; a stamp that disagrees with the installed runtime means the model
//! has to be rebuilt, which only happens when the load allows upgrades.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    locate_binary, require_model_path, rewrite_model, BackendCapabilities, BackendError,
    HttpForwarder, InferenceBackend, LoadContext,
};
use crate::constants::{binaries, hosts};
use crate::process::ProcessCommand;
use crate::server::BackendServer;
use crate::telemetry::TelemetryFields;
use crate::types::{Engine, LoadRequest, Recipe, UpgradePolicy};

/// File inside a compiled model directory naming the runtime that built it
pub const RUNTIME_STAMP: &str = ".runtime_version";

const TELEMETRY: TelemetryFields = TelemetryFields {
    input_tokens: "/usage/prompt_tokens",
    output_tokens: "/usage/completion_tokens",
    time_to_first_token: "/usage/time_to_first_token",
    tokens_per_second: "/usage/tokens_per_second",
    ttft_scale: 1.0,
};

/// OGA backend for one of the `oga-*` recipes
pub struct OgaBackend {
    recipe: Recipe,
    server: BackendServer,
    checkpoint: String,
}

impl OgaBackend {
    pub fn new(recipe: Recipe) -> Result<Self, BackendError> {
        if recipe.engine() != Engine::Oga {
            return Err(BackendError::Config(format!(
                "recipe {} is not served by oga",
                recipe
            )));
        }
        Ok(Self {
            recipe,
            server: BackendServer::new(binaries::OGA_SERVER),
            checkpoint: String::new(),
        })
    }

    pub fn static_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            chat: true,
            streaming: true,
            ..Default::default()
        }
    }

    /// Execution mode passed to `oga-server --mode`
    fn mode(&self) -> &'static str {
        match self.recipe {
            Recipe::OgaNpu => "npu",
            Recipe::OgaHybrid => "hybrid",
            Recipe::OgaIgpu => "igpu",
            _ => "cpu",
        }
    }
}

/// Compare the model's runtime stamp against the installed runtime.
///
/// A stale stamp is removed under [`UpgradePolicy::Upgrade`] so the server
/// recompiles the model, and rejected as invalidated otherwise. Models
/// without a stamp, or routers without a known runtime version, pass.
pub async fn check_runtime_stamp(
    model_dir: &Path,
    installed: Option<&str>,
    policy: UpgradePolicy,
) -> Result<(), BackendError> {
    let Some(installed) = installed else {
        return Ok(());
    };
    let stamp_path = model_dir.join(RUNTIME_STAMP);
    let stamp = match tokio::fs::read_to_string(&stamp_path).await {
        Ok(stamp) => stamp,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(BackendError::Config(format!(
                "failed to read {}: {}",
                stamp_path.display(),
                e
            )))
        }
    };

    let built_with = stamp.trim();
    if built_with == installed {
        return Ok(());
    }

    match policy {
        UpgradePolicy::Upgrade => {
            log::info!(
                "{} was built with runtime {} (installed {}), rebuilding",
                model_dir.display(),
                built_with,
                installed
            );
            tokio::fs::remove_file(&stamp_path).await.map_err(|e| {
                BackendError::Config(format!(
                    "failed to remove {}: {}",
                    stamp_path.display(),
                    e
                ))
            })
        }
        UpgradePolicy::DoNotUpgrade => Err(BackendError::ModelInvalidated(format!(
            "{} was built with runtime {} but {} is installed",
            model_dir.display(),
            built_with,
            installed
        ))),
    }
}

async fn write_runtime_stamp(model_dir: &Path, installed: &str) {
    let stamp_path = model_dir.join(RUNTIME_STAMP);
    if let Err(e) = tokio::fs::write(&stamp_path, installed).await {
        log::warn!("Failed to write {}: {}", stamp_path.display(), e);
    }
}

#[async_trait]
impl InferenceBackend for OgaBackend {
    fn name(&self) -> &'static str {
        "oga"
    }

    fn recipe(&self) -> Recipe {
        self.recipe
    }

    async fn load(
        &mut self,
        request: &LoadRequest,
        context: &LoadContext,
    ) -> Result<(), BackendError> {
        let model_dir = &request.descriptor.resolved_path;
        require_model_path(model_dir)?;
        let installed = context.config.oga_runtime_version.as_deref();
        check_runtime_stamp(model_dir, installed, request.upgrade_policy).await?;
        let program = locate_binary(&context.config, Engine::Oga, binaries::OGA_SERVER)?;

        self.checkpoint = request.descriptor.checkpoint.clone();
        log::info!(
            "Loading {} with oga-server (mode={}, ctx={})",
            request.name,
            self.mode(),
            request.context_size
        );

        let mode = self.mode();
        let model = model_dir.to_string_lossy().to_string();
        let context_size = request.context_size.to_string();
        let extra = request.engine_args.clone();
        self.server
            .start_sidecar(context, "/health", |port| {
                ProcessCommand::new(program, binaries::OGA_SERVER)
                    .arg("-m")
                    .arg(model)
                    .arg("--host")
                    .arg(hosts::LOCAL)
                    .arg("--port")
                    .arg(port.to_string())
                    .arg("--mode")
                    .arg(mode)
                    .arg("--ctx-len")
                    .arg(context_size)
                    .args(extra)
            })
            .await?;

        if let Some(installed) = installed {
            write_runtime_stamp(model_dir, installed).await;
        }
        Ok(())
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
