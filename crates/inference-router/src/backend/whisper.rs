//! whisper.cpp backend
//!
//! Speech to text only. `whisper-server` takes the audio as a multipart
//! upload on `/inference`; text generation endpoints are rejected with
//! [`BackendError::Unsupported`].

use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use super::{
    locate_binary, require_model_path, AudioCapability, BackendCapabilities, BackendError,
    ByteStream, HttpForwarder, InferenceBackend, LoadContext, StreamEndpoint,
};
use crate::constants::{binaries, hosts};
use crate::process::ProcessCommand;
use crate::server::BackendServer;
use crate::types::{Engine, LoadRequest, Recipe};

pub struct WhisperBackend {
    server: BackendServer,
}

impl WhisperBackend {
    pub fn new() -> Self {
        Self {
            server: BackendServer::new(binaries::WHISPER_SERVER),
        }
    }

    pub fn static_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            audio: true,
            ..Default::default()
        }
    }

    fn unsupported(&self, operation: &str) -> BackendError {
        BackendError::unsupported(self.name(), operation)
    }
}

impl Default for WhisperBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the whisper-server upload from a transcription request.
///
/// The request names a local file in `file_path`; `language` and
/// `response_format` are passed through when present.
async fn transcription_form(request: &Value) -> Result<Form, BackendError> {
    let file_path = request
        .get("file_path")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::InvalidRequest("missing 'file_path'".to_string()))?;
    let path = Path::new(file_path);
    let audio = tokio::fs::read(path).await.map_err(|e| {
        BackendError::InvalidRequest(format!("cannot read audio file {}: {}", file_path, e))
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "audio.wav".to_string());

    let response_format = request
        .get("response_format")
        .and_then(Value::as_str)
        .unwrap_or("json")
        .to_string();

    let mut form = Form::new()
        .part("file", Part::bytes(audio).file_name(file_name))
        .text("response_format", response_format);
    if let Some(language) = request.get("language").and_then(Value::as_str) {
        form = form.text("language", language.to_string());
    }
    if let Some(temperature) = request.get("temperature").and_then(Value::as_f64) {
        form = form.text("temperature", temperature.to_string());
    }
    Ok(form)
}

#[async_trait]
impl InferenceBackend for WhisperBackend {
    fn name(&self) -> &'static str {
        "whisper.cpp"
    }

    fn recipe(&self) -> Recipe {
        Recipe::WhisperCpp
    }

    async fn load(
        &mut self,
        request: &LoadRequest,
        context: &LoadContext,
    ) -> Result<(), BackendError> {
        require_model_path(&request.descriptor.resolved_path)?;
        let program = locate_binary(&context.config, Engine::Whisper, binaries::WHISPER_SERVER)?;

        log::info!("Loading {} with whisper-server", request.name);

        let model = request.descriptor.resolved_path.to_string_lossy().to_string();
        let extra = request.engine_args.clone();
        // whisper-server serves its web page on `/` once the model is loaded
        self.server
            .start_sidecar(context, "/", |port| {
                ProcessCommand::new(program, binaries::WHISPER_SERVER)
                    .arg("-m")
                    .arg(model)
                    .arg("--host")
                    .arg(hosts::LOCAL)
                    .arg("--port")
                    .arg(port.to_string())
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

    async fn chat_completion(&self, _request: Value) -> Result<Value, BackendError> {
        Err(self.unsupported("chat completions"))
    }

    async fn completion(&self, _request: Value) -> Result<Value, BackendError> {
        Err(self.unsupported("completions"))
    }

    async fn responses(&self, _request: Value) -> Result<Value, BackendError> {
        Err(self.unsupported("responses"))
    }

    async fn open_stream(
        &self,
        endpoint: StreamEndpoint,
        _request: Value,
    ) -> Result<ByteStream, BackendError> {
        Err(self.unsupported(endpoint.operation()))
    }

    fn as_audio(&self) -> Option<&dyn AudioCapability> {
        Some(self)
    }
}

#[async_trait]
impl AudioCapability for WhisperBackend {
    async fn transcriptions(&self, request: Value) -> Result<Value, BackendError> {
        let http = self.server.http()?;
        let form = transcription_form(&request).await?;
        http.post_multipart("/inference", form).await
    }
}
