//! Request dispatch
//!
//! Every entry point resolves the target instance from the request's
//! `model` field, marks it busy for the duration of the call and turns
//! failures into error envelopes. Streaming entry points write into a
//! caller-supplied sink.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::instance::{BackendInstance, BusyGuard};
use super::Router;
use crate::backend::{BackendError, InferenceBackend, StreamEndpoint};
use crate::error::RouterError;
use crate::proxy::{sse_event, ProxyError, StreamSummary, StreamingProxy};

/// Non-streaming operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ChatCompletion,
    Completion,
    Responses,
    Embeddings,
    Reranking,
    AudioTranscription,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::ChatCompletion => "chat completions",
            Operation::Completion => "completions",
            Operation::Responses => "responses",
            Operation::Embeddings => "embeddings",
            Operation::Reranking => "reranking",
            Operation::AudioTranscription => "audio transcriptions",
        }
    }
}

async fn invoke(
    backend: &dyn InferenceBackend,
    operation: Operation,
    request: Value,
) -> Result<Value, BackendError> {
    let unsupported = || BackendError::unsupported(backend.name(), operation.as_str());
    match operation {
        Operation::ChatCompletion => backend.chat_completion(request).await,
        Operation::Completion => backend.completion(request).await,
        Operation::Responses => backend.responses(request).await,
        Operation::Embeddings => match backend.as_embeddings() {
            Some(capability) => capability.embeddings(request).await,
            None => Err(unsupported()),
        },
        Operation::Reranking => match backend.as_reranking() {
            Some(capability) => capability.reranking(request).await,
            None => Err(unsupported()),
        },
        Operation::AudioTranscription => match backend.as_audio() {
            Some(capability) => capability.transcriptions(request).await,
            None => Err(unsupported()),
        },
    }
}

/// Transport-level failures that may mean the engine died
fn is_transport_failure(err: &BackendError) -> bool {
    matches!(err, BackendError::Network(_) | BackendError::NotReady)
}

impl Router {
    pub async fn chat_completion(&self, request: Value) -> Value {
        self.dispatch(Operation::ChatCompletion, request).await
    }

    pub async fn completion(&self, request: Value) -> Value {
        self.dispatch(Operation::Completion, request).await
    }

    pub async fn responses(&self, request: Value) -> Value {
        self.dispatch(Operation::Responses, request).await
    }

    pub async fn embeddings(&self, request: Value) -> Value {
        self.dispatch(Operation::Embeddings, request).await
    }

    pub async fn reranking(&self, request: Value) -> Value {
        self.dispatch(Operation::Reranking, request).await
    }

    /// Transcribe the audio file named by the request's `file_path`
    pub async fn audio_transcriptions(&self, request: Value) -> Value {
        self.dispatch(Operation::AudioTranscription, request).await
    }

    pub async fn chat_completion_stream<W>(
        &self,
        request: Value,
        sink: &mut W,
    ) -> Result<StreamSummary, RouterError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.stream(StreamEndpoint::ChatCompletions, request, sink).await
    }

    pub async fn completion_stream<W>(
        &self,
        request: Value,
        sink: &mut W,
    ) -> Result<StreamSummary, RouterError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.stream(StreamEndpoint::Completions, request, sink).await
    }

    pub async fn responses_stream<W>(
        &self,
        request: Value,
        sink: &mut W,
    ) -> Result<StreamSummary, RouterError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.stream(StreamEndpoint::Responses, request, sink).await
    }

    async fn dispatch(&self, operation: Operation, request: Value) -> Value {
        match self.try_dispatch(operation, request).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("{} request failed: {}", operation.as_str(), e);
                e.to_envelope()
            }
        }
    }

    async fn try_dispatch(&self, operation: Operation, request: Value) -> Result<Value, RouterError> {
        let guard = self.mark_busy(&request)?;

        match invoke(guard.backend(), operation, request).await {
            Ok(response) => {
                if let Some(telemetry) = guard.backend().telemetry_fields().extract(&response) {
                    guard.instance().record_telemetry(telemetry);
                }
                Ok(response)
            }
            Err(e) => {
                self.reap_if_crashed(guard, &e).await;
                Err(e.into())
            }
        }
    }

    async fn stream<W>(
        &self,
        endpoint: StreamEndpoint,
        request: Value,
        sink: &mut W,
    ) -> Result<StreamSummary, RouterError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let guard = match self.mark_busy(&request) {
            Ok(guard) => guard,
            Err(e) => return Err(write_stream_error(e, sink).await),
        };

        let started = Instant::now();
        let upstream = match guard.backend().open_stream(endpoint, request).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.reap_if_crashed(guard, &e).await;
                return Err(write_stream_error(e.into(), sink).await);
            }
        };

        let proxy = StreamingProxy::new(guard.backend().telemetry_fields(), started);
        match proxy.relay(upstream, sink).await {
            Ok(summary) => {
                log::debug!(
                    "Streamed {} payloads ({} bytes) from {}",
                    summary.payloads,
                    summary.bytes,
                    guard.instance().name
                );
                if !summary.telemetry.is_empty() {
                    guard.instance().record_telemetry(summary.telemetry.clone());
                }
                Ok(summary)
            }
            Err(ProxyError::ClientDisconnected(e)) => {
                log::info!(
                    "Client disconnected from {} stream: {}",
                    guard.instance().name,
                    e
                );
                Err(RouterError::ClientDisconnected)
            }
            Err(ProxyError::Network(message)) => {
                let err = BackendError::Network(message);
                self.reap_if_crashed(guard, &err).await;
                Err(write_stream_error(err.into(), sink).await)
            }
        }
    }

    /// Look up the request's model and mark it busy under the state lock
    fn mark_busy(&self, request: &Value) -> Result<BusyGuard, RouterError> {
        let model = request
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| {
                RouterError::InvalidRequest("request is missing the 'model' field".to_string())
            })?;

        let state = self.state.lock();
        let instance = state
            .instances
            .iter()
            .find(|i| i.name == model)
            .ok_or_else(|| RouterError::ModelNotLoaded(model.to_string()))?;
        instance.touch();
        Ok(BusyGuard::new(instance.clone()))
    }

    /// After a transport failure, drop the instance if its process is gone
    async fn reap_if_crashed(&self, guard: BusyGuard, err: &BackendError) {
        let instance: Arc<BackendInstance> = guard.instance().clone();
        drop(guard);

        if !is_transport_failure(err) || instance.backend.is_alive() {
            return;
        }
        log::warn!(
            "{} for {} is no longer running, removing it",
            instance.backend.name(),
            instance.name
        );
        if self.detach(&instance) {
            self.retire(instance, "backend crashed").await;
        }
    }
}

/// Report a failure that happened before any upstream bytes reached the
/// sink as one SSE error event
async fn write_stream_error<W>(err: RouterError, sink: &mut W) -> RouterError
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    log::warn!("Stream request failed: {}", err);
    let event = sse_event(&err.to_envelope());
    if let Err(e) = sink.write_all(&event).await {
        log::debug!("Could not deliver stream error: {}", e);
    } else if let Err(e) = sink.flush().await {
        log::debug!("Could not flush stream error: {}", e);
    }
    err
}
