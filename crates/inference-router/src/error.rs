//! Router error taxonomy and the OpenAI-style error envelope

use serde_json::{json, Map, Value};

use crate::backend::BackendError;
use crate::proxy::ProxyError;

/// Errors surfaced by the router
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Backend answered with a non-success status; the body is kept
    #[error("Backend returned HTTP {status}")]
    Backend { status: u16, body: Value },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend failed to start: {message}")]
    StartupFailed {
        message: String,
        exit_code: Option<i32>,
    },

    #[error("Model invalidated: {0}")]
    ModelInvalidated(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Client disconnected")]
    ClientDisconnected,
}

impl RouterError {
    /// HTTP status an outer server should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            RouterError::ModelNotLoaded(_) | RouterError::NotFound(_) => 404,
            RouterError::InvalidRequest(_) | RouterError::UnsupportedOperation(_) => 400,
            RouterError::Backend { status, .. } => *status,
            RouterError::ModelInvalidated(_) => 409,
            RouterError::ClientDisconnected => 499,
            RouterError::Network(_)
            | RouterError::StartupFailed { .. }
            | RouterError::Timeout(_)
            | RouterError::Config(_) => 500,
        }
    }

    /// Machine-readable error kind for the envelope
    pub fn error_type(&self) -> &'static str {
        match self {
            RouterError::ModelNotLoaded(_) => "model_not_loaded",
            RouterError::InvalidRequest(_) => "invalid_request_error",
            RouterError::UnsupportedOperation(_) => "unsupported_operation",
            RouterError::Backend { .. } => "backend_error",
            RouterError::Network(_) => "network_error",
            RouterError::StartupFailed { .. } => "backend_startup_failed",
            RouterError::ModelInvalidated(_) => "model_invalidated",
            RouterError::NotFound(_) => "not_found",
            RouterError::Timeout(_) => "timeout",
            RouterError::Config(_) => "configuration_error",
            RouterError::ClientDisconnected => "client_disconnected",
        }
    }

    /// `{"error": {"message", "type", "code", ...context}}`
    pub fn to_envelope(&self) -> Value {
        let mut error = Map::new();
        error.insert("message".to_string(), Value::String(self.message()));
        error.insert(
            "type".to_string(),
            Value::String(self.error_type().to_string()),
        );
        error.insert("code".to_string(), json!(self.status_code()));

        match self {
            RouterError::ModelNotLoaded(model) => {
                error.insert("model".to_string(), Value::String(model.clone()));
            }
            RouterError::Backend { body, .. } => {
                error.insert("backend_response".to_string(), body.clone());
            }
            RouterError::StartupFailed {
                exit_code: Some(code),
                ..
            } => {
                error.insert("exit_code".to_string(), json!(code));
            }
            _ => {}
        }

        json!({ "error": Value::Object(error) })
    }

    /// Human readable message. For backend errors the backend's own message
    /// is preferred when its body has one.
    fn message(&self) -> String {
        if let RouterError::Backend { status, body } = self {
            let inner = body
                .pointer("/error/message")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .or_else(|| body.as_str().filter(|s| !s.is_empty()));
            if let Some(inner) = inner {
                return format!("Backend returned HTTP {}: {}", status, inner);
            }
        }
        self.to_string()
    }
}

impl From<BackendError> for RouterError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotReady => RouterError::Network("backend not ready".to_string()),
            BackendError::NotFound(m) => RouterError::NotFound(m),
            BackendError::ModelInvalidated(m) => RouterError::ModelInvalidated(m),
            BackendError::StartupFailed { message, exit_code } => {
                RouterError::StartupFailed { message, exit_code }
            }
            BackendError::OutOfMemory { message, exit_code } => {
                RouterError::StartupFailed { message, exit_code }
            }
            BackendError::Timeout(m) => RouterError::Timeout(m),
            BackendError::Config(m) => RouterError::Config(m),
            BackendError::Unsupported(m) => RouterError::UnsupportedOperation(m),
            BackendError::InvalidRequest(m) => RouterError::InvalidRequest(m),
            BackendError::Status { status, body } => RouterError::Backend { status, body },
            BackendError::Network(m) => RouterError::Network(m),
        }
    }
}

impl From<ProxyError> for RouterError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Network(m) => RouterError::Network(m),
            ProxyError::ClientDisconnected(_) => RouterError::ClientDisconnected,
        }
    }
}
