//! Loopback HTTP forwarding to a running engine

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;

use super::{BackendError, ByteStream};
use crate::constants::timeouts;

/// Posts request bodies to an engine's OpenAI-compatible endpoints
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpForwarder {
    pub fn new(client: reqwest::Client, base_url: &str, request_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST a JSON body and return the JSON response
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Self::read_json(response).await
    }

    /// POST a multipart form and return the JSON response
    pub async fn post_multipart(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
    ) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Self::read_json(response).await
    }

    /// POST a JSON body and hand back the raw response body as a byte
    /// stream. No timeout applies; generation length bounds the request.
    pub async fn post_stream(&self, path: &str, body: &Value) -> Result<ByteStream, BackendError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| BackendError::Network(e.to_string()))
        });
        Ok(Box::pin(stream))
    }

    /// GET `path` and report whether it answered with a success status
    pub async fn probe(&self, path: &str) -> bool {
        match self
            .client
            .get(self.url(path))
            .timeout(Duration::from_millis(timeouts::PROBE_REQUEST_MS))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                log::debug!("Probe {} returned status {}", path, resp.status());
                false
            }
            Err(e) => {
                log::debug!("Probe {} failed: {}", path, e);
                false
            }
        }
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, BackendError> {
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| BackendError::Status {
            status: 502,
            body: Value::String(format!("invalid JSON from backend: {}", e)),
        })
    }

    async fn status_error(response: reqwest::Response) -> BackendError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        BackendError::Status { status, body }
    }
}
