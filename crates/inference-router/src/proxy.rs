//! Streaming relay between a backend and a client
//!
//! Bytes are written to the client as they arrive. A side parser
//! reassembles SSE lines across reads and folds telemetry out of each
//! `data:` payload, so memory is bounded by the longest line rather than the
//! length of the response.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::backend::ByteStream;
use crate::constants::sse;
use crate::telemetry::{Telemetry, TelemetryFields};

/// Streaming failures
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Upstream failed before sending a single payload
    #[error("Network error: {0}")]
    Network(String),

    /// The client side stopped accepting bytes
    #[error("Client disconnected: {0}")]
    ClientDisconnected(#[source] std::io::Error),
}

/// What a finished relay saw
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamSummary {
    /// `data:` payloads other than the terminal sentinel
    pub payloads: usize,
    pub bytes: u64,
    /// Whether `data: [DONE]` arrived
    pub done: bool,
    pub telemetry: Telemetry,
}

/// One relay from an upstream byte stream into a client sink
pub struct StreamingProxy {
    fields: TelemetryFields,
    started: Instant,
    /// Bytes of the current, not yet terminated line
    line: Vec<u8>,
    first_payload_after: Option<Duration>,
    summary: StreamSummary,
}

impl StreamingProxy {
    /// `started` is when the request was sent; it anchors the measured
    /// time to first token.
    pub fn new(fields: TelemetryFields, started: Instant) -> Self {
        Self {
            fields,
            started,
            line: Vec::new(),
            first_payload_after: None,
            summary: StreamSummary::default(),
        }
    }

    /// Copy `upstream` into `sink` until either side ends
    pub async fn relay<W>(
        mut self,
        mut upstream: ByteStream,
        sink: &mut W,
    ) -> Result<StreamSummary, ProxyError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while let Some(chunk) = upstream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Some engines drop the connection right after the last
                    // payload instead of closing cleanly
                    if self.summary.payloads > 0 || self.summary.done {
                        log::debug!("Upstream closed after final payload: {}", e);
                        break;
                    }
                    return Err(ProxyError::Network(e.to_string()));
                }
            };

            sink.write_all(&bytes)
                .await
                .map_err(ProxyError::ClientDisconnected)?;
            sink.flush().await.map_err(ProxyError::ClientDisconnected)?;

            self.summary.bytes += bytes.len() as u64;
            self.feed(&bytes);
        }

        Ok(self.finish())
    }

    fn feed(&mut self, mut bytes: &[u8]) {
        while let Some(pos) = bytes.iter().position(|&b| b == b'\n') {
            if self.line.is_empty() {
                self.handle_line(&bytes[..pos]);
            } else {
                self.line.extend_from_slice(&bytes[..pos]);
                let line = std::mem::take(&mut self.line);
                self.handle_line(&line);
                self.line = line;
                self.line.clear();
            }
            bytes = &bytes[pos + 1..];
        }
        self.line.extend_from_slice(bytes);
    }

    fn handle_line(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Ok(line) = std::str::from_utf8(line) else {
            return;
        };
        // Comments, heartbeats and `event:`/`id:` fields carry no payload
        let Some(payload) = line.strip_prefix(sse::DATA_PREFIX) else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return;
        }
        if payload == sse::DONE_SENTINEL {
            self.summary.done = true;
            return;
        }

        self.summary.payloads += 1;
        if self.first_payload_after.is_none() {
            self.first_payload_after = Some(self.started.elapsed());
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(value) => {
                if let Some(telemetry) = self.fields.extract(&value) {
                    self.summary.telemetry.merge(&telemetry);
                }
            }
            Err(e) => log::debug!("Skipping non-JSON stream payload: {}", e),
        }
    }

    fn finish(mut self) -> StreamSummary {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.handle_line(&line);
        }
        if self.summary.telemetry.time_to_first_token.is_none() {
            self.summary.telemetry.time_to_first_token =
                self.first_payload_after.map(|d| d.as_secs_f64());
        }
        self.summary
    }
}

/// Format a JSON value as one SSE event
pub fn sse_event(value: &Value) -> Vec<u8> {
    format!("{} {}\n\n", sse::DATA_PREFIX, value).into_bytes()
}
