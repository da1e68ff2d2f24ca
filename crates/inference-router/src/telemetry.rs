//! Per-request telemetry
//!
//! Every engine reports usage and timing under its own field names. Adapters
//! describe theirs with a [`TelemetryFields`] table and the values are folded
//! into one [`Telemetry`] record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token counts and timings of the most recent request on a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Seconds until the first generated token
    pub time_to_first_token: Option<f64>,
    pub tokens_per_second: Option<f64>,
}

impl Telemetry {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.time_to_first_token.is_none()
            && self.tokens_per_second.is_none()
    }

    /// Overwrite fields that `other` carries, keep the rest
    pub fn merge(&mut self, other: &Telemetry) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
        if other.time_to_first_token.is_some() {
            self.time_to_first_token = other.time_to_first_token;
        }
        if other.tokens_per_second.is_some() {
            self.tokens_per_second = other.tokens_per_second;
        }
    }
}

/// Where an engine puts its numbers. Each entry is a JSON pointer into a
/// response body or stream event.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryFields {
    pub input_tokens: &'static str,
    pub output_tokens: &'static str,
    pub time_to_first_token: &'static str,
    pub tokens_per_second: &'static str,
    /// Multiplier turning the time-to-first-token value into seconds
    pub ttft_scale: f64,
}

impl TelemetryFields {
    /// Plain OpenAI `usage` block, no timings
    pub const OPENAI: TelemetryFields = TelemetryFields {
        input_tokens: "/usage/prompt_tokens",
        output_tokens: "/usage/completion_tokens",
        time_to_first_token: "",
        tokens_per_second: "",
        ttft_scale: 1.0,
    };

    /// Pull whatever is present out of one payload
    pub fn extract(&self, payload: &Value) -> Option<Telemetry> {
        let int = |pointer: &str| -> Option<u64> {
            if pointer.is_empty() {
                return None;
            }
            let value = payload.pointer(pointer)?;
            value.as_u64().or_else(|| value.as_f64().map(|f| f as u64))
        };
        let float = |pointer: &str| -> Option<f64> {
            if pointer.is_empty() {
                return None;
            }
            payload.pointer(pointer)?.as_f64()
        };

        let telemetry = Telemetry {
            input_tokens: int(self.input_tokens),
            output_tokens: int(self.output_tokens),
            time_to_first_token: float(self.time_to_first_token).map(|t| t * self.ttft_scale),
            tokens_per_second: float(self.tokens_per_second),
        };

        (!telemetry.is_empty()).then_some(telemetry)
    }
}
