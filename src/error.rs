use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Structured error crossing every engine boundary: a status code, a
/// human-readable message and diagnostic parameters (usually the offending
/// payload). Components never surface a raw panic or a bare string.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{message} (status {status_code})")]
pub struct OrchestrateError {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
}

impl OrchestrateError {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
            parameters: Value::Null,
        }
    }

    /// Missing or invalid configuration, detected before any remote call.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(503, message)
    }

    /// A payload failed shape validation after a step.
    pub fn validation(message: impl Into<String>, payload: Value) -> Self {
        Self::new(400, message).with_parameters(json!({ "payload": payload }))
    }

    /// A remote step returned a bad status or the invocation itself blew up.
    pub fn step(message: impl Into<String>) -> Self {
        Self::new(503, message)
    }

    /// Nothing matched / nothing survived (no candidate, no connector).
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(503, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    /// Optimistic-concurrency violation on a persisted document.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Attach the last known payload for observability.
    pub fn with_payload(self, payload: &crate::payload::Payload) -> Self {
        let value = serde_json::to_value(payload).unwrap_or(Value::Null);
        self.with_parameters(json!({ "payload": value }))
    }
}
