use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestrateError;

/// The canonical message envelope threaded through every pipeline stage.
///
/// `input` is immutable after creation, `conversationcontext` is the per-user
/// session state persisted between runs, `context` is scratch space for the
/// current run only, and `output` is the append-only record of what was
/// actually sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Payload {
    pub id: String,
    pub input: Input,
    #[serde(default)]
    pub conversationcontext: ConversationContext,
    #[serde(default)]
    pub context: RunContext,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<OutputEntry>,
}

/// Description of the inciting message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Input {
    pub channel: String,
    pub user: String,
    #[serde(default)]
    pub message: Value,
    pub received_at: DateTime<Utc>,
}

/// Per-user session state. The `user._id` key is stable across runs for the
/// same end user; `patterns` holds opaque per-pattern runtime state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConversationContext {
    #[serde(default)]
    pub user: UserProfile,
    #[serde(default)]
    pub patterns: HashMap<String, Value>,
    #[serde(default)]
    pub services: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UserProfile {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(flatten)]
    pub attributes: HashMap<String, Value>,
}

/// Scratch space for a single pipeline run. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_messages: Vec<OutboundMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_channel: Option<String>,
    #[serde(flatten)]
    pub extras: HashMap<String, Value>,
}

/// A message queued for dispatch, with an optional pacing delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutboundMessage {
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputEntry {
    pub channel: String,
    pub sent: Vec<SentMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SentMessage {
    pub message: Value,
    pub sent_at: DateTime<Utc>,
}

impl Payload {
    /// Build a fresh payload for an inbound message, minting the request id
    /// and stamping the receipt time.
    pub fn new(channel: &str, user: &str, message: Value) -> Self {
        let mut conversationcontext = ConversationContext::default();
        conversationcontext.user.id = user.to_string();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            input: Input {
                channel: channel.to_string(),
                user: user.to_string(),
                message,
                received_at: Utc::now(),
            },
            conversationcontext,
            context: RunContext::default(),
            output: Vec::new(),
        }
    }

    /// Canonical shape check applied to every payload a step hands back:
    /// `id`, `input.channel` and `input.user` must all be non-empty.
    pub fn validate(&self) -> Result<(), OrchestrateError> {
        if self.id.is_empty() {
            return Err(OrchestrateError::validation(
                "payload is missing its id",
                self.to_value(),
            ));
        }
        if self.input.channel.is_empty() {
            return Err(OrchestrateError::validation(
                "payload input.channel is empty",
                self.to_value(),
            ));
        }
        if self.input.user.is_empty() {
            return Err(OrchestrateError::validation(
                "payload input.user is empty",
                self.to_value(),
            ));
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Runtime state of a pattern engine, if any has been persisted.
    pub fn pattern_state(&self, name: &str) -> Option<&Value> {
        self.conversationcontext.patterns.get(name)
    }

    pub fn set_pattern_state(&mut self, name: &str, state: Value) {
        self.conversationcontext
            .patterns
            .insert(name.to_string(), state);
    }

    /// Queue a message for the output dispatcher.
    pub fn queue_message(&mut self, message: Value, wait_ms: Option<u64>) {
        self.context
            .output_messages
            .push(OutboundMessage { message, wait_ms });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_payload_shape() {
        let payload = Payload::new("facebook", "user-1", json!({"text": "hi"}));
        assert!(!payload.id.is_empty());
        assert_eq!(payload.input.channel, "facebook");
        assert_eq!(payload.conversationcontext.user.id, "user-1");
        assert!(payload.output.is_empty());
        payload.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_channel() {
        let mut payload = Payload::new("http", "u", Value::Null);
        payload.input.channel.clear();
        let err = payload.validate().unwrap_err();
        assert_eq!(err.status_code, 400);
        assert!(err.message.contains("input.channel"));
    }

    #[test]
    fn test_validate_rejects_missing_user() {
        let mut payload = Payload::new("http", "u", Value::Null);
        payload.input.user.clear();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_pattern_state_roundtrip() {
        let mut payload = Payload::new("test", "u", Value::Null);
        assert!(payload.pattern_state("fsm").is_none());
        payload.set_pattern_state("fsm", json!({"state": "/a"}));
        assert_eq!(payload.pattern_state("fsm").unwrap()["state"], "/a");
    }

    #[test]
    fn test_serde_roundtrip_keeps_context_extras() {
        let mut payload = Payload::new("test", "u", json!("hello"));
        payload
            .context
            .extras
            .insert("watson".into(), json!({"intent": "greeting"}));
        payload.queue_message(json!("hi there"), Some(500));

        let value = payload.to_value();
        let back: Payload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.context.output_messages.len(), 1);
        assert_eq!(back.context.extras["watson"]["intent"], "greeting");
    }
}
