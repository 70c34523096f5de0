use std::fmt::Debug;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::time::{Duration, sleep};
use tracing::debug;

use crate::error::OrchestrateError;
use crate::payload::{OutputEntry, Payload, SentMessage};

/// Hard ceiling for the per-message pacing delay.
pub const MAX_PACING_MS: u64 = 10_000;

/// Channel-specific output connector. The core never talks to channel APIs
/// directly; it hands finished messages to one of these.
#[async_trait]
pub trait ChannelConnector: Send + Sync + Debug {
    async fn send(&self, channel: &str, user: &str, message: &Value)
    -> Result<(), OrchestrateError>;
}

/// Send every queued output message in order through `connector`, honoring
/// each message's pacing delay, and append the sent record to the payload's
/// output log. The delay is a cooperative sleep; concurrent runs keep going.
pub async fn dispatch_output(
    payload: &mut Payload,
    connector: &dyn ChannelConnector,
) -> Result<usize, OrchestrateError> {
    let messages = std::mem::take(&mut payload.context.output_messages);
    if messages.is_empty() {
        return Ok(0);
    }
    let channel = payload
        .context
        .output_channel
        .clone()
        .unwrap_or_else(|| payload.input.channel.clone());

    let mut sent = Vec::with_capacity(messages.len());
    for outbound in messages {
        if let Some(wait_ms) = outbound.wait_ms {
            let wait_ms = wait_ms.min(MAX_PACING_MS);
            debug!(channel = %channel, wait_ms, "pacing outbound message");
            sleep(Duration::from_millis(wait_ms)).await;
        }
        connector
            .send(&channel, &payload.input.user, &outbound.message)
            .await?;
        sent.push(SentMessage {
            message: outbound.message,
            sent_at: Utc::now(),
        });
    }

    let count = sent.len();
    payload.output.push(OutputEntry { channel, sent });
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Default)]
    struct RecordingConnector {
        sent: Mutex<Vec<(String, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl ChannelConnector for RecordingConnector {
        async fn send(
            &self,
            channel: &str,
            _user: &str,
            message: &Value,
        ) -> Result<(), OrchestrateError> {
            if self.fail {
                return Err(OrchestrateError::step("connector down"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((channel.to_string(), message.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_appends_output_entry() {
        let connector = RecordingConnector::default();
        let mut payload = Payload::new("facebook", "u", Value::Null);
        payload.queue_message(json!("first"), None);
        payload.queue_message(json!("second"), None);

        let count = dispatch_output(&mut payload, &connector).await.unwrap();
        assert_eq!(count, 2);
        assert!(payload.context.output_messages.is_empty());
        assert_eq!(payload.output.len(), 1);
        assert_eq!(payload.output[0].channel, "facebook");
        assert_eq!(payload.output[0].sent[0].message, json!("first"));
        assert_eq!(payload.output[0].sent[1].message, json!("second"));
    }

    #[tokio::test]
    async fn test_output_channel_overrides_input_channel() {
        let connector = RecordingConnector::default();
        let mut payload = Payload::new("http", "u", Value::Null);
        payload.context.output_channel = Some("facebook".into());
        payload.queue_message(json!("hi"), None);

        dispatch_output(&mut payload, &connector).await.unwrap();
        assert_eq!(connector.sent.lock().unwrap()[0].0, "facebook");
    }

    #[tokio::test]
    async fn test_output_accumulates_across_dispatches() {
        let connector = RecordingConnector::default();
        let mut payload = Payload::new("http", "u", Value::Null);
        payload.queue_message(json!("one"), None);
        dispatch_output(&mut payload, &connector).await.unwrap();
        payload.queue_message(json!("two"), None);
        dispatch_output(&mut payload, &connector).await.unwrap();

        // entries accumulate, never overwritten
        assert_eq!(payload.output.len(), 2);
    }

    #[tokio::test]
    async fn test_connector_failure_propagates() {
        let connector = RecordingConnector {
            fail: true,
            ..Default::default()
        };
        let mut payload = Payload::new("http", "u", Value::Null);
        payload.queue_message(json!("hi"), None);

        let err = dispatch_output(&mut payload, &connector).await.unwrap_err();
        assert_eq!(err.status_code, 503);
        assert!(payload.output.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_delay_is_clamped() {
        let connector = RecordingConnector::default();
        let mut payload = Payload::new("http", "u", Value::Null);
        payload.queue_message(json!("slow"), Some(60_000));

        let started = Instant::now();
        dispatch_output(&mut payload, &connector).await.unwrap();
        let elapsed = started.elapsed();
        // clamped to the ceiling, not the requested minute
        assert!(elapsed >= Duration::from_millis(MAX_PACING_MS));
        assert!(elapsed < Duration::from_millis(MAX_PACING_MS + 1_000));
    }

    #[tokio::test]
    async fn test_no_messages_is_a_noop() {
        let connector = RecordingConnector::default();
        let mut payload = Payload::new("http", "u", Value::Null);
        assert_eq!(dispatch_output(&mut payload, &connector).await.unwrap(), 0);
        assert!(payload.output.is_empty());
    }
}
