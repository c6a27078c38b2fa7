//! Built-in handlers for text output and session lifecycle tracking.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::{AgentEvent, EventHandler, HandlerError, OutputSink};

fn part_text(event: &AgentEvent) -> Option<&str> {
    event
        .property("part")
        .and_then(|p| p.get("text"))
        .and_then(Value::as_str)
}

fn message_id(event: &AgentEvent) -> Option<&str> {
    event
        .property("part")
        .and_then(|p| p.get("messageID"))
        .and_then(Value::as_str)
        .or_else(|| {
            event
                .property("info")
                .and_then(|i| i.get("id"))
                .and_then(Value::as_str)
        })
}

/// Writes streamed assistant text to the output sink.
///
/// Message parts arrive as cumulative snapshots, so the handler keeps
/// the last emitted text per message id and writes only the unseen
/// suffix. Re-delivery of an identical snapshot emits nothing, which
/// makes emission idempotent per (message id, full text).
pub struct TextOutputHandler {
    sink: OutputSink,
    emitted: Mutex<HashMap<String, String>>,
}

impl TextOutputHandler {
    /// Create a text handler writing to `sink`.
    #[must_use]
    pub fn new(sink: OutputSink) -> Self {
        Self {
            sink,
            emitted: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventHandler for TextOutputHandler {
    fn name(&self) -> &str {
        "text-output"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn can_handle(&self, event: &AgentEvent) -> bool {
        (event.event_type == "message.part.updated" || event.event_type == "message.updated")
            && part_text(event).is_some()
    }

    async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError> {
        let Some(text) = part_text(event) else {
            return Ok(());
        };
        let key = message_id(event).unwrap_or("(anonymous)").to_string();

        let to_write = {
            let mut emitted = self
                .emitted
                .lock()
                .map_err(|e| HandlerError::Failed(e.to_string()))?;
            match emitted.get(&key) {
                Some(prev) if prev == text => None,
                Some(prev) if text.starts_with(prev.as_str()) => {
                    let suffix = text[prev.len()..].to_string();
                    emitted.insert(key, text.to_string());
                    Some(suffix)
                }
                _ => {
                    emitted.insert(key, text.to_string());
                    Some(text.to_string())
                }
            }
        };

        if let Some(chunk) = to_write {
            if let Err(e) = self.sink.write_text(&chunk).await {
                // A broken sink must not take the pipeline down.
                tracing::error!("output sink write failed, dropping chunk: {e}");
            }
        }
        Ok(())
    }
}

/// Tracks session lifecycle transitions via structured logs.
pub struct SessionLifecycleHandler;

#[async_trait]
impl EventHandler for SessionLifecycleHandler {
    fn name(&self) -> &str {
        "session-lifecycle"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn can_handle(&self, event: &AgentEvent) -> bool {
        event.event_type.starts_with("session.")
    }

    async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError> {
        let session = event.session_id().unwrap_or("-");
        if event.is_session_error() {
            tracing::warn!(session, "session errored: {}", event.error_detail());
        } else {
            tracing::debug!(session, event_type = %event.event_type, "session lifecycle");
        }
        Ok(())
    }
}

/// Writes session error details to the sink.
pub struct ErrorReportHandler {
    sink: OutputSink,
}

impl ErrorReportHandler {
    /// Create an error reporter writing to `sink`.
    #[must_use]
    pub fn new(sink: OutputSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl EventHandler for ErrorReportHandler {
    fn name(&self) -> &str {
        "error-report"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn can_handle(&self, event: &AgentEvent) -> bool {
        event.is_session_error()
    }

    async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError> {
        let line = format!("error: {}", event.error_detail());
        if let Err(e) = self.sink.write_line(&line).await {
            tracing::error!("output sink write failed, dropping error report: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    use super::*;

    fn text_event(message_id: &str, text: &str) -> AgentEvent {
        let props = json!({
            "part": { "messageID": message_id, "sessionID": "ses_1", "text": text }
        });
        match props {
            Value::Object(map) => AgentEvent::with_properties("message.part.updated", map),
            _ => unreachable!(),
        }
    }

    async fn sink_pair() -> (OutputSink, DuplexStream) {
        let (tx, rx) = duplex(4096);
        (OutputSink::new(tx), rx)
    }

    async fn read_available(rx: &mut DuplexStream) -> String {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 4096];
        let n = rx.read(&mut buf).await.unwrap_or(0);
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn identical_snapshot_is_emitted_once() {
        let (sink, mut rx) = sink_pair().await;
        let handler = TextOutputHandler::new(sink);

        let event = text_event("msg_1", "hello world");
        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        let out = read_available(&mut rx).await;
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn cumulative_snapshot_emits_only_the_suffix() {
        let (sink, mut rx) = sink_pair().await;
        let handler = TextOutputHandler::new(sink);

        handler.handle(&text_event("msg_1", "hel")).await.unwrap();
        handler.handle(&text_event("msg_1", "hello")).await.unwrap();

        let mut out = read_available(&mut rx).await;
        if out.len() < 5 {
            out.push_str(&read_available(&mut rx).await);
        }
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn broken_sink_does_not_fail_the_handler() {
        let (tx, rx) = duplex(16);
        drop(rx);
        let mut tx = tx;
        let _ = tx.shutdown().await;
        let handler = TextOutputHandler::new(OutputSink::new(tx));

        let result = handler.handle(&text_event("msg_1", "hi")).await;
        assert!(result.is_ok());
    }
}
