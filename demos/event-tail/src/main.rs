//! Relay a scripted agent session to stdout.
//!
//! Run with: cargo run -p event-tail
//!
//! Builds a short scripted event stream (streamed assistant text plus a
//! session.idle terminator), registers the built-in handlers against a
//! stdout sink and runs one tracked stream through the manager.

use std::{sync::Arc, time::Duration};

use agent_relay_core::{
    AgentEvent, OutputSink, RelayConfig, SessionControl,
    handlers::{ErrorReportHandler, SessionLifecycleHandler, TextOutputHandler},
    traits::{EventSource, SessionControlError, SourceError},
};
use agent_relay_session::{StreamConfig, StreamManager, StreamStatus};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Scripted source yielding a canned conversation with small delays.
struct ScriptedSession {
    events: Vec<AgentEvent>,
}

impl ScriptedSession {
    fn new(session_id: &str) -> Self {
        let snapshots = [
            "Thinking about",
            "Thinking about your question...\n",
            "Thinking about your question...\nHere is the answer: 42\n",
        ];
        let mut events: Vec<AgentEvent> = snapshots
            .iter()
            .map(|text| {
                object_event(
                    "message.part.updated",
                    json!({
                        "part": {
                            "messageID": "msg_1",
                            "sessionID": session_id,
                            "text": text,
                        }
                    }),
                )
            })
            .collect();
        events.push(object_event(
            "session.idle",
            json!({ "sessionID": session_id }),
        ));
        events.reverse(); // popped from the back
        Self { events }
    }
}

fn object_event(event_type: &str, properties: Value) -> AgentEvent {
    match properties {
        Value::Object(map) => AgentEvent::with_properties(event_type, map),
        _ => AgentEvent::new(event_type),
    }
}

#[async_trait]
impl EventSource for ScriptedSession {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
        let Some(event) = self.events.pop() else {
            return Ok(None);
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(Some(event))
    }
}

/// No remote service behind the demo; aborts just get logged.
struct LoggingControl;

#[async_trait]
impl SessionControl for LoggingControl {
    async fn create(&self, _params: Value) -> Result<String, SessionControlError> {
        Ok("ses_demo".to_string())
    }

    async fn submit(&self, session_id: &str, _payload: Value) -> Result<(), SessionControlError> {
        tracing::info!(session_id, "submit ignored by demo control");
        Ok(())
    }

    async fn abort(&self, session_id: &str) -> Result<(), SessionControlError> {
        tracing::info!(session_id, "abort requested");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let manager = StreamManager::new(Arc::new(LoggingControl), RelayConfig::default());

    let sink = OutputSink::stdout();
    let id = manager
        .create_stream(
            Some("ses_demo".to_string()),
            ScriptedSession::new("ses_demo"),
            vec![
                Arc::new(SessionLifecycleHandler),
                Arc::new(ErrorReportHandler::new(sink.clone())),
                Arc::new(TextOutputHandler::new(sink)),
            ],
            StreamConfig::default(),
        )
        .await?;

    // Wait for the background stream to reach a terminal status.
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        match manager.stream_info(&id).map(|info| info.status) {
            Some(StreamStatus::Active) => {}
            other => {
                tracing::info!(?other, "stream finished");
                break;
            }
        }
    }

    let metrics = manager.metrics();
    tracing::info!(
        total = metrics.total,
        completed = metrics.completed,
        "relay done"
    );
    manager.stop_all_streams().await;
    Ok(())
}
