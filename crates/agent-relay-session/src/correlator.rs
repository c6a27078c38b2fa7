//! Session correlation and completion detection.

use agent_relay_core::{AgentEvent, EventSource, traits::SourceError};
use async_trait::async_trait;
use tokio::sync::watch;

/// Filters a shared event source down to one session and classifies
/// its terminal events.
///
/// Events without any session identifier are treated as broadcast and
/// stay in scope; events tagged with a different session are skipped
/// without being yielded or counted. A `session.idle` event for the
/// target completes the stream (the idle event is yielded, then the
/// correlator is exhausted); a `session.error` raises immediately with
/// the embedded detail. Either way the correlator fuses: late events on
/// the shared source can never reopen a closed session's output.
pub struct SessionCorrelator<S> {
    inner: S,
    session_id: String,
    done: bool,
}

impl<S: EventSource> SessionCorrelator<S> {
    /// Correlate `inner` to the session identified by `session_id`.
    #[must_use]
    pub fn new(inner: S, session_id: impl Into<String>) -> Self {
        Self {
            inner,
            session_id: session_id.into(),
            done: false,
        }
    }

    /// Target session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn in_scope(&self, event: &AgentEvent) -> bool {
        event
            .session_id()
            .is_none_or(|id| id == self.session_id)
    }
}

#[async_trait]
impl<S: EventSource> EventSource for SessionCorrelator<S> {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
        while !self.done {
            let Some(event) = self.inner.next_event().await? else {
                self.done = true;
                break;
            };

            if !self.in_scope(&event) {
                continue;
            }

            if event.is_session_error() {
                self.done = true;
                return Err(SourceError::Session(event.error_detail()));
            }
            if event.is_session_idle() {
                // Yield the idle event itself, then stay exhausted.
                self.done = true;
                return Ok(Some(event));
            }
            return Ok(Some(event));
        }
        Ok(None)
    }

    fn heartbeats(&self) -> Option<watch::Receiver<u64>> {
        self.inner.heartbeats()
    }
}
