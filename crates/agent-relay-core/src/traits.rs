//! Collaborator traits at the core's boundary.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::AgentEvent;

/// Event source error.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Transport error: {0}")]
    Transport(String),
    /// A semantic error event carried inside the stream, fatal to the
    /// session it belongs to.
    #[error("Session error: {0}")]
    Session(String),
    #[error("Source closed unexpectedly")]
    Closed,
}

/// An async producer of agent events.
///
/// `next_event` returning `Ok(None)` means the source is exhausted.
/// Sources backed by a live transport may additionally expose a
/// heartbeat channel that ticks on protocol-level pings, proving the
/// connection is alive even when no semantic event has occurred.
#[async_trait]
pub trait EventSource: Send {
    /// Pull the next event, or `None` on clean exhaustion.
    ///
    /// # Errors
    /// Returns error if the source itself fails; fatal to the stream.
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError>;

    /// Transport-liveness channel. The value increments on every ping.
    fn heartbeats(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Adapter exposing a plain event stream as an [`EventSource`].
///
/// Useful for channel- or iterator-backed producers that have no
/// transport-level heartbeats of their own.
pub struct StreamSource<St> {
    stream: St,
}

impl<St> StreamSource<St>
where
    St: Stream<Item = Result<AgentEvent, SourceError>> + Send + Unpin,
{
    /// Wrap `stream`.
    #[must_use]
    pub fn new(stream: St) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<St> EventSource for StreamSource<St>
where
    St: Stream<Item = Result<AgentEvent, SourceError>> + Send + Unpin,
{
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
        self.stream.next().await.transpose()
    }
}

/// Session control error.
#[derive(Debug, Error)]
pub enum SessionControlError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Control surface of the remote session collaborator.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Create a remote session, returning its id.
    ///
    /// # Errors
    /// Returns error if creation fails.
    async fn create(&self, params: Value) -> Result<String, SessionControlError>;

    /// Submit a payload to a session. Fire-and-forget from the core's
    /// perspective; transport failures surface asynchronously and
    /// terminate the owning stream.
    ///
    /// # Errors
    /// Returns error on transport failure.
    async fn submit(&self, session_id: &str, payload: Value) -> Result<(), SessionControlError>;

    /// Best-effort abort. Callers log failures instead of raising them.
    ///
    /// # Errors
    /// Returns error if the abort request could not be delivered.
    async fn abort(&self, session_id: &str) -> Result<(), SessionControlError>;
}
