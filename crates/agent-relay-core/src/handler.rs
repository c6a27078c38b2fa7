//! Event handler trait.

use async_trait::async_trait;
use thiserror::Error;

use crate::AgentEvent;

/// Handler error.
///
/// A handler failure is isolated by the dispatcher: it is logged and
/// never stops dispatch to the remaining handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// A registered unit of reaction to events.
///
/// Handlers are selected structurally via [`EventHandler::can_handle`],
/// not by type identity, and invoked in ascending priority order
/// (lower value runs earlier).
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Unique handler name; registering another handler under the same
    /// name replaces this one.
    fn name(&self) -> &str;

    /// Priority for dispatch ordering. Lower runs earlier.
    fn priority(&self) -> i32;

    /// Pure capability predicate: does this handler react to `event`?
    fn can_handle(&self, event: &AgentEvent) -> bool;

    /// React to one event.
    ///
    /// # Errors
    /// Returns error if the reaction fails; the dispatcher isolates it.
    async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError>;
}
