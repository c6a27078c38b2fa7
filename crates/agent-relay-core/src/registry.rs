//! Handler registry with priority-ordered, failure-isolated dispatch.

use std::{collections::HashMap, sync::Arc};

use crate::{AgentEvent, EventHandler};

/// Name-keyed handler registry.
///
/// Holds one handler per name and a cached priority-sorted view that is
/// recomputed on every registration change. Dispatch walks the sorted
/// view; equal priorities keep their registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    by_name: HashMap<String, (u64, Arc<dyn EventHandler>)>,
    sorted: Vec<Arc<dyn EventHandler>>,
    next_seq: u64,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler with the same name.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_name
            .insert(handler.name().to_string(), (seq, Arc::clone(&handler)));
        self.resort();
    }

    /// Remove a handler by name. No-op if absent.
    pub fn unregister(&mut self, name: &str) {
        if self.by_name.remove(name).is_some() {
            self.resort();
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Handlers in ascending priority order.
    #[must_use]
    pub fn handlers_by_priority(&self) -> &[Arc<dyn EventHandler>] {
        &self.sorted
    }

    /// Priority of the best (lowest-value) handler matching `event`.
    ///
    /// `None` when no handler matches; such events rank after all
    /// matched ones in buffer selection.
    #[must_use]
    pub fn best_priority(&self, event: &AgentEvent) -> Option<i32> {
        self.sorted
            .iter()
            .find(|h| h.can_handle(event))
            .map(|h| h.priority())
    }

    /// Dispatch one event to every matching handler in priority order.
    ///
    /// A failing handler is logged at warn level and does not stop
    /// dispatch to the remaining handlers. Events matching no handler
    /// are dropped silently (debug log only): unhandled event types are
    /// expected, not an error condition.
    ///
    /// Returns the number of handlers invoked.
    pub async fn dispatch(&self, event: &AgentEvent) -> usize {
        let matching: Vec<_> = self
            .sorted
            .iter()
            .filter(|h| h.can_handle(event))
            .collect();

        if matching.is_empty() {
            tracing::debug!(event_type = %event.event_type, "no handler matched event");
            return 0;
        }

        for handler in &matching {
            if let Err(e) = handler.handle(event).await {
                tracing::warn!(
                    handler = handler.name(),
                    event_type = %event.event_type,
                    "handler failed: {e}"
                );
            }
        }
        matching.len()
    }

    fn resort(&mut self) {
        let mut entries: Vec<_> = self
            .by_name
            .values()
            .map(|(seq, h)| (*seq, Arc::clone(h)))
            .collect();
        entries.sort_by_key(|(seq, h)| (h.priority(), *seq));
        self.sorted = entries.into_iter().map(|(_, h)| h).collect();
    }
}
