//! Typed agent events with a free-form property bag.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Candidate property paths for the session identifier, tried in order.
///
/// Different event shapes carry the id at different nesting levels
/// (top-level for lifecycle events, inside `part`/`message` for
/// incremental message updates).
const SESSION_ID_PATHS: &[&[&str]] = &[
    &["sessionID"],
    &["session_id"],
    &["info", "sessionID"],
    &["part", "sessionID"],
    &["message", "sessionID"],
];

/// A single typed notification produced by a remote agent session.
///
/// Events are immutable once produced: the core reads them, it never
/// rewrites them. Properties are a free-form JSON map; a session
/// identifier may or may not be present and must be checked via
/// [`AgentEvent::session_id`], never assumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Event type tag, e.g. `message.part.updated` or `session.idle`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Arbitrary event payload.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl AgentEvent {
    /// Create an event with an empty property bag.
    #[must_use]
    pub fn new<S: Into<String>>(event_type: S) -> Self {
        Self {
            event_type: event_type.into(),
            properties: Map::new(),
        }
    }

    /// Create an event with properties.
    #[must_use]
    pub fn with_properties<S: Into<String>>(event_type: S, properties: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    /// Get a top-level property by key.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Extract the session identifier, trying each known nesting level.
    ///
    /// Total: returns `None` when no candidate path yields a string,
    /// never panics on unexpected shapes.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        SESSION_ID_PATHS.iter().find_map(|path| {
            let (first, rest) = path.split_first()?;
            let mut value = self.properties.get(*first)?;
            for key in rest {
                value = value.get(key)?;
            }
            value.as_str()
        })
    }

    /// Whether this event marks a session as idle (successful completion).
    #[must_use]
    pub fn is_session_idle(&self) -> bool {
        self.event_type == "session.idle"
    }

    /// Whether this event carries a session-level error.
    #[must_use]
    pub fn is_session_error(&self) -> bool {
        self.event_type == "session.error"
    }

    /// Human-readable error detail for `session.error` events.
    #[must_use]
    pub fn error_detail(&self) -> String {
        match self.properties.get("error") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| other.to_string(), ToString::to_string),
            None => "unknown session error".to_string(),
        }
    }
}
