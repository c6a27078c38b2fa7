//! Core abstractions for relaying remote agent event streams.
//!
//! This crate provides the fundamental building blocks:
//! - `AgentEvent` - Typed event with a free-form property bag
//! - `EventHandler` / `HandlerRegistry` - Capability-matched, prioritized dispatch
//! - `OutputSink` - Shared async text sink with caught write failures
//! - `EventSource` / `SessionControl` traits - Collaborator boundaries
//! - `RelayConfig` - Tuning knobs for buffering, rate limiting and timeouts

pub mod config;
pub mod event;
pub mod handler;
pub mod handlers;
pub mod registry;
pub mod sink;
pub mod traits;

pub use config::RelayConfig;
pub use event::AgentEvent;
pub use handler::{EventHandler, HandlerError};
pub use registry::HandlerRegistry;
pub use sink::OutputSink;
pub use traits::{EventSource, SessionControl, StreamSource};
