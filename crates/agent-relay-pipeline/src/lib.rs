//! Bounded buffering, backpressure and rate-limited dispatch.
//!
//! Sits between an `EventSource` and the handler registry: events are
//! pushed into a capacity-limited buffer that sheds load when the
//! consumer falls behind, and pulled out by a fixed-rate loop with a
//! cap on concurrently in-flight dispatches.

pub mod buffer;
pub mod processor;

pub use buffer::EventBuffer;
pub use processor::{EventPipeline, PipelineError, PipelineMetrics};
