//! Session correlation, inactivity timeouts and stream lifecycle.
//!
//! Ties one correlated event source, one dispatch pipeline and one
//! remote session together into a tracked stream: the correlator
//! filters a shared source down to a single session and classifies its
//! terminal events, the timeout coordinator races consumption against
//! an inactivity timer, and the stream manager supervises many such
//! pipelines.

pub mod correlator;
pub mod manager;
pub mod timeout;

pub use correlator::SessionCorrelator;
pub use manager::{ManagerMetrics, StreamConfig, StreamError, StreamInfo, StreamManager, StreamStatus};
pub use timeout::{SessionError, drive_session};
