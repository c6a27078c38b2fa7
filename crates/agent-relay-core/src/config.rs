//! Relay tuning configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backpressure_threshold ({threshold}) must not exceed buffer_size ({buffer_size})")]
    ThresholdAboveBuffer { threshold: usize, buffer_size: usize },
    #[error("processing_rate_limit must be at least 1")]
    ZeroRateLimit,
    #[error("buffer_size must be at least 1")]
    ZeroBufferSize,
    #[error("backpressure_threshold must be at least 1")]
    ZeroBackpressureThreshold,
}

/// Tuning knobs for one relay pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum buffered events before the oldest is evicted.
    pub buffer_size: usize,
    /// Maximum concurrently in-flight dispatches.
    pub max_concurrent_handlers: usize,
    /// Processing rate cap, events per second.
    pub processing_rate_limit: u32,
    /// Buffer length at which backpressure activates. Must be
    /// less than or equal to `buffer_size`.
    pub backpressure_threshold: usize,
    /// Lifecycle staleness horizon for `cleanup_stale_streams`.
    pub stale_timeout_ms: u64,
    /// Inactivity timeout for the per-session timer race.
    pub idle_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            max_concurrent_handlers: 20,
            processing_rate_limit: 1000,
            backpressure_threshold: 500,
            stale_timeout_ms: 30 * 60 * 1000,
            idle_timeout_ms: 2 * 60 * 1000,
        }
    }
}

impl RelayConfig {
    /// Validate invariants between the knobs.
    ///
    /// # Errors
    /// Returns error if a knob is zero or the threshold exceeds the
    /// buffer size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.processing_rate_limit == 0 {
            return Err(ConfigError::ZeroRateLimit);
        }
        // A zero threshold would leave backpressure permanently active.
        if self.backpressure_threshold == 0 {
            return Err(ConfigError::ZeroBackpressureThreshold);
        }
        if self.backpressure_threshold > self.buffer_size {
            return Err(ConfigError::ThresholdAboveBuffer {
                threshold: self.backpressure_threshold,
                buffer_size: self.buffer_size,
            });
        }
        Ok(())
    }

    /// Tick period of the rate-limited processing loop.
    #[must_use]
    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.processing_rate_limit.max(1)))
    }
}
