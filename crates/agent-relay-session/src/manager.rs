//! Stream lifecycle management.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use agent_relay_core::{
    AgentEvent, EventHandler, EventSource, RelayConfig, SessionControl, traits::SourceError,
};
use agent_relay_pipeline::{EventPipeline, PipelineMetrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle, time::Instant};

use crate::{SessionCorrelator, SessionError, drive_session};

/// Stream error.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A live stream already owns this id; creation is rejected before
    /// any background work starts.
    #[error("Stream already exists: {0}")]
    DuplicateId(String),
    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(String),
}

/// Stream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Stream is consuming its source.
    Active,
    /// Source exhausted without error.
    Completed,
    /// Processing or the source failed.
    Error,
    /// Inactivity timeout or staleness sweep.
    Timeout,
}

/// Per-stream lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Staleness horizon used by [`StreamManager::cleanup_stale_streams`].
    pub timeout_ms: u64,
    /// Optional cap on consumed events; reaching it counts as clean
    /// exhaustion of the source.
    pub max_events: Option<u64>,
    /// Scheduling weight recorded for observability.
    pub priority: i32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30 * 60 * 1000,
            max_events: None,
            priority: 0,
        }
    }
}

/// Read-only snapshot of one stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Stream id (doubles as the correlated session id).
    pub id: String,
    /// Current status.
    pub status: StreamStatus,
    /// Time since the stream started.
    pub age: Duration,
    /// Time since the last in-scope event.
    pub idle_for: Duration,
    /// In-scope events consumed so far.
    pub event_count: u64,
    /// Terminal error message, if any.
    pub error: Option<String>,
    /// Configured scheduling weight.
    pub priority: i32,
}

/// Derived counts across all tracked streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerMetrics {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub error: usize,
    pub timeout: usize,
}

struct Terminal {
    status: StreamStatus,
    error: Option<String>,
}

struct StreamState {
    id: String,
    config: StreamConfig,
    started_at: Instant,
    terminal: Mutex<Option<Terminal>>,
    last_activity: Mutex<Instant>,
    event_count: AtomicU64,
}

impl StreamState {
    fn status(&self) -> StreamStatus {
        self.terminal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map_or(StreamStatus::Active, |t| t.status)
    }

    /// Single atomic transition out of `Active`.
    fn finish(&self, status: StreamStatus, error: Option<String>) {
        let mut terminal = self
            .terminal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if terminal.is_none() {
            *terminal = Some(Terminal { status, error });
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
        self.event_count.fetch_add(1, Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .elapsed()
    }

    fn info(&self) -> StreamInfo {
        let terminal = self
            .terminal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        StreamInfo {
            id: self.id.clone(),
            status: terminal.as_ref().map_or(StreamStatus::Active, |t| t.status),
            age: self.started_at.elapsed(),
            idle_for: self.idle_for(),
            event_count: self.event_count.load(Ordering::SeqCst),
            error: terminal.as_ref().and_then(|t| t.error.clone()),
            priority: self.config.priority,
        }
    }
}

/// Counts in-scope events and refreshes the stream's activity stamp;
/// optionally caps consumption at `max_events`.
struct TrackedSource<S> {
    inner: S,
    state: Arc<StreamState>,
}

#[async_trait]
impl<S: EventSource> EventSource for TrackedSource<S> {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
        if let Some(max) = self.state.config.max_events {
            if self.state.event_count.load(Ordering::SeqCst) >= max {
                tracing::debug!(stream = %self.state.id, max, "event cap reached");
                return Ok(None);
            }
        }
        let next = self.inner.next_event().await;
        if matches!(next, Ok(Some(_))) {
            self.state.touch();
        }
        next
    }

    fn heartbeats(&self) -> Option<watch::Receiver<u64>> {
        self.inner.heartbeats()
    }
}

struct StreamEntry {
    state: Arc<StreamState>,
    pipeline: Arc<EventPipeline>,
    task: JoinHandle<()>,
}

/// Supervises many independent stream pipelines.
///
/// The stream map is the only structure touched from multiple call
/// sites (API calls plus background completion); every mutation is one
/// lock-guarded map operation with no awaits in between.
pub struct StreamManager<C> {
    control: Arc<C>,
    relay_config: RelayConfig,
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl<C: SessionControl + 'static> StreamManager<C> {
    /// Create a manager issuing aborts through `control`.
    #[must_use]
    pub fn new(control: Arc<C>, relay_config: RelayConfig) -> Self {
        Self {
            control,
            relay_config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start consuming `source` as a tracked stream and return its id.
    ///
    /// The source is filtered to the stream id's session, consumed in
    /// the background under the configured inactivity timeout, and the
    /// stream transitions to its terminal status without involving the
    /// caller. Pass `None` to get a generated id.
    ///
    /// # Errors
    /// Returns error if the id already names a live stream or the
    /// configuration is invalid.
    pub async fn create_stream<S>(
        &self,
        id: Option<String>,
        source: S,
        handlers: Vec<Arc<dyn EventHandler>>,
        config: StreamConfig,
    ) -> Result<String, StreamError>
    where
        S: EventSource + 'static,
    {
        self.relay_config
            .validate()
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;

        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let pipeline = Arc::new(EventPipeline::new(self.relay_config.clone()));
        for handler in handlers {
            pipeline.register_handler(handler).await;
        }

        let state = Arc::new(StreamState {
            id: id.clone(),
            config,
            started_at: Instant::now(),
            terminal: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            event_count: AtomicU64::new(0),
        });

        let idle_timeout = Duration::from_millis(self.relay_config.idle_timeout_ms);

        let mut streams = self.lock();
        if let Some(existing) = streams.get(&id) {
            if existing.state.status() == StreamStatus::Active {
                return Err(StreamError::DuplicateId(id));
            }
        }

        let task = tokio::spawn({
            let state = Arc::clone(&state);
            let pipeline = Arc::clone(&pipeline);
            let control = Arc::clone(&self.control);
            async move {
                let correlated = SessionCorrelator::new(source, state.id.clone());
                let tracked = TrackedSource {
                    inner: correlated,
                    state: Arc::clone(&state),
                };
                let result =
                    drive_session(&pipeline, tracked, control.as_ref(), &state.id, idle_timeout)
                        .await;
                match result {
                    Ok(()) => state.finish(StreamStatus::Completed, None),
                    Err(e @ SessionError::Timeout { .. }) => {
                        tracing::warn!(stream = %state.id, "{e}");
                        state.finish(StreamStatus::Timeout, Some(e.to_string()));
                    }
                    Err(e) => {
                        tracing::error!(stream = %state.id, "stream failed: {e}");
                        state.finish(StreamStatus::Error, Some(e.to_string()));
                    }
                }
            }
        });

        // Replaces any finished stream that still occupied this id.
        if let Some(old) = streams.insert(
            id.clone(),
            StreamEntry {
                state,
                pipeline,
                task,
            },
        ) {
            old.task.abort();
        }

        Ok(id)
    }

    /// Snapshot of one stream.
    #[must_use]
    pub fn stream_info(&self, id: &str) -> Option<StreamInfo> {
        self.lock().get(id).map(|entry| entry.state.info())
    }

    /// Snapshots of all tracked streams.
    #[must_use]
    pub fn list_streams(&self) -> Vec<StreamInfo> {
        self.lock().values().map(|e| e.state.info()).collect()
    }

    /// Buffer and concurrency metrics of one stream's pipeline.
    #[must_use]
    pub fn pipeline_metrics(&self, id: &str) -> Option<PipelineMetrics> {
        self.lock().get(id).map(|e| e.pipeline.metrics())
    }

    /// Counts by status, recomputed from the live map.
    #[must_use]
    pub fn metrics(&self) -> ManagerMetrics {
        let streams = self.lock();
        let mut metrics = ManagerMetrics {
            total: streams.len(),
            ..ManagerMetrics::default()
        };
        for entry in streams.values() {
            match entry.state.status() {
                StreamStatus::Active => metrics.active += 1,
                StreamStatus::Completed => metrics.completed += 1,
                StreamStatus::Error => metrics.error += 1,
                StreamStatus::Timeout => metrics.timeout += 1,
            }
        }
        metrics
    }

    /// Sweep out every stream idle past its staleness horizon.
    ///
    /// Pull-based: nothing runs this unless the caller does. Swept
    /// streams are marked `Timeout`, their tasks aborted, and removed.
    /// Returns how many were cleaned.
    pub fn cleanup_stale_streams(&self) -> usize {
        let mut streams = self.lock();
        let stale: Vec<String> = streams
            .iter()
            .filter(|(_, entry)| {
                entry.state.idle_for()
                    > Duration::from_millis(entry.state.config.timeout_ms)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(entry) = streams.remove(id) {
                entry.state.finish(
                    StreamStatus::Timeout,
                    Some("stale: no activity within timeout".to_string()),
                );
                entry.task.abort();
                tracing::info!(stream = %id, "cleaned up stale stream");
            }
        }
        stale.len()
    }

    /// Stop one stream and forget it: intake ends, queued events are
    /// dropped, in-flight dispatches finish, then the stream task is
    /// awaited. Unknown ids are logged, not an error.
    pub async fn stop_stream(&self, id: &str) {
        let entry = self.lock().remove(id);
        if let Some(entry) = entry {
            entry.pipeline.shutdown();
            if entry.task.await.is_err() {
                tracing::debug!(stream = %id, "stream task did not stop cleanly");
            }
            tracing::debug!(stream = %id, "stream stopped");
        } else {
            tracing::debug!(stream = %id, "stop requested for unknown stream");
        }
    }

    /// Stop every stream the way [`StreamManager::stop_stream`] does,
    /// returning how many were stopped.
    pub async fn stop_all_streams(&self) -> usize {
        let entries: Vec<StreamEntry> = {
            let mut streams = self.lock();
            streams.drain().map(|(_, entry)| entry).collect()
        };
        let stopped = entries.len();
        for entry in &entries {
            entry.pipeline.shutdown();
        }
        for entry in entries {
            if entry.task.await.is_err() {
                tracing::debug!("stream task did not stop cleanly");
            }
        }
        stopped
    }
}
