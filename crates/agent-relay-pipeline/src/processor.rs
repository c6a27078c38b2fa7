//! Rate-limited event processing loop.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use agent_relay_core::{EventSource, HandlerRegistry, RelayConfig, traits::SourceError};
use thiserror::Error;
use tokio::{
    sync::{RwLock, watch},
    task::JoinSet,
    time::MissedTickBehavior,
};

use crate::EventBuffer;

/// Pipeline error.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// `process_event_stream` called while a previous call on the same
    /// pipeline is still running. A programming error, failed fast.
    #[error("Pipeline is already consuming a stream")]
    AlreadyRunning,
    #[error("Event source error: {0}")]
    Source(#[from] SourceError),
}

/// Read-only snapshot of pipeline state, recomputed on every call.
#[derive(Debug, Clone, Copy)]
pub struct PipelineMetrics {
    /// Events currently buffered.
    pub buffered_events: usize,
    /// Dispatches currently in flight.
    pub active_handlers: usize,
    /// Whether the regulator is holding the producer back.
    pub backpressure_active: bool,
}

/// One stream's dispatch pipeline: registry + buffer + rate-limited loop.
///
/// The buffer and registry belong to this pipeline alone; nothing else
/// mutates them while a stream is being consumed.
pub struct EventPipeline {
    config: RelayConfig,
    registry: Arc<RwLock<HandlerRegistry>>,
    buffer: Arc<EventBuffer>,
    running: AtomicBool,
    in_flight: Arc<std::sync::atomic::AtomicUsize>,
    stop: watch::Sender<bool>,
}

/// Clears the running flag even when the consumption future is
/// cancelled mid-race (the timeout coordinator drops it).
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Stops the consumer task when the consumption future is cancelled.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Decrements the in-flight count even when the dispatch is cancelled
/// mid-run, so metrics on a cancelled pipeline settle back to zero.
struct InFlightGuard(Arc<std::sync::atomic::AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EventPipeline {
    /// Create a pipeline from validated configuration.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let buffer = Arc::new(EventBuffer::new(
            config.buffer_size,
            config.backpressure_threshold,
        ));
        let (stop, _) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(RwLock::new(HandlerRegistry::new())),
            buffer,
            running: AtomicBool::new(false),
            in_flight: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            stop,
        }
    }

    /// Request a cooperative stop of the running consumption.
    ///
    /// Intake ends, queued events are discarded, in-flight dispatches
    /// run to completion and `process_event_stream` returns `Ok`. The
    /// request is sticky: a stopped pipeline finishes any later
    /// consumption immediately.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    /// Register a handler on this pipeline's registry.
    pub async fn register_handler(&self, handler: Arc<dyn agent_relay_core::EventHandler>) {
        self.registry.write().await.register(handler);
    }

    /// Remove a handler by name.
    pub async fn unregister_handler(&self, name: &str) {
        self.registry.write().await.unregister(name);
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            buffered_events: self.buffer.len(),
            active_handlers: self.in_flight.load(Ordering::SeqCst),
            backpressure_active: self.buffer.backpressure_active(),
        }
    }

    /// Consume `source` to completion: buffer its events and dispatch
    /// them at the configured rate with bounded concurrency.
    ///
    /// Single consumer entry point per pipeline instance; a concurrent
    /// second call fails fast with [`PipelineError::AlreadyRunning`].
    /// On source exhaustion the loop keeps draining buffered events and
    /// awaits all in-flight dispatches before returning. On source
    /// error or [`EventPipeline::shutdown`], in-flight dispatches are
    /// awaited but buffered events are discarded.
    ///
    /// # Errors
    /// Returns error if re-entered or if the source fails.
    pub async fn process_event_stream<S: EventSource>(
        &self,
        source: S,
    ) -> Result<(), PipelineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        self.run(source).await
    }

    async fn run<S: EventSource>(&self, mut source: S) -> Result<(), PipelineError> {
        // Consumer runs as its own task so backpressure waits on the
        // producer side never stall the draining they depend on.
        let input_closed = Arc::new(AtomicBool::new(false));
        let mut consumer = AbortOnDrop(tokio::spawn(consume_loop(
            Arc::clone(&self.registry),
            Arc::clone(&self.buffer),
            self.config.clone(),
            Arc::clone(&self.in_flight),
            Arc::clone(&input_closed),
        )));

        let mut stop_rx = self.stop.subscribe();
        let mut stopping = false;
        let mut source_result: Result<(), PipelineError> = Ok(());
        loop {
            tokio::select! {
                // Drop the non-Send watch::Ref inside the branch future so
                // the surrounding future stays Send.
                () = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => {
                    stopping = true;
                    break;
                }
                next = source.next_event() => match next {
                    Ok(Some(event)) => {
                        self.buffer.wait_for_capacity().await;
                        self.buffer.push(event);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        source_result = Err(e.into());
                        break;
                    }
                }
            }
        }

        if stopping || source_result.is_err() {
            // Keep in-flight results, drop what is still queued.
            let discarded = self.buffer.clear();
            if discarded > 0 {
                tracing::debug!(discarded, "discarded queued events");
            }
        }
        input_closed.store(true, Ordering::SeqCst);

        if (&mut consumer.0).await.is_err() {
            tracing::debug!("consumer task did not shut down cleanly");
        }
        source_result
    }
}

/// Pulls buffered events at the configured rate and fans them out with
/// bounded concurrency. Exits once the input is closed and both the
/// buffer and the in-flight set are empty.
async fn consume_loop(
    registry: Arc<RwLock<HandlerRegistry>>,
    buffer: Arc<EventBuffer>,
    config: RelayConfig,
    in_flight: Arc<std::sync::atomic::AtomicUsize>,
    input_closed: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(config.tick_period());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut dispatches: JoinSet<()> = JoinSet::new();

    loop {
        interval.tick().await;
        while dispatches.try_join_next().is_some() {}

        if dispatches.len() >= config.max_concurrent_handlers {
            // No free concurrency slot, skip this tick.
            continue;
        }

        let event = {
            let registry = registry.read().await;
            buffer.next_event(&registry)
        };
        if let Some(event) = event {
            let registry = Arc::clone(&registry);
            in_flight.fetch_add(1, Ordering::SeqCst);
            let guard = InFlightGuard(Arc::clone(&in_flight));
            dispatches.spawn(async move {
                let _guard = guard;
                registry.read().await.dispatch(&event).await;
            });
        } else if input_closed.load(Ordering::SeqCst) && dispatches.is_empty() {
            break;
        }
    }

    while dispatches.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use agent_relay_core::{AgentEvent, EventHandler, HandlerError};
    use async_trait::async_trait;

    use super::*;

    struct ScriptedSource {
        events: Vec<AgentEvent>,
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
            if self.events.is_empty() {
                return Ok(None);
            }
            Ok(Some(self.events.remove(0)))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl EventSource for FailingSource {
        async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
            Err(SourceError::Transport("connection reset".into()))
        }
    }

    struct PendingSource;

    #[async_trait]
    impl EventSource for PendingSource {
        async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
            std::future::pending().await
        }
    }

    struct OneThenPending {
        sent: bool,
    }

    #[async_trait]
    impl EventSource for OneThenPending {
        async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
            if self.sent {
                std::future::pending().await
            } else {
                self.sent = true;
                Ok(Some(AgentEvent::new("msg")))
            }
        }
    }

    struct Counter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn priority(&self) -> i32 {
            1
        }

        fn can_handle(&self, event: &AgentEvent) -> bool {
            event.event_type == "msg"
        }

        async fn handle(&self, _event: &AgentEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn small_config() -> RelayConfig {
        RelayConfig {
            buffer_size: 100,
            backpressure_threshold: 50,
            processing_rate_limit: 1000,
            ..RelayConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_every_buffered_event_before_finishing() {
        let pipeline = EventPipeline::new(small_config());
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline
            .register_handler(Arc::new(Counter {
                calls: Arc::clone(&calls),
            }))
            .await;

        let source = ScriptedSource {
            events: (0..25).map(|_| AgentEvent::new("msg")).collect(),
        };
        pipeline.process_event_stream(source).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 25);
        assert_eq!(pipeline.metrics().buffered_events, 0);
        assert_eq!(pipeline.metrics().active_handlers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn source_error_is_fatal_and_propagated() {
        let pipeline = EventPipeline::new(small_config());
        let result = pipeline.process_event_stream(FailingSource).await;
        assert!(matches!(
            result,
            Err(PipelineError::Source(SourceError::Transport(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reentrant_consumption_fails_fast() {
        let pipeline = Arc::new(EventPipeline::new(small_config()));

        let background = Arc::clone(&pipeline);
        let first = tokio::spawn(async move { background.process_event_stream(PendingSource).await });
        tokio::task::yield_now().await;

        let second = pipeline.process_event_stream(PendingSource).await;
        assert!(matches!(second, Err(PipelineError::AlreadyRunning)));

        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_a_pending_source_and_returns_cleanly() {
        let pipeline = Arc::new(EventPipeline::new(small_config()));
        let background = Arc::clone(&pipeline);
        let task = tokio::spawn(async move { background.process_event_stream(PendingSource).await });
        tokio::task::yield_now().await;

        pipeline.shutdown();

        let result = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(pipeline.metrics().buffered_events, 0);
        assert_eq!(pipeline.metrics().active_handlers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_the_in_flight_dispatch() {
        struct SlowHandler {
            started: Arc<AtomicUsize>,
            finished: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl EventHandler for SlowHandler {
            fn name(&self) -> &str {
                "slow"
            }

            fn priority(&self) -> i32 {
                1
            }

            fn can_handle(&self, event: &AgentEvent) -> bool {
                event.event_type == "msg"
            }

            async fn handle(&self, _event: &AgentEvent) -> Result<(), HandlerError> {
                self.started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                self.finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let pipeline = Arc::new(EventPipeline::new(small_config()));
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        pipeline
            .register_handler(Arc::new(SlowHandler {
                started: Arc::clone(&started),
                finished: Arc::clone(&finished),
            }))
            .await;

        let background = Arc::clone(&pipeline);
        let task = tokio::spawn(async move {
            background
                .process_event_stream(OneThenPending { sent: false })
                .await
        });

        let mut dispatching = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if started.load(Ordering::SeqCst) == 1 {
                dispatching = true;
                break;
            }
        }
        assert!(dispatching);

        pipeline.shutdown();
        let result = task.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.metrics().active_handlers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_consumption_settles_the_in_flight_count() {
        struct StallingHandler;

        #[async_trait]
        impl EventHandler for StallingHandler {
            fn name(&self) -> &str {
                "stalling"
            }

            fn priority(&self) -> i32 {
                1
            }

            fn can_handle(&self, event: &AgentEvent) -> bool {
                event.event_type == "msg"
            }

            async fn handle(&self, _event: &AgentEvent) -> Result<(), HandlerError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let pipeline = Arc::new(EventPipeline::new(small_config()));
        pipeline.register_handler(Arc::new(StallingHandler)).await;

        let background = Arc::clone(&pipeline);
        let task = tokio::spawn(async move {
            background
                .process_event_stream(OneThenPending { sent: false })
                .await
        });

        let mut dispatching = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if pipeline.metrics().active_handlers == 1 {
                dispatching = true;
                break;
            }
        }
        assert!(dispatching);

        // Hard cancellation, as the timeout race does it.
        task.abort();

        let mut settled = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if pipeline.metrics().active_handlers == 0 {
                settled = true;
                break;
            }
        }
        assert!(settled);
    }
}
