//! Bounded event buffer with lossy overflow and two-phase backpressure.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use agent_relay_core::{AgentEvent, HandlerRegistry};

/// Poll interval while waiting for the buffer to drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum time a producer is held back before load is shed.
const MAX_BACKPRESSURE_WAIT: Duration = Duration::from_secs(5);

/// How many of the oldest entries are force-dropped when the wait
/// budget is exhausted.
const FORCED_DROP_BATCH: usize = 100;

/// Bounded buffer between producer and consumer.
///
/// Prefers dropping the oldest buffered event over refusing new data or
/// growing without bound. Backpressure is two-phase: first hold the
/// producer back while polling for a drain, then shed a batch of the
/// oldest entries if the consumer stays behind.
pub struct EventBuffer {
    queue: Mutex<VecDeque<AgentEvent>>,
    capacity: usize,
    threshold: usize,
    backpressure: AtomicBool,
}

impl EventBuffer {
    /// Create a buffer holding at most `capacity` events, activating
    /// backpressure at `threshold`.
    #[must_use]
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            threshold,
            backpressure: AtomicBool::new(false),
        }
    }

    /// Buffer length below which backpressure deactivates.
    fn drain_target(&self) -> usize {
        self.threshold * 4 / 5
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AgentEvent>> {
        // Holders never panic while holding the lock; recover anyway.
        self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append an event, evicting the oldest entry first when full.
    pub fn push(&self, event: AgentEvent) {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            if let Some(evicted) = queue.pop_front() {
                tracing::warn!(
                    event_type = %evicted.event_type,
                    "buffer full, dropping oldest event"
                );
            }
        }
        queue.push_back(event);
        if queue.len() >= self.threshold {
            self.backpressure.store(true, Ordering::SeqCst);
        }
    }

    /// Whether the regulator is currently holding the producer back.
    #[must_use]
    pub fn backpressure_active(&self) -> bool {
        self.backpressure.load(Ordering::SeqCst)
    }

    /// Hold the producer until the buffer drains or the wait budget is
    /// exhausted, then shed load.
    ///
    /// Polls every 100ms for up to 5s. If the buffer is still above the
    /// drain target afterwards, up to [`FORCED_DROP_BATCH`] of the
    /// oldest entries are dropped and backpressure deactivates. Bounds
    /// the worst-case latency added to the producer while preferring to
    /// avoid loss when the consumer is only temporarily slow.
    pub async fn wait_for_capacity(&self) {
        if !self.backpressure_active() {
            return;
        }

        let deadline = tokio::time::Instant::now() + MAX_BACKPRESSURE_WAIT;
        loop {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            if self.lock().len() < self.drain_target() {
                self.backpressure.store(false, Ordering::SeqCst);
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        let dropped = {
            let mut queue = self.lock();
            let dropped = queue.len().min(FORCED_DROP_BATCH);
            queue.drain(..dropped).count()
        };
        tracing::warn!(dropped, "backpressure wait exhausted, shed oldest events");
        self.backpressure.store(false, Ordering::SeqCst);
    }

    /// Remove and return the next event to process.
    ///
    /// Not FIFO under load: the buffer is scanned and the event whose
    /// best-matching handler has the lowest priority value wins.
    /// Unmatched events rank last, ties go to the first scanned entry,
    /// leaving relative buffer order otherwise undisturbed.
    #[must_use]
    pub fn next_event(&self, registry: &HandlerRegistry) -> Option<AgentEvent> {
        let mut queue = self.lock();
        if queue.is_empty() {
            return None;
        }

        let mut best_index = 0;
        let mut best_priority = i64::from(
            registry
                .best_priority(&queue[0])
                .unwrap_or(i32::MAX),
        );
        for (index, event) in queue.iter().enumerate().skip(1) {
            let priority =
                i64::from(registry.best_priority(event).unwrap_or(i32::MAX));
            if priority < best_priority {
                best_priority = priority;
                best_index = index;
            }
        }

        let event = queue.remove(best_index);
        if queue.len() < self.drain_target() {
            self.backpressure.store(false, Ordering::SeqCst);
        }
        event
    }

    /// Current buffer length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop all buffered events, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let discarded = queue.len();
        queue.clear();
        self.backpressure.store(false, Ordering::SeqCst);
        discarded
    }
}
