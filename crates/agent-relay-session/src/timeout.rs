//! Inactivity timeout coordination.
//!
//! Races one pipeline's consumption loop against a resettable timer.
//! The timer is pushed back by every event the correlator yields and by
//! every transport-level heartbeat; if it fires first, the consumption
//! future is cancelled, the remote session is aborted best-effort, and
//! a timeout error is surfaced.

use std::time::Duration;

use agent_relay_core::{AgentEvent, EventSource, SessionControl, traits::SourceError};
use agent_relay_pipeline::{EventPipeline, PipelineError};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

/// Terminal error of one session's stream.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session reported a semantic error event.
    #[error("Session failed: {0}")]
    SessionFailed(String),
    /// The event source itself broke.
    #[error("Event source error: {0}")]
    Source(SourceError),
    /// The pipeline rejected or failed the consumption.
    #[error("Pipeline error: {0}")]
    Pipeline(PipelineError),
    /// No event or heartbeat arrived within the inactivity window.
    #[error("Session timed out after {after:?} of inactivity")]
    Timeout { after: Duration },
}

/// Wraps a source and pings a watch channel on every yielded event so
/// the timer race can observe activity.
struct ActivitySource<S> {
    inner: S,
    seen: u64,
    activity: watch::Sender<u64>,
}

#[async_trait]
impl<S: EventSource> EventSource for ActivitySource<S> {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
        let next = self.inner.next_event().await;
        if matches!(next, Ok(Some(_))) {
            self.seen += 1;
            let _ = self.activity.send(self.seen);
        }
        next
    }

    fn heartbeats(&self) -> Option<watch::Receiver<u64>> {
        self.inner.heartbeats()
    }
}

fn map_pipeline_error(error: PipelineError) -> SessionError {
    match error {
        PipelineError::Source(SourceError::Session(detail)) => {
            SessionError::SessionFailed(detail)
        }
        PipelineError::Source(e) => SessionError::Source(e),
        e => SessionError::Pipeline(e),
    }
}

/// Consume `source` through `pipeline` under an inactivity timeout.
///
/// Whichever side finishes first wins: consumption completing (idle,
/// error or exhaustion) cancels the timer and its result is discarded;
/// the timer firing cancels consumption, requests exactly one abort of
/// the remote session (a failed abort is logged, never raised) and
/// returns [`SessionError::Timeout`].
///
/// # Errors
/// Returns error on session failure, source failure, pipeline
/// re-entry or inactivity timeout.
pub async fn drive_session<S, C>(
    pipeline: &EventPipeline,
    source: S,
    control: &C,
    session_id: &str,
    idle_timeout: Duration,
) -> Result<(), SessionError>
where
    S: EventSource,
    C: SessionControl + ?Sized,
{
    // A silent transport still resets the timer via protocol pings.
    // The dummy sender stays in scope so its channel never closes.
    let (_hb_keepalive, mut heartbeat_rx) = match source.heartbeats() {
        Some(rx) => (None, rx),
        None => {
            let (tx, rx) = watch::channel(0u64);
            (Some(tx), rx)
        }
    };

    let (activity_tx, mut activity_rx) = watch::channel(0u64);
    let tracked = ActivitySource {
        inner: source,
        seen: 0,
        activity: activity_tx,
    };

    let consume = pipeline.process_event_stream(tracked);
    tokio::pin!(consume);
    let sleep = tokio::time::sleep(idle_timeout);
    tokio::pin!(sleep);

    let mut activity_open = true;
    let mut heartbeats_open = true;

    loop {
        tokio::select! {
            result = &mut consume => {
                return result.map_err(map_pipeline_error);
            }
            changed = activity_rx.changed(), if activity_open => {
                if changed.is_ok() {
                    sleep.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                } else {
                    activity_open = false;
                }
            }
            changed = heartbeat_rx.changed(), if heartbeats_open => {
                if changed.is_ok() {
                    tracing::trace!(session_id, "heartbeat, resetting inactivity timer");
                    sleep.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                } else {
                    heartbeats_open = false;
                }
            }
            () = &mut sleep => {
                if let Err(e) = control.abort(session_id).await {
                    tracing::warn!(session_id, "abort after timeout failed: {e}");
                }
                return Err(SessionError::Timeout { after: idle_timeout });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use agent_relay_core::{RelayConfig, traits::SessionControlError};
    use serde_json::Value;

    use super::*;

    struct SilentSource {
        heartbeat_rx: Option<watch::Receiver<u64>>,
    }

    #[async_trait]
    impl EventSource for SilentSource {
        async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
            // Never resolves; drive_session must cancel it on timeout.
            std::future::pending().await
        }

        fn heartbeats(&self) -> Option<watch::Receiver<u64>> {
            self.heartbeat_rx.clone()
        }
    }

    struct EndingSource {
        ends_after: Duration,
    }

    #[async_trait]
    impl EventSource for EndingSource {
        async fn next_event(&mut self) -> Result<Option<AgentEvent>, SourceError> {
            tokio::time::sleep(self.ends_after).await;
            Ok(None)
        }
    }

    struct MockControl {
        aborts: AtomicUsize,
        fail_abort: bool,
    }

    impl MockControl {
        fn new(fail_abort: bool) -> Arc<Self> {
            Arc::new(Self {
                aborts: AtomicUsize::new(0),
                fail_abort,
            })
        }
    }

    #[async_trait]
    impl SessionControl for MockControl {
        async fn create(&self, _params: Value) -> Result<String, SessionControlError> {
            Ok("ses_mock".to_string())
        }

        async fn submit(
            &self,
            _session_id: &str,
            _payload: Value,
        ) -> Result<(), SessionControlError> {
            Ok(())
        }

        async fn abort(&self, session_id: &str) -> Result<(), SessionControlError> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            if self.fail_abort {
                return Err(SessionControlError::NotFound(session_id.to_string()));
            }
            Ok(())
        }
    }

    fn pipeline() -> EventPipeline {
        EventPipeline::new(RelayConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_source_times_out_with_exactly_one_abort() {
        let control = MockControl::new(false);
        let result = drive_session(
            &pipeline(),
            SilentSource { heartbeat_rx: None },
            control.as_ref(),
            "ses_1",
            Duration::from_secs(30),
        )
        .await;

        assert!(matches!(
            result,
            Err(SessionError::Timeout { after }) if after == Duration::from_secs(30)
        ));
        assert_eq!(control.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_abort_still_surfaces_the_timeout() {
        let control = MockControl::new(true);
        let result = drive_session(
            &pipeline(),
            SilentSource { heartbeat_rx: None },
            control.as_ref(),
            "ses_1",
            Duration::from_secs(10),
        )
        .await;

        assert!(matches!(result, Err(SessionError::Timeout { .. })));
        assert_eq!(control.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_a_silent_session_alive() {
        let timeout = Duration::from_secs(10);
        let (hb_tx, hb_rx) = watch::channel(0u64);

        // Ping every timeout/2 until well past 3x the timeout.
        tokio::spawn(async move {
            for tick in 1u64..=8 {
                tokio::time::sleep(timeout / 2).await;
                if hb_tx.send(tick).is_err() {
                    break;
                }
            }
        });

        let control = MockControl::new(false);
        let started = tokio::time::Instant::now();
        let result = drive_session(
            &pipeline(),
            SilentSource {
                heartbeat_rx: Some(hb_rx),
            },
            control.as_ref(),
            "ses_1",
            timeout,
        )
        .await;

        // 8 pings at timeout/2 spacing cover 4x the timeout window, but
        // the 9th never comes: the session then times out, proving the
        // earlier pings were what kept it alive.
        assert!(matches!(result, Err(SessionError::Timeout { .. })));
        assert!(started.elapsed() >= 3 * timeout);
        assert_eq!(control.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_wins_the_race_and_discards_the_timer() {
        let control = MockControl::new(false);
        let result = drive_session(
            &pipeline(),
            EndingSource {
                ends_after: Duration::from_secs(5),
            },
            control.as_ref(),
            "ses_1",
            Duration::from_secs(30),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(control.aborts.load(Ordering::SeqCst), 0);
    }
}
