use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, Mutex},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    alerts::AlertEngine,
    correlator::Correlator,
    db::{MetricRecord, Session, SessionStatus},
    dispatch::{DispatchController, DispatchNotice},
    error::EngineError,
    metrics::MetricsCollector,
    models::CorrelatedResult,
    recorder::SessionRecorder,
    transport::{TransportChannel, TransportEvent, TransportStatus},
};

use super::state::{SessionState, SharedState};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Cadence at which held results are re-checked against the reorder window.
const RELEASE_TICK_MS: u64 = 25;

#[derive(Debug)]
pub enum RuntimeExit {
    /// Stopped on request. `None` when closing the session record failed.
    Stopped(Option<Session>),
    /// Retry budget spent; the session was closed as failed.
    Failed(Option<Session>),
}

enum Flow {
    Continue,
    Exhausted(String),
}

/// The one task that touches a session's derivation state. Correlation,
/// alert derivation and metric writes all happen here, one result at a time.
pub(super) struct SessionRuntime {
    pub session: Session,
    pub engine: AlertEngine,
    pub correlator: Correlator,
    pub transport: TransportChannel,
    pub events: mpsc::Receiver<TransportEvent>,
    pub notices: mpsc::Receiver<DispatchNotice>,
    pub dispatch: Arc<Mutex<DispatchController>>,
    pub recorder: SessionRecorder,
    pub metrics: MetricsCollector,
    pub shared: Arc<SharedState>,
    pub last_activity: DateTime<Utc>,
    pub ever_connected: bool,
}

impl SessionRuntime {
    pub async fn run(mut self, cancel_token: CancellationToken) -> RuntimeExit {
        let mut ticker = tokio::time::interval(Duration::from_millis(RELEASE_TICK_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log_info!("session loop started for {}", self.session.id);

        let failure = loop {
            // Notices are polled before transport events so a frame is always
            // registered before its answer is looked at.
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break None,
                Some(notice) = self.notices.recv() => self.on_notice(notice),
                event = self.events.recv() => {
                    let Some(event) = event else {
                        break Some("transport task ended".to_string());
                    };
                    if let Flow::Exhausted(reason) = self.on_transport_event(event).await {
                        break Some(reason);
                    }
                }
                _ = ticker.tick() => self.release().await,
            }
        };

        match failure {
            None => {
                log_info!("session loop shutting down");
                RuntimeExit::Stopped(self.shutdown(SessionStatus::Completed, Utc::now()).await)
            }
            Some(reason) => self.fail(reason).await,
        }
    }

    fn on_notice(&mut self, notice: DispatchNotice) {
        match notice {
            DispatchNotice::Dispatched {
                sequence_number,
                captured_at,
            } => self
                .correlator
                .register_dispatched(sequence_number, captured_at),
            DispatchNotice::Withdrawn { sequence_number } => {
                self.correlator.withdraw(sequence_number)
            }
        }
    }

    fn drain_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            self.on_notice(notice);
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Status(status) => self.on_status(status).await,
            TransportEvent::Welcome { client_id } => {
                log_info!("backend welcomed client {client_id}");
                self.shared
                    .update(|state| state.client_id = Some(client_id))
                    .await;
            }
            TransportEvent::Result(result) => {
                self.drain_notices();
                self.last_activity = Utc::now();
                // Discards are counted by the correlator.
                let _ = self.correlator.accept(result, Instant::now());
                self.release().await;
                self.metrics.record_correlation(self.correlator.stats()).await;
            }
            TransportEvent::Error(message) => {
                log_warn!("transport error: {message}");
                self.metrics.record_transport_error().await;
                self.shared
                    .update(|state| state.last_error = Some(message))
                    .await;
            }
            TransportEvent::Exhausted {
                attempts,
                last_error,
            } => {
                return Flow::Exhausted(format!(
                    "gave up after {attempts} retries: {last_error}"
                ));
            }
        }
        Flow::Continue
    }

    async fn on_status(&mut self, status: TransportStatus) {
        let next = match status {
            TransportStatus::Connected => Some(SessionState::Active),
            TransportStatus::Reconnecting => Some(SessionState::Reconnecting),
            _ => None,
        };
        let allowed = match next {
            Some(next) => self.shared.state().await.can_transition_to(next),
            None => false,
        };
        // Gate frames before the new state is visible to subscribers.
        if allowed {
            self.dispatch
                .lock()
                .await
                .set_paused(status != TransportStatus::Connected);
        }

        let moved = self
            .shared
            .update(|state| {
                state.transport_status = Some(status);
                match next {
                    Some(next) if allowed => state.transition_to(next, status.name()).is_ok(),
                    _ => false,
                }
            })
            .await;

        if moved && status == TransportStatus::Connected {
            self.last_activity = Utc::now();
            if self.ever_connected {
                self.metrics.record_reconnect().await;
            }
            self.ever_connected = true;
        }
    }

    async fn release(&mut self) {
        let released = self.correlator.release(Instant::now());
        self.process(released).await;
    }

    async fn process(&mut self, released: Vec<CorrelatedResult>) {
        if released.is_empty() {
            return;
        }

        for result in released {
            let derived = match self.engine.process(&result) {
                Ok(derived) => derived,
                Err(err) => {
                    log_warn!("skipping result {}: {err}", result.sequence_number);
                    continue;
                }
            };
            self.metrics.record_result(&result).await;

            let mut record = MetricRecord::new(&self.session.id, &result, derived);
            match self.recorder.append_metric(&record).await {
                Ok(id) => {
                    record.id = Some(id);
                    self.metrics.record_persisted().await;
                }
                Err(err) => {
                    // The session keeps running; the gap shows in the history.
                    self.metrics.record_persistence_failure().await;
                    self.shared
                        .update(|state| state.last_error = Some(err.to_string()))
                        .await;
                }
            }

            log_debug!(
                "result {} processed (perclos {:.3})",
                record.sequence_number,
                record.derived.perclos
            );
            self.shared.publish_metric(Some(record));
            self.shared
                .update(|state| state.results_processed += 1)
                .await;
        }

        self.metrics.record_correlation(self.correlator.stats()).await;
    }

    /// Stops frames, drains held results, flushes the transport and closes
    /// the session record.
    async fn shutdown(&mut self, status: SessionStatus, ended_at: DateTime<Utc>) -> Option<Session> {
        if let Err(err) = self.dispatch.lock().await.stop().await {
            log_warn!("dispatcher did not stop cleanly: {err}");
            self.shared
                .update(|state| state.last_error = Some(err.to_string()))
                .await;
        }

        // Answers read off the wire before the stop still count.
        self.drain_notices();
        self.accept_queued_results();
        let flushed = self.correlator.close();
        self.process(flushed).await;

        // Anything the reader picks up while the connection flushes is late.
        self.transport.close().await;
        self.accept_queued_results();
        self.metrics.record_correlation(self.correlator.stats()).await;

        match self
            .recorder
            .close_session(&self.session.id, ended_at, status)
            .await
        {
            Ok(session) => Some(session),
            Err(err) => {
                self.shared
                    .update(|state| state.last_error = Some(err.to_string()))
                    .await;
                None
            }
        }
    }

    fn accept_queued_results(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let TransportEvent::Result(result) = event {
                let _ = self.correlator.accept(result, Instant::now());
            }
        }
    }

    async fn fail(mut self, reason: String) -> RuntimeExit {
        let error = EngineError::Transport(reason.clone()).to_string();
        let entered_error = self
            .shared
            .update(|state| {
                let entered = state
                    .transition_to(SessionState::Error, "transport exhausted")
                    .is_ok();
                if entered {
                    state.transport_status = Some(TransportStatus::Disconnected);
                    state.last_error = Some(error);
                }
                entered
            })
            .await;
        if !entered_error {
            // A stop is already underway and owns the remaining transitions.
            return RuntimeExit::Stopped(self.shutdown(SessionStatus::Completed, Utc::now()).await);
        }

        log_error!("session {} failed: {reason}", self.session.id);
        let ended_at = self.last_activity;
        RuntimeExit::Failed(self.shutdown(SessionStatus::Failed, ended_at).await)
    }
}
