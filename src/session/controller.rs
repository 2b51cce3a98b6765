use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    alerts::{AlertConfig, AlertEngine},
    config::EngineConfig,
    correlator::Correlator,
    db::{MetricRecord, Session, SessionStatus},
    dispatch::{DispatchController, FrameSource},
    error::{EngineError, EngineResult},
    metrics::MetricsCollector,
    recorder::SessionRecorder,
    transport::{Connector, TransportChannel},
};

use super::{
    runtime::{RuntimeExit, SessionRuntime},
    state::{SessionState, SharedState, StatusSnapshot},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const EVENT_QUEUE_SIZE: usize = 256;
const NOTICE_QUEUE_SIZE: usize = 256;
/// Slack on top of the transport's own close budget when waiting for the
/// session loop to finish.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertConfigUpdate {
    /// Takes effect for the next session started.
    Applied,
    /// A session is running; held until it ends.
    Deferred,
}

struct RuntimeHandle {
    cancel_token: CancellationToken,
    handle: JoinHandle<RuntimeExit>,
}

/// Public face of the engine: owns the lifecycle state machine and wires
/// dispatcher, transport, correlator, alert engine and recorder together
/// for each session.
#[derive(Clone)]
pub struct SessionController {
    config: Arc<Mutex<EngineConfig>>,
    pending_alerts: Arc<Mutex<Option<AlertConfig>>>,
    client_id: String,
    shared: Arc<SharedState>,
    recorder: SessionRecorder,
    connector: Arc<dyn Connector>,
    dispatch: Arc<Mutex<DispatchController>>,
    metrics: MetricsCollector,
    runtime: Arc<Mutex<Option<RuntimeHandle>>>,
    /// Serialises start, stop, reset and clear against each other.
    op_lock: Arc<Mutex<()>>,
}

impl SessionController {
    pub fn new(
        config: EngineConfig,
        recorder: SessionRecorder,
        connector: Arc<dyn Connector>,
        source: Box<dyn FrameSource>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));

        Ok(Self {
            config: Arc::new(Mutex::new(config)),
            pending_alerts: Arc::new(Mutex::new(None)),
            shared: Arc::new(SharedState::new(Some(client_id.clone()))),
            client_id,
            recorder,
            connector,
            dispatch: Arc::new(Mutex::new(DispatchController::new(source))),
            metrics: MetricsCollector::new(),
            runtime: Arc::new(Mutex::new(None)),
            op_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub async fn config(&self) -> EngineConfig {
        self.config.lock().await.clone()
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.shared.snapshot().await
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.shared.subscribe_status()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<Option<MetricRecord>> {
        self.shared.subscribe_metrics()
    }

    pub fn latest_metric(&self) -> Option<MetricRecord> {
        self.shared.latest_metric()
    }

    /// Opens a session record and begins connecting. Frames flow once the
    /// transport reports connected.
    pub async fn start(&self) -> EngineResult<Session> {
        let _op = self.op_lock.lock().await;
        let state = self.shared.state().await;
        if state != SessionState::Idle {
            return Err(EngineError::invalid_state("start", state.name()));
        }

        let config = {
            let mut config = self.config.lock().await;
            if let Some(alerts) = self.pending_alerts.lock().await.take() {
                log_info!("applying deferred alert thresholds");
                config.alerts = alerts;
            }
            config.clone()
        };

        let started_at = Utc::now();
        let session = self
            .recorder
            .create_session(&self.client_id, started_at)
            .await?;
        let session_id = session.id.clone();
        self.shared
            .update(|state| {
                state.begin_session(session_id, started_at);
                state.transition_to(SessionState::Connecting, "start")
            })
            .await?;
        self.metrics.reset().await;
        self.shared.publish_metric(None);

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (notices_tx, notices_rx) = mpsc::channel(NOTICE_QUEUE_SIZE);
        let mut transport =
            TransportChannel::open(self.connector.clone(), config.transport.clone(), events_tx);

        let dispatch_started = self.dispatch.lock().await.start(
            &config.dispatch,
            transport.sender(),
            notices_tx,
            self.metrics.clone(),
        );
        if let Err(err) = dispatch_started {
            transport.close().await;
            self.abort_start(&session, &err).await;
            return Err(err);
        }

        let runtime = SessionRuntime {
            session: session.clone(),
            engine: AlertEngine::new(session.id.clone(), config.alerts.clone()),
            correlator: Correlator::new(config.correlation.clone()),
            transport,
            events: events_rx,
            notices: notices_rx,
            dispatch: self.dispatch.clone(),
            recorder: self.recorder.clone(),
            metrics: self.metrics.clone(),
            shared: self.shared.clone(),
            last_activity: started_at,
            ever_connected: false,
        };
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(cancel_token.clone()));
        *self.runtime.lock().await = Some(RuntimeHandle {
            cancel_token,
            handle,
        });

        log_info!(
            "session {} started, connecting to {}",
            session.id,
            self.connector.describe()
        );
        Ok(session)
    }

    /// Ends the running session as completed. Queued frames are flushed and
    /// results already received are processed before the record is closed.
    pub async fn stop(&self) -> EngineResult<Session> {
        let _op = self.op_lock.lock().await;
        match self.terminate("stop").await? {
            Some(RuntimeExit::Stopped(Some(session))) | Some(RuntimeExit::Failed(Some(session))) => {
                Ok(session)
            }
            _ => {
                let reason = self
                    .shared
                    .snapshot()
                    .await
                    .last_error
                    .unwrap_or_else(|| "session could not be closed".to_string());
                Err(EngineError::Persistence(reason))
            }
        }
    }

    /// Leaves the error state so a new session can be started.
    pub async fn reset(&self) -> EngineResult<()> {
        let _op = self.op_lock.lock().await;
        self.reset_locked().await
    }

    /// Deletes every stored session and metric. A running session is ended
    /// first, and an errored controller returns to idle.
    pub async fn clear_all_data(&self) -> EngineResult<usize> {
        let _op = self.op_lock.lock().await;
        match self.shared.state().await {
            state if state.is_stoppable() => {
                if let Err(err) = self.terminate("clear all data").await {
                    log_warn!("ending session before clear failed: {err}");
                }
            }
            SessionState::Error => self.reset_locked().await?,
            _ => {}
        }

        let deleted = self.recorder.delete_all_sessions_and_metrics().await?;
        self.metrics.reset().await;
        self.shared.publish_metric(None);
        self.shared
            .update(|state| state.results_processed = 0)
            .await;
        Ok(deleted)
    }

    /// Replaces alert thresholds. While a session runs the change is held
    /// back so one session never mixes two threshold sets.
    pub async fn update_alert_config(&self, alerts: AlertConfig) -> EngineResult<AlertConfigUpdate> {
        alerts.validate()?;
        let _op = self.op_lock.lock().await;
        match self.shared.state().await {
            SessionState::Idle | SessionState::Error => {
                self.config.lock().await.alerts = alerts;
                *self.pending_alerts.lock().await = None;
                Ok(AlertConfigUpdate::Applied)
            }
            _ => {
                *self.pending_alerts.lock().await = Some(alerts);
                Ok(AlertConfigUpdate::Deferred)
            }
        }
    }

    async fn terminate(&self, operation: &'static str) -> EngineResult<Option<RuntimeExit>> {
        self.shared
            .update(|state| state.transition_to(SessionState::Stopping, operation))
            .await?;

        let exit = self.finish_runtime().await;
        self.shared
            .update(|state| {
                state.end_session();
                state.transition_to(SessionState::Idle, operation)
            })
            .await?;
        Ok(exit)
    }

    async fn reset_locked(&self) -> EngineResult<()> {
        let state = self.shared.state().await;
        if state != SessionState::Error {
            return Err(EngineError::invalid_state("reset", state.name()));
        }
        // The failed loop has already wound itself down; collect it.
        self.finish_runtime().await;
        self.shared
            .update(|state| {
                state.end_session();
                state.last_error = None;
                state.transition_to(SessionState::Idle, "reset")
            })
            .await
    }

    async fn finish_runtime(&self) -> Option<RuntimeExit> {
        let RuntimeHandle {
            cancel_token,
            mut handle,
        } = self.runtime.lock().await.take()?;
        cancel_token.cancel();

        let close_timeout = Duration::from_millis(self.config.lock().await.transport.close_timeout_ms);
        let limit = close_timeout * 2 + STOP_GRACE;
        match timeout(limit, &mut handle).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(err)) => {
                log_warn!("session loop ended abnormally: {err}");
                self.stop_dispatch_after_abort().await;
                None
            }
            Err(_) => {
                log_warn!("session loop did not stop within {}ms, aborting", limit.as_millis());
                handle.abort();
                self.stop_dispatch_after_abort().await;
                None
            }
        }
    }

    async fn stop_dispatch_after_abort(&self) {
        if let Err(err) = self.dispatch.lock().await.stop().await {
            log_warn!("dispatcher did not stop cleanly: {err}");
        }
    }

    async fn abort_start(&self, session: &Session, err: &EngineError) {
        if let Err(close_err) = self
            .recorder
            .close_session(&session.id, Utc::now(), SessionStatus::Failed)
            .await
        {
            log_warn!("could not close aborted session {}: {close_err}", session.id);
        }
        let message = err.to_string();
        let settled = self
            .shared
            .update(|state| {
                state.end_session();
                state.last_error = Some(message);
                state
                    .transition_to(SessionState::Stopping, "start")
                    .and_then(|_| state.transition_to(SessionState::Idle, "start"))
            })
            .await;
        if let Err(err) = settled {
            log_warn!("could not unwind aborted start: {err}");
        }
    }
}
