use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::{
    db::MetricRecord,
    error::{EngineError, EngineResult},
    transport::TransportStatus,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Stopping,
    /// Terminal until `reset()`.
    Error,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Stopping => "stopping",
            SessionState::Error => "error",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Active)
                | (Connecting, Stopping)
                | (Connecting, Error)
                | (Active, Reconnecting)
                | (Active, Stopping)
                | (Reconnecting, Active)
                | (Reconnecting, Stopping)
                | (Reconnecting, Error)
                | (Stopping, Idle)
                | (Error, Idle)
        )
    }

    /// States `stop()` accepts.
    pub fn is_stoppable(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Active | SessionState::Reconnecting
        )
    }
}

/// Read-only projection for the UI layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub session_state: SessionState,
    pub transport_status: Option<TransportStatus>,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub results_processed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    pub state: SessionState,
    pub transport_status: Option<TransportStatus>,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub results_processed: u64,
}

impl ControllerState {
    pub fn transition_to(
        &mut self,
        next: SessionState,
        operation: &'static str,
    ) -> EngineResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::invalid_state(operation, self.state.name()));
        }
        log::info!("session state {} -> {}", self.state.name(), next.name());
        self.state = next;
        Ok(())
    }

    pub fn begin_session(&mut self, session_id: String, started_at: DateTime<Utc>) {
        self.session_id = Some(session_id);
        self.started_at = Some(started_at);
        self.last_error = None;
        self.results_processed = 0;
        self.transport_status = None;
    }

    pub fn end_session(&mut self) {
        self.session_id = None;
        self.started_at = None;
        self.transport_status = None;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            session_state: self.state,
            transport_status: self.transport_status,
            client_id: self.client_id.clone(),
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            last_error: self.last_error.clone(),
            results_processed: self.results_processed,
        }
    }
}

/// Controller state plus the watch channels that project it. Every mutation
/// goes through [`SharedState::update`] so subscribers never miss a change.
pub struct SharedState {
    inner: Mutex<ControllerState>,
    status_tx: watch::Sender<StatusSnapshot>,
    metric_tx: watch::Sender<Option<MetricRecord>>,
}

impl SharedState {
    pub fn new(client_id: Option<String>) -> Self {
        let state = ControllerState {
            client_id,
            ..ControllerState::default()
        };
        let (status_tx, _) = watch::channel(state.snapshot());
        let (metric_tx, _) = watch::channel(None);
        Self {
            inner: Mutex::new(state),
            status_tx,
            metric_tx,
        }
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().await.snapshot()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut ControllerState) -> R) -> R {
        let mut guard = self.inner.lock().await;
        let out = f(&mut guard);
        self.status_tx.send_replace(guard.snapshot());
        out
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<Option<MetricRecord>> {
        self.metric_tx.subscribe()
    }

    pub fn latest_metric(&self) -> Option<MetricRecord> {
        self.metric_tx.borrow().clone()
    }

    pub fn publish_metric(&self, record: Option<MetricRecord>) {
        self.metric_tx.send_replace(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut state = ControllerState::default();
        state.transition_to(SessionState::Connecting, "start").unwrap();
        state.transition_to(SessionState::Active, "connected").unwrap();
        state.transition_to(SessionState::Reconnecting, "disconnected").unwrap();
        state.transition_to(SessionState::Active, "connected").unwrap();
        state.transition_to(SessionState::Stopping, "stop").unwrap();
        state.transition_to(SessionState::Idle, "stop").unwrap();
    }

    #[test]
    fn illegal_transitions_name_operation_and_state() {
        let mut state = ControllerState::default();
        let err = state.transition_to(SessionState::Stopping, "stop").unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidState {
                operation: "stop",
                state: "idle"
            }
        );

        state.transition_to(SessionState::Connecting, "start").unwrap();
        assert!(state.transition_to(SessionState::Connecting, "start").is_err());
        // Exhaustion is only reachable while (re)connecting.
        state.transition_to(SessionState::Active, "connected").unwrap();
        assert!(state.transition_to(SessionState::Error, "exhausted").is_err());
    }

    #[test]
    fn error_only_leaves_through_reset() {
        for next in [
            SessionState::Connecting,
            SessionState::Active,
            SessionState::Stopping,
        ] {
            assert!(!SessionState::Error.can_transition_to(next));
        }
        assert!(SessionState::Error.can_transition_to(SessionState::Idle));
    }

    #[tokio::test]
    async fn update_publishes_snapshot() {
        let shared = SharedState::new(Some("client".into()));
        let mut rx = shared.subscribe_status();
        shared
            .update(|state| {
                state.begin_session("s1".into(), Utc::now());
                state.transition_to(SessionState::Connecting, "start")
            })
            .await
            .unwrap();
        rx.changed().await.unwrap();
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.session_state, SessionState::Connecting);
        assert_eq!(snapshot.session_id.as_deref(), Some("s1"));
        assert_eq!(snapshot.client_id.as_deref(), Some("client"));
    }
}
