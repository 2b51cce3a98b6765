//! Persistence boundary for sessions and metric records, plus change
//! notifications for anything that wants to observe stored data.

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    db::{Database, MetricRecord, Session, SessionStatus, SessionSummary},
    error::{EngineError, EngineResult},
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecorderEvent {
    SessionCreated {
        session: Session,
    },
    #[serde(rename_all = "camelCase")]
    MetricAppended {
        session_id: String,
        metric_id: i64,
        timestamp: DateTime<Utc>,
    },
    SessionClosed {
        session: Session,
    },
    #[serde(rename_all = "camelCase")]
    Cleared {
        sessions_deleted: usize,
    },
}

#[derive(Clone)]
pub struct SessionRecorder {
    db: Database,
    events: broadcast::Sender<RecorderEvent>,
}

impl SessionRecorder {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { db, events }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Change events. Slow subscribers miss events rather than stall writes.
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    pub async fn create_session(
        &self,
        client_id: &str,
        started_at: DateTime<Utc>,
    ) -> EngineResult<Session> {
        let session = Session::start(client_id, started_at);
        self.db
            .insert_session(&session)
            .await
            .map_err(|err| self.failed("create session", err))?;
        info!("session {} opened for client {client_id}", session.id);
        self.notify(RecorderEvent::SessionCreated {
            session: session.clone(),
        });
        Ok(session)
    }

    pub async fn append_metric(&self, record: &MetricRecord) -> EngineResult<i64> {
        let metric_id = self
            .db
            .insert_metric(record)
            .await
            .map_err(|err| self.failed("append metric", err))?;
        self.notify(RecorderEvent::MetricAppended {
            session_id: record.session_id.clone(),
            metric_id,
            timestamp: record.timestamp,
        });
        Ok(metric_id)
    }

    pub async fn close_session(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        status: SessionStatus,
    ) -> EngineResult<Session> {
        let session = self
            .db
            .close_session(session_id, ended_at, status)
            .await
            .map_err(|err| self.failed("close session", err))?;
        info!(
            "session {} closed as {} after {}ms",
            session.id,
            session.status.as_str(),
            session.duration_ms.unwrap_or(0)
        );
        self.notify(RecorderEvent::SessionClosed {
            session: session.clone(),
        });
        Ok(session)
    }

    pub async fn delete_all_sessions_and_metrics(&self) -> EngineResult<usize> {
        let sessions_deleted = self
            .db
            .delete_all_sessions_and_metrics()
            .await
            .map_err(|err| self.failed("delete all data", err))?;
        info!("deleted {sessions_deleted} sessions and their metrics");
        self.notify(RecorderEvent::Cleared { sessions_deleted });
        Ok(sessions_deleted)
    }

    /// Closes sessions left open by a previous process.
    pub async fn recover_interrupted(&self) -> EngineResult<Vec<Session>> {
        let recovered = self
            .db
            .recover_interrupted_sessions()
            .await
            .map_err(|err| self.failed("recover sessions", err))?;
        for session in &recovered {
            info!("marked session {} as interrupted", session.id);
            self.notify(RecorderEvent::SessionClosed {
                session: session.clone(),
            });
        }
        Ok(recovered)
    }

    pub async fn list_sessions(&self) -> EngineResult<Vec<Session>> {
        self.db.list_sessions().await.map_err(EngineError::persistence)
    }

    pub async fn get_session(&self, session_id: &str) -> EngineResult<Option<Session>> {
        self.db
            .get_session(session_id)
            .await
            .map_err(EngineError::persistence)
    }

    pub async fn get_metrics_for_session(&self, session_id: &str) -> EngineResult<Vec<MetricRecord>> {
        self.db
            .get_metrics_for_session(session_id)
            .await
            .map_err(EngineError::persistence)
    }

    pub async fn summarize_session(&self, session_id: &str) -> EngineResult<SessionSummary> {
        self.db
            .summarize_session(session_id)
            .await
            .map_err(EngineError::persistence)
    }

    fn failed(&self, operation: &str, err: anyhow::Error) -> EngineError {
        error!("{operation} failed: {err:#}");
        EngineError::persistence(err.context(operation.to_string()))
    }

    fn notify(&self, event: RecorderEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
