//! Session records and the per-session summary built from their metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Active,
    Completed,
    /// Closed because the transport gave up.
    Failed,
    /// Found open at startup after an unclean shutdown.
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "Active",
            SessionStatus::Completed => "Completed",
            SessionStatus::Failed => "Failed",
            SessionStatus::Interrupted => "Interrupted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub client_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// New open session with a fresh id.
    pub fn start(client_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            started_at,
            ended_at: None,
            duration_ms: None,
            status: SessionStatus::Active,
            created_at: started_at,
            updated_at: started_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Whole-session KPIs. Ratios are over the number of metric records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub record_count: u64,
    pub eye_closed_ratio: f64,
    pub gaze_alert_ratio: f64,
    pub head_pose_alert_ratio: f64,
    pub phone_usage_ratio: f64,
    pub face_missing_ratio: f64,
    pub max_perclos: f64,
    /// Yawn count of the last record, which carries the session total.
    pub total_yawn_count: u32,
    pub ear_trend: Vec<TrendPoint>,
    pub mar_trend: Vec<TrendPoint>,
}
