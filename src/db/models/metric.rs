use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    alerts::DerivedMetrics,
    models::{CorrelatedResult, RawClassification},
};

/// One processed result: raw classification plus what the alert engine
/// derived from it. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub id: Option<i64>,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
    pub raw: RawClassification,
    pub derived: DerivedMetrics,
}

impl MetricRecord {
    pub fn new(session_id: impl Into<String>, result: &CorrelatedResult, derived: DerivedMetrics) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            timestamp: result.timestamp,
            sequence_number: result.sequence_number,
            raw: result.classification.clone(),
            derived,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}
