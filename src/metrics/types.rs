use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlator::CorrelationStats;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMetrics {
    /// Every frame pulled from the source, sent or not.
    pub captured: u64,
    pub sent: u64,
    pub throttled: u64,
    /// Dropped while the transport was reconnecting.
    pub paused: u64,
    pub backpressure: u64,
    /// Dropped because the transport had already shut down.
    pub closed: u64,
    /// Dropped because the session loop's notice queue was full.
    pub untracked: u64,
}

impl DispatchMetrics {
    pub fn dropped(&self) -> u64 {
        self.throttled + self.paused + self.backpressure + self.closed + self.untracked
    }
}

/// Capture-to-derivation latency of one delivered result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultTiming {
    pub sequence_number: u64,
    pub processed_at: DateTime<Utc>,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub dispatch: DispatchMetrics,
    pub correlation: CorrelationStats,
    pub recent_results: Vec<ResultTiming>,
    pub results_processed: u64,
    pub metrics_persisted: u64,
    pub persistence_failures: u64,
    pub transport_errors: u64,
    pub reconnects: u64,
}
