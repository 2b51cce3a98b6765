mod types;

pub use types::{DispatchMetrics, MetricsSnapshot, ResultTiming};

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::{correlator::CorrelationStats, dispatch::DispatchOutcome, models::CorrelatedResult};

const MAX_RECENT_RESULTS: usize = 20;

/// Engine-wide counters. Cheap to clone; all clones share one state.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

#[derive(Default)]
struct MetricsState {
    dispatch: DispatchMetrics,
    correlation: CorrelationStats,
    recent_results: Vec<ResultTiming>,
    results_processed: u64,
    metrics_persisted: u64,
    persistence_failures: u64,
    transport_errors: u64,
    reconnects: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_dispatch(&self, outcome: DispatchOutcome) {
        let mut state = self.inner.lock().await;
        let dispatch = &mut state.dispatch;
        dispatch.captured += 1;
        match outcome {
            DispatchOutcome::Sent(_) => dispatch.sent += 1,
            DispatchOutcome::Throttled(_) => dispatch.throttled += 1,
            DispatchOutcome::Paused(_) => dispatch.paused += 1,
            DispatchOutcome::Backpressure(_) => dispatch.backpressure += 1,
            DispatchOutcome::Closed(_) => dispatch.closed += 1,
            DispatchOutcome::Untracked(_) => dispatch.untracked += 1,
        }
    }

    /// Correlator stats are owned by the session loop; this mirrors them.
    pub async fn record_correlation(&self, stats: &CorrelationStats) {
        self.inner.lock().await.correlation = stats.clone();
    }

    pub async fn record_result(&self, result: &CorrelatedResult) {
        let now = Utc::now();
        let mut state = self.inner.lock().await;
        state.results_processed += 1;
        state.recent_results.push(ResultTiming {
            sequence_number: result.sequence_number,
            processed_at: now,
            latency_ms: (now - result.timestamp).num_milliseconds(),
        });
        if state.recent_results.len() > MAX_RECENT_RESULTS {
            state.recent_results.remove(0);
        }
    }

    pub async fn record_persisted(&self) {
        self.inner.lock().await.metrics_persisted += 1;
    }

    pub async fn record_persistence_failure(&self) {
        self.inner.lock().await.persistence_failures += 1;
    }

    pub async fn record_transport_error(&self) {
        self.inner.lock().await.transport_errors += 1;
    }

    pub async fn record_reconnect(&self) {
        self.inner.lock().await.reconnects += 1;
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let state = self.inner.lock().await;
        MetricsSnapshot {
            dispatch: state.dispatch.clone(),
            correlation: state.correlation.clone(),
            recent_results: state.recent_results.clone(),
            results_processed: state.results_processed,
            metrics_persisted: state.metrics_persisted,
            persistence_failures: state.persistence_failures,
            transport_errors: state.transport_errors,
            reconnects: state.reconnects,
        }
    }

    pub async fn reset(&self) {
        *self.inner.lock().await = MetricsState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawClassification;

    #[tokio::test]
    async fn counts_dispatch_outcomes() {
        let metrics = MetricsCollector::new();
        metrics.record_dispatch(DispatchOutcome::Sent(0)).await;
        metrics.record_dispatch(DispatchOutcome::Throttled(1)).await;
        metrics.record_dispatch(DispatchOutcome::Paused(2)).await;
        metrics.record_dispatch(DispatchOutcome::Backpressure(3)).await;

        let snapshot = metrics.get_snapshot().await;
        assert_eq!(snapshot.dispatch.captured, 4);
        assert_eq!(snapshot.dispatch.sent, 1);
        assert_eq!(snapshot.dispatch.dropped(), 3);
    }

    #[tokio::test]
    async fn keeps_bounded_recent_results_and_resets() {
        let metrics = MetricsCollector::new();
        for seq in 0..30 {
            metrics
                .record_result(&CorrelatedResult {
                    sequence_number: seq,
                    timestamp: Utc::now(),
                    classification: RawClassification::default(),
                })
                .await;
        }
        let snapshot = metrics.get_snapshot().await;
        assert_eq!(snapshot.results_processed, 30);
        assert_eq!(snapshot.recent_results.len(), MAX_RECENT_RESULTS);
        assert_eq!(snapshot.recent_results[0].sequence_number, 10);

        metrics.reset().await;
        assert_eq!(metrics.get_snapshot().await.results_processed, 0);
    }
}
