//! Matches inbound inference results to dispatched frames and releases them
//! to alert derivation in strictly increasing timestamp order.
//!
//! A result waits in a small re-sequencing buffer while an older dispatched
//! frame is still unanswered, but never longer than `reorder_window_ms`.
//! Anything behind the delivery frontier is discarded, never delivered late.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::EngineError,
    models::{CorrelatedResult, InferenceResult},
};

const RECENT_DELIVERED_CAPACITY: usize = 64;
const MAX_INFLIGHT: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorrelationConfig {
    /// Longest a result is held waiting for an older outstanding frame.
    pub reorder_window_ms: u64,
    /// Results behind the frontier by more than this many sequence numbers
    /// are reported as stale rather than unorderable.
    pub stale_tolerance_seq: u64,
    /// How far an echoed timestamp may sit from a frame's capture time and
    /// still be matched to it when no sequence number is echoed.
    pub timestamp_match_tolerance_ms: u64,
    /// Upper bound on held results; the oldest is forced out beyond it.
    pub max_pending: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            reorder_window_ms: 300,
            stale_tolerance_seq: 2,
            timestamp_match_tolerance_ms: 100,
            max_pending: 64,
        }
    }
}

impl CorrelationConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_pending == 0 {
            return Err(EngineError::Config(
                "correlation.maxPending must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Why a result was dropped. Counted, never surfaced as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CorrelationDiscard {
    /// Same sequence number already delivered or already held.
    Duplicate,
    /// Too far behind the delivery frontier.
    Stale,
    /// Slightly behind the frontier, or its timestamp would not increase.
    Unorderable,
    /// Could not be tied to any dispatched frame.
    Unmatched,
    /// Arrived after the session stopped accepting results.
    Late,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationStats {
    pub accepted: u64,
    pub delivered: u64,
    pub duplicate: u64,
    pub stale: u64,
    pub unorderable: u64,
    pub unmatched: u64,
    pub late: u64,
}

impl CorrelationStats {
    pub fn discarded(&self) -> u64 {
        self.duplicate + self.stale + self.unorderable + self.unmatched + self.late
    }

    fn count(&mut self, discard: CorrelationDiscard) {
        match discard {
            CorrelationDiscard::Duplicate => self.duplicate += 1,
            CorrelationDiscard::Stale => self.stale += 1,
            CorrelationDiscard::Unorderable => self.unorderable += 1,
            CorrelationDiscard::Unmatched => self.unmatched += 1,
            CorrelationDiscard::Late => self.late += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InflightFrame {
    captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PendingResult {
    result: CorrelatedResult,
    received_at: Instant,
}

pub struct Correlator {
    config: CorrelationConfig,
    closed: bool,
    inflight: BTreeMap<u64, InflightFrame>,
    pending: BTreeMap<u64, PendingResult>,
    highest_delivered: Option<u64>,
    last_delivered_ms: Option<i64>,
    recent_delivered: VecDeque<u64>,
    stats: CorrelationStats,
}

impl Correlator {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            config,
            closed: false,
            inflight: BTreeMap::new(),
            pending: BTreeMap::new(),
            highest_delivered: None,
            last_delivered_ms: None,
            recent_delivered: VecDeque::with_capacity(RECENT_DELIVERED_CAPACITY),
            stats: CorrelationStats::default(),
        }
    }

    pub fn stats(&self) -> &CorrelationStats {
        &self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Notes a frame handed to the transport so its answer can be matched.
    pub fn register_dispatched(&mut self, sequence_number: u64, captured_at: DateTime<Utc>) {
        if self
            .highest_delivered
            .is_some_and(|highest| sequence_number <= highest)
        {
            return;
        }
        self.inflight
            .insert(sequence_number, InflightFrame { captured_at });
        while self.inflight.len() > MAX_INFLIGHT {
            self.inflight.pop_first();
        }
    }

    /// Forgets a frame the transport refused after it was registered.
    pub fn withdraw(&mut self, sequence_number: u64) {
        self.inflight.remove(&sequence_number);
    }

    /// Takes a raw result into the re-sequencing buffer.
    pub fn accept(
        &mut self,
        result: InferenceResult,
        now: Instant,
    ) -> Result<(), CorrelationDiscard> {
        let outcome = self.try_accept(result, now);
        match outcome {
            Ok(()) => self.stats.accepted += 1,
            Err(discard) => {
                self.stats.count(discard);
                debug!("discarded inference result: {discard:?}");
            }
        }
        outcome
    }

    fn try_accept(
        &mut self,
        result: InferenceResult,
        now: Instant,
    ) -> Result<(), CorrelationDiscard> {
        if self.closed {
            return Err(CorrelationDiscard::Late);
        }

        let sequence_number = match result.sequence_number {
            Some(seq) => seq,
            None => self
                .match_by_timestamp(result.timestamp)
                .ok_or(CorrelationDiscard::Unmatched)?,
        };

        if let Some(highest) = self.highest_delivered {
            if sequence_number <= highest {
                if self.recent_delivered.contains(&sequence_number) {
                    return Err(CorrelationDiscard::Duplicate);
                }
                if highest - sequence_number > self.config.stale_tolerance_seq {
                    return Err(CorrelationDiscard::Stale);
                }
                return Err(CorrelationDiscard::Unorderable);
            }
        }

        if self.pending.contains_key(&sequence_number) {
            return Err(CorrelationDiscard::Duplicate);
        }

        // Only answers to frames still in flight are accepted; the dispatch
        // record is authoritative for capture time.
        let timestamp = self
            .inflight
            .remove(&sequence_number)
            .map(|frame| frame.captured_at)
            .ok_or(CorrelationDiscard::Unmatched)?;

        self.pending.insert(
            sequence_number,
            PendingResult {
                result: CorrelatedResult {
                    sequence_number,
                    timestamp,
                    classification: result.classification,
                },
                received_at: now,
            },
        );
        Ok(())
    }

    fn match_by_timestamp(&self, timestamp: Option<DateTime<Utc>>) -> Option<u64> {
        let target = timestamp?.timestamp_millis();
        self.inflight
            .iter()
            .map(|(seq, frame)| (*seq, (frame.captured_at.timestamp_millis() - target).abs()))
            .filter(|(_, distance)| *distance as u64 <= self.config.timestamp_match_tolerance_ms)
            .min_by_key(|(_, distance)| *distance)
            .map(|(seq, _)| seq)
    }

    /// Releases every held result that may now go out in order.
    pub fn release(&mut self, now: Instant) -> Vec<CorrelatedResult> {
        let window = Duration::from_millis(self.config.reorder_window_ms);
        let mut released = Vec::new();

        while let Some((&seq, _)) = self.pending.first_key_value() {
            let waiting_on_older = self.inflight.range(..seq).next().is_some();
            let overdue = self
                .pending
                .values()
                .any(|p| now.saturating_duration_since(p.received_at) >= window);
            let overflowing = self.pending.len() > self.config.max_pending;

            if waiting_on_older && !overdue && !overflowing {
                break;
            }

            if let Some((_, pending)) = self.pending.pop_first() {
                self.deliver(pending.result, &mut released);
            }
        }

        released
    }

    /// Stops accepting results and releases everything still held, in order.
    pub fn close(&mut self) -> Vec<CorrelatedResult> {
        self.closed = true;
        let mut released = Vec::new();
        while let Some((_, pending)) = self.pending.pop_first() {
            self.deliver(pending.result, &mut released);
        }
        self.inflight.clear();
        released
    }

    fn deliver(&mut self, result: CorrelatedResult, released: &mut Vec<CorrelatedResult>) {
        let seq = result.sequence_number;
        let ts = result.timestamp_ms();

        // Older outstanding frames can no longer be delivered in order.
        match seq.checked_add(1) {
            Some(next) => self.inflight = self.inflight.split_off(&next),
            None => self.inflight.clear(),
        }

        if self.last_delivered_ms.is_some_and(|last| ts <= last) {
            self.stats.count(CorrelationDiscard::Unorderable);
            debug!("discarded result {seq}: timestamp {ts} does not advance");
            return;
        }

        self.highest_delivered = Some(seq);
        self.last_delivered_ms = Some(ts);
        if self.recent_delivered.len() == RECENT_DELIVERED_CAPACITY {
            self.recent_delivered.pop_front();
        }
        self.recent_delivered.push_back(seq);
        self.stats.delivered += 1;
        released.push(result);
    }
}
