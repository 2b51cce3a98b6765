use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    metrics::MetricsCollector,
    models::{CapturedFrame, FrameEnvelope},
    transport::{FrameSender, SendError},
};

use super::{DispatchNotice, DispatchOutcome, FrameSource, RatePolicy};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Decides which captured frames are worth sending.
#[derive(Debug, Clone)]
struct RateLimiter {
    policy: RatePolicy,
    last_sent_at: Option<DateTime<Utc>>,
    since_last_sent: u32,
}

impl RateLimiter {
    fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            last_sent_at: None,
            since_last_sent: 0,
        }
    }

    fn admit(&mut self, captured_at: DateTime<Utc>) -> bool {
        let admitted = match self.policy {
            RatePolicy::EveryNth(n) => self.since_last_sent % n == 0,
            RatePolicy::MinInterval(min) => match self.last_sent_at {
                None => true,
                // A clock step backwards re-anchors instead of stalling.
                Some(last) => match (captured_at - last).to_std() {
                    Ok(elapsed) => elapsed >= min,
                    Err(_) => true,
                },
            },
        };

        if admitted {
            self.last_sent_at = Some(captured_at);
            self.since_last_sent = 1;
        } else {
            self.since_last_sent = self.since_last_sent.saturating_add(1);
        }
        admitted
    }

    /// Refused frames do not count as sent for spacing purposes.
    fn revoke(&mut self, previous: Option<DateTime<Utc>>) {
        self.last_sent_at = previous;
    }
}

/// Tags captured frames with sequence numbers and hands the admitted ones
/// to the transport. Never blocks on the network.
pub struct Dispatcher {
    limiter: RateLimiter,
    next_sequence: u64,
    frames: FrameSender,
    notices: mpsc::Sender<DispatchNotice>,
    paused: watch::Receiver<bool>,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(
        policy: RatePolicy,
        frames: FrameSender,
        notices: mpsc::Sender<DispatchNotice>,
        paused: watch::Receiver<bool>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(policy),
            next_sequence: 0,
            frames,
            notices,
            paused,
            metrics,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Processes one captured frame. Every frame consumes a sequence number,
    /// whether or not it is sent.
    pub async fn offer(&mut self, frame: CapturedFrame) -> DispatchOutcome {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;

        let outcome = self.route(sequence_number, frame);
        self.metrics.record_dispatch(outcome).await;
        outcome
    }

    fn route(&mut self, sequence_number: u64, frame: CapturedFrame) -> DispatchOutcome {
        if *self.paused.borrow() {
            return DispatchOutcome::Paused(sequence_number);
        }

        let previous = self.limiter.last_sent_at;
        if !self.limiter.admit(frame.captured_at) {
            return DispatchOutcome::Throttled(sequence_number);
        }

        // Room for the announcement and a possible withdrawal is taken up
        // front, so a frame is never on the wire without the session loop
        // knowing about it.
        let (Ok(announce), Ok(withdraw)) =
            (self.notices.try_reserve(), self.notices.try_reserve())
        else {
            self.limiter.revoke(previous);
            log_warn!("frame {sequence_number} dropped: session loop is behind");
            return DispatchOutcome::Untracked(sequence_number);
        };

        // Announce before sending so the result can never overtake it.
        announce.send(DispatchNotice::Dispatched {
            sequence_number,
            captured_at: frame.captured_at,
        });

        let envelope = FrameEnvelope {
            sequence_number,
            captured_at: frame.captured_at,
            payload: frame.payload,
        };
        match self.frames.send(envelope) {
            Ok(()) => DispatchOutcome::Sent(sequence_number),
            Err(err) => {
                self.limiter.revoke(previous);
                withdraw.send(DispatchNotice::Withdrawn { sequence_number });
                match err {
                    SendError::Backpressure(_) => DispatchOutcome::Backpressure(sequence_number),
                    SendError::Closed(_) => DispatchOutcome::Closed(sequence_number),
                }
            }
        }
    }

    /// Pulls frames until the source ends or the token fires, then hands the
    /// source back so a later session can restart it.
    pub async fn run(
        mut self,
        mut source: Box<dyn FrameSource>,
        cancel_token: CancellationToken,
    ) -> Box<dyn FrameSource> {
        log_info!("dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    log_info!("dispatcher shutting down after {} frames", self.next_sequence);
                    break;
                }
                frame = source.next_frame() => {
                    let Some(frame) = frame else {
                        log_warn!("frame source ended");
                        break;
                    };
                    match self.offer(frame).await {
                        DispatchOutcome::Sent(seq) => log_debug!("dispatched frame {seq}"),
                        DispatchOutcome::Backpressure(seq) => log_debug!("frame {seq} dropped: transport busy"),
                        _ => {}
                    }
                }
            }
        }
        source
    }
}
