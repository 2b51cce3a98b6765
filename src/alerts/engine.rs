use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::CorrelatedResult;

use super::{AlertConfig, PerclosWindow, SustainedCondition};

/// Fields derived for one result. Pure function of the result and the
/// engine state before it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetrics {
    pub face_missing_sustained_ms: u64,

    pub eye_closed_sustained_ms: u64,
    pub eye_closed_alert: bool,
    pub perclos: f64,
    pub perclos_alert: bool,

    pub yawn_sustained_ms: u64,
    pub yawn_alert: bool,
    pub yawn_count: u32,

    pub head_pose_sustained_ms: u64,
    pub yaw_alert: bool,
    pub pitch_alert: bool,
    pub roll_alert: bool,

    pub gaze_sustained_ms: u64,
    pub gaze_alert: bool,

    pub phone_usage_sustained_ms: u64,
    pub phone_usage_alert: bool,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("result at {got_ms}ms is not after the previous result at {last_ms}ms")]
pub struct OutOfOrder {
    pub last_ms: i64,
    pub got_ms: i64,
}

/// Per-session derivation state. One instance per session, never shared.
#[derive(Debug, Clone)]
pub struct AlertEngine {
    session_id: String,
    config: AlertConfig,

    face_missing: SustainedCondition,
    eye_closed: SustainedCondition,
    yawn: SustainedCondition,
    head_pose: SustainedCondition,
    yaw: SustainedCondition,
    pitch: SustainedCondition,
    roll: SustainedCondition,
    gaze: SustainedCondition,
    phone: SustainedCondition,
    perclos: PerclosWindow,

    yawn_count: u32,
    last_timestamp_ms: Option<i64>,
    processed: u64,
}

impl AlertEngine {
    pub fn new(session_id: impl Into<String>, config: AlertConfig) -> Self {
        let gap = config.gap_reset_ms;
        Self {
            session_id: session_id.into(),
            // Face-missing has no alert of its own; it only tracks duration.
            face_missing: SustainedCondition::new(u64::MAX, gap),
            eye_closed: SustainedCondition::new(config.eye_closed_alert_ms, gap),
            yawn: SustainedCondition::new(config.yawn_alert_ms, gap),
            head_pose: SustainedCondition::new(config.head_pose_alert_ms, gap),
            yaw: SustainedCondition::new(config.head_pose_alert_ms, gap),
            pitch: SustainedCondition::new(config.head_pose_alert_ms, gap),
            roll: SustainedCondition::new(config.head_pose_alert_ms, gap),
            gaze: SustainedCondition::new(config.gaze_alert_ms, gap),
            phone: SustainedCondition::new(config.phone_usage_alert_ms, gap),
            perclos: PerclosWindow::new(config.perclos_window_ms),
            yawn_count: 0,
            last_timestamp_ms: None,
            processed: 0,
            config,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn yawn_count(&self) -> u32 {
        self.yawn_count
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Advances every metric by one result. Results must arrive with strictly
    /// increasing timestamps.
    pub fn process(&mut self, result: &CorrelatedResult) -> Result<DerivedMetrics, OutOfOrder> {
        let ts = result.timestamp_ms();
        if let Some(last_ms) = self.last_timestamp_ms {
            if ts <= last_ms {
                return Err(OutOfOrder { last_ms, got_ms: ts });
            }
        }
        self.last_timestamp_ms = Some(ts);
        self.processed += 1;

        let raw = &result.classification;
        // Without a face the face-derived flags carry no evidence.
        let face = raw.face_detected;

        let face_missing = self.face_missing.update(ts, raw.face_missing());

        let eye = self.eye_closed.update(ts, face && raw.eye_closed);
        if eye.accumulated_ms > 0 {
            self.perclos
                .record_closed(ts - eye.accumulated_ms as i64, ts);
        }
        let perclos = self.perclos.ratio_at(ts);

        let yawn = self.yawn.update(ts, face && raw.yawning);
        if yawn.rising_edge {
            self.yawn_count = self.yawn_count.saturating_add(1);
        }

        let head_pose = self.head_pose.update(ts, face && raw.head_pose_out_of_range());
        let yaw = self.yaw.update(ts, face && raw.yaw_out_of_range);
        let pitch = self.pitch.update(ts, face && raw.pitch_out_of_range);
        let roll = self.roll.update(ts, face && raw.roll_out_of_range);

        let gaze = self.gaze.update(ts, face && raw.gaze_off_road);
        let phone = self.phone.update(ts, raw.phone_in_frame);

        Ok(DerivedMetrics {
            face_missing_sustained_ms: face_missing.sustained_ms,
            eye_closed_sustained_ms: eye.sustained_ms,
            eye_closed_alert: eye.alert,
            perclos,
            perclos_alert: perclos > self.config.perclos_threshold,
            yawn_sustained_ms: yawn.sustained_ms,
            yawn_alert: yawn.alert,
            yawn_count: self.yawn_count,
            head_pose_sustained_ms: head_pose.sustained_ms,
            yaw_alert: yaw.alert,
            pitch_alert: pitch.alert,
            roll_alert: roll.alert,
            gaze_sustained_ms: gaze.sustained_ms,
            gaze_alert: gaze.alert,
            phone_usage_sustained_ms: phone.sustained_ms,
            phone_usage_alert: phone.alert,
        })
    }

    /// Drops all timers, windows and counters; thresholds are kept.
    pub fn reset(&mut self) {
        *self = Self::new(self.session_id.clone(), self.config.clone());
    }
}
