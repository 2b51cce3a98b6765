use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Tunable thresholds for alert derivation. Frozen for the life of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertConfig {
    /// A gap between consecutive results longer than this ends every running
    /// episode; the next result starts a new one.
    pub gap_reset_ms: u64,

    /// Eyes closed continuously this long raises the eye-closed alert.
    pub eye_closed_alert_ms: u64,

    /// Trailing window over which PERCLOS is computed.
    pub perclos_window_ms: u64,
    /// PERCLOS ratio strictly above this raises the PERCLOS alert.
    pub perclos_threshold: f64,

    /// Minimum continuous yawning before it counts as a yawn.
    pub yawn_alert_ms: u64,

    /// Per-axis head pose out of range this long raises that axis' alert.
    pub head_pose_alert_ms: u64,

    pub gaze_alert_ms: u64,

    pub phone_usage_alert_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            gap_reset_ms: 1_500,
            eye_closed_alert_ms: 1_000,
            perclos_window_ms: 60_000,
            perclos_threshold: 0.15,
            yawn_alert_ms: 1_500,
            head_pose_alert_ms: 2_000,
            gaze_alert_ms: 2_000,
            phone_usage_alert_ms: 1_000,
        }
    }
}

impl AlertConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.gap_reset_ms == 0 {
            return Err(EngineError::Config("alerts.gapResetMs must be > 0".into()));
        }
        if self.perclos_window_ms == 0 {
            return Err(EngineError::Config(
                "alerts.perclosWindowMs must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.perclos_threshold) {
            return Err(EngineError::Config(format!(
                "alerts.perclosThreshold must be in [0, 1), got {}",
                self.perclos_threshold
            )));
        }
        Ok(())
    }
}
