//! Per-frame inference output as delivered by the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Detection and landmark geometry, kept only for overlay rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FaceGeometry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_box: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub landmarks: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phone_boxes: Vec<BoundingBox>,
}

/// Raw, noisy, single-frame classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RawClassification {
    pub face_detected: bool,

    pub ear: Option<f64>,
    pub eye_closed: bool,

    pub mar: Option<f64>,
    pub yawning: bool,

    pub yaw: Option<f64>,
    pub pitch: Option<f64>,
    pub roll: Option<f64>,
    pub yaw_out_of_range: bool,
    pub pitch_out_of_range: bool,
    pub roll_out_of_range: bool,

    pub gaze_off_road: bool,
    pub phone_in_frame: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<FaceGeometry>,
}

impl RawClassification {
    pub fn face_missing(&self) -> bool {
        !self.face_detected
    }

    pub fn head_pose_out_of_range(&self) -> bool {
        self.yaw_out_of_range || self.pitch_out_of_range || self.roll_out_of_range
    }
}

/// Inference result as received. The backend may echo the sequence number,
/// only an approximate capture timestamp, or both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    #[serde(default, rename = "seq", skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub classification: RawClassification,
}

impl InferenceResult {
    pub fn for_sequence(sequence_number: u64, classification: RawClassification) -> Self {
        Self {
            sequence_number: Some(sequence_number),
            timestamp: None,
            classification,
        }
    }
}

/// Result matched to a dispatched frame and released in timestamp order.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedResult {
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub classification: RawClassification,
}

impl CorrelatedResult {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}
