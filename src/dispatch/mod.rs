pub mod controller;
pub mod dispatcher;
pub mod source;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub use controller::DispatchController;
pub use dispatcher::Dispatcher;
pub use source::{ChannelFrameSource, DirectoryFrameSource, FrameSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    /// Minimum capture-time spacing between two sent frames.
    pub min_interval_ms: u64,
    /// When set, send every N-th captured frame instead of spacing by time.
    pub every_nth: Option<u32>,
    /// Replay cadence of the directory frame source.
    pub source_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 200,
            every_nth: None,
            source_interval_ms: 66,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.every_nth == Some(0) {
            return Err(EngineError::Config("dispatch.everyNth must be > 0".into()));
        }
        if self.source_interval_ms == 0 {
            return Err(EngineError::Config(
                "dispatch.sourceIntervalMs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn rate_policy(&self) -> RatePolicy {
        match self.every_nth {
            Some(n) => RatePolicy::EveryNth(n.max(1)),
            None => RatePolicy::MinInterval(Duration::from_millis(self.min_interval_ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatePolicy {
    MinInterval(Duration),
    EveryNth(u32),
}

/// What happened to one captured frame. Carries its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent(u64),
    Throttled(u64),
    Paused(u64),
    Backpressure(u64),
    Closed(u64),
    /// Not sent because the session loop had no room to hear about it.
    Untracked(u64),
}

/// Told to the session loop so results can be matched to their frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchNotice {
    Dispatched {
        sequence_number: u64,
        captured_at: DateTime<Utc>,
    },
    /// The transport refused the frame after it was announced.
    Withdrawn { sequence_number: u64 },
}
