pub mod backoff;
pub mod channel;
pub mod connector;
pub mod wire;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::EngineError,
    models::{FrameEnvelope, InferenceResult},
};

pub use backoff::Backoff;
pub use channel::{FrameSender, TransportChannel};
pub use connector::{Connector, DuplexConnector, TcpConnector, TransportStream};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Connect attempts allowed per reconnecting episode.
    pub max_retries: u32,
    /// Frames queued for the writer before `send` reports backpressure.
    pub outbound_queue_size: usize,
    /// Fraction of each backoff delay randomised away, in `[0, 1]`.
    pub jitter_ratio: f64,
    pub close_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            max_retries: 5,
            outbound_queue_size: 8,
            jitter_ratio: 0.2,
            close_timeout_ms: 1_000,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.outbound_queue_size == 0 {
            return Err(EngineError::Config(
                "transport.outboundQueueSize must be > 0".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(EngineError::Config(
                "transport.connectTimeoutMs must be > 0".into(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(EngineError::Config(
                "transport.backoffMaxMs must be >= backoffBaseMs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(EngineError::Config(
                "transport.jitterRatio must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl TransportStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TransportStatus::Disconnected => "disconnected",
            TransportStatus::Connecting => "connecting",
            TransportStatus::Connected => "connected",
            TransportStatus::Reconnecting => "reconnecting",
            TransportStatus::Closed => "closed",
        }
    }
}

/// Everything the channel reports upward, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(TransportStatus),
    /// Backend assigned or confirmed this client id.
    Welcome { client_id: String },
    Result(InferenceResult),
    /// A connect attempt or live connection failed; retrying follows.
    Error(String),
    /// Retry budget for the current episode is spent. No further attempts.
    Exhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Error)]
pub enum SendError {
    /// Outbound queue full; the frame is handed back and counted as dropped.
    #[error("outbound queue full, frame {} dropped", .0.sequence_number)]
    Backpressure(FrameEnvelope),
    #[error("transport channel is closed")]
    Closed(FrameEnvelope),
}

impl SendError {
    pub fn into_envelope(self) -> FrameEnvelope {
        match self {
            SendError::Backpressure(envelope) | SendError::Closed(envelope) => envelope,
        }
    }
}
