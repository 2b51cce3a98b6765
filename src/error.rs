//! Error taxonomy surfaced by the session engine.

use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Operation is not legal from the controller's current state.
    #[error("{operation} is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Connect, send or disconnect failure after the retry budget is spent.
    #[error("transport error: {0}")]
    Transport(String),

    /// A session or metric write failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("config error: {0}")]
    Config(String),

    /// The frame source was not returned by the previous dispatcher run.
    #[error("frame source unavailable")]
    FrameSourceUnavailable,
}

impl EngineError {
    pub fn invalid_state(operation: &'static str, state: &'static str) -> Self {
        Self::InvalidState { operation, state }
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}
