use std::fmt;

use chrono::{DateTime, Utc};

/// Encoded camera frame. Not `Clone`: the bytes move from capture to the
/// dispatcher to the transport and are handed back only when a send is refused.
pub struct FramePayload(Vec<u8>);

impl FramePayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for FramePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FramePayload({} bytes)", self.0.len())
    }
}

/// Frame as produced by a frame source, before it has a sequence number.
#[derive(Debug)]
pub struct CapturedFrame {
    pub captured_at: DateTime<Utc>,
    pub payload: FramePayload,
}

impl CapturedFrame {
    pub fn new(captured_at: DateTime<Utc>, bytes: Vec<u8>) -> Self {
        Self {
            captured_at,
            payload: FramePayload::new(bytes),
        }
    }
}

/// Frame tagged for transmission. Never persisted.
#[derive(Debug)]
pub struct FrameEnvelope {
    pub sequence_number: u64,
    pub captured_at: DateTime<Utc>,
    pub payload: FramePayload,
}

impl FrameEnvelope {
    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at.timestamp_millis()
    }
}
