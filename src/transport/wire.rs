//! Length-prefixed framing for the backend stream.
//!
//! Each message is `u32 BE header length`, a JSON header, `u32 BE payload
//! length`, then the payload bytes. Results and control messages carry an
//! empty payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::models::{FrameEnvelope, InferenceResult};

/// Headers are small JSON objects; anything larger is a broken peer.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Encoded camera frames stay well under this.
pub const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header length {0} exceeds {MAX_HEADER_LEN}")]
    HeaderTooLarge(usize),
    #[error("payload length {0} exceeds {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(usize),
    #[error("malformed header: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Header {
    #[serde(rename_all = "camelCase")]
    Frame { seq: u64, captured_at: i64 },
    Result(InferenceResult),
    #[serde(rename_all = "camelCase")]
    Welcome { client_id: String },
    Error { message: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn control(header: Header) -> Self {
        Self {
            header,
            payload: Vec::new(),
        }
    }
}

pub fn frame_header(envelope: &FrameEnvelope) -> Header {
    Header::Frame {
        seq: envelope.sequence_number,
        captured_at: envelope.captured_at_ms(),
    }
}

pub fn encode(header: &Header, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let header_bytes = serde_json::to_vec(header)?;
    if header_bytes.len() > MAX_HEADER_LEN {
        return Err(WireError::HeaderTooLarge(header_bytes.len()));
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let mut out = Vec::with_capacity(8 + header_bytes.len() + payload.len());
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub async fn write_message<W>(writer: &mut W, header: &Header, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode(header, payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_frame<W>(writer: &mut W, envelope: &FrameEnvelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_message(writer, &frame_header(envelope), envelope.payload.as_bytes()).await
}

/// Reads one message. `Ok(None)` means the peer closed the stream between
/// messages.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<WireMessage>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let header_len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if header_len > MAX_HEADER_LEN {
        return Err(WireError::HeaderTooLarge(header_len));
    }
    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes).await?;

    let payload_len = reader.read_u32().await? as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(payload_len));
    }
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    let header = serde_json::from_slice(&header_bytes)?;
    Ok(Some(WireMessage { header, payload }))
}
