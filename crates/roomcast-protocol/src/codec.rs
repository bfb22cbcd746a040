//! JSON codec for roomcast frames.
//!
//! Client frames travel as WebSocket text frames, bus envelopes as raw
//! bytes. Both use the same JSON representation.

use bytes::Bytes;
use thiserror::Error;

use crate::frames::{BusEnvelope, ClientFrame, ServerEvent};

/// Default maximum size of an inbound client frame (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Observed size in bytes.
        size: usize,
        /// Configured limit in bytes.
        max: usize,
    },

    /// Message content is empty or whitespace only.
    #[error("Message content cannot be empty")]
    EmptyContent,

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an event into the text sent to clients.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an event from client-facing text.
///
/// # Errors
///
/// Returns an error if the text is not a valid event.
pub fn decode_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a text frame received from a client.
///
/// # Errors
///
/// Returns an error if the frame is larger than `max_size`, is not valid
/// JSON, or carries empty content.
pub fn decode_client(text: &str, max_size: usize) -> Result<ClientFrame, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let frame: ClientFrame = serde_json::from_str(text)?;
    if frame.content.trim().is_empty() {
        return Err(ProtocolError::EmptyContent);
    }

    Ok(frame)
}

/// Encode an envelope for publishing on the bus.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_envelope(envelope: &BusEnvelope) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Decode an envelope received from the bus.
///
/// # Errors
///
/// Returns an error if the payload is not a valid envelope.
pub fn decode_envelope(data: &[u8]) -> Result<BusEnvelope, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}
