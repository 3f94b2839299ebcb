//! Serialization and deserialization for Parlor wire frames.
//!
//! The wire format is JSON text, one frame per WebSocket text message.
//! Decode failures carry enough context to log and discard the offending
//! frame without touching connection state.

use crate::frame::Frame;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame could not be serialized to JSON.
    #[error("frame serialization failed: {0}")]
    Encode(serde_json::Error),
    /// The payload is not valid JSON or has no recognized `type`.
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
}

/// Encodes a [`Frame`] into its JSON text representation.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the frame cannot be serialized; this
/// does not happen for well-formed frames and indicates a programming error.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(CodecError::Encode)
}

/// Decodes a [`Frame`] from JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] when the text is not valid JSON, the
/// `type` discriminator is missing or unrecognized, or a required field is
/// absent. Callers treat this as a discardable frame, never a connection
/// fault.
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    serde_json::from_str(text).map_err(CodecError::Malformed)
}
