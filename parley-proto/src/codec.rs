//! JSON text-frame codec for the Parley event protocol.
//!
//! One event per WebSocket text frame. Decoding checks the frame size before
//! parsing so an oversized frame is rejected without allocating a document.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::event::{ClientEvent, ServerEvent};

/// Maximum accepted frame size in bytes (8 MiB, room for base64 attachments).
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    Oversized {
        /// Actual frame size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Encodes any protocol event into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode<T: Serialize>(event: &T) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a JSON text frame into a protocol event.
///
/// # Errors
///
/// Returns `CodecError::Oversized` for frames over [`MAX_FRAME_SIZE`] and
/// `CodecError::Serialization` for anything that is not a known event.
pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::Oversized {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    serde_json::from_str(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a client event.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    encode(event)
}

/// Decodes a server event.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_server(frame: &str) -> Result<ServerEvent, CodecError> {
    decode(frame)
}
