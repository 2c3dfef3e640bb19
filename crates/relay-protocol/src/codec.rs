//! Codec for encoding and decoding relay frames.
//!
//! Frames travel as JSON text messages. A frame is encoded once per bus
//! message and the resulting [`EncodedFrame`] is shared by every session.
//! Outbound frames are not size-limited; the bus decides what it accepts.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::frames::Frame;

/// Largest frame [`decode`] accepts (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Inbound frame exceeds [`MAX_FRAME_SIZE`].
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An encoded frame, cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedFrame(Arc<str>);

impl EncodedFrame {
    /// Get the frame text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EncodedFrame").field(&self.as_str()).finish()
    }
}

impl fmt::Display for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode a frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &Frame) -> Result<EncodedFrame, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    Ok(EncodedFrame(Arc::from(text)))
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or is not a valid frame.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(serde_json::from_str(text)?)
}
