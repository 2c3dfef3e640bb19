//! Bus payload decoding.

use serde_json::Value;
use thiserror::Error;

/// How bus payloads are turned into relayed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Parse the payload as a JSON document.
    Structured,
    /// Relay the payload unparsed, as a JSON string.
    Passthrough,
}

impl DecodeMode {
    /// Select the mode from the `json_messages` flag.
    #[must_use]
    pub fn from_json_flag(json_messages: bool) -> Self {
        if json_messages {
            Self::Structured
        } else {
            Self::Passthrough
        }
    }
}

/// The payload was not valid JSON in structured mode.
#[derive(Debug, Error)]
#[error("Payload is not valid JSON: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Decode a raw bus payload.
///
/// Passthrough never fails; bytes that are not UTF-8 are replaced with
/// U+FFFD.
///
/// # Errors
///
/// Returns [`DecodeError`] in structured mode when the payload does not parse.
pub fn decode(payload: &[u8], mode: DecodeMode) -> Result<Value, DecodeError> {
    match mode {
        DecodeMode::Structured => Ok(serde_json::from_slice(payload)?),
        DecodeMode::Passthrough => Ok(Value::String(
            String::from_utf8_lossy(payload).into_owned(),
        )),
    }
}
