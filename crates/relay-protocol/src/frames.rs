//! Frame types for the relay push channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name used for every relayed bus message.
pub const EVENTS: &str = "events";

/// A decoded bus message together with the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Decoded payload. A JSON string when the relay runs in passthrough mode.
    pub message: Value,
    /// Originating bus channel.
    pub channel: String,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(channel: impl Into<String>, message: Value) -> Self {
        Self {
            message,
            channel: channel.into(),
        }
    }
}

/// A named event carrying an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event name.
    pub event: String,
    /// Event data.
    pub data: Envelope,
}

impl Frame {
    /// Create a frame with an arbitrary event name.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Envelope) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Create an [`EVENTS`] frame for a relayed message.
    #[must_use]
    pub fn events(channel: impl Into<String>, message: Value) -> Self {
        Self::new(EVENTS, Envelope::new(channel, message))
    }

    /// Whether this frame carries a relayed bus message.
    #[must_use]
    pub fn is_events(&self) -> bool {
        self.event == EVENTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_events_frame() {
        let frame = Frame::events("chord.service.started", json!({"ok": true}));
        assert!(frame.is_events());
        assert_eq!(frame.data.channel, "chord.service.started");
        assert_eq!(frame.data.message, json!({"ok": true}));
    }

    #[test]
    fn test_envelope_field_order() {
        let envelope = Envelope::new("chord.a", json!(1));
        let text = serde_json::to_string(&envelope).unwrap();
        assert_eq!(text, r#"{"message":1,"channel":"chord.a"}"#);
    }
}
