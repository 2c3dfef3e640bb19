//! Relay message type.
//!
//! One [`RelayMessage`] is created per bus delivery and dropped once it has
//! been broadcast.

use bytes::Bytes;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// A message received from the bus, waiting to be broadcast.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    /// Unique message identifier, used to correlate log lines.
    pub id: MessageId,
    /// Channel the message was published on.
    pub channel: String,
    /// Subscription pattern that matched the channel.
    pub pattern: String,
    /// Raw payload as received from the bus.
    pub payload: Bytes,
}

impl RelayMessage {
    /// Create a new relay message.
    #[must_use]
    pub fn new(
        pattern: impl Into<String>,
        channel: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            channel: channel.into(),
            pattern: pattern.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text for log lines.
    #[must_use]
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
