//! Client session abstraction.
//!
//! The core never owns a client connection. It only sees the [`Session`]
//! trait, implemented by the transport layer, and only for the duration of
//! a single broadcast.

use chord_relay_protocol::EncodedFrame;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique session ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("sess_{:x}_{}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-session delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The session went away before the frame could be queued.
    #[error("Session closed")]
    Closed,

    /// The session's outbound queue is full.
    #[error("Session lagging: outbound queue of {0} frames is full")]
    Lagging(usize),
}

impl DeliveryError {
    /// Short label for metrics and log fields.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Lagging(_) => "lagging",
        }
    }
}

/// A live client session as seen by the broadcaster.
///
/// `deliver` must not block: a slow client may only ever delay itself.
pub trait Session: Send + Sync {
    /// The session's identifier.
    fn id(&self) -> &SessionId;

    /// Hand a frame to the session for sending.
    fn deliver(&self, frame: &EncodedFrame) -> Result<(), DeliveryError>;
}

/// A session backed by a bounded queue, drained by the connection's writer task.
pub struct ChannelSession {
    id: SessionId,
    sender: mpsc::Sender<EncodedFrame>,
    capacity: usize,
}

impl ChannelSession {
    /// Create a session and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<EncodedFrame>) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                id,
                sender,
                capacity,
            },
            receiver,
        )
    }
}

impl Session for ChannelSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn deliver(&self, frame: &EncodedFrame) -> Result<(), DeliveryError> {
        self.sender.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagging(self.capacity),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chord_relay_protocol::{codec, Frame};
    use serde_json::json;

    fn frame(n: i64) -> EncodedFrame {
        codec::encode(&Frame::events("chord.test", json!(n))).unwrap()
    }

    #[test]
    fn test_session_id_generation() {
        let id1 = SessionId::generate();
        let id2 = SessionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("sess_"));
    }

    #[tokio::test]
    async fn test_channel_session_delivers_in_order() {
        let (session, mut rx) = ChannelSession::new(SessionId::from("a"), 8);
        session.deliver(&frame(1)).unwrap();
        session.deliver(&frame(2)).unwrap();

        assert_eq!(rx.recv().await.unwrap(), frame(1));
        assert_eq!(rx.recv().await.unwrap(), frame(2));
    }

    #[test]
    fn test_channel_session_full_queue() {
        let (session, _rx) = ChannelSession::new(SessionId::from("a"), 1);
        session.deliver(&frame(1)).unwrap();
        assert_eq!(session.deliver(&frame(2)), Err(DeliveryError::Lagging(1)));
    }

    #[test]
    fn test_channel_session_closed() {
        let (session, rx) = ChannelSession::new(SessionId::from("a"), 4);
        drop(rx);
        assert_eq!(session.deliver(&frame(1)), Err(DeliveryError::Closed));
        assert_eq!(DeliveryError::Closed.reason(), "closed");
    }
}
