//! Bus abstraction traits.
//!
//! These traits let the relay run against Redis in production and against
//! [`MemoryBus`](crate::MemoryBus) in tests.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A message delivered through a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Pattern that matched.
    pub pattern: String,
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: Bytes,
}

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The connection string could not be parsed.
    #[error("Invalid bus connection {url}: {reason}")]
    InvalidUrl {
        /// The rejected connection string.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// The bus could not be reached.
    #[error("Failed to connect to bus: {0}")]
    Connect(String),

    /// The subscription request was rejected.
    #[error("Failed to subscribe to pattern {pattern}: {reason}")]
    Subscribe {
        /// Requested pattern.
        pattern: String,
        /// Bus error message.
        reason: String,
    },
}

/// A message bus that supports pattern subscriptions.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Open a connection and subscribe to every channel matching `pattern`.
    ///
    /// Each call opens a fresh connection, so this is also how a dropped
    /// subscription is re-established.
    async fn psubscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>, BusError>;

    /// Get the bus name (e.g., "redis", "memory").
    fn name(&self) -> &'static str;
}

/// An active pattern subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message.
    ///
    /// Returns `None` once the underlying connection is gone.
    async fn next_message(&mut self) -> Option<BusMessage>;

    /// The subscribed pattern.
    fn pattern(&self) -> &str;
}
