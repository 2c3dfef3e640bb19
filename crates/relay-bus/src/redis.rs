//! Redis bus implementation.
//!
//! Each subscription owns a dedicated pub/sub connection. When Redis drops
//! that connection the message stream ends and the subscription reports
//! `None`; reconnecting is the caller's job.

use crate::traits::{Bus, BusError, BusMessage, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

/// Default time allowed for opening a pub/sub connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Turn a connection setting into a Redis URL.
///
/// Accepts a full URL, a bare `host:port`, or an absolute path to a Unix
/// socket.
#[must_use]
pub fn normalize_url(connection: &str) -> String {
    let connection = connection.trim();
    if connection.starts_with('/') {
        format!("redis+unix://{connection}")
    } else if connection.contains("://") {
        connection.to_string()
    } else {
        format!("redis://{connection}")
    }
}

/// A Redis-backed bus.
pub struct RedisBus {
    client: ::redis::Client,
    url: String,
    connect_timeout: Duration,
}

impl RedisBus {
    /// Create a bus for the given connection setting.
    ///
    /// No connection is made until [`Bus::psubscribe`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection setting cannot be parsed.
    pub fn open(connection: &str) -> Result<Self, BusError> {
        let url = normalize_url(connection);
        let client = ::redis::Client::open(url.as_str()).map_err(|e| BusError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            client,
            url,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Set the time allowed for opening a connection.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The normalized connection URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn psubscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>, BusError> {
        let mut pubsub = tokio::time::timeout(self.connect_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| {
                BusError::Connect(format!(
                    "{}: timed out after {:?}",
                    self.url, self.connect_timeout
                ))
            })?
            .map_err(|e| BusError::Connect(format!("{}: {}", self.url, e)))?;

        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| BusError::Subscribe {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;

        info!(url = %self.url, pattern = %pattern, "Subscribed to Redis pattern");

        Ok(Box::new(RedisSubscription {
            pattern: pattern.to_string(),
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct RedisSubscription {
    pattern: String,
    messages: Pin<Box<dyn Stream<Item = ::redis::Msg> + Send>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Option<BusMessage> {
        let msg = self.messages.next().await?;

        let pattern = if msg.from_pattern() {
            msg.get_pattern::<String>()
                .unwrap_or_else(|_| self.pattern.clone())
        } else {
            self.pattern.clone()
        };
        let message = BusMessage {
            pattern,
            channel: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        };

        debug!(channel = %message.channel, bytes = message.payload.len(), "Redis message");
        Some(message)
    }

    fn pattern(&self) -> &str {
        &self.pattern
    }
}
