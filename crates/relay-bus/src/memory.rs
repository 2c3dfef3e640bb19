//! In-process bus.
//!
//! Implements the same pattern semantics as Redis so the relay can be
//! exercised end to end without a Redis server.

use crate::pattern::glob_match;
use crate::traits::{Bus, BusError, BusMessage, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

struct Subscriber {
    pattern: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

struct Inner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    available: AtomicBool,
}

/// An in-memory pub/sub bus.
///
/// Clones share the same subscribers.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(0),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Publish a payload on a channel.
    ///
    /// Returns the number of pattern subscriptions that received it.
    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut delivered = 0;

        self.inner.subscribers.retain(|_, subscriber| {
            if !glob_match(&subscriber.pattern, channel) {
                return !subscriber.sender.is_closed();
            }
            let message = BusMessage {
                pattern: subscriber.pattern.clone(),
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            match subscriber.sender.send(message) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        debug!(channel = %channel, receivers = delivered, "Published on memory bus");
        delivered
    }

    /// Number of active pattern subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// End every active subscription, as if the server dropped its connections.
    pub fn disconnect_all(&self) {
        self.inner.subscribers.clear();
    }

    /// Make new subscriptions fail (or succeed again), as if the server were unreachable.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn psubscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>, BusError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BusError::Connect("memory bus unavailable".to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(
            id,
            Subscriber {
                pattern: pattern.to_string(),
                sender,
            },
        );

        debug!(pattern = %pattern, subscription = id, "Memory bus pattern subscription");

        Ok(Box::new(MemorySubscription {
            id,
            pattern: pattern.to_string(),
            receiver,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySubscription {
    id: u64,
    pattern: String,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.inner.subscribers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pattern_delivery() {
        let bus = MemoryBus::new();
        let mut sub = bus.psubscribe("chord.*").await.unwrap();

        assert_eq!(bus.publish("chord.experiment.created", &b"{}"[..]), 1);
        assert_eq!(bus.publish("other.channel", &b"{}"[..]), 0);

        let msg = sub.next_message().await.unwrap();
        assert_eq!(msg.channel, "chord.experiment.created");
        assert_eq!(msg.pattern, "chord.*");
        assert_eq!(&msg.payload[..], b"{}");
        assert_eq!(sub.pattern(), "chord.*");
    }

    #[tokio::test]
    async fn test_delivery_order() {
        let bus = MemoryBus::new();
        let mut sub = bus.psubscribe("*").await.unwrap();

        for n in 0..10u8 {
            bus.publish("c", vec![n]);
        }
        for n in 0..10u8 {
            assert_eq!(sub.next_message().await.unwrap().payload[..], [n]);
        }
    }

    #[tokio::test]
    async fn test_disconnect_ends_subscription() {
        let bus = MemoryBus::new();
        let mut sub = bus.psubscribe("chord.*").await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        bus.disconnect_all();
        assert!(sub.next_message().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let bus = MemoryBus::new();
        bus.set_available(false);
        assert!(matches!(
            bus.psubscribe("chord.*").await,
            Err(BusError::Connect(_))
        ));

        bus.set_available(true);
        assert!(bus.psubscribe("chord.*").await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = MemoryBus::new();
        let sub = bus.psubscribe("chord.*").await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish("chord.x", &b"1"[..]), 0);
    }
}
