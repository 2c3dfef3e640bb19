//! Bus subscription listener.
//!
//! Owns the pattern subscription and feeds every message to the
//! broadcaster, one at a time. A lost subscription is re-established with
//! exponential backoff until shutdown.

use crate::metrics;
use chord_relay_bus::{Bus, BusError, BusMessage, ExponentialBackoff, Subscription};
use chord_relay_core::{Broadcaster, RelayMessage};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Relays bus messages matching one pattern to the broadcaster.
pub struct SubscriptionListener {
    bus: Arc<dyn Bus>,
    pattern: String,
    broadcaster: Arc<Broadcaster>,
    backoff: ExponentialBackoff,
}

impl SubscriptionListener {
    #[must_use]
    pub fn new(
        bus: Arc<dyn Bus>,
        pattern: impl Into<String>,
        broadcaster: Arc<Broadcaster>,
        backoff: ExponentialBackoff,
    ) -> Self {
        Self {
            bus,
            pattern: pattern.into(),
            broadcaster,
            backoff,
        }
    }

    /// Subscribe and spawn the relay loop.
    ///
    /// The loop exits once `shutdown` flips to `true` or its sender is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial subscription fails.
    pub async fn start(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, BusError> {
        let subscription = self.bus.psubscribe(&self.pattern).await?;

        info!(
            bus = self.bus.name(),
            pattern = %self.pattern,
            mode = ?self.broadcaster.mode(),
            "Subscribed to bus"
        );

        Ok(tokio::spawn(self.run(subscription, shutdown)))
    }

    async fn run(
        mut self,
        mut subscription: Box<dyn Subscription>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown) => break,
                message = subscription.next_message() => message,
            };

            match next {
                Some(message) => self.relay(message),
                None => {
                    warn!(pattern = %self.pattern, "Bus subscription lost");
                    match self.resubscribe(&mut shutdown).await {
                        Some(renewed) => subscription = renewed,
                        None => break,
                    }
                }
            }
        }

        info!(pattern = %self.pattern, "Subscription listener stopped");
    }

    fn relay(&self, message: BusMessage) {
        let started = Instant::now();
        let message = RelayMessage::new(message.pattern, message.channel, message.payload);

        trace!(
            id = message.id,
            channel = %message.channel,
            size = message.payload_size(),
            "Relaying bus message"
        );

        let report = self.broadcaster.broadcast(&message);
        metrics::record_broadcast(&report, started.elapsed());

        debug!(
            channel = %message.channel,
            outcome = report.outcome(),
            delivered = report.delivered,
            failed = report.failures.len(),
            "Broadcast complete"
        );
    }

    /// Retry the subscription until it succeeds. Returns `None` on shutdown.
    async fn resubscribe(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn Subscription>> {
        self.backoff.reset();

        loop {
            let delay = self.backoff.next_delay();
            info!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to bus"
            );

            tokio::select! {
                biased;
                () = wait_for_shutdown(shutdown) => return None,
                () = tokio::time::sleep(delay) => {}
            }

            let attempt = tokio::select! {
                biased;
                () = wait_for_shutdown(shutdown) => return None,
                result = self.bus.psubscribe(&self.pattern) => result,
            };

            match attempt {
                Ok(subscription) => {
                    info!(
                        pattern = %self.pattern,
                        attempts = self.backoff.attempts(),
                        "Bus subscription re-established"
                    );
                    metrics::record_bus_reconnect();
                    return Some(subscription);
                }
                Err(e) => warn!(error = %e, "Bus reconnect failed"),
            }
        }
    }
}

/// Resolve once the shutdown flag is set or its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
