//! Fan-out of decoded bus messages to every live session.

use crate::decoder::{decode, DecodeMode};
use crate::message::RelayMessage;
use crate::registry::ConnectionRegistry;
use crate::session::DeliveryError;
use chord_relay_protocol::{codec, Frame};
use std::sync::Arc;
use tracing::{trace, warn};

/// Outcome of broadcasting one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Whether the payload decoded and encoded successfully.
    pub decoded: bool,
    /// Sessions in the registry snapshot.
    pub recipients: usize,
    /// Sessions the frame was handed to.
    pub delivered: usize,
    /// Per-session failures, in snapshot order.
    pub failures: Vec<DeliveryError>,
}

impl BroadcastReport {
    /// Short label describing the outcome.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        if !self.decoded {
            "decode_error"
        } else if self.recipients == 0 {
            "no_sessions"
        } else {
            "relayed"
        }
    }
}

/// Delivers bus messages to every session in the registry.
///
/// Errors never leave `broadcast`: a malformed payload abandons only that
/// message, and a failing session only loses its own copy.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    mode: DecodeMode,
}

impl Broadcaster {
    /// Create a broadcaster over a registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, mode: DecodeMode) -> Self {
        Self { registry, mode }
    }

    /// The decode mode in use.
    #[must_use]
    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Decode `message` once and deliver it to every registered session.
    pub fn broadcast(&self, message: &RelayMessage) -> BroadcastReport {
        let value = match decode(&message.payload, self.mode) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    pattern = %message.pattern,
                    channel = %message.channel,
                    payload = %message.payload_lossy(),
                    error = %e,
                    "Dropping message that failed to decode"
                );
                return BroadcastReport::default();
            }
        };

        let frame = match codec::encode(&Frame::events(message.channel.as_str(), value)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    pattern = %message.pattern,
                    channel = %message.channel,
                    payload = %message.payload_lossy(),
                    error = %e,
                    "Dropping message that failed to encode"
                );
                return BroadcastReport::default();
            }
        };

        let sessions = self.registry.snapshot();
        let mut report = BroadcastReport {
            decoded: true,
            recipients: sessions.len(),
            ..BroadcastReport::default()
        };

        for session in &sessions {
            match session.deliver(&frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        pattern = %message.pattern,
                        channel = %message.channel,
                        payload = %message.payload_lossy(),
                        session = %session.id(),
                        reason = e.reason(),
                        error = %e,
                        "Failed to deliver message to session"
                    );
                    report.failures.push(e);
                }
            }
        }

        trace!(
            message_id = message.id,
            channel = %message.channel,
            recipients = report.recipients,
            delivered = report.delivered,
            "Broadcast message"
        );

        report
    }
}
