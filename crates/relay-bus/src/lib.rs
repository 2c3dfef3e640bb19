//! # chord-relay-bus
//!
//! Message bus abstraction for the CHORD event relay.
//!
//! The relay only needs one operation from a bus: a pattern subscription
//! that yields every message published on a matching channel.
//!
//! - **Redis** - `PSUBSCRIBE` over a dedicated pub/sub connection
//! - **Memory** - In-process bus with Redis glob semantics, for tests and local runs
//!
//! ```rust,ignore
//! use chord_relay_bus::{Bus, Subscription};
//!
//! async fn relay(bus: &dyn Bus) -> Result<(), chord_relay_bus::BusError> {
//!     let mut subscription = bus.psubscribe("chord.*").await?;
//!     while let Some(message) = subscription.next_message().await {
//!         // Broadcast message
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod memory;
pub mod pattern;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis;

pub use backoff::ExponentialBackoff;
pub use memory::MemoryBus;
pub use pattern::glob_match;
pub use traits::{Bus, BusError, BusMessage, Subscription};

#[cfg(feature = "redis")]
pub use self::redis::RedisBus;
