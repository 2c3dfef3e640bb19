//! # chord-relay-core
//!
//! Core relay path of the CHORD event relay.
//!
//! - **Decoder** - Turns raw bus payloads into relay-ready JSON values
//! - **Session** - What the core needs from a live client connection
//! - **Registry** - The live set of sessions, snapshotted per broadcast
//! - **Broadcaster** - Decodes once, fans out to every session, isolates failures
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Bus message │────▶│ Broadcaster │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     │  snapshot   │
//!                            │            └─────────────┘
//!                            ▼                   │
//!                     ┌─────────────┐            ▼
//!                     │   Decoder   │     Session::deliver (x N)
//!                     └─────────────┘
//! ```

pub mod broadcaster;
pub mod decoder;
pub mod message;
pub mod registry;
pub mod session;

pub use broadcaster::{BroadcastReport, Broadcaster};
pub use decoder::{decode, DecodeError, DecodeMode};
pub use message::RelayMessage;
pub use registry::{ConnectionRegistry, SessionLease};
pub use session::{ChannelSession, DeliveryError, Session, SessionId};
