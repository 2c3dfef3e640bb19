//! # chord-relay-protocol
//!
//! Wire format spoken by the CHORD event relay on its push channel.
//!
//! Every bus message that survives decoding is delivered to clients as a
//! single JSON text frame:
//!
//! ```text
//! {"event":"events","data":{"message":<payload>,"channel":"<bus channel>"}}
//! ```
//!
//! ## Example
//!
//! ```rust
//! use chord_relay_protocol::{codec, Frame};
//! use serde_json::json;
//!
//! let frame = Frame::events("chord.experiment.created", json!({"id": 42}));
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(
//!     encoded.as_str(),
//!     r#"{"event":"events","data":{"message":{"id":42},"channel":"chord.experiment.created"}}"#
//! );
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, EncodedFrame, ProtocolError};
pub use frames::{Envelope, Frame, EVENTS};
