//! Wire protocol for the finmesh peer network.
//!
//! Defines the envelope exchanged between nodes, the closed set of message
//! kinds, and the framing used on the wire. This crate knows nothing about
//! transports or peers; it only builds and validates bytes.
//!
//! # Wire format
//!
//! Envelopes are sent as length-prefixed JSON:
//! - 4 bytes: body length (u32, big-endian)
//! - N bytes: JSON envelope
//!
//! # Envelope structure
//!
//! ```json
//! { "type": "critical_alert",
//!   "sender_id": "node_9001",
//!   "target_id": null,
//!   "content": [{"type": "low_balance", "message": "..."}],
//!   "timestamp": "2026-08-06T12:00:00Z",
//!   "message_id": "node_9001_1786363200000" }
//! ```
//!
//! # Example
//!
//! ```rust
//! use finmesh_protocol::{Envelope, MessageKind, encode_envelope, decode_envelope};
//!
//! let envelope = Envelope::broadcast(
//!     MessageKind::Heartbeat,
//!     serde_json::json!({"status": "alive"}),
//!     "node_9001",
//! );
//! let bytes = encode_envelope(&envelope).unwrap();
//! let decoded = decode_envelope(&bytes).unwrap();
//! assert_eq!(decoded.kind, MessageKind::Heartbeat);
//! ```

mod error;
mod framing;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{decode_envelope, encode_envelope};
pub use types::{
    AlertRecord, CHAT_CONTEXT, ChatPayload, DiscoveryAction, DiscoveryPayload, Envelope,
    HeartbeatPayload, MessageKind,
};

/// Maximum envelope body size (1 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
