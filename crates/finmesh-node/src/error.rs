//! Node error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

use finmesh_protocol::ProtocolError;

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors that can occur in the node.
///
/// None of these are fatal to the owning process; every public operation
/// surfaces failures as a value for the caller to act on.
#[derive(Debug, Error)]
pub enum NodeError {
    /// IO error (bind, accept, read, write).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, validation).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A unicast named a peer that is not in the registry.
    #[error("unknown peer: {peer_id}")]
    UnknownPeer { peer_id: String },

    /// The peer's connection is gone; its registry entry has been removed.
    #[error("peer unreachable: {peer_id}")]
    PeerUnreachable { peer_id: String },

    /// An outbound connection attempt exceeded the configured timeout.
    #[error("connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
}

impl NodeError {
    /// Creates an unknown-peer error.
    pub fn unknown_peer(peer_id: impl Into<String>) -> Self {
        Self::UnknownPeer {
            peer_id: peer_id.into(),
        }
    }

    /// Creates a peer-unreachable error.
    pub fn unreachable(peer_id: impl Into<String>) -> Self {
        Self::PeerUnreachable {
            peer_id: peer_id.into(),
        }
    }
}
