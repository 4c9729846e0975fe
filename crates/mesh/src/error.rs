//! Error types for Lanthorn mesh operations.
//!
//! Covers the transport seam, room membership, routing and the
//! introduction protocol.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Failure reported by the underlying transport
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Peer not found
    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },

    /// Room not joined
    #[error("Room not joined: {room_id}")]
    RoomNotJoined { room_id: String },

    /// Connection is not in a state that allows the operation
    #[error("Invalid connection state for {peer_id}: {state}")]
    InvalidState { peer_id: String, state: String },

    /// A peer sent something that does not follow the protocol
    #[error("Protocol violation from {peer_id}: {reason}")]
    Protocol { peer_id: String, reason: String },

    /// Operation needs an identity in at least one room
    #[error("No room joined")]
    NoRooms,

    /// Discovery strategy could not run
    #[error("Discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// Peer cache persistence errors
    #[error("Peer cache error: {0}")]
    PeerCache(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Service has been shut down
    #[error("Mesh service is shut down")]
    ShutDown,
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
