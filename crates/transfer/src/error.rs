//! Error types for bundle packaging, storage and transfer.

use lanthorn_mesh::MeshError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Sending over the mesh failed
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// Bundle store errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Chunk data is not valid base64
    #[error("Chunk encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Chunk set does not cover every index of the bundle
    #[error("Incomplete bundle: {reason}")]
    Incomplete { reason: String },

    #[error("Bundle hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Bundle exceeds the configured size limit
    #[error("Bundle of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// Asset source could not produce a snapshot
    #[error("Asset source error: {0}")]
    AssetSource(String),

    #[error("Protocol violation from {peer_id}: {reason}")]
    Protocol { peer_id: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransferResult<T> = Result<T, TransferError>;
