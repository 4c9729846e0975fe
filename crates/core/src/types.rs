//! Core types

use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque transport-assigned peer identifier
pub type PeerId = String;

/// Get current timestamp in milliseconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
