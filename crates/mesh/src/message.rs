//! Room wire framing
//!
//! Every frame on a room action starts with a kind byte:
//! - `0x00` followed by a JSON [`P2PMessage`]
//! - `0x01` followed by a 16-byte message id and the raw payload
//!
//! Typed channels implement [`ChannelMessage`]; the payload is decoded into
//! the concrete type where it enters the process and dropped if it does not
//! decode.

use lanthorn_core::PeerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use crate::error::MeshResult;

pub const FRAME_JSON: u8 = 0x00;
pub const FRAME_BINARY: u8 = 0x01;

/// Length of the correlation id prefixed to binary payloads
pub const MESSAGE_ID_LEN: usize = 16;

/// Size of the per-channel duplicate suppression window
pub const RECENT_ID_WINDOW: usize = 256;

/// Structured message carried on a room channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2PMessage {
    pub id: String,
    pub channel: String,
    pub payload: serde_json::Value,
    pub sender_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<PeerId>,
    pub timestamp: u64,
    /// Per-channel counter of the sender; an ordering hint, not a guarantee
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Binary payload with its correlation id already stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMessage {
    pub id: [u8; MESSAGE_ID_LEN],
    pub channel: String,
    pub sender_id: PeerId,
    pub data: Vec<u8>,
}

/// Decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(P2PMessage),
    Binary {
        id: [u8; MESSAGE_ID_LEN],
        data: Vec<u8>,
    },
}

/// A serde type bound to one channel name
pub trait ChannelMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const CHANNEL: &'static str;
}

pub fn new_message_id() -> [u8; MESSAGE_ID_LEN] {
    *Uuid::new_v4().as_bytes()
}

pub fn message_id_string(id: &[u8; MESSAGE_ID_LEN]) -> String {
    Uuid::from_bytes(*id).to_string()
}

pub fn encode_message(message: &P2PMessage) -> MeshResult<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(FRAME_JSON);
    frame.extend(body);
    Ok(frame)
}

pub fn encode_binary(id: &[u8; MESSAGE_ID_LEN], data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + MESSAGE_ID_LEN + data.len());
    frame.push(FRAME_BINARY);
    frame.extend_from_slice(id);
    frame.extend_from_slice(data);
    frame
}

/// Parse a frame; `None` for unknown kinds or truncated frames
pub fn decode_frame(bytes: &[u8]) -> Option<Frame> {
    let (&kind, body) = bytes.split_first()?;
    match kind {
        FRAME_JSON => serde_json::from_slice(body).ok().map(Frame::Message),
        FRAME_BINARY => {
            if body.len() < MESSAGE_ID_LEN {
                return None;
            }
            let (id, data) = body.split_at(MESSAGE_ID_LEN);
            let mut fixed = [0u8; MESSAGE_ID_LEN];
            fixed.copy_from_slice(id);
            Some(Frame::Binary {
                id: fixed,
                data: data.to_vec(),
            })
        }
        _ => None,
    }
}

/// Bounded set of recently seen message ids
#[derive(Debug)]
pub struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id; `false` if it was already in the window
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}
