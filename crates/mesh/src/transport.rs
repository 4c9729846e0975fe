//! Transport abstraction
//!
//! Traits for the external capabilities the mesh is built on: a WebRTC-like
//! peer transport with reliable data channels, a rendezvous service that
//! groups peers into rooms with named actions, and a store-and-forward relay.
//! Real bindings and the in-memory [`crate::mock`] implementations both sit
//! behind these traits.

use async_trait::async_trait;
use lanthorn_core::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::room::RoomConfig;

/// Errors from transport operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Timeout")]
    Timeout,
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Closed")]
    Closed,
}

/// Lifecycle of a peer connection.
///
/// Moves forward only; `Closed` is terminal and reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Connecting) => true,
            (Connecting, Connected | Disconnected | Failed) => true,
            (Connected, Disconnected | Failed) => true,
            (Disconnected | Failed, Connected) => true,
            (Disconnected, Failed) => true,
            // ICE restart renegotiates from a dropped link
            (Disconnected | Failed, Connecting) => true,
            _ => false,
        }
    }

    /// A connection in this state will not recover without intervention
    pub fn is_dead(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// ICE agent sub-state, tracked for reconnection decisions only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

/// Events raised by a peer transport
#[derive(Clone)]
pub enum TransportEvent {
    ConnectionState(ConnectionState),
    IceState(IceConnectionState),
    /// Remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    /// Locally gathered candidate to be signaled to the remote side
    LocalCandidate(IceCandidate),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::ConnectionState(s) => write!(f, "ConnectionState({s})"),
            TransportEvent::IceState(s) => write!(f, "IceState({s:?})"),
            TransportEvent::DataChannel(dc) => write!(f, "DataChannel({})", dc.label()),
            TransportEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
        }
    }
}

pub type DataHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
pub type TransportEventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;
pub type PeerHandler = Arc<dyn Fn(PeerId) + Send + Sync>;
pub type ActionHandler = Arc<dyn Fn(Vec<u8>, PeerId) + Send + Sync>;

/// Reliable, ordered data channel to one peer
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Enqueue data; success means accepted locally, not delivered
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    fn on_message(&self, handler: DataHandler);

    async fn close(&self);
}

/// One WebRTC-like connection to one peer
#[async_trait]
pub trait RtcTransport: Send + Sync {
    /// Install the single event sink for this transport
    fn on_event(&self, handler: TransportEventHandler);

    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Creates transports for newly known peers
pub trait RtcTransportFactory: Send + Sync {
    fn create(
        &self,
        peer_id: &str,
        ice_servers: &[String],
    ) -> Result<Arc<dyn RtcTransport>, TransportError>;
}

/// Named message lane inside a joined room
#[async_trait]
pub trait ActionChannel: Send + Sync {
    /// Send to one peer, or to every peer in the room when `target` is `None`
    async fn send(&self, data: Vec<u8>, target: Option<PeerId>) -> Result<(), TransportError>;

    fn on_receive(&self, handler: ActionHandler);
}

/// Live membership in a rendezvous room
#[async_trait]
pub trait RoomHandle: Send + Sync {
    /// Our transport-assigned id in this room
    fn self_id(&self) -> PeerId;

    fn on_peer_join(&self, handler: PeerHandler);

    fn on_peer_leave(&self, handler: PeerHandler);

    fn make_action(&self, name: &str) -> Result<Arc<dyn ActionChannel>, TransportError>;

    async fn leave(&self);
}

/// Signaling backends a room can rendezvous over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Nostr,
    Mqtt,
    Torrent,
    Memory,
}

/// Rendezvous service
#[async_trait]
pub trait SignalingStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn join_room(&self, config: &RoomConfig) -> Result<Arc<dyn RoomHandle>, TransportError>;
}

/// Per-relay health as reported by the relay client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub url: String,
    pub is_connected: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_error: Option<String>,
}

/// Store-and-forward relay used when direct delivery is not possible
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn connect(&self, urls: &[String]) -> Result<(), TransportError>;

    async fn disconnect(&self);

    /// Publish a payload addressed to a recipient fingerprint
    async fn publish(&self, recipient: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    fn statuses(&self) -> Vec<RelayStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_terminal() {
        for next in [
            ConnectionState::New,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Closed,
        ] {
            assert!(!ConnectionState::Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_closed_reachable_from_every_live_state() {
        for from in [
            ConnectionState::New,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Failed,
        ] {
            assert!(from.can_transition_to(ConnectionState::Closed));
        }
    }

    #[test]
    fn test_no_backward_moves() {
        assert!(!ConnectionState::Connected.can_transition_to(ConnectionState::New));
        assert!(!ConnectionState::Connected.can_transition_to(ConnectionState::Connecting));
        assert!(ConnectionState::Failed.can_transition_to(ConnectionState::Connected));
    }

    #[test]
    fn test_session_description_wire_format() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }
}
