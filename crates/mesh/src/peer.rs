//! Cross-room peer table
//!
//! Sightings from every room are merged into one [`MeshPeer`] per peer id.
//! Joining a room extends the peer's room list, leaving trims it, and a peer
//! whose last room is gone is marked disconnected but kept.

use lanthorn_core::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::transport::ConnectionState;

/// How a peer was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMethod {
    RelaySignaled,
    Direct,
    Local,
}

/// A peer as seen by the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshPeer {
    pub peer_id: PeerId,
    pub connection_method: ConnectionMethod,
    /// When the peer last became connected (Unix epoch milliseconds)
    pub connected_at: u64,
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Rooms the peer is currently present in
    pub rooms: Vec<String>,
    pub connection_state: ConnectionState,
}

impl MeshPeer {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

/// Result of recording a sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdate {
    /// Peer was unknown or disconnected and is now connected
    Connected,
    /// Peer was already connected; its record was refreshed
    Refreshed,
    /// Peer lost its last room and is now disconnected
    Disconnected,
    /// Peer is still present elsewhere
    Trimmed,
    /// Nothing known about the peer
    Unknown,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, MeshPeer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the peer as present in `room_id`
    pub fn record_join(
        &mut self,
        peer_id: &str,
        room_id: &str,
        method: ConnectionMethod,
        now: u64,
    ) -> PeerUpdate {
        let peer = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| MeshPeer {
                peer_id: peer_id.to_string(),
                connection_method: method,
                connected_at: now,
                last_seen: now,
                fingerprint: None,
                rooms: Vec::new(),
                connection_state: ConnectionState::New,
            });

        if !peer.rooms.iter().any(|r| r == room_id) {
            peer.rooms.push(room_id.to_string());
        }
        peer.last_seen = now;
        Self::mark_connected(peer, method, now)
    }

    /// Record the peer as gone from `room_id`
    pub fn record_leave(&mut self, peer_id: &str, room_id: &str, now: u64) -> PeerUpdate {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return PeerUpdate::Unknown;
        };
        peer.rooms.retain(|r| r != room_id);
        peer.last_seen = now;

        if !peer.rooms.is_empty() || peer.connection_method == ConnectionMethod::Direct {
            return PeerUpdate::Trimmed;
        }
        if peer.connection_state == ConnectionState::Disconnected {
            return PeerUpdate::Trimmed;
        }
        peer.connection_state = ConnectionState::Disconnected;
        PeerUpdate::Disconnected
    }

    /// Record a peer reached outside any room, such as a direct connection
    /// set up by introduction
    pub fn record_direct(
        &mut self,
        peer_id: &str,
        method: ConnectionMethod,
        fingerprint: Option<String>,
        now: u64,
    ) -> PeerUpdate {
        let peer = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| MeshPeer {
                peer_id: peer_id.to_string(),
                connection_method: method,
                connected_at: now,
                last_seen: now,
                fingerprint: None,
                rooms: Vec::new(),
                connection_state: ConnectionState::New,
            });
        if fingerprint.is_some() {
            peer.fingerprint = fingerprint;
        }
        peer.last_seen = now;
        peer.connection_method = method;
        Self::mark_connected(peer, method, now)
    }

    /// Drop a direct link. Peers still present in a room stay connected.
    pub fn mark_disconnected(&mut self, peer_id: &str) -> PeerUpdate {
        match self.peers.get_mut(peer_id) {
            Some(peer) if peer.is_connected() => {
                if !peer.rooms.is_empty() {
                    // still reachable through a room
                    if peer.connection_method == ConnectionMethod::Direct {
                        peer.connection_method = ConnectionMethod::RelaySignaled;
                    }
                    return PeerUpdate::Trimmed;
                }
                peer.connection_state = ConnectionState::Disconnected;
                PeerUpdate::Disconnected
            }
            Some(_) => PeerUpdate::Trimmed,
            None => PeerUpdate::Unknown,
        }
    }

    /// Bind a fingerprint learned from the peer itself
    pub fn bind_fingerprint(&mut self, peer_id: &str, fingerprint: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.fingerprint = Some(fingerprint.to_string());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&MeshPeer> {
        self.peers.get(peer_id)
    }

    /// Connected peer carrying `fingerprint`
    pub fn find_connected_by_fingerprint(&self, fingerprint: &str) -> Option<&MeshPeer> {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .find(|p| p.fingerprint.as_deref() == Some(fingerprint))
    }

    /// Every known peer, sorted by id
    pub fn all(&self) -> Vec<MeshPeer> {
        let mut peers: Vec<MeshPeer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn connected(&self) -> Vec<MeshPeer> {
        let mut peers: Vec<MeshPeer> = self
            .peers
            .values()
            .filter(|p| p.is_connected())
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    fn mark_connected(peer: &mut MeshPeer, method: ConnectionMethod, now: u64) -> PeerUpdate {
        if peer.is_connected() {
            if method == ConnectionMethod::Direct {
                peer.connection_method = method;
            }
            return PeerUpdate::Refreshed;
        }
        peer.connection_state = ConnectionState::Connected;
        peer.connection_method = method;
        peer.connected_at = now;
        PeerUpdate::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sighting_connects() {
        let mut table = PeerTable::new();
        let update = table.record_join("p1", "lobby", ConnectionMethod::RelaySignaled, 10);
        assert_eq!(update, PeerUpdate::Connected);

        let peer = table.get("p1").unwrap();
        assert_eq!(peer.rooms, vec!["lobby".to_string()]);
        assert_eq!(peer.connected_at, 10);
        assert!(peer.is_connected());
    }

    #[test]
    fn test_rooms_merge_across_sightings() {
        let mut table = PeerTable::new();
        table.record_join("p1", "lobby", ConnectionMethod::RelaySignaled, 10);
        let update = table.record_join("p1", "work", ConnectionMethod::RelaySignaled, 20);
        assert_eq!(update, PeerUpdate::Refreshed);
        table.record_join("p1", "work", ConnectionMethod::RelaySignaled, 30);

        let peer = table.get("p1").unwrap();
        assert_eq!(peer.rooms, vec!["lobby".to_string(), "work".to_string()]);
        assert_eq!(peer.connected_at, 10);
        assert_eq!(peer.last_seen, 30);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_last_room_leave_disconnects_without_removing() {
        let mut table = PeerTable::new();
        table.record_join("p1", "lobby", ConnectionMethod::RelaySignaled, 10);
        table.record_join("p1", "work", ConnectionMethod::RelaySignaled, 10);

        assert_eq!(table.record_leave("p1", "lobby", 20), PeerUpdate::Trimmed);
        assert!(table.get("p1").unwrap().is_connected());

        assert_eq!(table.record_leave("p1", "work", 30), PeerUpdate::Disconnected);
        let peer = table.get("p1").unwrap();
        assert_eq!(peer.connection_state, ConnectionState::Disconnected);
        assert!(peer.rooms.is_empty());
        assert_eq!(table.connected_count(), 0);
        assert_eq!(table.len(), 1);

        assert_eq!(table.record_leave("ghost", "work", 30), PeerUpdate::Unknown);
    }

    #[test]
    fn test_rejoin_reconnects() {
        let mut table = PeerTable::new();
        table.record_join("p1", "lobby", ConnectionMethod::RelaySignaled, 10);
        table.record_leave("p1", "lobby", 20);
        let update = table.record_join("p1", "lobby", ConnectionMethod::Local, 30);
        assert_eq!(update, PeerUpdate::Connected);
        let peer = table.get("p1").unwrap();
        assert_eq!(peer.connected_at, 30);
        assert_eq!(peer.connection_method, ConnectionMethod::Local);
    }

    #[test]
    fn test_fingerprint_lookup_requires_connection() {
        let mut table = PeerTable::new();
        table.record_join("p1", "lobby", ConnectionMethod::RelaySignaled, 10);
        assert!(table.bind_fingerprint("p1", "fp-1"));
        assert!(!table.bind_fingerprint("nobody", "fp-2"));
        assert_eq!(
            table.find_connected_by_fingerprint("fp-1").map(|p| p.peer_id.as_str()),
            Some("p1")
        );

        table.record_leave("p1", "lobby", 20);
        assert!(table.find_connected_by_fingerprint("fp-1").is_none());
    }

    #[test]
    fn test_direct_peer_survives_room_leave() {
        let mut table = PeerTable::new();
        table.record_join("p1", "lobby", ConnectionMethod::RelaySignaled, 10);
        let update = table.record_direct("p1", ConnectionMethod::Direct, Some("fp".into()), 15);
        assert_eq!(update, PeerUpdate::Refreshed);

        assert_eq!(table.record_leave("p1", "lobby", 20), PeerUpdate::Trimmed);
        assert!(table.get("p1").unwrap().is_connected());
        assert_eq!(table.mark_disconnected("p1"), PeerUpdate::Disconnected);
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_value(ConnectionMethod::RelaySignaled).unwrap();
        assert_eq!(json, serde_json::json!("relay-signaled"));
    }
}
