//! Registry of peer connections
//!
//! Identity map from peer id to [`PeerConnection`]. The pool never reclaims
//! connections on its own; [`PeerConnectionPool::cleanup`] is the only sweep
//! that removes failed or closed entries.

use lanthorn_core::PeerId;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::{PeerConnection, PeerStats};
use crate::error::MeshResult;
use crate::transport::{ConnectionState, RtcTransportFactory};

/// Per-peer outcome of a fan-out send
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReport {
    pub sent_count: usize,
    pub results: BTreeMap<PeerId, bool>,
}

impl SendReport {
    fn record(&mut self, peer_id: &str, ok: bool) {
        if ok {
            self.sent_count += 1;
        }
        self.results.insert(peer_id.to_string(), ok);
    }
}

pub struct PeerConnectionPool {
    factory: Arc<dyn RtcTransportFactory>,
    ice_servers: Vec<String>,
    connections: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
}

impl PeerConnectionPool {
    pub fn new(factory: Arc<dyn RtcTransportFactory>, ice_servers: Vec<String>) -> Self {
        Self {
            factory,
            ice_servers,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Existing connection for `peer_id`, or a fresh one in `new` state
    pub fn get_or_create(&self, peer_id: &str, is_initiator: bool) -> MeshResult<Arc<PeerConnection>> {
        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(peer_id) {
            return Ok(Arc::clone(existing));
        }

        let transport = self.factory.create(peer_id, &self.ice_servers)?;
        let connection = Arc::new(PeerConnection::new(
            peer_id.to_string(),
            is_initiator,
            transport,
        ));
        connections.insert(peer_id.to_string(), Arc::clone(&connection));
        debug!(peer_id, is_initiator, "Created peer connection");
        Ok(connection)
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.connections.read().get(peer_id).cloned()
    }

    pub fn has(&self, peer_id: &str) -> bool {
        self.connections.read().contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Close and forget one connection
    pub async fn remove(&self, peer_id: &str) -> bool {
        let removed = self.connections.write().remove(peer_id);
        match removed {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Send to every pooled connection
    pub async fn broadcast(&self, data: &[u8]) -> SendReport {
        let mut report = SendReport::default();
        for connection in self.snapshot() {
            let ok = connection.send(data.to_vec()).await;
            report.record(connection.peer_id(), ok);
        }
        report
    }

    /// Send to the listed peers; unknown peers count as failures
    pub async fn send_to(&self, peer_ids: &[PeerId], data: &[u8]) -> SendReport {
        let mut report = SendReport::default();
        for peer_id in peer_ids {
            let ok = match self.get(peer_id) {
                Some(connection) => connection.send(data.to_vec()).await,
                None => false,
            };
            report.record(peer_id, ok);
        }
        report
    }

    /// Remove and close every failed or closed connection
    pub async fn cleanup(&self) -> usize {
        let dead: Vec<Arc<PeerConnection>> = {
            let mut connections = self.connections.write();
            let dead_ids: Vec<PeerId> = connections
                .iter()
                .filter(|(_, c)| c.connection_state().is_dead())
                .map(|(id, _)| id.clone())
                .collect();
            dead_ids
                .iter()
                .filter_map(|id| connections.remove(id))
                .collect()
        };

        for connection in &dead {
            connection.close().await;
        }
        if !dead.is_empty() {
            info!(removed = dead.len(), "Cleaned up dead connections");
        }
        dead.len()
    }

    /// Peers whose connection is currently `connected`, sorted
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .connections
            .read()
            .iter()
            .filter(|(_, c)| c.connection_state() == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn stats(&self) -> BTreeMap<PeerId, PeerStats> {
        self.connections
            .read()
            .iter()
            .map(|(id, c)| (id.clone(), c.stats()))
            .collect()
    }

    pub async fn close_all(&self) {
        let all: Vec<Arc<PeerConnection>> = self.connections.write().drain().map(|(_, c)| c).collect();
        for connection in all {
            connection.close().await;
        }
    }

    fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        let mut all: Vec<Arc<PeerConnection>> = self.connections.read().values().cloned().collect();
        all.sort_by(|a, b| a.peer_id().cmp(b.peer_id()));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRtcFactory, MockRtcNetwork};

    async fn connected_pool(peers: &[&str]) -> (PeerConnectionPool, Arc<MockRtcFactory>) {
        let factory = Arc::new(MockRtcFactory::new(MockRtcNetwork::new(), "local"));
        let pool = PeerConnectionPool::new(factory.clone(), vec![]);
        for peer in peers {
            let conn = pool.get_or_create(peer, true).unwrap();
            conn.initialize().await.unwrap();
            factory.transport(peer).unwrap().connect_loopback();
        }
        (pool, factory)
    }

    #[tokio::test]
    async fn test_get_or_create_is_identity_map() {
        let (pool, _) = connected_pool(&[]).await;
        let a = pool.get_or_create("p1", true).unwrap();
        let b = pool.get_or_create("p1", false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(b.is_initiator());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_then_cleanup_failed_peer() {
        let (pool, factory) = connected_pool(&["p1", "p2"]).await;

        let report = pool.broadcast(b"hello").await;
        assert_eq!(report.sent_count, 2);

        factory
            .transport("p1")
            .unwrap()
            .force_state(ConnectionState::Failed);
        assert_eq!(pool.cleanup().await, 1);

        assert!(!pool.has("p1"));
        assert_eq!(pool.connected_peers(), vec!["p2".to_string()]);
    }

    #[tokio::test]
    async fn test_send_to_reports_unknown_peer() {
        let (pool, _) = connected_pool(&["p1"]).await;
        let report = pool
            .send_to(&["p1".to_string(), "ghost".to_string()], b"x")
            .await;
        assert_eq!(report.sent_count, 1);
        assert_eq!(report.results.get("ghost"), Some(&false));
        assert_eq!(report.results.get("p1"), Some(&true));
    }

    #[tokio::test]
    async fn test_cleanup_leaves_disconnected_peers() {
        let (pool, factory) = connected_pool(&["p1", "p2"]).await;
        factory
            .transport("p2")
            .unwrap()
            .force_state(ConnectionState::Disconnected);
        pool.get("p1").unwrap().close().await;

        assert_eq!(pool.cleanup().await, 1);
        assert!(pool.has("p2"));
        assert!(pool.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_stats_and_close_all() {
        let (pool, _) = connected_pool(&["p1"]).await;
        pool.broadcast(b"abc").await;
        assert_eq!(pool.stats()["p1"].bytes_sent, 3);

        let conn = pool.get("p1").unwrap();
        pool.close_all().await;
        assert!(pool.is_empty());
        assert_eq!(conn.connection_state(), ConnectionState::Closed);
    }
}
