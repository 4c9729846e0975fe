//! Discovery scenarios
//!
//! Launch-time discovery runs every strategy once and remembers whoever it
//! reached. The peer cache outlives the node and brings it back to known
//! peers through their personal rooms.

use crate::test_utils::*;
use lanthorn_core::DiscoveryConfig;
use lanthorn_mesh::discovery::{personal_room_id, PEER_CACHE_LIMIT};
use lanthorn_mesh::mock::{MockRendezvous, MockRtcNetwork};
use lanthorn_mesh::{
    AutoDiscovery, ConnectionMethod, DiscoveredPeer, DiscoveryStatus, DiscoveryStrategy,
    JsonFilePeerCacheStore, PeerCache, PeerCacheStore, Topology,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

fn file_cache(path: &Path) -> Arc<PeerCache> {
    let store: Arc<dyn PeerCacheStore> = Arc::new(JsonFilePeerCacheStore::new(path));
    Arc::new(PeerCache::open(store).unwrap())
}

fn discovery(node: &TestNode, cache: Arc<PeerCache>, config: DiscoveryConfig) -> AutoDiscovery {
    AutoDiscovery::new(Arc::clone(&node.mesh), cache, config)
}

#[tokio::test]
async fn test_concurrent_discovery_is_single_flight() {
    lanthorn_core::logging::try_init_for_tests();
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let alice = TestNode::new(&rendezvous, &network, "alice");
    let bob = TestNode::new(&rendezvous, &network, "bob");
    bob.mesh.join_room("lobby").await.unwrap();

    let discovery = discovery(&alice, Arc::new(PeerCache::in_memory()), fast_discovery_config());
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    let _sub = discovery.subscribe_status(move |s| sink.lock().push(*s));

    let (first, second) = tokio::join!(discovery.start_discovery(), discovery.start_discovery());
    assert!(second.is_empty());
    assert_eq!(
        first,
        vec![DiscoveredPeer {
            peer_id: "bob".to_string(),
            room_id: "lobby".to_string(),
            strategy: DiscoveryStrategy::Rendezvous,
        }]
    );
    assert_eq!(
        statuses.lock().clone(),
        vec![DiscoveryStatus::Discovering, DiscoveryStatus::Connected]
    );
    assert!(!discovery.is_discovering());

    // once settled, a new run is accepted again
    assert_eq!(discovery.start_discovery().await.len(), 1);
}

#[tokio::test]
async fn test_peer_cache_keeps_most_recent_hundred_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peers.json");

    let cache = file_cache(&path);
    for n in 0..150u64 {
        cache
            .add_peer_at(
                &format!("peer-{n:03}"),
                Some(format!("fp-{n:03}").as_str()),
                ConnectionMethod::RelaySignaled,
                1_000 + n,
            )
            .unwrap();
    }
    assert_eq!(cache.len(), PEER_CACHE_LIMIT);
    drop(cache);

    let reopened = file_cache(&path);
    let peers = reopened.peers();
    assert_eq!(peers.len(), 100);
    assert_eq!(peers[0].peer_id, "peer-149");
    assert_eq!(peers[99].peer_id, "peer-050");
    assert!(reopened.get("peer-049").is_none());

    // a repeat sighting merges methods and moves the peer to the front
    reopened
        .add_peer_at("peer-050", None, ConnectionMethod::Direct, 5_000)
        .unwrap();
    let refreshed = file_cache(&path).get("peer-050").unwrap();
    assert_eq!(
        refreshed.connection_methods,
        vec![ConnectionMethod::RelaySignaled, ConnectionMethod::Direct]
    );
    assert_eq!(refreshed.fingerprint.as_deref(), Some("fp-050"));
    assert_eq!(file_cache(&path).peers()[0].peer_id, "peer-050");
}

#[tokio::test]
async fn test_cached_peers_reconnect_after_restart() {
    lanthorn_core::logging::try_init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice-peers.json");
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();

    let alice = TestNode::new(&rendezvous, &network, "alice");
    let bob = TestNode::new(&rendezvous, &network, "bob");
    let alice_discovery = discovery(&alice, file_cache(&path), fast_discovery_config());
    let bob_discovery = discovery(&bob, Arc::new(PeerCache::in_memory()), fast_discovery_config());

    let (alice_found, _) = tokio::join!(
        alice_discovery.start_discovery(),
        bob_discovery.start_discovery()
    );
    assert!(alice_found.iter().any(|p| p.peer_id == "bob"));
    let cached = alice_discovery.cache().get("bob").unwrap();
    assert_eq!(cached.fingerprint.as_deref(), Some("fp-bob"));

    alice.mesh.shutdown().await;
    drop(alice_discovery);

    // same identity, nobody in the rendezvous room this time
    let restarted = TestNode::new(&rendezvous, &network, "alice");
    let config = DiscoveryConfig {
        rendezvous_room: "empty-lobby".to_string(),
        ..fast_discovery_config()
    };
    let restarted_discovery = discovery(&restarted, file_cache(&path), config);
    let found = restarted_discovery.start_discovery().await;

    assert_eq!(
        found,
        vec![DiscoveredPeer {
            peer_id: "bob".to_string(),
            room_id: personal_room_id("fp-bob"),
            strategy: DiscoveryStrategy::CachedPeers,
        }]
    );
    assert_eq!(restarted_discovery.status(), DiscoveryStatus::Connected);
    assert!(restarted.mesh.room_ids().contains(&personal_room_id("fp-alice")));
}

#[tokio::test]
async fn test_topology_follows_membership() {
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let me = TestNode::new(&rendezvous, &network, "me");
    me.mesh.join_room("lobby").await.unwrap();
    let discovery = discovery(&me, Arc::new(PeerCache::in_memory()), fast_discovery_config());

    let mut others = Vec::new();
    for n in 0..6 {
        let node = TestNode::new(&rendezvous, &network, &format!("peer-{n}"));
        node.mesh.join_room("lobby").await.unwrap();
        others.push(node);
    }
    assert_eq!(me.mesh.connected_peer_count(), 6);
    assert_eq!(discovery.topology(), Topology::FullMesh);

    let seventh = TestNode::new(&rendezvous, &network, "peer-6");
    seventh.mesh.join_room("lobby").await.unwrap();
    assert!(discovery.should_use_hub_spoke());
    assert_eq!(discovery.topology(), Topology::HubSpoke);

    seventh.mesh.leave_room("lobby").await;
    assert!(!discovery.should_use_hub_spoke());
}
