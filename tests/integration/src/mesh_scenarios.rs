//! Mesh scenarios
//!
//! # Test Scenarios
//!
//! 1. **Pool housekeeping**: a hub fans out over two negotiated links, one
//!    link fails and cleanup reclaims only that entry
//! 2. **Hub introductions**: a newcomer receives a peer list and one paced
//!    introduce message per existing peer
//! 3. **Introduced handshake**: two spokes negotiate through the hub and end
//!    with a direct link of their own
//! 4. **Routing**: cached relay decisions hold until the TTL runs out

use crate::test_utils::*;
use lanthorn_core::MeshConfig;
use lanthorn_mesh::introduction::{IntroducePayload, PeerListPayload};
use lanthorn_mesh::mock::{MockRelay, MockRendezvous, MockRtcNetwork};
use lanthorn_mesh::routing::DIRECT_CHANNEL;
use lanthorn_mesh::{
    ConnectionMethod, ConnectionState, HybridMessageRouter, IntroductionAction,
    IntroductionMessage, Route,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_pool_broadcast_and_cleanup_over_negotiated_links() {
    lanthorn_core::logging::try_init_for_tests();
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let hub = TestNode::new(&rendezvous, &network, "hub");
    let p1 = TestNode::new(&rendezvous, &network, "p1");
    let p2 = TestNode::new(&rendezvous, &network, "p2");

    connect_pair(&hub, &p1).await.unwrap();
    connect_pair(&hub, &p2).await.unwrap();
    assert_eq!(hub.pool.connected_peers(), vec!["p1".to_string(), "p2".to_string()]);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _sub = p1
        .pool
        .get("hub")
        .unwrap()
        .subscribe_messages(move |data| sink.lock().push(data.clone()));

    let report = hub.pool.broadcast(b"hello").await;
    assert_eq!(report.sent_count, 2);
    assert_eq!(received.lock().clone(), vec![b"hello".to_vec()]);

    hub.factory
        .transport("p1")
        .unwrap()
        .force_state(ConnectionState::Failed);
    assert_eq!(hub.pool.cleanup().await, 1);
    assert!(!hub.pool.has("p1"));
    assert_eq!(hub.pool.connected_peers(), vec!["p2".to_string()]);

    // p2's side is untouched
    assert!(p2.pool.get("hub").unwrap().is_channel_open());
}

#[tokio::test]
async fn test_hub_introduces_newcomer_to_existing_peers() {
    lanthorn_core::logging::try_init_for_tests();
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let hub = TestNode::new(&rendezvous, &network, "hub");
    let a = TestNode::new(&rendezvous, &network, "a");
    let b = TestNode::new(&rendezvous, &network, "b");
    let newcomer = TestNode::new(&rendezvous, &network, "new");

    hub.mesh.join_room("lobby").await.unwrap();
    a.mesh.join_room("lobby").await.unwrap();
    b.mesh.join_room("lobby").await.unwrap();
    // identities settle before the hub starts watching for newcomers
    assert!(
        wait_until(TIMEOUT, || {
            hub.mesh.connected_peers().iter().all(|p| p.fingerprint.is_some())
        })
        .await
    );
    let _introduction = hub.introduction(true);

    let (log, _sub) = record::<IntroductionMessage>(&newcomer.mesh);
    newcomer.mesh.join_room("lobby").await.unwrap();
    assert!(wait_until(TIMEOUT, || log.lock().len() >= 3).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let messages = log.lock().clone();
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|(sender, _)| sender == "hub"));

    let IntroductionAction::PeerList(PeerListPayload { peers }) = &messages[0].1.action else {
        panic!("expected a peer list first, got {:?}", messages[0].1.action);
    };
    let mut peers = peers.clone();
    peers.sort();
    assert_eq!(peers, vec!["a".to_string(), "b".to_string()]);

    let mut introduced: Vec<(String, Option<String>, bool)> = messages[1..]
        .iter()
        .map(|(_, m)| match &m.action {
            IntroductionAction::Introduce(IntroducePayload {
                peer_id,
                fingerprint,
                initiator,
            }) => (peer_id.clone(), fingerprint.clone(), *initiator),
            other => panic!("expected introduce, got {other:?}"),
        })
        .collect();
    introduced.sort();
    // "new" sorts after both, so the existing peers open the connections
    assert_eq!(
        introduced,
        vec![
            ("a".to_string(), Some("fp-a".to_string()), false),
            ("b".to_string(), Some("fp-b".to_string()), false),
        ]
    );

    // rounds are paced
    let gap = messages[2].1.timestamp.saturating_sub(messages[1].1.timestamp);
    assert!(gap >= 20, "introduce rounds {gap}ms apart");
}

#[tokio::test]
async fn test_introduced_spokes_end_with_direct_link() {
    lanthorn_core::logging::try_init_for_tests();
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let hub = TestNode::new(&rendezvous, &network, "hub");
    let alice = TestNode::new(&rendezvous, &network, "alice");
    let bob = TestNode::new(&rendezvous, &network, "bob");

    let _hub_intro = hub.introduction(true);
    let _alice_intro = alice.introduction(false);
    let bob_intro = bob.introduction(false);

    hub.mesh.join_room("lobby").await.unwrap();
    alice.mesh.join_room("lobby").await.unwrap();
    assert!(wait_until(TIMEOUT, || hub.mesh.peer("alice").and_then(|p| p.fingerprint).is_some()).await);
    bob.mesh.join_room("lobby").await.unwrap();

    let linked = |node: &TestNode, other: &str| {
        node.pool
            .get(other)
            .map(|c| c.connection_state() == ConnectionState::Connected && c.is_channel_open())
            .unwrap_or(false)
    };
    assert!(wait_until(TIMEOUT, || linked(&alice, "bob") && linked(&bob, "alice")).await);

    // "alice" sorts first and made the offer
    assert!(alice.pool.get("bob").unwrap().is_initiator());
    assert!(!bob.pool.get("alice").unwrap().is_initiator());
    assert!(hub.pool.is_empty());
    assert_eq!(bob_intro.known_peers(), vec!["alice".to_string()]);

    let peer = alice.mesh.peer("bob").unwrap();
    assert_eq!(peer.connection_method, ConnectionMethod::Direct);
    assert_eq!(peer.fingerprint.as_deref(), Some("fp-bob"));

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _sub = bob
        .pool
        .get("alice")
        .unwrap()
        .subscribe_messages(move |data| sink.lock().push(data.clone()));
    assert!(alice.pool.get("bob").unwrap().send(b"ping".to_vec()).await);
    assert_eq!(received.lock().clone(), vec![b"ping".to_vec()]);

    // Dropping the direct link leaves bob reachable through the room
    alice.pool.get("bob").unwrap().close().await;
    assert!(
        wait_until(TIMEOUT, || {
            bob.mesh
                .peer("alice")
                .map(|p| p.connection_method == ConnectionMethod::RelaySignaled)
                .unwrap_or(false)
        })
        .await
    );
    assert!(bob.mesh.peer("alice").unwrap().is_connected());
}

#[tokio::test]
async fn test_routing_switches_to_direct_after_ttl() {
    lanthorn_core::logging::try_init_for_tests();
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let alice = TestNode::with_config(
        &rendezvous,
        &network,
        "alice",
        MeshConfig {
            routing_ttl_ms: 80,
            ..fast_mesh_config("alice")
        },
    );
    let bob = TestNode::new(&rendezvous, &network, "bob");
    let relay = MockRelay::new();
    let router = HybridMessageRouter::new(Arc::clone(&alice.mesh), relay.clone(), false);

    let direct = Arc::new(Mutex::new(Vec::new()));
    let sink = direct.clone();
    let _sub = bob
        .mesh
        .on_data(DIRECT_CHANNEL, move |m| sink.lock().push(m.payload.clone()));

    alice.mesh.join_room("lobby").await.unwrap();
    let outcome = router.send(&bob.fingerprint(), serde_json::json!("first")).await;
    assert_eq!(outcome.route, Route::Relay);
    assert!(outcome.success);

    bob.mesh.join_room("lobby").await.unwrap();
    assert!(wait_until(TIMEOUT, || alice.mesh.peer_by_fingerprint("fp-bob").is_some()).await);

    // still inside the TTL of the offline decision
    let outcome = router.send(&bob.fingerprint(), serde_json::json!("second")).await;
    assert_eq!(outcome.route, Route::Relay);
    assert_eq!(relay.published().len(), 2);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let outcome = router.send(&bob.fingerprint(), serde_json::json!("third")).await;
    assert_eq!(outcome.route, Route::Direct);
    assert_eq!(relay.published().len(), 2);
    assert_eq!(direct.lock().clone(), vec![serde_json::json!("third")]);

    let decision = alice.mesh.get_routing_decision("fp-bob");
    assert!(decision.is_online);
    assert_eq!(decision.confidence, 0.9);
}
