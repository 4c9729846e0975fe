//! App transfer scenarios
//!
//! Bundles move between in-process nodes over the `app-transfer` channel
//! and land in SQLite stores on disk.

use crate::test_utils::*;
use lanthorn_core::TransferConfig;
use lanthorn_mesh::mock::{MockRendezvous, MockRtcNetwork};
use lanthorn_transfer::{
    AppPackager, AppTransfer, BundleStore, CachedAsset, SqliteBundleStore, StaticAssetSource,
    TransferMessage, TransferPayload, TransferPhase, TransferProgress,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(3);

struct TransferNode {
    node: TestNode,
    store: Arc<SqliteBundleStore>,
    transfer: Arc<AppTransfer>,
    progress: Arc<Mutex<Vec<TransferProgress>>>,
    _progress_sub: lanthorn_core::Subscription,
}

impl TransferNode {
    fn new(
        rendezvous: &Arc<MockRendezvous>,
        network: &Arc<MockRtcNetwork>,
        id: &str,
        build: (&str, &str),
        auto_update: bool,
        db: &Path,
    ) -> Self {
        let (version, tag) = build;
        let node = TestNode::new(rendezvous, network, id);
        let config = TransferConfig {
            build_version: version.to_string(),
            settle_delay_ms: 10,
            chunk_pace_every: 2,
            chunk_pace_delay_ms: 2,
            auto_update,
            ..TransferConfig::default()
        };
        let packager = Arc::new(AppPackager::new(
            Arc::new(StaticAssetSource::new(app_assets(tag))),
            version,
        ));
        let store = Arc::new(SqliteBundleStore::open(db).unwrap());
        let as_store: Arc<dyn BundleStore> = store.clone();
        let transfer = AppTransfer::new(Arc::clone(&node.mesh), packager, as_store, config);
        transfer.start();

        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        let sub = transfer.subscribe_progress(move |p| sink.lock().push(p.clone()));
        Self {
            node,
            store,
            transfer,
            progress,
            _progress_sub: sub,
        }
    }

    fn stored_hash(&self) -> Option<String> {
        self.store.get_metadata().unwrap().map(|m| m.hash)
    }
}

fn app_assets(tag: &str) -> Vec<CachedAsset> {
    vec![
        CachedAsset::new("/index.html", format!("<title>{tag}</title>").into_bytes(), "text/html"),
        CachedAsset::new("/assets/app.js", format!("start('{tag}')").into_bytes(), "text/javascript"),
        CachedAsset::new("/assets/app.wasm", vec![0, 97, 115, 109, 1, 0, 0, 0], "application/wasm"),
    ]
}

#[tokio::test]
async fn test_three_chunk_bundle_arrives_in_order() {
    lanthorn_core::logging::try_init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let sender = TransferNode::new(&rendezvous, &network, "sender", ("1.1.0", "new"), false, &dir.path().join("s.db"));
    let x = TransferNode::new(&rendezvous, &network, "x", ("1.0.0", "old"), false, &dir.path().join("x.db"));

    let (log, _sub) = record::<TransferMessage>(&x.node.mesh);
    sender.node.mesh.join_room("lobby").await.unwrap();
    x.node.mesh.join_room("lobby").await.unwrap();

    x.transfer.request_bundle("sender").await.unwrap();
    assert!(wait_until(TIMEOUT, || x.stored_hash().is_some()).await);

    let kinds: Vec<&str> = log
        .lock()
        .iter()
        .map(|(_, m)| m.payload.kind())
        .filter(|kind| *kind != "version-info")
        .collect();
    assert_eq!(
        kinds,
        vec![
            "bundle-metadata",
            "bundle-chunk",
            "bundle-chunk",
            "bundle-chunk",
            "bundle-complete"
        ]
    );
    let complete = log.lock().iter().find_map(|(_, m)| match &m.payload {
        TransferPayload::BundleComplete { chunk_count, .. } => Some(*chunk_count),
        _ => None,
    });
    assert_eq!(complete, Some(3));
    assert_eq!(
        x.stored_hash(),
        Some(sender.transfer.local_version().unwrap().hash)
    );
}

#[tokio::test]
async fn test_update_spreads_from_seed_node() {
    lanthorn_core::logging::try_init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let seed = TransferNode::new(&rendezvous, &network, "seed", ("2.0.0", "v2"), false, &dir.path().join("seed.db"));
    let a = TransferNode::new(&rendezvous, &network, "a", ("1.0.0", "v1"), true, &dir.path().join("a.db"));
    let b = TransferNode::new(&rendezvous, &network, "b", ("1.0.0", "v1"), true, &dir.path().join("b.db"));

    for node in [&seed, &a, &b] {
        node.node.mesh.join_room("lobby").await.unwrap();
    }

    let seed_hash = seed.transfer.local_version().unwrap().hash;
    assert!(
        wait_until(TIMEOUT, || {
            a.stored_hash().as_deref() == Some(seed_hash.as_str())
                && b.stored_hash().as_deref() == Some(seed_hash.as_str())
        })
        .await
    );

    for node in [&a, &b] {
        assert!(node.store.is_trusted().unwrap());
        let index = node.store.get_asset("/index.html").unwrap().unwrap();
        assert_eq!(index.bytes, b"<title>v2</title>");
        assert_eq!(node.store.get_metadata().unwrap().unwrap().version, "2.0.0");
        let phases: Vec<TransferPhase> = node.progress.lock().iter().map(|p| p.phase).collect();
        assert_eq!(phases.first(), Some(&TransferPhase::Requesting));
        assert_eq!(phases.last(), Some(&TransferPhase::Complete));
    }

    // identical builds never ask each other, and the seed does not update
    assert!(seed.stored_hash().is_none());
    assert!(a.progress.lock().iter().all(|p| p.peer_id == "seed"));
}

#[tokio::test]
async fn test_trust_anchor_survives_restart() {
    lanthorn_core::logging::try_init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("receiver.db");

    let origin_hash = {
        let rendezvous = MockRendezvous::new();
        let network = MockRtcNetwork::new();
        let origin = TransferNode::new(&rendezvous, &network, "origin", ("1.1.0", "origin"), false, &dir.path().join("o.db"));
        let receiver = TransferNode::new(&rendezvous, &network, "receiver", ("1.0.0", "old"), false, &db);
        origin.node.mesh.join_room("lobby").await.unwrap();
        receiver.node.mesh.join_room("lobby").await.unwrap();

        receiver.transfer.request_bundle("origin").await.unwrap();
        assert!(wait_until(TIMEOUT, || receiver.stored_hash().is_some()).await);
        assert!(receiver.store.is_trusted().unwrap());
        origin.transfer.local_version().unwrap().hash
    };

    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let mirror = TransferNode::new(&rendezvous, &network, "mirror", ("1.2.0", "tampered build"), false, &dir.path().join("m.db"));
    let receiver = TransferNode::new(&rendezvous, &network, "receiver", ("1.0.0", "old"), false, &db);
    assert_eq!(receiver.store.trusted_hash().unwrap(), Some(origin_hash.clone()));

    mirror.node.mesh.join_room("lobby").await.unwrap();
    receiver.node.mesh.join_room("lobby").await.unwrap();
    receiver.transfer.request_bundle("mirror").await.unwrap();

    let mirror_hash = mirror.transfer.local_version().unwrap().hash;
    assert!(wait_until(TIMEOUT, || receiver.stored_hash().as_deref() == Some(mirror_hash.as_str())).await);

    assert!(!receiver.store.is_trusted().unwrap());
    assert_eq!(receiver.store.trusted_hash().unwrap(), Some(origin_hash));
    let index = receiver.store.get_asset("/index.html").unwrap().unwrap();
    assert_eq!(index.bytes, b"<title>tampered build</title>");

    let last = receiver.progress.lock().last().cloned().unwrap();
    assert_eq!(last.phase, TransferPhase::Complete);
    assert_eq!(last.trusted, Some(false));
}

#[tokio::test]
async fn test_pushed_bundle_cannot_anchor_trust() {
    lanthorn_core::logging::try_init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let rendezvous = MockRendezvous::new();
    let network = MockRtcNetwork::new();
    let pusher = TransferNode::new(&rendezvous, &network, "pusher", ("9.0.0", "pushed"), false, &dir.path().join("p.db"));
    let fresh = TransferNode::new(&rendezvous, &network, "fresh", ("1.0.0", "old"), false, &dir.path().join("f.db"));
    pusher.node.mesh.join_room("lobby").await.unwrap();
    fresh.node.mesh.join_room("lobby").await.unwrap();

    assert_eq!(pusher.transfer.send_bundle("fresh").await.unwrap(), 3);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(fresh.stored_hash().is_none());
    assert_eq!(fresh.store.trusted_hash().unwrap(), None);
    assert!(fresh.progress.lock().is_empty());
}
