//! Shared fixtures for the multi-node scenarios

use lanthorn_core::{DiscoveryConfig, IntroductionConfig, MeshConfig, PeerId, Subscription};
use lanthorn_mesh::mock::{MockRendezvous, MockRtcFactory, MockRtcNetwork};
use lanthorn_mesh::{
    ChannelMessage, MeshResult, MeshService, PeerConnectionPool, PeerIntroduction,
    RtcTransportFactory,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Fingerprint every test node announces
pub fn fingerprint_of(id: &str) -> String {
    format!("fp-{id}")
}

pub fn fast_mesh_config(id: &str) -> MeshConfig {
    MeshConfig {
        local_fingerprint: Some(fingerprint_of(id)),
        routing_ttl_ms: 60_000,
        ..MeshConfig::default()
    }
}

pub fn fast_discovery_config() -> DiscoveryConfig {
    DiscoveryConfig {
        auto_connect: false,
        settle_ms: 30,
        enable_local_network: false,
        ..DiscoveryConfig::default()
    }
}

pub fn fast_introduction_config(act_as_hub: bool) -> IntroductionConfig {
    IntroductionConfig {
        act_as_hub,
        settle_delay_ms: 10,
        round_delay_ms: 30,
    }
}

/// One in-process node: a mesh service plus a peer connection pool
pub struct TestNode {
    pub id: PeerId,
    pub mesh: Arc<MeshService>,
    pub factory: Arc<MockRtcFactory>,
    pub pool: Arc<PeerConnectionPool>,
}

impl TestNode {
    pub fn new(rendezvous: &Arc<MockRendezvous>, network: &Arc<MockRtcNetwork>, id: &str) -> Self {
        Self::with_config(rendezvous, network, id, fast_mesh_config(id))
    }

    pub fn with_config(
        rendezvous: &Arc<MockRendezvous>,
        network: &Arc<MockRtcNetwork>,
        id: &str,
        config: MeshConfig,
    ) -> Self {
        let ice_servers = config.ice_servers.clone();
        let factory = Arc::new(MockRtcFactory::new(Arc::clone(network), id));
        let as_factory: Arc<dyn RtcTransportFactory> = factory.clone();
        Self {
            id: id.to_string(),
            mesh: MeshService::new(config, rendezvous.strategy(id)),
            factory,
            pool: Arc::new(PeerConnectionPool::new(as_factory, ice_servers)),
        }
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.id)
    }

    /// Start the introduction protocol on this node
    pub fn introduction(&self, act_as_hub: bool) -> Arc<PeerIntroduction> {
        let introduction = PeerIntroduction::new(
            Arc::clone(&self.mesh),
            Arc::clone(&self.pool),
            fast_introduction_config(act_as_hub),
        );
        introduction.start();
        introduction
    }
}

/// Negotiate a direct connection from `offerer` to `answerer` by handing
/// the offer and answer across in-process
pub async fn connect_pair(offerer: &TestNode, answerer: &TestNode) -> MeshResult<()> {
    let outgoing = offerer.pool.get_or_create(&answerer.id, true)?;
    outgoing.initialize().await?;
    let incoming = answerer.pool.get_or_create(&offerer.id, false)?;
    incoming.initialize().await?;

    let offer = outgoing.create_offer().await?;
    let answer = incoming.handle_offer(offer).await?;
    outgoing.handle_answer(answer).await
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Capture every decoded `M` a node receives, with its sender
pub fn record<M>(mesh: &Arc<MeshService>) -> (Arc<Mutex<Vec<(PeerId, M)>>>, Subscription)
where
    M: ChannelMessage,
{
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let subscription = mesh.on_typed::<M, _>(move |message, raw| {
        sink.lock().push((raw.sender_id.clone(), message));
    });
    (log, subscription)
}
