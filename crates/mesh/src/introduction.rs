//! Peer introduction
//!
//! Grows the mesh by letting a well-connected peer (the hub) introduce a
//! newcomer to every peer it already knows. The hub sends the newcomer a
//! peer list, then runs one paced round per existing peer, telling both
//! sides about each other and which of them opens the connection.
//!
//! The hub never produces session descriptions. The initiating side makes
//! its own offer through its connection pool; offers, answers and ICE
//! candidates travel back and forth through the hub, which reads only the
//! target id and forwards the payload untouched.

use lanthorn_core::{current_timestamp, IntroductionConfig, PeerId, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::connection::PeerConnection;
use crate::error::{MeshError, MeshResult};
use crate::message::ChannelMessage;
use crate::peer::ConnectionMethod;
use crate::pool::PeerConnectionPool;
use crate::service::MeshService;
use crate::transport::{ConnectionState, IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntroductionTag {
    #[default]
    Introduction,
}

/// Envelope for every introduction protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntroductionMessage {
    #[serde(rename = "type")]
    pub tag: IntroductionTag,
    #[serde(flatten)]
    pub action: IntroductionAction,
    pub from_peer_id: PeerId,
    pub timestamp: u64,
}

impl IntroductionMessage {
    pub fn new(action: IntroductionAction, from_peer_id: impl Into<PeerId>) -> Self {
        Self {
            tag: IntroductionTag::Introduction,
            action,
            from_peer_id: from_peer_id.into(),
            timestamp: current_timestamp(),
        }
    }
}

impl ChannelMessage for IntroductionMessage {
    const CHANNEL: &'static str = "introduction";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "kebab-case")]
pub enum IntroductionAction {
    PeerList(PeerListPayload),
    Introduce(IntroducePayload),
    OfferRelay(RelayEnvelope),
    AnswerRelay(RelayEnvelope),
    CandidateRelay(RelayEnvelope),
}

impl IntroductionAction {
    fn name(&self) -> &'static str {
        match self {
            IntroductionAction::PeerList(_) => "peer-list",
            IntroductionAction::Introduce(_) => "introduce",
            IntroductionAction::OfferRelay(_) => "offer-relay",
            IntroductionAction::AnswerRelay(_) => "answer-relay",
            IntroductionAction::CandidateRelay(_) => "candidate-relay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerListPayload {
    pub peers: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntroducePayload {
    /// The peer being introduced
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Whether the receiver opens the connection
    pub initiator: bool,
}

/// Signaling payload relayed through the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    pub target_peer_id: PeerId,
    pub origin_peer_id: PeerId,
    /// Opaque to the hub
    pub data: serde_json::Value,
}

type RelayKind = fn(RelayEnvelope) -> IntroductionAction;

/// Most peers remembered from gossip
pub const KNOWN_PEER_LIMIT: usize = 256;

pub struct PeerIntroduction {
    mesh: Arc<MeshService>,
    pool: Arc<PeerConnectionPool>,
    config: IntroductionConfig,
    /// Gossiped peer -> the peer that told us about it
    known_peers: Mutex<BTreeMap<PeerId, PeerId>>,
    /// Counterpart -> hub that relays our signaling to it
    hubs: Mutex<HashMap<PeerId, PeerId>>,
    fingerprints: Mutex<HashMap<PeerId, String>>,
    wired: Mutex<HashMap<PeerId, Vec<Subscription>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    self_ref: Weak<Self>,
}

impl PeerIntroduction {
    pub fn new(
        mesh: Arc<MeshService>,
        pool: Arc<PeerConnectionPool>,
        config: IntroductionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            mesh,
            pool,
            config,
            known_peers: Mutex::new(BTreeMap::new()),
            hubs: Mutex::new(HashMap::new()),
            fingerprints: Mutex::new(HashMap::new()),
            wired: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Listen for introduction messages and, as a hub, for newcomers
    pub fn start(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        subscriptions.push(self.mesh.on_typed::<IntroductionMessage, _>(move |message, raw| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let sender = raw.sender_id.clone();
            tokio::spawn(async move {
                let action = message.action.name();
                if let Err(e) = this.handle_message(message, &sender).await {
                    warn!(sender = %sender, action, error = %e, "Introduction step failed");
                }
            });
        }));

        let weak = Arc::downgrade(self);
        subscriptions.push(self.mesh.on_peer_left(move |peer| {
            if let Some(this) = weak.upgrade() {
                this.forget(&peer.peer_id);
            }
        }));

        if self.config.act_as_hub {
            let weak = Arc::downgrade(self);
            subscriptions.push(self.mesh.on_peer_joined(move |peer| {
                if peer.connection_method == ConnectionMethod::Direct {
                    return;
                }
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let newcomer = peer.peer_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(this.config.settle_delay()).await;
                    if let Err(e) = this.introduce(&newcomer).await {
                        warn!(peer_id = %newcomer, error = %e, "Introduction failed");
                    }
                });
            }));
        }
        info!(hub = self.config.act_as_hub, "Peer introduction started");
    }

    pub fn stop(&self) {
        let subscriptions: Vec<Subscription> = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            subscription.cancel();
        }
        let wired: Vec<Subscription> = self
            .wired
            .lock()
            .drain()
            .flat_map(|(_, subs)| subs)
            .collect();
        for subscription in wired {
            subscription.cancel();
        }
    }

    /// Peers learned from peer lists and introductions, sorted
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.known_peers.lock().keys().cloned().collect()
    }

    /// Hub side: introduce `newcomer` to every other connected peer
    pub async fn introduce(&self, newcomer: &str) -> MeshResult<()> {
        let me = self.mesh.self_id().ok_or(MeshError::NoRooms)?;
        let existing: Vec<_> = self
            .mesh
            .connected_peers()
            .into_iter()
            .filter(|p| p.peer_id != newcomer && p.peer_id != me)
            .collect();
        if existing.is_empty() {
            debug!(peer_id = newcomer, "No peers to introduce");
            return Ok(());
        }

        let peers: Vec<PeerId> = existing.iter().map(|p| p.peer_id.clone()).collect();
        self.send(
            newcomer,
            IntroductionMessage::new(IntroductionAction::PeerList(PeerListPayload { peers }), &me),
        )
        .await?;

        let newcomer_fingerprint = self.mesh.peer(newcomer).and_then(|p| p.fingerprint);
        for (round, peer) in existing.iter().enumerate() {
            if round > 0 {
                tokio::time::sleep(self.config.round_delay()).await;
            }
            // the lower id opens the connection, whichever hub introduces
            let newcomer_initiates = newcomer < peer.peer_id.as_str();

            let to_newcomer = IntroductionAction::Introduce(IntroducePayload {
                peer_id: peer.peer_id.clone(),
                fingerprint: peer.fingerprint.clone(),
                initiator: newcomer_initiates,
            });
            let to_existing = IntroductionAction::Introduce(IntroducePayload {
                peer_id: newcomer.to_string(),
                fingerprint: newcomer_fingerprint.clone(),
                initiator: !newcomer_initiates,
            });
            self.send(newcomer, IntroductionMessage::new(to_newcomer, &me)).await?;
            if let Err(e) = self
                .send(&peer.peer_id, IntroductionMessage::new(to_existing, &me))
                .await
            {
                warn!(peer_id = %peer.peer_id, error = %e, "Could not reach existing peer");
            }
            debug!(newcomer, peer_id = %peer.peer_id, round, "Introduced peers");
        }
        info!(newcomer, introduced = existing.len(), "Introduction rounds complete");
        Ok(())
    }

    async fn handle_message(&self, message: IntroductionMessage, sender: &PeerId) -> MeshResult<()> {
        let me = self.mesh.self_id().ok_or(MeshError::NoRooms)?;
        match message.action {
            IntroductionAction::PeerList(list) => {
                self.learn_peer_list(sender, list.peers, &me);
                Ok(())
            }
            IntroductionAction::Introduce(intro) => self.accept_introduction(intro, sender).await,
            IntroductionAction::OfferRelay(envelope) if envelope.target_peer_id != me => {
                self.forward(envelope, IntroductionAction::OfferRelay, &me).await
            }
            IntroductionAction::AnswerRelay(envelope) if envelope.target_peer_id != me => {
                self.forward(envelope, IntroductionAction::AnswerRelay, &me).await
            }
            IntroductionAction::CandidateRelay(envelope) if envelope.target_peer_id != me => {
                self.forward(envelope, IntroductionAction::CandidateRelay, &me).await
            }
            IntroductionAction::OfferRelay(envelope) => self.accept_offer(envelope, sender).await,
            IntroductionAction::AnswerRelay(envelope) => self.accept_answer(envelope).await,
            IntroductionAction::CandidateRelay(envelope) => {
                self.accept_candidate(envelope, sender).await
            }
        }
    }

    async fn accept_introduction(&self, intro: IntroducePayload, hub: &PeerId) -> MeshResult<()> {
        let peer_id = intro.peer_id.clone();
        Self::remember(&mut self.known_peers.lock(), &peer_id, hub);
        self.hubs.lock().insert(peer_id.clone(), hub.clone());
        if let Some(fingerprint) = intro.fingerprint {
            self.fingerprints.lock().insert(peer_id.clone(), fingerprint);
        }

        if let Some(existing) = self.pool.get(&peer_id) {
            if !existing.connection_state().is_dead() {
                debug!(peer_id = %peer_id, "Already connecting, introduction ignored");
                return Ok(());
            }
        }
        if !intro.initiator {
            debug!(peer_id = %peer_id, "Waiting for introduced peer to offer");
            return Ok(());
        }

        let connection = self.connection(&peer_id, true).await?;
        let offer = connection.create_offer().await?;
        self.relay(&peer_id, IntroductionAction::OfferRelay, serde_json::to_value(&offer)?)
            .await
    }

    async fn accept_offer(&self, envelope: RelayEnvelope, hub: &PeerId) -> MeshResult<()> {
        let origin = envelope.origin_peer_id.clone();
        self.hubs
            .lock()
            .entry(origin.clone())
            .or_insert_with(|| hub.clone());
        let offer: SessionDescription = self.decode(&envelope)?;

        let connection = self.connection(&origin, false).await?;
        let answer = connection.handle_offer(offer).await?;
        self.relay(&origin, IntroductionAction::AnswerRelay, serde_json::to_value(&answer)?)
            .await
    }

    async fn accept_answer(&self, envelope: RelayEnvelope) -> MeshResult<()> {
        let answer: SessionDescription = self.decode(&envelope)?;
        let connection = self
            .pool
            .get(&envelope.origin_peer_id)
            .ok_or_else(|| MeshError::Protocol {
                peer_id: envelope.origin_peer_id.clone(),
                reason: "answer without a pending offer".to_string(),
            })?;
        connection.handle_answer(answer).await
    }

    async fn accept_candidate(&self, envelope: RelayEnvelope, hub: &PeerId) -> MeshResult<()> {
        let origin = envelope.origin_peer_id.clone();
        self.hubs
            .lock()
            .entry(origin.clone())
            .or_insert_with(|| hub.clone());
        let candidate: IceCandidate = self.decode(&envelope)?;

        // a candidate can overtake the offer it belongs to
        let connection = match self.pool.get(&origin) {
            Some(connection) => connection,
            None => self.connection(&origin, false).await?,
        };
        connection.add_ice_candidate(candidate).await
    }

    async fn forward(&self, envelope: RelayEnvelope, kind: RelayKind, me: &str) -> MeshResult<()> {
        let target = envelope.target_peer_id.clone();
        if !self.config.act_as_hub {
            warn!(
                from = %envelope.origin_peer_id,
                to = %target,
                "Not a hub, signaling for another peer dropped"
            );
            return Ok(());
        }
        debug!(from = %envelope.origin_peer_id, to = %target, "Forwarding signaling");
        self.send(&target, IntroductionMessage::new(kind(envelope), me))
            .await
    }

    /// Send signaling for `counterpart` through the hub that introduced us
    async fn relay(&self, counterpart: &str, kind: RelayKind, data: serde_json::Value) -> MeshResult<()> {
        let me = self.mesh.self_id().ok_or(MeshError::NoRooms)?;
        let hub = self
            .hubs
            .lock()
            .get(counterpart)
            .cloned()
            .ok_or_else(|| MeshError::PeerNotFound {
                peer_id: counterpart.to_string(),
            })?;
        let envelope = RelayEnvelope {
            target_peer_id: counterpart.to_string(),
            origin_peer_id: me.clone(),
            data,
        };
        self.send(&hub, IntroductionMessage::new(kind(envelope), &me))
            .await
    }

    /// Replace what `source` told us before with its latest peer list
    fn learn_peer_list(&self, source: &str, peers: Vec<PeerId>, me: &str) {
        let mut known = self.known_peers.lock();
        known.retain(|_, from| from.as_str() != source);
        for peer in peers.iter().filter(|p| p.as_str() != me) {
            if !Self::remember(&mut known, peer, source) {
                break;
            }
        }
    }

    fn remember(known: &mut BTreeMap<PeerId, PeerId>, peer_id: &str, source: &str) -> bool {
        if known.len() >= KNOWN_PEER_LIMIT && !known.contains_key(peer_id) {
            warn!(peer_id, source, limit = KNOWN_PEER_LIMIT, "Known peer limit reached");
            return false;
        }
        known.insert(peer_id.to_string(), source.to_string());
        true
    }

    /// Drop a departed peer and everything it vouched for
    fn forget(&self, peer_id: &str) {
        self.known_peers
            .lock()
            .retain(|peer, from| peer != peer_id && from != peer_id);
    }

    async fn send(&self, peer_id: &str, message: IntroductionMessage) -> MeshResult<()> {
        self.mesh.send_typed_to_peer(peer_id, &message).await?;
        Ok(())
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, envelope: &RelayEnvelope) -> MeshResult<T> {
        serde_json::from_value(envelope.data.clone()).map_err(|e| MeshError::Protocol {
            peer_id: envelope.origin_peer_id.clone(),
            reason: format!("malformed signaling payload: {e}"),
        })
    }

    /// Pooled connection to `peer_id`, replacing a dead one, wired to relay
    /// candidates and to report direct links to the mesh
    async fn connection(&self, peer_id: &str, initiator: bool) -> MeshResult<Arc<PeerConnection>> {
        let mut connection = self.pool.get_or_create(peer_id, initiator)?;
        if connection.connection_state().is_dead() {
            self.pool.remove(peer_id).await;
            self.unwire(peer_id);
            connection = self.pool.get_or_create(peer_id, initiator)?;
        }
        self.wire(peer_id, &connection);
        connection.initialize().await?;
        Ok(connection)
    }

    fn wire(&self, peer_id: &str, connection: &Arc<PeerConnection>) {
        let mut wired = self.wired.lock();
        if wired.contains_key(peer_id) {
            return;
        }

        let candidates = {
            let this = self.weak();
            let peer = peer_id.to_string();
            connection.subscribe_local_candidates(move |candidate| {
                let Some(this) = this.upgrade() else {
                    return;
                };
                let peer = peer.clone();
                let data = match serde_json::to_value(candidate) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(peer_id = %peer, error = %e, "Candidate not serializable");
                        return;
                    }
                };
                tokio::spawn(async move {
                    if let Err(e) = this.relay(&peer, IntroductionAction::CandidateRelay, data).await {
                        debug!(peer_id = %peer, error = %e, "Candidate relay failed");
                    }
                });
            })
        };

        let states = {
            let mesh = Arc::downgrade(&self.mesh);
            let this = self.weak();
            let peer = peer_id.to_string();
            connection.subscribe_state(move |state| {
                let (Some(mesh), Some(this)) = (mesh.upgrade(), this.upgrade()) else {
                    return;
                };
                match state {
                    ConnectionState::Connected => {
                        let fingerprint = this.fingerprints.lock().get(&peer).cloned();
                        info!(peer_id = %peer, "Direct connection established");
                        mesh.register_peer(&peer, ConnectionMethod::Direct, fingerprint);
                    }
                    ConnectionState::Disconnected
                    | ConnectionState::Failed
                    | ConnectionState::Closed => mesh.unregister_peer(&peer),
                    _ => {}
                }
            })
        };

        wired.insert(peer_id.to_string(), vec![candidates, states]);
    }

    fn unwire(&self, peer_id: &str) {
        let subscriptions = self.wired.lock().remove(peer_id);
        for subscription in subscriptions.into_iter().flatten() {
            subscription.cancel();
        }
    }

    fn weak(&self) -> Weak<Self> {
        self.self_ref.clone()
    }
}
