//! Mesh service
//!
//! Owns every joined [`Room`], merges peer sightings from all of them into
//! one [`PeerTable`], fans globally registered handlers out to each room and
//! answers routing questions for fingerprints.
//!
//! Handlers registered before a room is joined are attached when it joins;
//! handlers registered later are attached to every room already joined.

use lanthorn_core::{current_timestamp, MeshConfig, PeerId, Subject, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::message::{BinaryMessage, ChannelMessage, P2PMessage};
use crate::peer::{ConnectionMethod, MeshPeer, PeerTable, PeerUpdate};
use crate::room::{Room, RoomConfig, RoomState};
use crate::routing::{RoutingCache, RoutingDecision};
use crate::transport::SignalingStrategy;

/// Fingerprint announcement exchanged with every newly seen peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityAnnouncement {
    pub fingerprint: String,
}

impl ChannelMessage for IdentityAnnouncement {
    const CHANNEL: &'static str = "mesh-identity";
}

/// Failure raised from an event-driven path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshFault {
    pub room_id: Option<String>,
    pub peer_id: Option<PeerId>,
    pub reason: String,
}

/// Snapshot of the whole mesh
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatus {
    pub rooms: Vec<RoomState>,
    pub known_peers: usize,
    pub connected_peers: usize,
    pub cached_routes: usize,
}

type MessageHandler = Arc<dyn Fn(&P2PMessage) + Send + Sync>;
type BinaryHandler = Arc<dyn Fn(&BinaryMessage) + Send + Sync>;

#[derive(Clone)]
enum GlobalHandler {
    Message(String, MessageHandler),
    Binary(String, BinaryHandler),
}

impl GlobalHandler {
    fn attach(&self, room: &Room) -> Subscription {
        match self {
            GlobalHandler::Message(channel, handler) => {
                let handler = Arc::clone(handler);
                room.on_message(channel, move |m| handler(m))
            }
            GlobalHandler::Binary(channel, handler) => {
                let handler = Arc::clone(handler);
                room.on_binary(channel, move |m| handler(m))
            }
        }
    }
}

struct RoomEntry {
    room: Arc<Room>,
    /// Aggregation wiring, cancelled when the room is left
    wiring: Vec<Subscription>,
    /// Global handler id -> its subscription on this room
    handlers: HashMap<u64, Subscription>,
}

pub struct MeshService {
    config: MeshConfig,
    strategy: Arc<dyn SignalingStrategy>,
    rooms: Mutex<HashMap<String, RoomEntry>>,
    join_lock: tokio::sync::Mutex<()>,
    peers: Mutex<PeerTable>,
    routing: Mutex<RoutingCache>,
    handlers: Mutex<BTreeMap<u64, GlobalHandler>>,
    next_handler_id: AtomicU64,
    shut_down: AtomicBool,
    peer_joined: Subject<MeshPeer>,
    peer_left: Subject<MeshPeer>,
    faults: Subject<MeshFault>,
}

impl MeshService {
    pub fn new(config: MeshConfig, strategy: Arc<dyn SignalingStrategy>) -> Arc<Self> {
        let ttl = config.routing_ttl();
        Arc::new(Self {
            config,
            strategy,
            rooms: Mutex::new(HashMap::new()),
            join_lock: tokio::sync::Mutex::new(()),
            peers: Mutex::new(PeerTable::new()),
            routing: Mutex::new(RoutingCache::new(ttl)),
            handlers: Mutex::new(BTreeMap::new()),
            next_handler_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            peer_joined: Subject::new(),
            peer_left: Subject::new(),
            faults: Subject::new(),
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn local_fingerprint(&self) -> Option<&str> {
        self.config.local_fingerprint.as_deref()
    }

    /// Our transport id, taken from any joined room
    pub fn self_id(&self) -> Option<PeerId> {
        self.rooms.lock().values().find_map(|entry| entry.room.self_id())
    }

    /// Room config for `room_id` using this service's app id and ICE servers
    pub fn room_config(&self, room_id: &str) -> RoomConfig {
        let mut config = RoomConfig::new(room_id, self.config.app_id.clone())
            .with_strategy(self.strategy.kind());
        config.ice_servers = self.config.ice_servers.clone();
        config
    }

    pub async fn join_room(self: &Arc<Self>, room_id: &str) -> MeshResult<RoomState> {
        let config = self.room_config(room_id);
        self.join_room_with(config, ConnectionMethod::RelaySignaled)
            .await
    }

    /// Join a room, or return its state if already joined. Peers seen in it
    /// are recorded with `method`.
    pub async fn join_room_with(
        self: &Arc<Self>,
        config: RoomConfig,
        method: ConnectionMethod,
    ) -> MeshResult<RoomState> {
        let _guard = self.join_lock.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MeshError::ShutDown);
        }
        let room_id = config.room_id.clone();
        if let Some(entry) = self.rooms.lock().get(&room_id) {
            return Ok(entry.room.state());
        }

        let room = Room::new(config, Arc::clone(&self.strategy), self.config.heartbeat_interval());
        let wiring = self.wire_room(&room, method);

        if let Err(e) = room.join().await {
            warn!(room_id = %room_id, error = %e, "Room join failed");
            self.faults.emit(&MeshFault {
                room_id: Some(room_id.clone()),
                peer_id: None,
                reason: e.to_string(),
            });
            for subscription in wiring {
                subscription.cancel();
            }
            return Err(e);
        }

        self.rooms.lock().insert(
            room_id.clone(),
            RoomEntry {
                room: Arc::clone(&room),
                wiring,
                handlers: HashMap::new(),
            },
        );

        let handlers: Vec<(u64, GlobalHandler)> = self
            .handlers
            .lock()
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();
        for (id, handler) in handlers {
            self.attach_handler(&room_id, &room, id, &handler);
        }

        info!(room_id = %room_id, rooms = self.rooms.lock().len(), "Mesh joined room");
        Ok(room.state())
    }

    pub async fn leave_room(&self, room_id: &str) -> bool {
        let entry = self.rooms.lock().remove(room_id);
        let Some(entry) = entry else {
            return false;
        };
        // leave while wired so departures reach the peer table
        entry.room.leave().await;
        for subscription in entry.wiring {
            subscription.cancel();
        }
        for (_, subscription) in entry.handlers {
            subscription.cancel();
        }
        info!(room_id, "Mesh left room");
        true
    }

    /// Leave every room and drop all handlers. Further joins fail.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let room_ids: Vec<String> = self.rooms.lock().keys().cloned().collect();
        for room_id in room_ids {
            self.leave_room(&room_id).await;
        }
        self.handlers.lock().clear();
        self.routing.lock().clear();
        info!("Mesh service shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().get(room_id).map(|e| Arc::clone(&e.room))
    }

    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    pub fn peers(&self) -> Vec<MeshPeer> {
        self.peers.lock().all()
    }

    pub fn peer(&self, peer_id: &str) -> Option<MeshPeer> {
        self.peers.lock().get(peer_id).cloned()
    }

    pub fn connected_peers(&self) -> Vec<MeshPeer> {
        self.peers.lock().connected()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers.lock().connected_count()
    }

    pub fn peer_by_fingerprint(&self, fingerprint: &str) -> Option<MeshPeer> {
        self.peers
            .lock()
            .find_connected_by_fingerprint(fingerprint)
            .cloned()
    }

    /// Record a peer reached outside the room layer
    pub fn register_peer(
        &self,
        peer_id: &str,
        method: ConnectionMethod,
        fingerprint: Option<String>,
    ) {
        let (update, snapshot) = {
            let mut peers = self.peers.lock();
            let update = peers.record_direct(peer_id, method, fingerprint, current_timestamp());
            (update, peers.get(peer_id).cloned())
        };
        if let (PeerUpdate::Connected, Some(peer)) = (update, snapshot) {
            info!(peer_id, method = ?method, "Peer connected");
            self.peer_joined.emit(&peer);
        }
    }

    /// Drop a direct link recorded with [`register_peer`](Self::register_peer)
    pub fn unregister_peer(&self, peer_id: &str) {
        let (update, snapshot) = {
            let mut peers = self.peers.lock();
            let update = peers.mark_disconnected(peer_id);
            (update, peers.get(peer_id).cloned())
        };
        if let (PeerUpdate::Disconnected, Some(peer)) = (update, snapshot) {
            info!(peer_id, "Peer disconnected");
            self.peer_left.emit(&peer);
        }
    }

    pub fn on_peer_joined<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&MeshPeer) + Send + Sync + 'static,
    {
        self.peer_joined.subscribe(handler)
    }

    pub fn on_peer_left<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&MeshPeer) + Send + Sync + 'static,
    {
        self.peer_left.subscribe(handler)
    }

    pub fn on_fault<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&MeshFault) + Send + Sync + 'static,
    {
        self.faults.subscribe(handler)
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send on a channel of one joined room
    pub async fn send(
        &self,
        room_id: &str,
        channel: &str,
        payload: serde_json::Value,
        target: Option<&PeerId>,
    ) -> MeshResult<P2PMessage> {
        let room = self.room(room_id).ok_or_else(|| MeshError::RoomNotJoined {
            room_id: room_id.to_string(),
        })?;
        room.send(channel, payload, target).await
    }

    /// Send to one peer through any room it is present in
    pub async fn send_to_peer(
        &self,
        peer_id: &str,
        channel: &str,
        payload: serde_json::Value,
    ) -> MeshResult<P2PMessage> {
        let room = self.room_for_peer(peer_id)?;
        room.send(channel, payload, Some(&peer_id.to_string())).await
    }

    pub async fn send_typed_to_peer<M: ChannelMessage>(
        &self,
        peer_id: &str,
        message: &M,
    ) -> MeshResult<P2PMessage> {
        let payload = serde_json::to_value(message)?;
        self.send_to_peer(peer_id, M::CHANNEL, payload).await
    }

    /// Broadcast on a channel of every joined room, returning how many rooms
    /// accepted the message
    pub async fn broadcast(&self, channel: &str, payload: serde_json::Value) -> usize {
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .lock()
            .values()
            .map(|e| Arc::clone(&e.room))
            .collect();
        let mut sent = 0;
        for room in rooms {
            match room.send(channel, payload.clone(), None).await {
                Ok(_) => sent += 1,
                Err(e) => debug!(room_id = room.room_id(), channel, error = %e, "Broadcast failed"),
            }
        }
        sent
    }

    pub async fn broadcast_typed<M: ChannelMessage>(&self, message: &M) -> MeshResult<usize> {
        let payload = serde_json::to_value(message)?;
        Ok(self.broadcast(M::CHANNEL, payload).await)
    }

    /// Handle messages on `channel` from every room, joined now or later
    pub fn on_data<F>(self: &Arc<Self>, channel: &str, handler: F) -> Subscription
    where
        F: Fn(&P2PMessage) + Send + Sync + 'static,
    {
        self.register_handler(GlobalHandler::Message(channel.to_string(), Arc::new(handler)))
    }

    pub fn on_binary<F>(self: &Arc<Self>, channel: &str, handler: F) -> Subscription
    where
        F: Fn(&BinaryMessage) + Send + Sync + 'static,
    {
        self.register_handler(GlobalHandler::Binary(channel.to_string(), Arc::new(handler)))
    }

    /// Handle decoded messages of type `M` from every room
    pub fn on_typed<M, F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        M: ChannelMessage,
        F: Fn(M, &P2PMessage) + Send + Sync + 'static,
    {
        self.on_data(M::CHANNEL, move |message| {
            match serde_json::from_value::<M>(message.payload.clone()) {
                Ok(decoded) => handler(decoded, message),
                Err(e) => warn!(
                    channel = M::CHANNEL,
                    sender = %message.sender_id,
                    error = %e,
                    "Undecodable payload dropped"
                ),
            }
        })
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Route for a fingerprint. Within the TTL the cached decision is
    /// returned unchanged.
    pub fn get_routing_decision(&self, fingerprint: &str) -> RoutingDecision {
        let now = Instant::now();
        if let Some(cached) = self.routing.lock().lookup(fingerprint, now) {
            return cached;
        }

        let is_online = self
            .peers
            .lock()
            .find_connected_by_fingerprint(fingerprint)
            .is_some();
        let decision = RoutingDecision::compute(fingerprint, is_online, self.config.prefer_direct);
        debug!(fingerprint, route = ?decision.route, is_online, "Routing decision computed");

        let mut cache = self.routing.lock();
        cache.prune(now);
        cache.insert(decision.clone(), now);
        decision
    }

    pub fn status(&self) -> MeshStatus {
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .lock()
            .values()
            .map(|e| Arc::clone(&e.room))
            .collect();
        let mut rooms: Vec<RoomState> = rooms.iter().map(|r| r.state()).collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));

        let (known_peers, connected_peers) = {
            let peers = self.peers.lock();
            (peers.len(), peers.connected_count())
        };
        MeshStatus {
            rooms,
            known_peers,
            connected_peers,
            cached_routes: self.routing.lock().len(),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn room_for_peer(&self, peer_id: &str) -> MeshResult<Arc<Room>> {
        let rooms = self.rooms.lock();
        let mut candidates: Vec<&RoomEntry> = rooms.values().collect();
        candidates.sort_by(|a, b| a.room.room_id().cmp(b.room.room_id()));
        candidates
            .into_iter()
            .find(|entry| entry.room.has_peer(peer_id))
            .map(|entry| Arc::clone(&entry.room))
            .ok_or_else(|| MeshError::PeerNotFound {
                peer_id: peer_id.to_string(),
            })
    }

    fn wire_room(self: &Arc<Self>, room: &Arc<Room>, method: ConnectionMethod) -> Vec<Subscription> {
        let room_id = room.room_id().to_string();

        let weak = Arc::downgrade(self);
        let weak_room = Arc::downgrade(room);
        let joined_room_id = room_id.clone();
        let joins = room.on_peer_join(move |peer_id| {
            if let Some(service) = weak.upgrade() {
                service.handle_room_join(&joined_room_id, peer_id, method, &weak_room);
            }
        });

        let weak = Arc::downgrade(self);
        let left_room_id = room_id.clone();
        let leaves = room.on_peer_leave(move |peer_id| {
            if let Some(service) = weak.upgrade() {
                service.handle_room_leave(&left_room_id, peer_id);
            }
        });

        let weak = Arc::downgrade(self);
        let identities = room.on_typed::<IdentityAnnouncement, _>(move |announcement, message| {
            if let Some(service) = weak.upgrade() {
                service.bind_fingerprint(&message.sender_id, &announcement.fingerprint);
            }
        });

        vec![joins, leaves, identities]
    }

    fn handle_room_join(
        &self,
        room_id: &str,
        peer_id: &PeerId,
        method: ConnectionMethod,
        room: &Weak<Room>,
    ) {
        let (update, snapshot) = {
            let mut peers = self.peers.lock();
            let update = peers.record_join(peer_id, room_id, method, current_timestamp());
            (update, peers.get(peer_id).cloned())
        };
        if let (PeerUpdate::Connected, Some(peer)) = (update, snapshot) {
            info!(peer_id = %peer_id, room_id, "Peer connected");
            self.peer_joined.emit(&peer);
        }

        if let (Some(fingerprint), Some(room)) = (self.config.local_fingerprint.clone(), room.upgrade()) {
            let target = peer_id.clone();
            tokio::spawn(async move {
                let announcement = IdentityAnnouncement { fingerprint };
                if let Err(e) = room.send_typed(&announcement, Some(&target)).await {
                    debug!(peer_id = %target, error = %e, "Identity announcement failed");
                }
            });
        }
    }

    fn handle_room_leave(&self, room_id: &str, peer_id: &PeerId) {
        let (update, snapshot) = {
            let mut peers = self.peers.lock();
            let update = peers.record_leave(peer_id, room_id, current_timestamp());
            (update, peers.get(peer_id).cloned())
        };
        if let (PeerUpdate::Disconnected, Some(peer)) = (update, snapshot) {
            info!(peer_id = %peer_id, room_id, "Peer disconnected");
            self.peer_left.emit(&peer);
        }
    }

    fn bind_fingerprint(&self, peer_id: &str, fingerprint: &str) {
        if self.peers.lock().bind_fingerprint(peer_id, fingerprint) {
            debug!(peer_id, fingerprint, "Fingerprint bound");
        }
    }

    fn register_handler(self: &Arc<Self>, handler: GlobalHandler) -> Subscription {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().insert(id, handler.clone());

        let rooms: Vec<(String, Arc<Room>)> = self
            .rooms
            .lock()
            .iter()
            .map(|(room_id, e)| (room_id.clone(), Arc::clone(&e.room)))
            .collect();
        for (room_id, room) in rooms {
            self.attach_handler(&room_id, &room, id, &handler);
        }

        let weak = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(service) = weak.upgrade() {
                service.remove_handler(id);
            }
        })
    }

    /// Attach one global handler to one room, at most once
    fn attach_handler(&self, room_id: &str, room: &Room, id: u64, handler: &GlobalHandler) {
        if self
            .rooms
            .lock()
            .get(room_id)
            .map_or(true, |e| e.handlers.contains_key(&id))
        {
            return;
        }
        let subscription = handler.attach(room);

        let duplicate = {
            let mut rooms = self.rooms.lock();
            match rooms.get_mut(room_id) {
                Some(entry) if !entry.handlers.contains_key(&id) => {
                    entry.handlers.insert(id, subscription);
                    None
                }
                _ => Some(subscription),
            }
        };
        if let Some(subscription) = duplicate {
            subscription.cancel();
        }
    }

    fn remove_handler(&self, id: u64) {
        self.handlers.lock().remove(&id);
        let subscriptions: Vec<Subscription> = self
            .rooms
            .lock()
            .values_mut()
            .filter_map(|e| e.handlers.remove(&id))
            .collect();
        for subscription in subscriptions {
            subscription.cancel();
        }
    }
}

impl std::fmt::Debug for MeshService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshService")
            .field("app_id", &self.config.app_id)
            .field("rooms", &self.room_ids())
            .finish()
    }
}
