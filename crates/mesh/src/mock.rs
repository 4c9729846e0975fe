//! Mock implementations for testing and simulation
//!
//! In-memory stand-ins for the rendezvous service, the peer transport and
//! the relay. Delivery is synchronous: a send invokes the receiving handler
//! before returning, and anything sent before a handler is installed is
//! buffered until one is.

use async_trait::async_trait;
use lanthorn_core::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::room::RoomConfig;
use crate::transport::{
    ActionChannel, ActionHandler, ConnectionState, DataChannel, DataHandler, IceCandidate,
    IceConnectionState, PeerHandler, RelayClient, RelayStatus, RoomHandle, RtcTransport,
    RtcTransportFactory, SdpKind, SessionDescription, SignalingStrategy, StrategyKind,
    TransportError, TransportEvent, TransportEventHandler,
};

// ============================================================================
// Mock Data Channel
// ============================================================================

/// One end of an in-memory data channel pair
pub struct MockDataChannel {
    label: String,
    open: Arc<AtomicBool>,
    remote: Mutex<Weak<MockDataChannel>>,
    handler: Mutex<Option<DataHandler>>,
    inbox: Mutex<Vec<Vec<u8>>>,
    fail_sends: AtomicBool,
}

impl MockDataChannel {
    fn unpaired(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: Arc::new(AtomicBool::new(false)),
            remote: Mutex::new(Weak::new()),
            handler: Mutex::new(None),
            inbox: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Create a connected, open pair of channels
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Self::unpaired(label);
        let b = Arc::new(Self {
            label: label.to_string(),
            open: Arc::clone(&a.open),
            remote: Mutex::new(Arc::downgrade(&a)),
            handler: Mutex::new(None),
            inbox: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        });
        *a.remote.lock() = Arc::downgrade(&b);
        a.open.store(true, Ordering::SeqCst);
        (a, b)
    }

    /// Create the far end for an existing unpaired channel and open both
    fn attach_remote(local: &Arc<Self>) -> Arc<Self> {
        let remote = Arc::new(Self {
            label: local.label.clone(),
            open: Arc::clone(&local.open),
            remote: Mutex::new(Arc::downgrade(local)),
            handler: Mutex::new(None),
            inbox: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        });
        *local.remote.lock() = Arc::downgrade(&remote);
        local.open.store(true, Ordering::SeqCst);
        remote
    }

    /// Make local enqueue fail without closing the channel
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn deliver(&self, data: Vec<u8>) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(data),
            None => self.inbox.lock().push(data),
        }
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("buffer full".to_string()));
        }
        let remote = self.remote.lock().upgrade();
        match remote {
            Some(remote) => {
                remote.deliver(data);
                Ok(())
            }
            None => Err(TransportError::Disconnected),
        }
    }

    fn on_message(&self, handler: DataHandler) {
        let buffered: Vec<Vec<u8>> = std::mem::take(&mut *self.inbox.lock());
        *self.handler.lock() = Some(Arc::clone(&handler));
        for data in buffered {
            handler(data);
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Mock Peer Transport
// ============================================================================

/// Shared registry linking offers and answers between mock transports
#[derive(Default)]
pub struct MockRtcNetwork {
    transports: Mutex<HashMap<String, Weak<MockRtcTransport>>>,
    next_id: AtomicU64,
}

impl MockRtcNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, transport: &Arc<MockRtcTransport>) {
        self.transports
            .lock()
            .insert(transport.id.clone(), Arc::downgrade(transport));
    }

    fn lookup(&self, token: &str) -> Option<Arc<MockRtcTransport>> {
        let id = token.rsplit(':').next()?;
        self.transports.lock().get(id).and_then(Weak::upgrade)
    }
}

/// Factory bound to one local node
pub struct MockRtcFactory {
    network: Arc<MockRtcNetwork>,
    local_id: String,
    created: Mutex<HashMap<PeerId, Arc<MockRtcTransport>>>,
}

impl MockRtcFactory {
    pub fn new(network: Arc<MockRtcNetwork>, local_id: impl Into<String>) -> Self {
        Self {
            network,
            local_id: local_id.into(),
            created: Mutex::new(HashMap::new()),
        }
    }

    /// Most recent transport created for `peer_id`
    pub fn transport(&self, peer_id: &str) -> Option<Arc<MockRtcTransport>> {
        self.created.lock().get(peer_id).cloned()
    }
}

impl RtcTransportFactory for MockRtcFactory {
    fn create(
        &self,
        peer_id: &str,
        _ice_servers: &[String],
    ) -> Result<Arc<dyn RtcTransport>, TransportError> {
        let n = self.network.next_id.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(MockRtcTransport {
            id: format!("{}-{}-{}", self.local_id, peer_id, n),
            handler: Mutex::new(None),
            queued: Mutex::new(Vec::new()),
            local_channel: Mutex::new(None),
            remote: Mutex::new(Weak::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            added_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            network: Arc::clone(&self.network),
        });
        self.network.register(&transport);
        self.created
            .lock()
            .insert(peer_id.to_string(), Arc::clone(&transport));
        Ok(transport)
    }
}

/// In-memory peer transport
pub struct MockRtcTransport {
    id: String,
    handler: Mutex<Option<TransportEventHandler>>,
    queued: Mutex<Vec<TransportEvent>>,
    local_channel: Mutex<Option<Arc<MockDataChannel>>>,
    remote: Mutex<Weak<MockRtcTransport>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    added_candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
    network: Arc<MockRtcNetwork>,
}

impl MockRtcTransport {
    fn emit(&self, event: TransportEvent) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(event),
            None => self.queued.lock().push(event),
        }
    }

    /// Push a connection state change as if the ICE agent reported it
    pub fn force_state(&self, state: ConnectionState) {
        self.emit(TransportEvent::ConnectionState(state));
    }

    /// Connect to a sink without negotiation: opens the local channel and
    /// reports `connected`. Returns the far end of the channel, if any.
    pub fn connect_loopback(&self) -> Option<Arc<MockDataChannel>> {
        let remote_end = self
            .local_channel
            .lock()
            .as_ref()
            .map(MockDataChannel::attach_remote);
        self.emit(TransportEvent::IceState(IceConnectionState::Connected));
        self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        remote_end
    }

    /// The channel this side created, if any
    pub fn local_channel(&self) -> Option<Arc<MockDataChannel>> {
        self.local_channel.lock().clone()
    }

    /// Candidates applied through `add_ice_candidate`, in order
    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.added_candidates.lock().clone()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.lock().is_some()
    }

    fn link(offerer: &Arc<MockRtcTransport>, answerer: &Arc<MockRtcTransport>) {
        *offerer.remote.lock() = Arc::downgrade(answerer);
        *answerer.remote.lock() = Arc::downgrade(offerer);

        let local = offerer.local_channel.lock().clone();
        if let Some(local) = local {
            let far = MockDataChannel::attach_remote(&local);
            answerer.emit(TransportEvent::DataChannel(far));
        }

        for side in [offerer, answerer] {
            side.emit(TransportEvent::IceState(IceConnectionState::Connected));
            side.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl RtcTransport for MockRtcTransport {
    fn on_event(&self, handler: TransportEventHandler) {
        let queued: Vec<TransportEvent> = std::mem::take(&mut *self.queued.lock());
        *self.handler.lock() = Some(Arc::clone(&handler));
        for event in queued {
            handler(event);
        }
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let channel = MockDataChannel::unpaired(label);
        *self.local_channel.lock() = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let tag = if ice_restart { "restart" } else { "offer" };
        Ok(SessionDescription::offer(format!("mock-{}:{}", tag, self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.remote_description.lock().is_none() {
            return Err(TransportError::Negotiation("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!("mock-answer:{}", self.id)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        *self.local_description.lock() = Some(desc);
        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:mock {}", self.id),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let counterpart = self
            .network
            .lookup(&desc.sdp)
            .ok_or_else(|| TransportError::Negotiation(format!("unknown sdp {}", desc.sdp)))?;
        let kind = desc.kind;
        *self.remote_description.lock() = Some(desc);

        if kind == SdpKind::Answer {
            let me = self
                .network
                .lookup(&self.id)
                .ok_or_else(|| TransportError::Negotiation("transport dropped".to_string()))?;
            MockRtcTransport::link(&me, &counterpart);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.remote_description.lock().is_none() {
            return Err(TransportError::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        self.added_candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = self.local_channel.lock().clone();
        if let Some(channel) = channel {
            channel.close().await;
        }
        let remote = self.remote.lock().upgrade();
        if let Some(remote) = remote {
            remote.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
        }
    }
}

// ============================================================================
// Mock Rendezvous
// ============================================================================

type RoomKey = (String, String);

/// In-memory rendezvous service shared by many local nodes
#[derive(Default)]
pub struct MockRendezvous {
    rooms: Mutex<HashMap<RoomKey, HashMap<PeerId, Weak<MockRoomHandle>>>>,
    failing_rooms: Mutex<Vec<String>>,
}

impl MockRendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signaling strategy for a node with a fixed peer id
    pub fn strategy(self: &Arc<Self>, peer_id: impl Into<String>) -> Arc<MockSignaling> {
        Arc::new(MockSignaling {
            rendezvous: Arc::clone(self),
            peer_id: peer_id.into(),
        })
    }

    /// Make joins of `room_id` fail
    pub fn fail_room(&self, room_id: &str) {
        self.failing_rooms.lock().push(room_id.to_string());
    }

    /// Peer ids currently in a room
    pub fn members(&self, app_id: &str, room_id: &str) -> Vec<PeerId> {
        let key = (app_id.to_string(), room_id.to_string());
        let mut members: Vec<PeerId> = self
            .rooms
            .lock()
            .get(&key)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn member(&self, key: &RoomKey, peer_id: &str) -> Option<Arc<MockRoomHandle>> {
        self.rooms
            .lock()
            .get(key)
            .and_then(|m| m.get(peer_id))
            .and_then(Weak::upgrade)
    }

    fn others(&self, key: &RoomKey, peer_id: &str) -> Vec<Arc<MockRoomHandle>> {
        self.rooms
            .lock()
            .get(key)
            .map(|m| {
                m.iter()
                    .filter(|(id, _)| id.as_str() != peer_id)
                    .filter_map(|(_, h)| h.upgrade())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Strategy handed to a room; all joins share one rendezvous
pub struct MockSignaling {
    rendezvous: Arc<MockRendezvous>,
    peer_id: PeerId,
}

#[async_trait]
impl SignalingStrategy for MockSignaling {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Memory
    }

    async fn join_room(&self, config: &RoomConfig) -> Result<Arc<dyn RoomHandle>, TransportError> {
        if self
            .rendezvous
            .failing_rooms
            .lock()
            .contains(&config.room_id)
        {
            return Err(TransportError::ConnectionFailed(format!(
                "rendezvous refused {}",
                config.room_id
            )));
        }

        let key = (config.app_id.clone(), config.room_id.clone());
        let handle = Arc::new(MockRoomHandle {
            key: key.clone(),
            self_id: self.peer_id.clone(),
            rendezvous: Arc::downgrade(&self.rendezvous),
            joined: AtomicBool::new(true),
            join_handlers: Mutex::new(Vec::new()),
            leave_handlers: Mutex::new(Vec::new()),
            pending_joins: Mutex::new(Vec::new()),
            actions: Mutex::new(HashMap::new()),
            pending_actions: Mutex::new(HashMap::new()),
        });

        let others = self.rendezvous.others(&key, &self.peer_id);
        self.rendezvous
            .rooms
            .lock()
            .entry(key)
            .or_default()
            .insert(self.peer_id.clone(), Arc::downgrade(&handle));

        for other in others {
            other.peer_joined(self.peer_id.clone());
            handle.peer_joined(other.self_id.clone());
        }
        Ok(handle)
    }
}

/// A node's membership in one mock room
pub struct MockRoomHandle {
    key: RoomKey,
    self_id: PeerId,
    rendezvous: Weak<MockRendezvous>,
    joined: AtomicBool,
    join_handlers: Mutex<Vec<PeerHandler>>,
    leave_handlers: Mutex<Vec<PeerHandler>>,
    pending_joins: Mutex<Vec<PeerId>>,
    actions: Mutex<HashMap<String, Vec<ActionHandler>>>,
    pending_actions: Mutex<HashMap<String, Vec<(Vec<u8>, PeerId)>>>,
}

impl MockRoomHandle {
    fn peer_joined(&self, peer_id: PeerId) {
        let handlers = self.join_handlers.lock().clone();
        if handlers.is_empty() {
            self.pending_joins.lock().push(peer_id);
            return;
        }
        for handler in handlers {
            handler(peer_id.clone());
        }
    }

    fn peer_left(&self, peer_id: PeerId) {
        self.pending_joins.lock().retain(|p| p != &peer_id);
        let handlers = self.leave_handlers.lock().clone();
        for handler in handlers {
            handler(peer_id.clone());
        }
    }

    fn receive(&self, action: &str, data: Vec<u8>, from: PeerId) {
        if !self.joined.load(Ordering::SeqCst) {
            return;
        }
        let handlers = self.actions.lock().get(action).cloned().unwrap_or_default();
        if handlers.is_empty() {
            self.pending_actions
                .lock()
                .entry(action.to_string())
                .or_default()
                .push((data, from));
            return;
        }
        for handler in handlers {
            handler(data.clone(), from.clone());
        }
    }

    fn add_action_handler(&self, action: &str, handler: ActionHandler) {
        self.actions
            .lock()
            .entry(action.to_string())
            .or_default()
            .push(Arc::clone(&handler));
        let pending = self.pending_actions.lock().remove(action).unwrap_or_default();
        for (data, from) in pending {
            handler(data, from);
        }
    }
}

#[async_trait]
impl RoomHandle for MockRoomHandle {
    fn self_id(&self) -> PeerId {
        self.self_id.clone()
    }

    fn on_peer_join(&self, handler: PeerHandler) {
        self.join_handlers.lock().push(Arc::clone(&handler));
        let pending: Vec<PeerId> = std::mem::take(&mut *self.pending_joins.lock());
        for peer_id in pending {
            handler(peer_id);
        }
    }

    fn on_peer_leave(&self, handler: PeerHandler) {
        self.leave_handlers.lock().push(handler);
    }

    fn make_action(&self, name: &str) -> Result<Arc<dyn ActionChannel>, TransportError> {
        let rendezvous = self
            .rendezvous
            .upgrade()
            .ok_or(TransportError::Disconnected)?;
        let me = rendezvous
            .member(&self.key, &self.self_id)
            .ok_or(TransportError::NotConnected)?;
        Ok(Arc::new(MockAction {
            name: name.to_string(),
            room: Arc::downgrade(&me),
        }))
    }

    async fn leave(&self) {
        if !self.joined.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(rendezvous) = self.rendezvous.upgrade() else {
            return;
        };
        let others = rendezvous.others(&self.key, &self.self_id);
        if let Some(members) = rendezvous.rooms.lock().get_mut(&self.key) {
            members.remove(&self.self_id);
        }
        for other in others {
            other.peer_left(self.self_id.clone());
        }
    }
}

struct MockAction {
    name: String,
    room: Weak<MockRoomHandle>,
}

#[async_trait]
impl ActionChannel for MockAction {
    async fn send(&self, data: Vec<u8>, target: Option<PeerId>) -> Result<(), TransportError> {
        let room = self.room.upgrade().ok_or(TransportError::Disconnected)?;
        if !room.joined.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let rendezvous = room.rendezvous.upgrade().ok_or(TransportError::Disconnected)?;
        let recipients = match target {
            Some(target) => vec![rendezvous
                .member(&room.key, &target)
                .ok_or_else(|| TransportError::SendFailed(format!("{target} not in room")))?],
            None => rendezvous.others(&room.key, &room.self_id),
        };
        for recipient in recipients {
            recipient.receive(&self.name, data.clone(), room.self_id.clone());
        }
        Ok(())
    }

    fn on_receive(&self, handler: ActionHandler) {
        if let Some(room) = self.room.upgrade() {
            room.add_action_handler(&self.name, handler);
        }
    }
}

// ============================================================================
// Mock Relay
// ============================================================================

/// Relay client that records what it was asked to publish
#[derive(Default)]
pub struct MockRelay {
    statuses: Mutex<Vec<RelayStatus>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    fail_publish: AtomicBool,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// (recipient, payload) pairs in publish order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl RelayClient for MockRelay {
    async fn connect(&self, urls: &[String]) -> Result<(), TransportError> {
        let mut statuses = self.statuses.lock();
        statuses.clear();
        statuses.extend(urls.iter().map(|url| RelayStatus {
            url: url.clone(),
            is_connected: true,
            messages_sent: 0,
            messages_received: 0,
            last_error: None,
        }));
        Ok(())
    }

    async fn disconnect(&self) {
        for status in self.statuses.lock().iter_mut() {
            status.is_connected = false;
        }
    }

    async fn publish(&self, recipient: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            for status in self.statuses.lock().iter_mut() {
                status.last_error = Some("publish rejected".to_string());
            }
            return Err(TransportError::SendFailed("publish rejected".to_string()));
        }
        for status in self.statuses.lock().iter_mut().filter(|s| s.is_connected) {
            status.messages_sent += 1;
        }
        self.published
            .lock()
            .push((recipient.to_string(), payload));
        Ok(())
    }

    fn statuses(&self) -> Vec<RelayStatus> {
        self.statuses.lock().clone()
    }
}
