//! Rooms
//!
//! A room is a named rendezvous group joined over a signaling strategy. It
//! tracks which peers are present, lazily creates one action per channel
//! name, stamps outgoing messages with a per-channel sequence number, and
//! keeps transport mappings warm with a presence heartbeat while joined.
//!
//! Channel handlers may be registered before the room is joined; they are
//! wired to the transport action on join.

use lanthorn_core::{current_timestamp, PeerId, Subject, Subscription};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::message::{
    decode_frame, encode_binary, encode_message, message_id_string, new_message_id,
    BinaryMessage, ChannelMessage, Frame, P2PMessage, RecentIds, MESSAGE_ID_LEN,
    RECENT_ID_WINDOW,
};
use crate::transport::{ActionChannel, RoomHandle, SignalingStrategy, StrategyKind};

/// Channel used for the keep-alive heartbeat
pub const PRESENCE_CHANNEL: &str = "presence";

/// How to reach a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    pub room_id: String,
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub strategy: StrategyKind,
    #[serde(default)]
    pub relay_urls: Vec<String>,
    #[serde(default)]
    pub ice_servers: Vec<String>,
}

impl RoomConfig {
    pub fn new(room_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            app_id: app_id.into(),
            password: None,
            strategy: StrategyKind::Nostr,
            relay_urls: Vec::new(),
            ice_servers: Vec::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Snapshot of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    pub is_joined: bool,
    pub self_id: Option<PeerId>,
    pub peers: Vec<PeerId>,
    pub channels: Vec<String>,
}

struct ChannelState {
    name: String,
    action: Mutex<Option<Arc<dyn ActionChannel>>>,
    sequence: AtomicU64,
    messages: Subject<P2PMessage>,
    binary: Subject<BinaryMessage>,
    recent: Mutex<RecentIds>,
}

impl ChannelState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            action: Mutex::new(None),
            sequence: AtomicU64::new(0),
            messages: Subject::new(),
            binary: Subject::new(),
            recent: Mutex::new(RecentIds::new(RECENT_ID_WINDOW)),
        }
    }

    fn receive(&self, room_id: &str, bytes: Vec<u8>, sender: PeerId) {
        match decode_frame(&bytes) {
            Some(Frame::Message(message)) => {
                if !self.recent.lock().insert(&message.id) {
                    debug!(room_id, channel = %self.name, id = %message.id, "Duplicate message dropped");
                    return;
                }
                self.messages.emit(&message);
            }
            Some(Frame::Binary { id, data }) => {
                if !self.recent.lock().insert(&message_id_string(&id)) {
                    debug!(room_id, channel = %self.name, "Duplicate binary frame dropped");
                    return;
                }
                self.binary.emit(&BinaryMessage {
                    id,
                    channel: self.name.clone(),
                    sender_id: sender,
                    data,
                });
            }
            None => {
                warn!(room_id, channel = %self.name, sender = %sender, "Malformed frame dropped");
            }
        }
    }
}

pub struct Room {
    config: RoomConfig,
    strategy: Arc<dyn SignalingStrategy>,
    heartbeat_interval: Duration,
    joined: AtomicBool,
    join_lock: tokio::sync::Mutex<()>,
    handle: Mutex<Option<Arc<dyn RoomHandle>>>,
    peers: Mutex<BTreeSet<PeerId>>,
    channels: Mutex<HashMap<String, Arc<ChannelState>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    peer_joined: Subject<PeerId>,
    peer_left: Subject<PeerId>,
}

impl Room {
    pub fn new(
        config: RoomConfig,
        strategy: Arc<dyn SignalingStrategy>,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            strategy,
            heartbeat_interval,
            joined: AtomicBool::new(false),
            join_lock: tokio::sync::Mutex::new(()),
            handle: Mutex::new(None),
            peers: Mutex::new(BTreeSet::new()),
            channels: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            peer_joined: Subject::new(),
            peer_left: Subject::new(),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.config.room_id
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// Our id in this room, once joined
    pub fn self_id(&self) -> Option<PeerId> {
        self.handle.lock().as_ref().map(|h| h.self_id())
    }

    /// Join the room. A no-op when already joined.
    pub async fn join(self: &Arc<Self>) -> MeshResult<()> {
        let _guard = self.join_lock.lock().await;
        if self.is_joined() {
            return Ok(());
        }

        let handle = self.strategy.join_room(&self.config).await?;
        *self.handle.lock() = Some(Arc::clone(&handle));
        self.joined.store(true, Ordering::SeqCst);
        info!(room_id = %self.config.room_id, strategy = ?self.strategy.kind(), "Joined room");

        let weak = Arc::downgrade(self);
        handle.on_peer_join(Arc::new(move |peer_id| {
            if let Some(room) = weak.upgrade() {
                room.add_peer(peer_id);
            }
        }));
        let weak = Arc::downgrade(self);
        handle.on_peer_leave(Arc::new(move |peer_id| {
            if let Some(room) = weak.upgrade() {
                room.remove_peer(&peer_id);
            }
        }));

        self.channel_state(PRESENCE_CHANNEL);
        let existing: Vec<Arc<ChannelState>> = self.channels.lock().values().cloned().collect();
        for state in existing {
            self.wire(&state);
        }

        self.start_heartbeat();
        Ok(())
    }

    /// Leave the room, tearing down heartbeat, channels and the transport
    /// handle. A no-op when not joined.
    pub async fn leave(&self) {
        let _guard = self.join_lock.lock().await;
        if !self.joined.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
        self.channels.lock().clear();
        let departed: Vec<PeerId> = std::mem::take(&mut *self.peers.lock()).into_iter().collect();
        for peer_id in &departed {
            self.peer_left.emit(peer_id);
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.leave().await;
        }
        info!(room_id = %self.config.room_id, "Left room");
    }

    /// Peers currently present, sorted
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().iter().cloned().collect()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.lock().contains(peer_id)
    }

    pub fn state(&self) -> RoomState {
        let mut channels: Vec<String> = self.channels.lock().keys().cloned().collect();
        channels.sort();
        RoomState {
            room_id: self.config.room_id.clone(),
            is_joined: self.is_joined(),
            self_id: self.self_id(),
            peers: self.peers(),
            channels,
        }
    }

    /// Send a JSON payload on a channel, to one peer or to the whole room
    pub async fn send(
        &self,
        channel: &str,
        payload: serde_json::Value,
        target: Option<&PeerId>,
    ) -> MeshResult<P2PMessage> {
        let state = self.channel_state(channel);
        let action = self.joined_action(&state)?;
        let sender_id = self.self_id().unwrap_or_default();

        let sequence = state.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = P2PMessage {
            id: message_id_string(&new_message_id()),
            channel: channel.to_string(),
            payload,
            sender_id,
            target_id: target.cloned(),
            timestamp: current_timestamp(),
            sequence: Some(sequence),
        };
        let frame = encode_message(&message)?;
        action.send(frame, target.cloned()).await?;
        Ok(message)
    }

    pub async fn send_typed<M: ChannelMessage>(
        &self,
        message: &M,
        target: Option<&PeerId>,
    ) -> MeshResult<P2PMessage> {
        let payload = serde_json::to_value(message)?;
        self.send(M::CHANNEL, payload, target).await
    }

    /// Send raw bytes prefixed with a fresh message id, returned to the caller
    pub async fn send_binary(
        &self,
        channel: &str,
        data: &[u8],
        target: Option<&PeerId>,
    ) -> MeshResult<[u8; MESSAGE_ID_LEN]> {
        let state = self.channel_state(channel);
        let action = self.joined_action(&state)?;
        let id = new_message_id();
        action.send(encode_binary(&id, data), target.cloned()).await?;
        Ok(id)
    }

    pub fn on_message<F>(&self, channel: &str, handler: F) -> Subscription
    where
        F: Fn(&P2PMessage) + Send + Sync + 'static,
    {
        let state = self.channel_state(channel);
        let subscription = state.messages.subscribe(handler);
        self.wire(&state);
        subscription
    }

    pub fn on_typed<M, F>(&self, handler: F) -> Subscription
    where
        M: ChannelMessage,
        F: Fn(M, &P2PMessage) + Send + Sync + 'static,
    {
        let room_id = self.config.room_id.clone();
        self.on_message(M::CHANNEL, move |message| {
            match serde_json::from_value::<M>(message.payload.clone()) {
                Ok(decoded) => handler(decoded, message),
                Err(e) => warn!(
                    room_id = %room_id,
                    channel = M::CHANNEL,
                    sender = %message.sender_id,
                    error = %e,
                    "Undecodable payload dropped"
                ),
            }
        })
    }

    pub fn on_binary<F>(&self, channel: &str, handler: F) -> Subscription
    where
        F: Fn(&BinaryMessage) + Send + Sync + 'static,
    {
        let state = self.channel_state(channel);
        let subscription = state.binary.subscribe(handler);
        self.wire(&state);
        subscription
    }

    pub fn on_peer_join<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PeerId) + Send + Sync + 'static,
    {
        self.peer_joined.subscribe(handler)
    }

    pub fn on_peer_leave<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PeerId) + Send + Sync + 'static,
    {
        self.peer_left.subscribe(handler)
    }

    fn add_peer(&self, peer_id: PeerId) {
        if Some(&peer_id) == self.self_id().as_ref() {
            return;
        }
        let inserted = self.peers.lock().insert(peer_id.clone());
        if inserted {
            debug!(room_id = %self.config.room_id, peer_id = %peer_id, "Peer joined room");
            self.peer_joined.emit(&peer_id);
        }
    }

    fn remove_peer(&self, peer_id: &str) {
        let removed = self.peers.lock().remove(peer_id);
        if removed {
            debug!(room_id = %self.config.room_id, peer_id, "Peer left room");
            self.peer_left.emit(&peer_id.to_string());
        }
    }

    fn channel_state(&self, name: &str) -> Arc<ChannelState> {
        let mut channels = self.channels.lock();
        Arc::clone(
            channels
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ChannelState::new(name))),
        )
    }

    /// Bind a channel to its transport action if joined and not yet bound
    fn wire(&self, state: &Arc<ChannelState>) {
        if !self.is_joined() || state.action.lock().is_some() {
            return;
        }
        let handle = self.handle.lock().clone();
        let Some(handle) = handle else {
            return;
        };
        let action = match handle.make_action(&state.name) {
            Ok(action) => action,
            Err(e) => {
                warn!(room_id = %self.config.room_id, channel = %state.name, error = %e, "Could not create action");
                return;
            }
        };
        {
            let mut slot = state.action.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(Arc::clone(&action));
        }

        let weak: Weak<ChannelState> = Arc::downgrade(state);
        let room_id = self.config.room_id.clone();
        action.on_receive(Arc::new(move |bytes, sender| {
            if let Some(state) = weak.upgrade() {
                state.receive(&room_id, bytes, sender);
            }
        }));
    }

    fn joined_action(&self, state: &Arc<ChannelState>) -> MeshResult<Arc<dyn ActionChannel>> {
        self.wire(state);
        let action = state.action.lock().clone();
        match action {
            Some(action) if self.is_joined() => Ok(action),
            _ => Err(MeshError::RoomNotJoined {
                room_id: self.config.room_id.clone(),
            }),
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.heartbeat_interval;
        let task = tokio::spawn(async move {
            loop {
                let jitter = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 10);
                tokio::time::sleep(interval + Duration::from_millis(jitter)).await;
                let Some(room) = weak.upgrade() else {
                    break;
                };
                if !room.is_joined() {
                    break;
                }
                let payload = serde_json::json!({ "timestamp": current_timestamp() });
                if let Err(e) = room.send(PRESENCE_CHANNEL, payload, None).await {
                    debug!(room_id = %room.config.room_id, error = %e, "Presence heartbeat failed");
                }
            }
        });
        if let Some(previous) = self.heartbeat.lock().replace(task) {
            previous.abort();
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("room_id", &self.config.room_id)
            .field("joined", &self.is_joined())
            .finish()
    }
}
