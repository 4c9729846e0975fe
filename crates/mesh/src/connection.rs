//! Peer connection lifecycle
//!
//! Wraps one [`RtcTransport`] and its reliable data channel. The connection
//! owns the state machine (`new -> connecting -> connected <-> {disconnected,
//! failed} -> closed`), queues remote ICE candidates until a remote
//! description is applied, and counts traffic per peer.
//!
//! `send` never fails loudly: it returns `false` whenever the connection is
//! not `connected` or the channel is not open, including after `close()`.

use lanthorn_core::{PeerId, Subject, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::transport::{
    ConnectionState, DataChannel, IceCandidate, IceConnectionState, RtcTransport,
    SessionDescription, TransportEvent,
};

/// Label of the single reliable channel each connection carries
pub const DATA_CHANNEL_LABEL: &str = "lanthorn";

/// Traffic counters for one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

struct Shared {
    peer_id: PeerId,
    state: Mutex<ConnectionState>,
    ice_state: Mutex<IceConnectionState>,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    remote_description_set: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    counters: Counters,
    state_changes: Subject<ConnectionState>,
    messages: Subject<Vec<u8>>,
    local_candidates: Subject<IceCandidate>,
}

impl Shared {
    /// Apply a state change if the state machine allows it
    fn transition(&self, next: ConnectionState) -> bool {
        {
            let mut state = self.state.lock();
            if *state == next || !state.can_transition_to(next) {
                debug!(peer_id = %self.peer_id, from = %*state, to = %next, "Ignoring state change");
                return false;
            }
            *state = next;
        }
        debug!(peer_id = %self.peer_id, state = %next, "Connection state changed");
        self.state_changes.emit(&next);
        true
    }

    fn attach_channel(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        if *self.state.lock() == ConnectionState::Closed {
            return;
        }
        let weak: Weak<Shared> = Arc::downgrade(self);
        channel.on_message(Arc::new(move |data: Vec<u8>| {
            if let Some(shared) = weak.upgrade() {
                if *shared.state.lock() == ConnectionState::Closed {
                    return;
                }
                shared
                    .counters
                    .bytes_received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                shared
                    .counters
                    .messages_received
                    .fetch_add(1, Ordering::Relaxed);
                shared.messages.emit(&data);
            }
        }));
        *self.channel.lock() = Some(channel);
    }

    fn handle_event(self: &Arc<Self>, is_initiator: bool, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionState(state) => {
                self.transition(state);
            }
            TransportEvent::IceState(state) => {
                *self.ice_state.lock() = state;
            }
            TransportEvent::DataChannel(channel) => {
                if is_initiator {
                    debug!(peer_id = %self.peer_id, label = channel.label(), "Ignoring remote channel on initiator side");
                    return;
                }
                if channel.label() != DATA_CHANNEL_LABEL {
                    warn!(peer_id = %self.peer_id, label = channel.label(), "Unexpected data channel label");
                    return;
                }
                self.attach_channel(channel);
            }
            TransportEvent::LocalCandidate(candidate) => {
                self.local_candidates.emit(&candidate);
            }
        }
    }
}

/// One connection and one reliable channel to one peer
pub struct PeerConnection {
    is_initiator: bool,
    transport: Arc<dyn RtcTransport>,
    initialized: AtomicBool,
    shared: Arc<Shared>,
}

impl PeerConnection {
    pub fn new(peer_id: PeerId, is_initiator: bool, transport: Arc<dyn RtcTransport>) -> Self {
        Self {
            is_initiator,
            transport,
            initialized: AtomicBool::new(false),
            shared: Arc::new(Shared {
                peer_id,
                state: Mutex::new(ConnectionState::New),
                ice_state: Mutex::new(IceConnectionState::New),
                channel: Mutex::new(None),
                remote_description_set: AtomicBool::new(false),
                pending_candidates: Mutex::new(Vec::new()),
                counters: Counters::default(),
                state_changes: Subject::new(),
                messages: Subject::new(),
                local_candidates: Subject::new(),
            }),
        }
    }

    /// Wire transport events and, on the initiator side, open the channel.
    /// The answering side waits for the remote peer's channel instead.
    pub async fn initialize(&self) -> MeshResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.connection_state() == ConnectionState::Closed {
            return Err(self.invalid_state());
        }

        let weak = Arc::downgrade(&self.shared);
        let is_initiator = self.is_initiator;
        self.transport.on_event(Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_event(is_initiator, event);
            }
        }));

        self.shared.transition(ConnectionState::Connecting);

        if self.is_initiator {
            let channel = self.transport.create_data_channel(DATA_CHANNEL_LABEL).await?;
            self.shared.attach_channel(channel);
        }
        Ok(())
    }

    /// Create an offer and apply it locally
    pub async fn create_offer(&self) -> MeshResult<SessionDescription> {
        self.ensure_open()?;
        let offer = self.transport.create_offer(false).await?;
        self.transport.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Apply a remote offer and produce the matching answer
    pub async fn handle_offer(&self, offer: SessionDescription) -> MeshResult<SessionDescription> {
        self.ensure_open()?;
        self.apply_remote_description(offer).await?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Apply the remote answer to our offer
    pub async fn handle_answer(&self, answer: SessionDescription) -> MeshResult<()> {
        self.ensure_open()?;
        self.apply_remote_description(answer).await
    }

    /// Add a remote candidate, holding it until a remote description exists
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        self.ensure_open()?;
        {
            let mut pending = self.shared.pending_candidates.lock();
            if !self.shared.remote_description_set.load(Ordering::SeqCst) {
                pending.push(candidate);
                return Ok(());
            }
        }
        self.transport.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Produce one renegotiation offer with ICE restart. Caller-driven; the
    /// connection never restarts on its own.
    pub async fn restart_ice(&self) -> MeshResult<SessionDescription> {
        self.ensure_open()?;
        info!(peer_id = %self.shared.peer_id, "Restarting ICE");
        let offer = self.transport.create_offer(true).await?;
        self.transport.set_local_description(offer.clone()).await?;
        if matches!(
            self.connection_state(),
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            self.shared.transition(ConnectionState::Connecting);
        }
        Ok(offer)
    }

    /// Send over the data channel. `false` means not delivered; no retry
    /// is implied.
    pub async fn send(&self, data: impl Into<Vec<u8>>) -> bool {
        if self.connection_state() != ConnectionState::Connected {
            return false;
        }
        let channel = self.shared.channel.lock().clone();
        let Some(channel) = channel else {
            return false;
        };
        if !channel.is_open() {
            return false;
        }

        let data = data.into();
        let len = data.len() as u64;
        match channel.send(data).await {
            Ok(()) => {
                let counters = &self.shared.counters;
                counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!(peer_id = %self.shared.peer_id, error = %e, "Send failed");
                false
            }
        }
    }

    /// Close the connection. Idempotent and safe to race with sends; only
    /// the first call emits `closed`.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        info!(peer_id = %self.shared.peer_id, "Connection closed");
        self.shared.state_changes.emit(&ConnectionState::Closed);

        let channel = self.shared.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.shared.pending_candidates.lock().clear();
        self.transport.close().await;
    }

    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        *self.shared.ice_state.lock()
    }

    pub fn is_channel_open(&self) -> bool {
        self.shared
            .channel
            .lock()
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> PeerStats {
        let c = &self.shared.counters;
        PeerStats {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe_state<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared.state_changes.subscribe(handler)
    }

    pub fn subscribe_messages<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Vec<u8>) + Send + Sync + 'static,
    {
        self.shared.messages.subscribe(handler)
    }

    /// Locally gathered candidates that must be signaled to the peer
    pub fn subscribe_local_candidates<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&IceCandidate) + Send + Sync + 'static,
    {
        self.shared.local_candidates.subscribe(handler)
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> MeshResult<()> {
        self.transport.set_remote_description(desc).await?;

        // Flag and drain under the queue lock so no candidate lands after the drain
        let pending: Vec<IceCandidate> = {
            let mut pending = self.shared.pending_candidates.lock();
            self.shared
                .remote_description_set
                .store(true, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };
        for candidate in pending {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!(peer_id = %self.shared.peer_id, error = %e, "Dropping queued candidate");
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> MeshResult<()> {
        if self.connection_state() == ConnectionState::Closed {
            return Err(self.invalid_state());
        }
        Ok(())
    }

    fn invalid_state(&self) -> MeshError {
        MeshError::InvalidState {
            peer_id: self.shared.peer_id.clone(),
            state: self.connection_state().to_string(),
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.shared.peer_id)
            .field("is_initiator", &self.is_initiator)
            .field("state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRtcFactory, MockRtcNetwork};
    use crate::transport::RtcTransportFactory;
    use std::sync::atomic::AtomicUsize;

    fn connection(factory: &MockRtcFactory, peer: &str, initiator: bool) -> PeerConnection {
        let transport = factory.create(peer, &[]).unwrap();
        PeerConnection::new(peer.to_string(), initiator, transport)
    }

    #[tokio::test]
    async fn test_send_fails_before_connected() {
        let factory = MockRtcFactory::new(MockRtcNetwork::new(), "local");
        let conn = connection(&factory, "p1", true);
        assert!(!conn.send(b"early".to_vec()).await);

        conn.initialize().await.unwrap();
        assert_eq!(conn.connection_state(), ConnectionState::Connecting);
        assert!(!conn.send(b"still early".to_vec()).await);
    }

    #[tokio::test]
    async fn test_loopback_send_counts_stats() {
        let factory = MockRtcFactory::new(MockRtcNetwork::new(), "local");
        let conn = connection(&factory, "p1", true);
        conn.initialize().await.unwrap();
        let far = factory.transport("p1").unwrap().connect_loopback().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        far.on_message(Arc::new(move |d| sink.lock().push(d)));

        assert_eq!(conn.connection_state(), ConnectionState::Connected);
        assert!(conn.send(b"hello".to_vec()).await);
        far.send(b"back".to_vec()).await.unwrap();

        let stats = conn.stats();
        assert_eq!(stats.bytes_sent, 5);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_received, 4);
        assert_eq!(received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_send_false_when_channel_closed_but_state_connected() {
        let factory = MockRtcFactory::new(MockRtcNetwork::new(), "local");
        let conn = connection(&factory, "p1", true);
        conn.initialize().await.unwrap();
        let far = factory.transport("p1").unwrap().connect_loopback().unwrap();

        far.close().await;
        assert_eq!(conn.connection_state(), ConnectionState::Connected);
        assert!(!conn.send(b"x".to_vec()).await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_emits_once() {
        let factory = MockRtcFactory::new(MockRtcNetwork::new(), "local");
        let conn = connection(&factory, "p1", true);
        conn.initialize().await.unwrap();
        factory.transport("p1").unwrap().connect_loopback();

        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let _sub = conn.subscribe_state(move |s| {
            if *s == ConnectionState::Closed {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let conn = Arc::new(conn);
        tokio::join!(conn.close(), conn.close());
        conn.close().await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(conn.connection_state(), ConnectionState::Closed);
        assert!(!conn.send(b"late".to_vec()).await);

        // Transport events after close are ignored
        factory
            .transport("p1")
            .unwrap()
            .force_state(ConnectionState::Connected);
        assert_eq!(conn.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let network = MockRtcNetwork::new();
        let offer_side = MockRtcFactory::new(network.clone(), "a");
        let answer_side = MockRtcFactory::new(network, "b");

        let a = connection(&offer_side, "b", true);
        let b = connection(&answer_side, "a", false);
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: None,
            sdp_m_line_index: Some(0),
        };
        b.add_ice_candidate(candidate.clone()).await.unwrap();
        let b_transport = answer_side.transport("a").unwrap();
        assert!(b_transport.added_candidates().is_empty());

        let offer = a.create_offer().await.unwrap();
        let answer = b.handle_offer(offer).await.unwrap();
        assert_eq!(b_transport.added_candidates(), vec![candidate]);

        a.handle_answer(answer).await.unwrap();
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
        assert_eq!(a.ice_connection_state(), IceConnectionState::Connected);

        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();
        let _sub = b.subscribe_messages(move |d| sink.lock().push(d.clone()));
        assert!(a.send(b"over the wire".to_vec()).await);
        assert_eq!(got.lock().clone(), vec![b"over the wire".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_candidates_racing_remote_description_all_reach_transport() {
        let network = MockRtcNetwork::new();
        let offer_side = MockRtcFactory::new(network.clone(), "a");
        let answer_side = MockRtcFactory::new(network, "b");

        let a = connection(&offer_side, "b", true);
        let b = Arc::new(connection(&answer_side, "a", false));
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        let offer = a.create_offer().await.unwrap();

        let candidates: Vec<IceCandidate> = (0..64)
            .map(|n| IceCandidate {
                candidate: format!("candidate:{n}"),
                sdp_mid: None,
                sdp_m_line_index: Some(0),
            })
            .collect();
        let adds: Vec<_> = candidates
            .iter()
            .cloned()
            .map(|candidate| {
                let b = b.clone();
                tokio::spawn(async move { b.add_ice_candidate(candidate).await })
            })
            .collect();
        let answering = {
            let b = b.clone();
            tokio::spawn(async move { b.handle_offer(offer).await })
        };

        answering.await.unwrap().unwrap();
        for add in adds {
            add.await.unwrap().unwrap();
        }

        let mut added: Vec<String> = answer_side
            .transport("a")
            .unwrap()
            .added_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        added.sort();
        let mut expected: Vec<String> = candidates.into_iter().map(|c| c.candidate).collect();
        expected.sort();
        assert_eq!(added, expected);
    }

    #[tokio::test]
    async fn test_restart_ice_returns_single_offer_and_reconnects() {
        let factory = MockRtcFactory::new(MockRtcNetwork::new(), "local");
        let conn = connection(&factory, "p1", true);
        conn.initialize().await.unwrap();
        let transport = factory.transport("p1").unwrap();
        transport.connect_loopback();
        transport.force_state(ConnectionState::Failed);
        assert_eq!(conn.connection_state(), ConnectionState::Failed);

        let offer = conn.restart_ice().await.unwrap();
        assert!(offer.sdp.starts_with("mock-restart"));
        assert_eq!(conn.connection_state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_negotiation_after_close_is_rejected() {
        let factory = MockRtcFactory::new(MockRtcNetwork::new(), "local");
        let conn = connection(&factory, "p1", true);
        conn.close().await;
        assert!(matches!(
            conn.create_offer().await,
            Err(MeshError::InvalidState { .. })
        ));
        assert!(conn.initialize().await.is_err());
    }
}
