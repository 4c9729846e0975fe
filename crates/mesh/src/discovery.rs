//! Launch-time peer discovery
//!
//! [`AutoDiscovery`] runs three strategies side by side and waits for all of
//! them to settle, keeping whatever the successful ones found:
//!
//! - the configured rendezvous room
//! - the personal rooms of recently seen peers, from the [`PeerCache`]
//! - a room derived from the local network segment, when one is known
//!
//! A strategy that fails or is unavailable never cancels the others.

use futures_util::future::{join_all, BoxFuture, FutureExt};
use lanthorn_core::{current_timestamp, DiscoveryConfig, PeerId, Subject, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::peer::ConnectionMethod;
use crate::service::MeshService;

/// Most peers kept in the persisted cache
pub const PEER_CACHE_LIMIT: usize = 100;

/// Rendezvous room a peer with `fingerprint` listens in
pub fn personal_room_id(fingerprint: &str) -> String {
    let hash = blake3::hash(fingerprint.as_bytes());
    format!("peer-{}", &hash.to_hex()[..16])
}

/// Rendezvous room shared by peers on the same network segment
pub fn local_network_room_id(network_hint: &str) -> String {
    let hash = blake3::hash(network_hint.as_bytes());
    format!("lan-{}", &hash.to_hex()[..16])
}

// ============================================================================
// Peer cache
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPeer {
    pub peer_id: PeerId,
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Unix epoch milliseconds
    pub last_seen: u64,
    pub connection_methods: Vec<ConnectionMethod>,
}

/// Durable backing for the peer cache
pub trait PeerCacheStore: Send + Sync {
    fn load(&self) -> MeshResult<Vec<CachedPeer>>;
    fn save(&self, peers: &[CachedPeer]) -> MeshResult<()>;
}

/// Peer cache persisted as one JSON document
#[derive(Debug, Clone)]
pub struct JsonFilePeerCacheStore {
    path: PathBuf,
}

impl JsonFilePeerCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PeerCacheStore for JsonFilePeerCacheStore {
    fn load(&self) -> MeshResult<Vec<CachedPeer>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| MeshError::PeerCache(format!("{}: {e}", self.path.display())))
    }

    fn save(&self, peers: &[CachedPeer]) -> MeshResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(peers)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPeerCacheStore {
    peers: Mutex<Vec<CachedPeer>>,
}

impl MemoryPeerCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// What was last persisted
    pub fn saved(&self) -> Vec<CachedPeer> {
        self.peers.lock().clone()
    }
}

impl PeerCacheStore for MemoryPeerCacheStore {
    fn load(&self) -> MeshResult<Vec<CachedPeer>> {
        Ok(self.peers.lock().clone())
    }

    fn save(&self, peers: &[CachedPeer]) -> MeshResult<()> {
        *self.peers.lock() = peers.to_vec();
        Ok(())
    }
}

/// Recently seen peers, most recent first, capped at [`PEER_CACHE_LIMIT`]
pub struct PeerCache {
    store: Arc<dyn PeerCacheStore>,
    entries: Mutex<Vec<CachedPeer>>,
    /// Held for the whole of a save so writes land in snapshot order
    saving: Mutex<()>,
}

impl PeerCache {
    pub fn open(store: Arc<dyn PeerCacheStore>) -> MeshResult<Self> {
        let mut entries = store.load()?;
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        entries.truncate(PEER_CACHE_LIMIT);
        Ok(Self {
            store,
            entries: Mutex::new(entries),
            saving: Mutex::new(()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryPeerCacheStore::new()),
            entries: Mutex::new(Vec::new()),
            saving: Mutex::new(()),
        }
    }

    pub fn add_peer(
        &self,
        peer_id: &str,
        fingerprint: Option<&str>,
        method: ConnectionMethod,
    ) -> MeshResult<()> {
        self.add_peer_at(peer_id, fingerprint, method, current_timestamp())
    }

    /// Record a sighting at `seen_at`. Repeat sightings merge connection
    /// methods; the list is truncated and persisted every time.
    pub fn add_peer_at(
        &self,
        peer_id: &str,
        fingerprint: Option<&str>,
        method: ConnectionMethod,
        seen_at: u64,
    ) -> MeshResult<()> {
        self.record(peer_id, fingerprint, method, seen_at);
        self.persist()
    }

    /// Merge a sighting into memory without persisting it
    pub(crate) fn record(
        &self,
        peer_id: &str,
        fingerprint: Option<&str>,
        method: ConnectionMethod,
        seen_at: u64,
    ) {
        let mut entries = self.entries.lock();

        let mut entry = match entries.iter().position(|p| p.peer_id == peer_id) {
            Some(index) => entries.remove(index),
            None => CachedPeer {
                peer_id: peer_id.to_string(),
                fingerprint: None,
                last_seen: seen_at,
                connection_methods: Vec::new(),
            },
        };
        if !entry.connection_methods.contains(&method) {
            entry.connection_methods.push(method);
            entry.connection_methods.sort();
        }
        if let Some(fingerprint) = fingerprint {
            entry.fingerprint = Some(fingerprint.to_string());
        }
        entry.last_seen = entry.last_seen.max(seen_at);

        entries.insert(0, entry);
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        entries.truncate(PEER_CACHE_LIMIT);
    }

    /// Write the current entries to the store. The entry lock is released
    /// before the store is touched.
    pub fn persist(&self) -> MeshResult<()> {
        let _saving = self.saving.lock();
        let snapshot = self.entries.lock().clone();
        self.store.save(&snapshot)
    }

    /// Cached peers, most recently seen first
    pub fn peers(&self) -> Vec<CachedPeer> {
        self.entries.lock().clone()
    }

    pub fn get(&self, peer_id: &str) -> Option<CachedPeer> {
        self.entries
            .lock()
            .iter()
            .find(|p| p.peer_id == peer_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) -> MeshResult<()> {
        self.entries.lock().clear();
        self.persist()
    }
}

// ============================================================================
// Auto discovery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    New,
    Discovering,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryStrategy {
    Rendezvous,
    CachedPeers,
    LocalNetwork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    FullMesh,
    HubSpoke,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    pub room_id: String,
    pub strategy: DiscoveryStrategy,
}

pub struct AutoDiscovery {
    mesh: Arc<MeshService>,
    cache: Arc<PeerCache>,
    config: Mutex<DiscoveryConfig>,
    in_flight: AtomicBool,
    status: Mutex<DiscoveryStatus>,
    status_changes: Subject<DiscoveryStatus>,
}

impl AutoDiscovery {
    pub fn new(mesh: Arc<MeshService>, cache: Arc<PeerCache>, config: DiscoveryConfig) -> Self {
        Self {
            mesh,
            cache,
            config: Mutex::new(config),
            in_flight: AtomicBool::new(false),
            status: Mutex::new(DiscoveryStatus::New),
            status_changes: Subject::new(),
        }
    }

    /// Apply `config` and, when `auto_connect` is set, discover right away
    pub async fn initialize(&self, config: DiscoveryConfig) -> Vec<DiscoveredPeer> {
        let auto_connect = config.auto_connect;
        *self.config.lock() = config;
        if !auto_connect {
            return Vec::new();
        }
        self.start_discovery().await
    }

    /// Run every strategy once. A call made while another is in flight
    /// returns an empty list immediately.
    pub async fn start_discovery(&self) -> Vec<DiscoveredPeer> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Discovery already in flight");
            return Vec::new();
        }
        self.set_status(DiscoveryStatus::Discovering);
        let config = self.config.lock().clone();

        let strategies: Vec<(DiscoveryStrategy, BoxFuture<'_, MeshResult<Vec<DiscoveredPeer>>>)> = vec![
            (DiscoveryStrategy::Rendezvous, self.discover_rendezvous(&config).boxed()),
            (DiscoveryStrategy::CachedPeers, self.discover_cached_peers(&config).boxed()),
            (DiscoveryStrategy::LocalNetwork, self.discover_local_network(&config).boxed()),
        ];
        let (kinds, futures): (Vec<_>, Vec<_>) = strategies.into_iter().unzip();
        let results = join_all(futures).await;

        let mut found: BTreeMap<PeerId, DiscoveredPeer> = BTreeMap::new();
        for (strategy, result) in kinds.into_iter().zip(results) {
            match result {
                Ok(peers) => {
                    debug!(strategy = ?strategy, peers = peers.len(), "Discovery strategy settled");
                    for peer in peers {
                        found.entry(peer.peer_id.clone()).or_insert(peer);
                    }
                }
                Err(e) => warn!(strategy = ?strategy, error = %e, "Discovery strategy failed"),
            }
        }

        self.remember_connected_peers().await;

        let status = if self.mesh.connected_peer_count() > 0 {
            DiscoveryStatus::Connected
        } else {
            DiscoveryStatus::Disconnected
        };
        self.set_status(status);
        self.in_flight.store(false, Ordering::SeqCst);

        info!(found = found.len(), status = ?status, "Discovery finished");
        found.into_values().collect()
    }

    pub fn is_discovering(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> DiscoveryStatus {
        *self.status.lock()
    }

    pub fn subscribe_status<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DiscoveryStatus) + Send + Sync + 'static,
    {
        self.status_changes.subscribe(handler)
    }

    /// Whether the mesh is currently too large for all-to-all connections.
    /// Recomputed on every call.
    pub fn should_use_hub_spoke(&self) -> bool {
        self.mesh.connected_peer_count() > self.config.lock().full_mesh_threshold
    }

    pub fn topology(&self) -> Topology {
        if self.should_use_hub_spoke() {
            Topology::HubSpoke
        } else {
            Topology::FullMesh
        }
    }

    pub fn cache(&self) -> &Arc<PeerCache> {
        &self.cache
    }

    async fn discover_rendezvous(&self, config: &DiscoveryConfig) -> MeshResult<Vec<DiscoveredPeer>> {
        let room_id = config.rendezvous_room.clone();
        self.mesh
            .join_room_with(self.mesh.room_config(&room_id), ConnectionMethod::RelaySignaled)
            .await?;
        tokio::time::sleep(config.settle()).await;
        Ok(self.peers_in(&room_id, DiscoveryStrategy::Rendezvous))
    }

    async fn discover_cached_peers(&self, config: &DiscoveryConfig) -> MeshResult<Vec<DiscoveredPeer>> {
        if !config.enable_cached_peers {
            return Err(MeshError::DiscoveryUnavailable(
                "cached peer reconnection disabled".to_string(),
            ));
        }

        let own_fingerprint = self.mesh.local_fingerprint().map(str::to_string);
        let mut rooms: Vec<String> = Vec::new();
        if let Some(fingerprint) = &own_fingerprint {
            rooms.push(personal_room_id(fingerprint));
        }
        rooms.extend(
            self.cache
                .peers()
                .into_iter()
                .filter_map(|p| p.fingerprint)
                .filter(|fp| Some(fp) != own_fingerprint.as_ref())
                .take(config.max_cached_reconnects)
                .map(|fp| personal_room_id(&fp)),
        );
        if rooms.is_empty() {
            return Ok(Vec::new());
        }

        let joins = rooms.iter().map(|room_id| {
            self.mesh
                .join_room_with(self.mesh.room_config(room_id), ConnectionMethod::RelaySignaled)
        });
        let mut joined = Vec::new();
        for (room_id, result) in rooms.iter().zip(join_all(joins).await) {
            match result {
                Ok(_) => joined.push(room_id.clone()),
                Err(e) => debug!(room_id = %room_id, error = %e, "Cached peer room unavailable"),
            }
        }

        tokio::time::sleep(config.settle()).await;
        Ok(joined
            .iter()
            .flat_map(|room_id| self.peers_in(room_id, DiscoveryStrategy::CachedPeers))
            .collect())
    }

    async fn discover_local_network(&self, config: &DiscoveryConfig) -> MeshResult<Vec<DiscoveredPeer>> {
        if !config.enable_local_network {
            return Err(MeshError::DiscoveryUnavailable(
                "local network discovery disabled".to_string(),
            ));
        }
        let hint = config.network_hint.as_deref().ok_or_else(|| {
            MeshError::DiscoveryUnavailable("no local network hint".to_string())
        })?;

        let room_id = local_network_room_id(hint);
        self.mesh
            .join_room_with(self.mesh.room_config(&room_id), ConnectionMethod::Local)
            .await?;
        tokio::time::sleep(config.settle()).await;
        Ok(self.peers_in(&room_id, DiscoveryStrategy::LocalNetwork))
    }

    fn peers_in(&self, room_id: &str, strategy: DiscoveryStrategy) -> Vec<DiscoveredPeer> {
        self.mesh
            .room(room_id)
            .map(|room| room.peers())
            .unwrap_or_default()
            .into_iter()
            .map(|peer_id| DiscoveredPeer {
                peer_id,
                room_id: room_id.to_string(),
                strategy,
            })
            .collect()
    }

    async fn remember_connected_peers(&self) {
        let peers = self.mesh.connected_peers();
        if peers.is_empty() {
            return;
        }
        let now = current_timestamp();
        for peer in &peers {
            self.cache
                .record(&peer.peer_id, peer.fingerprint.as_deref(), peer.connection_method, now);
        }

        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || cache.persist()).await {
            Ok(Ok(())) => debug!(peers = peers.len(), "Peer cache saved"),
            Ok(Err(e)) => warn!(error = %e, "Peer cache update failed"),
            Err(e) => warn!(error = %e, "Peer cache save did not finish"),
        }
    }

    fn set_status(&self, status: DiscoveryStatus) {
        let changed = {
            let mut current = self.status.lock();
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            self.status_changes.emit(&status);
        }
    }
}
