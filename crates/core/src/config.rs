//! Configuration management for Lanthorn.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mesh: MeshConfig,
    pub discovery: DiscoveryConfig,
    pub introduction: IntroductionConfig,
    pub transfer: TransferConfig,
    pub relay: RelayConfig,
}

/// Room and routing behaviour of the mesh service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Application namespace shared by every room
    pub app_id: String,
    /// Our cryptographic fingerprint, announced to peers when set
    pub local_fingerprint: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub routing_ttl_ms: u64,
    pub prefer_direct: bool,
    pub ice_servers: Vec<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            app_id: "lanthorn".to_string(),
            local_fingerprint: None,
            heartbeat_interval_ms: 30_000,
            routing_ttl_ms: 60_000,
            prefer_direct: true,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl MeshConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn routing_ttl(&self) -> Duration {
        Duration::from_millis(self.routing_ttl_ms)
    }
}

/// Launch-time discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub auto_connect: bool,
    pub rendezvous_room: String,
    /// Above this many peers the topology switches to hub-spoke
    pub full_mesh_threshold: usize,
    /// How long each strategy waits for peers after joining a room
    pub settle_ms: u64,
    pub enable_cached_peers: bool,
    pub enable_local_network: bool,
    /// Identifier of the local network segment, if the platform can supply one
    pub network_hint: Option<String>,
    pub max_cached_reconnects: usize,
    pub peer_cache_path: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            rendezvous_room: "lobby".to_string(),
            full_mesh_threshold: 6,
            settle_ms: 3_000,
            enable_cached_peers: true,
            enable_local_network: true,
            network_hint: None,
            max_cached_reconnects: 10,
            peer_cache_path: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Mesh-growth protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntroductionConfig {
    pub act_as_hub: bool,
    pub settle_delay_ms: u64,
    pub round_delay_ms: u64,
}

impl Default for IntroductionConfig {
    fn default() -> Self {
        Self {
            act_as_hub: true,
            settle_delay_ms: 1_000,
            round_delay_ms: 500,
        }
    }
}

impl IntroductionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn round_delay(&self) -> Duration {
        Duration::from_millis(self.round_delay_ms)
    }
}

/// App bundle transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Version string of the running build, mixed into the bundle hash
    pub build_version: String,
    pub settle_delay_ms: u64,
    pub chunk_pace_every: usize,
    pub chunk_pace_delay_ms: u64,
    pub max_bundle_bytes: u64,
    /// Request newer bundles automatically when a peer advertises one
    pub auto_update: bool,
    pub store_path: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            build_version: "0.1.0".to_string(),
            settle_delay_ms: 2_000,
            chunk_pace_every: 10,
            chunk_pace_delay_ms: 50,
            max_bundle_bytes: 50 * 1024 * 1024,
            auto_update: true,
            store_path: None,
        }
    }
}

impl TransferConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn chunk_pace_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_pace_delay_ms)
    }
}

/// Store-and-forward relay fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub urls: Vec<String>,
    /// Send over both direct and relay paths for every message
    pub dual_send: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            urls: vec!["wss://relay.damus.io".to_string()],
            dual_send: false,
        }
    }
}

impl Config {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> CoreResult<()> {
        if self.mesh.app_id.trim().is_empty() {
            return Err(CoreError::Config("mesh.app_id must not be empty".to_string()));
        }
        if self.mesh.heartbeat_interval_ms == 0 {
            return Err(CoreError::Config(
                "mesh.heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.discovery.full_mesh_threshold == 0 {
            return Err(CoreError::Config(
                "discovery.full_mesh_threshold must be positive".to_string(),
            ));
        }
        if self.transfer.chunk_pace_every == 0 {
            return Err(CoreError::Config(
                "transfer.chunk_pace_every must be positive".to_string(),
            ));
        }
        if self.transfer.max_bundle_bytes == 0 {
            return Err(CoreError::Config(
                "transfer.max_bundle_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Where the peer cache lives, falling back to `dir`
    pub fn peer_cache_path_in(&self, dir: &Path) -> PathBuf {
        self.discovery
            .peer_cache_path
            .clone()
            .unwrap_or_else(|| dir.join("peer-cache.json"))
    }
}
