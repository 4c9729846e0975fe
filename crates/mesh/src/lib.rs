//! Lanthorn Mesh - peer-to-peer transport and coordination
//!
//! Connects peers of a decentralized messaging client over a WebRTC-like
//! transport and keeps them connected.
//!
//! # Core Components
//!
//! - **PeerConnection / Pool**: one connection and reliable channel per peer,
//!   with a state machine, traffic stats and failure cleanup
//! - **Room**: named rendezvous group with presence, named channels and
//!   per-channel sequencing
//! - **MeshService**: owns rooms, merges peer sightings and routes messages
//!   between the direct mesh and a store-and-forward relay
//! - **AutoDiscovery**: launch-time discovery over the rendezvous room, cached
//!   peers and the local network
//! - **PeerIntroduction**: hub-relayed signaling that grows the mesh
//!
//! The transport, rendezvous and relay are reached through the traits in
//! [`transport`]; [`mock`] provides in-memory implementations.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use lanthorn_core::MeshConfig;
//! use lanthorn_mesh::mock::MockRendezvous;
//! use lanthorn_mesh::MeshService;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let rendezvous = MockRendezvous::new();
//! let mesh = MeshService::new(MeshConfig::default(), rendezvous.strategy("node-1"));
//! mesh.join_room("lobby").await?;
//! let status = mesh.status();
//! println!("connected peers: {}", status.connected_peers);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod discovery;
pub mod error;
pub mod introduction;
pub mod message;
pub mod mock;
pub mod peer;
pub mod pool;
pub mod room;
pub mod routing;
pub mod service;
pub mod transport;

pub use connection::{PeerConnection, PeerStats, DATA_CHANNEL_LABEL};
pub use discovery::{
    AutoDiscovery, CachedPeer, DiscoveredPeer, DiscoveryStatus, DiscoveryStrategy,
    JsonFilePeerCacheStore, MemoryPeerCacheStore, PeerCache, PeerCacheStore, Topology,
};
pub use error::{MeshError, MeshResult};
pub use introduction::{IntroductionAction, IntroductionMessage, PeerIntroduction};
pub use message::{BinaryMessage, ChannelMessage, P2PMessage};
pub use peer::{ConnectionMethod, MeshPeer, PeerTable};
pub use pool::{PeerConnectionPool, SendReport};
pub use room::{Room, RoomConfig, RoomState};
pub use routing::{HybridMessageRouter, Route, RouteOutcome, RoutingDecision};
pub use service::{IdentityAnnouncement, MeshFault, MeshService, MeshStatus};
pub use transport::{
    ConnectionState, IceConnectionState, RelayClient, RelayStatus, RtcTransport,
    RtcTransportFactory, SignalingStrategy, StrategyKind, TransportError,
};
