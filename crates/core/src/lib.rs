//! Core functionality for the Lanthorn peer-to-peer mesh.
//!
//! This crate provides the configuration, logging, observer and timestamp
//! utilities shared by the mesh and transfer crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod observer;
pub mod types;

pub use config::{
    Config, DiscoveryConfig, IntroductionConfig, MeshConfig, RelayConfig, TransferConfig,
};
pub use error::{CoreError, CoreResult};
pub use observer::{Subject, Subscription};
pub use types::{current_timestamp, PeerId};
