//! Multi-node scenarios for the Lanthorn mesh
//!
//! Every node runs in-process over the in-memory rendezvous, peer transport
//! and relay from `lanthorn_mesh::mock`:
//! - negotiated peer connections and pool housekeeping
//! - hub introductions ending in a direct link between two spokes
//! - hybrid routing as peers come online
//! - launch-time discovery and the persisted peer cache
//! - app bundle transfer with trust-on-first-use

pub mod test_utils;

#[cfg(test)]
mod mesh_scenarios;

#[cfg(test)]
mod discovery_scenarios;

#[cfg(test)]
mod transfer_scenarios;
