//! Hybrid routing between direct transport and the relay fallback
//!
//! A [`RoutingDecision`] is computed per fingerprint and cached for a fixed
//! TTL. Cached decisions are immutable snapshots; an entry past its TTL is
//! never served.

use lanthorn_core::current_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::service::MeshService;
use crate::transport::RelayClient;

/// Channel used for messages routed directly to a fingerprint
pub const DIRECT_CHANNEL: &str = "direct-message";

const ONLINE_CONFIDENCE: f64 = 0.9;
const OFFLINE_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Direct,
    Relay,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub peer_fingerprint: String,
    pub route: Route,
    pub is_online: bool,
    pub confidence: f64,
    /// When the decision was computed (Unix epoch milliseconds)
    pub computed_at: u64,
}

impl RoutingDecision {
    pub fn compute(fingerprint: &str, is_online: bool, prefer_direct: bool) -> Self {
        let route = if is_online && prefer_direct {
            Route::Direct
        } else {
            Route::Relay
        };
        Self {
            peer_fingerprint: fingerprint.to_string(),
            route,
            is_online,
            confidence: if is_online {
                ONLINE_CONFIDENCE
            } else {
                OFFLINE_CONFIDENCE
            },
            computed_at: current_timestamp(),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    decision: RoutingDecision,
    expires_at: Instant,
}

/// TTL cache of routing decisions keyed by fingerprint
#[derive(Debug)]
pub struct RoutingCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
}

impl RoutingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached decision, if one exists and has not expired at `now`
    pub fn lookup(&self, fingerprint: &str, now: Instant) -> Option<RoutingDecision> {
        self.entries
            .get(fingerprint)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.decision.clone())
    }

    pub fn insert(&mut self, decision: RoutingDecision, now: Instant) {
        self.entries.insert(
            decision.peer_fingerprint.clone(),
            CacheEntry {
                decision,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Drop expired entries, returning how many were removed
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Result of one routed send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOutcome {
    pub route: Route,
    pub success: bool,
}

/// Sends to a fingerprint over the direct mesh when the peer is online and
/// over the relay otherwise.
///
/// Fallback to the relay is triggered only by a failed local enqueue on the
/// direct path. The transport does not confirm delivery.
pub struct HybridMessageRouter {
    mesh: Arc<MeshService>,
    relay: Arc<dyn RelayClient>,
    dual_send: bool,
}

impl HybridMessageRouter {
    pub fn new(mesh: Arc<MeshService>, relay: Arc<dyn RelayClient>, dual_send: bool) -> Self {
        Self {
            mesh,
            relay,
            dual_send,
        }
    }

    pub async fn send(&self, fingerprint: &str, payload: serde_json::Value) -> RouteOutcome {
        let decision = self.mesh.get_routing_decision(fingerprint);

        if self.dual_send {
            let direct = self.send_direct(fingerprint, &payload).await;
            let relayed = self.send_relay(fingerprint, &payload).await;
            debug!(fingerprint, direct, relayed, "Dual send");
            return RouteOutcome {
                route: Route::Hybrid,
                success: true,
            };
        }

        if decision.route == Route::Direct {
            if self.send_direct(fingerprint, &payload).await {
                return RouteOutcome {
                    route: Route::Direct,
                    success: true,
                };
            }
            info!(fingerprint, "Direct enqueue failed, falling back to relay");
        }

        let success = self.send_relay(fingerprint, &payload).await;
        RouteOutcome {
            route: Route::Relay,
            success,
        }
    }

    async fn send_direct(&self, fingerprint: &str, payload: &serde_json::Value) -> bool {
        let Some(peer) = self.mesh.peer_by_fingerprint(fingerprint) else {
            return false;
        };
        match self
            .mesh
            .send_to_peer(&peer.peer_id, DIRECT_CHANNEL, payload.clone())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(fingerprint, peer_id = %peer.peer_id, error = %e, "Direct send failed");
                false
            }
        }
    }

    async fn send_relay(&self, fingerprint: &str, payload: &serde_json::Value) -> bool {
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(fingerprint, error = %e, "Relay payload not serializable");
                return false;
            }
        };
        match self.relay.publish(fingerprint, bytes).await {
            Ok(()) => true,
            Err(e) => {
                let connected = self
                    .relay
                    .statuses()
                    .iter()
                    .filter(|s| s.is_connected)
                    .count();
                warn!(fingerprint, error = %e, connected_relays = connected, "Relay publish failed");
                false
            }
        }
    }
}
