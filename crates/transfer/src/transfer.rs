//! App bundle transfer between peers
//!
//! A peer advertises its build with `version-info`. A receiver that finds
//! the advertised bundle newer, or built from different content, asks for it
//! with `bundle-request`; the sender answers with `bundle-metadata`, every
//! `bundle-chunk` in order, then `bundle-complete`. The receiver buffers
//! chunks per sender and only rebuilds and stores the bundle once the
//! completion message cross-checks. Bundles nobody asked for are dropped, and
//! a transfer that breaks the chunk set or the size limit is abandoned.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lanthorn_core::{current_timestamp, PeerId, Subject, Subscription, TransferConfig};
use lanthorn_mesh::{ChannelMessage, MeshService};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::error::{TransferError, TransferResult};
use crate::packager::{self, AppBundleMetadata, AppPackager, TransferChunk};
use crate::store::BundleStore;

pub const TRANSFER_CHANNEL: &str = "app-transfer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum TransferPayload {
    VersionInfo(VersionInfo),
    VersionRequest,
    BundleRequest,
    BundleMetadata(AppBundleMetadata),
    BundleChunk(TransferChunk),
    #[serde(rename_all = "camelCase")]
    BundleComplete { hash: String, chunk_count: usize },
}

impl TransferPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VersionInfo(_) => "version-info",
            Self::VersionRequest => "version-request",
            Self::BundleRequest => "bundle-request",
            Self::BundleMetadata(_) => "bundle-metadata",
            Self::BundleChunk(_) => "bundle-chunk",
            Self::BundleComplete { .. } => "bundle-complete",
        }
    }
}

/// Envelope on the transfer channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMessage {
    #[serde(flatten)]
    pub payload: TransferPayload,
    pub timestamp: u64,
}

impl TransferMessage {
    pub fn new(payload: TransferPayload) -> Self {
        Self {
            payload,
            timestamp: current_timestamp(),
        }
    }
}

impl ChannelMessage for TransferMessage {
    const CHANNEL: &'static str = TRANSFER_CHANNEL;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    Requesting,
    Sending,
    Receiving,
    Verifying,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub peer_id: PeerId,
    pub direction: TransferDirection,
    pub phase: TransferPhase,
    pub chunks_done: usize,
    pub chunks_total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set once an incoming bundle is stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted: Option<bool>,
}

impl TransferProgress {
    fn new(peer_id: &str, direction: TransferDirection, phase: TransferPhase) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            direction,
            phase,
            chunks_done: 0,
            chunks_total: 0,
            error: None,
            trusted: None,
        }
    }

    fn chunks(mut self, done: usize, total: usize) -> Self {
        self.chunks_done = done;
        self.chunks_total = total;
        self
    }

    fn failed(peer_id: &str, direction: TransferDirection, error: &TransferError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(peer_id, direction, TransferPhase::Failed)
        }
    }
}

/// Chunks buffered from one sender
struct IncomingBundle {
    metadata: AppBundleMetadata,
    chunks: BTreeMap<usize, TransferChunk>,
    total: usize,
    /// Decoded bytes buffered so far
    bytes: u64,
}

impl IncomingBundle {
    fn new(metadata: AppBundleMetadata) -> Self {
        Self {
            metadata,
            chunks: BTreeMap::new(),
            total: 0,
            bytes: 0,
        }
    }

    /// Buffer a chunk. Returns `false` for an index already held.
    fn accept(&mut self, chunk: TransferChunk, limit: u64, sender: &str) -> TransferResult<bool> {
        let violation = |reason: String| TransferError::Protocol {
            peer_id: sender.to_string(),
            reason,
        };
        if chunk.index >= chunk.total {
            return Err(violation(format!(
                "chunk {} outside a set of {}",
                chunk.index, chunk.total
            )));
        }
        if self.total != 0 && chunk.total != self.total {
            return Err(violation(format!(
                "chunk set of {} after a set of {}",
                chunk.total, self.total
            )));
        }
        if self.chunks.contains_key(&chunk.index) {
            return Ok(false);
        }

        let bytes = self.bytes + STANDARD.decode(&chunk.data)?.len() as u64;
        if bytes > limit {
            return Err(TransferError::TooLarge { size: bytes, limit });
        }
        self.bytes = bytes;
        self.total = chunk.total;
        self.chunks.insert(chunk.index, chunk);
        Ok(true)
    }
}

pub struct AppTransfer {
    mesh: Arc<MeshService>,
    packager: Arc<AppPackager>,
    store: Arc<dyn BundleStore>,
    config: TransferConfig,
    incoming: Mutex<HashMap<PeerId, IncomingBundle>>,
    /// Peers we have an outstanding bundle request with
    requested: Mutex<HashSet<PeerId>>,
    progress: Subject<TransferProgress>,
    subscriptions: Mutex<Vec<Subscription>>,
    self_ref: Weak<Self>,
}

impl AppTransfer {
    pub fn new(
        mesh: Arc<MeshService>,
        packager: Arc<AppPackager>,
        store: Arc<dyn BundleStore>,
        config: TransferConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            mesh,
            packager,
            store,
            config,
            incoming: Mutex::new(HashMap::new()),
            requested: Mutex::new(HashSet::new()),
            progress: Subject::new(),
            subscriptions: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Handle transfer messages and advertise our version to each new peer
    pub fn start(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        subscriptions.push(self.mesh.on_typed::<TransferMessage, _>(move |message, raw| {
            if let Some(this) = weak.upgrade() {
                this.handle_message(message.payload, &raw.sender_id);
            }
        }));

        let weak = Arc::downgrade(self);
        subscriptions.push(self.mesh.on_peer_joined(move |peer| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let peer_id = peer.peer_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.config.settle_delay()).await;
                if let Err(e) = this.send_version_info(&peer_id).await {
                    debug!(peer_id = %peer_id, error = %e, "Version announcement failed");
                }
            });
        }));
        info!(version = %self.packager.build_version(), "App transfer started");
    }

    pub fn stop(&self) {
        let subscriptions: Vec<Subscription> = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            subscription.cancel();
        }
        self.incoming.lock().clear();
        self.requested.lock().clear();
    }

    pub fn subscribe_progress<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.progress.subscribe(handler)
    }

    /// Version and hash of the bundle this node serves
    pub fn local_version(&self) -> TransferResult<VersionInfo> {
        Ok(VersionInfo {
            version: self.packager.build_version().to_string(),
            hash: self.packager.current_hash()?,
        })
    }

    /// Whether the bundle a peer advertises should be fetched: its version
    /// is newer than ours, or its content hash matches neither the running
    /// build nor the stored bundle
    pub fn should_request_update(&self, peer: &VersionInfo) -> TransferResult<bool> {
        let newer = packager::is_newer_version(&peer.version, self.packager.build_version())
            && self.store.is_newer_version(&peer.version)?;
        if newer {
            return Ok(true);
        }

        let stored = self.store.get_metadata()?.map(|m| m.hash);
        Ok(peer.hash != self.packager.current_hash()? && stored.as_deref() != Some(peer.hash.as_str()))
    }

    pub async fn send_version_info(&self, peer_id: &str) -> TransferResult<()> {
        let info = self.local_version()?;
        self.send(peer_id, TransferPayload::VersionInfo(info)).await
    }

    pub async fn request_version(&self, peer_id: &str) -> TransferResult<()> {
        self.send(peer_id, TransferPayload::VersionRequest).await
    }

    pub async fn request_bundle(&self, peer_id: &str) -> TransferResult<()> {
        self.requested.lock().insert(peer_id.to_string());
        self.progress.emit(&TransferProgress::new(
            peer_id,
            TransferDirection::Incoming,
            TransferPhase::Requesting,
        ));
        if let Err(e) = self.send(peer_id, TransferPayload::BundleRequest).await {
            self.requested.lock().remove(peer_id);
            self.progress
                .emit(&TransferProgress::failed(peer_id, TransferDirection::Incoming, &e));
            return Err(e);
        }
        Ok(())
    }

    /// Package the current assets and stream them to `peer_id`, returning
    /// the number of chunks sent
    pub async fn send_bundle(&self, peer_id: &str) -> TransferResult<usize> {
        match self.stream_bundle(peer_id).await {
            Ok(sent) => Ok(sent),
            Err(e) => {
                warn!(peer_id, error = %e, "Bundle send failed");
                self.progress
                    .emit(&TransferProgress::failed(peer_id, TransferDirection::Outgoing, &e));
                Err(e)
            }
        }
    }

    async fn stream_bundle(&self, peer_id: &str) -> TransferResult<usize> {
        let bundle = self.packager.create_bundle()?;
        if bundle.metadata.total_size > self.config.max_bundle_bytes {
            return Err(TransferError::TooLarge {
                size: bundle.metadata.total_size,
                limit: self.config.max_bundle_bytes,
            });
        }

        let chunks = packager::bundle_to_chunks(&bundle);
        let total = chunks.len();
        let hash = bundle.metadata.hash.clone();
        info!(peer_id, hash = %hash, chunks = total, "Sending bundle");
        self.progress.emit(
            &TransferProgress::new(peer_id, TransferDirection::Outgoing, TransferPhase::Sending)
                .chunks(0, total),
        );

        self.send(peer_id, TransferPayload::BundleMetadata(bundle.metadata))
            .await?;
        for (n, chunk) in chunks.into_iter().enumerate() {
            self.send(peer_id, TransferPayload::BundleChunk(chunk)).await?;
            let done = n + 1;
            self.progress.emit(
                &TransferProgress::new(peer_id, TransferDirection::Outgoing, TransferPhase::Sending)
                    .chunks(done, total),
            );
            if self.config.chunk_pace_every > 0
                && done % self.config.chunk_pace_every == 0
                && done < total
            {
                tokio::time::sleep(self.config.chunk_pace_delay()).await;
            }
        }
        self.send(
            peer_id,
            TransferPayload::BundleComplete {
                hash,
                chunk_count: total,
            },
        )
        .await?;

        self.progress.emit(
            &TransferProgress::new(peer_id, TransferDirection::Outgoing, TransferPhase::Complete)
                .chunks(total, total),
        );
        Ok(total)
    }

    async fn send(&self, peer_id: &str, payload: TransferPayload) -> TransferResult<()> {
        self.mesh
            .send_typed_to_peer(peer_id, &TransferMessage::new(payload))
            .await?;
        Ok(())
    }

    fn handle_message(&self, payload: TransferPayload, sender: &str) {
        debug!(sender, kind = payload.kind(), "Transfer message");
        match payload {
            TransferPayload::VersionInfo(info) => self.on_version_info(info, sender),
            TransferPayload::VersionRequest => {
                self.spawn_reply(sender, |this, peer| async move {
                    if let Err(e) = this.send_version_info(&peer).await {
                        debug!(peer_id = %peer, error = %e, "Version reply failed");
                    }
                });
            }
            TransferPayload::BundleRequest => {
                self.spawn_reply(sender, |this, peer| async move {
                    let _ = this.send_bundle(&peer).await;
                });
            }
            TransferPayload::BundleMetadata(metadata) => self.on_metadata(metadata, sender),
            TransferPayload::BundleChunk(chunk) => self.on_chunk(chunk, sender),
            TransferPayload::BundleComplete { hash, chunk_count } => {
                self.on_complete(&hash, chunk_count, sender)
            }
        }
    }

    fn spawn_reply<F, Fut>(&self, sender: &str, reply: F)
    where
        F: FnOnce(Arc<Self>, PeerId) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let peer = sender.to_string();
        tokio::spawn(reply(this, peer));
    }

    fn on_version_info(&self, info: VersionInfo, sender: &str) {
        let wanted = match self.should_request_update(&info) {
            Ok(wanted) => wanted,
            Err(e) => {
                warn!(sender, error = %e, "Version check failed");
                return;
            }
        };
        debug!(sender, version = %info.version, hash = %info.hash, wanted, "Peer version");
        if !wanted || !self.config.auto_update || self.requested.lock().contains(sender) {
            return;
        }
        self.spawn_reply(sender, |this, peer| async move {
            if let Err(e) = this.request_bundle(&peer).await {
                debug!(peer_id = %peer, error = %e, "Bundle request failed");
            }
        });
    }

    fn on_metadata(&self, metadata: AppBundleMetadata, sender: &str) {
        if !self.requested.lock().contains(sender) {
            warn!(sender, hash = %metadata.hash, "Unrequested bundle dropped");
            return;
        }
        if metadata.total_size > self.config.max_bundle_bytes {
            self.abandon(
                sender,
                TransferError::TooLarge {
                    size: metadata.total_size,
                    limit: self.config.max_bundle_bytes,
                },
            );
            return;
        }

        {
            let mut incoming = self.incoming.lock();
            if let Some(current) = incoming.get(sender) {
                warn!(
                    sender,
                    current = %current.metadata.hash,
                    offered = %metadata.hash,
                    "Bundle already in progress, metadata dropped"
                );
                return;
            }
            info!(sender, hash = %metadata.hash, version = %metadata.version, "Receiving bundle");
            incoming.insert(sender.to_string(), IncomingBundle::new(metadata));
        }
        self.progress.emit(&TransferProgress::new(
            sender,
            TransferDirection::Incoming,
            TransferPhase::Receiving,
        ));
    }

    fn on_chunk(&self, chunk: TransferChunk, sender: &str) {
        let accepted = {
            let mut incoming = self.incoming.lock();
            let Some(transfer) = incoming.get_mut(sender) else {
                warn!(sender, index = chunk.index, "Chunk before metadata dropped");
                return;
            };
            if chunk.bundle_hash != transfer.metadata.hash {
                warn!(
                    sender,
                    expected = %transfer.metadata.hash,
                    actual = %chunk.bundle_hash,
                    "Chunk for another bundle dropped"
                );
                return;
            }
            let index = chunk.index;
            match transfer.accept(chunk, self.config.max_bundle_bytes, sender) {
                Ok(true) => Ok(TransferProgress::new(
                    sender,
                    TransferDirection::Incoming,
                    TransferPhase::Receiving,
                )
                .chunks(transfer.chunks.len(), transfer.total)),
                Ok(false) => {
                    debug!(sender, index, "Duplicate chunk dropped");
                    return;
                }
                Err(e) => Err(e),
            }
        };

        match accepted {
            Ok(progress) => self.progress.emit(&progress),
            Err(e) => self.abandon(sender, e),
        }
    }

    /// Discard everything buffered from `sender` and report the failure
    fn abandon(&self, sender: &str, error: TransferError) {
        self.incoming.lock().remove(sender);
        self.requested.lock().remove(sender);
        warn!(sender, error = %error, "Incoming bundle abandoned");
        self.progress
            .emit(&TransferProgress::failed(sender, TransferDirection::Incoming, &error));
    }

    fn on_complete(&self, hash: &str, chunk_count: usize, sender: &str) {
        let Some(transfer) = self.incoming.lock().remove(sender) else {
            warn!(sender, hash, "Completion without transfer dropped");
            return;
        };
        self.requested.lock().remove(sender);

        let received = transfer.chunks.len();
        self.progress.emit(
            &TransferProgress::new(sender, TransferDirection::Incoming, TransferPhase::Verifying)
                .chunks(received, chunk_count),
        );

        match self.commit(transfer, hash, chunk_count) {
            Ok(trusted) => {
                let mut progress =
                    TransferProgress::new(sender, TransferDirection::Incoming, TransferPhase::Complete)
                        .chunks(received, chunk_count);
                progress.trusted = Some(trusted);
                self.progress.emit(&progress);
            }
            Err(e) => {
                warn!(sender, hash, error = %e, "Received bundle rejected");
                self.progress
                    .emit(&TransferProgress::failed(sender, TransferDirection::Incoming, &e));
            }
        }
    }

    /// Verify and persist a finished transfer, returning whether it is
    /// trusted
    fn commit(&self, transfer: IncomingBundle, hash: &str, chunk_count: usize) -> TransferResult<bool> {
        if transfer.metadata.hash != hash {
            return Err(TransferError::HashMismatch {
                expected: transfer.metadata.hash,
                actual: hash.to_string(),
            });
        }
        if transfer.chunks.len() != chunk_count {
            return Err(TransferError::Incomplete {
                reason: format!("{} of {chunk_count} chunks", transfer.chunks.len()),
            });
        }

        let chunks: Vec<TransferChunk> = transfer.chunks.into_values().collect();
        let bundle = packager::chunks_to_bundle(&chunks, Some(&transfer.metadata))?;
        let stored = self.store.store(&bundle)?;
        Ok(stored.trusted)
    }
}

impl std::fmt::Debug for AppTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppTransfer")
            .field("version", &self.packager.build_version())
            .field("incoming", &self.incoming.lock().len())
            .finish()
    }
}
