//! App packaging
//!
//! Snapshots the cached assets into an [`AppBundle`] and converts bundles to
//! and from size-bounded [`TransferChunk`]s.
//!
//! Chunk data is base64 text of at most [`CHUNK_DATA_LIMIT`] characters. An
//! asset too large for one chunk is split into fragments; every fragment
//! but the last carries a `::fragment::<n>` marker in its path, and only the
//! last carries the asset's real mime type and size.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lanthorn_core::current_timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::{TransferError, TransferResult};

/// Most base64 characters carried by one chunk
pub const CHUNK_DATA_LIMIT: usize = 64 * 1024;

/// Raw bytes per fragment; encodes to exactly [`CHUNK_DATA_LIMIT`] characters
const FRAGMENT_BYTES: usize = CHUNK_DATA_LIMIT / 4 * 3;

/// Hex characters kept from the bundle digest
pub const BUNDLE_HASH_LEN: usize = 16;

const FRAGMENT_MARKER: &str = "::fragment::";
const FRAGMENT_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAsset {
    pub path: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl CachedAsset {
    pub fn new(path: impl Into<String>, bytes: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Enumerates the assets the running app is served from
pub trait AssetSource: Send + Sync {
    fn assets(&self) -> TransferResult<Vec<CachedAsset>>;
}

/// Asset source backed by an in-memory list
#[derive(Debug, Default)]
pub struct StaticAssetSource {
    assets: Mutex<Vec<CachedAsset>>,
}

impl StaticAssetSource {
    pub fn new(assets: Vec<CachedAsset>) -> Self {
        Self {
            assets: Mutex::new(assets),
        }
    }

    pub fn replace(&self, assets: Vec<CachedAsset>) {
        *self.assets.lock() = assets;
    }
}

impl AssetSource for StaticAssetSource {
    fn assets(&self) -> TransferResult<Vec<CachedAsset>> {
        Ok(self.assets.lock().clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppBundleMetadata {
    pub version: String,
    pub hash: String,
    pub timestamp: u64,
    pub total_size: u64,
    pub asset_count: usize,
    /// Hash anchored by the first bundle ever stored, filled in by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBundle {
    pub metadata: AppBundleMetadata,
    pub assets: Vec<CachedAsset>,
}

impl AppBundle {
    pub fn asset(&self, path: &str) -> Option<&CachedAsset> {
        self.assets.iter().find(|a| a.path == path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferChunk {
    pub index: usize,
    pub total: usize,
    pub bundle_hash: String,
    pub path: String,
    pub mime_type: String,
    /// Base64 of the chunk's bytes
    pub data: String,
    pub size: u64,
}

/// Deterministic bundle hash over sorted `path:size` pairs and the build
/// version
pub fn bundle_hash(assets: &[CachedAsset], build_version: &str) -> String {
    let mut entries: Vec<String> = assets
        .iter()
        .map(|a| format!("{}:{}", a.path, a.bytes.len()))
        .collect();
    entries.sort();

    let mut hasher = blake3::Hasher::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(build_version.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest.as_bytes()[..BUNDLE_HASH_LEN / 2])
}

/// Whether `candidate` is a strictly newer semantic version than `current`.
/// Strings that do not parse are never newer.
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    match (
        semver::Version::parse(candidate.trim_start_matches('v')),
        semver::Version::parse(current.trim_start_matches('v')),
    ) {
        (Ok(candidate), Ok(current)) => candidate > current,
        _ => false,
    }
}

pub struct AppPackager {
    source: Arc<dyn AssetSource>,
    build_version: String,
}

impl AppPackager {
    pub fn new(source: Arc<dyn AssetSource>, build_version: impl Into<String>) -> Self {
        Self {
            source,
            build_version: build_version.into(),
        }
    }

    pub fn build_version(&self) -> &str {
        &self.build_version
    }

    /// Snapshot the asset source into a bundle
    pub fn create_bundle(&self) -> TransferResult<AppBundle> {
        let mut assets = self.source.assets()?;
        assets.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(pair) = assets.windows(2).find(|w| w[0].path == w[1].path) {
            return Err(TransferError::AssetSource(format!(
                "duplicate asset path {}",
                pair[0].path
            )));
        }
        if let Some(asset) = assets.iter().find(|a| split_fragment(&a.path).1.is_some()) {
            return Err(TransferError::AssetSource(format!(
                "asset path {} collides with the fragment marker",
                asset.path
            )));
        }

        let metadata = AppBundleMetadata {
            version: self.build_version.clone(),
            hash: bundle_hash(&assets, &self.build_version),
            timestamp: current_timestamp(),
            total_size: assets.iter().map(|a| a.bytes.len() as u64).sum(),
            asset_count: assets.len(),
            trusted_hash: None,
        };
        debug!(hash = %metadata.hash, assets = metadata.asset_count, size = metadata.total_size, "Bundle created");
        Ok(AppBundle { metadata, assets })
    }

    /// Hash the current assets would produce, without copying them into a
    /// bundle
    pub fn current_hash(&self) -> TransferResult<String> {
        Ok(bundle_hash(&self.source.assets()?, &self.build_version))
    }
}

/// Split a bundle into ordered chunks
pub fn bundle_to_chunks(bundle: &AppBundle) -> Vec<TransferChunk> {
    struct Piece<'a> {
        path: String,
        mime_type: &'a str,
        bytes: &'a [u8],
        size: u64,
    }

    let mut pieces: Vec<Piece<'_>> = Vec::new();
    for asset in &bundle.assets {
        if asset.bytes.len() <= FRAGMENT_BYTES {
            pieces.push(Piece {
                path: asset.path.clone(),
                mime_type: &asset.mime_type,
                bytes: &asset.bytes,
                size: asset.bytes.len() as u64,
            });
            continue;
        }

        let fragments: Vec<&[u8]> = asset.bytes.chunks(FRAGMENT_BYTES).collect();
        let last = fragments.len() - 1;
        for (n, fragment) in fragments.into_iter().enumerate() {
            if n == last {
                pieces.push(Piece {
                    path: asset.path.clone(),
                    mime_type: &asset.mime_type,
                    bytes: fragment,
                    size: asset.bytes.len() as u64,
                });
            } else {
                pieces.push(Piece {
                    path: format!("{}{FRAGMENT_MARKER}{n}", asset.path),
                    mime_type: FRAGMENT_MIME,
                    bytes: fragment,
                    size: fragment.len() as u64,
                });
            }
        }
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| TransferChunk {
            index,
            total,
            bundle_hash: bundle.metadata.hash.clone(),
            path: piece.path,
            mime_type: piece.mime_type.to_string(),
            data: STANDARD.encode(piece.bytes),
            size: piece.size,
        })
        .collect()
}

/// Split a chunk path into the asset path and fragment number, if marked
fn split_fragment(path: &str) -> (&str, Option<usize>) {
    match path.rsplit_once(FRAGMENT_MARKER) {
        Some((asset, n)) => match n.parse() {
            Ok(n) => (asset, Some(n)),
            Err(_) => (path, None),
        },
        None => (path, None),
    }
}

#[derive(Default)]
struct AssetParts {
    fragments: BTreeMap<usize, Vec<u8>>,
    last: Option<(String, u64, Vec<u8>)>,
}

/// Rebuild a bundle from a complete chunk set
///
/// The chunks must cover every index in `0..total` exactly once and agree on
/// the bundle hash. When `metadata` is given its hash must match as well;
/// otherwise metadata is derived from the chunks.
pub fn chunks_to_bundle(
    chunks: &[TransferChunk],
    metadata: Option<&AppBundleMetadata>,
) -> TransferResult<AppBundle> {
    let Some(first) = chunks.first() else {
        return match metadata {
            Some(metadata) if metadata.asset_count == 0 => Ok(AppBundle {
                metadata: metadata.clone(),
                assets: Vec::new(),
            }),
            _ => Err(TransferError::Incomplete {
                reason: "no chunks".to_string(),
            }),
        };
    };
    let total = first.total;
    let hash = first.bundle_hash.clone();

    if let Some(metadata) = metadata {
        if metadata.hash != hash {
            return Err(TransferError::HashMismatch {
                expected: metadata.hash.clone(),
                actual: hash,
            });
        }
    }

    let mut ordered: Vec<&TransferChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);
    let mut seen = BTreeSet::new();
    for chunk in &ordered {
        if chunk.bundle_hash != hash {
            return Err(TransferError::HashMismatch {
                expected: hash,
                actual: chunk.bundle_hash.clone(),
            });
        }
        if chunk.total != total || chunk.index >= total || !seen.insert(chunk.index) {
            return Err(TransferError::Incomplete {
                reason: format!("chunk {} does not fit a set of {total}", chunk.index),
            });
        }
    }
    if seen.len() != total {
        return Err(TransferError::Incomplete {
            reason: format!("{} of {total} chunks", seen.len()),
        });
    }

    let mut order: Vec<String> = Vec::new();
    let mut parts: BTreeMap<String, AssetParts> = BTreeMap::new();
    for chunk in ordered {
        let bytes = STANDARD.decode(&chunk.data)?;
        let (path, fragment) = split_fragment(&chunk.path);
        if !parts.contains_key(path) {
            order.push(path.to_string());
        }
        let entry = parts.entry(path.to_string()).or_default();
        match fragment {
            Some(n) => {
                entry.fragments.insert(n, bytes);
            }
            None => entry.last = Some((chunk.mime_type.clone(), chunk.size, bytes)),
        }
    }

    let mut assets = Vec::with_capacity(order.len());
    for path in order {
        let Some(AssetParts { fragments, last }) = parts.remove(&path) else {
            continue;
        };
        let (mime_type, size, tail) = last.ok_or_else(|| TransferError::Incomplete {
            reason: format!("final fragment of {path} missing"),
        })?;
        let mut bytes: Vec<u8> = fragments.into_values().flatten().collect();
        bytes.extend(tail);
        if bytes.len() as u64 != size {
            return Err(TransferError::Incomplete {
                reason: format!("{path}: {} of {size} bytes", bytes.len()),
            });
        }
        assets.push(CachedAsset {
            path,
            bytes,
            mime_type,
        });
    }

    let metadata = match metadata {
        Some(metadata) => {
            let recomputed = bundle_hash(&assets, &metadata.version);
            if recomputed != metadata.hash {
                return Err(TransferError::HashMismatch {
                    expected: metadata.hash.clone(),
                    actual: recomputed,
                });
            }
            metadata.clone()
        }
        None => AppBundleMetadata {
            version: String::new(),
            hash,
            timestamp: current_timestamp(),
            total_size: assets.iter().map(|a| a.bytes.len() as u64).sum(),
            asset_count: assets.len(),
            trusted_hash: None,
        },
    };
    Ok(AppBundle { metadata, assets })
}
