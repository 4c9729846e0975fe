//! Lanthorn app transfer
//!
//! Peers share the app itself over the mesh. [`AppPackager`] turns the
//! cached assets into a hashed bundle and size-bounded chunks,
//! [`AppTransfer`] runs the version/bundle exchange on the `app-transfer`
//! channel, and a [`BundleStore`] persists received bundles under
//! trust-on-first-use.

pub mod error;
pub mod packager;
pub mod store;
pub mod transfer;

pub use error::{TransferError, TransferResult};
pub use packager::{
    bundle_hash, bundle_to_chunks, chunks_to_bundle, is_newer_version, AppBundle,
    AppBundleMetadata, AppPackager, AssetSource, CachedAsset, StaticAssetSource, TransferChunk,
    BUNDLE_HASH_LEN, CHUNK_DATA_LIMIT,
};
pub use store::{BundleStore, MemoryBundleStore, SqliteBundleStore, StoredBundle};
pub use transfer::{
    AppTransfer, TransferDirection, TransferMessage, TransferPayload, TransferPhase,
    TransferProgress, VersionInfo, TRANSFER_CHANNEL,
};
