//! Durable bundle storage with trust-on-first-use
//!
//! The first bundle ever stored fixes the trust anchor. Later bundles with a
//! different hash replace the stored assets but stay untrusted; the anchor
//! survives [`BundleStore::clear`].

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::TransferResult;
use crate::packager::{self, AppBundle, AppBundleMetadata, CachedAsset};

/// Result of persisting a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBundle {
    pub metadata: AppBundleMetadata,
    pub trusted: bool,
}

pub trait BundleStore: Send + Sync {
    /// Persist `bundle` as the current bundle, anchoring trust if no anchor
    /// exists yet
    fn store(&self, bundle: &AppBundle) -> TransferResult<StoredBundle>;

    fn get_asset(&self, path: &str) -> TransferResult<Option<CachedAsset>>;

    /// Metadata of the current bundle with `trusted_hash` filled in
    fn get_metadata(&self) -> TransferResult<Option<AppBundleMetadata>>;

    fn trusted_hash(&self) -> TransferResult<Option<String>>;

    /// Remove the current bundle. The trust anchor is kept.
    fn clear(&self) -> TransferResult<()>;

    /// Whether the current bundle matches the trust anchor
    fn is_trusted(&self) -> TransferResult<bool> {
        let Some(metadata) = self.get_metadata()? else {
            return Ok(false);
        };
        Ok(self.trusted_hash()?.as_deref() == Some(metadata.hash.as_str()))
    }

    /// Whether `version` is newer than the stored bundle. Anything parseable
    /// is newer than an empty store.
    fn is_newer_version(&self, version: &str) -> TransferResult<bool> {
        Ok(match self.get_metadata()? {
            Some(metadata) => packager::is_newer_version(version, &metadata.version),
            None => semver::Version::parse(version.trim_start_matches('v')).is_ok(),
        })
    }
}

fn log_stored(metadata: &AppBundleMetadata, trusted: bool, anchored: bool) {
    if anchored {
        info!(hash = %metadata.hash, version = %metadata.version, "Trust anchored on first bundle");
    } else if !trusted {
        warn!(
            hash = %metadata.hash,
            trusted_hash = ?metadata.trusted_hash,
            "Stored bundle does not match trust anchor"
        );
    } else {
        info!(hash = %metadata.hash, version = %metadata.version, "Bundle stored");
    }
}

/// SQLite-backed bundle store
pub struct SqliteBundleStore {
    db: Mutex<Connection>,
}

impl SqliteBundleStore {
    pub fn open<P: AsRef<Path>>(path: P) -> TransferResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> TransferResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> TransferResult<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS bundle_assets (
                path TEXT PRIMARY KEY,
                mime_type TEXT NOT NULL,
                bytes BLOB NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS bundle_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                version TEXT NOT NULL,
                hash TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                total_size INTEGER NOT NULL,
                asset_count INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS trust_anchor (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                hash TEXT NOT NULL,
                anchored_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self { db: Mutex::new(db) })
    }

    fn anchor(db: &Connection) -> rusqlite::Result<Option<String>> {
        db.query_row("SELECT hash FROM trust_anchor WHERE id = 0", [], |row| {
            row.get(0)
        })
        .optional()
    }
}

impl BundleStore for SqliteBundleStore {
    fn store(&self, bundle: &AppBundle) -> TransferResult<StoredBundle> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;

        let anchored = tx.execute(
            "INSERT OR IGNORE INTO trust_anchor (id, hash, anchored_at) VALUES (0, ?1, ?2)",
            params![bundle.metadata.hash, bundle.metadata.timestamp],
        )? == 1;
        let trusted_hash = Self::anchor(&tx)?;

        tx.execute("DELETE FROM bundle_assets", [])?;
        for asset in &bundle.assets {
            tx.execute(
                "INSERT OR REPLACE INTO bundle_assets (path, mime_type, bytes) VALUES (?1, ?2, ?3)",
                params![asset.path, asset.mime_type, asset.bytes],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO bundle_metadata
                (id, version, hash, timestamp, total_size, asset_count)
             VALUES (0, ?1, ?2, ?3, ?4, ?5)",
            params![
                bundle.metadata.version,
                bundle.metadata.hash,
                bundle.metadata.timestamp,
                bundle.metadata.total_size,
                bundle.metadata.asset_count as i64
            ],
        )?;
        tx.commit()?;

        let trusted = trusted_hash.as_deref() == Some(bundle.metadata.hash.as_str());
        let metadata = AppBundleMetadata {
            trusted_hash,
            ..bundle.metadata.clone()
        };
        log_stored(&metadata, trusted, anchored);
        Ok(StoredBundle { metadata, trusted })
    }

    fn get_asset(&self, path: &str) -> TransferResult<Option<CachedAsset>> {
        let db = self.db.lock();
        let asset = db
            .query_row(
                "SELECT path, bytes, mime_type FROM bundle_assets WHERE path = ?1",
                params![path],
                |row| {
                    Ok(CachedAsset {
                        path: row.get(0)?,
                        bytes: row.get(1)?,
                        mime_type: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(asset)
    }

    fn get_metadata(&self) -> TransferResult<Option<AppBundleMetadata>> {
        let db = self.db.lock();
        let trusted_hash = Self::anchor(&db)?;
        let metadata = db
            .query_row(
                "SELECT version, hash, timestamp, total_size, asset_count
                 FROM bundle_metadata WHERE id = 0",
                [],
                |row| {
                    Ok(AppBundleMetadata {
                        version: row.get(0)?,
                        hash: row.get(1)?,
                        timestamp: row.get(2)?,
                        total_size: row.get(3)?,
                        asset_count: row.get::<_, i64>(4)? as usize,
                        trusted_hash: trusted_hash.clone(),
                    })
                },
            )
            .optional()?;
        Ok(metadata)
    }

    fn trusted_hash(&self) -> TransferResult<Option<String>> {
        Ok(Self::anchor(&self.db.lock())?)
    }

    fn clear(&self) -> TransferResult<()> {
        let db = self.db.lock();
        db.execute("DELETE FROM bundle_assets", [])?;
        db.execute("DELETE FROM bundle_metadata", [])?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    assets: HashMap<String, CachedAsset>,
    metadata: Option<AppBundleMetadata>,
    trusted_hash: Option<String>,
}

/// Bundle store held in memory
#[derive(Default)]
pub struct MemoryBundleStore {
    state: Mutex<MemoryState>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleStore for MemoryBundleStore {
    fn store(&self, bundle: &AppBundle) -> TransferResult<StoredBundle> {
        let mut state = self.state.lock();
        let anchored = state.trusted_hash.is_none();
        let trusted_hash = state
            .trusted_hash
            .get_or_insert_with(|| bundle.metadata.hash.clone())
            .clone();

        state.assets = bundle
            .assets
            .iter()
            .map(|a| (a.path.clone(), a.clone()))
            .collect();
        let trusted = trusted_hash == bundle.metadata.hash;
        let metadata = AppBundleMetadata {
            trusted_hash: Some(trusted_hash),
            ..bundle.metadata.clone()
        };
        state.metadata = Some(metadata.clone());
        drop(state);

        log_stored(&metadata, trusted, anchored);
        Ok(StoredBundle { metadata, trusted })
    }

    fn get_asset(&self, path: &str) -> TransferResult<Option<CachedAsset>> {
        Ok(self.state.lock().assets.get(path).cloned())
    }

    fn get_metadata(&self) -> TransferResult<Option<AppBundleMetadata>> {
        Ok(self.state.lock().metadata.clone())
    }

    fn trusted_hash(&self) -> TransferResult<Option<String>> {
        Ok(self.state.lock().trusted_hash.clone())
    }

    fn clear(&self) -> TransferResult<()> {
        let mut state = self.state.lock();
        state.assets.clear();
        state.metadata = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packager::{AppPackager, StaticAssetSource};
    use std::sync::Arc;

    fn bundle(body: &[u8], version: &str) -> AppBundle {
        let source = StaticAssetSource::new(vec![
            CachedAsset::new("/index.html", body.to_vec(), "text/html"),
            CachedAsset::new("/app.wasm", vec![0u8, 97, 115, 109], "application/wasm"),
        ]);
        AppPackager::new(Arc::new(source), version)
            .create_bundle()
            .unwrap()
    }

    fn check_trust_on_first_use(store: &dyn BundleStore) {
        assert!(!store.is_trusted().unwrap());
        assert!(store.trusted_hash().unwrap().is_none());

        let first = bundle(b"<html>v1</html>", "1.0.0");
        let stored = store.store(&first).unwrap();
        assert!(stored.trusted);
        assert_eq!(store.trusted_hash().unwrap(), Some(first.metadata.hash.clone()));
        assert!(store.is_trusted().unwrap());

        let second = bundle(b"<html>v2, longer</html>", "1.1.0");
        assert_ne!(first.metadata.hash, second.metadata.hash);
        let stored = store.store(&second).unwrap();
        assert!(!stored.trusted);
        assert_eq!(stored.metadata.trusted_hash, Some(first.metadata.hash.clone()));

        // Still retrievable, still flagged, anchor unchanged
        assert!(!store.is_trusted().unwrap());
        assert_eq!(store.trusted_hash().unwrap(), Some(first.metadata.hash.clone()));
        let metadata = store.get_metadata().unwrap().unwrap();
        assert_eq!(metadata.hash, second.metadata.hash);
        assert_eq!(metadata.version, "1.1.0");
        let index = store.get_asset("/index.html").unwrap().unwrap();
        assert_eq!(index.bytes, b"<html>v2, longer</html>");

        // Re-storing the anchored bundle restores trust
        assert!(store.store(&first).unwrap().trusted);
        assert!(store.is_trusted().unwrap());
    }

    fn check_clear_keeps_anchor(store: &dyn BundleStore) {
        let first = bundle(b"one", "1.0.0");
        store.store(&first).unwrap();
        store.clear().unwrap();

        assert!(store.get_metadata().unwrap().is_none());
        assert!(store.get_asset("/index.html").unwrap().is_none());
        assert_eq!(store.trusted_hash().unwrap(), Some(first.metadata.hash.clone()));
        assert!(!store.store(&bundle(b"two!", "1.0.0")).unwrap().trusted);
    }

    fn check_version_comparison(store: &dyn BundleStore) {
        assert!(store.is_newer_version("0.0.1").unwrap());
        assert!(!store.is_newer_version("nightly").unwrap());

        store.store(&bundle(b"x", "1.4.0")).unwrap();
        assert!(store.is_newer_version("1.5.0").unwrap());
        assert!(!store.is_newer_version("1.4.0").unwrap());
        assert!(!store.is_newer_version("1.3.9").unwrap());
    }

    #[test]
    fn test_memory_trust_on_first_use() {
        check_trust_on_first_use(&MemoryBundleStore::new());
    }

    #[test]
    fn test_sqlite_trust_on_first_use() {
        check_trust_on_first_use(&SqliteBundleStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_clear_keeps_anchor() {
        check_clear_keeps_anchor(&MemoryBundleStore::new());
        check_clear_keeps_anchor(&SqliteBundleStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_is_newer_version() {
        check_version_comparison(&MemoryBundleStore::new());
        check_version_comparison(&SqliteBundleStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundles.db");
        let first = bundle(b"persisted", "2.0.0");
        {
            let store = SqliteBundleStore::open(&path).unwrap();
            store.store(&first).unwrap();
        }

        let store = SqliteBundleStore::open(&path).unwrap();
        assert!(store.is_trusted().unwrap());
        let metadata = store.get_metadata().unwrap().unwrap();
        assert_eq!(metadata.hash, first.metadata.hash);
        assert_eq!(metadata.asset_count, 2);
        assert_eq!(
            store.get_asset("/app.wasm").unwrap().unwrap().mime_type,
            "application/wasm"
        );
    }
}
