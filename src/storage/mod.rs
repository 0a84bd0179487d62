//! Persistence layer.
//!
//! The per-account `BotCache` and the durable key/value store are plain
//! JSON files written atomically (temp file, fsync, rename). Cache writes
//! from the engine go through a `CacheWriter` so they never block an
//! announcement cycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::listing::{checksum, AssetForListing};
use crate::platform::KeyValueStore;
use crate::types::{MatcherError, SteamId};

/// Default directory for cache and key/value files.
pub const DEFAULT_CACHE_DIR: &str = "cache";

// ---------------------------------------------------------------------------
// Bot cache
// ---------------------------------------------------------------------------

/// What was last announced for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotCache {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_announced_assets: Vec<AssetForListing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_announced_trade_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pre_dedup_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<DateTime<Utc>>,
}

impl BotCache {
    /// Checksum of the last accepted listing, if any.
    pub fn last_announced_checksum(&self) -> Option<String> {
        (!self.last_announced_assets.is_empty()).then(|| checksum(&self.last_announced_assets))
    }

    pub fn clear(&mut self) {
        *self = BotCache::default();
    }
}

/// `<cache_dir>/<steam_id>.cache.json`
pub fn cache_path(cache_dir: &Path, steam_id: SteamId) -> PathBuf {
    cache_dir.join(format!("{steam_id}.cache.json"))
}

/// `<cache_dir>/<steam_id>.db.json`
pub fn store_path(cache_dir: &Path, steam_id: SteamId) -> PathBuf {
    cache_dir.join(format!("{steam_id}.db.json"))
}

/// Load a bot cache. A missing file is a fresh, empty cache.
pub fn load_bot_cache(path: &Path) -> Result<BotCache> {
    if !path.exists() {
        info!(path = %path.display(), "No bot cache found, starting fresh");
        return Ok(BotCache::default());
    }

    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read bot cache from {}", path.display()))?;

    let cache: BotCache = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse bot cache from {}", path.display()))?;

    debug!(
        path = %path.display(),
        assets = cache.last_announced_assets.len(),
        last_request_at = ?cache.last_request_at,
        "Bot cache loaded"
    );

    Ok(cache)
}

pub fn save_bot_cache(path: &Path, cache: &BotCache) -> Result<()> {
    let json = serde_json::to_string_pretty(cache).context("Failed to serialise bot cache")?;
    write_atomic(path, json.as_bytes())?;

    debug!(path = %path.display(), assets = cache.last_announced_assets.len(), "Bot cache saved");
    Ok(())
}

/// Write to `<path>.tmp`, fsync, then rename over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let mut file = fs::File::create(&temp)
        .with_context(|| format!("Failed to create {}", temp.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", temp.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", temp.display()))?;

    fs::rename(&temp, path)
        .with_context(|| format!("Failed to move {} into place", temp.display()))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Asynchronous cache writer
// ---------------------------------------------------------------------------

/// Background writer for one bot cache.
///
/// Only the newest value is ever written; intermediate updates that arrive
/// while a write is in flight are coalesced.
pub struct CacheWriter {
    sender: watch::Sender<BotCache>,
    handle: JoinHandle<()>,
}

impl CacheWriter {
    pub fn spawn(path: PathBuf, initial: BotCache) -> Self {
        let (sender, mut receiver) = watch::channel(initial);

        let handle = tokio::spawn(async move {
            // Unseen values are still delivered after the sender is dropped
            while receiver.changed().await.is_ok() {
                let cache = receiver.borrow_and_update().clone();
                let target = path.clone();

                match tokio::task::spawn_blocking(move || save_bot_cache(&target, &cache)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Failed to persist bot cache"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Bot cache writer task failed"),
                }
            }
        });

        Self { sender, handle }
    }

    /// Queue `cache` for persistence.
    pub fn update(&self, cache: BotCache) {
        self.sender.send_replace(cache);
    }

    /// Flush the pending value and stop the writer.
    pub async fn close(self) {
        drop(self.sender);

        if let Err(e) = self.handle.await {
            warn!(error = %e, "Bot cache writer did not shut down cleanly");
        }
    }
}

// ---------------------------------------------------------------------------
// Key/value store
// ---------------------------------------------------------------------------

/// `KeyValueStore` over a single JSON object file.
///
/// Writes are serialised by `write_lock` so the file always ends up with
/// the newest snapshot; the disk I/O itself runs on the blocking pool.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<serde_json::Map<String, serde_json::Value>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let values = if path.exists() {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse store {}", path.display()))?
        } else {
            serde_json::Map::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, MatcherError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set_json(&self, key: &str, value: Option<serde_json::Value>) -> Result<(), MatcherError> {
        let _write = self.write_lock.lock().await;

        let json = {
            let mut values = self.values.lock();

            match value {
                Some(value) => {
                    values.insert(key.to_string(), value);
                }
                None => {
                    values.remove(key);
                }
            }

            serde_json::to_vec_pretty(&*values).map_err(|e| MatcherError::Storage(e.to_string()))?
        };

        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| MatcherError::Storage(format!("store writer task failed: {e}")))?
            .map_err(|e| MatcherError::Storage(format!("{e:#}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
