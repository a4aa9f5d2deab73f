//! Durable cache store: one JSON file per key.
//!
//! Records live at `<dir>/<sha256(key)>.json` and hold the payload, the
//! freshness timestamp (milliseconds since the Unix epoch), the optional
//! ETag, the origin URL and the full key:
//!
//! ```json
//! {"data":{"body":"...","statusCode":200},"timestamp":1700000000000,"etag":"\"v1\"","url":"https://...","key":"https://..."}
//! ```
//!
//! # Failure semantics
//!
//! No operation returns an error. Unreadable or corrupt records read as a
//! miss; failed writes and deletes are logged and skipped. A broken disk
//! degrades the cache to memory + origin, it never fails a lookup.
//!
//! # Eviction
//!
//! After every [`set`](DiskStore::set), if more than
//! [`StoreConfig::max_entries`] records exist, the oldest (by `timestamp`)
//! are deleted until the limit holds again.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::key::CacheKey;
use crate::telemetry;
use crate::types::{Body, CacheEntry};
use crate::{CacheError, Result};

const RECORD_EXTENSION: &str = "json";

/// On-disk record format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    data: Body,
    /// Milliseconds since the Unix epoch.
    timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    url: String,
    key: String,
}

impl StoredRecord {
    fn into_entry(self) -> CacheEntry {
        CacheEntry {
            payload: self.data,
            timestamp: UNIX_EPOCH + Duration::from_millis(self.timestamp),
            etag: self.etag,
            origin_url: self.url,
        }
    }
}

/// File-backed store of prior fetch results.
///
/// Sole writer to its directory. Sharing a directory between processes is
/// unsupported (there is no file locking).
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    config: StoreConfig,
    tmp_counter: AtomicU64,
}

impl DiskStore {
    /// Bind a store to `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>, config: StoreConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read the record for `key`. Missing, unreadable and corrupt records
    /// all return `None`.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.record_path(key);
        match read_record(&path).await {
            Ok(Some(record)) if record.key == key.as_str() => Some(record.into_entry()),
            Ok(Some(record)) => {
                warn!(
                    path = %path.display(),
                    stored_key = %CacheKey::from_raw(record.key),
                    "cache record belongs to a different key"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read cache record");
                None
            }
        }
    }

    /// Write `payload` for `key`, timestamped now, then enforce capacity.
    pub async fn set(&self, key: &CacheKey, payload: Body, origin_url: &str, etag: Option<String>) {
        let entry = CacheEntry {
            payload,
            timestamp: SystemTime::now(),
            etag,
            origin_url: origin_url.to_string(),
        };
        self.put_entry(key, &entry).await;
    }

    /// Write `entry` as-is, keeping its timestamp, then enforce capacity.
    ///
    /// Used for importing or seeding records; [`set`](Self::set) is the
    /// normal write path.
    pub async fn put_entry(&self, key: &CacheKey, entry: &CacheEntry) {
        let record = StoredRecord {
            data: entry.payload.clone(),
            timestamp: millis_since_epoch(entry.timestamp),
            etag: entry.etag.clone(),
            url: entry.origin_url.clone(),
            key: key.as_str().to_string(),
        };
        if let Err(e) = self.write_record(key, &record).await {
            warn!(key = %key, error = %e, "failed to write cache record");
            return;
        }
        self.cleanup().await;
    }

    /// Remove the record for `key`. Absent records are not an error.
    pub async fn delete(&self, key: &CacheKey) {
        let path = self.record_path(key);
        remove_file_logged(&path).await;
    }

    /// Remove every record in this store's directory, along with temp
    /// files left by interrupted writes.
    pub async fn clear(&self) {
        match self.list_files(|path| is_record(path) || is_temp(path)).await {
            Ok(files) => {
                for path in files {
                    remove_file_logged(&path).await;
                }
            }
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "failed to clear cache"),
        }
    }

    /// All keys currently stored. Maintenance use only; reads every record.
    pub async fn list_keys(&self) -> Vec<CacheKey> {
        let files = match self.record_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to list cache records");
                return Vec::new();
            }
        };
        let mut keys = Vec::with_capacity(files.len());
        for path in files {
            if let Ok(Some(record)) = read_record(&path).await {
                keys.push(CacheKey::from_raw(record.key));
            }
        }
        keys
    }

    /// Delete records whose timestamp is at least `max_age` old.
    ///
    /// Corrupt records are deleted too. Returns the number removed.
    pub async fn prune(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        for (path, timestamp) in self.scan_timestamps().await {
            let age = now.duration_since(timestamp).unwrap_or(Duration::ZERO);
            if age >= max_age && remove_file_logged(&path).await {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "pruned expired cache records");
        }
        removed
    }

    /// [`prune`](Self::prune) with the configured [`StoreConfig::max_age`].
    pub async fn prune_expired(&self) -> usize {
        self.prune(self.config.max_age).await
    }

    /// Drop the oldest records until at most `max_entries` remain.
    async fn cleanup(&self) {
        match self.record_files().await {
            Ok(files) if files.len() <= self.config.max_entries => return,
            Ok(_) => {}
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to count cache records");
                return;
            }
        }
        let records = self.scan_timestamps().await;
        if records.len() <= self.config.max_entries {
            return;
        }
        let excess = records.len() - self.config.max_entries;
        let mut evicted = 0u64;
        for (path, _) in records.into_iter().take(excess) {
            if remove_file_logged(&path).await {
                evicted += 1;
            }
        }
        metrics::counter!(telemetry::EVICTIONS_TOTAL).increment(evicted);
        debug!(evicted, dir = %self.dir.display(), "evicted oldest cache records");
    }

    /// `(path, freshness timestamp)` for every record file, oldest first.
    ///
    /// Records written within the same millisecond are ordered by file
    /// modification time. Unreadable records sort first (epoch).
    async fn scan_timestamps(&self) -> Vec<(PathBuf, SystemTime)> {
        let files = match self.record_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to scan cache records");
                return Vec::new();
            }
        };
        let mut out = Vec::with_capacity(files.len());
        for path in files {
            let written = match read_record(&path).await {
                Ok(Some(record)) => UNIX_EPOCH + Duration::from_millis(record.timestamp),
                Ok(None) => continue,
                Err(_) => UNIX_EPOCH,
            };
            let modified = tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            out.push((path, written, modified));
        }
        out.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));
        out.into_iter().map(|(path, written, _)| (path, written)).collect()
    }

    async fn write_record(&self, key: &CacheKey, record: &StoredRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            CacheError::Storage(format!(
                "failed to create cache dir {}: {e}",
                self.dir.display()
            ))
        })?;

        let path = self.record_path(key);
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("{RECORD_EXTENSION}.tmp{n}"));
        let json = serde_json::to_vec(record)?;

        tokio::fs::write(&tmp_path, &json).await.map_err(|e| {
            CacheError::Storage(format!(
                "failed to write cache file {}: {e}",
                tmp_path.display()
            ))
        })?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(CacheError::Storage(format!(
                "failed to rename cache file {} → {}: {e}",
                tmp_path.display(),
                path.display()
            )));
        }
        Ok(())
    }

    /// Paths of all `*.json` record files. A missing directory is empty.
    async fn record_files(&self) -> std::io::Result<Vec<PathBuf>> {
        self.list_files(is_record).await
    }

    async fn list_files(&self, keep: impl Fn(&Path) -> bool) -> std::io::Result<Vec<PathBuf>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if keep(&path) {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", key.file_stem()))
    }
}

fn is_record(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == RECORD_EXTENSION)
}

/// `<stem>.json.tmpN`, written by `write_record` before the rename.
fn is_temp(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.contains(&format!(".{RECORD_EXTENSION}.tmp"))
}

/// `Ok(None)` when the file does not exist.
async fn read_record(path: &Path) -> Result<Option<StoredRecord>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Returns whether a file was actually removed.
async fn remove_file_logged(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to delete cache record");
            false
        }
    }
}

fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
