//! Durable Usage Store
//!
//! File-backed, per-key store of usage history for admission control:
//! - One JSON file per (identifier, operation_type) key under `usage/`
//! - Atomic replace on every write (temp file + rename)
//! - Per-key async locks so unrelated keys never contend
//! - `index.json` of known keys for fan-out operations
//! - Retention cleanup that preserves the total-usage invariant
//! - Rotated backup snapshots (most recent 10 kept)
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                  UsageStore                    │
//! │                                                │
//! │  locks: DashMap<UsageKey, Mutex>  (sharded)    │
//! │  index: RwLock<StoreIndex>                     │
//! └──────────────┬─────────────────────────────────┘
//!                │ atomic write (tmp + rename)
//!                ▼
//!   data_dir/
//!     usage/<identifier>_<operation>.json   one entry per key
//!     index.json                            known-key index
//!     backups/backup_YYYYMMDD_HHMMSS/       rotated snapshots
//!     analytics/                            alert + report logs
//!     overrides/                            admin audit log
//! ```
//!
//! Failures are isolated per key: a corrupt file surfaces
//! [`StorageError::CorruptEntry`] for that key and leaves every other key
//! fully operational.

mod backup;
mod entry;
mod error;
mod index;

// Property-based tests module
#[cfg(test)]
mod proptests;

pub use backup::BACKUPS_KEPT;
pub use entry::{RateLimitEntry, UsageKey, UsageRecord};
pub use error::StorageError;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use index::StoreIndex;

/// Aggregate counters returned by [`UsageStore::stats`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub records: usize,
    pub total_usage: u64,
    pub total_blocked: u64,
    pub disk_bytes: u64,
    pub backups: usize,
}

/// Result of a retention [`UsageStore::cleanup`] pass.
///
/// Per-key failures are collected, never fatal: cleanup finishes the
/// remaining keys and reports what it could not process.
#[derive(Debug, Default)]
pub struct CleanupOutcome {
    pub records_removed: usize,
    pub entries_removed: usize,
    pub failures: Vec<(UsageKey, StorageError)>,
}

/// Durable, thread-safe usage store. The single owner of all persisted
/// entries; the limiter, analytics, and admin layers only go through this
/// API and never hold an entry across calls.
pub struct UsageStore {
    usage_dir: PathBuf,
    analytics_dir: PathBuf,
    overrides_dir: PathBuf,
    backup_root: PathBuf,
    index_path: PathBuf,
    io_timeout: Duration,
    locks: DashMap<UsageKey, Arc<Mutex<()>>>,
    index: RwLock<StoreIndex>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for UsageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageStore")
            .field("usage_dir", &self.usage_dir)
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

impl UsageStore {
    /// Open (or initialize) a store rooted at `data_dir`, using the system
    /// clock. Creates the directory layout on first use.
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        io_timeout: Duration,
    ) -> Result<Self, StorageError> {
        Self::open_with_clock(data_dir, io_timeout, Arc::new(SystemClock)).await
    }

    /// Open a store with an injected clock. Window tests pin the clock to
    /// exercise retention and override expiry deterministically.
    pub async fn open_with_clock(
        data_dir: impl Into<PathBuf>,
        io_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        let usage_dir = data_dir.join("usage");
        let analytics_dir = data_dir.join("analytics");
        let overrides_dir = data_dir.join("overrides");
        let backup_root = data_dir.join("backups");
        let index_path = data_dir.join("index.json");

        for dir in [&usage_dir, &analytics_dir, &overrides_dir, &backup_root] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::io(dir, e))?;
        }

        let store = Self {
            usage_dir,
            analytics_dir,
            overrides_dir,
            backup_root,
            index_path,
            io_timeout,
            locks: DashMap::new(),
            index: RwLock::new(StoreIndex::new(clock.now())),
            clock,
        };
        store.load_or_rebuild_index().await?;
        Ok(store)
    }

    /// Directory for analytics logs (alerts, reports).
    pub fn analytics_dir(&self) -> &Path {
        &self.analytics_dir
    }

    /// Directory for the admin audit log.
    pub fn overrides_dir(&self) -> &Path {
        &self.overrides_dir
    }

    /// Clock shared with the components built on this store.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Fetch the entry for a key, if any.
    pub async fn get(&self, key: &UsageKey) -> Result<Option<RateLimitEntry>, StorageError> {
        self.bounded(self.read_entry(key)).await
    }

    /// Atomically replace the entry for its key.
    pub async fn put(&self, entry: &RateLimitEntry) -> Result<(), StorageError> {
        let key = entry.key();
        let lock = self.key_lock(&key);
        self.bounded(async {
            let _guard = lock.lock().await;
            self.write_entry(entry).await?;
            self.touch_index(&key).await
        })
        .await
    }

    /// Read-modify-write under the key's lock. Creates the entry lazily
    /// when absent. Returns whatever the closure returns.
    pub async fn mutate<T>(
        &self,
        key: &UsageKey,
        f: impl FnOnce(&mut RateLimitEntry) -> T,
    ) -> Result<T, StorageError> {
        let lock = self.key_lock(key);
        self.bounded(async {
            let _guard = lock.lock().await;
            let mut entry = self
                .read_entry(key)
                .await?
                .unwrap_or_else(|| RateLimitEntry::new(key));
            let out = f(&mut entry);
            self.write_entry(&entry).await?;
            self.touch_index(key).await?;
            Ok(out)
        })
        .await
    }

    /// Append a consumption record for the key.
    pub async fn record_usage(
        &self,
        key: &UsageKey,
        resource_consumed: u64,
        user_id: Option<String>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<(), StorageError> {
        let mut record = UsageRecord::new(self.clock.now(), key.operation_type.clone(), resource_consumed);
        record.user_id = user_id;
        record.metadata = metadata;
        self.mutate(key, |entry| entry.record(record)).await
    }

    /// Count one rejected attempt against the key.
    pub async fn record_block(&self, key: &UsageKey) -> Result<(), StorageError> {
        self.mutate(key, |entry| entry.blocked_count += 1).await
    }

    /// Clear an override whose expiry has passed. Returns true when state
    /// changed. Does not create an entry for an unknown key.
    pub async fn clear_expired_override(&self, key: &UsageKey) -> Result<bool, StorageError> {
        let now = self.clock.now();
        match self.get(key).await? {
            Some(entry) if entry.override_has_expired(now) => {
                self.mutate(key, |e| {
                    // Re-check under the lock; a concurrent grant wins.
                    if e.override_has_expired(now) {
                        e.clear_override();
                        true
                    } else {
                        false
                    }
                })
                .await
            }
            _ => Ok(false),
        }
    }

    /// Records for a key with timestamps inside `[start, end]`.
    pub async fn usage_in_window(
        &self,
        key: &UsageKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, StorageError> {
        Ok(self
            .get(key)
            .await?
            .map(|e| e.records_in_window(start, end))
            .unwrap_or_default())
    }

    /// Total resource consumption for a key inside `[start, end]`.
    pub async fn total_usage_in_window(
        &self,
        key: &UsageKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        Ok(self
            .get(key)
            .await?
            .map(|e| e.usage_in_window(start, end))
            .unwrap_or(0))
    }

    /// Every key the store knows about.
    pub async fn all_keys(&self) -> Vec<UsageKey> {
        self.index.read().await.keys()
    }

    /// Drop records older than the retention horizon, recompute totals,
    /// and delete entries left with no records and no active override.
    ///
    /// Never aborts on a single bad key; failures are collected in the
    /// outcome. Safe to run while reads and writes continue.
    pub async fn cleanup(&self, retention_days: u32) -> CleanupOutcome {
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::days(i64::from(retention_days));
        let mut outcome = CleanupOutcome::default();

        for key in self.all_keys().await {
            match self.cleanup_key(&key, cutoff, now).await {
                Ok((records, entry_removed)) => {
                    outcome.records_removed += records;
                    if entry_removed {
                        outcome.entries_removed += 1;
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "cleanup skipped key");
                    outcome.failures.push((key, e));
                }
            }
        }

        info!(
            records_removed = outcome.records_removed,
            entries_removed = outcome.entries_removed,
            failures = outcome.failures.len(),
            retention_days,
            "usage cleanup finished"
        );
        outcome
    }

    async fn cleanup_key(
        &self,
        key: &UsageKey,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(usize, bool), StorageError> {
        let lock = self.key_lock(key);
        let guard = lock.lock().await;

        let Some(mut entry) = self.read_entry(key).await? else {
            // Stale index record with no backing file.
            self.delete_entry_locked(key, now).await?;
            drop(guard);
            drop(lock);
            self.reclaim_lock(key);
            return Ok((0, false));
        };

        let removed = entry.prune_older_than(cutoff);
        if entry.is_prunable(now) {
            self.delete_entry_locked(key, now).await?;
            drop(guard);
            drop(lock);
            self.reclaim_lock(key);
            return Ok((removed, true));
        }
        if removed > 0 {
            self.write_entry(&entry).await?;
            self.touch_index(key).await?;
        }
        Ok((removed, false))
    }

    /// Remove a key's entry file and index record. The caller must hold the
    /// key's lock.
    async fn delete_entry_locked(
        &self,
        key: &UsageKey,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&path, e)),
        }
        let mut index = self.index.write().await;
        index.remove(key, now);
        self.persist_index(&index).await
    }

    /// Retire a key's lock once nothing else holds it. A queued waiter keeps
    /// the map entry alive, so a late writer and the next caller still
    /// serialize on the same mutex; the shard lock makes the count check and
    /// the removal a single step against `key_lock`.
    fn reclaim_lock(&self, key: &UsageKey) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Write a point-in-time snapshot and rotate old ones.
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        backup::create_backup(
            &self.usage_dir,
            &self.index_path,
            &self.backup_root,
            self.clock.now(),
        )
        .await
    }

    /// Aggregate counters across all keys. Corrupt keys are skipped with a
    /// warning so one bad file cannot hide the rest of the picture.
    pub async fn stats(&self) -> Result<StoreStats, StorageError> {
        let keys = self.all_keys().await;
        let mut stats = StoreStats {
            entries: keys.len(),
            records: 0,
            total_usage: 0,
            total_blocked: 0,
            disk_bytes: 0,
            backups: backup::count_snapshots(&self.backup_root).await?,
        };
        for key in &keys {
            match self.read_entry(key).await {
                Ok(Some(entry)) => {
                    stats.records += entry.usage_records.len();
                    stats.total_usage += entry.total_usage;
                    stats.total_blocked += entry.blocked_count;
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "stats skipped key"),
            }
        }
        let mut rd = fs::read_dir(&self.usage_dir)
            .await
            .map_err(|e| StorageError::io(&self.usage_dir, e))?;
        while let Some(dent) = rd
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.usage_dir, e))?
        {
            if let Ok(meta) = dent.metadata().await {
                stats.disk_bytes += meta.len();
            }
        }
        Ok(stats)
    }

    // --- internals ---

    fn entry_path(&self, key: &UsageKey) -> PathBuf {
        self.usage_dir.join(format!("{}.json", key.storage_stem()))
    }

    fn key_lock(&self, key: &UsageKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(StorageError::Timeout {
                timeout_ms: self.io_timeout.as_millis() as u64,
            }),
        }
    }

    async fn read_entry(&self, key: &UsageKey) -> Result<Option<RateLimitEntry>, StorageError> {
        let path = self.entry_path(key);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::corrupt(key.to_string(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn write_entry(&self, entry: &RateLimitEntry) -> Result<(), StorageError> {
        let key = entry.key();
        let bytes = serde_json::to_vec_pretty(entry).map_err(|e| StorageError::Serialize {
            key: key.to_string(),
            source: e,
        })?;
        write_atomic(&self.entry_path(&key), &bytes).await
    }

    async fn touch_index(&self, key: &UsageKey) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut index = self.index.write().await;
        index.upsert(key, now);
        self.persist_index(&index).await
    }

    async fn persist_index(&self, index: &StoreIndex) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(index).map_err(|e| StorageError::Serialize {
            key: "index".to_string(),
            source: e,
        })?;
        write_atomic(&self.index_path, &bytes).await
    }

    /// Load `index.json`, or rebuild it by scanning the usage directory
    /// when missing or unreadable. Entries embed their own key, so a lost
    /// index is fully recoverable.
    async fn load_or_rebuild_index(&self) -> Result<(), StorageError> {
        match fs::read(&self.index_path).await {
            Ok(bytes) => {
                if let Ok(loaded) = serde_json::from_slice::<StoreIndex>(&bytes) {
                    *self.index.write().await = loaded;
                    return Ok(());
                }
                warn!(path = %self.index_path.display(), "index unreadable, rebuilding");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&self.index_path, e)),
        }

        let now = self.clock.now();
        let mut rebuilt = StoreIndex::new(now);
        let mut rd = fs::read_dir(&self.usage_dir)
            .await
            .map_err(|e| StorageError::io(&self.usage_dir, e))?;
        while let Some(dent) = rd
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.usage_dir, e))?
        {
            let path = dent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<RateLimitEntry>(&bytes) {
                    Ok(entry) => rebuilt.upsert(&entry.key(), now),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable entry during index rebuild")
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable file during index rebuild")
                }
            }
        }
        debug!(entries = rebuilt.len(), "index rebuilt from usage files");
        self.persist_index(&rebuilt).await?;
        *self.index.write().await = rebuilt;
        Ok(())
    }
}

/// Write bytes to a temp file then rename it into place. A reader sees the
/// old contents or the new, never a partial write.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| StorageError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    Ok(())
}
