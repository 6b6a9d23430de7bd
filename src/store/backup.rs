//! Backup Snapshots
//!
//! A backup is a point-in-time copy of every per-key usage file plus the
//! index, written into `backups/backup_YYYYMMDD_HHMMSS/`. Only the most
//! recent [`BACKUPS_KEPT`] snapshots are retained.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::error::StorageError;

/// Number of backup snapshots kept after rotation.
pub const BACKUPS_KEPT: usize = 10;

const BACKUP_PREFIX: &str = "backup_";

/// Copy all usage files and the index into a fresh timestamped snapshot
/// directory, then rotate old snapshots. Returns the snapshot path.
///
/// Per-key files are replaced atomically by the store, so copying a live
/// directory yields a consistent snapshot: each copied file is some
/// complete former value of its key.
pub async fn create_backup(
    usage_dir: &Path,
    index_path: &Path,
    backup_root: &Path,
    now: DateTime<Utc>,
) -> Result<PathBuf, StorageError> {
    let name = format!("{}{}", BACKUP_PREFIX, now.format("%Y%m%d_%H%M%S"));
    let snapshot_dir = backup_root.join(name);
    fs::create_dir_all(&snapshot_dir)
        .await
        .map_err(|e| StorageError::io(&snapshot_dir, e))?;

    let mut copied = 0usize;
    let mut rd = fs::read_dir(usage_dir)
        .await
        .map_err(|e| StorageError::io(usage_dir, e))?;
    while let Some(dent) = rd
        .next_entry()
        .await
        .map_err(|e| StorageError::io(usage_dir, e))?
    {
        let path = dent.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        let dest = snapshot_dir.join(file_name);
        match fs::copy(&path, &dest).await {
            Ok(_) => copied += 1,
            // A key deleted mid-backup is not an error; skip it.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&path, e)),
        }
    }

    if fs::try_exists(index_path)
        .await
        .map_err(|e| StorageError::io(index_path, e))?
    {
        let dest = snapshot_dir.join("index.json");
        fs::copy(index_path, &dest)
            .await
            .map_err(|e| StorageError::io(index_path, e))?;
    }

    let rotated = rotate(backup_root, BACKUPS_KEPT).await?;
    debug!(
        snapshot = %snapshot_dir.display(),
        files = copied,
        rotated_out = rotated,
        "backup snapshot written"
    );
    Ok(snapshot_dir)
}

/// Delete the oldest snapshots until at most `keep` remain. Returns the
/// number deleted. Snapshot names embed the timestamp, so lexicographic
/// order is chronological order.
pub async fn rotate(backup_root: &Path, keep: usize) -> Result<usize, StorageError> {
    let mut snapshots = list_snapshots(backup_root).await?;
    if snapshots.len() <= keep {
        return Ok(0);
    }
    snapshots.sort();
    let excess = snapshots.len() - keep;
    let mut removed = 0usize;
    for old in snapshots.into_iter().take(excess) {
        match fs::remove_dir_all(&old).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %old.display(), error = %e, "failed to remove old backup"),
        }
    }
    Ok(removed)
}

/// Count retained snapshots.
pub async fn count_snapshots(backup_root: &Path) -> Result<usize, StorageError> {
    Ok(list_snapshots(backup_root).await?.len())
}

async fn list_snapshots(backup_root: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut out = Vec::new();
    if !fs::try_exists(backup_root)
        .await
        .map_err(|e| StorageError::io(backup_root, e))?
    {
        return Ok(out);
    }
    let mut rd = fs::read_dir(backup_root)
        .await
        .map_err(|e| StorageError::io(backup_root, e))?;
    while let Some(dent) = rd
        .next_entry()
        .await
        .map_err(|e| StorageError::io(backup_root, e))?
    {
        let path = dent.path();
        let is_snapshot = path.is_dir()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(BACKUP_PREFIX))
                .unwrap_or(false);
        if is_snapshot {
            out.push(path);
        }
    }
    Ok(out)
}
