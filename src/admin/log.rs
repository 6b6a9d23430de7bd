//! Admin Audit Log
//!
//! Every admin action is appended to `admin_log.json`, capped at the most
//! recent 1000 entries. The log is an audit trail, not enforcement state:
//! overrides live in the usage entries themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use crate::store::{write_atomic, StorageError};

/// Most recent actions kept in the audit log.
pub const ADMIN_LOG_CAP: usize = 1000;

const LOG_FILE: &str = "admin_log.json";

/// What kind of admin action was performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminActionKind {
    OverrideGranted,
    OverrideRevoked,
    OverrideExpired,
    EmergencyOverride,
    UsageReset,
    BulkUsageReset,
}

impl AdminActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OverrideGranted => "override_granted",
            Self::OverrideRevoked => "override_revoked",
            Self::OverrideExpired => "override_expired",
            Self::EmergencyOverride => "emergency_override",
            Self::UsageReset => "usage_reset",
            Self::BulkUsageReset => "bulk_usage_reset",
        }
    }
}

impl fmt::Display for AdminActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited admin action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAction {
    /// What was done
    pub kind: AdminActionKind,

    /// Target identifier, or "*" for fan-out actions
    pub identifier: String,

    /// Target operation type
    pub operation_type: String,

    /// Action-specific details (justification, before/after values, counts)
    pub details: serde_json::Value,

    /// User who performed the action, or "system"
    pub performed_by: String,

    /// When the action happened (UTC)
    pub performed_at: DateTime<Utc>,

    /// Whether the action took effect
    pub success: bool,

    /// Append position, orders actions that share a timestamp. Assigned by
    /// the log on append; absent in older log files, where it loads as 0
    #[serde(default)]
    pub seq: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdminLogFile {
    created: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    actions: Vec<AdminAction>,
}

/// Durable, capped audit log of admin actions.
#[derive(Debug)]
pub struct AdminLog {
    path: PathBuf,
    // Serializes append's read-modify-write; reads go lock-free.
    write_lock: Mutex<()>,
}

impl AdminLog {
    pub fn new(overrides_dir: &Path) -> Self {
        Self {
            path: overrides_dir.join(LOG_FILE),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one action, dropping the oldest entries past the cap.
    pub async fn append(&self, mut action: AdminAction) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut log = self
            .load()
            .await?
            .unwrap_or_else(|| AdminLogFile {
                created: action.performed_at,
                last_updated: action.performed_at,
                actions: Vec::new(),
            });
        action.seq = log.actions.last().map_or(0, |a| a.seq + 1);
        log.last_updated = action.performed_at;
        log.actions.push(action);
        if log.actions.len() > ADMIN_LOG_CAP {
            let excess = log.actions.len() - ADMIN_LOG_CAP;
            log.actions.drain(..excess);
        }
        let bytes = serde_json::to_vec_pretty(&log).map_err(|e| StorageError::Serialize {
            key: LOG_FILE.to_string(),
            source: e,
        })?;
        write_atomic(&self.path, &bytes).await
    }

    /// The most recent actions, newest first, optionally filtered by kind
    /// and/or target identifier.
    pub async fn recent(
        &self,
        limit: usize,
        kind: Option<AdminActionKind>,
        identifier: Option<&str>,
    ) -> Result<Vec<AdminAction>, StorageError> {
        let Some(log) = self.load().await? else {
            return Ok(Vec::new());
        };
        let mut actions: Vec<AdminAction> = log
            .actions
            .into_iter()
            .filter(|a| {
                kind.map_or(true, |k| a.kind == k)
                    && identifier.map_or(true, |id| a.identifier == id)
            })
            .collect();
        actions.sort_by(|a, b| {
            b.performed_at
                .cmp(&a.performed_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        actions.truncate(limit);
        Ok(actions)
    }

    /// Action counts by kind over the most recent `limit` actions.
    pub async fn counts_by_kind(
        &self,
        limit: usize,
    ) -> Result<HashMap<String, usize>, StorageError> {
        let recent = self.recent(limit, None, None).await?;
        let mut counts = HashMap::new();
        for action in &recent {
            *counts.entry(action.kind.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn load(&self) -> Result<Option<AdminLogFile>, StorageError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::corrupt(LOG_FILE, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }
}
