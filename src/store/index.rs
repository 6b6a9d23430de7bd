//! Store Index
//!
//! `index.json` lists every key the store has seen, so `all_keys` and the
//! admin fan-out operations never have to scan the usage directory. The
//! index is advisory bookkeeping; the per-key files remain the source of
//! truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::entry::UsageKey;

pub const INDEX_VERSION: &str = "1.0";

/// One indexed key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub identifier: String,
    pub operation_type: String,
    pub last_updated: DateTime<Utc>,
}

/// In-memory mirror of `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreIndex {
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: String,
    /// Keyed by `identifier:operation_type`
    pub entries: HashMap<String, IndexEntry>,
}

impl StoreIndex {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created: now,
            last_updated: now,
            version: INDEX_VERSION.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Record that a key exists (or was just written).
    pub fn upsert(&mut self, key: &UsageKey, now: DateTime<Utc>) {
        self.entries.insert(
            key.to_string(),
            IndexEntry {
                identifier: key.identifier.clone(),
                operation_type: key.operation_type.clone(),
                last_updated: now,
            },
        );
        self.last_updated = now;
    }

    /// Drop a key after its entry file was deleted.
    pub fn remove(&mut self, key: &UsageKey, now: DateTime<Utc>) -> bool {
        let removed = self.entries.remove(&key.to_string()).is_some();
        if removed {
            self.last_updated = now;
        }
        removed
    }

    pub fn contains(&self, key: &UsageKey) -> bool {
        self.entries.contains_key(&key.to_string())
    }

    /// All known keys, unordered.
    pub fn keys(&self) -> Vec<UsageKey> {
        self.entries
            .values()
            .map(|e| UsageKey::new(e.identifier.clone(), e.operation_type.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
