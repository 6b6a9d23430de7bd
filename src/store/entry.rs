//! Usage Entry Types
//!
//! Core persisted types: a [`UsageKey`] identifies one (identifier,
//! operation_type) pair, a [`UsageRecord`] is one immutable consumption
//! event, and a [`RateLimitEntry`] is the append-log of records plus
//! aggregate counters for a key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key identifying one tracked (identifier, operation_type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    /// Entity being limited (user id, client id, tenant, ...)
    pub identifier: String,
    /// Operation class the limits apply to
    pub operation_type: String,
}

impl UsageKey {
    pub fn new(identifier: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            operation_type: operation_type.into(),
        }
    }

    /// Filesystem-safe stem for this key's storage file.
    ///
    /// Alphanumerics plus `.`, `_`, `-` pass through; everything else maps
    /// to `_` so hostile identifiers cannot escape the data directory.
    pub fn storage_stem(&self) -> String {
        format!(
            "{}_{}",
            sanitize_component(&self.identifier),
            sanitize_component(&self.operation_type)
        )
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identifier, self.operation_type)
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One consumption event. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// When the consumption happened
    pub timestamp: DateTime<Utc>,
    /// Acting user, when distinct from the limited identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Operation class consumed against
    pub operation_type: String,
    /// Units consumed (always positive)
    pub resource_consumed: u64,
    /// Caller-supplied context (request ids, batch sizes, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl UsageRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        operation_type: impl Into<String>,
        resource_consumed: u64,
    ) -> Self {
        Self {
            timestamp,
            user_id: None,
            operation_type: operation_type.into(),
            resource_consumed,
            metadata: None,
        }
    }
}

/// Durable usage state for one [`UsageKey`].
///
/// `usage_records` is an append log in insertion order. `total_usage` always
/// equals the sum of `resource_consumed` over the retained records; pruning
/// recomputes it from the surviving records before the swap, so the equality
/// holds at every observable point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub identifier: String,
    pub operation_type: String,
    #[serde(default)]
    pub usage_records: Vec<UsageRecord>,
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_usage: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_usage: Option<DateTime<Utc>>,
    #[serde(default)]
    pub blocked_count: u64,
    #[serde(default)]
    pub override_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_expiry: Option<DateTime<Utc>>,
}

impl RateLimitEntry {
    /// Create an empty entry for a key. Entries are created lazily on first
    /// usage or first override grant.
    pub fn new(key: &UsageKey) -> Self {
        Self {
            identifier: key.identifier.clone(),
            operation_type: key.operation_type.clone(),
            usage_records: Vec::new(),
            total_usage: 0,
            first_usage: None,
            last_usage: None,
            blocked_count: 0,
            override_active: false,
            override_expiry: None,
        }
    }

    pub fn key(&self) -> UsageKey {
        UsageKey::new(self.identifier.clone(), self.operation_type.clone())
    }

    /// Append a record and maintain the aggregate counters.
    pub fn record(&mut self, record: UsageRecord) {
        self.total_usage += record.resource_consumed;
        if self.first_usage.is_none() {
            self.first_usage = Some(record.timestamp);
        }
        self.last_usage = Some(record.timestamp);
        self.usage_records.push(record);
    }

    /// Records with `start <= timestamp <= end`, in insertion order.
    pub fn records_in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<UsageRecord> {
        self.usage_records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Sum of `resource_consumed` over records inside the window.
    pub fn usage_in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
        self.usage_records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .map(|r| r.resource_consumed)
            .sum()
    }

    /// Drop records older than `cutoff` and recompute the aggregates from
    /// the survivors. Returns the number of records removed.
    ///
    /// The new record vector and total are built first and swapped in
    /// together, so a reader never observes a total that disagrees with the
    /// retained records.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let retained: Vec<UsageRecord> = self
            .usage_records
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect();
        let removed = self.usage_records.len() - retained.len();
        if removed == 0 {
            return 0;
        }
        let total: u64 = retained.iter().map(|r| r.resource_consumed).sum();
        self.first_usage = retained.first().map(|r| r.timestamp);
        self.last_usage = retained.last().map(|r| r.timestamp);
        self.total_usage = total;
        self.usage_records = retained;
        removed
    }

    /// True when an override is set and its expiry is still in the future.
    pub fn override_is_active(&self, now: DateTime<Utc>) -> bool {
        self.override_active && self.override_expiry.map(|e| e > now).unwrap_or(false)
    }

    /// True when an override is set but its expiry has passed. Such an
    /// override is cleared lazily on the next read.
    pub fn override_has_expired(&self, now: DateTime<Utc>) -> bool {
        self.override_active && self.override_expiry.map(|e| e <= now).unwrap_or(true)
    }

    /// Remove any override state.
    pub fn clear_override(&mut self) {
        self.override_active = false;
        self.override_expiry = None;
    }

    /// An entry with no records and no active override is eligible for
    /// deletion during cleanup.
    pub fn is_prunable(&self, now: DateTime<Utc>) -> bool {
        self.usage_records.is_empty() && !self.override_is_active(now)
    }
}
