//! Admission Control
//!
//! This module decides whether an identifier may perform an amount of work
//! of a given operation type right now, against four overlapping windows.
//!
//! # Features
//!
//! - Sliding burst window plus calendar-anchored daily/weekly/monthly limits
//! - Typed [`Decision`] outcomes instead of exceptions on the hot path
//! - Admin override bypass with lazy expiry
//! - Per-operation graceful degradation for blocked consumes
//! - Explicit fail-open / fail-closed policy on storage trouble
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       RateLimiter                        │
//! │                                                          │
//! │  check ──► enabled? ─► override? ─► batch? ─► windows    │
//! │                                      burst → daily →     │
//! │                                      weekly → monthly    │
//! ├──────────────────────────────────────────────────────────┤
//! │                 UsageStore (per-key, durable)            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Checks evaluate in a fixed order and short-circuit on the first
//! violation, so the reported reason is deterministic when several windows
//! are exhausted at once.

mod error;
pub mod windows;

pub use error::RateLimitError;
pub use windows::{LimitKind, WindowBounds};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{Config, OnStorageError, OperationLimits};
use crate::metrics;
use crate::store::{RateLimitEntry, StorageError, UsageKey, UsageRecord, UsageStore};

/// Why a request was blocked.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockReason {
    /// A window is out of headroom for the requested amount
    Limit {
        kind: LimitKind,
        current: u64,
        limit: u64,
        reset_time: DateTime<Utc>,
    },
    /// The amount alone is over the per-request ceiling
    BatchTooLarge { amount: u64, max_batch_size: u64 },
    /// Storage failed and the policy is fail-closed
    StorageUnavailable,
}

impl BlockReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Limit { kind, .. } => kind.as_str(),
            Self::BatchTooLarge { .. } => "batch_too_large",
            Self::StorageUnavailable => "storage_unavailable",
        }
    }
}

/// Outcome of an admission check. Nothing is consumed by a check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Every window has headroom for the requested amount
    Allowed,
    /// A limit was hit; the request must not proceed
    Blocked(BlockReason),
    /// An active admin override bypasses all window checks
    OverrideActive,
    /// Limiting is disabled for this operation type
    Disabled,
}

impl Decision {
    /// Whether the caller may proceed with the work.
    pub fn admits(&self) -> bool {
        !matches!(self, Self::Blocked(_))
    }

    /// Stable label for metrics and logs.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Blocked(_) => "blocked",
            Self::OverrideActive => "override_active",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed => write!(f, "allowed"),
            Self::Blocked(BlockReason::Limit {
                kind,
                current,
                limit,
                reset_time,
            }) => write!(
                f,
                "blocked: {kind} limit {current}/{limit}, resets at {reset_time}"
            ),
            Self::Blocked(BlockReason::BatchTooLarge {
                amount,
                max_batch_size,
            }) => write!(f, "blocked: batch of {amount} exceeds max {max_batch_size}"),
            Self::Blocked(BlockReason::StorageUnavailable) => {
                write!(f, "blocked: storage unavailable")
            }
            Self::OverrideActive => write!(f, "allowed (override active)"),
            Self::Disabled => write!(f, "allowed (limiting disabled)"),
        }
    }
}

/// Usage against one window's limit.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStatus {
    pub window: LimitKind,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}

/// Per-window usage snapshot for one (identifier, operation_type) pair.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStatus {
    pub identifier: String,
    pub operation_type: String,
    pub enabled: bool,
    pub windows: Vec<WindowStatus>,
    pub blocked_count: u64,
    pub override_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_expiry: Option<DateTime<Utc>>,
}

/// Multi-window admission controller over a shared [`UsageStore`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Durable usage state, shared with analytics and admin
    store: Arc<UsageStore>,

    /// Configuration, hot-reloadable via [`RateLimiter::reload_config`]
    config: Arc<RwLock<Config>>,

    /// Time source shared with the store
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter over a store. The store's clock is reused so the
    /// limiter and the records it writes agree on time.
    pub fn new(store: Arc<UsageStore>, config: Config) -> Self {
        let clock = store.clock();
        Self {
            store,
            config: Arc::new(RwLock::new(config)),
            clock,
        }
    }

    /// Shared configuration handle for components that must see reloads.
    pub fn config_handle(&self) -> Arc<RwLock<Config>> {
        Arc::clone(&self.config)
    }

    /// The store this limiter writes through to.
    pub fn store(&self) -> Arc<UsageStore> {
        Arc::clone(&self.store)
    }

    /// Replace the configuration without restarting.
    pub async fn reload_config(&self, config: Config) {
        *self.config.write().await = config;
        tracing::info!("rate limit configuration reloaded");
    }

    /// Current configuration snapshot.
    pub async fn current_config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// May `identifier` perform `amount` units of `operation_type` now?
    ///
    /// Pure question: nothing is recorded. Storage trouble is folded into
    /// the decision per the configured fail-open/fail-closed policy.
    pub async fn check(&self, identifier: &str, operation_type: &str, amount: u64) -> Decision {
        let (limits, policy) = self.limits_and_policy(operation_type).await;
        let decision = match self.decide(identifier, operation_type, amount, &limits).await {
            Ok(decision) => decision,
            Err(e) => self.storage_fallback(operation_type, policy, e),
        };
        metrics::ADMISSION_CHECKS_TOTAL
            .with_label_values(&[operation_type, decision.outcome_label()])
            .inc();
        if let Decision::Blocked(reason) = &decision {
            metrics::ADMISSION_BLOCKED_TOTAL
                .with_label_values(&[operation_type, reason.label()])
                .inc();
        }
        decision
    }

    /// Check, then on admission record the consumption atomically for the
    /// key. On a block, the key's `blocked_count` is incremented and the
    /// outcome depends on the operation's degradation policy: degradable
    /// operations get `Ok(false)`, everything else a typed error.
    pub async fn consume(
        &self,
        identifier: &str,
        operation_type: &str,
        amount: u64,
        user_id: Option<String>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<bool, RateLimitError> {
        let timer = metrics::CONSUME_DURATION_SECONDS
            .with_label_values(&[operation_type])
            .start_timer();
        let result = self
            .consume_inner(identifier, operation_type, amount, user_id, metadata)
            .await;
        timer.observe_duration();
        result
    }

    async fn consume_inner(
        &self,
        identifier: &str,
        operation_type: &str,
        amount: u64,
        user_id: Option<String>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<bool, RateLimitError> {
        let (limits, policy) = self.limits_and_policy(operation_type).await;
        let key = UsageKey::new(identifier, operation_type);

        let decision = match self
            .decide_and_apply(&key, amount, &limits, user_id, metadata)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                record_storage_error(&e);
                return match policy {
                    OnStorageError::FailOpen => {
                        warn!(
                            identifier,
                            operation_type,
                            error = %e,
                            "storage failed during admission, failing open"
                        );
                        Ok(true)
                    }
                    OnStorageError::FailClosed => Err(RateLimitError::Storage(e)),
                };
            }
        };

        metrics::ADMISSION_CHECKS_TOTAL
            .with_label_values(&[operation_type, decision.outcome_label()])
            .inc();

        match decision {
            Decision::Allowed | Decision::OverrideActive | Decision::Disabled => {
                metrics::RESOURCE_CONSUMED_TOTAL
                    .with_label_values(&[operation_type])
                    .inc_by(amount as f64);
                Ok(true)
            }
            Decision::Blocked(reason) => {
                metrics::ADMISSION_BLOCKED_TOTAL
                    .with_label_values(&[operation_type, reason.label()])
                    .inc();
                debug!(
                    identifier,
                    operation_type,
                    amount,
                    reason = reason.label(),
                    "admission blocked"
                );
                self.map_block(operation_type, amount, &limits, reason).await
            }
        }
    }

    /// Decide and apply in one step under the key's lock: an admitted
    /// amount is recorded and a block is counted atomically, so concurrent
    /// consumers cannot slip past a window's last headroom together.
    async fn decide_and_apply(
        &self,
        key: &UsageKey,
        amount: u64,
        limits: &OperationLimits,
        user_id: Option<String>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Decision, StorageError> {
        if !limits.enabled {
            // Disabled operations still record usage for visibility.
            self.store
                .record_usage(key, amount, user_id, metadata)
                .await?;
            return Ok(Decision::Disabled);
        }

        let now = self.clock.now();
        let limits = limits.clone();
        let operation_type = key.operation_type.clone();
        self.store
            .mutate(key, move |entry| {
                if entry.override_has_expired(now) {
                    entry.clear_override();
                }
                let decision = evaluate(entry, now, amount, &limits);
                if let Decision::Blocked(_) = decision {
                    entry.blocked_count += 1;
                } else {
                    let mut record = UsageRecord::new(now, operation_type, amount);
                    record.user_id = user_id;
                    record.metadata = metadata;
                    entry.record(record);
                }
                decision
            })
            .await
    }

    /// Raw decision with no storage-failure policy applied. Consumes
    /// nothing; an expired override is still cleared so state converges.
    async fn decide(
        &self,
        identifier: &str,
        operation_type: &str,
        amount: u64,
        limits: &OperationLimits,
    ) -> Result<Decision, StorageError> {
        if !limits.enabled {
            return Ok(Decision::Disabled);
        }

        let key = UsageKey::new(identifier, operation_type);
        let now = self.clock.now();
        let entry = self.store.get(&key).await?;

        if let Some(entry) = &entry {
            if entry.override_has_expired(now) {
                self.store.clear_expired_override(&key).await?;
                debug!(identifier, operation_type, "expired override cleared");
            }
        }

        Ok(match &entry {
            Some(entry) => evaluate(entry, now, amount, limits),
            None => evaluate(&RateLimitEntry::new(&key), now, amount, limits),
        })
    }

    async fn map_block(
        &self,
        operation_type: &str,
        amount: u64,
        limits: &OperationLimits,
        reason: BlockReason,
    ) -> Result<bool, RateLimitError> {
        match reason {
            // Oversized batches are a caller bug, never degraded away.
            BlockReason::BatchTooLarge {
                amount,
                max_batch_size,
            } => Err(RateLimitError::BatchTooLarge {
                operation_type: operation_type.to_string(),
                amount,
                max_batch_size,
            }),
            BlockReason::Limit {
                kind,
                current,
                limit,
                reset_time,
            } => {
                let degradable = self.config.read().await.degradation_applies(limits);
                if degradable {
                    debug!(operation_type, amount, "degrading blocked consume to false");
                    Ok(false)
                } else {
                    Err(RateLimitError::Exceeded {
                        operation_type: operation_type.to_string(),
                        kind,
                        current,
                        limit,
                        reset_time,
                    })
                }
            }
            // decide() surfaces storage trouble as Err, so this only
            // arrives via decisions built elsewhere.
            BlockReason::StorageUnavailable => Err(RateLimitError::StorageUnavailable {
                operation_type: operation_type.to_string(),
            }),
        }
    }

    fn storage_fallback(
        &self,
        operation_type: &str,
        policy: OnStorageError,
        error: StorageError,
    ) -> Decision {
        record_storage_error(&error);
        match policy {
            OnStorageError::FailOpen => {
                warn!(operation_type, error = %error, "storage failed during check, failing open");
                Decision::Allowed
            }
            OnStorageError::FailClosed => {
                warn!(operation_type, error = %error, "storage failed during check, failing closed");
                Decision::Blocked(BlockReason::StorageUnavailable)
            }
        }
    }

    /// Per-window usage, limits, and reset times for one key.
    pub async fn status(
        &self,
        identifier: &str,
        operation_type: &str,
    ) -> Result<UsageStatus, StorageError> {
        let limits = {
            let config = self.config.read().await;
            config.effective_limits(operation_type)
        };
        let key = UsageKey::new(identifier, operation_type);
        let now = self.clock.now();
        let entry = self.store.get(&key).await?;
        Ok(build_status(
            identifier,
            operation_type,
            &limits,
            entry.as_ref(),
            now,
        ))
    }

    /// Statuses for one identifier across every configured operation type.
    pub async fn all_statuses(&self, identifier: &str) -> Result<Vec<UsageStatus>, StorageError> {
        let operations: Vec<String> = {
            let config = self.config.read().await;
            let mut ops: Vec<String> = config.rate_limits.keys().cloned().collect();
            ops.sort();
            ops
        };
        let mut out = Vec::with_capacity(operations.len());
        for op in operations {
            out.push(self.status(identifier, &op).await?);
        }
        Ok(out)
    }

    async fn limits_and_policy(&self, operation_type: &str) -> (OperationLimits, OnStorageError) {
        let config = self.config.read().await;
        (
            config.effective_limits(operation_type),
            config.storage.on_storage_error,
        )
    }
}

/// Evaluate one request against an entry's current state. The check order
/// is fixed: override, batch cap, then burst, daily, weekly, monthly.
fn evaluate(
    entry: &RateLimitEntry,
    now: DateTime<Utc>,
    amount: u64,
    limits: &OperationLimits,
) -> Decision {
    if entry.override_is_active(now) {
        return Decision::OverrideActive;
    }

    if let Some(max_batch_size) = limits.max_batch_size {
        if amount > max_batch_size {
            return Decision::Blocked(BlockReason::BatchTooLarge {
                amount,
                max_batch_size,
            });
        }
    }

    for kind in LimitKind::ALL {
        let bounds = windows::bounds_for(kind, now, limits.burst_window_minutes);
        let limit = limits.limit_for(kind);
        let current = entry.usage_in_window(bounds.start, now);
        if current + amount > limit {
            return Decision::Blocked(BlockReason::Limit {
                kind,
                current,
                limit,
                reset_time: bounds.reset,
            });
        }
    }

    Decision::Allowed
}

fn build_status(
    identifier: &str,
    operation_type: &str,
    limits: &OperationLimits,
    entry: Option<&RateLimitEntry>,
    now: DateTime<Utc>,
) -> UsageStatus {
    let windows = LimitKind::ALL
        .iter()
        .map(|&kind| {
            let bounds = windows::bounds_for(kind, now, limits.burst_window_minutes);
            let limit = limits.limit_for(kind);
            let used = entry
                .map(|e| e.usage_in_window(bounds.start, now))
                .unwrap_or(0);
            WindowStatus {
                window: kind,
                used,
                limit,
                remaining: limit.saturating_sub(used),
                reset_time: bounds.reset,
            }
        })
        .collect();

    UsageStatus {
        identifier: identifier.to_string(),
        operation_type: operation_type.to_string(),
        enabled: limits.enabled,
        windows,
        blocked_count: entry.map(|e| e.blocked_count).unwrap_or(0),
        override_active: entry.map(|e| e.override_is_active(now)).unwrap_or(false),
        override_expiry: entry.and_then(|e| {
            if e.override_is_active(now) {
                e.override_expiry
            } else {
                None
            }
        }),
    }
}

fn record_storage_error(error: &StorageError) {
    let kind = match error {
        StorageError::Io { .. } => "io",
        StorageError::CorruptEntry { .. } => "corrupt",
        StorageError::Serialize { .. } => "serialize",
        StorageError::Timeout { .. } => "timeout",
    };
    metrics::STORAGE_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}
