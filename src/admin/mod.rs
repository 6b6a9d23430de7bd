//! Admin Override and Reset Operations
//!
//! Time-bounded, audited bypasses of admission control, plus usage resets.
//! Per key the override lifecycle is:
//!
//! ```text
//! no-override ──grant──► active ──┬──expiry passes──► expired
//!                                 └──revoke─────────► revoked
//! ```
//!
//! Expired and revoked both land back at no-override; expiry is also
//! applied lazily by the limiter on the next check of the key. Every
//! action here is appended to the audit log, which is consulted for
//! reporting but is never the enforcement state.

mod error;
mod log;

pub use error::AdminError;
pub use log::{AdminAction, AdminActionKind, AdminLog, ADMIN_LOG_CAP};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::metrics;
use crate::store::{UsageKey, UsageStore};

/// Request to grant an override for one (identifier, operation_type) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub identifier: String,
    pub operation_type: String,

    /// Why the override is needed. Required when the admin configuration
    /// says so.
    #[serde(default)]
    pub justification: String,

    /// Override duration; the configured default applies when absent.
    #[serde(default)]
    pub duration_hours: Option<u32>,

    #[serde(default = "default_requested_by")]
    pub requested_by: String,
}

fn default_requested_by() -> String {
    "admin".to_string()
}

/// One currently-active override.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOverride {
    pub identifier: String,
    pub operation_type: String,
    pub expiry: Option<DateTime<Utc>>,
}

/// Override switches and the set of active overrides.
#[derive(Debug, Clone, Serialize)]
pub struct OverrideStatus {
    pub override_enabled: bool,
    pub emergency_override_enabled: bool,
    pub total_active: usize,
    pub active: Vec<ActiveOverride>,
}

/// Usage counters captured just before a reset zeroed them.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResetSummary {
    pub previous_usage: u64,
    pub previous_blocked: u64,
}

/// Result of a fan-out action across every identifier of an operation type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FanoutOutcome {
    /// Identifiers the action targeted
    pub targets: usize,
    /// Identifiers it succeeded on
    pub applied: usize,
}

/// Admin counters for dashboards and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub override_enabled: bool,
    pub emergency_override_enabled: bool,
    pub require_justification: bool,
    pub admin_daily_limit: u64,
    pub admin_weekly_limit: u64,
    pub admin_monthly_limit: u64,
    pub active_overrides: usize,
    pub tracked_keys: usize,
    pub recent_actions: usize,
    pub actions_by_kind: HashMap<String, usize>,
}

/// Audited admin operations over a shared [`UsageStore`].
#[derive(Debug)]
pub struct AdminOverride {
    store: Arc<UsageStore>,
    config: Arc<RwLock<Config>>,
    log: AdminLog,
    clock: Arc<dyn Clock>,
}

impl AdminOverride {
    /// Create the admin surface over a store. Shares the limiter's config
    /// handle so reloads apply to both.
    pub fn new(store: Arc<UsageStore>, config: Arc<RwLock<Config>>) -> Self {
        let log = AdminLog::new(store.overrides_dir());
        let clock = store.clock();
        Self {
            store,
            config,
            log,
            clock,
        }
    }

    /// Grant a time-bounded override. Creates the usage entry when the key
    /// has never been seen. Returns the expiry instant.
    pub async fn request_override(
        &self,
        request: &OverrideRequest,
    ) -> Result<DateTime<Utc>, AdminError> {
        let (enabled, require_justification, default_hours) = {
            let config = self.config.read().await;
            (
                config.admin.override_enabled,
                config.admin.require_justification,
                config.admin.default_override_hours,
            )
        };
        if !enabled {
            return Err(AdminError::OverridesDisabled);
        }
        check_permission(&request.requested_by, "grant an override")?;
        if require_justification && request.justification.trim().is_empty() {
            return Err(AdminError::JustificationRequired);
        }

        let duration_hours = request.duration_hours.unwrap_or(default_hours);
        let expiry = self.clock.now() + ChronoDuration::hours(i64::from(duration_hours));
        let key = UsageKey::new(&request.identifier, &request.operation_type);

        let result = self
            .store
            .mutate(&key, |entry| {
                entry.override_active = true;
                entry.override_expiry = Some(expiry);
            })
            .await;

        self.log_action(
            AdminActionKind::OverrideGranted,
            &request.identifier,
            &request.operation_type,
            serde_json::json!({
                "justification": request.justification,
                "duration_hours": duration_hours,
                "expiry": expiry,
            }),
            &request.requested_by,
            result.is_ok(),
        )
        .await;

        result?;
        metrics::OVERRIDES_GRANTED_TOTAL.inc();
        info!(
            identifier = %request.identifier,
            operation_type = %request.operation_type,
            %expiry,
            requested_by = %request.requested_by,
            "override granted"
        );
        Ok(expiry)
    }

    /// Clear an override, whether active or already expired.
    pub async fn revoke_override(
        &self,
        identifier: &str,
        operation_type: &str,
        admin_user: &str,
    ) -> Result<(), AdminError> {
        check_permission(admin_user, "revoke an override")?;
        let key = UsageKey::new(identifier, operation_type);
        if self.store.get(&key).await?.is_none() {
            return Err(AdminError::UnknownKey {
                key: key.to_string(),
            });
        }

        let result = self.store.mutate(&key, |entry| entry.clear_override()).await;
        self.log_action(
            AdminActionKind::OverrideRevoked,
            identifier,
            operation_type,
            serde_json::json!({}),
            admin_user,
            result.is_ok(),
        )
        .await;

        result?;
        metrics::OVERRIDES_REVOKED_TOTAL.inc();
        info!(identifier, operation_type, admin_user, "override revoked");
        Ok(())
    }

    /// Grant an override to every identifier currently known for an
    /// operation type. Each grant is audited individually, then the whole
    /// fan-out is audited as one bulk action.
    pub async fn emergency_override(
        &self,
        operation_type: &str,
        duration_hours: Option<u32>,
        admin_user: &str,
        justification: &str,
    ) -> Result<FanoutOutcome, AdminError> {
        let enabled = self.config.read().await.admin.emergency_override_enabled;
        if !enabled {
            return Err(AdminError::EmergencyDisabled);
        }
        check_permission(admin_user, "grant an emergency override")?;

        let targets = self.keys_for_operation(operation_type).await;
        let mut applied = 0;
        for key in &targets {
            let request = OverrideRequest {
                identifier: key.identifier.clone(),
                operation_type: operation_type.to_string(),
                justification: format!("Emergency override: {justification}"),
                duration_hours,
                requested_by: admin_user.to_string(),
            };
            match self.request_override(&request).await {
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!(identifier = %key.identifier, operation_type, error = %e, "emergency override skipped identifier");
                }
            }
        }

        self.log_action(
            AdminActionKind::EmergencyOverride,
            "*",
            operation_type,
            serde_json::json!({
                "justification": justification,
                "duration_hours": duration_hours,
                "targets": targets.len(),
                "applied": applied,
            }),
            admin_user,
            applied == targets.len(),
        )
        .await;

        info!(
            operation_type,
            targets = targets.len(),
            applied,
            "emergency override applied"
        );
        Ok(FanoutOutcome {
            targets: targets.len(),
            applied,
        })
    }

    /// Clear every override whose expiry has passed, auditing each as a
    /// system action. Idempotent: a second sweep finds nothing to clear.
    pub async fn cleanup_expired_overrides(&self) -> usize {
        let mut cleared = 0;
        for key in self.store.all_keys().await {
            match self.store.clear_expired_override(&key).await {
                Ok(true) => {
                    cleared += 1;
                    metrics::OVERRIDES_EXPIRED_TOTAL.inc();
                    self.log_action(
                        AdminActionKind::OverrideExpired,
                        &key.identifier,
                        &key.operation_type,
                        serde_json::json!({}),
                        "system",
                        true,
                    )
                    .await;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "override sweep skipped key");
                }
            }
        }
        if cleared > 0 {
            info!(cleared, "expired overrides cleared");
        }
        cleared
    }

    /// Zero a key's usage records and blocked count. Returns the counters
    /// as they stood before the reset.
    pub async fn reset_usage(
        &self,
        identifier: &str,
        operation_type: &str,
        admin_user: &str,
    ) -> Result<ResetSummary, AdminError> {
        check_permission(admin_user, "reset usage")?;
        let key = UsageKey::new(identifier, operation_type);
        if self.store.get(&key).await?.is_none() {
            return Err(AdminError::UnknownKey {
                key: key.to_string(),
            });
        }

        let result = self
            .store
            .mutate(&key, |entry| {
                let summary = ResetSummary {
                    previous_usage: entry.total_usage,
                    previous_blocked: entry.blocked_count,
                };
                entry.usage_records.clear();
                entry.total_usage = 0;
                entry.blocked_count = 0;
                entry.first_usage = None;
                entry.last_usage = None;
                summary
            })
            .await;

        let details = match &result {
            Ok(summary) => serde_json::json!({
                "previous_usage": summary.previous_usage,
                "previous_blocked": summary.previous_blocked,
                "usage": 0,
                "blocked": 0,
            }),
            Err(_) => serde_json::json!({}),
        };
        self.log_action(
            AdminActionKind::UsageReset,
            identifier,
            operation_type,
            details,
            admin_user,
            result.is_ok(),
        )
        .await;

        let summary = result?;
        info!(
            identifier,
            operation_type,
            previous_usage = summary.previous_usage,
            previous_blocked = summary.previous_blocked,
            "usage reset"
        );
        Ok(summary)
    }

    /// Reset usage for every identifier of an operation type.
    pub async fn bulk_reset_usage(
        &self,
        operation_type: &str,
        admin_user: &str,
    ) -> Result<FanoutOutcome, AdminError> {
        check_permission(admin_user, "reset usage")?;

        let targets = self.keys_for_operation(operation_type).await;
        let mut applied = 0;
        for key in &targets {
            match self
                .reset_usage(&key.identifier, operation_type, admin_user)
                .await
            {
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!(identifier = %key.identifier, operation_type, error = %e, "bulk reset skipped identifier");
                }
            }
        }

        self.log_action(
            AdminActionKind::BulkUsageReset,
            "*",
            operation_type,
            serde_json::json!({
                "targets": targets.len(),
                "applied": applied,
            }),
            admin_user,
            applied == targets.len(),
        )
        .await;

        info!(operation_type, targets = targets.len(), applied, "bulk usage reset");
        Ok(FanoutOutcome {
            targets: targets.len(),
            applied,
        })
    }

    /// Active overrides, optionally narrowed to one identifier and/or one
    /// operation type. Keys that fail to load are skipped.
    pub async fn override_status(
        &self,
        identifier: Option<&str>,
        operation_type: Option<&str>,
    ) -> Result<OverrideStatus, AdminError> {
        let (override_enabled, emergency_override_enabled) = {
            let config = self.config.read().await;
            (
                config.admin.override_enabled,
                config.admin.emergency_override_enabled,
            )
        };
        let now = self.clock.now();
        let mut active = Vec::new();

        for key in self.store.all_keys().await {
            if identifier.is_some_and(|id| id != key.identifier) {
                continue;
            }
            if operation_type.is_some_and(|op| op != key.operation_type) {
                continue;
            }
            match self.store.get(&key).await {
                Ok(Some(entry)) if entry.override_is_active(now) => {
                    active.push(ActiveOverride {
                        identifier: key.identifier,
                        operation_type: key.operation_type,
                        expiry: entry.override_expiry,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "override status skipped key"),
            }
        }

        active.sort_by(|a, b| {
            (&a.identifier, &a.operation_type).cmp(&(&b.identifier, &b.operation_type))
        });
        Ok(OverrideStatus {
            override_enabled,
            emergency_override_enabled,
            total_active: active.len(),
            active,
        })
    }

    /// The most recent audit entries, newest first, optionally filtered by
    /// action kind and/or target identifier.
    pub async fn admin_log(
        &self,
        limit: usize,
        kind: Option<AdminActionKind>,
        identifier: Option<&str>,
    ) -> Result<Vec<AdminAction>, AdminError> {
        Ok(self.log.recent(limit, kind, identifier).await?)
    }

    /// Aggregate admin counters for dashboards.
    pub async fn admin_stats(&self) -> Result<AdminStats, AdminError> {
        let admin = self.config.read().await.admin.clone();
        let status = self.override_status(None, None).await?;
        let tracked_keys = self.store.all_keys().await.len();
        let recent = self.log.recent(100, None, None).await?;
        let actions_by_kind = self.log.counts_by_kind(100).await?;

        Ok(AdminStats {
            override_enabled: admin.override_enabled,
            emergency_override_enabled: admin.emergency_override_enabled,
            require_justification: admin.require_justification,
            admin_daily_limit: admin.admin_daily_limit,
            admin_weekly_limit: admin.admin_weekly_limit,
            admin_monthly_limit: admin.admin_monthly_limit,
            active_overrides: status.total_active,
            tracked_keys,
            recent_actions: recent.len(),
            actions_by_kind,
        })
    }

    async fn keys_for_operation(&self, operation_type: &str) -> Vec<UsageKey> {
        self.store
            .all_keys()
            .await
            .into_iter()
            .filter(|k| k.operation_type == operation_type)
            .collect()
    }

    async fn log_action(
        &self,
        kind: AdminActionKind,
        identifier: &str,
        operation_type: &str,
        details: serde_json::Value,
        performed_by: &str,
        success: bool,
    ) {
        let action = AdminAction {
            kind,
            identifier: identifier.to_string(),
            operation_type: operation_type.to_string(),
            details,
            performed_by: performed_by.to_string(),
            performed_at: self.clock.now(),
            success,
            seq: 0,
        };
        // The action already took effect; a log write failure must not
        // unwind it, but it is never silent.
        if let Err(e) = self.log.append(action).await {
            warn!(kind = %kind, error = %e, "failed to append admin audit log");
        }
    }
}

fn check_permission(user: &str, action: &str) -> Result<(), AdminError> {
    if user.trim().is_empty() || user == "anonymous" {
        return Err(AdminError::PermissionDenied {
            user: user.to_string(),
            action: action.to_string(),
        });
    }
    Ok(())
}
