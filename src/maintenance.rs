//! Background Maintenance
//!
//! Periodic housekeeping over the shared store: retention cleanup, backup
//! snapshots, expired-override sweeps, and analytics log pruning. Each
//! concern runs on its own interval so a slow backup cannot delay an
//! override sweep.
//!
//! Every pass is recorded in the maintenance metrics; failures are logged
//! and the loop keeps going.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::admin::AdminOverride;
use crate::analytics::UsageAnalytics;
use crate::config::Config;
use crate::metrics;
use crate::store::UsageStore;

/// How often expired overrides are swept up.
const OVERRIDE_SWEEP_MINUTES: u64 = 15;

/// Startup jitter ceiling, so replicas sharing a data directory do not all
/// fire maintenance at the same instant.
const STARTUP_JITTER_SECS: u64 = 60;

/// Periodic maintenance over the store, admin, and analytics surfaces.
pub struct Maintenance {
    store: Arc<UsageStore>,
    config: Arc<RwLock<Config>>,
    admin: Arc<AdminOverride>,
    analytics: Arc<UsageAnalytics>,
}

impl Maintenance {
    pub fn new(
        store: Arc<UsageStore>,
        config: Arc<RwLock<Config>>,
        admin: Arc<AdminOverride>,
        analytics: Arc<UsageAnalytics>,
    ) -> Self {
        Self {
            store,
            config,
            admin,
            analytics,
        }
    }

    /// Start the maintenance loops. Intervals are read once at spawn;
    /// `backup_enabled` is re-checked on every tick so a config reload can
    /// stop backups without a restart.
    pub async fn spawn_all(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let (cleanup_hours, backup_hours) = {
            let config = self.config.read().await;
            (
                config.storage.cleanup_interval_hours,
                config.storage.backup_interval_hours,
            )
        };
        let mut handles = Vec::new();

        let task = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(startup_jitter()).await;
            let mut interval =
                tokio::time::interval(Duration::from_secs(u64::from(cleanup_hours) * 3600));
            loop {
                interval.tick().await;
                task.run_retention_cleanup().await;
                task.run_analytics_cleanup().await;
            }
        }));

        let task = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(startup_jitter()).await;
            let mut interval =
                tokio::time::interval(Duration::from_secs(u64::from(backup_hours) * 3600));
            loop {
                interval.tick().await;
                if task.config.read().await.storage.backup_enabled {
                    task.run_backup().await;
                }
            }
        }));

        let task = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(startup_jitter()).await;
            let mut interval =
                tokio::time::interval(Duration::from_secs(OVERRIDE_SWEEP_MINUTES * 60));
            loop {
                interval.tick().await;
                task.run_override_sweep().await;
            }
        }));

        info!(
            cleanup_hours,
            backup_hours,
            sweep_minutes = OVERRIDE_SWEEP_MINUTES,
            "maintenance tasks started"
        );
        handles
    }

    /// Prune usage records past the retention horizon and refresh the
    /// tracked-keys gauge.
    pub async fn run_retention_cleanup(&self) {
        let retention_days = self.config.read().await.storage.retention_days;
        let outcome = self.store.cleanup(retention_days).await;

        metrics::RECORDS_PRUNED_TOTAL.inc_by(outcome.records_removed as u64);
        metrics::TRACKED_KEYS.set(self.store.all_keys().await.len() as i64);

        let status = if outcome.failures.is_empty() {
            "ok"
        } else {
            for (key, e) in &outcome.failures {
                error!(key = %key, error = %e, "retention cleanup failed for key");
            }
            "error"
        };
        metrics::MAINTENANCE_RUNS_TOTAL
            .with_label_values(&["cleanup", status])
            .inc();
        info!(
            records_removed = outcome.records_removed,
            entries_removed = outcome.entries_removed,
            failures = outcome.failures.len(),
            "retention cleanup finished"
        );
    }

    /// Prune alert and report logs past the analytics retention horizon.
    pub async fn run_analytics_cleanup(&self) {
        let retention_days = self.config.read().await.analytics.retention_days;
        match self.analytics.cleanup_old_analytics(retention_days).await {
            Ok(removed) => {
                metrics::MAINTENANCE_RUNS_TOTAL
                    .with_label_values(&["analytics", "ok"])
                    .inc();
                if removed > 0 {
                    info!(removed, "analytics cleanup finished");
                }
            }
            Err(e) => {
                metrics::MAINTENANCE_RUNS_TOTAL
                    .with_label_values(&["analytics", "error"])
                    .inc();
                error!(error = %e, "analytics cleanup failed");
            }
        }
    }

    /// Write a backup snapshot of the usage files and index.
    pub async fn run_backup(&self) {
        match self.store.backup().await {
            Ok(path) => {
                metrics::MAINTENANCE_RUNS_TOTAL
                    .with_label_values(&["backup", "ok"])
                    .inc();
                info!(path = %path.display(), "backup snapshot written");
            }
            Err(e) => {
                metrics::MAINTENANCE_RUNS_TOTAL
                    .with_label_values(&["backup", "error"])
                    .inc();
                error!(error = %e, "backup failed");
            }
        }
    }

    /// Clear overrides whose expiry has passed and refresh the
    /// active-overrides gauge.
    pub async fn run_override_sweep(&self) {
        let expired = self.admin.cleanup_expired_overrides().await;
        match self.admin.override_status(None, None).await {
            Ok(status) => {
                metrics::OVERRIDES_ACTIVE.set(status.total_active as i64);
                metrics::MAINTENANCE_RUNS_TOTAL
                    .with_label_values(&["override_sweep", "ok"])
                    .inc();
            }
            Err(e) => {
                metrics::MAINTENANCE_RUNS_TOTAL
                    .with_label_values(&["override_sweep", "error"])
                    .inc();
                error!(error = %e, "override status refresh failed");
            }
        }
        if expired > 0 {
            info!(expired, "expired overrides swept");
        }
    }
}

fn startup_jitter() -> Duration {
    Duration::from_secs(rand::rng().random_range(0..=STARTUP_JITTER_SECS))
}
