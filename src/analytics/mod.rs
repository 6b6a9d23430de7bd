//! Usage Analytics and Reporting
//!
//! Read-only analysis over the usage store: pattern analysis, threshold
//! alerts, and periodic reports with heuristic insights.
//!
//! # Features
//!
//! - Hourly histograms, peak-hour detection, and distribution statistics
//! - Z-score outlier detection and quartile-based trend classification
//! - Window threshold alerts with a persisted, capped alert log
//! - Daily/weekly/monthly reports with insights and recommendations
//!
//! Nothing here feeds back into admission decisions. Alert percentages are
//! computed against the same window bounds the limiter enforces, so an 80%
//! daily alert means 80% of the calendar day's quota is gone.

mod stats;

pub use stats::Distribution;

use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::limiter::{windows, LimitKind};
use crate::metrics;
use crate::store::{write_atomic, StorageError, UsageKey, UsageRecord, UsageStore};

/// Most recent alerts kept in the alert log.
pub const ALERT_LOG_CAP: usize = 1000;

/// Most recent reports kept in the report log.
pub const REPORT_LOG_CAP: usize = 100;

const ALERTS_FILE: &str = "alerts.json";
const REPORTS_FILE: &str = "reports.json";

/// Alerts fire above this share of a window's limit when the configured
/// threshold is lower; at or above it they escalate to high severity.
const HIGH_SEVERITY_PERCENT: f64 = 95.0;

const OUTLIER_Z_SCORE: f64 = 2.5;
const MIN_OUTLIER_SAMPLES: usize = 10;
const TOP_USERS: usize = 10;

/// How urgent an alert is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generated alert, persisted to the alert log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAlert {
    pub id: Uuid,
    pub alert_type: String,
    pub identifier: String,
    pub operation_type: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub threshold_value: f64,
    pub current_value: f64,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Horizon a report covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Daily,
    Weekly,
    Monthly,
}

impl ReportType {
    pub fn hours_back(&self) -> u32 {
        match self {
            Self::Daily => 24,
            Self::Weekly => 7 * 24,
            Self::Monthly => 30 * 24,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!(
                "unknown report type '{other}', expected daily, weekly, or monthly"
            )),
        }
    }
}

/// Direction usage is moving over the analysis window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    /// Too few samples for a meaningful comparison
    InsufficientData,
}

/// Earliest-quartile vs latest-quartile trend comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
    pub direction: TrendDirection,
    /// Relative change between the quartile averages, capped at 1.0
    pub strength: f64,
    pub early_average: f64,
    pub late_average: f64,
    /// Proportional to sample count, 1.0 at 100 samples
    pub confidence: f64,
}

impl Trend {
    fn insufficient() -> Self {
        Self {
            direction: TrendDirection::InsufficientData,
            strength: 0.0,
            early_average: 0.0,
            late_average: 0.0,
            confidence: 0.0,
        }
    }
}

/// A record whose consumption is far outside the window's distribution.
#[derive(Debug, Clone, Serialize)]
pub struct Outlier {
    pub timestamp: DateTime<Utc>,
    pub usage: u64,
    pub z_score: f64,
}

/// Full pattern analysis for one (identifier, operation_type) pair.
#[derive(Debug, Clone, Serialize)]
pub struct PatternReport {
    pub identifier: String,
    pub operation_type: String,
    pub analysis_period_hours: u32,
    pub total_usage: u64,
    pub usage_rate_per_hour: f64,
    /// Local hour of day (0-23) to consumption in that hour
    pub hourly_usage: BTreeMap<u32, u64>,
    /// Hours whose usage exceeds 1.5x the hourly mean
    pub peak_hours: Vec<u32>,
    pub distribution: Option<Distribution>,
    pub outliers: Vec<Outlier>,
    pub trend: Trend,
}

/// Aggregate request statistics over a horizon, across all keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageStatistics {
    pub period_hours: u32,
    pub operation_type_filter: Option<String>,
    pub total_requests: u64,
    /// Cumulative blocks for the matching keys. Blocks are counters, not
    /// timestamped records, so they cannot be narrowed to the horizon.
    pub total_blocked: u64,
    pub success_rate_percent: f64,
    pub block_rate_percent: f64,
    pub request_rate_per_hour: f64,
    pub unique_identifiers: usize,
    pub operation_types: BTreeMap<String, u64>,
    /// Identifiers with the most requests in the horizon, descending
    pub top_users: Vec<(String, u64)>,
    /// "YYYY-MM-DD HH:00" (local) to request count
    pub hourly_distribution: BTreeMap<String, u64>,
    /// "YYYY-MM-DD" (local) to request count
    pub daily_distribution: BTreeMap<String, u64>,
}

/// A generated report, persisted to the report log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub id: Uuid,
    pub report_type: ReportType,
    pub generated_at: DateTime<Utc>,
    pub operation_type_filter: Option<String>,
    pub statistics: UsageStatistics,
    pub alerts_total: usize,
    pub alerts_by_severity: BTreeMap<String, usize>,
    /// The ten most recent alerts in the horizon
    pub recent_alerts: Vec<UsageAlert>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnalyticsLog<T> {
    created: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    data: Vec<T>,
}

impl<T> AnalyticsLog<T> {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created: now,
            last_updated: now,
            data: Vec::new(),
        }
    }
}

/// Read-only analytics over a shared [`UsageStore`].
#[derive(Debug)]
pub struct UsageAnalytics {
    store: Arc<UsageStore>,
    config: Arc<RwLock<Config>>,
    clock: Arc<dyn Clock>,
    alerts_path: PathBuf,
    reports_path: PathBuf,
    // Serializes alert/report log rewrites.
    file_lock: Mutex<()>,
}

impl UsageAnalytics {
    /// Create the analytics surface over a store, sharing the limiter's
    /// config handle.
    pub fn new(store: Arc<UsageStore>, config: Arc<RwLock<Config>>) -> Self {
        let alerts_path = store.analytics_dir().join(ALERTS_FILE);
        let reports_path = store.analytics_dir().join(REPORTS_FILE);
        let clock = store.clock();
        Self {
            store,
            config,
            clock,
            alerts_path,
            reports_path,
            file_lock: Mutex::new(()),
        }
    }

    /// Analyze one key's consumption over the last `hours_back` hours:
    /// totals, hourly histogram, peaks, distribution, outliers, and trend.
    pub async fn analyze_usage_patterns(
        &self,
        identifier: &str,
        operation_type: &str,
        hours_back: u32,
    ) -> Result<PatternReport, StorageError> {
        let now = self.clock.now();
        let start = now - ChronoDuration::hours(i64::from(hours_back));
        let key = UsageKey::new(identifier, operation_type);
        let mut records = self.store.usage_in_window(&key, start, now).await?;
        records.sort_by_key(|r| r.timestamp);

        let total_usage: u64 = records.iter().map(|r| r.resource_consumed).sum();
        let usage_rate_per_hour = if hours_back > 0 {
            total_usage as f64 / f64::from(hours_back)
        } else {
            0.0
        };

        let mut hourly_usage: BTreeMap<u32, u64> = BTreeMap::new();
        for record in &records {
            let hour = record.timestamp.with_timezone(&Local).hour();
            *hourly_usage.entry(hour).or_insert(0) += record.resource_consumed;
        }
        let peak_hours = peak_hours(&hourly_usage);

        let values: Vec<u64> = records.iter().map(|r| r.resource_consumed).collect();

        Ok(PatternReport {
            identifier: identifier.to_string(),
            operation_type: operation_type.to_string(),
            analysis_period_hours: hours_back,
            total_usage,
            usage_rate_per_hour,
            hourly_usage,
            peak_hours,
            distribution: Distribution::from_values(&values),
            outliers: detect_outliers(&records),
            trend: analyze_trend(&records),
        })
    }

    /// Compare each window's usage against its limit and emit threshold,
    /// burst, and consecutive-block alerts. Generated alerts are appended
    /// to the capped alert log.
    pub async fn generate_usage_alerts(
        &self,
        identifier: &str,
        operation_type: &str,
    ) -> Result<Vec<UsageAlert>, StorageError> {
        let (enabled, limits, thresholds) = {
            let config = self.config.read().await;
            (
                config.analytics.enabled,
                config.effective_limits(operation_type),
                config.analytics.clone(),
            )
        };
        if !enabled {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let key = UsageKey::new(identifier, operation_type);
        let entry = self.store.get(&key).await?;
        let mut alerts = Vec::new();

        for kind in LimitKind::ALL {
            let bounds = windows::bounds_for(kind, now, limits.burst_window_minutes);
            let limit = limits.limit_for(kind);
            let current = entry
                .as_ref()
                .map(|e| e.usage_in_window(bounds.start, now))
                .unwrap_or(0);
            let percent = if limit > 0 {
                current as f64 / limit as f64 * 100.0
            } else {
                0.0
            };

            if percent >= thresholds.usage_threshold_percent {
                let severity = if percent >= HIGH_SEVERITY_PERCENT {
                    AlertSeverity::High
                } else {
                    AlertSeverity::Medium
                };
                alerts.push(UsageAlert {
                    id: Uuid::new_v4(),
                    alert_type: format!("{kind}_usage_threshold"),
                    identifier: identifier.to_string(),
                    operation_type: operation_type.to_string(),
                    message: format!("{} usage at {percent:.1}% of limit", title(kind)),
                    severity,
                    threshold_value: thresholds.usage_threshold_percent,
                    current_value: percent,
                    timestamp: now,
                    details: serde_json::json!({
                        "window": kind.as_str(),
                        "current_usage": current,
                        "limit": limit,
                        "remaining": limit.saturating_sub(current),
                    }),
                });
            }

            if kind == LimitKind::Burst && percent >= thresholds.burst_threshold_percent {
                alerts.push(UsageAlert {
                    id: Uuid::new_v4(),
                    alert_type: "burst_threshold".to_string(),
                    identifier: identifier.to_string(),
                    operation_type: operation_type.to_string(),
                    message: format!("Burst usage at {percent:.1}% of limit"),
                    severity: AlertSeverity::Critical,
                    threshold_value: thresholds.burst_threshold_percent,
                    current_value: percent,
                    timestamp: now,
                    details: serde_json::json!({
                        "window": kind.as_str(),
                        "current_usage": current,
                        "limit": limit,
                        "window_minutes": limits.burst_window_minutes,
                    }),
                });
            }
        }

        let blocked = entry.as_ref().map(|e| e.blocked_count).unwrap_or(0);
        if blocked >= thresholds.consecutive_block_threshold {
            alerts.push(UsageAlert {
                id: Uuid::new_v4(),
                alert_type: "consecutive_blocks".to_string(),
                identifier: identifier.to_string(),
                operation_type: operation_type.to_string(),
                message: format!("Consecutive blocks: {blocked}"),
                severity: AlertSeverity::High,
                threshold_value: thresholds.consecutive_block_threshold as f64,
                current_value: blocked as f64,
                timestamp: now,
                details: serde_json::json!({
                    "blocked_count": blocked,
                    "threshold": thresholds.consecutive_block_threshold,
                }),
            });
        }

        for alert in &alerts {
            metrics::ALERTS_GENERATED_TOTAL
                .with_label_values(&[alert.severity.as_str()])
                .inc();
        }
        if !alerts.is_empty() {
            self.append_alerts(&alerts, now).await?;
            debug!(
                identifier,
                operation_type,
                count = alerts.len(),
                "usage alerts generated"
            );
        }
        Ok(alerts)
    }

    /// Persisted alerts from the last `hours_back` hours, newest first,
    /// optionally narrowed to one severity.
    pub async fn recent_alerts(
        &self,
        hours_back: u32,
        severity: Option<AlertSeverity>,
    ) -> Result<Vec<UsageAlert>, StorageError> {
        let Some(log) = self.load_log::<UsageAlert>(&self.alerts_path).await? else {
            return Ok(Vec::new());
        };
        let cutoff = self.clock.now() - ChronoDuration::hours(i64::from(hours_back));
        let mut recent: Vec<UsageAlert> = log
            .data
            .into_iter()
            .filter(|a| a.timestamp > cutoff && severity.map_or(true, |s| a.severity == s))
            .collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(recent)
    }

    /// Aggregate request statistics over the last `hours_back` hours,
    /// optionally narrowed to one operation type. Keys that fail to load
    /// are skipped.
    pub async fn usage_statistics(
        &self,
        operation_type: Option<&str>,
        hours_back: u32,
    ) -> Result<UsageStatistics, StorageError> {
        let now = self.clock.now();
        let start = now - ChronoDuration::hours(i64::from(hours_back));

        let mut total_requests: u64 = 0;
        let mut total_blocked: u64 = 0;
        let mut identifiers: HashSet<String> = HashSet::new();
        let mut operation_types: BTreeMap<String, u64> = BTreeMap::new();
        let mut hourly_distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut daily_distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut per_user: HashMap<String, u64> = HashMap::new();

        for key in self.store.all_keys().await {
            if operation_type.is_some_and(|op| op != key.operation_type) {
                continue;
            }
            let entry = match self.store.get(&key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "statistics skipped key");
                    continue;
                }
            };
            identifiers.insert(key.identifier.clone());
            total_blocked += entry.blocked_count;
            for record in entry.records_in_window(start, now) {
                total_requests += 1;
                *operation_types
                    .entry(key.operation_type.clone())
                    .or_insert(0) += 1;
                let local = record.timestamp.with_timezone(&Local);
                *hourly_distribution
                    .entry(local.format("%Y-%m-%d %H:00").to_string())
                    .or_insert(0) += 1;
                *daily_distribution
                    .entry(local.format("%Y-%m-%d").to_string())
                    .or_insert(0) += 1;
                *per_user.entry(key.identifier.clone()).or_insert(0) += 1;
            }
        }

        let mut top_users: Vec<(String, u64)> = per_user.into_iter().collect();
        top_users.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_users.truncate(TOP_USERS);

        let success_rate_percent = if total_requests > 0 {
            (total_requests as f64 - total_blocked as f64) / total_requests as f64 * 100.0
        } else {
            0.0
        };
        let block_rate_percent = if total_requests > 0 {
            total_blocked as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };
        let request_rate_per_hour = if hours_back > 0 {
            total_requests as f64 / f64::from(hours_back)
        } else {
            0.0
        };

        Ok(UsageStatistics {
            period_hours: hours_back,
            operation_type_filter: operation_type.map(String::from),
            total_requests,
            total_blocked,
            success_rate_percent,
            block_rate_percent,
            request_rate_per_hour,
            unique_identifiers: identifiers.len(),
            operation_types,
            top_users,
            hourly_distribution,
            daily_distribution,
        })
    }

    /// Build a report over the horizon: statistics, alert summary, and
    /// heuristic insights/recommendations. Persisted to the capped report
    /// log when analytics is enabled.
    pub async fn generate_usage_report(
        &self,
        report_type: ReportType,
        operation_type: Option<&str>,
    ) -> Result<UsageReport, StorageError> {
        let hours_back = report_type.hours_back();
        let statistics = self.usage_statistics(operation_type, hours_back).await?;
        let alerts = self.recent_alerts(hours_back, None).await?;

        let mut alerts_by_severity: BTreeMap<String, usize> = BTreeMap::new();
        for alert in &alerts {
            *alerts_by_severity
                .entry(alert.severity.as_str().to_string())
                .or_insert(0) += 1;
        }

        let insights = build_insights(&statistics, &alerts);
        let recommendations = build_recommendations(&statistics, &alerts);

        let report = UsageReport {
            id: Uuid::new_v4(),
            report_type,
            generated_at: self.clock.now(),
            operation_type_filter: operation_type.map(String::from),
            statistics,
            alerts_total: alerts.len(),
            alerts_by_severity,
            recent_alerts: alerts.into_iter().take(10).collect(),
            insights,
            recommendations,
        };

        if self.config.read().await.analytics.enabled {
            self.append_report(&report).await?;
        }
        info!(report_type = %report.report_type, "usage report generated");
        Ok(report)
    }

    /// Drop alerts and reports older than `retention_days`. Returns how many
    /// records were removed.
    pub async fn cleanup_old_analytics(&self, retention_days: u32) -> Result<usize, StorageError> {
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::days(i64::from(retention_days));
        let _guard = self.file_lock.lock().await;
        let mut removed = 0;

        if let Some(mut log) = self.load_log::<UsageAlert>(&self.alerts_path).await? {
            let before = log.data.len();
            log.data.retain(|a| a.timestamp > cutoff);
            if log.data.len() != before {
                removed += before - log.data.len();
                log.last_updated = now;
                self.save_log(&self.alerts_path, &log).await?;
            }
        }
        if let Some(mut log) = self.load_log::<UsageReport>(&self.reports_path).await? {
            let before = log.data.len();
            log.data.retain(|r| r.generated_at > cutoff);
            if log.data.len() != before {
                removed += before - log.data.len();
                log.last_updated = now;
                self.save_log(&self.reports_path, &log).await?;
            }
        }

        if removed > 0 {
            info!(removed, retention_days, "old analytics records pruned");
        }
        Ok(removed)
    }

    async fn append_alerts(
        &self,
        alerts: &[UsageAlert],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let _guard = self.file_lock.lock().await;
        let mut log = self
            .load_log::<UsageAlert>(&self.alerts_path)
            .await?
            .unwrap_or_else(|| AnalyticsLog::new(now));
        log.data.extend(alerts.iter().cloned());
        if log.data.len() > ALERT_LOG_CAP {
            let excess = log.data.len() - ALERT_LOG_CAP;
            log.data.drain(..excess);
        }
        log.last_updated = now;
        self.save_log(&self.alerts_path, &log).await
    }

    async fn append_report(&self, report: &UsageReport) -> Result<(), StorageError> {
        let _guard = self.file_lock.lock().await;
        let mut log = self
            .load_log::<UsageReport>(&self.reports_path)
            .await?
            .unwrap_or_else(|| AnalyticsLog::new(report.generated_at));
        log.data.push(report.clone());
        if log.data.len() > REPORT_LOG_CAP {
            let excess = log.data.len() - REPORT_LOG_CAP;
            log.data.drain(..excess);
        }
        log.last_updated = report.generated_at;
        self.save_log(&self.reports_path, &log).await
    }

    async fn load_log<T: DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<AnalyticsLog<T>>, StorageError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::corrupt(path.display().to_string(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn save_log<T: Serialize>(
        &self,
        path: &Path,
        log: &AnalyticsLog<T>,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(log).map_err(|e| StorageError::Serialize {
            key: path.display().to_string(),
            source: e,
        })?;
        write_atomic(path, &bytes).await
    }
}

fn title(kind: LimitKind) -> &'static str {
    match kind {
        LimitKind::Burst => "Burst",
        LimitKind::Daily => "Daily",
        LimitKind::Weekly => "Weekly",
        LimitKind::Monthly => "Monthly",
    }
}

fn peak_hours(hourly: &BTreeMap<u32, u64>) -> Vec<u32> {
    if hourly.is_empty() {
        return Vec::new();
    }
    let avg = hourly.values().sum::<u64>() as f64 / hourly.len() as f64;
    hourly
        .iter()
        .filter(|&(_, &usage)| usage as f64 > avg * 1.5)
        .map(|(&hour, _)| hour)
        .collect()
}

fn detect_outliers(records: &[UsageRecord]) -> Vec<Outlier> {
    if records.len() < MIN_OUTLIER_SAMPLES {
        return Vec::new();
    }
    let values: Vec<f64> = records.iter().map(|r| r.resource_consumed as f64).collect();
    let mean = stats::mean(&values);
    let std_dev = stats::sample_std_dev(&values, mean);
    if std_dev <= 0.0 {
        return Vec::new();
    }
    records
        .iter()
        .filter_map(|r| {
            let z = ((r.resource_consumed as f64 - mean) / std_dev).abs();
            (z > OUTLIER_Z_SCORE).then(|| Outlier {
                timestamp: r.timestamp,
                usage: r.resource_consumed,
                z_score: z,
            })
        })
        .collect()
}

/// Earliest-quartile vs latest-quartile comparison over records sorted by
/// timestamp. A 10% relative change sets the direction.
fn analyze_trend(records: &[UsageRecord]) -> Trend {
    if records.len() < 5 {
        return Trend::insufficient();
    }
    let window = (records.len() / 4).min(10);
    if window < 2 {
        return Trend::insufficient();
    }

    let early: Vec<f64> = records[..window]
        .iter()
        .map(|r| r.resource_consumed as f64)
        .collect();
    let late: Vec<f64> = records[records.len() - window..]
        .iter()
        .map(|r| r.resource_consumed as f64)
        .collect();
    let early_average = stats::mean(&early);
    let late_average = stats::mean(&late);

    let direction = if late_average > early_average * 1.1 {
        TrendDirection::Increasing
    } else if late_average < early_average * 0.9 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };
    let strength = if early_average > 0.0 {
        ((late_average - early_average).abs() / early_average).min(1.0)
    } else {
        0.0
    };

    Trend {
        direction,
        strength,
        early_average,
        late_average,
        confidence: (records.len() as f64 / 100.0).min(1.0),
    }
}

fn build_insights(stats: &UsageStatistics, alerts: &[UsageAlert]) -> Vec<String> {
    let mut insights = Vec::new();

    if stats.total_requests > 0 {
        if stats.success_rate_percent < 90.0 {
            insights.push(format!(
                "Success rate is low at {:.1}%, indicating sustained rate limiting pressure",
                stats.success_rate_percent
            ));
        } else if stats.success_rate_percent > 98.0 {
            insights.push(format!(
                "Excellent success rate of {:.1}%, limits are well matched to demand",
                stats.success_rate_percent
            ));
        }
        if stats.block_rate_percent > 10.0 {
            insights.push(format!(
                "High block rate of {:.1}%, consider reviewing the configured limits",
                stats.block_rate_percent
            ));
        }
    }
    if stats.request_rate_per_hour > 100.0 {
        insights.push(format!(
            "High request rate of {:.1} requests/hour, monitor for unusual activity",
            stats.request_rate_per_hour
        ));
    }
    if alerts.len() > 20 {
        insights.push(format!(
            "High number of alerts ({}), investigate potential issues",
            alerts.len()
        ));
    }
    if let Some((top_user, top_requests)) = stats.top_users.first() {
        if stats.total_requests > 0 {
            let share = *top_requests as f64 / stats.total_requests as f64;
            if share > 0.3 {
                insights.push(format!(
                    "Top user ({top_user}) accounts for {:.1}% of requests",
                    share * 100.0
                ));
            }
        }
    }

    insights
}

fn build_recommendations(stats: &UsageStatistics, alerts: &[UsageAlert]) -> Vec<String> {
    let mut recommendations = Vec::new();

    if stats.total_requests > 0 && stats.success_rate_percent < 95.0 {
        recommendations
            .push("Consider raising limits or smoothing client usage patterns".to_string());
    }
    if stats.block_rate_percent > 5.0 {
        recommendations.push(
            "Review rate limit policies and consider enabling graceful degradation".to_string(),
        );
    }
    if alerts.iter().any(|a| a.severity == AlertSeverity::Critical) {
        recommendations
            .push("Address critical alerts immediately to prevent service disruption".to_string());
    }
    if !stats.hourly_distribution.is_empty() {
        let mut hours: Vec<(&String, &u64)> = stats.hourly_distribution.iter().collect();
        hours.sort_by(|a, b| b.1.cmp(a.1));
        let peaks: Vec<&str> = hours.iter().take(3).map(|(h, _)| h.as_str()).collect();
        recommendations.push(format!(
            "Consider time-based shaping for peak hours: {}",
            peaks.join(", ")
        ));
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::OperationLimits;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    fn noon_local() -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(2025, 1, 15, 12, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn setup(config: Config) -> (UsageAnalytics, Arc<UsageStore>, Arc<ManualClock>, TempDir)
    {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(noon_local()));
        let store = Arc::new(
            UsageStore::open_with_clock(tmp.path(), Duration::from_secs(5), clock.clone())
                .await
                .unwrap(),
        );
        let analytics = UsageAnalytics::new(Arc::clone(&store), Arc::new(RwLock::new(config)));
        (analytics, store, clock, tmp)
    }

    fn config_with(limits: OperationLimits) -> Config {
        let mut config = Config::default();
        config.rate_limits.insert("api_calls".to_string(), limits);
        config
    }

    #[tokio::test]
    async fn test_analyze_patterns_empty_key() {
        let (analytics, _store, _clock, _tmp) = setup(Config::default()).await;
        let report = analytics
            .analyze_usage_patterns("nobody", "api_calls", 24)
            .await
            .unwrap();
        assert_eq!(report.total_usage, 0);
        assert!(report.hourly_usage.is_empty());
        assert!(report.peak_hours.is_empty());
        assert_eq!(report.distribution, None);
        assert_eq!(report.trend.direction, TrendDirection::InsufficientData);
    }

    #[tokio::test]
    async fn test_analyze_patterns_totals_and_histogram() {
        let (analytics, store, clock, _tmp) = setup(Config::default()).await;
        let key = UsageKey::new("u1", "api_calls");

        // Two records in one local hour, one in the next.
        store.record_usage(&key, 3, None, None).await.unwrap();
        store.record_usage(&key, 2, None, None).await.unwrap();
        clock.advance(ChronoDuration::hours(1));
        store.record_usage(&key, 4, None, None).await.unwrap();

        let report = analytics
            .analyze_usage_patterns("u1", "api_calls", 24)
            .await
            .unwrap();
        assert_eq!(report.total_usage, 9);
        assert!((report.usage_rate_per_hour - 9.0 / 24.0).abs() < 1e-9);
        assert_eq!(report.hourly_usage.len(), 2);
        assert_eq!(report.hourly_usage.values().sum::<u64>(), 9);

        let dist = report.distribution.unwrap();
        assert_eq!(dist.samples, 3);
        assert_eq!(dist.min, 2);
        assert_eq!(dist.max, 4);
    }

    #[tokio::test]
    async fn test_analyze_patterns_respects_horizon() {
        let (analytics, store, clock, _tmp) = setup(Config::default()).await;
        let key = UsageKey::new("u1", "api_calls");

        store.record_usage(&key, 5, None, None).await.unwrap();
        clock.advance(ChronoDuration::hours(30));
        store.record_usage(&key, 7, None, None).await.unwrap();

        let report = analytics
            .analyze_usage_patterns("u1", "api_calls", 24)
            .await
            .unwrap();
        // The 30-hour-old record is outside the 24-hour horizon.
        assert_eq!(report.total_usage, 7);
    }

    #[tokio::test]
    async fn test_peak_hours_detection() {
        let mut hourly = BTreeMap::new();
        hourly.insert(9, 10u64);
        hourly.insert(10, 10);
        hourly.insert(14, 40);
        // Mean is 20; only 14:00 exceeds 1.5x.
        assert_eq!(peak_hours(&hourly), vec![14]);
    }

    #[tokio::test]
    async fn test_outliers_require_ten_samples() {
        let (analytics, store, _clock, _tmp) = setup(Config::default()).await;
        let key = UsageKey::new("u1", "api_calls");
        for _ in 0..8 {
            store.record_usage(&key, 1, None, None).await.unwrap();
        }
        store.record_usage(&key, 100, None, None).await.unwrap();

        let report = analytics
            .analyze_usage_patterns("u1", "api_calls", 24)
            .await
            .unwrap();
        assert!(report.outliers.is_empty());
    }

    #[tokio::test]
    async fn test_outlier_detection_flags_spike() {
        let (analytics, store, _clock, _tmp) = setup(Config::default()).await;
        let key = UsageKey::new("u1", "api_calls");
        for _ in 0..11 {
            store.record_usage(&key, 1, None, None).await.unwrap();
        }
        store.record_usage(&key, 100, None, None).await.unwrap();

        let report = analytics
            .analyze_usage_patterns("u1", "api_calls", 24)
            .await
            .unwrap();
        assert_eq!(report.outliers.len(), 1);
        assert_eq!(report.outliers[0].usage, 100);
        assert!(report.outliers[0].z_score > OUTLIER_Z_SCORE);
    }

    #[tokio::test]
    async fn test_trend_increasing() {
        let (analytics, store, clock, _tmp) = setup(Config::default()).await;
        let key = UsageKey::new("u1", "api_calls");
        for _ in 0..10 {
            store.record_usage(&key, 1, None, None).await.unwrap();
            clock.advance(ChronoDuration::minutes(1));
        }
        for _ in 0..10 {
            store.record_usage(&key, 10, None, None).await.unwrap();
            clock.advance(ChronoDuration::minutes(1));
        }

        let report = analytics
            .analyze_usage_patterns("u1", "api_calls", 24)
            .await
            .unwrap();
        assert_eq!(report.trend.direction, TrendDirection::Increasing);
        assert_eq!(report.trend.strength, 1.0);
        assert!((report.trend.confidence - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_trend_stable_and_insufficient() {
        let (analytics, store, clock, _tmp) = setup(Config::default()).await;
        let key = UsageKey::new("u1", "api_calls");
        for _ in 0..4 {
            store.record_usage(&key, 5, None, None).await.unwrap();
            clock.advance(ChronoDuration::minutes(1));
        }
        let report = analytics
            .analyze_usage_patterns("u1", "api_calls", 24)
            .await
            .unwrap();
        assert_eq!(report.trend.direction, TrendDirection::InsufficientData);

        for _ in 0..8 {
            store.record_usage(&key, 5, None, None).await.unwrap();
            clock.advance(ChronoDuration::minutes(1));
        }
        let report = analytics
            .analyze_usage_patterns("u1", "api_calls", 24)
            .await
            .unwrap();
        assert_eq!(report.trend.direction, TrendDirection::Stable);
    }

    #[tokio::test]
    async fn test_threshold_alert_medium_then_high() {
        let limits = OperationLimits {
            daily_limit: 10,
            burst_limit: 1000,
            ..OperationLimits::default()
        };
        let (analytics, store, _clock, _tmp) = setup(config_with(limits)).await;
        let key = UsageKey::new("u1", "api_calls");

        store.record_usage(&key, 8, None, None).await.unwrap();
        let alerts = analytics
            .generate_usage_alerts("u1", "api_calls")
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "daily_usage_threshold");
        assert_eq!(alerts[0].severity, AlertSeverity::Medium);
        assert_eq!(alerts[0].current_value, 80.0);

        store.record_usage(&key, 2, None, None).await.unwrap();
        let alerts = analytics
            .generate_usage_alerts("u1", "api_calls")
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::High);
    }

    #[tokio::test]
    async fn test_burst_alert_is_critical() {
        let limits = OperationLimits {
            burst_limit: 10,
            ..OperationLimits::default()
        };
        let (analytics, store, _clock, _tmp) = setup(config_with(limits)).await;
        let key = UsageKey::new("u1", "api_calls");
        store.record_usage(&key, 9, None, None).await.unwrap();

        let alerts = analytics
            .generate_usage_alerts("u1", "api_calls")
            .await
            .unwrap();
        // 90% of burst: one medium threshold alert plus the critical one.
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_type, "burst_usage_threshold");
        assert_eq!(alerts[0].severity, AlertSeverity::Medium);
        assert_eq!(alerts[1].alert_type, "burst_threshold");
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);

        let critical = analytics
            .recent_alerts(24, Some(AlertSeverity::Critical))
            .await
            .unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].alert_type, "burst_threshold");
    }

    #[tokio::test]
    async fn test_consecutive_blocks_alert() {
        let (analytics, store, _clock, _tmp) = setup(Config::default()).await;
        let key = UsageKey::new("u1", "api_calls");
        for _ in 0..5 {
            store.record_block(&key).await.unwrap();
        }

        let alerts = analytics
            .generate_usage_alerts("u1", "api_calls")
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "consecutive_blocks");
        assert_eq!(alerts[0].severity, AlertSeverity::High);
        assert_eq!(alerts[0].current_value, 5.0);
    }

    #[tokio::test]
    async fn test_alerts_disabled_by_config() {
        let mut config = Config::default();
        config.analytics.enabled = false;
        config.rate_limits.insert(
            "api_calls".to_string(),
            OperationLimits {
                daily_limit: 10,
                ..OperationLimits::default()
            },
        );
        let (analytics, store, _clock, _tmp) = setup(config).await;
        let key = UsageKey::new("u1", "api_calls");
        store.record_usage(&key, 10, None, None).await.unwrap();

        let alerts = analytics
            .generate_usage_alerts("u1", "api_calls")
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_alerts_persist_and_respect_horizon() {
        let limits = OperationLimits {
            daily_limit: 10,
            burst_limit: 1000,
            ..OperationLimits::default()
        };
        let (analytics, store, clock, _tmp) = setup(config_with(limits)).await;
        let key = UsageKey::new("u1", "api_calls");
        store.record_usage(&key, 9, None, None).await.unwrap();
        analytics
            .generate_usage_alerts("u1", "api_calls")
            .await
            .unwrap();

        assert_eq!(analytics.recent_alerts(24, None).await.unwrap().len(), 1);

        clock.advance(ChronoDuration::hours(48));
        assert!(analytics.recent_alerts(24, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usage_statistics_filters_operation() {
        let (analytics, store, _clock, _tmp) = setup(Config::default()).await;
        store
            .record_usage(&UsageKey::new("u1", "api_calls"), 1, None, None)
            .await
            .unwrap();
        store
            .record_usage(&UsageKey::new("u1", "api_calls"), 1, None, None)
            .await
            .unwrap();
        store
            .record_usage(&UsageKey::new("u2", "api_calls"), 1, None, None)
            .await
            .unwrap();
        store
            .record_usage(&UsageKey::new("u3", "reports"), 1, None, None)
            .await
            .unwrap();
        store
            .record_block(&UsageKey::new("u2", "api_calls"))
            .await
            .unwrap();

        let stats = analytics
            .usage_statistics(Some("api_calls"), 24)
            .await
            .unwrap();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_blocked, 1);
        assert_eq!(stats.unique_identifiers, 2);
        assert_eq!(stats.operation_types["api_calls"], 3);
        assert_eq!(stats.top_users[0], ("u1".to_string(), 2));

        let all = analytics.usage_statistics(None, 24).await.unwrap();
        assert_eq!(all.total_requests, 4);
        assert_eq!(all.unique_identifiers, 3);
    }

    #[tokio::test]
    async fn test_report_persists_and_carries_insights() {
        let limits = OperationLimits {
            daily_limit: 10,
            burst_limit: 1000,
            ..OperationLimits::default()
        };
        let (analytics, store, _clock, tmp) = setup(config_with(limits)).await;
        let key = UsageKey::new("u1", "api_calls");
        store.record_usage(&key, 9, None, None).await.unwrap();
        analytics
            .generate_usage_alerts("u1", "api_calls")
            .await
            .unwrap();

        let report = analytics
            .generate_usage_report(ReportType::Daily, Some("api_calls"))
            .await
            .unwrap();
        assert_eq!(report.report_type, ReportType::Daily);
        assert_eq!(report.alerts_total, 1);
        assert_eq!(report.alerts_by_severity["medium"], 1);
        assert!(!report.recommendations.is_empty());
        // One request, zero blocks: the success-rate insight fires.
        assert!(report
            .insights
            .iter()
            .any(|i| i.contains("Excellent success rate")));

        assert!(tmp.path().join("analytics/reports.json").exists());
    }

    #[tokio::test]
    async fn test_cleanup_old_analytics() {
        let limits = OperationLimits {
            daily_limit: 10,
            burst_limit: 1000,
            ..OperationLimits::default()
        };
        let (analytics, store, clock, _tmp) = setup(config_with(limits)).await;
        let key = UsageKey::new("u1", "api_calls");
        store.record_usage(&key, 9, None, None).await.unwrap();
        analytics
            .generate_usage_alerts("u1", "api_calls")
            .await
            .unwrap();
        analytics
            .generate_usage_report(ReportType::Daily, None)
            .await
            .unwrap();

        assert_eq!(analytics.cleanup_old_analytics(365).await.unwrap(), 0);

        clock.advance(ChronoDuration::days(400));
        let removed = analytics.cleanup_old_analytics(365).await.unwrap();
        assert_eq!(removed, 2);
        // Idempotent once pruned.
        assert_eq!(analytics.cleanup_old_analytics(365).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_report_type_parsing() {
        assert_eq!("daily".parse::<ReportType>().unwrap(), ReportType::Daily);
        assert_eq!("WEEKLY".parse::<ReportType>().unwrap(), ReportType::Weekly);
        assert!("yearly".parse::<ReportType>().is_err());
        assert_eq!(ReportType::Monthly.hours_back(), 720);
    }
}
