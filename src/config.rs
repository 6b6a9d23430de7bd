// Configuration File Support
//
// This module provides configuration file parsing for the ratekeeper service.
// Supports TOML format with environment variable overrides. The configuration
// file path comes from RATEKEEPER_CONFIG or defaults to ./ratekeeper.toml.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Operation type whose limits apply when a request names an unknown one.
pub const DEFAULT_OPERATION: &str = "default";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Per-operation-type rate limits
    pub rate_limits: HashMap<String, OperationLimits>,

    /// Durable storage configuration
    pub storage: StorageConfig,

    /// Admin override configuration
    pub admin: AdminConfig,

    /// Graceful degradation policy
    pub graceful_degradation: DegradationConfig,

    /// Usage analytics configuration
    pub analytics: AnalyticsConfig,

    /// Admission API server configuration
    pub server: ServerConfig,

    /// Metrics endpoint configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Limits for one operation type across all four admission windows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OperationLimits {
    /// Whether limiting is enforced for this operation type
    pub enabled: bool,

    /// Maximum units per calendar day (local midnight anchor)
    pub daily_limit: u64,

    /// Maximum units per calendar week (Monday anchor)
    pub weekly_limit: u64,

    /// Maximum units per calendar month (1st-of-month anchor)
    pub monthly_limit: u64,

    /// Maximum units inside the sliding burst window
    pub burst_limit: u64,

    /// Length of the sliding burst window in minutes
    pub burst_window_minutes: u32,

    /// Largest single request amount accepted, if set
    pub max_batch_size: Option<u64>,

    /// Whether a blocked consume degrades to `false` instead of an error
    pub degradable: bool,

    /// Human-readable description
    pub description: String,
}

impl OperationLimits {
    /// The configured ceiling for one window kind.
    pub fn limit_for(&self, kind: crate::limiter::LimitKind) -> u64 {
        use crate::limiter::LimitKind;
        match kind {
            LimitKind::Burst => self.burst_limit,
            LimitKind::Daily => self.daily_limit,
            LimitKind::Weekly => self.weekly_limit,
            LimitKind::Monthly => self.monthly_limit,
        }
    }
}

impl Default for OperationLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_limit: 1000,
            weekly_limit: 5000,
            monthly_limit: 20000,
            burst_limit: 100,
            burst_window_minutes: 60,
            max_batch_size: None,
            degradable: false,
            description: String::new(),
        }
    }
}

/// Durable storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for usage files, index, backups, and logs
    pub data_directory: PathBuf,

    /// How often the maintenance task runs retention cleanup
    pub cleanup_interval_hours: u32,

    /// Usage records older than this many days are pruned
    pub retention_days: u32,

    /// Whether the maintenance task writes backup snapshots
    pub backup_enabled: bool,

    /// How often a backup snapshot is taken
    pub backup_interval_hours: u32,

    /// Upper bound for a single store I/O operation
    pub io_timeout_ms: u64,

    /// What an admission check does when storage fails or times out
    pub on_storage_error: OnStorageError,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("rate_limit_data"),
            cleanup_interval_hours: 24,
            retention_days: 90,
            backup_enabled: true,
            backup_interval_hours: 6,
            io_timeout_ms: 5000,
            on_storage_error: OnStorageError::FailOpen,
        }
    }
}

/// Policy applied when the store errors during an admission check.
///
/// FailOpen admits the request (availability over strictness); FailClosed
/// blocks it. This is a deployment decision, never an implicit side effect
/// of error handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnStorageError {
    FailOpen,
    FailClosed,
}

/// Admin override configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    /// Whether overrides can be granted at all
    pub override_enabled: bool,

    /// Whether emergency (all-identifier) overrides can be granted
    pub emergency_override_enabled: bool,

    /// Whether a non-empty justification is required to grant an override
    pub require_justification: bool,

    /// Default override duration when a request does not specify one
    pub default_override_hours: u32,

    /// Reference daily allowance for admin-initiated work
    pub admin_daily_limit: u64,

    /// Reference weekly allowance for admin-initiated work
    pub admin_weekly_limit: u64,

    /// Reference monthly allowance for admin-initiated work
    pub admin_monthly_limit: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            override_enabled: true,
            emergency_override_enabled: true,
            require_justification: true,
            default_override_hours: 24,
            admin_daily_limit: 50_000,
            admin_weekly_limit: 200_000,
            admin_monthly_limit: 800_000,
        }
    }
}

/// Graceful degradation policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DegradationConfig {
    /// Global switch; off means every blocked consume is an error
    pub enabled: bool,

    /// Advisory flag for callers: degrade to the rules-only path
    pub fallback_to_rules_only: bool,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_to_rules_only: true,
        }
    }
}

/// Usage analytics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Whether alert generation and report persistence run at all
    pub enabled: bool,

    /// Alerts and reports older than this many days are pruned
    pub retention_days: u32,

    /// Window usage percentage that raises a threshold alert
    pub usage_threshold_percent: f64,

    /// Burst usage percentage that raises a critical alert
    pub burst_threshold_percent: f64,

    /// Blocked-count level that raises a consecutive-blocks alert
    pub consecutive_block_threshold: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 365,
            usage_threshold_percent: 80.0,
            burst_threshold_percent: 90.0,
            consecutive_block_threshold: 5,
        }
    }
}

/// Admission API server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the API server binds to
    pub bind_address: String,

    /// Port for the admission API
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve Prometheus metrics
    pub enabled: bool,

    /// Port for the metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            DEFAULT_OPERATION.to_string(),
            OperationLimits {
                description: "Default rate limits".to_string(),
                ..OperationLimits::default()
            },
        );
        rate_limits.insert(
            "ai_evaluations".to_string(),
            OperationLimits {
                degradable: true,
                description: "AI evaluation calls, degradable to the rules-only path".to_string(),
                ..OperationLimits::default()
            },
        );
        Self {
            logging: LoggingConfig::default(),
            rate_limits,
            storage: StorageConfig::default(),
            admin: AdminConfig::default(),
            graceful_degradation: DegradationConfig::default(),
            analytics: AnalyticsConfig::default(),
            server: ServerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load configuration from a specific path
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default().apply_env_overrides());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        // Apply environment variable overrides
        let config = config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the configuration file path: RATEKEEPER_CONFIG or ./ratekeeper.toml
    pub fn config_path() -> PathBuf {
        std::env::var("RATEKEEPER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ratekeeper.toml"))
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - RATEKEEPER_LOG_LEVEL
    /// - RATEKEEPER_LOG_FORMAT
    /// - RATEKEEPER_DATA_DIR
    /// - RATEKEEPER_RETENTION_DAYS
    /// - RATEKEEPER_PORT
    /// - RATEKEEPER_METRICS_PORT
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("RATEKEEPER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("RATEKEEPER_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(dir) = std::env::var("RATEKEEPER_DATA_DIR") {
            self.storage.data_directory = PathBuf::from(dir);
        }
        if let Ok(days) = std::env::var("RATEKEEPER_RETENTION_DAYS") {
            if let Ok(days) = days.parse::<u32>() {
                if days > 0 {
                    self.storage.retention_days = days;
                }
            }
        }
        if let Ok(port) = std::env::var("RATEKEEPER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                if port > 0 {
                    self.server.port = port;
                }
            }
        }
        if let Ok(port) = std::env::var("RATEKEEPER_METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                if port > 0 {
                    self.metrics.port = port;
                }
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        // Validate per-operation limits
        for (name, limits) in &self.rate_limits {
            if !limits.enabled {
                continue;
            }
            if limits.daily_limit == 0
                || limits.weekly_limit == 0
                || limits.monthly_limit == 0
                || limits.burst_limit == 0
            {
                anyhow::bail!("Operation '{}' has a zero window limit", name);
            }
            if limits.burst_window_minutes == 0 {
                anyhow::bail!("Operation '{}' has a zero burst window", name);
            }
            if limits.max_batch_size == Some(0) {
                anyhow::bail!("Operation '{}' has a zero max batch size", name);
            }
        }

        // Validate storage configuration
        if self.storage.retention_days == 0 {
            anyhow::bail!("Retention days must be > 0");
        }
        if self.storage.cleanup_interval_hours == 0 {
            anyhow::bail!("Cleanup interval must be > 0 hours");
        }
        if self.storage.backup_interval_hours == 0 {
            anyhow::bail!("Backup interval must be > 0 hours");
        }
        if self.storage.io_timeout_ms == 0 {
            anyhow::bail!("Storage I/O timeout must be > 0 ms");
        }

        // Validate admin configuration
        if self.admin.default_override_hours == 0 {
            anyhow::bail!("Default override duration must be > 0 hours");
        }

        // Validate analytics configuration
        if self.analytics.retention_days == 0 {
            anyhow::bail!("Analytics retention days must be > 0");
        }
        for (name, value) in [
            ("usage", self.analytics.usage_threshold_percent),
            ("burst", self.analytics.burst_threshold_percent),
        ] {
            if !(0.0..=100.0).contains(&value) || value == 0.0 {
                anyhow::bail!(
                    "Analytics {} threshold must be in (0, 100], got {}",
                    name,
                    value
                );
            }
        }
        if self.analytics.consecutive_block_threshold == 0 {
            anyhow::bail!("Consecutive block threshold must be > 0");
        }

        // Validate server configuration
        if self.server.port == 0 {
            anyhow::bail!("Server port must be > 0");
        }
        if self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == self.server.port {
            anyhow::bail!("Metrics port must differ from the server port");
        }

        Ok(())
    }

    /// Limits for an operation type, falling back to the `default` entry
    /// and then to the built-in defaults.
    pub fn effective_limits(&self, operation_type: &str) -> OperationLimits {
        if let Some(limits) = self.rate_limits.get(operation_type) {
            return limits.clone();
        }
        if let Some(limits) = self.rate_limits.get(DEFAULT_OPERATION) {
            return limits.clone();
        }
        OperationLimits::default()
    }

    /// Whether a blocked consume of this operation may degrade to `false`
    /// instead of an error. Requires both the global switch and the
    /// per-operation flag.
    pub fn degradation_applies(&self, limits: &OperationLimits) -> bool {
        self.graceful_degradation.enabled && limits.degradable
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.storage.retention_days, 90);
        assert_eq!(config.storage.cleanup_interval_hours, 24);
        assert_eq!(config.storage.on_storage_error, OnStorageError::FailOpen);
        assert_eq!(config.admin.default_override_hours, 24);
        assert!(config.admin.emergency_override_enabled);
        assert_eq!(config.analytics.retention_days, 365);
        assert_eq!(config.analytics.usage_threshold_percent, 80.0);
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.metrics.port, 9090);
        assert!(config.rate_limits.contains_key(DEFAULT_OPERATION));
        assert!(config.rate_limits["ai_evaluations"].degradable);
    }

    #[test]
    fn test_default_operation_limits() {
        let limits = OperationLimits::default();
        assert!(limits.enabled);
        assert_eq!(limits.daily_limit, 1000);
        assert_eq!(limits.weekly_limit, 5000);
        assert_eq!(limits.monthly_limit, 20000);
        assert_eq!(limits.burst_limit, 100);
        assert_eq!(limits.burst_window_minutes, 60);
        assert_eq!(limits.max_batch_size, None);
        assert!(!limits.degradable);
    }

    #[test]
    fn test_config_validation_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_limit() {
        let mut config = Config::default();
        config
            .rate_limits
            .insert("bad".to_string(), OperationLimits {
                burst_limit: 0,
                ..OperationLimits::default()
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_limit_allowed_when_disabled() {
        let mut config = Config::default();
        config
            .rate_limits
            .insert("off".to_string(), OperationLimits {
                enabled: false,
                burst_limit: 0,
                ..OperationLimits::default()
            });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_batch_size() {
        let mut config = Config::default();
        config
            .rate_limits
            .insert("bad".to_string(), OperationLimits {
                max_batch_size: Some(0),
                ..OperationLimits::default()
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_retention() {
        let mut config = Config::default();
        config.storage.retention_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_analytics_thresholds() {
        let mut config = Config::default();
        config.analytics.usage_threshold_percent = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analytics.burst_threshold_percent = 150.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analytics.consecutive_block_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_port_collision() {
        let mut config = Config::default();
        config.metrics.enabled = true;
        config.metrics.port = config.server.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension(".nonexistent");
        let config = Config::load_from_path(&path);
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_valid_toml_config() {
        // Clean up environment variables to ensure isolation
        std::env::remove_var("RATEKEEPER_LOG_LEVEL");
        std::env::remove_var("RATEKEEPER_LOG_FORMAT");
        std::env::remove_var("RATEKEEPER_DATA_DIR");
        std::env::remove_var("RATEKEEPER_RETENTION_DAYS");
        std::env::remove_var("RATEKEEPER_PORT");
        std::env::remove_var("RATEKEEPER_METRICS_PORT");

        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[rate_limits.ai_evaluations]
enabled = true
daily_limit = 500
weekly_limit = 2500
monthly_limit = 10000
burst_limit = 50
burst_window_minutes = 30
max_batch_size = 25
degradable = true
description = "AI evaluations"

[storage]
data_directory = "/var/lib/ratekeeper"
retention_days = 30
on_storage_error = "fail_closed"

[server]
port = 8080
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        let ai = &config.rate_limits["ai_evaluations"];
        assert_eq!(ai.daily_limit, 500);
        assert_eq!(ai.burst_window_minutes, 30);
        assert_eq!(ai.max_batch_size, Some(25));
        assert!(ai.degradable);
        assert_eq!(
            config.storage.data_directory,
            PathBuf::from("/var/lib/ratekeeper")
        );
        assert_eq!(config.storage.retention_days, 30);
        assert_eq!(config.storage.on_storage_error, OnStorageError::FailClosed);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[storage
retention_days = 30
"#; // Invalid TOML

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path());
        assert!(config.is_err());
    }

    #[test]
    fn test_env_overrides() {
        // Clean up environment variables first to ensure isolation
        std::env::remove_var("RATEKEEPER_LOG_LEVEL");
        std::env::remove_var("RATEKEEPER_DATA_DIR");
        std::env::remove_var("RATEKEEPER_RETENTION_DAYS");
        std::env::remove_var("RATEKEEPER_PORT");

        std::env::set_var("RATEKEEPER_LOG_LEVEL", "debug");
        std::env::set_var("RATEKEEPER_DATA_DIR", "/custom/data");
        std::env::set_var("RATEKEEPER_RETENTION_DAYS", "14");
        std::env::set_var("RATEKEEPER_PORT", "9999");

        let config = Config::default().apply_env_overrides();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.data_directory, PathBuf::from("/custom/data"));
        assert_eq!(config.storage.retention_days, 14);
        assert_eq!(config.server.port, 9999);

        // Clean up
        std::env::remove_var("RATEKEEPER_LOG_LEVEL");
        std::env::remove_var("RATEKEEPER_DATA_DIR");
        std::env::remove_var("RATEKEEPER_RETENTION_DAYS");
        std::env::remove_var("RATEKEEPER_PORT");
    }

    #[test]
    fn test_env_overrides_invalid_values() {
        // Clean up environment variables first to ensure isolation
        std::env::remove_var("RATEKEEPER_RETENTION_DAYS");

        std::env::set_var("RATEKEEPER_RETENTION_DAYS", "0"); // Invalid (must be > 0)

        let config = Config::default().apply_env_overrides();

        // Should keep defaults for invalid values
        assert_eq!(config.storage.retention_days, 90);

        // Clean up
        std::env::remove_var("RATEKEEPER_RETENTION_DAYS");
    }

    #[test]
    fn test_config_partial_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        // Other fields should have defaults
        assert_eq!(config.storage.retention_days, 90);
        assert_eq!(config.server.port, 8090);
    }

    #[test]
    fn test_effective_limits_known_operation() {
        let mut config = Config::default();
        config.rate_limits.insert(
            "api_calls".to_string(),
            OperationLimits {
                daily_limit: 42,
                ..OperationLimits::default()
            },
        );
        assert_eq!(config.effective_limits("api_calls").daily_limit, 42);
    }

    #[test]
    fn test_effective_limits_falls_back_to_default_entry() {
        let mut config = Config::default();
        config
            .rate_limits
            .get_mut(DEFAULT_OPERATION)
            .unwrap()
            .daily_limit = 7;
        assert_eq!(config.effective_limits("never_seen").daily_limit, 7);
    }

    #[test]
    fn test_effective_limits_builtin_fallback() {
        let mut config = Config::default();
        config.rate_limits.clear();
        assert_eq!(config.effective_limits("anything").daily_limit, 1000);
    }

    #[test]
    fn test_degradation_requires_both_flags() {
        let config = Config::default();
        let mut limits = OperationLimits::default();
        assert!(!config.degradation_applies(&limits));
        limits.degradable = true;
        assert!(config.degradation_applies(&limits));

        let mut disabled = config.clone();
        disabled.graceful_degradation.enabled = false;
        assert!(!disabled.degradation_applies(&limits));
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = Config::default();
        config.logging.level = "debug".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);

        config.logging.level = "info".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::INFO);
    }

    #[test]
    fn test_log_level_parsing_invalid() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.log_level().is_err());
    }

    #[test]
    fn test_valid_log_levels() {
        let levels = vec!["trace", "debug", "info", "warn", "error"];
        for level in levels {
            let mut config = Config::default();
            config.logging.level = level.to_string();
            assert!(
                config.validate().is_ok(),
                "Log level {} should be valid",
                level
            );
        }
    }
}
