// Prometheus metrics for ratekeeper monitoring
//
// Exposes metrics on /metrics HTTP endpoint:
// - Admission check outcomes (counter by operation type and decision)
// - Block reasons (counter by window kind)
// - Consume latencies (histogram)
// - Tracked keys and active overrides (gauges)
// - Maintenance task runs (counter by task and status)

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Admission metrics
    pub static ref ADMISSION_CHECKS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("admission_checks_total", "Total admission checks by outcome"),
        &["operation_type", "outcome"]
    ).expect("Failed to create admission checks metric");

    pub static ref ADMISSION_BLOCKED_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("admission_blocked_total", "Blocked admissions by reason"),
        &["operation_type", "reason"]
    ).expect("Failed to create admission blocked metric");

    pub static ref CONSUME_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("consume_duration_seconds", "Consume call duration in seconds"),
        &["operation_type"]
    ).expect("Failed to create consume duration metric");

    pub static ref RESOURCE_CONSUMED_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("resource_consumed_total", "Total resource units admitted"),
        &["operation_type"]
    ).expect("Failed to create resource consumed metric");

    pub static ref STORAGE_ERRORS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("storage_errors_total", "Storage failures observed by the limiter"),
        &["kind"]
    ).expect("Failed to create storage errors metric");

    // State gauges
    pub static ref TRACKED_KEYS: IntGauge = IntGauge::new(
        "tracked_keys_total",
        "Number of (identifier, operation_type) keys currently stored"
    ).expect("Failed to create tracked keys metric");

    pub static ref OVERRIDES_ACTIVE: IntGauge = IntGauge::new(
        "overrides_active_total",
        "Number of currently active admin overrides"
    ).expect("Failed to create overrides active metric");

    // Admin metrics
    pub static ref OVERRIDES_GRANTED_TOTAL: IntCounter = IntCounter::new(
        "overrides_granted_total",
        "Total admin overrides granted since start"
    ).expect("Failed to create overrides granted metric");

    pub static ref OVERRIDES_REVOKED_TOTAL: IntCounter = IntCounter::new(
        "overrides_revoked_total",
        "Total admin overrides revoked since start"
    ).expect("Failed to create overrides revoked metric");

    pub static ref OVERRIDES_EXPIRED_TOTAL: IntCounter = IntCounter::new(
        "overrides_expired_total",
        "Total admin overrides expired by the maintenance sweep"
    ).expect("Failed to create overrides expired metric");

    // Maintenance metrics
    pub static ref MAINTENANCE_RUNS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("maintenance_runs_total", "Maintenance task executions"),
        &["task", "status"]
    ).expect("Failed to create maintenance runs metric");

    pub static ref RECORDS_PRUNED_TOTAL: IntCounter = IntCounter::new(
        "records_pruned_total",
        "Usage records removed by retention cleanup"
    ).expect("Failed to create records pruned metric");

    // Analytics metrics
    pub static ref ALERTS_GENERATED_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("alerts_generated_total", "Usage alerts generated by severity"),
        &["severity"]
    ).expect("Failed to create alerts generated metric");
}

/// Initialize metrics registry - must be called once at service startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(ADMISSION_CHECKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ADMISSION_BLOCKED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONSUME_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(RESOURCE_CONSUMED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORAGE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TRACKED_KEYS.clone()))?;
    REGISTRY.register(Box::new(OVERRIDES_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(OVERRIDES_GRANTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OVERRIDES_REVOKED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OVERRIDES_EXPIRED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MAINTENANCE_RUNS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECORDS_PRUNED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALERTS_GENERATED_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
