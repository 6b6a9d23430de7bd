//! Admission HTTP API
//!
//! JSON surface over the limiter, admin, and analytics layers. One router
//! with one shared state and thin handlers: every endpoint delegates to the
//! same library calls the CLI uses.
//!
//! # Endpoints
//!
//! - `POST /check`, `POST /consume`: admission decisions
//! - `GET /status/{identifier}[/{operation_type}]`: usage snapshots
//! - `POST /override`, `/override/revoke`, `/override/emergency` and
//!   `GET /override/status`: override lifecycle
//! - `POST /reset`, `POST /reset/bulk`: usage resets
//! - `GET /report/{report_type}`, `GET /patterns/...`, `POST /alerts/...`,
//!   `GET /alerts`: analytics
//! - `GET /admin/stats`, `GET /admin/log`: audit introspection
//! - `GET /health`: liveness

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admin::{AdminActionKind, AdminError, AdminOverride, OverrideRequest};
use crate::analytics::{AlertSeverity, ReportType, UsageAnalytics};
use crate::limiter::{BlockReason, Decision, RateLimitError, RateLimiter};
use crate::store::StorageError;

/// Shared handles behind every endpoint.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub admin: Arc<AdminOverride>,
    pub analytics: Arc<UsageAnalytics>,
}

/// Start the admission API server
///
/// Binds to the configured address and serves until the process exits.
pub async fn start_server(state: AppState, bind_address: &str, port: u16) -> Result<()> {
    let app = api_router(state);

    let addr: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .context("Invalid server bind address")?;

    info!("Starting admission API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind API server")?;

    axum::serve(listener, app)
        .await
        .context("API server error")?;

    Ok(())
}

/// Build the API router. Split from [`start_server`] so tests can drive it
/// with `tower::ServiceExt::oneshot`.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/check", post(check))
        .route("/consume", post(consume))
        .route("/status/{identifier}", get(all_statuses))
        .route("/status/{identifier}/{operation_type}", get(status))
        .route("/override", post(grant_override))
        .route("/override/revoke", post(revoke_override))
        .route("/override/emergency", post(emergency_override))
        .route("/override/status", get(override_status))
        .route("/reset", post(reset_usage))
        .route("/reset/bulk", post(bulk_reset_usage))
        .route("/report/{report_type}", get(usage_report))
        .route("/patterns/{identifier}/{operation_type}", get(usage_patterns))
        .route("/alerts/{identifier}/{operation_type}", post(generate_alerts))
        .route("/alerts", get(recent_alerts))
        .route("/admin/stats", get(admin_stats))
        .route("/admin/log", get(admin_log))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ REQUEST / RESPONSE BODIES ============

#[derive(Debug, Deserialize)]
pub struct AdmissionBody {
    pub identifier: String,
    pub operation_type: String,
    #[serde(default = "default_amount")]
    pub amount: u64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

fn default_amount() -> u64 {
    1
}

#[derive(Debug, Serialize)]
pub struct DecisionBody {
    pub decision: &'static str,
    pub admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<serde_json::Value>,
}

impl From<&Decision> for DecisionBody {
    fn from(decision: &Decision) -> Self {
        let reason = match decision {
            Decision::Blocked(BlockReason::Limit {
                kind,
                current,
                limit,
                reset_time,
            }) => Some(serde_json::json!({
                "kind": kind.as_str(),
                "current": current,
                "limit": limit,
                "reset_time": reset_time,
            })),
            Decision::Blocked(BlockReason::BatchTooLarge {
                amount,
                max_batch_size,
            }) => Some(serde_json::json!({
                "kind": "batch_too_large",
                "amount": amount,
                "max_batch_size": max_batch_size,
            })),
            Decision::Blocked(BlockReason::StorageUnavailable) => {
                Some(serde_json::json!({ "kind": "storage_unavailable" }))
            }
            _ => None,
        };
        Self {
            decision: decision.outcome_label(),
            admitted: decision.admits(),
            reason,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConsumeBody {
    pub admitted: bool,
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub identifier: String,
    pub operation_type: String,
    pub performed_by: String,
}

#[derive(Debug, Deserialize)]
pub struct EmergencyBody {
    pub operation_type: String,
    #[serde(default)]
    pub duration_hours: Option<u32>,
    pub performed_by: String,
    pub justification: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetBody {
    pub identifier: String,
    pub operation_type: String,
    pub performed_by: String,
}

#[derive(Debug, Deserialize)]
pub struct BulkResetBody {
    pub operation_type: String,
    pub performed_by: String,
}

#[derive(Debug, Serialize)]
pub struct OverrideGrantedBody {
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    identifier: Option<String>,
    operation_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HoursQuery {
    #[serde(default = "default_hours")]
    hours: u32,
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    #[serde(default = "default_hours")]
    hours: u32,
    severity: Option<AlertSeverity>,
}

fn default_hours() -> u32 {
    24
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    operation_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
    kind: Option<AdminActionKind>,
    identifier: Option<String>,
}

fn default_log_limit() -> usize {
    50
}

// ============ ERROR MAPPING ============

/// All handler failures, mapped onto HTTP statuses: 429 for exhausted
/// limits, 413 for oversize batches, 404 for unknown keys, 403 for refused
/// admin actions, 503 for storage trouble, 400 for bad parameters.
#[derive(Debug)]
pub enum ApiError {
    RateLimit(RateLimitError),
    Admin(AdminError),
    Storage(StorageError),
    BadRequest(String),
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        Self::RateLimit(e)
    }
}

impl From<AdminError> for ApiError {
    fn from(e: AdminError) -> Self {
        Self::Admin(e)
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::RateLimit(e) => match e {
                RateLimitError::Exceeded {
                    kind,
                    current,
                    limit,
                    reset_time,
                    ..
                } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    serde_json::json!({
                        "error": e.to_string(),
                        "kind": kind.as_str(),
                        "current": current,
                        "limit": limit,
                        "reset_time": reset_time,
                    }),
                ),
                RateLimitError::BatchTooLarge { .. } => (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    serde_json::json!({ "error": e.to_string() }),
                ),
                RateLimitError::Storage(_) | RateLimitError::StorageUnavailable { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({ "error": e.to_string() }),
                ),
            },
            Self::Admin(e) => {
                let status = match e {
                    AdminError::OverridesDisabled
                    | AdminError::EmergencyDisabled
                    | AdminError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
                    AdminError::JustificationRequired => StatusCode::BAD_REQUEST,
                    AdminError::UnknownKey { .. } => StatusCode::NOT_FOUND,
                    AdminError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, serde_json::json!({ "error": e.to_string() }))
            }
            Self::Storage(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": e.to_string() }),
            ),
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": message }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

// ============ HANDLERS ============

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn check(
    State(state): State<AppState>,
    Json(body): Json<AdmissionBody>,
) -> impl IntoResponse {
    let decision = state
        .limiter
        .check(&body.identifier, &body.operation_type, body.amount)
        .await;
    Json(DecisionBody::from(&decision))
}

async fn consume(
    State(state): State<AppState>,
    Json(body): Json<AdmissionBody>,
) -> Result<Json<ConsumeBody>, ApiError> {
    let admitted = state
        .limiter
        .consume(
            &body.identifier,
            &body.operation_type,
            body.amount,
            body.user_id,
            body.metadata,
        )
        .await?;
    Ok(Json(ConsumeBody { admitted }))
}

async fn status(
    State(state): State<AppState>,
    Path((identifier, operation_type)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let status = state.limiter.status(&identifier, &operation_type).await?;
    Ok(Json(status).into_response())
}

async fn all_statuses(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Response, ApiError> {
    let statuses = state.limiter.all_statuses(&identifier).await?;
    Ok(Json(statuses).into_response())
}

async fn grant_override(
    State(state): State<AppState>,
    Json(request): Json<OverrideRequest>,
) -> Result<Json<OverrideGrantedBody>, ApiError> {
    let expiry = state.admin.request_override(&request).await?;
    Ok(Json(OverrideGrantedBody { expiry }))
}

async fn revoke_override(
    State(state): State<AppState>,
    Json(body): Json<RevokeBody>,
) -> Result<StatusCode, ApiError> {
    state
        .admin
        .revoke_override(&body.identifier, &body.operation_type, &body.performed_by)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn emergency_override(
    State(state): State<AppState>,
    Json(body): Json<EmergencyBody>,
) -> Result<Response, ApiError> {
    let outcome = state
        .admin
        .emergency_override(
            &body.operation_type,
            body.duration_hours,
            &body.performed_by,
            &body.justification,
        )
        .await?;
    Ok(Json(outcome).into_response())
}

async fn override_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, ApiError> {
    let status = state
        .admin
        .override_status(query.identifier.as_deref(), query.operation_type.as_deref())
        .await?;
    Ok(Json(status).into_response())
}

async fn reset_usage(
    State(state): State<AppState>,
    Json(body): Json<ResetBody>,
) -> Result<Response, ApiError> {
    let summary = state
        .admin
        .reset_usage(&body.identifier, &body.operation_type, &body.performed_by)
        .await?;
    Ok(Json(summary).into_response())
}

async fn bulk_reset_usage(
    State(state): State<AppState>,
    Json(body): Json<BulkResetBody>,
) -> Result<Response, ApiError> {
    let outcome = state
        .admin
        .bulk_reset_usage(&body.operation_type, &body.performed_by)
        .await?;
    Ok(Json(outcome).into_response())
}

async fn usage_report(
    State(state): State<AppState>,
    Path(report_type): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<Response, ApiError> {
    let report_type: ReportType = report_type.parse().map_err(ApiError::BadRequest)?;
    let report = state
        .analytics
        .generate_usage_report(report_type, query.operation_type.as_deref())
        .await?;
    Ok(Json(report).into_response())
}

async fn usage_patterns(
    State(state): State<AppState>,
    Path((identifier, operation_type)): Path<(String, String)>,
    Query(query): Query<HoursQuery>,
) -> Result<Response, ApiError> {
    let report = state
        .analytics
        .analyze_usage_patterns(&identifier, &operation_type, query.hours)
        .await?;
    Ok(Json(report).into_response())
}

async fn generate_alerts(
    State(state): State<AppState>,
    Path((identifier, operation_type)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let alerts = state
        .analytics
        .generate_usage_alerts(&identifier, &operation_type)
        .await?;
    Ok(Json(alerts).into_response())
}

async fn recent_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Response, ApiError> {
    let alerts = state
        .analytics
        .recent_alerts(query.hours, query.severity)
        .await?;
    Ok(Json(alerts).into_response())
}

async fn admin_stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stats = state.admin.admin_stats().await?;
    Ok(Json(stats).into_response())
}

async fn admin_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let actions = state
        .admin
        .admin_log(query.limit, query.kind, query.identifier.as_deref())
        .await?;
    Ok(Json(actions).into_response())
}
