use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::audit::AuditRecord;
use crate::context::AdminContext;
use crate::decision::Decision;
use crate::error::ActivationError;
use crate::kind::{LogLevel, TelemetryKind};
use crate::maintenance::{PurgeReport, DEFAULT_KEEP_DAYS};
use crate::reporting::{ActivationSummary, ActiveConfiguration};
use crate::rule::{ActivationRule, GLOBAL_TENANT};
use crate::store::{ActivationStore, BulkOutcome};
use crate::validation::{minutes, EnableRequest};

pub const ACTOR_HEADER: &str = "x-beacon-actor";
pub const SESSION_HEADER: &str = "x-beacon-session";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableBody {
    pub object_pattern: String,
    pub telemetry_kind: TelemetryKind,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    #[serde(default)]
    pub min_log_level: Option<LogLevel>,
    #[serde(default)]
    pub active_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub active_to: Option<DateTime<Utc>>,
}

impl EnableBody {
    fn into_request(self) -> EnableRequest {
        let mut request =
            EnableRequest::new(self.object_pattern, self.telemetry_kind, self.tenant_id).sampling_rate(self.sampling_rate);
        if let Some(level) = self.min_log_level {
            request = request.min_log_level(level);
        }
        if let Some(from) = self.active_from {
            request = request.starting_at(from);
        }
        match (self.active_to, self.duration_minutes) {
            (Some(end), _) => request.until(end),
            (None, Some(count)) => request.lasting_minutes(count),
            (None, None) => request,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTarget {
    pub object_pattern: String,
    pub telemetry_kind: TelemetryKind,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkBody {
    pub patterns: Vec<String>,
    pub telemetry_kind: TelemetryKind,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisableAllBody {
    pub tenant_id: String,
    #[serde(default)]
    pub telemetry_kind: Option<TelemetryKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionBody {
    pub object_name: String,
    pub telemetry_kind: TelemetryKind,
    pub tenant_id: String,
    #[serde(default)]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Deserialize)]
struct TenantQuery {
    #[serde(default)]
    tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActiveQuery {
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    kind: Option<TelemetryKind>,
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    #[serde(default = "default_hours")]
    hours: u32,
    #[serde(default)]
    tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PurgeQuery {
    #[serde(default)]
    keep_days: Option<u32>,
}

fn default_tenant() -> String {
    GLOBAL_TENANT.to_string()
}

fn default_sampling_rate() -> f64 {
    1.0
}

fn default_hours() -> u32 {
    24
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(err: ActivationError) -> ApiError {
    let (status, code) = match &err {
        ActivationError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        err if err.is_validation() => (StatusCode::BAD_REQUEST, "invalid_request"),
        _ => {
            error!(%err, "activation request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: err.to_string(),
        }),
    )
}

fn invalid_request(message: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            code: "invalid_request".into(),
            message,
        }),
    )
}

/// Body extraction whose failures use the API's error shape.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| invalid_request(rejection.body_text()))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(value)| value)
        .map_err(|rejection| invalid_request(rejection.body_text()))
}

fn admin_context(headers: &HeaderMap) -> AdminContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let ctx = AdminContext::new(header(ACTOR_HEADER).unwrap_or_default()).with_client("rest");
    match header(SESSION_HEADER) {
        Some(session) => ctx.with_session(session),
        None => ctx,
    }
}

/// Configuration for the operator API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationServiceConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8090".to_string()
}

impl Default for ActivationServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Clone)]
struct ActivationServiceState {
    store: ActivationStore,
    keep_days: u32,
}

/// Composes the operator REST API over an [`ActivationStore`].
#[derive(Clone)]
pub struct ActivationApiBuilder {
    state: ActivationServiceState,
}

impl ActivationApiBuilder {
    pub fn new(store: ActivationStore) -> Self {
        Self {
            state: ActivationServiceState {
                store,
                keep_days: DEFAULT_KEEP_DAYS,
            },
        }
    }

    /// Retention used by the purge endpoint when the request names none.
    pub fn with_keep_days(mut self, keep_days: u32) -> Self {
        self.state.keep_days = keep_days;
        self
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/v1/activations", post(enable))
            .route("/v1/activations/disable", post(disable))
            .route("/v1/activations/bulk", post(enable_bulk))
            .route("/v1/activations/disable-all", post(disable_all))
            .route("/v1/decisions", post(decide))
            .route("/v1/reports/summary", get(summary))
            .route("/v1/reports/active", get(active))
            .route("/v1/reports/changes", get(changes))
            .route("/v1/maintenance/expire", post(expire))
            .route("/v1/maintenance/purge", post(purge))
            .with_state(self.state)
    }

    /// Spawns an HTTP server on the configured address; send on the returned
    /// channel to stop it.
    pub async fn serve(self, config: ActivationServiceConfig) -> anyhow::Result<oneshot::Sender<()>> {
        let (tx, rx) = oneshot::channel();
        let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
        let app = self.into_router();

        tokio::spawn(async move {
            info!(address = %config.bind_address, "starting activation service");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await
                .ok();
        });

        Ok(tx)
    }
}

async fn health(State(state): State<ActivationServiceState>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "cached_rules": state.store.cache().len() }))
}

async fn enable(
    State(state): State<ActivationServiceState>,
    headers: HeaderMap,
    body: Result<Json<EnableBody>, JsonRejection>,
) -> ApiResult<ActivationRule> {
    let body = json_body(body)?;
    state
        .store
        .enable(&admin_context(&headers), body.into_request())
        .await
        .map(Json)
        .map_err(api_error)
}

async fn disable(
    State(state): State<ActivationServiceState>,
    headers: HeaderMap,
    body: Result<Json<RuleTarget>, JsonRejection>,
) -> ApiResult<ActivationRule> {
    let body = json_body(body)?;
    state
        .store
        .disable(
            &admin_context(&headers),
            &body.object_pattern,
            body.telemetry_kind,
            &body.tenant_id,
        )
        .await
        .map(Json)
        .map_err(api_error)
}

async fn enable_bulk(
    State(state): State<ActivationServiceState>,
    headers: HeaderMap,
    body: Result<Json<BulkBody>, JsonRejection>,
) -> ApiResult<BulkOutcome> {
    let body = json_body(body)?;
    let duration = body.duration_minutes.map(minutes).transpose().map_err(api_error)?;
    let outcome = state
        .store
        .enable_bulk(
            &admin_context(&headers),
            &body.patterns,
            body.telemetry_kind,
            &body.tenant_id,
            body.sampling_rate,
            duration,
        )
        .await;
    Ok(Json(outcome))
}

async fn disable_all(
    State(state): State<ActivationServiceState>,
    headers: HeaderMap,
    body: Result<Json<DisableAllBody>, JsonRejection>,
) -> ApiResult<serde_json::Value> {
    let body = json_body(body)?;
    let disabled = state
        .store
        .disable_all(&admin_context(&headers), &body.tenant_id, body.telemetry_kind)
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "disabled": disabled })))
}

async fn decide(
    State(state): State<ActivationServiceState>,
    body: Result<Json<DecisionBody>, JsonRejection>,
) -> ApiResult<Decision> {
    let body = json_body(body)?;
    Ok(Json(state.store.engine().decide(
        &body.object_name,
        body.telemetry_kind,
        &body.tenant_id,
        body.log_level,
    )))
}

async fn summary(
    State(state): State<ActivationServiceState>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Vec<ActivationSummary>> {
    state
        .store
        .activation_summary(query.tenant.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}

async fn active(
    State(state): State<ActivationServiceState>,
    query: Result<Query<ActiveQuery>, QueryRejection>,
) -> ApiResult<Vec<ActiveConfiguration>> {
    let query = query_params(query)?;
    state
        .store
        .active_configurations(query.tenant.as_deref(), query.kind)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn changes(
    State(state): State<ActivationServiceState>,
    query: Result<Query<ChangesQuery>, QueryRejection>,
) -> ApiResult<Vec<AuditRecord>> {
    let query = query_params(query)?;
    state
        .store
        .recent_changes(query.hours, query.tenant.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}

async fn expire(State(state): State<ActivationServiceState>) -> ApiResult<serde_json::Value> {
    let expired = state.store.expire_stale_rules().await.map_err(api_error)?;
    Ok(Json(serde_json::json!({ "expired": expired })))
}

async fn purge(
    State(state): State<ActivationServiceState>,
    query: Result<Query<PurgeQuery>, QueryRejection>,
) -> ApiResult<PurgeReport> {
    let query = query_params(query)?;
    state
        .store
        .purge_old_records(query.keep_days.unwrap_or(state.keep_days))
        .await
        .map(Json)
        .map_err(api_error)
}
