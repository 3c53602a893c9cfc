use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{ConfigError, ValidatorConfig};
use crate::scheduler::{EngineMetrics, Scheduler, SchedulerState};
use crate::types::STATUS_RESPONSE_SCHEMA_V1;
use crate::validator::{AntiGamingValidator, ValidatorConfigPatch};

#[derive(Clone)]
pub struct AppState {
    service_name: String,
    scheduler: Arc<Scheduler>,
    validator: Arc<AntiGamingValidator>,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        service_name: String,
        scheduler: Arc<Scheduler>,
        validator: Arc<AntiGamingValidator>,
    ) -> Self {
        Self {
            service_name,
            scheduler,
            validator,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
    scheduler: SchedulerState,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    schema: &'static str,
    service: String,
    scheduler: SchedulerState,
    metrics: EngineMetrics,
    validator: ValidatorConfig,
}

enum ApiError {
    InvalidRequest(String),
}

impl From<ConfigError> for ApiError {
    fn from(error: ConfigError) -> Self {
        Self::InvalidRequest(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/status", get(status))
        .route(
            "/v1/validator/config",
            get(get_validator_config).patch(patch_validator_config),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.service_name.clone(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        scheduler: state.scheduler.state(),
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        schema: STATUS_RESPONSE_SCHEMA_V1,
        service: state.service_name.clone(),
        scheduler: state.scheduler.state(),
        metrics: state.scheduler.metrics().await,
        validator: state.validator.configuration().await,
    })
}

async fn get_validator_config(State(state): State<AppState>) -> Json<ValidatorConfig> {
    Json(state.validator.configuration().await)
}

async fn patch_validator_config(
    State(state): State<AppState>,
    Json(patch): Json<ValidatorConfigPatch>,
) -> Result<Json<ValidatorConfig>, ApiError> {
    Ok(Json(state.validator.update_configuration(patch).await?))
}
