//! HTTP request handlers.

use super::AppState;
use crate::monitor::MonitorError;
use crate::scheduler::TriggerConfig;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_LIMIT: usize = 100;

fn error_response(e: MonitorError) -> Response {
    let status = match &e {
        MonitorError::InvalidArgument(_) | MonitorError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
        MonitorError::ServiceNotFound(_)
        | MonitorError::ProcessNotFound { .. }
        | MonitorError::TriggerNotFound(_)
        | MonitorError::NoTriggerAt { .. } => StatusCode::NOT_FOUND,
        MonitorError::Db(_) | MonitorError::Scheduler(_) => {
            tracing::error!("Web: Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string()).into_response()
}

/// Triggers are taken as raw JSON so validation failures map to 400.
fn parse_trigger(body: serde_json::Value) -> Result<TriggerConfig, Response> {
    serde_json::from_value(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid trigger: {}", e)).into_response())
}

// ============================================================================
// Services
// ============================================================================

pub async fn handle_get_services(State(state): State<AppState>) -> impl IntoResponse {
    match state.monitor.list_services() {
        Ok(services) => Json(services).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub endpoint: String,
}

pub async fn handle_create_service(
    State(state): State<AppState>,
    Json(req): Json<CreateServiceRequest>,
) -> impl IntoResponse {
    match state.monitor.create_service(&req.endpoint) {
        Ok(service) => (StatusCode::CREATED, Json(service)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_delete_service(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.monitor.delete_service(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Processes
// ============================================================================

pub async fn handle_get_processes(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.monitor.list_processes(id) {
        Ok(processes) => Json(processes).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateProcessRequest {
    pub identifier: String,
    #[serde(default)]
    pub test_request: Option<String>,
}

pub async fn handle_create_process(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CreateProcessRequest>,
) -> impl IntoResponse {
    match state
        .monitor
        .create_process(id, &req.identifier, req.test_request)
    {
        Ok(process) => (StatusCode::CREATED, Json(process)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_delete_process(
    State(state): State<AppState>,
    Path((id, identifier)): Path<(i64, String)>,
) -> impl IntoResponse {
    match state.monitor.delete_process(id, &identifier) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_pause_process(
    State(state): State<AppState>,
    Path((id, identifier)): Path<(i64, String)>,
) -> impl IntoResponse {
    match state.monitor.pause_monitoring(id, &identifier) {
        Ok(changed) => Json(json!({ "changed": changed })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_resume_process(
    State(state): State<AppState>,
    Path((id, identifier)): Path<(i64, String)>,
) -> impl IntoResponse {
    match state.monitor.resume_monitoring(id, &identifier) {
        Ok(changed) => Json(json!({ "changed": changed })).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Measurements
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MeasurementQuery {
    pub limit: Option<usize>,
    /// Return metric values instead of raw measurements.
    #[serde(default)]
    pub metrics: bool,
    /// Only delete measurements taken before this time.
    pub before: Option<DateTime<Utc>>,
}

pub async fn handle_get_service_measurements(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<MeasurementQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    match state.monitor.get_service_measurements(id, limit) {
        Ok(measurements) => Json(measurements).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_get_measurements(
    State(state): State<AppState>,
    Path((id, identifier)): Path<(i64, String)>,
    Query(query): Query<MeasurementQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);

    if query.metrics {
        return match state.monitor.get_metrics(id, &identifier, limit) {
            Ok(values) => Json(values).into_response(),
            Err(e) => error_response(e),
        };
    }

    match state.monitor.get_measurements(id, &identifier, limit) {
        Ok(measurements) => Json(measurements).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_delete_measurements(
    State(state): State<AppState>,
    Path((id, identifier)): Path<(i64, String)>,
    Query(query): Query<MeasurementQuery>,
) -> impl IntoResponse {
    let deleted = match query.before {
        Some(cutoff) => state
            .monitor
            .delete_measurements_before(id, &identifier, cutoff),
        None => state.monitor.delete_measurements(id, &identifier),
    };

    match deleted {
        Ok(count) => Json(json!({ "deleted": count })).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Triggers
// ============================================================================

pub async fn handle_get_triggers(
    State(state): State<AppState>,
    Path((id, identifier)): Path<(i64, String)>,
) -> impl IntoResponse {
    match state.monitor.list_triggers(id, &identifier) {
        Ok(triggers) => Json(triggers).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_add_trigger(
    State(state): State<AppState>,
    Path((id, identifier)): Path<(i64, String)>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let trigger = match parse_trigger(body) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match state.monitor.add_trigger(id, &identifier, trigger) {
        Ok(saved) => (StatusCode::CREATED, Json(saved)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Triggers are addressed by their position in the process's trigger list.
pub async fn handle_update_trigger(
    State(state): State<AppState>,
    Path((id, identifier, index)): Path<(i64, String, usize)>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let trigger = match parse_trigger(body) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let updated = state
        .monitor
        .trigger_key_at(id, &identifier, index)
        .and_then(|key| state.monitor.update_trigger(&key, trigger));
    match updated {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_delete_trigger(
    State(state): State<AppState>,
    Path((id, identifier, index)): Path<(i64, String, usize)>,
) -> impl IntoResponse {
    let removed = state
        .monitor
        .trigger_key_at(id, &identifier, index)
        .and_then(|key| state.monitor.remove_trigger(&key));
    match removed {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
