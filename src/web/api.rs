//! Orchestrator control surface under `/api/orchestrator`.

use crate::orchestrator::{CancelDisposition, Orchestrator, OrchestratorError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ottoflow_shared::api_models::{ActiveJobsResponse, HealthState, StatusResponse};
use ottoflow_shared::model::{JobId, PrinterId};
use serde_json::json;
use std::sync::Arc;

/// Helper to create a JSON error response with a message and status code
fn json_error(message: &str, status: StatusCode) -> axum::response::Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub struct AppStateInner {
    pub orchestrator: Orchestrator,
}
pub type AppState = Arc<AppStateInner>;

pub fn create_router(orchestrator: Orchestrator) -> Router {
    create_router_with_state(Arc::new(AppStateInner { orchestrator }))
}

pub fn create_router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/api/orchestrator/status", get(get_status))
        .route("/api/orchestrator/health", get(get_health))
        .route("/api/orchestrator/active-jobs", get(get_active_jobs))
        .route("/api/orchestrator/active-workflows", get(get_active_workflows))
        .route("/api/orchestrator/statistics", get(get_statistics))
        .route("/api/orchestrator/job-processing/enable", post(enable_processing))
        .route("/api/orchestrator/job-processing/disable", post(disable_processing))
        .route("/api/orchestrator/trigger-processing", post(trigger_processing))
        .route("/api/orchestrator/invalidate-cache", post(invalidate_cache))
        .route("/api/orchestrator/jobs/{id}/cancel", post(cancel_job))
        .route("/api/orchestrator/printers/{id}/bed-cleared", post(bed_cleared))
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    Json(StatusResponse {
        initialized: orchestrator.is_initialized(),
        processing: orchestrator.get_job_processing_status(),
        statistics: orchestrator.get_stats(),
    })
}

async fn get_health(State(state): State<AppState>) -> axum::response::Response {
    let report = state.orchestrator.health_check().await;
    let status = match report.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

async fn get_active_jobs(State(state): State<AppState>) -> Json<ActiveJobsResponse> {
    Json(ActiveJobsResponse {
        active: state.orchestrator.active_workflows(),
        recent: state.orchestrator.history(),
    })
}

async fn get_active_workflows(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.active_workflows())
}

async fn get_statistics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.get_stats())
}

async fn enable_processing(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.enable_job_processing();
    Json(state.orchestrator.get_job_processing_status())
}

async fn disable_processing(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.disable_job_processing();
    Json(state.orchestrator.get_job_processing_status())
}

async fn trigger_processing(State(state): State<AppState>) -> axum::response::Response {
    if state.orchestrator.trigger_job_processing() {
        (StatusCode::ACCEPTED, Json(json!({ "triggered": true }))).into_response()
    } else {
        json_error("job processing is disabled", StatusCode::CONFLICT)
    }
}

async fn invalidate_cache(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.invalidate_all_caches().await;
    Json(json!({ "invalidated": true }))
}

async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<JobId>) -> axum::response::Response {
    match state.orchestrator.cancel_job(job_id).await {
        Ok(disposition) => {
            let status = match disposition {
                CancelDisposition::Cancelled => StatusCode::OK,
                CancelDisposition::Requested | CancelDisposition::Deferred => StatusCode::ACCEPTED,
            };
            (status, Json(json!({ "job_id": job_id, "result": disposition }))).into_response()
        }
        Err(OrchestratorError::JobNotFound(_)) => json_error("job not found", StatusCode::NOT_FOUND),
        Err(e @ OrchestratorError::AlreadyFinished { .. }) => json_error(&e.to_string(), StatusCode::CONFLICT),
        Err(e) => {
            tracing::error!(job_id, "cancel failed: {}", e);
            json_error(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn bed_cleared(State(state): State<AppState>, Path(printer_id): Path<PrinterId>) -> axum::response::Response {
    if state.orchestrator.mark_bed_cleared(printer_id) {
        (StatusCode::OK, Json(json!({ "printer_id": printer_id, "cleared": true }))).into_response()
    } else {
        json_error("printer is not waiting for a bed clear", StatusCode::CONFLICT)
    }
}
