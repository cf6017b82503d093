/// Instance lifecycle endpoints
///
/// Start an instance of a model, inspect it, deliver resume signals to suspended
/// or waiting nodes, cancel it, run its escalation rules on demand and read the
/// events it emitted.

use crate::{
    api::{api_error, engine_error, ApiError, AppState},
    runtime::{OperationReport, ResumeSignal, StartRequest},
    workflow::types::WorkflowInstance,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

pub fn create_instance_routes() -> Router<AppState> {
    Router::new()
        .route("/api/models/{id}/instances", post(start_instance))
        .route("/api/instances", get(list_instances))
        .route("/api/instances/{id}", get(get_instance))
        .route("/api/instances/{id}/resume", post(resume_instance))
        .route("/api/instances/{id}/cancel", post(cancel_instance))
        .route("/api/instances/{id}/escalate", post(escalate_instance))
        .route("/api/instances/{id}/events", get(instance_events))
}

/// Start an instance and run it until it suspends or finishes
///
/// POST /api/models/{id}/instances
/// Body: { "initiator": "alice", "documents": ["doc-1"], "variables": {...} }
async fn start_instance(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<OperationReport>), ApiError> {
    tracing::info!("📥 Start requested for model {} by {}", model_id, request.initiator);
    let report = state
        .service
        .start(&model_id, request)
        .await
        .map_err(engine_error)?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// GET /api/instances
async fn list_instances(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "instances": state.service.list_instances().await }))
}

/// GET /api/instances/{id}
async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowInstance>, ApiError> {
    state
        .service
        .instance(&id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("instance '{}' not found", id)))
}

/// Deliver a resume signal
///
/// POST /api/instances/{id}/resume
/// Body: { "target": { "node": "review" }, "actor": "bob", "status": "approve", "force": false }
async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(signal): Json<ResumeSignal>,
) -> Result<Json<OperationReport>, ApiError> {
    let report = state.service.resume(&id, signal).await.map_err(engine_error)?;
    Ok(Json(report))
}

/// POST /api/instances/{id}/cancel
async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OperationReport>, ApiError> {
    let report = state.service.cancel(&id).await.map_err(engine_error)?;
    Ok(Json(report))
}

/// POST /api/instances/{id}/escalate
async fn escalate_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let fired = state.service.escalate(&id).await.map_err(engine_error)?;
    Ok(Json(json!({ "id": id, "fired": fired })))
}

/// GET /api/instances/{id}/events
async fn instance_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.service.instance(&id).await.is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("instance '{}' not found", id)));
    }
    Ok(Json(json!({ "events": state.audit.events_for_instance(&id) })))
}
