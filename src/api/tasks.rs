/// Task inbox endpoints
///
/// Lists open tasks per actor and routes task completion, reassignment and
/// delegation to the owning instance.

use crate::{
    api::{engine_error, ApiError, AppState},
    runtime::{OperationReport, ResumeSignal},
    workflow::types::{Variables, WorkflowInstance},
};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    pub actor: Option<String>,
}

/// Request body for task completion
#[derive(Debug, Deserialize)]
pub struct CompleteTaskRequest {
    pub actor: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub node_variables: Variables,
    #[serde(default)]
    pub workflow_variables: Variables,
}

/// Request body for reassignment and delegation
#[derive(Debug, Deserialize)]
pub struct ActorsRequest {
    pub actors: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

pub fn create_task_routes() -> Router<AppState> {
    Router::new()
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .route("/api/tasks/{id}/reassign", post(reassign_task))
        .route("/api/tasks/{id}/delegate", post(delegate_task))
}

/// GET /api/tasks?actor=bob
///
/// Open tasks of the actor (assigned or delegated); every task without `actor`.
async fn list_tasks(State(state): State<AppState>, Query(query): Query<TaskQuery>) -> Json<Value> {
    let tasks = match &query.actor {
        Some(actor) => state.tasks.open_tasks_for(actor),
        None => state.tasks.all_tasks(),
    };
    Json(json!({ "tasks": tasks }))
}

/// POST /api/tasks/{id}/complete
/// Body: { "actor": "bob", "status": "approve", "comment": "ok" }
async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CompleteTaskRequest>,
) -> Result<Json<OperationReport>, ApiError> {
    let mut signal = ResumeSignal::task(id, request.actor);
    signal.status = request.status;
    signal.comment = request.comment;
    signal.node_variables = request.node_variables;
    signal.workflow_variables = request.workflow_variables;

    let report = state.service.complete_task(signal).await.map_err(engine_error)?;
    Ok(Json(report))
}

/// POST /api/tasks/{id}/reassign
/// Body: { "actors": ["carol"], "comment": "on leave" }
async fn reassign_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ActorsRequest>,
) -> Result<Json<WorkflowInstance>, ApiError> {
    let instance = state
        .service
        .reassign_task(&id, request.actors, request.comment)
        .await
        .map_err(engine_error)?;
    Ok(Json(instance))
}

/// POST /api/tasks/{id}/delegate
async fn delegate_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ActorsRequest>,
) -> Result<Json<WorkflowInstance>, ApiError> {
    let instance = state
        .service
        .delegate_task(&id, request.actors, request.comment)
        .await
        .map_err(engine_error)?;
    Ok(Json(instance))
}
