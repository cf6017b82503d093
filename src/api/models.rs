/// Workflow model management REST API endpoints
///
/// Provides CRUD operations for model definitions with hot-reload support. Models
/// are assembled before they are stored, so a definition that can never run is
/// rejected with 422. Automation chains (Lua scripts) are registered here too.

use crate::{
    api::{api_error, ApiError, AppState},
    error::GraphAssemblyError,
    workflow::types::WorkflowModel,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Response for model creation/update operations
#[derive(Debug, Serialize)]
pub struct ModelResponse {
    pub id: String,
    pub message: String,
    pub start_node_id: String,
    pub unreachable_node_ids: Vec<String>,
}

/// Request body for model creation and update
#[derive(Debug, Deserialize)]
pub struct SaveModelRequest {
    pub model: WorkflowModel,
}

/// Request body for chain registration
#[derive(Debug, Deserialize)]
pub struct SaveChainRequest {
    pub script: String,
}

pub fn create_model_routes() -> Router<AppState> {
    Router::new()
        .route("/api/models", post(create_model).get(list_models))
        .route(
            "/api/models/{id}",
            get(get_model).put(update_model).delete(delete_model),
        )
        .route("/api/chains", get(list_chains))
        .route("/api/chains/{id}", put(save_chain))
}

/// Create a new model
///
/// POST /api/models
/// Body: { "model": { "id": "...", "name": "...", "nodes": [...] } }
async fn create_model(
    State(state): State<AppState>,
    Json(payload): Json<SaveModelRequest>,
) -> Result<Json<ModelResponse>, ApiError> {
    let model = payload.model;
    if model.id.is_empty() || model.name.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "model id and name are required"));
    }

    match state.registry.storage().get_model(&model.id).await {
        Ok(Some(_)) => {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("model '{}' already exists", model.id),
            ))
        }
        Ok(None) => {}
        Err(e) => return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }

    save(&state, model, "created").await
}

/// List all models
///
/// GET /api/models
/// Returns: { "models": [{ "id": "...", "name": "...", "updated_at": "..." }] }
async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match state.registry.storage().list_models().await {
        Ok(models) => Ok(Json(json!({ "models": models }))),
        Err(e) => {
            tracing::error!("Failed to list models: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// GET /api/models/{id}
async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowModel>, ApiError> {
    match state.registry.get_model(&id) {
        Some(compiled) => Ok(Json((*compiled.model).clone())),
        None => Err(api_error(StatusCode::NOT_FOUND, format!("model '{}' not found", id))),
    }
}

/// Update an existing model; running instances keep the nodes they started with
///
/// PUT /api/models/{id}
async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SaveModelRequest>,
) -> Result<Json<ModelResponse>, ApiError> {
    let mut model = payload.model;
    model.id = id.clone();
    if model.name.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "model name is required"));
    }
    if !state.registry.contains(&id) {
        return Err(api_error(StatusCode::NOT_FOUND, format!("model '{}' not found", id)));
    }

    save(&state, model, "updated").await
}

/// DELETE /api/models/{id}
async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.registry.remove_model(&id).await {
        Ok(true) => {
            tracing::info!("🗑️ Deleted model: {}", id);
            Ok(Json(json!({ "message": "Model deleted successfully" })))
        }
        Ok(false) => Err(api_error(StatusCode::NOT_FOUND, format!("model '{}' not found", id))),
        Err(e) => {
            tracing::error!("Failed to delete model {}: {}", id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// Register or replace a Lua chain
///
/// PUT /api/chains/{id}
/// Body: { "script": "WorkflowVariables.approved = true" }
async fn save_chain(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SaveChainRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Err(e) = state.registry.storage().save_chain(&id, &payload.script).await {
        tracing::error!("Failed to save chain {}: {}", id, e);
        return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e));
    }
    state.scripting.register_chain(id.clone(), payload.script);

    tracing::info!("🔥 Registered chain: {}", id);
    Ok(Json(json!({ "id": id, "message": "Chain saved successfully" })))
}

/// GET /api/chains
async fn list_chains(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "chains": state.scripting.chain_ids() }))
}

async fn save(state: &AppState, model: WorkflowModel, verb: &str) -> Result<Json<ModelResponse>, ApiError> {
    let name = model.name.clone();
    let compiled = match state.registry.save_model(model).await {
        Ok(compiled) => compiled,
        Err(e) if e.downcast_ref::<GraphAssemblyError>().is_some() => {
            tracing::warn!("⚠️ Rejected model definition: {:#}", e);
            return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, format!("{:#}", e)));
        }
        Err(e) => {
            tracing::error!("Failed to save model: {}", e);
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e));
        }
    };

    Ok(Json(ModelResponse {
        id: compiled.model.id.clone(),
        message: format!("Model '{}' {} successfully", name, verb),
        start_node_id: compiled.start_node_id,
        unreachable_node_ids: compiled.unreachable_node_ids,
    }))
}
