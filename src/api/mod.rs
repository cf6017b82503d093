/// HTTP API Layer
///
/// This module provides the REST API endpoints for the routing engine:
/// - Workflow model CRUD with hot-reload, and automation chain registration
/// - Instance start, resume, cancel, escalation and audit trail
/// - Task inbox, completion, reassignment and delegation

use crate::{
    error::{CollaboratorError, EngineError},
    runtime::{AuditLog, InMemoryTaskService, LuaScripting, RoutingService},
    workflow::registry::WorkflowRegistry,
};
use axum::{http::StatusCode, response::Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

// Model and chain management endpoints
pub mod models;

// Instance lifecycle endpoints
pub mod instances;

// Task inbox endpoints
pub mod tasks;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Hot-reload registry for workflow models (owns the storage handle)
    pub registry: Arc<WorkflowRegistry>,
    /// Serialized access to workflow instances
    pub service: Arc<RoutingService>,
    /// Task inbox backing the task endpoints
    pub tasks: Arc<InMemoryTaskService>,
    /// Lua chains registry
    pub scripting: Arc<LuaScripting>,
    /// Emitted event history
    pub audit: Arc<AuditLog>,
}

/// Error response: status code plus `{ "error": "..." }`
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

/// Map an engine failure onto an HTTP status
pub(crate) fn engine_error(error: EngineError) -> ApiError {
    let status = match &error {
        EngineError::InstanceNotFound(_)
        | EngineError::UnknownModel(_)
        | EngineError::Collaborator(CollaboratorError::UnknownTask(_)) => StatusCode::NOT_FOUND,
        EngineError::InvalidResumeTarget { .. }
        | EngineError::InstanceNotRunning { .. }
        | EngineError::ReassignmentNotAllowed(_) => StatusCode::CONFLICT,
        EngineError::Storage(_) | EngineError::Collaborator(CollaboratorError::Unavailable(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("❌ {}", error);
    } else {
        tracing::warn!("⚠️ {}", error);
    }
    api_error(status, error)
}

/// All API routes, ready for state injection
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .merge(models::create_model_routes())
        .merge(instances::create_instance_routes())
        .merge(tasks::create_task_routes())
}
