use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use routeway::{
    runtime::LuaScripting,
    server::{build_state, create_router},
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage},
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn app() -> Router {
    let storage = WorkflowStorage::in_memory().await.unwrap();
    let registry = Arc::new(WorkflowRegistry::new(storage));
    create_router(build_state(registry, Arc::new(LuaScripting::new()), 100))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn review_model() -> Value {
    json!({
        "model": {
            "id": "review",
            "name": "Document review",
            "nodes": [
                {"id": "start", "kind": {"start": true}, "transitions": [{"id": "t1", "target": "review"}]},
                {
                    "id": "review",
                    "kind": {"has_task": true},
                    "task": {"assignees": ["bob"], "permission": "ReadWrite"},
                    "transitions": [
                        {"id": "approve", "target": "stop", "condition": "NodeVariables.button == 'approve'", "chain": "approve"},
                        {"id": "reject", "target": "start", "condition": "NodeVariables.button == 'reject'"}
                    ]
                },
                {"id": "stop", "kind": {"stop": true}}
            ]
        }
    })
}

#[tokio::test]
async fn healthz_answers_ok() {
    let app = app().await;
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn model_lifecycle() {
    let app = app().await;

    let (status, body) = send(&app, "POST", "/api/models", Some(review_model())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["start_node_id"], "start");

    let (status, _) = send(&app, "POST", "/api/models", Some(review_model())).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, "GET", "/api/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["models"][0]["id"], "review");

    let (status, body) = send(&app, "GET", "/api/models/review", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"].as_array().unwrap().len(), 3);

    let (status, _) = send(&app, "DELETE", "/api/models/review", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", "/api/models/review", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_models_are_unprocessable() {
    let app = app().await;
    let two_starts = json!({
        "model": {
            "id": "bad",
            "name": "Two starts",
            "nodes": [
                {"id": "a", "kind": {"start": true}},
                {"id": "b", "kind": {"start": true}}
            ]
        }
    });

    let (status, body) = send(&app, "POST", "/api/models", Some(two_starts)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("start node"));

    let dangling = json!({
        "model": {
            "id": "bad",
            "name": "Dangling",
            "nodes": [{"id": "a", "kind": {"start": true}, "transitions": [{"id": "t", "target": "zz"}]}]
        }
    });
    let (status, _) = send(&app, "POST", "/api/models", Some(dangling)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn review_round_trip_over_http() {
    let app = app().await;
    send(&app, "POST", "/api/models", Some(review_model())).await;
    let (status, _) = send(
        &app,
        "PUT",
        "/api/chains/approve",
        Some(json!({"script": "WorkflowVariables.approved = true"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        "POST",
        "/api/models/review/instances",
        Some(json!({"initiator": "alice", "documents": ["doc-1"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["instance"]["status"], "running");
    let instance_id = body["instance"]["id"].as_str().unwrap().to_string();

    let (_, body) = send(&app, "GET", "/api/tasks?actor=bob", None).await;
    let tasks = body["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    let task_id = tasks[0]["id"].as_str().unwrap().to_string();

    // The stop node is not waiting for anything
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/instances/{}/resume", instance_id),
        Some(json!({"target": {"node": "stop"}, "actor": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/tasks/{}/complete", task_id),
        Some(json!({"actor": "bob", "status": "approve", "comment": "looks good"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance"]["status"], "done");
    assert_eq!(body["instance"]["variables"]["approved"], true);

    let (_, body) = send(&app, "GET", &format!("/api/instances/{}/events", instance_id), None).await;
    let names: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["name"].as_str())
        .collect();
    assert_eq!(names.first(), Some(&"afterWorkflowStarted"));
    assert_eq!(names.last(), Some(&"afterWorkflowFinish"));

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/tasks/{}/complete", task_id),
        Some(json!({"actor": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancel_and_missing_instances() {
    let app = app().await;
    send(&app, "POST", "/api/models", Some(review_model())).await;
    let (_, body) = send(
        &app,
        "POST",
        "/api/models/review/instances",
        Some(json!({"initiator": "alice"})),
    )
    .await;
    let instance_id = body["instance"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "POST", &format!("/api/instances/{}/cancel", instance_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance"]["status"], "canceled");

    let (_, body) = send(&app, "GET", "/api/tasks?actor=bob", None).await;
    assert!(body["tasks"].as_array().unwrap().is_empty());

    let (status, _) = send(&app, "GET", "/api/instances/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &app,
        "POST",
        "/api/models/unknown/instances",
        Some(json!({"initiator": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
