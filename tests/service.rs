mod common;

use common::{model, review_flow, Harness};
use routeway::{
    error::{CollaboratorError, EngineError},
    runtime::{ResumeSignal, RoutingService, StartRequest},
    workflow::{
        registry::WorkflowRegistry, storage::WorkflowStorage, InstanceStatus, NodeRecord, NodeState,
    },
};
use serde_json::json;
use std::sync::Arc;

async fn registry() -> Arc<WorkflowRegistry> {
    let storage = WorkflowStorage::in_memory().await.unwrap();
    Arc::new(WorkflowRegistry::new(storage))
}

fn start_request() -> StartRequest {
    StartRequest {
        documents: vec!["doc-1".into()],
        initiator: "alice".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn start_and_complete_through_service() {
    let h = Harness::new();
    let registry = registry().await;
    registry.save_model(model("review", review_flow())).await.unwrap();
    let service = RoutingService::new(registry, h.collaborators());

    let report = service.start("review", start_request()).await.unwrap();
    assert_eq!(report.instance.status, InstanceStatus::Running);
    assert_eq!(report.outcome.as_ref().unwrap().suspended, vec!["review"]);

    let task = h.task_for("bob");
    let report = service
        .complete_task(ResumeSignal::task(&task, "bob").with_status("approve"))
        .await
        .unwrap();
    assert_eq!(report.instance.status, InstanceStatus::Done);

    let summaries = service.list_instances().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].status, InstanceStatus::Done);
    assert_eq!(summaries[0].open_tasks, 0);
}

#[tokio::test]
async fn unknown_model_and_instance_are_reported() {
    let h = Harness::new();
    let service = RoutingService::new(registry().await, h.collaborators());

    let err = service.start("missing", start_request()).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownModel(ref id) if id == "missing"));

    let err = service.cancel("nope").await.unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotFound(_)));

    let err = service
        .complete_task(ResumeSignal::task("no-such-task", "bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResumeTarget { .. }));
}

#[tokio::test]
async fn finished_sub_route_resumes_parent() {
    let h = Harness::new().with_chain("mark", "WorkflowVariables.reviewed_by = WorkflowVariables.reviewer");
    let registry = registry().await;
    registry
        .save_model(model(
            "child",
            vec![
                NodeRecord::new("s").start().to("review"),
                NodeRecord::new("review").with_task(&["bob"]).output_chain("mark").to("e"),
                NodeRecord::new("e").stop(),
            ],
        ))
        .await
        .unwrap();
    let mut sub = NodeRecord::new("sub").with_sub_route("child").to("end");
    if let Some(config) = sub.kind.sub_route.as_mut() {
        config.variables = vec![
            ("reviewer".into(), "bob".into()),
            ("origin".into(), "expr:workflowInstanceId".into()),
        ];
    }
    registry
        .save_model(model(
            "parent",
            vec![
                NodeRecord::new("start").start().to("sub"),
                sub,
                NodeRecord::new("end").stop(),
            ],
        ))
        .await
        .unwrap();
    let service = RoutingService::new(registry, h.collaborators());

    let parent = service.start("parent", start_request()).await.unwrap().instance;
    let sub = parent.find_node("sub").unwrap();
    assert_eq!(sub.state, NodeState::Suspended);
    let child_id = sub.sub_route_instance_id.clone().unwrap();

    let child = service.instance(&child_id).await.unwrap();
    assert_eq!(child.status, InstanceStatus::Running);
    assert_eq!(child.parent.as_ref().unwrap().instance_id, parent.id);
    assert_eq!(child.parent.as_ref().unwrap().node_id, "sub");
    assert_eq!(child.variables.get("reviewer"), Some(&json!("bob")));
    assert_eq!(child.variables.get("origin"), Some(&json!(parent.id)));

    let task = h.task_for("bob");
    let report = service
        .complete_task(ResumeSignal::task(&task, "bob"))
        .await
        .unwrap();
    assert_eq!(report.instance.id, child_id);
    assert_eq!(report.instance.status, InstanceStatus::Done);

    let parent = service.instance(&parent.id).await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Done);
    assert_eq!(parent.find_node("sub").unwrap().last_actor.as_deref(), Some("alice"));
}

#[tokio::test]
async fn canceling_parent_cancels_child() {
    let h = Harness::new();
    let registry = registry().await;
    registry.save_model(model("child", review_flow())).await.unwrap();
    registry
        .save_model(model(
            "parent",
            vec![
                NodeRecord::new("start").start().to("sub"),
                NodeRecord::new("sub").with_sub_route("child").to("end"),
                NodeRecord::new("end").stop(),
            ],
        ))
        .await
        .unwrap();
    let service = RoutingService::new(registry, h.collaborators());

    let parent = service.start("parent", start_request()).await.unwrap().instance;
    let child_id = parent
        .find_node("sub")
        .unwrap()
        .sub_route_instance_id
        .clone()
        .unwrap();

    let report = service.cancel(&parent.id).await.unwrap();
    assert_eq!(report.instance.status, InstanceStatus::Canceled);
    let child = service.instance(&child_id).await.unwrap();
    assert_eq!(child.status, InstanceStatus::Canceled);
    assert!(h.tasks.open_tasks_for("bob").is_empty());
}

#[tokio::test]
async fn forced_parent_resume_cancels_running_child() {
    let h = Harness::new();
    let registry = registry().await;
    registry.save_model(model("child", review_flow())).await.unwrap();
    registry
        .save_model(model(
            "parent",
            vec![
                NodeRecord::new("start").start().to("sub"),
                NodeRecord::new("sub").with_sub_route("child").to("end"),
                NodeRecord::new("end").stop(),
            ],
        ))
        .await
        .unwrap();
    let service = RoutingService::new(registry, h.collaborators());

    let parent = service.start("parent", start_request()).await.unwrap().instance;
    let child_id = parent
        .find_node("sub")
        .unwrap()
        .sub_route_instance_id
        .clone()
        .unwrap();

    let err = service
        .resume(&parent.id, ResumeSignal::node("sub", "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResumeTarget { .. }));
    assert_eq!(service.instance(&child_id).await.unwrap().status, InstanceStatus::Running);

    let report = service
        .resume(&parent.id, ResumeSignal::node("sub", "admin").forced())
        .await
        .unwrap();
    assert_eq!(report.instance.status, InstanceStatus::Done);
    let child = service.instance(&child_id).await.unwrap();
    assert_eq!(child.status, InstanceStatus::Canceled);
    assert!(h.tasks.open_tasks_for("bob").is_empty());
}

#[tokio::test]
async fn sub_route_to_unknown_model_fails_whole_start() {
    let h = Harness::new();
    let registry = registry().await;
    registry
        .save_model(model(
            "parent",
            vec![
                NodeRecord::new("start").start().to("sub"),
                NodeRecord::new("sub").with_sub_route("ghost").to("end"),
                NodeRecord::new("end").stop(),
            ],
        ))
        .await
        .unwrap();
    let service = RoutingService::new(registry, h.collaborators());

    let err = service.start("parent", start_request()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Collaborator(CollaboratorError::UnknownSubRouteModel(ref id)) if id == "ghost"
    ));
    assert!(service.list_instances().await.is_empty());
}

#[tokio::test]
async fn concurrent_task_completions_are_serialized() {
    let h = Harness::new();
    let registry = registry().await;
    registry
        .save_model(model(
            "pair",
            vec![
                NodeRecord::new("start").start().to("review"),
                NodeRecord::new("review")
                    .with_multiple_tasks(&["bob", "carol"])
                    .to("stop"),
                NodeRecord::new("stop").stop(),
            ],
        ))
        .await
        .unwrap();
    let service = Arc::new(RoutingService::new(registry, h.collaborators()));
    let id = service.start("pair", start_request()).await.unwrap().instance.id;

    let bob = h.task_for("bob");
    let carol = h.task_for("carol");
    let (first, second) = tokio::join!(
        {
            let service = Arc::clone(&service);
            async move { service.complete_task(ResumeSignal::task(&bob, "bob")).await }
        },
        {
            let service = Arc::clone(&service);
            async move { service.complete_task(ResumeSignal::task(&carol, "carol")).await }
        }
    );
    let deferred = [first.unwrap(), second.unwrap()]
        .iter()
        .filter(|r| r.outcome.as_ref().map(|o| o.deferred).unwrap_or(false))
        .count();
    assert_eq!(deferred, 1);

    let instance = service.instance(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Done);
    let review = instance.find_node("review").unwrap();
    assert_eq!(review.count, 1);
    assert_eq!(review.processed_task_count(), 2);
}

#[tokio::test]
async fn instances_survive_reload() {
    let h = Harness::new();
    let registry = registry().await;
    registry.save_model(model("review", review_flow())).await.unwrap();
    let service = RoutingService::new(Arc::clone(&registry), h.collaborators());
    let started = service.start("review", start_request()).await.unwrap().instance;

    let reloaded = RoutingService::new(registry, h.collaborators());
    assert_eq!(reloaded.load_from_storage().await.unwrap(), 1);
    let restored = reloaded.instance(&started.id).await.unwrap();
    assert_eq!(restored, started);

    let task = h.task_for("bob");
    let report = reloaded
        .complete_task(ResumeSignal::task(&task, "bob"))
        .await
        .unwrap();
    assert_eq!(report.instance.status, InstanceStatus::Done);
}

#[tokio::test]
async fn failed_resume_keeps_committed_state() {
    let h = Harness::new();
    let registry = registry().await;
    registry
        .save_model(model(
            "broken",
            vec![
                NodeRecord::new("start").start().to("review"),
                NodeRecord::new("review")
                    .with_task(&["bob"])
                    .transition(routeway::TransitionRecord::new("never", "stop").when("false")),
                NodeRecord::new("stop").stop(),
            ],
        ))
        .await
        .unwrap();
    let service = RoutingService::new(Arc::clone(&registry), h.collaborators());
    let started = service.start("broken", start_request()).await.unwrap().instance;

    let task = h.task_for("bob");
    let err = service
        .complete_task(ResumeSignal::task(&task, "bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoTransitionFired(_)));

    assert_eq!(service.instance(&started.id).await.unwrap(), started);
    let stored = registry.storage().get_instance(&started.id).await.unwrap().unwrap();
    assert_eq!(stored, started);
    assert_eq!(h.task_for("bob"), task);
    assert!(!h.audit.event_names().iter().any(|n| n == "workflowTaskCompleted"));
}

#[tokio::test]
async fn escalations_run_across_instances() {
    let h = Harness::new().with_chain("flag", "WorkflowVariables.late = true");
    let registry = registry().await;
    let mut review = NodeRecord::new("review").with_task(&["bob"]).to("stop");
    review.escalation_rules.push(routeway::workflow::types::EscalationRule {
        id: "late".into(),
        condition: "true".into(),
        chain: "flag".into(),
        multiple_execution: false,
        executed: false,
        last_execution: None,
    });
    registry
        .save_model(model(
            "review",
            vec![NodeRecord::new("start").start().to("review"), review, NodeRecord::new("stop").stop()],
        ))
        .await
        .unwrap();
    let service = RoutingService::new(registry, h.collaborators());
    let first = service.start("review", start_request()).await.unwrap().instance;
    service.start("review", start_request()).await.unwrap();

    assert_eq!(service.run_escalations().await.unwrap(), 2);
    assert_eq!(service.run_escalations().await.unwrap(), 0);
    let first = service.instance(&first.id).await.unwrap();
    assert_eq!(first.variables.get("late"), Some(&json!(true)));
}
