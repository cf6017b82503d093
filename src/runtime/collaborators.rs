/// Outbound collaborator contracts
///
/// The engine never reaches for global services. Everything it calls out to
/// (automation chains, expression evaluation, tasks, permissions, events and
/// sub-route launches) is injected through a [`Collaborators`] bundle. All calls
/// are synchronous and expected to be fast, in-process operations.

use crate::{
    error::CollaboratorError,
    workflow::types::{NodeId, ParentLink, Variables, WorkflowInstance},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Snapshot of everything a chain or expression may look at
#[derive(Debug, Clone, PartialEq)]
pub struct NodeContext {
    pub instance_id: String,
    pub model_id: String,
    pub node_id: String,
    pub node_state: String,
    pub initiator: String,
    pub documents: Vec<String>,
    pub parent: Option<ParentLink>,
    pub workflow_variables: Variables,
    pub node_variables: Variables,
    pub button: Option<String>,
    pub last_actor: Option<String>,
    /// Transition whose chain is running, if any
    pub transition: Option<String>,
    pub number_of_tasks: usize,
    pub number_of_processed_tasks: usize,
}

impl NodeContext {
    pub fn capture(instance: &WorkflowInstance, node: NodeId) -> Self {
        let record = instance.node(node);
        Self {
            instance_id: instance.id.clone(),
            model_id: instance.model_id.clone(),
            node_id: record.id.clone(),
            node_state: record.state.to_string(),
            initiator: instance.initiator.clone(),
            documents: instance.documents.clone(),
            parent: instance.parent.clone(),
            workflow_variables: instance.variables.clone(),
            node_variables: record.variables.clone(),
            button: record.button.clone(),
            last_actor: record.last_actor.clone(),
            transition: None,
            number_of_tasks: record.tasks.len(),
            number_of_processed_tasks: record.processed_task_count(),
        }
    }

    pub fn with_transition(mut self, transition: impl Into<String>) -> Self {
        self.transition = Some(transition.into());
        self
    }

    /// JSON scope exposed to expressions
    pub fn scope(&self) -> Value {
        let mut node_variables = self.node_variables.clone();
        node_variables.insert("button".into(), json!(self.button));
        node_variables.insert("lastActor".into(), json!(self.last_actor));
        node_variables.insert("numberOfTasks".into(), json!(self.number_of_tasks));
        node_variables.insert(
            "numberOfProcessedTasks".into(),
            json!(self.number_of_processed_tasks),
        );

        json!({
            "WorkflowVariables": self.workflow_variables,
            "NodeVariables": node_variables,
            "workflowInstanceId": self.instance_id,
            "workflowModelId": self.model_id,
            "workflowInitiator": self.initiator,
            "workflowParent": self.parent.as_ref().map(|p| p.instance_id.clone()),
            "workflowParentNode": self.parent.as_ref().map(|p| p.node_id.clone()),
            "nodeId": self.node_id,
            "state": self.node_state,
            "documents": self.documents,
            "transition": self.transition,
        })
    }
}

/// Variable updates produced by a chain; keys are upserted into each scope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableChanges {
    pub workflow: Variables,
    pub node: Variables,
}

impl VariableChanges {
    pub fn is_empty(&self) -> bool {
        self.workflow.is_empty() && self.node.is_empty()
    }
}

/// Runs named automation chains
pub trait ChainExecutor: Send + Sync {
    fn execute_chain(
        &self,
        chain_id: &str,
        context: &NodeContext,
    ) -> Result<VariableChanges, CollaboratorError>;
}

/// Evaluates conditions and value expressions against a JSON scope
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, CollaboratorError>;

    fn evaluate_condition(&self, expression: &str, scope: &Value) -> Result<bool, CollaboratorError> {
        match self.evaluate(expression, scope)? {
            Value::Bool(b) => Ok(b),
            _ => Err(CollaboratorError::NotBoolean(expression.to_string())),
        }
    }
}

/// Status of an external task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Opened,
    Ended,
    Canceled,
}

/// Human task as seen by the task service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub instance_id: String,
    pub node_id: String,
    pub actors: Vec<String>,
    #[serde(default)]
    pub delegated_actors: Vec<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub directive: Option<String>,
    pub documents: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub ended_by: Option<String>,
}

/// Parameters for task creation
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub instance_id: String,
    pub node_id: String,
    pub actors: Vec<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub directive: Option<String>,
    pub documents: Vec<String>,
    /// One task per actor instead of one shared task
    pub one_per_actor: bool,
}

impl TaskRequest {
    /// One shared task, or one task per actor, with fresh ids
    pub fn into_tasks(self) -> Vec<Task> {
        let groups: Vec<Vec<String>> = if self.one_per_actor {
            self.actors.iter().map(|a| vec![a.clone()]).collect()
        } else {
            vec![self.actors.clone()]
        };

        let created_at = Utc::now();
        groups
            .into_iter()
            .map(|actors| Task {
                id: Uuid::new_v4().to_string(),
                instance_id: self.instance_id.clone(),
                node_id: self.node_id.clone(),
                actors,
                delegated_actors: Vec::new(),
                due_date: self.due_date,
                directive: self.directive.clone(),
                documents: self.documents.clone(),
                status: TaskStatus::Opened,
                created_at,
                comment: None,
                ended_by: None,
            })
            .collect()
    }
}

/// Human task inbox
///
/// Task ids are allocated by the engine; `create_tasks` only registers them.
pub trait TaskService: Send + Sync {
    fn create_tasks(&self, tasks: &[Task]) -> Result<(), CollaboratorError>;

    fn end_task(
        &self,
        task_id: &str,
        actor: &str,
        comment: Option<&str>,
    ) -> Result<Task, CollaboratorError>;

    fn cancel_task(&self, task_id: &str) -> Result<(), CollaboratorError>;

    fn reassign_task(
        &self,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
    ) -> Result<Task, CollaboratorError>;

    fn delegate_task(
        &self,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
    ) -> Result<Task, CollaboratorError>;

    fn task(&self, task_id: &str) -> Option<Task>;
}

/// Document access control for task actors
///
/// Grants are named so that the grant made for one task can be revoked without
/// touching the others.
pub trait PermissionService: Send + Sync {
    fn grant_permission(
        &self,
        grant: &str,
        documents: &[String],
        actors: &[String],
        permission: &str,
    ) -> Result<(), CollaboratorError>;

    fn revoke_permission(&self, grant: &str, documents: &[String]) -> Result<(), CollaboratorError>;
}

/// Audit and notification events
pub trait EventSink: Send + Sync {
    fn emit_event(&self, name: &str, properties: Value);
}

/// Parameters for launching a child instance
#[derive(Debug, Clone, PartialEq)]
pub struct SubRouteRequest {
    pub model_id: String,
    pub parent: ParentLink,
    pub documents: Vec<String>,
    pub initiator: String,
    pub variables: Variables,
}

/// Launches and cancels child workflow instances
pub trait SubRouteLauncher: Send + Sync {
    fn start_sub_route(&self, request: SubRouteRequest) -> Result<String, CollaboratorError>;

    fn cancel_sub_route(&self, instance_id: &str) -> Result<(), CollaboratorError>;
}

/// Injected collaborator set shared by the engine and the bridge
#[derive(Clone)]
pub struct Collaborators {
    pub chains: Arc<dyn ChainExecutor>,
    pub expressions: Arc<dyn ExpressionEvaluator>,
    pub tasks: Arc<dyn TaskService>,
    pub permissions: Arc<dyn PermissionService>,
    pub events: Arc<dyn EventSink>,
    pub sub_routes: Arc<dyn SubRouteLauncher>,
}

impl Collaborators {
    pub fn with_sub_routes(mut self, sub_routes: Arc<dyn SubRouteLauncher>) -> Self {
        self.sub_routes = sub_routes;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Launcher for deployments without sub-routes; every launch fails
#[derive(Debug, Default)]
pub struct NoSubRoutes;

impl SubRouteLauncher for NoSubRoutes {
    fn start_sub_route(&self, request: SubRouteRequest) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable(format!(
            "sub-routes are not supported here (model {})",
            request.model_id
        )))
    }

    fn cancel_sub_route(&self, _instance_id: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }
}
