/// Suspend/resume bridge
///
/// Everything that crosses from a node to the outside world while it is suspended
/// goes through here: creating tasks (assignees, due date, document grants),
/// recording task completion, canceling tasks, reassignment and delegation, and
/// launching or canceling sub-routes. Calls to the task, permission and event
/// services (and child cancellations) are recorded as [`Effect`]s and reach the
/// collaborators only after the pass commits; sub-route launches go out directly
/// because the child id is needed right away.

use crate::{
    error::{CollaboratorError, EngineError, EngineResult},
    runtime::{
        collaborators::{Collaborators, NodeContext, SubRouteRequest, TaskRequest},
        effects::{Effect, Effects},
    },
    workflow::types::{NodeId, ParentLink, TaskInfo, Variables, WorkflowInstance},
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

const EXPR_PREFIX: &str = "expr:";

pub(crate) struct Bridge<'a> {
    collaborators: &'a Collaborators,
    effects: &'a Effects,
}

impl<'a> Bridge<'a> {
    pub fn new(collaborators: &'a Collaborators, effects: &'a Effects) -> Self {
        Self {
            collaborators,
            effects,
        }
    }

    /// Create the node's tasks and grant its permission to their actors
    pub fn create_tasks(&self, instance: &mut WorkflowInstance, node: NodeId) -> EngineResult<Vec<String>> {
        let scope = NodeContext::capture(instance, node).scope();
        let record = instance.node(node);
        let config = record.task.clone();

        let mut actors = config.assignees.clone();
        if let Some(expr) = &config.assignees_expr {
            let value = self.collaborators.expressions.evaluate(expr, &scope)?;
            actors.extend(parse_assignees(expr, value)?);
        }
        let mut seen = std::collections::HashSet::new();
        actors.retain(|a| !a.is_empty() && seen.insert(a.clone()));
        if actors.is_empty() {
            return Err(EngineError::NoTaskAssignees(record.id.clone()));
        }

        let due_date = match &config.due_date_expr {
            Some(expr) => {
                let value = self.collaborators.expressions.evaluate(expr, &scope)?;
                parse_due_date(expr, value)?
            }
            None => None,
        };

        let request = TaskRequest {
            instance_id: instance.id.clone(),
            node_id: record.id.clone(),
            actors,
            due_date,
            directive: config.directive.clone(),
            documents: instance.documents.clone(),
            one_per_actor: record.kind.has_multiple_tasks,
        };
        let tasks = request.into_tasks();

        let record = instance.node_mut(node);
        record.task_due_date = due_date;
        for task in &tasks {
            record.tasks.push(TaskInfo::open(&task.id));
        }
        self.effects.record(Effect::CreateTasks(tasks.clone()));

        if let Some(permission) = &config.permission {
            for task in &tasks {
                self.effects.record(Effect::Grant {
                    grant: task.id.clone(),
                    documents: instance.documents.clone(),
                    actors: task.actors.clone(),
                    permission: permission.clone(),
                });
            }
        }

        for task in &tasks {
            self.emit(
                "afterWorkflowTaskCreated",
                instance,
                Some(node),
                json!({"taskId": task.id, "actors": task.actors, "dueDate": task.due_date}),
            );
        }

        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// End one task: close it in the task service, revoke its grant, record the outcome
    pub fn complete_task(
        &self,
        instance: &mut WorkflowInstance,
        node: NodeId,
        task_id: &str,
        actor: &str,
        status: Option<&str>,
        comment: Option<&str>,
    ) {
        self.effects.record(Effect::EndTask {
            task_id: task_id.to_string(),
            actor: actor.to_string(),
            comment: comment.map(str::to_string),
        });
        if instance.node(node).task.permission.is_some() {
            self.effects.record(Effect::Revoke {
                grant: task_id.to_string(),
                documents: instance.documents.clone(),
            });
        }
        instance
            .node_mut(node)
            .end_task_info(task_id, Some(actor), status, comment);

        self.emit(
            "workflowTaskCompleted",
            instance,
            Some(node),
            json!({"taskId": task_id, "actor": actor, "status": status, "comment": comment}),
        );
    }

    /// Cancel every open task of the node
    pub fn cancel_open_tasks(&self, instance: &mut WorkflowInstance, node: NodeId) {
        let revoke = instance.node(node).task.permission.is_some();
        for task_id in instance.node(node).open_task_ids() {
            self.effects.record(Effect::CancelTask(task_id.clone()));
            if revoke {
                self.effects.record(Effect::Revoke {
                    grant: task_id.clone(),
                    documents: instance.documents.clone(),
                });
            }
            instance.node_mut(node).end_task_info(&task_id, None, None, None);
            self.emit(
                "workflowTaskCanceled",
                instance,
                Some(node),
                json!({"taskId": task_id}),
            );
        }
    }

    /// Cancel the child instance launched by the node, if any
    pub fn cancel_sub_route(&self, instance: &mut WorkflowInstance, node: NodeId) {
        if let Some(child) = instance.node_mut(node).sub_route_instance_id.take() {
            tracing::debug!("✂️ Canceling sub-route {}", child);
            self.effects.record(Effect::CancelSubRoute(child));
        }
    }

    /// Start the sub-routes registered during a pass
    pub fn launch_sub_routes(&self, instance: &mut WorkflowInstance, nodes: &[NodeId]) -> EngineResult<()> {
        for &node in nodes {
            let Some(config) = instance.node(node).kind.sub_route.clone() else {
                continue;
            };
            let scope = NodeContext::capture(instance, node).scope();

            let model_id = match self.resolve(&config.model, &scope)? {
                Value::String(id) if !id.is_empty() => id,
                other => return Err(EngineError::UnknownModel(other.to_string())),
            };
            let mut variables = Variables::new();
            for (name, raw) in &config.variables {
                variables.insert(name.clone(), self.resolve(raw, &scope)?);
            }

            let request = SubRouteRequest {
                model_id: model_id.clone(),
                parent: ParentLink {
                    instance_id: instance.id.clone(),
                    node_id: instance.node(node).id.clone(),
                },
                documents: instance.documents.clone(),
                initiator: instance.initiator.clone(),
                variables,
            };
            let child = self.collaborators.sub_routes.start_sub_route(request)?;
            tracing::info!(
                "🌱 Node {} launched sub-route {} ({})",
                instance.node(node).id,
                child,
                model_id
            );
            instance.node_mut(node).sub_route_instance_id = Some(child.clone());
            self.emit(
                "afterSubRouteStarted",
                instance,
                Some(node),
                json!({"subRouteInstanceId": child, "subRouteModelId": model_id}),
            );
        }
        Ok(())
    }

    /// Replace a task's actors, moving the document grant along with it
    pub fn reassign_task(
        &self,
        instance: &mut WorkflowInstance,
        node: NodeId,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
    ) -> EngineResult<()> {
        let record = instance.node(node);
        if !record.task.allow_task_reassignment {
            return Err(EngineError::ReassignmentNotAllowed(record.id.clone()));
        }
        let permission = record.task.permission.clone();

        if actors.is_empty() {
            return Err(CollaboratorError::InvalidAssignees(task_id.to_string()).into());
        }

        if permission.is_some() {
            self.effects.record(Effect::Revoke {
                grant: task_id.to_string(),
                documents: instance.documents.clone(),
            });
        }
        self.effects.record(Effect::ReassignTask {
            task_id: task_id.to_string(),
            actors: actors.to_vec(),
            comment: comment.map(str::to_string),
        });
        if let Some(permission) = permission {
            self.effects.record(Effect::Grant {
                grant: task_id.to_string(),
                documents: instance.documents.clone(),
                actors: actors.to_vec(),
                permission,
            });
        }

        self.emit(
            "afterWorkflowTaskReassigned",
            instance,
            Some(node),
            json!({"taskId": task_id, "actors": actors, "comment": comment}),
        );
        Ok(())
    }

    /// Add delegated actors to a task and grant them the node's permission
    pub fn delegate_task(
        &self,
        instance: &mut WorkflowInstance,
        node: NodeId,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
    ) -> EngineResult<()> {
        if actors.is_empty() {
            return Err(CollaboratorError::InvalidAssignees(task_id.to_string()).into());
        }

        self.effects.record(Effect::DelegateTask {
            task_id: task_id.to_string(),
            actors: actors.to_vec(),
            comment: comment.map(str::to_string),
        });
        if let Some(permission) = instance.node(node).task.permission.clone() {
            self.effects.record(Effect::Grant {
                grant: task_id.to_string(),
                documents: instance.documents.clone(),
                actors: actors.to_vec(),
                permission,
            });
        }

        self.emit(
            "afterWorkflowTaskDelegated",
            instance,
            Some(node),
            json!({"taskId": task_id, "delegatedActors": actors, "comment": comment}),
        );
        Ok(())
    }

    /// Emit an event with the instance (and node) identity merged into `extra`
    pub fn emit(&self, name: &str, instance: &WorkflowInstance, node: Option<NodeId>, extra: Value) {
        let mut properties = json!({
            "instanceId": instance.id,
            "modelId": instance.model_id,
            "initiator": instance.initiator,
        });
        if let (Value::Object(target), Some(node)) = (&mut properties, node) {
            target.insert("nodeId".into(), Value::String(instance.node(node).id.clone()));
        }
        if let (Value::Object(target), Value::Object(extra)) = (&mut properties, extra) {
            target.extend(extra);
        }
        self.effects.record(Effect::Event {
            name: name.to_string(),
            properties,
        });
    }

    fn resolve(&self, raw: &str, scope: &Value) -> EngineResult<Value> {
        match raw.strip_prefix(EXPR_PREFIX) {
            Some(expr) => Ok(self.collaborators.expressions.evaluate(expr.trim(), scope)?),
            None => Ok(Value::String(raw.to_string())),
        }
    }
}

fn parse_assignees(expr: &str, value: Value) -> Result<Vec<String>, CollaboratorError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(actor) => Ok(vec![actor]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(actor) => Ok(actor),
                _ => Err(CollaboratorError::InvalidAssignees(expr.to_string())),
            })
            .collect(),
        // An empty Lua table comes back as an empty object
        Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        _ => Err(CollaboratorError::InvalidAssignees(expr.to_string())),
    }
}

/// RFC3339 timestamp, or a number of days from now
fn parse_due_date(expr: &str, value: Value) -> Result<Option<DateTime<Utc>>, CollaboratorError> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => DateTime::parse_from_rfc3339(&text)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|_| CollaboratorError::InvalidDueDate(expr.to_string())),
        Value::Number(days) => days
            .as_f64()
            .filter(|days| days.is_finite())
            // `as` saturates, try_seconds rejects what is out of range
            .and_then(|days| Duration::try_seconds((days * 86_400.0) as i64))
            .and_then(|offset| Utc::now().checked_add_signed(offset))
            .map(Some)
            .ok_or_else(|| CollaboratorError::InvalidDueDate(expr.to_string())),
        _ => Err(CollaboratorError::InvalidDueDate(expr.to_string())),
    }
}
