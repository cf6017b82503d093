/// Deferred collaborator side effects
///
/// A pass runs against a working copy of its instance. Everything it would ask of
/// the task service, the permission service, the event sink or a child instance is
/// recorded here instead, and handed to the collaborators only once the pass (or,
/// inside the routing service, the whole operation) has been committed. A failed
/// pass drops its effects together with its working copy, so the outside world
/// never sees a task, grant or event the instance itself does not know about.

use crate::runtime::collaborators::{Collaborators, Task};
use serde_json::Value;
use std::cell::RefCell;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    CreateTasks(Vec<Task>),
    EndTask {
        task_id: String,
        actor: String,
        comment: Option<String>,
    },
    CancelTask(String),
    ReassignTask {
        task_id: String,
        actors: Vec<String>,
        comment: Option<String>,
    },
    DelegateTask {
        task_id: String,
        actors: Vec<String>,
        comment: Option<String>,
    },
    Grant {
        grant: String,
        documents: Vec<String>,
        actors: Vec<String>,
        permission: String,
    },
    Revoke {
        grant: String,
        documents: Vec<String>,
    },
    CancelSubRoute(String),
    Event {
        name: String,
        properties: Value,
    },
}

/// Ordered effect log of one pass or one service operation
#[derive(Debug, Default)]
pub struct Effects {
    pending: RefCell<Vec<Effect>>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, effect: Effect) {
        self.pending.borrow_mut().push(effect);
    }

    /// Move every effect of `other` to the end of this log
    pub fn append(&self, other: Effects) {
        self.pending.borrow_mut().extend(other.pending.into_inner());
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Effect> {
        self.pending.borrow().clone()
    }

    /// Remove the child cancellations, leaving every other effect in place
    pub fn take_sub_route_cancels(&self) -> Vec<String> {
        let mut canceled = Vec::new();
        self.pending.borrow_mut().retain(|effect| match effect {
            Effect::CancelSubRoute(child) => {
                canceled.push(child.clone());
                false
            }
            _ => true,
        });
        canceled
    }

    /// Hand the effects to the collaborators in recording order
    ///
    /// The owning state is already committed at this point, so a failing call is
    /// logged and the remaining effects are still applied. Returns the number of
    /// failed calls.
    pub fn apply(self, collaborators: &Collaborators) -> usize {
        let mut failed = 0;
        for effect in self.pending.into_inner() {
            let result = match &effect {
                Effect::CreateTasks(tasks) => collaborators.tasks.create_tasks(tasks),
                Effect::EndTask {
                    task_id,
                    actor,
                    comment,
                } => collaborators
                    .tasks
                    .end_task(task_id, actor, comment.as_deref())
                    .map(|_| ()),
                Effect::CancelTask(task_id) => collaborators.tasks.cancel_task(task_id),
                Effect::ReassignTask {
                    task_id,
                    actors,
                    comment,
                } => collaborators
                    .tasks
                    .reassign_task(task_id, actors, comment.as_deref())
                    .map(|_| ()),
                Effect::DelegateTask {
                    task_id,
                    actors,
                    comment,
                } => collaborators
                    .tasks
                    .delegate_task(task_id, actors, comment.as_deref())
                    .map(|_| ()),
                Effect::Grant {
                    grant,
                    documents,
                    actors,
                    permission,
                } => collaborators
                    .permissions
                    .grant_permission(grant, documents, actors, permission),
                Effect::Revoke { grant, documents } => {
                    collaborators.permissions.revoke_permission(grant, documents)
                }
                Effect::CancelSubRoute(child) => collaborators.sub_routes.cancel_sub_route(child),
                Effect::Event { name, properties } => {
                    collaborators.events.emit_event(name, properties.clone());
                    Ok(())
                }
            };
            if let Err(e) = result {
                failed += 1;
                tracing::warn!("⚠️ Failed to apply {:?}: {}", effect, e);
            }
        }
        failed
    }
}
