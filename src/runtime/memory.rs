/// In-process collaborator implementations
///
/// Task inbox, document ACLs and an audit log kept in memory. The server wires
/// these in by default; tests use them to observe what the engine asked for.

use crate::{
    error::CollaboratorError,
    runtime::collaborators::{
        EventSink, PermissionService, Task, TaskService, TaskStatus,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, RwLock},
};

fn poisoned(what: &str) -> CollaboratorError {
    CollaboratorError::Unavailable(format!("{} lock poisoned", what))
}

/// Task inbox keyed by task id
#[derive(Debug, Default)]
pub struct InMemoryTaskService {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open tasks assigned or delegated to `actor`, oldest first
    pub fn open_tasks_for(&self, actor: &str) -> Vec<Task> {
        self.filtered(|t| {
            t.status == TaskStatus::Opened
                && (t.actors.iter().any(|a| a == actor) || t.delegated_actors.iter().any(|a| a == actor))
        })
    }

    pub fn tasks_for_instance(&self, instance_id: &str) -> Vec<Task> {
        self.filtered(|t| t.instance_id == instance_id)
    }

    pub fn all_tasks(&self) -> Vec<Task> {
        self.filtered(|_| true)
    }

    fn filtered(&self, keep: impl Fn(&Task) -> bool) -> Vec<Task> {
        let Ok(tasks) = self.tasks.read() else {
            tracing::warn!("⚠️ Task store lock poisoned, returning no tasks");
            return Vec::new();
        };
        let mut found: Vec<Task> = tasks.values().filter(|t| keep(t)).cloned().collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        found
    }

    fn update(
        &self,
        task_id: &str,
        change: impl FnOnce(&mut Task),
    ) -> Result<Task, CollaboratorError> {
        let mut tasks = self.tasks.write().map_err(|_| poisoned("task store"))?;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CollaboratorError::UnknownTask(task_id.to_string()))?;
        change(task);
        Ok(task.clone())
    }

    fn require_open(&self, task_id: &str) -> Result<(), CollaboratorError> {
        match self.task(task_id) {
            Some(task) if task.status == TaskStatus::Opened => Ok(()),
            Some(_) => Err(CollaboratorError::Unavailable(format!("task {} is closed", task_id))),
            None => Err(CollaboratorError::UnknownTask(task_id.to_string())),
        }
    }
}

impl TaskService for InMemoryTaskService {
    fn create_tasks(&self, tasks: &[Task]) -> Result<(), CollaboratorError> {
        let mut store = self.tasks.write().map_err(|_| poisoned("task store"))?;
        for task in tasks {
            store.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    fn end_task(
        &self,
        task_id: &str,
        actor: &str,
        comment: Option<&str>,
    ) -> Result<Task, CollaboratorError> {
        self.require_open(task_id)?;
        self.update(task_id, |task| {
            task.status = TaskStatus::Ended;
            task.ended_by = Some(actor.to_string());
            task.comment = comment.map(str::to_string);
        })
    }

    fn cancel_task(&self, task_id: &str) -> Result<(), CollaboratorError> {
        self.update(task_id, |task| task.status = TaskStatus::Canceled)
            .map(|_| ())
    }

    fn reassign_task(
        &self,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
    ) -> Result<Task, CollaboratorError> {
        self.require_open(task_id)?;
        self.update(task_id, |task| {
            task.actors = actors.to_vec();
            task.delegated_actors.clear();
            task.comment = comment.map(str::to_string);
        })
    }

    fn delegate_task(
        &self,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
    ) -> Result<Task, CollaboratorError> {
        self.require_open(task_id)?;
        self.update(task_id, |task| {
            for actor in actors {
                if !task.delegated_actors.contains(actor) {
                    task.delegated_actors.push(actor.clone());
                }
            }
            task.comment = comment.map(str::to_string);
        })
    }

    fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().ok()?.get(task_id).cloned()
    }
}

/// Named ACL entry on one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessEntry {
    pub actor: String,
    pub permission: String,
}

/// Document ACLs: document -> grant name -> entries
#[derive(Debug, Default)]
pub struct InMemoryPermissions {
    acls: RwLock<HashMap<String, BTreeMap<String, Vec<AccessEntry>>>>,
}

impl InMemoryPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_permission(&self, document: &str, actor: &str, permission: &str) -> bool {
        let Ok(acls) = self.acls.read() else {
            return false;
        };
        acls.get(document)
            .map(|grants| {
                grants
                    .values()
                    .flatten()
                    .any(|e| e.actor == actor && e.permission == permission)
            })
            .unwrap_or(false)
    }

    pub fn grants_on(&self, document: &str) -> Vec<String> {
        self.acls
            .read()
            .ok()
            .and_then(|acls| acls.get(document).map(|g| g.keys().cloned().collect()))
            .unwrap_or_default()
    }
}

impl PermissionService for InMemoryPermissions {
    fn grant_permission(
        &self,
        grant: &str,
        documents: &[String],
        actors: &[String],
        permission: &str,
    ) -> Result<(), CollaboratorError> {
        let mut acls = self.acls.write().map_err(|_| poisoned("acl"))?;
        for document in documents {
            let entries = acls
                .entry(document.clone())
                .or_default()
                .entry(grant.to_string())
                .or_default();
            for actor in actors {
                let entry = AccessEntry {
                    actor: actor.clone(),
                    permission: permission.to_string(),
                };
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
        }
        Ok(())
    }

    fn revoke_permission(&self, grant: &str, documents: &[String]) -> Result<(), CollaboratorError> {
        let mut acls = self.acls.write().map_err(|_| poisoned("acl"))?;
        for document in documents {
            if let Some(grants) = acls.get_mut(document) {
                grants.remove(grant);
            }
        }
        Ok(())
    }
}

/// Recorded event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub name: String,
    pub properties: Value,
    pub at: DateTime<Utc>,
}

/// Event sink that logs through tracing and keeps a bounded history
#[derive(Debug)]
pub struct AuditLog {
    events: Mutex<Vec<AuditEvent>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl AuditLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.name).collect()
    }

    pub fn events_for_instance(&self, instance_id: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.properties.get("instanceId").and_then(Value::as_str) == Some(instance_id))
            .collect()
    }
}

impl EventSink for AuditLog {
    fn emit_event(&self, name: &str, properties: Value) {
        tracing::info!("📣 {} {}", name, properties);
        match self.events.lock() {
            Ok(mut events) => {
                if events.len() >= self.capacity {
                    let overflow = events.len() + 1 - self.capacity;
                    events.drain(..overflow);
                }
                events.push(AuditEvent {
                    name: name.to_string(),
                    properties,
                    at: Utc::now(),
                });
            }
            Err(_) => tracing::warn!("⚠️ Audit log lock poisoned, dropping event {}", name),
        }
    }
}
