#![allow(dead_code)]

use routeway::{
    error::CollaboratorError,
    runtime::{
        collaborators::{ChainExecutor, Collaborators, NodeContext, SubRouteLauncher, SubRouteRequest},
        AuditLog, ExecutionEngine, InMemoryPermissions, InMemoryTaskService, LuaScripting,
        VariableChanges,
    },
    workflow::{NodeRecord, Variables, WorkflowInstance, WorkflowModel},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Chain executor that counts invocations before delegating to Lua
pub struct CountingChains {
    inner: Arc<LuaScripting>,
    calls: Mutex<HashMap<String, usize>>,
}

impl CountingChains {
    pub fn calls(&self, chain_id: &str) -> usize {
        self.calls.lock().unwrap().get(chain_id).copied().unwrap_or(0)
    }
}

impl ChainExecutor for CountingChains {
    fn execute_chain(
        &self,
        chain_id: &str,
        context: &NodeContext,
    ) -> Result<VariableChanges, CollaboratorError> {
        *self.calls.lock().unwrap().entry(chain_id.to_string()).or_default() += 1;
        self.inner.execute_chain(chain_id, context)
    }
}

/// Sub-route launcher that only records what it was asked to do
#[derive(Default)]
pub struct RecordingSubRoutes {
    pub started: Mutex<Vec<SubRouteRequest>>,
    pub canceled: Mutex<Vec<String>>,
}

impl SubRouteLauncher for RecordingSubRoutes {
    fn start_sub_route(&self, request: SubRouteRequest) -> Result<String, CollaboratorError> {
        let mut started = self.started.lock().unwrap();
        started.push(request);
        Ok(format!("child-{}", started.len()))
    }

    fn cancel_sub_route(&self, instance_id: &str) -> Result<(), CollaboratorError> {
        self.canceled.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
}

/// In-memory collaborators with handles for inspection
pub struct Harness {
    pub scripting: Arc<LuaScripting>,
    pub chains: Arc<CountingChains>,
    pub tasks: Arc<InMemoryTaskService>,
    pub permissions: Arc<InMemoryPermissions>,
    pub audit: Arc<AuditLog>,
    pub sub_routes: Arc<RecordingSubRoutes>,
}

impl Harness {
    pub fn new() -> Self {
        let scripting = Arc::new(LuaScripting::new());
        Self {
            chains: Arc::new(CountingChains {
                inner: scripting.clone(),
                calls: Mutex::new(HashMap::new()),
            }),
            scripting,
            tasks: Arc::new(InMemoryTaskService::new()),
            permissions: Arc::new(InMemoryPermissions::new()),
            audit: Arc::new(AuditLog::default()),
            sub_routes: Arc::new(RecordingSubRoutes::default()),
        }
    }

    pub fn with_chain(self, chain_id: &str, script: &str) -> Self {
        self.scripting.register_chain(chain_id, script);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            chains: self.chains.clone(),
            expressions: self.scripting.clone(),
            tasks: self.tasks.clone(),
            permissions: self.permissions.clone(),
            events: self.audit.clone(),
            sub_routes: self.sub_routes.clone(),
        }
    }

    pub fn engine(&self) -> ExecutionEngine {
        ExecutionEngine::new(self.collaborators())
    }

    /// Id of the single open task assigned to `actor`
    pub fn task_for(&self, actor: &str) -> String {
        let tasks = self.tasks.open_tasks_for(actor);
        assert_eq!(tasks.len(), 1, "expected one open task for {}", actor);
        tasks[0].id.clone()
    }
}

pub fn model(id: &str, nodes: Vec<NodeRecord>) -> WorkflowModel {
    WorkflowModel {
        id: id.into(),
        name: format!("{} model", id),
        variables: Variables::new(),
        nodes,
    }
}

pub fn instance(nodes: Vec<NodeRecord>) -> WorkflowInstance {
    WorkflowInstance::from_model("inst-1", &model("m", nodes), vec!["doc-1".into()], "alice")
}

pub fn node<'a>(instance: &'a WorkflowInstance, id: &str) -> &'a NodeRecord {
    instance.find_node(id).unwrap()
}

/// Start → Review(task for bob) → Stop
pub fn review_flow() -> Vec<NodeRecord> {
    vec![
        NodeRecord::new("start").start().to("review"),
        NodeRecord::new("review").with_task(&["bob"]).to("stop"),
        NodeRecord::new("stop").stop(),
    ]
}
