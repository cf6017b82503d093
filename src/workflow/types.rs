/// Core routing type definitions
///
/// Models, instances and node records as they are persisted. Node records carry
/// both their declared configuration (kind flags, transitions, task settings) and
/// their runtime fields (state, variables, task bookkeeping) so that each can be
/// read and written separately by the store.

use crate::{
    error::GraphAssemblyError,
    workflow::graph::{Graph, TransitionRef},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, sync::Arc};

/// Key-value variable scope (workflow or node level)
pub type Variables = Map<String, Value>;

/// Arena index of a node inside its instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Per-node lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Ready,
    Waiting,
    RunningInput,
    Suspended,
    RunningOutput,
}

impl NodeState {
    /// States a pass leaves a node in while it waits for an external signal
    pub fn is_pause_point(self) -> bool {
        matches!(self, NodeState::Waiting | NodeState::Suspended)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Ready => "ready",
            NodeState::Waiting => "waiting",
            NodeState::RunningInput => "running_input",
            NodeState::Suspended => "suspended",
            NodeState::RunningOutput => "running_output",
        };
        f.write_str(name)
    }
}

/// Join policy of a merge node
///
/// Serialized as `"one"`, `"all"` or `{"at_least": n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// First predecessor to arrive wins
    One,
    /// Every forward (non-loop) input must have fired
    All,
    /// At least `n` inputs must have fired
    AtLeast(usize),
}

/// Sub-route launch configuration
///
/// Values starting with `expr:` are evaluated, anything else is taken literally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubRouteConfig {
    pub model: String,
    #[serde(default)]
    pub variables: Vec<(String, String)>,
}

/// Kind flags driving the state machine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeKind {
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub merge: Option<MergePolicy>,
    #[serde(default)]
    pub has_task: bool,
    #[serde(default)]
    pub has_multiple_tasks: bool,
    #[serde(default)]
    pub sub_route: Option<SubRouteConfig>,
    /// Stop evaluating transitions after the first one that fires
    #[serde(default)]
    pub execute_only_first_transition: bool,
}

impl NodeKind {
    pub fn is_merge(&self) -> bool {
        self.merge.is_some()
    }

    pub fn requires_tasks(&self) -> bool {
        self.has_task || self.has_multiple_tasks
    }

    pub fn has_sub_route(&self) -> bool {
        self.sub_route.is_some()
    }
}

/// Human task settings of a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub assignees_expr: Option<String>,
    /// Permission granted to assignees on the attached documents
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub due_date_expr: Option<String>,
    #[serde(default)]
    pub directive: Option<String>,
    #[serde(default)]
    pub allow_task_reassignment: bool,
}

fn default_condition() -> String {
    "true".to_string()
}

/// Declared output transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: String,
    pub target: String,
    #[serde(default = "default_condition")]
    pub condition: String,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Outcome of the last evaluation, read by merge policies
    #[serde(default)]
    pub result: bool,
}

impl TransitionRecord {
    pub fn new(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            condition: default_condition(),
            chain: None,
            label: None,
            result: false,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn with_chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }
}

/// Escalation rule evaluated while the node is suspended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub id: String,
    pub condition: String,
    pub chain: String,
    #[serde(default)]
    pub multiple_execution: bool,
    #[serde(default)]
    pub executed: bool,
    #[serde(default)]
    pub last_execution: Option<DateTime<Utc>>,
}

/// Bookkeeping for one task created by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ended: bool,
}

impl TaskInfo {
    pub fn open(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            actor: None,
            comment: None,
            status: None,
            ended: false,
        }
    }
}

/// A node of a model or instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub input_chain: Option<String>,
    #[serde(default)]
    pub output_chain: Option<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub escalation_rules: Vec<EscalationRule>,
    #[serde(default)]
    pub variables: Variables,

    // Runtime fields
    #[serde(default)]
    pub state: NodeState,
    #[serde(default)]
    pub tasks: Vec<TaskInfo>,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub canceled_count: u64,
    #[serde(default)]
    pub button: Option<String>,
    #[serde(default)]
    pub last_actor: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub task_due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sub_route_instance_id: Option<String>,
}

impl NodeRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            kind: NodeKind::default(),
            input_chain: None,
            output_chain: None,
            transitions: Vec::new(),
            task: TaskConfig::default(),
            escalation_rules: Vec::new(),
            variables: Variables::new(),
            state: NodeState::Ready,
            tasks: Vec::new(),
            count: 0,
            canceled_count: 0,
            button: None,
            last_actor: None,
            started_at: None,
            ended_at: None,
            task_due_date: None,
            sub_route_instance_id: None,
        }
    }

    pub fn start(mut self) -> Self {
        self.kind.start = true;
        self
    }

    pub fn stop(mut self) -> Self {
        self.kind.stop = true;
        self
    }

    pub fn merge(mut self, policy: MergePolicy) -> Self {
        self.kind.merge = Some(policy);
        self
    }

    pub fn with_task(mut self, assignees: &[&str]) -> Self {
        self.kind.has_task = true;
        self.task.assignees = assignees.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_multiple_tasks(mut self, assignees: &[&str]) -> Self {
        self.kind.has_multiple_tasks = true;
        self.task.assignees = assignees.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_sub_route(mut self, model: impl Into<String>) -> Self {
        self.kind.sub_route = Some(SubRouteConfig {
            model: model.into(),
            variables: Vec::new(),
        });
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.kind.execute_only_first_transition = true;
        self
    }

    pub fn input_chain(mut self, chain: impl Into<String>) -> Self {
        self.input_chain = Some(chain.into());
        self
    }

    pub fn output_chain(mut self, chain: impl Into<String>) -> Self {
        self.output_chain = Some(chain.into());
        self
    }

    pub fn transition(mut self, transition: TransitionRecord) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Shorthand for an unconditional transition named `{id}-to-{target}`
    pub fn to(self, target: &str) -> Self {
        let id = format!("{}-to-{}", self.id, target);
        self.transition(TransitionRecord::new(id, target))
    }

    pub fn has_open_tasks(&self) -> bool {
        self.tasks.iter().any(|t| !t.ended)
    }

    pub fn open_task_ids(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| !t.ended)
            .map(|t| t.task_id.clone())
            .collect()
    }

    /// Tasks ended by an actor; canceled tasks carry no actor
    pub fn processed_task_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.ended && t.actor.is_some()).count()
    }

    pub fn task_info(&self, task_id: &str) -> Option<&TaskInfo> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Mark a task as ended and record who ended it with which outcome
    pub fn end_task_info(
        &mut self,
        task_id: &str,
        actor: Option<&str>,
        status: Option<&str>,
        comment: Option<&str>,
    ) {
        if let Some(info) = self.tasks.iter_mut().find(|t| t.task_id == task_id) {
            info.ended = true;
            info.actor = actor.map(str::to_string);
            info.status = status.map(str::to_string);
            info.comment = comment.map(str::to_string);
        }
    }
}

/// A reusable workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowModel {
    pub id: String,
    pub name: String,
    /// Initial workflow variables copied into every instance
    #[serde(default)]
    pub variables: Variables,
    pub nodes: Vec<NodeRecord>,
}

/// Lifecycle of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Ready,
    Running,
    Done,
    Canceled,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceStatus::Ready => "ready",
            InstanceStatus::Running => "running",
            InstanceStatus::Done => "done",
            InstanceStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Link from a sub-route back to the node that launched it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance_id: String,
    pub node_id: String,
}

/// One running execution of a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub model_id: String,
    pub name: String,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub documents: Vec<String>,
    pub initiator: String,
    #[serde(default)]
    pub parent: Option<ParentLink>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    /// Read through `nodes()`, replaced through `replace_nodes()` so the graph
    /// cache never outlives the records it was assembled from
    nodes: Vec<NodeRecord>,
    /// Assembled graph, rebuilt lazily after load or node changes
    #[serde(skip)]
    graph: Option<Arc<Graph>>,
}

impl PartialEq for WorkflowInstance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.model_id == other.model_id
            && self.variables == other.variables
            && self.documents == other.documents
            && self.initiator == other.initiator
            && self.parent == other.parent
            && self.status == other.status
            && self.nodes == other.nodes
    }
}

impl WorkflowInstance {
    /// Instantiate a model; node records are copied with fresh runtime fields
    pub fn from_model(
        id: impl Into<String>,
        model: &WorkflowModel,
        documents: Vec<String>,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            model_id: model.id.clone(),
            name: model.name.clone(),
            variables: model.variables.clone(),
            documents,
            initiator: initiator.into(),
            parent: None,
            status: InstanceStatus::Ready,
            created_at: Utc::now(),
            nodes: model.nodes.clone(),
            graph: None,
        }
    }

    /// Assemble the graph if it is not cached yet
    pub fn ensure_assembled(&mut self) -> Result<Arc<Graph>, GraphAssemblyError> {
        if let Some(graph) = &self.graph {
            return Ok(Arc::clone(graph));
        }
        let graph = Arc::new(Graph::assemble(&self.nodes)?);
        self.graph = Some(Arc::clone(&graph));
        Ok(graph)
    }

    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_deref()
    }

    /// Drop the cached graph; required after node records are replaced
    pub fn invalidate_graph(&mut self) {
        self.graph = None;
    }

    pub fn replace_nodes(&mut self, nodes: Vec<NodeRecord>) {
        self.nodes = nodes;
        self.invalidate_graph();
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    /// Arena ids of every node, in declaration order
    pub fn node_ids(&self) -> Vec<NodeId> {
        (0..self.nodes.len()).map(NodeId).collect()
    }

    pub fn node(&self, id: NodeId) -> &NodeRecord {
        &self.nodes[id.0]
    }

    /// Runtime fields only; identities and transitions change through `replace_nodes`
    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut NodeRecord {
        &mut self.nodes[id.0]
    }

    pub fn find_node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn transition(&self, t: TransitionRef) -> &TransitionRecord {
        &self.nodes[t.source.0].transitions[t.index]
    }

    pub(crate) fn transition_mut(&mut self, t: TransitionRef) -> &mut TransitionRecord {
        &mut self.nodes[t.source.0].transitions[t.index]
    }

    /// Node owning the given task, if the task was created by this instance
    pub fn node_for_task(&self, task_id: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.tasks.iter().any(|t| t.task_id == task_id))
            .map(NodeId)
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, InstanceStatus::Done | InstanceStatus::Canceled)
    }

    pub fn open_task_ids(&self) -> Vec<String> {
        self.nodes.iter().flat_map(|n| n.open_task_ids()).collect()
    }

    /// Ids of nodes currently paused in the given state
    pub fn nodes_in_state(&self, state: NodeState) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.state == state)
            .map(|n| n.id.clone())
            .collect()
    }
}
