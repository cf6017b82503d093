/// Execution scheduler and inbound engine operations
///
/// A pass drives a work queue seeded with one entry node (the start node on `run`,
/// the resumed node on `resume`). The head node is stepped through the state
/// machine; internal follow-up states put it straight back at the head, successors
/// go to the tail. The pass ends when the queue drains, then registered sub-routes
/// are launched and, if a stop node fired, the instance is completed.
///
/// Passes run against a working copy of the instance that replaces the caller's
/// instance only when the pass succeeds, so a failed pass leaves no partial state.
/// Collaborator calls made by a pass are recorded as effects and applied after the
/// copy is committed; the `*_recorded` variants leave applying them to the caller.

use crate::{
    error::{EngineError, EngineResult},
    runtime::{
        bridge::Bridge,
        collaborators::{Collaborators, NodeContext},
        effects::Effects,
        executor::{apply_resume_input, run_chain, NodeExecutor, Pass, ResumeInput, Step},
    },
    workflow::{
        graph::Graph,
        types::{InstanceStatus, NodeId, NodeState, ParentLink, Variables, WorkflowInstance},
    },
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Ceiling on queue iterations per pass
pub const DEFAULT_MAX_LOOPS: usize = 100;

/// What a resume signal is aimed at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeTarget {
    Node(String),
    Task(String),
}

/// Completion signal delivered to a suspended or waiting node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeSignal {
    pub target: ResumeTarget,
    pub actor: String,
    /// Completion status, recorded as the node's button
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub node_variables: Variables,
    #[serde(default)]
    pub workflow_variables: Variables,
    /// Administrative resume: cancels open tasks of a suspended node
    #[serde(default)]
    pub force: bool,
}

impl ResumeSignal {
    pub fn task(task_id: impl Into<String>, actor: impl Into<String>) -> Self {
        Self::new(ResumeTarget::Task(task_id.into()), actor)
    }

    pub fn node(node_id: impl Into<String>, actor: impl Into<String>) -> Self {
        Self::new(ResumeTarget::Node(node_id.into()), actor)
    }

    fn new(target: ResumeTarget, actor: impl Into<String>) -> Self {
        Self {
            target,
            actor: actor.into(),
            status: None,
            comment: None,
            node_variables: Variables::new(),
            workflow_variables: Variables::new(),
            force: false,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_node_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.node_variables.insert(name.into(), value);
        self
    }

    pub fn with_workflow_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.workflow_variables.insert(name.into(), value);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    fn target_label(&self) -> &str {
        match &self.target {
            ResumeTarget::Node(id) | ResumeTarget::Task(id) => id,
        }
    }

    fn input(&self) -> ResumeInput {
        ResumeInput {
            actor: self.actor.clone(),
            status: self.status.clone(),
            comment: self.comment.clone(),
            node_variables: self.node_variables.clone(),
            workflow_variables: self.workflow_variables.clone(),
        }
    }
}

/// Summary of a finished pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassOutcome {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub suspended: Vec<String>,
    pub waiting: Vec<String>,
    /// The resume only recorded a task completion; other tasks are still open
    pub deferred: bool,
    /// Set when this pass completed a sub-route whose parent must be resumed
    #[serde(skip)]
    pub completed_parent: Option<ParentLink>,
}

impl PassOutcome {
    fn of(instance: &WorkflowInstance, deferred: bool, completed: bool) -> Self {
        Self {
            instance_id: instance.id.clone(),
            status: instance.status,
            suspended: instance.nodes_in_state(NodeState::Suspended),
            waiting: instance.nodes_in_state(NodeState::Waiting),
            deferred,
            completed_parent: if completed { instance.parent.clone() } else { None },
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == InstanceStatus::Done
    }
}

/// Graph execution engine; cheap to clone, holds only injected collaborators
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    collaborators: Collaborators,
    max_loops: usize,
}

impl ExecutionEngine {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            max_loops: DEFAULT_MAX_LOOPS,
        }
    }

    pub fn with_max_loops(mut self, max_loops: usize) -> Self {
        self.max_loops = max_loops;
        self
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Start a fresh instance from its start node
    pub fn run(&self, instance: &mut WorkflowInstance, initial: Variables) -> EngineResult<PassOutcome> {
        self.applied(|effects| self.run_recorded(instance, initial, effects))
    }

    /// Deliver a completion signal to a suspended or waiting node
    pub fn resume(&self, instance: &mut WorkflowInstance, signal: &ResumeSignal) -> EngineResult<PassOutcome> {
        self.applied(|effects| self.resume_recorded(instance, signal, None, effects))
    }

    /// Resume the node that launched `child` now that the child has finished
    pub fn resume_sub_route(
        &self,
        instance: &mut WorkflowInstance,
        node_id: &str,
        child: &str,
        actor: &str,
    ) -> EngineResult<PassOutcome> {
        let signal = ResumeSignal::node(node_id, actor);
        self.applied(|effects| self.resume_recorded(instance, &signal, Some(child), effects))
    }

    /// Abort the instance: cancel every task and sub-route regardless of node state
    ///
    /// Returns false when the instance had already finished.
    pub fn cancel(&self, instance: &mut WorkflowInstance) -> bool {
        let effects = Effects::new();
        let canceled = self.cancel_recorded(instance, &effects);
        effects.apply(&self.collaborators);
        canceled
    }

    pub fn reassign_task(
        &self,
        instance: &mut WorkflowInstance,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
    ) -> EngineResult<()> {
        self.applied(|effects| self.reassign_recorded(instance, task_id, actors, comment, effects))
    }

    pub fn delegate_task(
        &self,
        instance: &mut WorkflowInstance,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
    ) -> EngineResult<()> {
        self.applied(|effects| self.delegate_recorded(instance, task_id, actors, comment, effects))
    }

    /// Evaluate escalation rules of suspended nodes; returns how many fired
    pub fn run_escalations(&self, instance: &mut WorkflowInstance) -> EngineResult<usize> {
        self.applied(|effects| self.escalations_recorded(instance, effects))
    }

    pub(crate) fn run_recorded(
        &self,
        instance: &mut WorkflowInstance,
        initial: Variables,
        effects: &Effects,
    ) -> EngineResult<PassOutcome> {
        if instance.status != InstanceStatus::Ready {
            return Err(EngineError::InstanceNotRunning {
                id: instance.id.clone(),
                status: instance.status.to_string(),
            });
        }

        let mut working = instance.clone();
        let graph = working.ensure_assembled()?;
        working.variables.extend(initial);
        working.status = InstanceStatus::Running;

        let local = Effects::new();
        tracing::info!("🚀 Running instance {} of model {}", working.id, working.model_id);
        Bridge::new(&self.collaborators, &local).emit("afterWorkflowStarted", &working, None, json!({}));

        let outcome = self.drive(&mut working, &graph, graph.start(), None, &local)?;
        *instance = working;
        effects.append(local);
        Ok(outcome)
    }

    /// `finished_child` is set when the signal comes from a completed sub-route
    pub(crate) fn resume_recorded(
        &self,
        instance: &mut WorkflowInstance,
        signal: &ResumeSignal,
        finished_child: Option<&str>,
        effects: &Effects,
    ) -> EngineResult<PassOutcome> {
        if !instance.is_running() {
            return Err(EngineError::invalid_target(
                signal.target_label(),
                format!("instance {} is {}", instance.id, instance.status),
            ));
        }

        let mut working = instance.clone();
        let graph = working.ensure_assembled()?;
        let local = Effects::new();
        let bridge = Bridge::new(&self.collaborators, &local);

        let node = match &signal.target {
            ResumeTarget::Node(node_id) => graph
                .node_id(node_id)
                .ok_or_else(|| EngineError::invalid_target(node_id, "unknown node"))?,
            ResumeTarget::Task(task_id) => working
                .node_for_task(task_id)
                .ok_or_else(|| EngineError::invalid_target(task_id, "unknown task"))?,
        };
        let state = working.node(node).state;
        if !state.is_pause_point() {
            return Err(EngineError::invalid_target(
                signal.target_label(),
                format!("node {} is {}", working.node(node).id, state),
            ));
        }

        tracing::info!(
            "▶️ Resuming node {} of instance {} (actor: {})",
            working.node(node).id,
            working.id,
            signal.actor
        );

        let deferred = match &signal.target {
            ResumeTarget::Task(task_id) => {
                let info = working.node(node).task_info(task_id);
                if state != NodeState::Suspended || info.map_or(true, |t| t.ended) {
                    return Err(EngineError::invalid_target(task_id, "task is not open"));
                }
                bridge.complete_task(
                    &mut working,
                    node,
                    task_id,
                    &signal.actor,
                    signal.status.as_deref(),
                    signal.comment.as_deref(),
                );
                working.node(node).has_open_tasks()
            }
            ResumeTarget::Node(node_id) => {
                let waiting_on = working.node(node).sub_route_instance_id.clone();
                match finished_child {
                    Some(finished) => {
                        if state != NodeState::Suspended || waiting_on.as_deref() != Some(finished) {
                            return Err(EngineError::invalid_target(
                                node_id,
                                format!("node does not wait for sub-route {}", finished),
                            ));
                        }
                    }
                    None if state == NodeState::Suspended => {
                        let open_tasks = working.node(node).has_open_tasks();
                        if (open_tasks || waiting_on.is_some()) && !signal.force {
                            return Err(EngineError::invalid_target(
                                node_id,
                                "node waits for open tasks or a sub-route; complete them or force the resume",
                            ));
                        }
                        bridge.cancel_open_tasks(&mut working, node);
                        bridge.cancel_sub_route(&mut working, node);
                    }
                    None => {}
                }
                false
            }
        };

        let outcome = if deferred {
            apply_resume_input(&mut working, node, &signal.input());
            tracing::info!(
                "⏳ Node {} still has {} open task(s), resume deferred",
                working.node(node).id,
                working.node(node).open_task_ids().len()
            );
            PassOutcome::of(&working, true, false)
        } else {
            let resume = if state == NodeState::Waiting {
                apply_resume_input(&mut working, node, &signal.input());
                None
            } else {
                Some(signal.input())
            };
            self.drive(&mut working, &graph, node, resume, &local)?
        };

        *instance = working;
        effects.append(local);
        Ok(outcome)
    }

    pub(crate) fn cancel_recorded(&self, instance: &mut WorkflowInstance, effects: &Effects) -> bool {
        if instance.is_finished() {
            return false;
        }

        let bridge = Bridge::new(&self.collaborators, effects);
        for node in instance.node_ids() {
            bridge.cancel_open_tasks(instance, node);
            bridge.cancel_sub_route(instance, node);
        }
        instance.status = InstanceStatus::Canceled;

        tracing::info!("🛑 Canceled instance {}", instance.id);
        bridge.emit("afterWorkflowCanceled", instance, None, json!({}));
        true
    }

    pub(crate) fn reassign_recorded(
        &self,
        instance: &mut WorkflowInstance,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
        effects: &Effects,
    ) -> EngineResult<()> {
        let node = self.open_task_node(instance, task_id)?;
        let mut working = instance.clone();
        let local = Effects::new();
        Bridge::new(&self.collaborators, &local).reassign_task(&mut working, node, task_id, actors, comment)?;
        *instance = working;
        effects.append(local);
        Ok(())
    }

    pub(crate) fn delegate_recorded(
        &self,
        instance: &mut WorkflowInstance,
        task_id: &str,
        actors: &[String],
        comment: Option<&str>,
        effects: &Effects,
    ) -> EngineResult<()> {
        let node = self.open_task_node(instance, task_id)?;
        let mut working = instance.clone();
        let local = Effects::new();
        Bridge::new(&self.collaborators, &local).delegate_task(&mut working, node, task_id, actors, comment)?;
        *instance = working;
        effects.append(local);
        Ok(())
    }

    pub(crate) fn escalations_recorded(
        &self,
        instance: &mut WorkflowInstance,
        effects: &Effects,
    ) -> EngineResult<usize> {
        if !instance.is_running() {
            return Ok(0);
        }

        let mut working = instance.clone();
        let local = Effects::new();
        let bridge = Bridge::new(&self.collaborators, &local);
        let mut fired = 0;

        for node in working.node_ids() {
            if working.node(node).state != NodeState::Suspended {
                continue;
            }
            for rule_index in 0..working.node(node).escalation_rules.len() {
                let rule = working.node(node).escalation_rules[rule_index].clone();
                if rule.executed && !rule.multiple_execution {
                    continue;
                }
                let scope = NodeContext::capture(&working, node).scope();
                if !self
                    .collaborators
                    .expressions
                    .evaluate_condition(&rule.condition, &scope)?
                {
                    continue;
                }

                run_chain(&self.collaborators, &mut working, node, Some(&rule.chain), None)?;
                let stored = &mut working.node_mut(node).escalation_rules[rule_index];
                stored.executed = true;
                stored.last_execution = Some(Utc::now());
                fired += 1;

                tracing::info!(
                    "⏰ Escalation rule {} executed on node {} of instance {}",
                    rule.id,
                    working.node(node).id,
                    working.id
                );
                bridge.emit(
                    "afterEscalationExecuted",
                    &working,
                    Some(node),
                    json!({"ruleId": rule.id}),
                );
            }
        }

        *instance = working;
        effects.append(local);
        Ok(fired)
    }

    /// Run `op` and hand its recorded effects to the collaborators if it succeeds
    fn applied<T>(&self, op: impl FnOnce(&Effects) -> EngineResult<T>) -> EngineResult<T> {
        let effects = Effects::new();
        let value = op(&effects)?;
        effects.apply(&self.collaborators);
        Ok(value)
    }

    fn open_task_node(&self, instance: &WorkflowInstance, task_id: &str) -> EngineResult<NodeId> {
        if !instance.is_running() {
            return Err(EngineError::InstanceNotRunning {
                id: instance.id.clone(),
                status: instance.status.to_string(),
            });
        }
        let node = instance
            .node_for_task(task_id)
            .ok_or_else(|| EngineError::invalid_target(task_id, "unknown task"))?;
        match instance.node(node).task_info(task_id) {
            Some(info) if !info.ended => Ok(node),
            _ => Err(EngineError::invalid_target(task_id, "task is not open")),
        }
    }

    /// Drive the work queue from `entry` until it drains
    fn drive(
        &self,
        instance: &mut WorkflowInstance,
        graph: &Graph,
        entry: NodeId,
        resume: Option<ResumeInput>,
        effects: &Effects,
    ) -> EngineResult<PassOutcome> {
        let executor = NodeExecutor::new(&self.collaborators, graph, effects);
        let mut pass = Pass::new(entry, resume);
        let mut count = 0usize;

        while let Some(node) = pass.queue.pop_front() {
            count += 1;
            if count > self.max_loops {
                tracing::error!(
                    "❌ Execution loop detected on node {} of instance {}",
                    instance.node(node).id,
                    instance.id
                );
                return Err(EngineError::ExecutionLoopDetected {
                    node_id: instance.node(node).id.clone(),
                    limit: self.max_loops,
                });
            }

            match executor.step(instance, node, &mut pass)? {
                Step::Continue(next) => {
                    instance.node_mut(node).state = next;
                    count -= 1;
                    pass.queue.push_front(node);
                }
                Step::Yield => {}
            }
        }

        let bridge = Bridge::new(&self.collaborators, effects);
        if pass.stopped {
            self.complete(instance, &bridge);
            return Ok(PassOutcome::of(instance, false, true));
        }

        // Merge cancellation may have reset a node after it registered its launch
        let launches: Vec<NodeId> = pass
            .sub_routes
            .into_iter()
            .filter(|n| instance.node(*n).state == NodeState::Suspended)
            .collect();
        bridge.launch_sub_routes(instance, &launches)?;

        tracing::debug!(
            "⏸️ Pass over instance {} paused; suspended: {:?}, waiting: {:?}",
            instance.id,
            instance.nodes_in_state(NodeState::Suspended),
            instance.nodes_in_state(NodeState::Waiting)
        );
        Ok(PassOutcome::of(instance, false, false))
    }

    /// Mark done and clean up work left on other branches
    fn complete(&self, instance: &mut WorkflowInstance, bridge: &Bridge<'_>) {
        for node in instance.node_ids() {
            if instance.node(node).has_open_tasks() {
                bridge.cancel_open_tasks(instance, node);
            }
            if instance.node(node).state.is_pause_point() {
                bridge.cancel_sub_route(instance, node);
                instance.node_mut(node).state = NodeState::Ready;
            }
        }
        instance.status = InstanceStatus::Done;

        tracing::info!("✅ Instance {} completed", instance.id);
        bridge.emit("afterWorkflowFinish", instance, None, json!({}));
    }
}
