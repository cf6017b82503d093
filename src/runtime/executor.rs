/// Node state machine
///
/// One call to [`NodeExecutor::step`] advances a single node by one state:
///
/// - `Ready` goes to `Waiting` for merge nodes, `RunningInput` otherwise
/// - `Waiting` proceeds once the merge policy holds, after canceling sibling branches
/// - `RunningInput` runs the input chain, then suspends on tasks or a sub-route
/// - `Suspended` is only legal as the entry node of a resume pass
/// - `RunningOutput` runs the output chain, fires transitions and goes back to `Ready`
///
/// The scheduler decides what to do with the returned [`Step`].

use crate::{
    error::{EngineError, EngineResult},
    runtime::{
        bridge::Bridge,
        collaborators::{Collaborators, NodeContext, VariableChanges},
        effects::Effects,
        merge,
    },
    workflow::{
        graph::{Graph, TransitionRef},
        types::{NodeId, NodeState, Variables, WorkflowInstance},
    },
};
use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;

/// Result of one state-machine step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Internal follow-up: set this state and process the node again right away
    Continue(NodeState),
    /// The node reached a pause point or finished; leave it out of the queue
    Yield,
}

/// External data delivered with a resume signal
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ResumeInput {
    pub actor: String,
    pub status: Option<String>,
    pub comment: Option<String>,
    pub node_variables: Variables,
    pub workflow_variables: Variables,
}

/// Mutable state of one scheduling pass
#[derive(Debug)]
pub(crate) struct Pass {
    pub queue: VecDeque<NodeId>,
    pub entry: NodeId,
    pub resume: Option<ResumeInput>,
    /// Nodes whose sub-route is launched once the queue drains
    pub sub_routes: Vec<NodeId>,
    pub stopped: bool,
}

impl Pass {
    pub fn new(entry: NodeId, resume: Option<ResumeInput>) -> Self {
        Self {
            queue: VecDeque::from([entry]),
            entry,
            resume,
            sub_routes: Vec::new(),
            stopped: false,
        }
    }

    fn enqueue(&mut self, node: NodeId) {
        if !self.queue.contains(&node) {
            self.queue.push_back(node);
        }
    }
}

pub(crate) struct NodeExecutor<'a> {
    collaborators: &'a Collaborators,
    graph: &'a Graph,
    bridge: Bridge<'a>,
}

impl<'a> NodeExecutor<'a> {
    pub fn new(collaborators: &'a Collaborators, graph: &'a Graph, effects: &'a Effects) -> Self {
        Self {
            collaborators,
            graph,
            bridge: Bridge::new(collaborators, effects),
        }
    }

    pub fn step(
        &self,
        instance: &mut WorkflowInstance,
        node: NodeId,
        pass: &mut Pass,
    ) -> EngineResult<Step> {
        let state = instance.node(node).state;
        tracing::debug!("🔄 Node {} in state {}", instance.node(node).id, state);

        match state {
            NodeState::Ready => {
                if instance.node(node).kind.is_merge() {
                    Ok(Step::Continue(NodeState::Waiting))
                } else {
                    Ok(Step::Continue(NodeState::RunningInput))
                }
            }
            NodeState::Waiting => {
                if merge::can_merge(instance, self.graph, node) {
                    let canceled = merge::cancel_sibling_branches(
                        &self.bridge,
                        instance,
                        self.graph,
                        node,
                        &mut pass.queue,
                    );
                    tracing::debug!(
                        "🔀 Merge node {} proceeds, {} upstream node(s) canceled",
                        instance.node(node).id,
                        canceled.len()
                    );
                    Ok(Step::Continue(NodeState::RunningInput))
                } else {
                    tracing::debug!("⏸️ Merge node {} keeps waiting", instance.node(node).id);
                    Ok(Step::Yield)
                }
            }
            NodeState::RunningInput => self.run_input(instance, node, pass),
            NodeState::Suspended => {
                if node != pass.entry {
                    return Err(EngineError::UnexpectedSuspendedState(instance.node(node).id.clone()));
                }
                let input = pass
                    .resume
                    .take()
                    .ok_or_else(|| EngineError::UnexpectedSuspendedState(instance.node(node).id.clone()))?;
                apply_resume_input(instance, node, &input);
                Ok(Step::Continue(NodeState::RunningOutput))
            }
            NodeState::RunningOutput => self.run_output(instance, node, pass),
        }
    }

    fn run_input(
        &self,
        instance: &mut WorkflowInstance,
        node: NodeId,
        pass: &mut Pass,
    ) -> EngineResult<Step> {
        self.starting(instance, node);

        let chain = instance.node(node).input_chain.clone();
        run_chain(self.collaborators, instance, node, chain.as_deref(), None)?;

        let kind = instance.node(node).kind.clone();
        let mut suspended = false;
        if kind.requires_tasks() {
            let created = self.bridge.create_tasks(instance, node)?;
            tracing::info!(
                "📝 Node {} suspended on {} task(s)",
                instance.node(node).id,
                created.len()
            );
            suspended = true;
        }
        if kind.has_sub_route() {
            if !pass.sub_routes.contains(&node) {
                pass.sub_routes.push(node);
            }
            suspended = true;
        }

        if suspended {
            instance.node_mut(node).state = NodeState::Suspended;
            Ok(Step::Yield)
        } else {
            Ok(Step::Continue(NodeState::RunningOutput))
        }
    }

    /// Reset input results, bump the counter and clear last run's tasks and child
    fn starting(&self, instance: &mut WorkflowInstance, node: NodeId) {
        for input in self.graph.input_transitions(node) {
            instance.transition_mut(*input).result = false;
        }
        let record = instance.node_mut(node);
        record.count += 1;
        record.started_at = Some(Utc::now());
        record.ended_at = None;
        record.tasks.clear();
        record.sub_route_instance_id = None;
    }

    fn run_output(
        &self,
        instance: &mut WorkflowInstance,
        node: NodeId,
        pass: &mut Pass,
    ) -> EngineResult<Step> {
        let chain = instance.node(node).output_chain.clone();
        run_chain(self.collaborators, instance, node, chain.as_deref(), None)?;

        let fired = self.evaluate_transitions(instance, node)?;

        let record = instance.node_mut(node);
        record.ended_at = Some(Utc::now());
        record.state = NodeState::Ready;

        if record.kind.stop {
            if !pass.queue.is_empty() {
                let pending = pass
                    .queue
                    .iter()
                    .map(|n| instance.node(*n).id.clone())
                    .collect();
                return Err(EngineError::PrematureStop {
                    node_id: instance.node(node).id.clone(),
                    pending,
                });
            }
            tracing::info!("🏁 Stop node {} reached", instance.node(node).id);
            pass.stopped = true;
            return Ok(Step::Yield);
        }

        if fired.is_empty() {
            return Err(EngineError::NoTransitionFired(instance.node(node).id.clone()));
        }

        for index in fired {
            let transition = &instance.node(node).transitions[index];
            let transition_id = transition.id.clone();
            let chain = transition.chain.clone();
            run_chain(self.collaborators, instance, node, chain.as_deref(), Some(&transition_id))?;

            let target = self.graph.target(TransitionRef { source: node, index });
            tracing::debug!(
                "➡️ Transition {} fired: {} -> {}",
                transition_id,
                instance.node(node).id,
                instance.node(target).id
            );
            pass.enqueue(target);
        }

        Ok(Step::Yield)
    }

    /// Evaluate output conditions in declaration order and record each result
    fn evaluate_transitions(
        &self,
        instance: &mut WorkflowInstance,
        node: NodeId,
    ) -> EngineResult<Vec<usize>> {
        let scope = NodeContext::capture(instance, node).scope();
        let exclusive = instance.node(node).kind.execute_only_first_transition;
        let conditions: Vec<String> = instance
            .node(node)
            .transitions
            .iter()
            .map(|t| t.condition.clone())
            .collect();

        let mut fired = Vec::new();
        let mut results = vec![false; conditions.len()];
        for (index, condition) in conditions.iter().enumerate() {
            let result = self
                .collaborators
                .expressions
                .evaluate_condition(condition, &scope)?;
            results[index] = result;
            if result {
                fired.push(index);
                if exclusive {
                    break;
                }
            }
        }

        for (transition, result) in instance.node_mut(node).transitions.iter_mut().zip(results) {
            transition.result = result;
        }
        Ok(fired)
    }
}

/// Run a chain (if configured) against the node and apply its variable changes
pub(crate) fn run_chain(
    collaborators: &Collaborators,
    instance: &mut WorkflowInstance,
    node: NodeId,
    chain: Option<&str>,
    transition: Option<&str>,
) -> EngineResult<()> {
    let Some(chain) = chain.filter(|c| !c.is_empty()) else {
        return Ok(());
    };

    let mut context = NodeContext::capture(instance, node);
    if let Some(transition) = transition {
        context = context.with_transition(transition);
    }
    let changes = collaborators.chains.execute_chain(chain, &context)?;
    apply_changes(instance, node, changes);
    Ok(())
}

pub(crate) fn apply_changes(instance: &mut WorkflowInstance, node: NodeId, changes: VariableChanges) {
    if changes.is_empty() {
        return;
    }
    instance.variables.extend(changes.workflow);
    instance.node_mut(node).variables.extend(changes.node);
}

/// Record the resuming actor and merge externally supplied data into the node
pub(crate) fn apply_resume_input(instance: &mut WorkflowInstance, node: NodeId, input: &ResumeInput) {
    instance.variables.extend(input.workflow_variables.clone());

    let record = instance.node_mut(node);
    record.variables.extend(input.node_variables.clone());
    record.last_actor = Some(input.actor.clone());
    if let Some(status) = &input.status {
        record.button = Some(status.clone());
    }
    if let Some(comment) = &input.comment {
        record.variables.insert("comment".into(), Value::String(comment.clone()));
    }
}
