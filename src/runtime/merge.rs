/// Merge/join coordinator
///
/// Decides when a waiting merge node may proceed and, once it does, cancels the
/// branches still running towards it: the walk goes backwards over forward input
/// transitions, resets every predecessor to `Ready`, pulls it out of the work
/// queue and cancels its tasks if it was suspended. Suspended nodes end the walk
/// along their path; anything else is walked through.

use crate::{
    runtime::bridge::Bridge,
    workflow::{
        graph::Graph,
        types::{MergePolicy, NodeId, NodeState, WorkflowInstance},
    },
};
use std::collections::{HashSet, VecDeque};

/// Whether the node's merge policy is satisfied by the fired input transitions
pub(crate) fn can_merge(instance: &WorkflowInstance, graph: &Graph, node: NodeId) -> bool {
    let inputs = graph.input_transitions(node);
    let fired = inputs.iter().filter(|t| instance.transition(**t).result).count();

    match instance.node(node).kind.merge {
        None => true,
        Some(MergePolicy::One) => fired > 0,
        Some(MergePolicy::All) => {
            fired > 0
                && inputs
                    .iter()
                    .filter(|t| !graph.is_loop(**t))
                    .all(|t| instance.transition(*t).result)
        }
        Some(MergePolicy::AtLeast(required)) => fired >= required.max(1),
    }
}

/// Cancel every node upstream of `merging`; returns the canceled nodes in walk order
pub(crate) fn cancel_sibling_branches(
    bridge: &Bridge<'_>,
    instance: &mut WorkflowInstance,
    graph: &Graph,
    merging: NodeId,
    queue: &mut VecDeque<NodeId>,
) -> Vec<NodeId> {
    let mut visited = HashSet::from([merging]);
    let mut pending = vec![merging];
    let mut canceled = Vec::new();

    while let Some(current) = pending.pop() {
        for input in graph.input_transitions(current) {
            if graph.is_loop(*input) {
                continue;
            }
            let source = input.source;
            if !visited.insert(source) {
                continue;
            }

            let record = instance.node_mut(source);
            let previous = record.state;
            record.canceled_count += 1;
            record.state = NodeState::Ready;
            queue.retain(|queued| *queued != source);
            canceled.push(source);

            if previous == NodeState::Suspended {
                tracing::debug!("✂️ Canceling suspended branch node {}", instance.node(source).id);
                bridge.cancel_open_tasks(instance, source);
                bridge.cancel_sub_route(instance, source);
            } else {
                pending.push(source);
            }
        }
    }

    canceled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{NodeRecord, Variables, WorkflowModel};

    fn instance(nodes: Vec<NodeRecord>) -> WorkflowInstance {
        let model = WorkflowModel {
            id: "m".into(),
            name: "merge".into(),
            variables: Variables::new(),
            nodes,
        };
        let mut instance = WorkflowInstance::from_model("i", &model, vec![], "alice");
        instance.ensure_assembled().unwrap();
        instance
    }

    fn fire(instance: &mut WorkflowInstance, source: &str) {
        let id = instance.graph().unwrap().node_id(source).unwrap();
        for t in &mut instance.node_mut(id).transitions {
            t.result = true;
        }
    }

    fn diamond(policy: MergePolicy) -> WorkflowInstance {
        instance(vec![
            NodeRecord::new("s").start().to("a").to("b").to("c"),
            NodeRecord::new("a").to("m"),
            NodeRecord::new("b").to("m"),
            NodeRecord::new("c").to("m"),
            NodeRecord::new("m").merge(policy).to("end").to("s"),
            NodeRecord::new("end").stop(),
        ])
    }

    #[test]
    fn policies_count_fired_inputs() {
        let mut one = diamond(MergePolicy::One);
        let graph = one.graph().unwrap().clone();
        let m = graph.node_id("m").unwrap();
        assert!(!can_merge(&one, &graph, m));
        fire(&mut one, "b");
        assert!(can_merge(&one, &graph, m));

        let mut all = diamond(MergePolicy::All);
        fire(&mut all, "a");
        fire(&mut all, "b");
        assert!(!can_merge(&all, &graph, m));
        fire(&mut all, "c");
        assert!(can_merge(&all, &graph, m));

        let mut two = diamond(MergePolicy::AtLeast(2));
        fire(&mut two, "a");
        assert!(!can_merge(&two, &graph, m));
        fire(&mut two, "c");
        assert!(can_merge(&two, &graph, m));
    }
}
