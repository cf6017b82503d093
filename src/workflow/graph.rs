/// Graph assembly for workflow instances
///
/// Turns a flat list of node records into an index-based graph: identities are
/// resolved to arena ids, input transitions are derived from declared outputs and
/// every transition reachable from the start node is classified as forward or loop.
/// The result is immutable; callers rebuild it whenever the records change.

use crate::{
    error::GraphAssemblyError,
    workflow::types::{NodeId, NodeRecord},
};
use petgraph::{
    graph::{DiGraph, NodeIndex},
    visit::DfsPostOrder,
};
use std::collections::HashMap;

/// Position of a transition: the `index`-th output of `source`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitionRef {
    pub source: NodeId,
    pub index: usize,
}

/// Assembled view over an instance's node records
#[derive(Debug, Clone)]
pub struct Graph {
    index: HashMap<String, NodeId>,
    start: NodeId,
    /// Resolved target per declared output transition
    targets: Vec<Vec<NodeId>>,
    /// Derived input transitions per node
    inputs: Vec<Vec<TransitionRef>>,
    loops: Vec<Vec<bool>>,
    /// Topological number; None for nodes unreachable from start
    topo: Vec<Option<usize>>,
}

impl Graph {
    pub fn assemble(records: &[NodeRecord]) -> Result<Self, GraphAssemblyError> {
        let mut index = HashMap::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            if index.insert(record.id.clone(), NodeId(position)).is_some() {
                return Err(GraphAssemblyError::DuplicateNodeIdentity(record.id.clone()));
            }
        }

        let starts: Vec<NodeId> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind.start)
            .map(|(position, _)| NodeId(position))
            .collect();
        let start = match starts.as_slice() {
            [single] => *single,
            _ => {
                return Err(GraphAssemblyError::MissingOrDuplicateStartNode {
                    count: starts.len(),
                })
            }
        };

        let (targets, inputs) = compute_transitions(records, &index)?;
        let topo = topological_numbers(records.len(), start, &targets);
        let loops = compute_loop_transitions(&targets, &topo);

        let unreachable = topo.iter().filter(|t| t.is_none()).count();
        if unreachable > 0 {
            tracing::warn!(
                "⚠️ {} node(s) unreachable from start node '{}', loop detection skipped for them",
                unreachable,
                records[start.0].id
            );
        }

        Ok(Self {
            index,
            start,
            targets,
            inputs,
            loops,
            topo,
        })
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn node_id(&self, id: &str) -> Option<NodeId> {
        self.index.get(id).copied()
    }

    pub fn input_transitions(&self, node: NodeId) -> &[TransitionRef] {
        &self.inputs[node.0]
    }

    pub fn target(&self, transition: TransitionRef) -> NodeId {
        self.targets[transition.source.0][transition.index]
    }

    pub fn is_loop(&self, transition: TransitionRef) -> bool {
        self.loops[transition.source.0][transition.index]
    }

    pub fn topological_number(&self, node: NodeId) -> Option<usize> {
        self.topo[node.0]
    }

    /// Nodes that cannot be reached from the start node
    pub fn unreachable(&self) -> Vec<NodeId> {
        self.topo
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_none())
            .map(|(position, _)| NodeId(position))
            .collect()
    }
}

type Targets = Vec<Vec<NodeId>>;
type Inputs = Vec<Vec<TransitionRef>>;

/// Resolve output targets and register each one as an input of its target
fn compute_transitions(
    records: &[NodeRecord],
    index: &HashMap<String, NodeId>,
) -> Result<(Targets, Inputs), GraphAssemblyError> {
    let mut targets = Vec::with_capacity(records.len());
    let mut inputs: Inputs = vec![Vec::new(); records.len()];

    for (position, record) in records.iter().enumerate() {
        let mut resolved = Vec::with_capacity(record.transitions.len());
        for (t_index, transition) in record.transitions.iter().enumerate() {
            let target = index.get(&transition.target).copied().ok_or_else(|| {
                GraphAssemblyError::UnknownTransitionTarget {
                    node: record.id.clone(),
                    transition: transition.id.clone(),
                    target: transition.target.clone(),
                }
            })?;
            inputs[target.0].push(TransitionRef {
                source: NodeId(position),
                index: t_index,
            });
            resolved.push(target);
        }
        targets.push(resolved);
    }

    Ok((targets, inputs))
}

/// Reverse DFS post-order from the start node
fn topological_numbers(len: usize, start: NodeId, targets: &Targets) -> Vec<Option<usize>> {
    let mut graph: DiGraph<(), ()> = DiGraph::with_capacity(len, targets.iter().map(Vec::len).sum());
    for _ in 0..len {
        graph.add_node(());
    }
    // petgraph walks the most recently added edge first, so add them reversed
    // to explore successors in declaration order.
    for (source, outputs) in targets.iter().enumerate() {
        for target in outputs.iter().rev() {
            graph.add_edge(NodeIndex::new(source), NodeIndex::new(target.0), ());
        }
    }

    let mut post_order = Vec::with_capacity(len);
    let mut dfs = DfsPostOrder::new(&graph, NodeIndex::new(start.0));
    while let Some(node) = dfs.next(&graph) {
        post_order.push(node.index());
    }

    let mut topo = vec![None; len];
    for (number, node) in post_order.into_iter().rev().enumerate() {
        topo[node] = Some(number);
    }
    topo
}

/// A transition is a loop when its target does not come after its source
fn compute_loop_transitions(targets: &Targets, topo: &[Option<usize>]) -> Vec<Vec<bool>> {
    targets
        .iter()
        .enumerate()
        .map(|(source, outputs)| {
            outputs
                .iter()
                .map(|target| match (topo[source], topo[target.0]) {
                    (Some(s), Some(t)) => t <= s,
                    _ => false,
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{MergePolicy, NodeRecord};

    fn loop_flag(graph: &Graph, records: &[NodeRecord], source: &str, target: &str) -> bool {
        let source_id = graph.node_id(source).unwrap();
        let index = records[source_id.0]
            .transitions
            .iter()
            .position(|t| t.target == target)
            .unwrap();
        graph.is_loop(TransitionRef {
            source: source_id,
            index,
        })
    }

    #[test]
    fn requires_exactly_one_start_node() {
        let none = vec![NodeRecord::new("a").stop()];
        assert_eq!(
            Graph::assemble(&none).unwrap_err(),
            GraphAssemblyError::MissingOrDuplicateStartNode { count: 0 }
        );

        let two = vec![NodeRecord::new("a").start(), NodeRecord::new("b").start()];
        assert_eq!(
            Graph::assemble(&two).unwrap_err(),
            GraphAssemblyError::MissingOrDuplicateStartNode { count: 2 }
        );

        let one = vec![NodeRecord::new("a").start().to("b"), NodeRecord::new("b").stop()];
        let graph = Graph::assemble(&one).unwrap();
        assert_eq!(graph.start(), NodeId(0));
    }

    #[test]
    fn rejects_duplicate_identities_and_unknown_targets() {
        let dup = vec![NodeRecord::new("a").start(), NodeRecord::new("a")];
        assert_eq!(
            Graph::assemble(&dup).unwrap_err(),
            GraphAssemblyError::DuplicateNodeIdentity("a".into())
        );

        let dangling = vec![NodeRecord::new("a").start().to("ghost")];
        assert!(matches!(
            Graph::assemble(&dangling).unwrap_err(),
            GraphAssemblyError::UnknownTransitionTarget { target, .. } if target == "ghost"
        ));
    }

    #[test]
    fn classifies_back_edge_regardless_of_declaration_order() {
        let orders: Vec<Vec<NodeRecord>> = vec![
            vec![
                NodeRecord::new("A").start().to("B"),
                NodeRecord::new("B").to("C"),
                NodeRecord::new("C").to("A"),
            ],
            vec![
                NodeRecord::new("C").to("A"),
                NodeRecord::new("B").to("C"),
                NodeRecord::new("A").start().to("B"),
            ],
        ];

        for records in orders {
            let graph = Graph::assemble(&records).unwrap();
            assert!(!loop_flag(&graph, &records, "A", "B"));
            assert!(!loop_flag(&graph, &records, "B", "C"));
            assert!(loop_flag(&graph, &records, "C", "A"));
        }
    }

    #[test]
    fn self_transition_is_a_loop() {
        let records = vec![
            NodeRecord::new("a").start().to("a").to("b"),
            NodeRecord::new("b").stop(),
        ];
        let graph = Graph::assemble(&records).unwrap();
        assert!(loop_flag(&graph, &records, "a", "a"));
        assert!(!loop_flag(&graph, &records, "a", "b"));
    }

    #[test]
    fn derives_inputs_from_outputs() {
        let records = vec![
            NodeRecord::new("s").start().to("a").to("b"),
            NodeRecord::new("a").to("m"),
            NodeRecord::new("b").to("m"),
            NodeRecord::new("m").merge(MergePolicy::All).to("end"),
            NodeRecord::new("end").stop(),
        ];
        let graph = Graph::assemble(&records).unwrap();
        let m = graph.node_id("m").unwrap();
        let sources: Vec<&str> = graph
            .input_transitions(m)
            .iter()
            .map(|t| records[t.source.0].id.as_str())
            .collect();
        assert_eq!(sources, vec!["a", "b"]);
        assert!(graph.input_transitions(graph.start()).is_empty());
    }

    #[test]
    fn unreachable_nodes_are_kept_without_loop_classification() {
        let records = vec![
            NodeRecord::new("s").start().to("end"),
            NodeRecord::new("end").stop(),
            NodeRecord::new("orphan").to("orphan"),
        ];
        let graph = Graph::assemble(&records).unwrap();
        let orphan = graph.node_id("orphan").unwrap();
        assert_eq!(graph.unreachable(), vec![orphan]);
        assert_eq!(graph.topological_number(orphan), None);
        assert!(!loop_flag(&graph, &records, "orphan", "orphan"));
    }

    #[test]
    fn assembly_is_deterministic() {
        let records = vec![
            NodeRecord::new("s").start().to("a").to("b"),
            NodeRecord::new("a").to("b"),
            NodeRecord::new("b").to("s").to("end"),
            NodeRecord::new("end").stop(),
        ];
        let first = Graph::assemble(&records).unwrap();
        let second = Graph::assemble(&records).unwrap();
        for node in 0..records.len() {
            assert_eq!(
                first.topological_number(NodeId(node)),
                second.topological_number(NodeId(node))
            );
        }
        assert!(loop_flag(&first, &records, "b", "s"));
        assert!(!loop_flag(&first, &records, "a", "b"));
    }
}
