/// Workflow definition layer
///
/// Persisted records (models, instances, nodes), graph assembly over those records,
/// SQLite storage and the lock-free model registry.

// Model, instance and node record types
pub mod types;

// Graph assembler: identities, input edges, start node, loop classification
pub mod graph;

// SQLite persistence for models, instances and automation chains
pub mod storage;

// Hot-reload model registry using ArcSwap
pub mod registry;

pub use graph::{Graph, TransitionRef};
pub use types::{
    InstanceStatus, MergePolicy, NodeId, NodeRecord, NodeState, TransitionRecord, Variables,
    WorkflowInstance, WorkflowModel,
};
