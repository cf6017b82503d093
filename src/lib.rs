/// Routeway: graph-based document routing engine
///
/// This library provides a workflow engine that drives instances through a
/// directed graph of nodes: human tasks suspend a node until completed, merge nodes
/// join parallel branches, sub-routes run child instances, and Lua chains and
/// conditions decide what fires.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Workflow management layer - model/instance types, graph assembly, storage and registry
pub mod workflow;

// Runtime execution engine - node state machine, scheduler, merge and suspend/resume
pub mod runtime;

// HTTP API layer - REST endpoints for models, instances and tasks
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, GraphAssemblyError};
pub use runtime::{ExecutionEngine, PassOutcome, ResumeSignal, RoutingService};
pub use server::start_server;
pub use workflow::{NodeRecord, TransitionRecord, WorkflowInstance, WorkflowModel};
