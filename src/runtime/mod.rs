/// Runtime execution engine
///
/// This module drives workflow instances through their node graphs:
/// - Per-node state machine and the work-queue scheduler
/// - Merge/join coordination and branch cancellation
/// - Suspension on tasks and sub-routes, and resumption from completion signals
/// - Lua-backed chains and conditions, in-memory task/permission/event services
/// - The async routing service and its escalation scheduler

// Outbound collaborator contracts and the node execution context
pub mod collaborators;

// Lua sandbox implementing chains and expressions
pub mod scripting;

// In-memory task, permission and event services
pub mod memory;

// Node state machine
pub mod executor;

// Merge policies and sibling branch cancellation
pub mod merge;

// Task and sub-route plumbing for suspended nodes
pub mod bridge;

// Collaborator calls held back until a pass commits
pub mod effects;

// Pass scheduling and inbound operations
pub mod engine;

// Serialized async access to instances
pub mod service;

// Background escalation cron
pub mod scheduler;

pub use collaborators::{Collaborators, NodeContext, Task, TaskStatus, VariableChanges};
pub use effects::{Effect, Effects};
pub use engine::{ExecutionEngine, PassOutcome, ResumeSignal, ResumeTarget, DEFAULT_MAX_LOOPS};
pub use memory::{AuditLog, InMemoryPermissions, InMemoryTaskService};
pub use scheduler::EscalationScheduler;
pub use scripting::LuaScripting;
pub use service::{InstanceSummary, OperationReport, RoutingService, StartRequest};
