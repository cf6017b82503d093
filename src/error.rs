/// Error taxonomy for the routing engine
///
/// Assembly errors mean an instance can never run. Execution errors abort the
/// current pass; the caller keeps the last committed snapshot. Collaborator errors
/// wrap failures reported by chains, expressions, task or permission services.

use thiserror::Error;

/// Failures while building the in-memory graph from node records
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphAssemblyError {
    #[error("duplicate node identity: {0}")]
    DuplicateNodeIdentity(String),

    #[error("expected exactly one start node, found {count}")]
    MissingOrDuplicateStartNode { count: usize },

    #[error("transition '{transition}' of node '{node}' targets unknown node '{target}'")]
    UnknownTransitionTarget {
        node: String,
        transition: String,
        target: String,
    },
}

/// Failures reported by outbound collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("automation chain '{0}' is not registered")]
    UnknownChain(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("expression '{0}' does not evaluate to a boolean")]
    NotBoolean(String),

    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error("assignees expression '{0}' must yield a string or a list of strings")]
    InvalidAssignees(String),

    #[error("due date expression '{0}' must yield an RFC3339 date or a number of days")]
    InvalidDueDate(String),

    #[error("sub-route model not found: {0}")]
    UnknownSubRouteModel(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Engine-level error returned by run, resume, cancel and the service layer
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("graph assembly failed: {0}")]
    GraphAssembly(#[from] GraphAssemblyError),

    #[error("execution loop detected on node '{node_id}' after {limit} iterations")]
    ExecutionLoopDetected { node_id: String, limit: usize },

    #[error("no transition evaluated to true on node '{0}'")]
    NoTransitionFired(String),

    #[error("stop node '{node_id}' fired while nodes were still queued: {pending:?}")]
    PrematureStop { node_id: String, pending: Vec<String> },

    #[error("invalid resume target '{target}': {reason}")]
    InvalidResumeTarget { target: String, reason: String },

    #[error("node '{0}' reached SUSPENDED without a resume signal")]
    UnexpectedSuspendedState(String),

    #[error("node '{0}' requires tasks but no assignee was resolved")]
    NoTaskAssignees(String),

    #[error("node '{0}' does not allow task reassignment")]
    ReassignmentNotAllowed(String),

    #[error("instance '{id}' is {status}")]
    InstanceNotRunning { id: String, status: String },

    #[error("workflow model not found: {0}")]
    UnknownModel(String),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub(crate) fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResumeTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
