/// Routing service: the async front door to the engine
///
/// Owns the instance store and serializes every operation through one lock, so two
/// signals for the same instance (for example two tasks of a multi-task node
/// completing at once) never interleave. An operation may fan out into follow-up
/// signals: sub-route launches, a finished child resuming its parent, a canceled
/// parent canceling its children. These are processed in order within the same
/// operation against copies of the touched instances, and the copies are persisted
/// and published together only when every step succeeded. Task, permission and
/// event calls recorded along the way are applied after that commit.

use crate::{
    error::{CollaboratorError, EngineError, EngineResult},
    runtime::{
        collaborators::{Collaborators, SubRouteLauncher, SubRouteRequest},
        effects::Effects,
        engine::{ExecutionEngine, PassOutcome, ResumeSignal, ResumeTarget},
    },
    workflow::{
        registry::WorkflowRegistry,
        types::{InstanceStatus, NodeState, ParentLink, Variables, WorkflowInstance},
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Parameters for starting an instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub documents: Vec<String>,
    pub initiator: String,
    #[serde(default)]
    pub variables: Variables,
}

/// Listing entry for an instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub model_id: String,
    pub status: InstanceStatus,
    pub initiator: String,
    pub parent: Option<ParentLink>,
    pub suspended: Vec<String>,
    pub open_tasks: usize,
}

impl From<&WorkflowInstance> for InstanceSummary {
    fn from(instance: &WorkflowInstance) -> Self {
        Self {
            id: instance.id.clone(),
            model_id: instance.model_id.clone(),
            status: instance.status,
            initiator: instance.initiator.clone(),
            parent: instance.parent.clone(),
            suspended: instance.nodes_in_state(NodeState::Suspended),
            open_tasks: instance.open_task_ids().len(),
        }
    }
}

/// Work queued while processing one operation
#[derive(Debug)]
enum Signal {
    Start {
        id: String,
        model_id: String,
        request: StartRequest,
        parent: Option<ParentLink>,
    },
    Resume {
        instance_id: String,
        signal: ResumeSignal,
    },
    ChildCompleted {
        parent: ParentLink,
        child: String,
        actor: String,
    },
    Cancel {
        instance_id: String,
        /// Requested by a caller rather than by a parent's cancellation
        explicit: bool,
    },
}

#[derive(Debug)]
struct Launch {
    id: String,
    request: SubRouteRequest,
}

/// Sub-route launcher that records launches for the service to carry out
///
/// Launch requests are validated against the registry right away so that a bad
/// model id fails the parent's pass instead of a later step. Child cancellations
/// reach the service as recorded effects and never come through here.
#[derive(Debug)]
struct SubRouteOutbox {
    registry: Arc<WorkflowRegistry>,
    pending: Mutex<Vec<Launch>>,
}

impl SubRouteOutbox {
    fn drain(&self) -> Vec<Launch> {
        self.pending
            .lock()
            .map(|mut pending| pending.drain(..).collect())
            .unwrap_or_default()
    }
}

impl SubRouteLauncher for SubRouteOutbox {
    fn start_sub_route(&self, request: SubRouteRequest) -> Result<String, CollaboratorError> {
        if !self.registry.contains(&request.model_id) {
            return Err(CollaboratorError::UnknownSubRouteModel(request.model_id));
        }
        let id = Uuid::new_v4().to_string();
        self.pending
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("sub-route outbox lock poisoned".into()))?
            .push(Launch {
                id: id.clone(),
                request,
            });
        Ok(id)
    }

    fn cancel_sub_route(&self, instance_id: &str) -> Result<(), CollaboratorError> {
        tracing::debug!("Sub-route {} cancellation is handled as a signal", instance_id);
        Ok(())
    }
}

/// Copy-on-write view over the committed instances
struct Transaction<'a> {
    committed: &'a HashMap<String, WorkflowInstance>,
    touched: HashMap<String, WorkflowInstance>,
}

impl<'a> Transaction<'a> {
    fn new(committed: &'a HashMap<String, WorkflowInstance>) -> Self {
        Self {
            committed,
            touched: HashMap::new(),
        }
    }

    fn get_mut(&mut self, id: &str) -> EngineResult<&mut WorkflowInstance> {
        match self.touched.entry(id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let instance = self
                    .committed
                    .get(id)
                    .cloned()
                    .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
                Ok(entry.insert(instance))
            }
        }
    }

    fn insert(&mut self, instance: WorkflowInstance) {
        self.touched.insert(instance.id.clone(), instance);
    }
}

/// Result of a service operation on its primary instance
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub instance: WorkflowInstance,
    pub outcome: Option<PassOutcome>,
}

pub struct RoutingService {
    registry: Arc<WorkflowRegistry>,
    engine: ExecutionEngine,
    outbox: Arc<SubRouteOutbox>,
    instances: AsyncMutex<HashMap<String, WorkflowInstance>>,
}

impl RoutingService {
    /// Build the service; the sub-route launcher in `collaborators` is replaced
    /// by the service's own
    pub fn new(registry: Arc<WorkflowRegistry>, collaborators: Collaborators) -> Self {
        Self::with_max_loops(registry, collaborators, crate::runtime::engine::DEFAULT_MAX_LOOPS)
    }

    pub fn with_max_loops(
        registry: Arc<WorkflowRegistry>,
        collaborators: Collaborators,
        max_loops: usize,
    ) -> Self {
        let outbox = Arc::new(SubRouteOutbox {
            registry: Arc::clone(&registry),
            pending: Mutex::new(Vec::new()),
        });
        let collaborators = collaborators.with_sub_routes(outbox.clone());
        Self {
            registry,
            engine: ExecutionEngine::new(collaborators).with_max_loops(max_loops),
            outbox,
            instances: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Load persisted instance snapshots into memory
    pub async fn load_from_storage(&self) -> anyhow::Result<usize> {
        let stored = self.registry.storage().load_all_instances().await?;
        let mut instances = self.instances.lock().await;
        for instance in stored {
            instances.insert(instance.id.clone(), instance);
        }
        tracing::info!("📥 Loaded {} workflow instances from storage", instances.len());
        Ok(instances.len())
    }

    /// Instantiate a model and run it from its start node
    pub async fn start(&self, model_id: &str, request: StartRequest) -> EngineResult<OperationReport> {
        let id = Uuid::new_v4().to_string();
        self.execute(
            &id,
            Signal::Start {
                id: id.clone(),
                model_id: model_id.to_string(),
                request,
                parent: None,
            },
        )
        .await
    }

    pub async fn resume(&self, instance_id: &str, signal: ResumeSignal) -> EngineResult<OperationReport> {
        self.execute(
            instance_id,
            Signal::Resume {
                instance_id: instance_id.to_string(),
                signal,
            },
        )
        .await
    }

    /// Complete a task; the owning instance is looked up from the task id
    pub async fn complete_task(&self, signal: ResumeSignal) -> EngineResult<OperationReport> {
        let ResumeTarget::Task(task_id) = &signal.target else {
            return Err(EngineError::invalid_target("node", "expected a task target"));
        };
        let instance_id = self.instance_for_task(task_id).await?;
        self.resume(&instance_id, signal).await
    }

    pub async fn cancel(&self, instance_id: &str) -> EngineResult<OperationReport> {
        self.execute(
            instance_id,
            Signal::Cancel {
                instance_id: instance_id.to_string(),
                explicit: true,
            },
        )
        .await
    }

    pub async fn reassign_task(
        &self,
        task_id: &str,
        actors: Vec<String>,
        comment: Option<String>,
    ) -> EngineResult<WorkflowInstance> {
        let instance_id = self.instance_for_task(task_id).await?;
        self.mutate(&instance_id, |engine, instance, effects| {
            engine.reassign_recorded(instance, task_id, &actors, comment.as_deref(), effects)
        })
        .await
    }

    pub async fn delegate_task(
        &self,
        task_id: &str,
        actors: Vec<String>,
        comment: Option<String>,
    ) -> EngineResult<WorkflowInstance> {
        let instance_id = self.instance_for_task(task_id).await?;
        self.mutate(&instance_id, |engine, instance, effects| {
            engine.delegate_recorded(instance, task_id, &actors, comment.as_deref(), effects)
        })
        .await
    }

    /// Evaluate escalation rules on one instance
    pub async fn escalate(&self, instance_id: &str) -> EngineResult<usize> {
        let mut fired = 0;
        self.mutate(instance_id, |engine, instance, effects| {
            fired = engine.escalations_recorded(instance, effects)?;
            Ok(())
        })
        .await?;
        Ok(fired)
    }

    /// Evaluate escalation rules on every running instance
    ///
    /// A failing instance is logged and skipped; the others still escalate.
    pub async fn run_escalations(&self) -> EngineResult<usize> {
        let mut store = self.instances.lock().await;
        let effects = Effects::new();
        let mut changed = Vec::new();
        let mut fired = 0;

        for instance in store.values().filter(|i| i.is_running()) {
            let mut working = instance.clone();
            match self.engine.escalations_recorded(&mut working, &effects) {
                Ok(0) => {}
                Ok(n) => {
                    fired += n;
                    changed.push(working);
                }
                Err(e) => tracing::error!("❌ Escalation failed for instance {}: {}", instance.id, e),
            }
        }

        if !changed.is_empty() {
            self.registry
                .storage()
                .save_instances(changed.iter())
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            for instance in changed {
                store.insert(instance.id.clone(), instance);
            }
        }
        effects.apply(self.engine.collaborators());
        Ok(fired)
    }

    pub async fn instance(&self, instance_id: &str) -> Option<WorkflowInstance> {
        self.instances.lock().await.get(instance_id).cloned()
    }

    pub async fn list_instances(&self) -> Vec<InstanceSummary> {
        let store = self.instances.lock().await;
        let mut summaries: Vec<InstanceSummary> = store.values().map(InstanceSummary::from).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    async fn instance_for_task(&self, task_id: &str) -> EngineResult<String> {
        let store = self.instances.lock().await;
        store
            .values()
            .find(|i| i.node_for_task(task_id).is_some())
            .map(|i| i.id.clone())
            .ok_or_else(|| EngineError::invalid_target(task_id, "unknown task"))
    }

    /// Apply a single-instance engine call without follow-up signals
    async fn mutate<F>(&self, instance_id: &str, change: F) -> EngineResult<WorkflowInstance>
    where
        F: FnOnce(&ExecutionEngine, &mut WorkflowInstance, &Effects) -> EngineResult<()>,
    {
        let mut store = self.instances.lock().await;
        let mut working = store
            .get(instance_id)
            .cloned()
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        let effects = Effects::new();
        change(&self.engine, &mut working, &effects)?;

        self.registry
            .storage()
            .save_instances([&working])
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        store.insert(working.id.clone(), working.clone());
        effects.apply(self.engine.collaborators());
        Ok(working)
    }

    /// Process a signal and its follow-ups, then commit all touched instances
    async fn execute(&self, primary: &str, first: Signal) -> EngineResult<OperationReport> {
        let mut store = self.instances.lock().await;
        // Leftovers can only come from an aborted operation
        self.outbox.drain();

        let mut tx = Transaction::new(&store);
        let effects = Effects::new();
        let mut signals = VecDeque::from([first]);
        let mut primary_outcome = None;

        while let Some(signal) = signals.pop_front() {
            tracing::debug!("📨 Processing signal {:?}", signal);
            let outcome = match self.apply(&mut tx, signal, &mut signals, &effects) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.outbox.drain();
                    tracing::error!("❌ Routing operation on {} failed: {}", primary, e);
                    return Err(e);
                }
            };
            if let Some(outcome) = outcome {
                if outcome.instance_id == primary && primary_outcome.is_none() {
                    primary_outcome = Some(outcome);
                }
            }

            for Launch { id, request } in self.outbox.drain() {
                signals.push_back(Signal::Start {
                    id,
                    model_id: request.model_id,
                    request: StartRequest {
                        documents: request.documents,
                        initiator: request.initiator,
                        variables: request.variables,
                    },
                    parent: Some(request.parent),
                });
            }
            for instance_id in effects.take_sub_route_cancels() {
                signals.push_back(Signal::Cancel {
                    instance_id,
                    explicit: false,
                });
            }
        }

        let touched = tx.touched;
        self.registry
            .storage()
            .save_instances(touched.values())
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        store.extend(touched);
        effects.apply(self.engine.collaborators());

        let instance = store
            .get(primary)
            .cloned()
            .ok_or_else(|| EngineError::InstanceNotFound(primary.to_string()))?;
        Ok(OperationReport {
            instance,
            outcome: primary_outcome,
        })
    }

    fn apply(
        &self,
        tx: &mut Transaction<'_>,
        signal: Signal,
        signals: &mut VecDeque<Signal>,
        effects: &Effects,
    ) -> EngineResult<Option<PassOutcome>> {
        match signal {
            Signal::Start {
                id,
                model_id,
                request,
                parent,
            } => {
                let compiled = self
                    .registry
                    .get_model(&model_id)
                    .ok_or_else(|| EngineError::UnknownModel(model_id.clone()))?;
                let mut instance =
                    WorkflowInstance::from_model(id, &compiled.model, request.documents, request.initiator);
                instance.parent = parent;

                let outcome = self.engine.run_recorded(&mut instance, request.variables, effects)?;
                Self::follow_up(&instance, &outcome, signals);
                tx.insert(instance);
                Ok(Some(outcome))
            }
            Signal::Resume { instance_id, signal } => {
                let instance = tx.get_mut(&instance_id)?;
                let outcome = self.engine.resume_recorded(instance, &signal, None, effects)?;
                Self::follow_up(instance, &outcome, signals);
                Ok(Some(outcome))
            }
            Signal::ChildCompleted { parent, child, actor } => {
                let Ok(instance) = tx.get_mut(&parent.instance_id) else {
                    tracing::warn!("⚠️ Parent instance {} of finished sub-route is gone", parent.instance_id);
                    return Ok(None);
                };
                let waiting = instance
                    .find_node(&parent.node_id)
                    .map(|n| {
                        n.state == NodeState::Suspended
                            && n.sub_route_instance_id.as_deref() == Some(child.as_str())
                    })
                    .unwrap_or(false);
                if !instance.is_running() || !waiting {
                    tracing::warn!(
                        "⚠️ Parent node {} of instance {} no longer waits for sub-route {}",
                        parent.node_id,
                        parent.instance_id,
                        child
                    );
                    return Ok(None);
                }

                let signal = ResumeSignal::node(parent.node_id.clone(), actor);
                let outcome = self
                    .engine
                    .resume_recorded(instance, &signal, Some(&child), effects)?;
                Self::follow_up(instance, &outcome, signals);
                Ok(Some(outcome))
            }
            Signal::Cancel {
                instance_id,
                explicit,
            } => {
                let instance = match tx.get_mut(&instance_id) {
                    Ok(instance) => instance,
                    Err(e) if explicit => return Err(e),
                    Err(_) => {
                        tracing::warn!("⚠️ Sub-route {} to cancel is gone", instance_id);
                        return Ok(None);
                    }
                };
                self.engine.cancel_recorded(instance, effects);
                Ok(None)
            }
        }
    }

    fn follow_up(instance: &WorkflowInstance, outcome: &PassOutcome, signals: &mut VecDeque<Signal>) {
        if let Some(parent) = &outcome.completed_parent {
            signals.push_back(Signal::ChildCompleted {
                parent: parent.clone(),
                child: instance.id.clone(),
                actor: instance.initiator.clone(),
            });
        }
    }
}
