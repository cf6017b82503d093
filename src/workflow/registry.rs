/// Hot-reload model registry using ArcSwap
///
/// Readers (the routing service, sub-route launches) get lock-free snapshots while
/// writers swap in a fresh map. Every model is assembled once on the way in so that
/// a definition which can never run is rejected at registration time.

use crate::workflow::{
    graph::Graph,
    storage::WorkflowStorage,
    types::WorkflowModel,
};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free registry of workflow models
#[derive(Debug)]
pub struct WorkflowRegistry {
    models: ArcSwap<HashMap<String, CompiledModel>>,
    storage: WorkflowStorage,
}

/// A model that passed graph assembly
#[derive(Debug, Clone)]
pub struct CompiledModel {
    pub model: Arc<WorkflowModel>,
    pub start_node_id: String,
    /// Nodes no path from the start node reaches
    pub unreachable_node_ids: Vec<String>,
}

impl WorkflowRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            models: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    pub fn storage(&self) -> &WorkflowStorage {
        &self.storage
    }

    /// Load and compile every stored model
    ///
    /// A model that no longer assembles is skipped with an error log rather than
    /// preventing the others from loading.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_models().await?;
        let mut compiled = HashMap::with_capacity(stored.len());
        for (id, model) in stored {
            match compile(model) {
                Ok(model) => {
                    compiled.insert(id, model);
                }
                Err(e) => tracing::error!("❌ Skipping stored model {}: {}", id, e),
            }
        }

        self.models.store(Arc::new(compiled));
        tracing::info!("📚 Initialized model registry with {} models", self.models.load().len());
        Ok(())
    }

    /// Compile, persist and publish a model
    pub async fn save_model(&self, model: WorkflowModel) -> Result<CompiledModel> {
        let compiled = compile(model)?;
        self.storage.save_model(&compiled.model).await?;
        self.publish(compiled.clone());
        tracing::info!("🔥 Hot-reloaded model: {}", compiled.model.id);
        Ok(compiled)
    }

    /// Re-read a single model from storage
    pub async fn reload_model(&self, model_id: &str) -> Result<()> {
        let model = self
            .storage
            .get_model(model_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Model not found: {}", model_id))?;
        self.publish(compile(model)?);
        tracing::info!("🔥 Hot-reloaded model: {}", model_id);
        Ok(())
    }

    pub fn get_model(&self, model_id: &str) -> Option<CompiledModel> {
        self.models.load().get(model_id).cloned()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.load().contains_key(model_id)
    }

    pub fn list_model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a model from memory and storage; running instances keep their copy
    pub async fn remove_model(&self, model_id: &str) -> Result<bool> {
        let current = self.models.load();
        let mut next = (**current).clone();
        if next.remove(model_id).is_some() {
            self.models.store(Arc::new(next));
            tracing::info!("🗑️ Removed model from registry: {}", model_id);
        }
        self.storage.delete_model(model_id).await
    }

    fn publish(&self, compiled: CompiledModel) {
        self.models.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(compiled.model.id.clone(), compiled.clone());
            next
        });
    }
}

fn compile(model: WorkflowModel) -> Result<CompiledModel> {
    if model.id.is_empty() {
        return Err(anyhow::anyhow!("Model id must not be empty"));
    }
    let graph =
        Graph::assemble(&model.nodes).with_context(|| format!("Model {} is invalid", model.id))?;

    let start_node_id = model.nodes[graph.start().0].id.clone();
    let unreachable_node_ids = graph
        .unreachable()
        .into_iter()
        .map(|id| model.nodes[id.0].id.clone())
        .collect();

    Ok(CompiledModel {
        model: Arc::new(model),
        start_node_id,
        unreachable_node_ids,
    })
}
