/// SQLite persistence layer for models, instances and automation chains
///
/// Definitions and instance snapshots are stored as JSON documents next to a few
/// indexed lookup columns. Instance snapshots touched by one routing operation are
/// written inside a single transaction.

use crate::workflow::types::{WorkflowInstance, WorkflowModel};
use anyhow::Result;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Row,
};
use std::{collections::HashMap, str::FromStr};

/// SQLite-backed storage manager
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

impl WorkflowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and initialise the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Private in-memory database; one connection so every query sees the same data
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and indexes; safe to call repeatedly
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_models (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                status TEXT NOT NULL,
                parent_id TEXT,
                snapshot TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workflow_instances_status
            ON workflow_instances(status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS automation_chains (
                id TEXT PRIMARY KEY,
                script TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn save_model(&self, model: &WorkflowModel) -> Result<()> {
        let definition = serde_json::to_string(model)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_models (id, name, definition, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&model.id)
        .bind(&model.name)
        .bind(&definition)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_model(&self, id: &str) -> Result<Option<WorkflowModel>> {
        let row = sqlx::query("SELECT definition FROM workflow_models WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition: String = row.try_get("definition")?;
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }

    pub async fn list_models(&self) -> Result<Vec<ModelMetadata>> {
        let rows = sqlx::query(
            "SELECT id, name, updated_at FROM workflow_models ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            models.push(ModelMetadata {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(models)
    }

    pub async fn load_all_models(&self) -> Result<HashMap<String, WorkflowModel>> {
        let rows = sqlx::query("SELECT id, definition FROM workflow_models")
            .fetch_all(&self.pool)
            .await?;

        let mut models = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let definition: String = row.try_get("definition")?;
            models.insert(id, serde_json::from_str(&definition)?);
        }
        Ok(models)
    }

    pub async fn delete_model(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflow_models WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist a set of instance snapshots atomically
    pub async fn save_instances<'a, I>(&self, instances: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a WorkflowInstance>,
    {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();
        for instance in instances {
            let snapshot = serde_json::to_string(instance)?;
            sqlx::query(
                r#"
                INSERT INTO workflow_instances (id, model_id, status, parent_id, snapshot, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    snapshot = excluded.snapshot,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&instance.id)
            .bind(&instance.model_id)
            .bind(instance.status.to_string())
            .bind(instance.parent.as_ref().map(|p| p.instance_id.clone()))
            .bind(&snapshot)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_instance(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        let row = sqlx::query("SELECT snapshot FROM workflow_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let snapshot: String = row.try_get("snapshot")?;
                Ok(Some(serde_json::from_str(&snapshot)?))
            }
            None => Ok(None),
        }
    }

    pub async fn load_all_instances(&self) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query("SELECT snapshot FROM workflow_instances")
            .fetch_all(&self.pool)
            .await?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            let snapshot: String = row.try_get("snapshot")?;
            instances.push(serde_json::from_str(&snapshot)?);
        }
        Ok(instances)
    }

    pub async fn save_chain(&self, id: &str, script: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_chains (id, script, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                script = excluded.script,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(script)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_all_chains(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT id, script FROM automation_chains")
            .fetch_all(&self.pool)
            .await?;

        let mut chains = HashMap::with_capacity(rows.len());
        for row in rows {
            chains.insert(row.try_get("id")?, row.try_get("script")?);
        }
        Ok(chains)
    }
}

/// Model listing entry
#[derive(Debug, serde::Serialize)]
pub struct ModelMetadata {
    pub id: String,
    pub name: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{InstanceStatus, NodeRecord, Variables};

    fn sample_model() -> WorkflowModel {
        WorkflowModel {
            id: "review".into(),
            name: "Review".into(),
            variables: Variables::new(),
            nodes: vec![NodeRecord::new("s").start().to("e"), NodeRecord::new("e").stop()],
        }
    }

    #[tokio::test]
    async fn model_upsert_keeps_one_row() {
        let storage = WorkflowStorage::in_memory().await.unwrap();
        let mut model = sample_model();
        storage.save_model(&model).await.unwrap();
        model.name = "Review v2".into();
        storage.save_model(&model).await.unwrap();

        let listed = storage.list_models().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Review v2");
        assert_eq!(storage.get_model("review").await.unwrap(), Some(model));
    }

    #[tokio::test]
    async fn instance_snapshots_round_trip_in_one_transaction() {
        let storage = WorkflowStorage::in_memory().await.unwrap();
        let model = sample_model();
        let mut first = WorkflowInstance::from_model("i1", &model, vec!["doc-1".into()], "alice");
        let second = WorkflowInstance::from_model("i2", &model, vec![], "bob");
        storage.save_instances([&first, &second]).await.unwrap();

        first.status = InstanceStatus::Done;
        storage.save_instances([&first]).await.unwrap();

        let loaded = storage.get_instance("i1").await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Done);
        assert_eq!(loaded.documents, vec!["doc-1".to_string()]);
        assert_eq!(storage.load_all_instances().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn chains_are_upserted() {
        let storage = WorkflowStorage::in_memory().await.unwrap();
        storage.save_chain("notify", "x = 1").await.unwrap();
        storage.save_chain("notify", "x = 2").await.unwrap();
        let chains = storage.load_all_chains().await.unwrap();
        assert_eq!(chains.get("notify").map(String::as_str), Some("x = 2"));
    }
}
