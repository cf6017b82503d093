/// Background escalation scheduler
///
/// Periodically evaluates the escalation rules of every suspended node through the
/// routing service, using tokio-cron-scheduler.

use crate::runtime::service::RoutingService;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub struct EscalationScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    job: RwLock<Option<Uuid>>,
    service: Arc<RoutingService>,
    schedule: String,
}

impl EscalationScheduler {
    /// `schedule` is a six-field cron expression (seconds first)
    pub async fn new(service: Arc<RoutingService>, schedule: impl Into<String>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job: RwLock::new(None),
            service,
            schedule: schedule.into(),
        })
    }

    pub fn schedule(&self) -> &str {
        &self.schedule
    }

    /// Register the escalation job and start ticking
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting escalation scheduler ({})", self.schedule);

        let service = Arc::clone(&self.service);
        let job = Job::new_async(self.schedule.as_str(), move |_uuid, _l| {
            let service = Arc::clone(&service);

            Box::pin(async move {
                tracing::debug!("🔔 Escalation tick");
                match service.run_escalations().await {
                    Ok(0) => {}
                    Ok(fired) => tracing::info!("✅ Executed {} escalation rule(s)", fired),
                    Err(e) => tracing::error!("❌ Escalation run failed: {}", e),
                }
            })
        })?;

        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            let job_uuid = scheduler.add(job).await?;
            scheduler.start().await?;
            job_uuid
        };
        *self.job.write().await = Some(job_uuid);

        tracing::info!("✅ Escalation scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping escalation scheduler");

        if let Some(job_uuid) = self.job.write().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&job_uuid).await {
                tracing::warn!("⚠️ Failed to remove escalation job: {}", e);
            }
        }
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Escalation scheduler stopped");
        Ok(())
    }
}
