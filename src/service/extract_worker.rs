//! Extract worker: runs the extraction pipeline for claimed extract jobs.
//!
//! Cancellation is cooperative. A watchdog task polls the job row and
//! flips an in-process flag; the pipeline checks that flag between
//! sources and chunks. Work committed before the flag flips is kept.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{ExtractPayload, Job, Project};
use crate::error::{AppError, Result};
use crate::repository::{JobRepository, ProjectRepository};
use crate::service::alerting::AlertService;
use crate::service::extraction::pipeline::ExtractionPipeline;

/// How often the watchdog polls for a cancellation request.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub struct ExtractWorker {
    jobs: JobRepository,
    projects: ProjectRepository,
    pipeline: Arc<ExtractionPipeline>,
    alerts: Arc<AlertService>,
}

impl ExtractWorker {
    pub fn new(
        jobs: JobRepository,
        projects: ProjectRepository,
        pipeline: Arc<ExtractionPipeline>,
        alerts: Arc<AlertService>,
    ) -> Self {
        Self {
            jobs,
            projects,
            pipeline,
            alerts,
        }
    }

    pub async fn process_extract_job(&self, job: &Job) -> Result<()> {
        let payload: ExtractPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Other(anyhow::anyhow!("invalid extract payload: {}", e)))?;
        let project = self.require_project(job).await?;

        let cancel_flag = Arc::new(AtomicBool::new(false));
        let watchdog = self.spawn_cancel_watchdog(job.id, Arc::clone(&cancel_flag));

        let batch = self
            .pipeline
            .process_batch(&project, &payload.source_ids, Some(job.id), &cancel_flag)
            .await;
        watchdog.abort();

        let batch = match batch {
            Ok(batch) => batch,
            Err(err) => {
                self.jobs.mark_failed(job.id, &err.to_string()).await?;
                self.alerts
                    .alert_job_failed(job.id, "extract", &err.to_string(), Some(job.project_id))
                    .await;
                return Err(err);
            }
        };

        if batch.cancelled {
            log::info!(
                "Extract job {} cancelled after {} extractions",
                job.id,
                batch.extractions_created()
            );
            self.jobs.mark_cancelled(job.id).await?;
            return Ok(());
        }

        let orphaned: usize = batch.outcomes.iter().filter(|o| o.orphaned).count();
        let errors: Vec<String> = batch
            .outcomes
            .iter()
            .filter_map(|o| {
                o.error
                    .as_ref()
                    .map(|e| format!("{}: {}", o.source_id, e))
            })
            .collect();

        let result = serde_json::json!({
            "sources_processed": batch.outcomes.len(),
            "sources_failed": batch.failed_sources(),
            "extractions_created": batch.extractions_created(),
            "sources_orphaned": orphaned,
            "errors": errors,
        });
        self.jobs.mark_completed(job.id, result).await?;
        Ok(())
    }

    fn spawn_cancel_watchdog(
        &self,
        job_id: uuid::Uuid,
        cancel_flag: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let jobs = JobRepository::new(self.jobs_pool());
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
                match jobs.is_cancellation_requested(job_id).await {
                    Ok(true) => {
                        log::info!("Cancellation observed for job {}", job_id);
                        cancel_flag.store(true, Ordering::Relaxed);
                        return;
                    }
                    Ok(false) => {
                        // Also serves as the liveness heartbeat.
                        if let Err(err) = jobs.touch(job_id).await {
                            log::warn!("Heartbeat failed for job {}: {}", job_id, err);
                        }
                    }
                    Err(err) => log::warn!("Cancellation poll failed for {}: {}", job_id, err),
                }
            }
        })
    }

    fn jobs_pool(&self) -> sqlx::PgPool {
        self.jobs.pool().clone()
    }

    async fn require_project(&self, job: &Job) -> Result<Project> {
        self.projects
            .get(job.project_id)
            .await?
            .ok_or_else(|| {
                AppError::Other(anyhow::anyhow!("project {} not found", job.project_id))
            })
    }
}

#[async_trait::async_trait]
impl crate::service::scheduler::JobHandler for ExtractWorker {
    async fn handle(&self, job: Job) -> Result<()> {
        self.process_extract_job(&job).await
    }
}
