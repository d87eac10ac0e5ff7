//! Worker scheduler: one long-lived poll loop per job type.
//!
//! Each loop claims the next queued job of its type, falls back to
//! re-claiming stale running jobs (their worker died), and sleeps when
//! there is nothing to do. Claims are atomic at the database, so any
//! number of processes can run the same loops.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::domain::{Job, JobType};
use crate::error::Result;
use crate::repository::JobRepository;

/// Polling interval when no work is found.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Delay after a claim failure before retrying.
const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(10);

/// A worker capable of processing claimed jobs of one type.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StaleThresholds {
    pub scrape_secs: i64,
    pub extract_secs: i64,
    pub crawl_secs: i64,
}

impl Default for StaleThresholds {
    fn default() -> Self {
        Self {
            scrape_secs: 300,
            extract_secs: 900,
            crawl_secs: 1800,
        }
    }
}

impl StaleThresholds {
    fn for_type(&self, job_type: JobType) -> i64 {
        match job_type {
            JobType::Scrape => self.scrape_secs,
            JobType::Extract => self.extract_secs,
            JobType::Crawl => self.crawl_secs,
            // Report jobs have no dedicated worker here; reuse the widest
            // window if one ever gets claimed.
            JobType::Report => self.crawl_secs,
        }
    }
}

pub struct Scheduler {
    jobs: JobRepository,
    thresholds: StaleThresholds,
}

impl Scheduler {
    pub fn new(jobs: JobRepository, thresholds: StaleThresholds) -> Self {
        Self { jobs, thresholds }
    }

    /// Run the poll loop for one job type. Never returns under normal
    /// operation.
    pub async fn run_loop(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        log::info!("Worker loop for {} jobs started", job_type);

        loop {
            let claimed = match self.claim_work(job_type).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    log::error!("Failed to claim {} job: {}", job_type, err);
                    sleep(CLAIM_RETRY_DELAY).await;
                    continue;
                }
            };

            match claimed {
                Some(job) => {
                    let job_id = job.id;
                    log::info!("Processing {} job {}", job_type, job_id);
                    if let Err(err) = handler.handle(job).await {
                        log::error!("{} job {} failed: {}", job_type, job_id, err);
                    }
                }
                None => sleep(POLL_INTERVAL).await,
            }
        }
    }

    /// Queued work first; otherwise pick up a stale running job whose
    /// worker has gone quiet.
    async fn claim_work(&self, job_type: JobType) -> Result<Option<Job>> {
        if let Some(job) = self.jobs.claim_next(&[job_type]).await? {
            return Ok(Some(job));
        }
        self.jobs
            .claim_stale(job_type, self.thresholds.for_type(job_type))
            .await
            .map_err(crate::error::AppError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_vary_by_job_type() {
        let thresholds = StaleThresholds::default();
        assert_eq!(thresholds.for_type(JobType::Scrape), 300);
        assert_eq!(thresholds.for_type(JobType::Extract), 900);
        assert_eq!(thresholds.for_type(JobType::Crawl), 1800);
    }
}
