//! Job repository: durable job records with an atomic claim protocol.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never hand
//! out the same job twice. `updated_at` advances on every state change;
//! stale detection keys off it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{Job, JobStatus, JobType};

pub struct JobRepository {
    pool: PgPool,
}

const JOB_COLUMNS: &str = "id, project_id, type, status, priority, payload, result, error, \
     created_at, updated_at, started_at, completed_at, cancellation_requested_at";

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a queued job and return it.
    pub async fn create(
        &self,
        project_id: Uuid,
        job_type: JobType,
        priority: i32,
        payload: Value,
    ) -> Result<Job> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (project_id, type, status, priority, payload)
            VALUES ($1, $2, 'queued', $3, $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(project_id)
        .bind(job_type.as_str())
        .bind(priority)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create job")?;

        let job = row_to_job(&row)?;
        log::info!("Created {} job {} (priority {})", job_type, job.id, priority);
        Ok(job)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch job")?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// Claim the next queued job of one of the given types.
    ///
    /// Highest priority first, oldest `created_at` breaking ties. The row is
    /// locked, moved to `running` and returned in one transaction, so a
    /// claim is atomic across workers.
    pub async fn claim_next(&self, types: &[JobType]) -> Result<Option<Job>> {
        let type_names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();

        let mut tx = self.pool.begin().await.context("Failed to begin claim")?;

        let candidate = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE status = 'queued' AND type = ANY($1)
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(&type_names)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to select claimable job")?;

        let Some(candidate) = candidate else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let id: Uuid = candidate.get("id");
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = now(), updated_at = now()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to mark job running")?;

        tx.commit().await.context("Failed to commit claim")?;

        let job = row_to_job(&row)?;
        log::info!("Claimed {} job {}", job.job_type, job.id);
        Ok(Some(job))
    }

    /// Re-claim one stale running job of the given type, if any.
    ///
    /// A job is stale when its `updated_at` is older than the per-type
    /// threshold; the original worker is presumed dead. Re-claiming
    /// advances `updated_at` under the same row lock as a normal claim.
    pub async fn claim_stale(&self, job_type: JobType, threshold_secs: i64) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await.context("Failed to begin reclaim")?;

        let candidate = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE status = 'running'
              AND type = $1
              AND updated_at < now() - make_interval(secs => $2)
            ORDER BY updated_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(job_type.as_str())
        .bind(threshold_secs as f64)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to select stale job")?;

        let Some(candidate) = candidate else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let id: Uuid = candidate.get("id");
        let row = sqlx::query(&format!(
            "UPDATE jobs SET updated_at = now() WHERE id = $1 RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to re-claim stale job")?;

        tx.commit().await.context("Failed to commit reclaim")?;

        let job = row_to_job(&row)?;
        log::warn!(
            "Re-claimed stale {} job {} (last update {})",
            job.job_type,
            job.id,
            job.updated_at
        );
        Ok(Some(job))
    }

    /// List stale running jobs of a type without claiming them.
    pub async fn find_stale(&self, job_type: JobType, threshold_secs: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'running'
              AND type = $1
              AND updated_at < now() - make_interval(secs => $2)
            ORDER BY updated_at ASC
            "#
        ))
        .bind(job_type.as_str())
        .bind(threshold_secs as f64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list stale jobs")?;

        rows.iter().map(row_to_job).collect()
    }

    /// Advance `updated_at` so stale detection sees the worker is alive.
    pub async fn touch(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET updated_at = now() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("Failed to touch job")?;
        Ok(())
    }

    pub async fn mark_completed(&self, job_id: Uuid, result: Value) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', result = $2, completed_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(&result)
        .execute(&self.pool)
        .await
        .context("Failed to complete job")?;

        log::info!("Job {} completed", job_id);
        Ok(())
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = $2, completed_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark job failed")?;

        log::error!("Job {} failed: {}", job_id, error);
        Ok(())
    }

    /// Request cancellation. Valid only from `queued` or `running`.
    ///
    /// Returns the updated job, or None when the job does not exist or is
    /// past the point of cancelling.
    pub async fn request_cancellation(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'cancelling', cancellation_requested_at = now(), updated_at = now()
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to request cancellation")?;

        if row.is_some() {
            log::info!("Cancellation requested for job {}", job_id);
        }
        row.as_ref().map(row_to_job).transpose()
    }

    /// Worker acknowledgment: the job has stopped and is now `cancelled`.
    pub async fn mark_cancelled(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark job cancelled")?;

        log::info!("Job {} cancelled", job_id);
        Ok(())
    }

    /// Whether a worker should stop processing this job.
    pub async fn is_cancellation_requested(&self, job_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check cancellation")?;

        Ok(row
            .map(|r| r.get::<&str, _>("status") == "cancelling")
            .unwrap_or(false))
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job> {
    let type_str: &str = row.get("type");
    let status_str: &str = row.get("status");

    Ok(Job {
        id: row.get("id"),
        project_id: row.get("project_id"),
        job_type: JobType::from_str(type_str)
            .map_err(|_| anyhow::anyhow!("unknown job type: {}", type_str))?,
        status: JobStatus::from_str(status_str)
            .map_err(|_| anyhow::anyhow!("unknown job status: {}", status_str))?,
        priority: row.get("priority"),
        payload: row.get("payload"),
        result: row.get("result"),
        error: row.get("error"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        cancellation_requested_at: row.get("cancellation_requested_at"),
    })
}
