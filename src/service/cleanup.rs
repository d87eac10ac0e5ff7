//! Cleanup of everything a job created.
//!
//! Deletion order respects ownership: vector points first (keyed by
//! extraction id), then sources (extractions and entity links cascade via
//! FK), then the job's dead-letter entries. Every step is idempotent, so a
//! second pass deletes nothing and reports zeros.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::repository::{ExtractionRepository, SourceRepository};
use crate::service::dlq::DlqService;
use crate::service::qdrant::QdrantClient;

#[derive(Debug, Default, Clone, Serialize)]
pub struct JobCleanupStats {
    pub sources_deleted: u64,
    pub extractions_deleted: u64,
    pub embeddings_deleted: u64,
    pub dlq_items_deleted: u64,
}

pub struct JobCleanupService {
    sources: SourceRepository,
    extractions: ExtractionRepository,
    qdrant: Arc<QdrantClient>,
    dlq: DlqService,
}

impl JobCleanupService {
    pub fn new(
        sources: SourceRepository,
        extractions: ExtractionRepository,
        qdrant: Arc<QdrantClient>,
        dlq: DlqService,
    ) -> Self {
        Self {
            sources,
            extractions,
            qdrant,
            dlq,
        }
    }

    /// Delete all artifacts created by one job.
    pub async fn delete_artifacts(&self, job_id: Uuid) -> Result<JobCleanupStats> {
        log::info!("Cleaning up artifacts of job {}", job_id);

        let sources = self.sources.list_by_job(job_id).await?;
        let source_ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();

        // All extraction ids, not just those with embedding_id set: the
        // vector index may hold points for rows whose flip never happened.
        let extraction_ids = if source_ids.is_empty() {
            Vec::new()
        } else {
            self.extractions.ids_by_sources(&source_ids).await?
        };

        let embeddings_deleted = if extraction_ids.is_empty() {
            0
        } else {
            self.qdrant.delete_batch(&extraction_ids).await? as u64
        };

        let sources_deleted = if source_ids.is_empty() {
            0
        } else {
            self.sources.delete_by_job(job_id).await?
        };

        let dlq_items_deleted = self.dlq.remove_by_job_id(job_id).await?;

        let stats = JobCleanupStats {
            sources_deleted,
            extractions_deleted: extraction_ids.len() as u64,
            embeddings_deleted,
            dlq_items_deleted,
        };

        log::info!(
            "Cleanup of job {} done: {} sources, {} extractions, {} vectors, {} dlq entries",
            job_id,
            stats.sources_deleted,
            stats.extractions_deleted,
            stats.embeddings_deleted,
            stats.dlq_items_deleted
        );
        Ok(stats)
    }
}
