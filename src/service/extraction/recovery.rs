//! Recovery for orphaned extractions.
//!
//! Orphans are rows whose vector upsert never landed. Recovery re-embeds
//! them in batches and flips `embedding_id`; because the vector index is
//! keyed by extraction id, re-running recovery over the same rows is
//! harmless.

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::Extraction;
use crate::error::Result;
use crate::repository::ExtractionRepository;
use crate::service::alerting::AlertService;
use crate::service::embedding::EmbeddingClient;
use crate::service::extraction::pipeline::fact_text;
use crate::service::qdrant::{QdrantClient, VectorPoint};

#[derive(Debug, Default)]
pub struct RecoverySummary {
    pub total_found: usize,
    pub total_recovered: usize,
    pub total_failed: usize,
    pub batches_processed: usize,
    pub errors: Vec<String>,
}

pub struct EmbeddingRecoveryService {
    extractions: ExtractionRepository,
    embeddings: Arc<EmbeddingClient>,
    qdrant: Arc<QdrantClient>,
    alerts: Arc<AlertService>,
    batch_size: i64,
}

impl EmbeddingRecoveryService {
    pub fn new(
        extractions: ExtractionRepository,
        embeddings: Arc<EmbeddingClient>,
        qdrant: Arc<QdrantClient>,
        alerts: Arc<AlertService>,
    ) -> Self {
        Self {
            extractions,
            embeddings,
            qdrant,
            alerts,
            batch_size: 50,
        }
    }

    /// Recover orphans for one project (or all projects when None).
    ///
    /// Processes up to `max_batches` batches; idempotent, safe to re-run.
    pub async fn run_recovery(
        &self,
        project_id: Option<Uuid>,
        max_batches: usize,
    ) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();

        for batch_num in 0..max_batches {
            let orphans = self
                .extractions
                .find_orphaned(project_id, self.batch_size)
                .await?;

            if orphans.is_empty() {
                log::info!(
                    "Recovery complete: {} batches, {} recovered",
                    summary.batches_processed,
                    summary.total_recovered
                );
                break;
            }

            summary.total_found += orphans.len();
            match self.recover_batch(&orphans).await {
                Ok(()) => summary.total_recovered += orphans.len(),
                Err(err) => {
                    summary.total_failed += orphans.len();
                    summary.errors.push(err.to_string());
                    log::error!(
                        "Recovery batch {} failed ({} orphans): {}",
                        batch_num + 1,
                        orphans.len(),
                        err
                    );
                    // A failing backend will fail the next batch too.
                    break;
                }
            }
            summary.batches_processed += 1;

            log::info!(
                "Recovery batch {} done: {} recovered so far",
                batch_num + 1,
                summary.total_recovered
            );
        }

        if summary.total_recovered > 0 || summary.total_failed > 0 {
            self.alerts
                .alert_recovery_completed(summary.total_recovered, summary.total_failed, project_id)
                .await;
        }

        Ok(summary)
    }

    async fn recover_batch(&self, orphans: &[Extraction]) -> Result<()> {
        let fact_texts: Vec<String> = orphans
            .iter()
            .map(|e| fact_text(&e.extraction_type, &e.data))
            .collect();

        let vectors = self.embeddings.embed_batch(&fact_texts).await?;

        let points: Vec<VectorPoint> = orphans
            .iter()
            .zip(vectors)
            .map(|(extraction, vector)| VectorPoint {
                id: extraction.id,
                vector,
                payload: json!({
                    "project_id": extraction.project_id.to_string(),
                    "source_group": extraction.source_group,
                    "extraction_type": extraction.extraction_type,
                }),
            })
            .collect();

        self.qdrant.upsert_batch(&points).await?;

        let ids: Vec<Uuid> = orphans.iter().map(|e| e.id).collect();
        self.extractions.set_embedding_ids(&ids).await?;
        Ok(())
    }
}
