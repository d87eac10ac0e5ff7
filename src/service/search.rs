//! Semantic search over extractions.
//!
//! Vector hits are enriched from Postgres. When the vector index is down,
//! search degrades to empty results instead of failing the caller.

use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::repository::{ExtractionRepository, SourceRepository};
use crate::service::embedding::EmbeddingClient;
use crate::service::qdrant::QdrantClient;

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub extraction_id: Uuid,
    pub score: f64,
    pub data: Value,
    pub source_group: String,
    pub source_uri: String,
    pub confidence: Option<f64>,
}

pub struct SearchService {
    embeddings: Arc<EmbeddingClient>,
    qdrant: Arc<QdrantClient>,
    extractions: ExtractionRepository,
    sources: SourceRepository,
}

impl SearchService {
    pub fn new(
        embeddings: Arc<EmbeddingClient>,
        qdrant: Arc<QdrantClient>,
        extractions: ExtractionRepository,
        sources: SourceRepository,
    ) -> Self {
        Self {
            embeddings,
            qdrant,
            extractions,
            sources,
        }
    }

    /// Semantic search scoped to a project, optionally narrowed to source
    /// groups.
    pub async fn search(
        &self,
        project_id: Uuid,
        query: &str,
        limit: usize,
        source_groups: Option<&[String]>,
    ) -> Result<Vec<SearchResult>> {
        let query_vector = self.embeddings.embed(query).await?;

        let mut filters = json!({ "project_id": project_id.to_string() });
        if let Some(groups) = source_groups {
            filters["source_group"] = json!(groups);
        }

        // Over-fetch: some hits may have lost their rows since indexing.
        let hits = match self.qdrant.search(&query_vector, limit * 2, &filters).await {
            Ok(hits) => hits,
            Err(err) => {
                log::error!("Vector search unavailable, returning empty results: {}", err);
                return Ok(Vec::new());
            }
        };

        let mut results = Vec::with_capacity(limit);
        for hit in hits {
            if results.len() >= limit {
                break;
            }
            let Some(extraction) = self.extractions.get(hit.id).await? else {
                continue;
            };
            let source_uri = self
                .sources
                .get(extraction.source_id)
                .await?
                .map(|s| s.uri)
                .unwrap_or_default();

            results.push(SearchResult {
                extraction_id: extraction.id,
                score: hit.score,
                data: extraction.data,
                source_group: extraction.source_group,
                source_uri,
                confidence: extraction.confidence,
            });
        }

        Ok(results)
    }
}
