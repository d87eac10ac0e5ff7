//! Extraction pipeline: source -> extractions -> embeddings -> dual-write.
//!
//! Write order is load-bearing. Rows land in Postgres with
//! `embedding_id = NULL`, vectors go to the index keyed by extraction id,
//! and only then does `embedding_id` flip. A crash or backend failure
//! between those steps leaves orphans, never lost or phantom rows; the
//! recovery service picks orphans up later.

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::schema::parse_field_groups;
use crate::domain::{Extraction, FieldGroup, NewExtraction, Project, Source};
use crate::error::{AppError, Result};
use crate::repository::{EntityRepository, ExtractionRepository, SourceRepository};
use crate::service::alerting::AlertService;
use crate::service::dlq::DlqService;
use crate::service::embedding::EmbeddingClient;
use crate::service::extraction::orchestrator::ExtractionOrchestrator;
use crate::service::extraction::schema_validator::{SchemaValidator, METADATA_KEYS};
use crate::service::qdrant::{QdrantClient, VectorPoint};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Sources processed concurrently within one batch.
    pub max_concurrent_sources: usize,
    /// Groups merging below this confidence are not stored.
    pub min_confidence: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: 4,
            min_confidence: 0.0,
        }
    }
}

/// Per-source result inside a batch.
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub source_id: Uuid,
    pub extractions_created: usize,
    pub orphaned: bool,
    pub error: Option<String>,
}

/// Whole-batch result. Per-source failures are collected, never fatal.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub outcomes: Vec<SourceOutcome>,
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn extractions_created(&self) -> usize {
        self.outcomes.iter().map(|o| o.extractions_created).sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

pub struct ExtractionPipeline {
    sources: SourceRepository,
    extractions: ExtractionRepository,
    entities: EntityRepository,
    orchestrator: Arc<ExtractionOrchestrator>,
    validator: SchemaValidator,
    embeddings: Arc<EmbeddingClient>,
    qdrant: Arc<QdrantClient>,
    alerts: Arc<AlertService>,
    dlq: DlqService,
    config: PipelineConfig,
}

impl ExtractionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sources: SourceRepository,
        extractions: ExtractionRepository,
        entities: EntityRepository,
        orchestrator: Arc<ExtractionOrchestrator>,
        embeddings: Arc<EmbeddingClient>,
        qdrant: Arc<QdrantClient>,
        alerts: Arc<AlertService>,
        dlq: DlqService,
        config: PipelineConfig,
    ) -> Self {
        Self {
            sources,
            extractions,
            entities,
            orchestrator,
            validator: SchemaValidator::new(config.min_confidence),
            embeddings,
            qdrant,
            alerts,
            dlq,
            config,
        }
    }

    /// Process a batch of sources concurrently with a bounded gather.
    ///
    /// Individual source failures populate their outcome and the batch
    /// continues. Cancellation stops picking up new sources; whatever has
    /// committed stays committed.
    pub async fn process_batch(
        &self,
        project: &Project,
        source_ids: &[Uuid],
        job_id: Option<Uuid>,
        cancel_flag: &Arc<AtomicBool>,
    ) -> Result<BatchOutcome> {
        let groups = parse_field_groups(&project.extraction_schema)?;
        let mut outcome = BatchOutcome::default();

        let results: Vec<SourceOutcome> = stream::iter(source_ids.iter().copied())
            .map(|source_id| {
                let groups = &groups;
                let cancel_flag = Arc::clone(cancel_flag);
                async move {
                    if cancel_flag.load(Ordering::Relaxed) {
                        return SourceOutcome {
                            source_id,
                            extractions_created: 0,
                            orphaned: false,
                            error: Some("cancelled".to_string()),
                        };
                    }
                    match self
                        .process_source(project, source_id, groups, &cancel_flag)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(AppError::Cancelled) => SourceOutcome {
                            source_id,
                            extractions_created: 0,
                            orphaned: false,
                            error: Some("cancelled".to_string()),
                        },
                        Err(err) => {
                            log::error!("Source {} failed: {}", source_id, err);
                            if let Some(job_id) = job_id {
                                let _ = self
                                    .dlq
                                    .push(job_id, Some(source_id), &err.to_string())
                                    .await;
                            }
                            SourceOutcome {
                                source_id,
                                extractions_created: 0,
                                orphaned: false,
                                error: Some(err.to_string()),
                            }
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrent_sources)
            .collect()
            .await;

        outcome.outcomes = results;
        outcome.cancelled = cancel_flag.load(Ordering::Relaxed);
        Ok(outcome)
    }

    async fn process_source(
        &self,
        project: &Project,
        source_id: Uuid,
        groups: &[FieldGroup],
        cancel_flag: &Arc<AtomicBool>,
    ) -> Result<SourceOutcome> {
        let source = self
            .sources
            .get(source_id)
            .await?
            .ok_or_else(|| AppError::Other(anyhow::anyhow!("source {} not found", source_id)))?;

        if source.status != "completed" || source.page_type.as_deref() == Some("skip") {
            log::debug!("Skipping source {} (status {})", source_id, source.status);
            return Ok(SourceOutcome {
                source_id,
                extractions_created: 0,
                orphaned: false,
                error: None,
            });
        }

        let content = source.extraction_content();
        if content.trim().is_empty() {
            return Ok(SourceOutcome {
                source_id,
                extractions_created: 0,
                orphaned: false,
                error: None,
            });
        }

        let relevant = relevant_groups(groups, &source);
        let merged = self
            .orchestrator
            .extract_source(content, &relevant, Some(&source.source_group), cancel_flag)
            .await?;

        // Validate, gate on confidence, and build the rows to insert.
        let mut new_rows: Vec<NewExtraction> = Vec::new();
        for group in &relevant {
            let Some(raw) = merged.get(&group.name) else {
                continue;
            };
            let (cleaned, violations) = self.validator.validate(raw, group);
            if violations
                .iter()
                .any(|v| v.issue == "confidence_below_threshold")
            {
                log::info!(
                    "Dropping group {} for source {}: confidence below threshold",
                    group.name,
                    source_id
                );
                continue;
            }
            let confidence = cleaned.get("confidence").and_then(Value::as_f64);
            new_rows.push(NewExtraction {
                project_id: project.id,
                source_id,
                source_group: source.source_group.clone(),
                extraction_type: group.name.clone(),
                data: cleaned,
                confidence,
                profile_used: Some(project.name.clone()),
            });
        }

        if new_rows.is_empty() {
            return Ok(SourceOutcome {
                source_id,
                extractions_created: 0,
                orphaned: false,
                error: None,
            });
        }

        // Re-extraction replaces: drop this source's previous rows for the
        // same groups (and their vector points) so a re-claimed job cannot
        // duplicate them.
        let replaced_types: Vec<String> = new_rows
            .iter()
            .map(|row| row.extraction_type.clone())
            .collect();
        let stale_ids = self
            .extractions
            .delete_by_source_and_types(source_id, &replaced_types)
            .await?;
        if !stale_ids.is_empty() {
            if let Err(err) = self.qdrant.delete_batch(&stale_ids).await {
                log::warn!(
                    "Failed to drop {} replaced vector points for source {}: {}",
                    stale_ids.len(),
                    source_id,
                    err
                );
            }
        }

        // Relational write commits first; embedding_id stays NULL.
        let inserted = self.extractions.insert_batch(&new_rows).await?;

        self.materialize_entities(project, &source, &inserted, &relevant)
            .await;

        // Vector write. Failure leaves orphans behind, alerted and
        // recoverable, never a rolled-back batch.
        match self.embed_and_index(&inserted).await {
            Ok(()) => Ok(SourceOutcome {
                source_id,
                extractions_created: inserted.len(),
                orphaned: false,
                error: None,
            }),
            Err(err) => {
                log::error!(
                    "Dual-write left {} orphans for source {}: {}",
                    inserted.len(),
                    source_id,
                    err
                );
                self.alerts
                    .alert_embedding_failure(project.id, source_id, inserted.len(), &err.to_string())
                    .await;
                Ok(SourceOutcome {
                    source_id,
                    extractions_created: inserted.len(),
                    orphaned: true,
                    error: Some(err.to_string()),
                })
            }
        }
    }

    async fn embed_and_index(&self, extractions: &[Extraction]) -> Result<()> {
        let fact_texts: Vec<String> = extractions
            .iter()
            .map(|e| fact_text(&e.extraction_type, &e.data))
            .collect();

        let vectors = self.embeddings.embed_batch(&fact_texts).await?;

        let points: Vec<VectorPoint> = extractions
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

        let ids: Vec<Uuid> = extractions.iter().map(|e| e.id).collect();
        self.extractions.set_embedding_ids(&ids).await?;
        Ok(())
    }

    /// Create/link entities from entity-list groups. Failures here are
    /// logged, not fatal: the extraction rows are already correct.
    async fn materialize_entities(
        &self,
        project: &Project,
        source: &Source,
        inserted: &[Extraction],
        groups: &[FieldGroup],
    ) {
        for extraction in inserted {
            let Some(group) = groups
                .iter()
                .find(|g| g.name == extraction.extraction_type && g.is_entity_list)
            else {
                continue;
            };
            let Some(id_field) = group.id_field() else {
                continue;
            };
            let Some(entities) = extraction.data.get(&group.name).and_then(Value::as_array) else {
                continue;
            };

            for entity in entities {
                let Some(value) = entity.get(id_field).and_then(Value::as_str) else {
                    continue;
                };
                let normalized = value.trim().to_lowercase();
                if normalized.is_empty() {
                    continue;
                }
                let attributes = entity_attributes(entity, id_field);

                match self
                    .entities
                    .get_or_create(
                        project.id,
                        &source.source_group,
                        &group.name,
                        value,
                        &normalized,
                        &attributes,
                    )
                    .await
                {
                    Ok((entity_row, _created)) => {
                        if let Err(err) = self
                            .entities
                            .link_to_extraction(extraction.id, entity_row.id, "mention")
                            .await
                        {
                            log::warn!("Entity link failed: {}", err);
                        }
                    }
                    Err(err) => log::warn!("Entity upsert failed: {}", err),
                }
            }
        }
    }
}

/// Groups to extract for a source: its classified subset when present,
/// otherwise every group.
pub fn relevant_groups(groups: &[FieldGroup], source: &Source) -> Vec<FieldGroup> {
    match &source.relevant_field_groups {
        Some(names) if !names.is_empty() => {
            let subset: Vec<FieldGroup> = groups
                .iter()
                .filter(|g| names.contains(&g.name))
                .cloned()
                .collect();
            if subset.is_empty() {
                groups.to_vec()
            } else {
                subset
            }
        }
        _ => groups.to_vec(),
    }
}

/// Text embedded for one extraction: the group name plus its non-metadata
/// field values.
pub fn fact_text(extraction_type: &str, data: &Value) -> String {
    let mut parts: Vec<String> = vec![extraction_type.replace('_', " ")];

    if let Some(map) = data.as_object() {
        for (key, value) in map {
            if METADATA_KEYS.contains(&key.as_str()) || value.is_null() {
                continue;
            }
            match value {
                Value::Array(items) => {
                    for item in items {
                        parts.push(flatten_value(item));
                    }
                }
                other => parts.push(format!("{}: {}", key, flatten_value(other))),
            }
        }
    }

    parts.retain(|p| !p.trim().is_empty());
    parts.join(". ")
}

fn flatten_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .iter()
            .filter(|(key, v)| !v.is_null() && !key.starts_with('_'))
            .map(|(key, v)| format!("{} {}", key, flatten_value(v)))
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn entity_attributes(entity: &Value, id_field: &str) -> Value {
    let mut attributes = serde_json::Map::new();
    if let Some(map) = entity.as_object() {
        for (key, value) in map {
            if key == id_field || key.starts_with('_') || value.is_null() {
                continue;
            }
            attributes.insert(key.clone(), value.clone());
        }
    }
    Value::Object(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FieldDefinition, FieldType};
    use chrono::Utc;

    fn group(name: &str) -> FieldGroup {
        FieldGroup {
            name: name.into(),
            description: String::new(),
            fields: vec![FieldDefinition {
                name: "name".into(),
                field_type: FieldType::Text,
                description: String::new(),
                enum_values: vec![],
                required: false,
                default: None,
            }],
            prompt_hint: None,
            is_entity_list: false,
            entity_id_field: None,
        }
    }

    fn source(relevant: Option<Vec<String>>) -> Source {
        Source {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            uri: "https://example.com".into(),
            source_group: "acme".into(),
            source_type: "web".into(),
            title: None,
            content: Some("content".into()),
            cleaned_content: None,
            status: "completed".into(),
            created_by_job_id: None,
            page_type: None,
            relevant_field_groups: relevant,
            classification_method: None,
            classification_confidence: None,
            meta_data: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn classified_subset_narrows_groups() {
        let groups = vec![group("a"), group("b"), group("c")];
        let picked = relevant_groups(&groups, &source(Some(vec!["b".into()])));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "b");
    }

    #[test]
    fn empty_classification_means_all_groups() {
        let groups = vec![group("a"), group("b")];
        assert_eq!(relevant_groups(&groups, &source(None)).len(), 2);
        assert_eq!(relevant_groups(&groups, &source(Some(vec![]))).len(), 2);
    }

    #[test]
    fn unknown_classified_names_fall_back_to_all() {
        let groups = vec![group("a"), group("b")];
        let picked = relevant_groups(&groups, &source(Some(vec!["zzz".into()])));
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn fact_text_flattens_fields_and_skips_metadata() {
        let data = json!({
            "name": "Acme Corp",
            "employees": 1500,
            "industry": null,
            "confidence": 0.9,
            "_quotes": {"name": "quoted"},
        });
        let text = fact_text("company_info", &data);

        assert!(text.starts_with("company info"));
        assert!(text.contains("name: Acme Corp"));
        assert!(text.contains("employees: 1500"));
        assert!(!text.contains("quoted"));
        assert!(!text.contains("confidence"));
        assert!(!text.contains("industry"));
    }

    #[test]
    fn fact_text_expands_entity_lists() {
        let data = json!({
            "products_list": [
                {"product_name": "X200", "power_kw": 200.0, "_quote": "hidden"},
                {"product_name": "X300", "power_kw": null},
            ],
            "confidence": 0.8,
        });
        let text = fact_text("products_list", &data);

        assert!(text.contains("product_name X200"));
        assert!(text.contains("power_kw 200"));
        assert!(text.contains("product_name X300"));
        assert!(!text.contains("hidden"));
    }

    #[test]
    fn entity_attributes_exclude_id_and_private_keys() {
        let entity = json!({
            "product_name": "X200",
            "power_kw": 200.0,
            "_quote": "q",
            "series": null,
        });
        let attributes = entity_attributes(&entity, "product_name");
        assert_eq!(attributes, json!({"power_kw": 200.0}));
    }
}
