//! Extraction orchestration: chunk a source, extract each relevant field
//! group per chunk, merge the chunk results into one value per group.
//!
//! Merge rules by field type:
//! - booleans OR; a split vote records a `majority_vote` conflict
//! - numerics take the max; >10% relative spread records a `max` conflict
//! - enums/text take the first non-empty; disagreement records `concat`
//! - lists concatenate and dedup by canonical JSON
//! - entity lists merge by the group's id field, last non-null field wins

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::domain::{FieldGroup, FieldType};
use crate::error::{AppError, Result};
use crate::service::extraction::schema_extractor::SchemaExtractor;
use crate::service::llm::chunking::{chunk_document, DocumentChunk};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub chunk_max_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub conflict_detection_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chunk_max_tokens: 5000,
            chunk_overlap_tokens: 0,
            conflict_detection_enabled: true,
        }
    }
}

pub struct ExtractionOrchestrator {
    extractor: Arc<SchemaExtractor>,
    config: OrchestratorConfig,
}

impl ExtractionOrchestrator {
    pub fn new(extractor: Arc<SchemaExtractor>, config: OrchestratorConfig) -> Self {
        Self { extractor, config }
    }

    /// Extract every relevant group from one source's content.
    ///
    /// Returns group name -> merged result. Chunk-level LLM failures drop
    /// that chunk's contribution; cancellation aborts between chunks.
    pub async fn extract_source(
        &self,
        content: &str,
        groups: &[FieldGroup],
        source_group: Option<&str>,
        cancel_flag: &AtomicBool,
    ) -> Result<HashMap<String, Value>> {
        let chunks = chunk_document(
            content,
            self.config.chunk_max_tokens,
            self.config.chunk_overlap_tokens,
        );
        if chunks.is_empty() {
            return Ok(HashMap::new());
        }

        log::info!(
            "Extracting {} groups over {} chunks",
            groups.len(),
            chunks.len()
        );

        let mut results = HashMap::new();
        for group in groups {
            let chunk_results = self
                .extract_group_over_chunks(&chunks, group, source_group, cancel_flag)
                .await?;
            if chunk_results.is_empty() {
                continue;
            }
            let merged = merge_chunk_results(
                &chunk_results,
                group,
                self.config.conflict_detection_enabled,
            );
            results.insert(group.name.clone(), merged);
        }

        Ok(results)
    }

    async fn extract_group_over_chunks(
        &self,
        chunks: &[DocumentChunk],
        group: &FieldGroup,
        source_group: Option<&str>,
        cancel_flag: &AtomicBool,
    ) -> Result<Vec<ChunkResult>> {
        let mut chunk_results = Vec::new();

        for chunk in chunks {
            if cancel_flag.load(Ordering::Relaxed) {
                return Err(AppError::Cancelled);
            }

            match self
                .extractor
                .extract_field_group(&chunk.content, group, source_group)
                .await
            {
                Ok(value) => chunk_results.push(ChunkResult {
                    chunk_index: chunk.chunk_index,
                    value,
                }),
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(err) => {
                    // The chunk contributes nothing; other chunks still can.
                    log::warn!(
                        "Group {} chunk {} extraction dropped: {}",
                        group.name,
                        chunk.chunk_index,
                        err
                    );
                }
            }
        }

        Ok(chunk_results)
    }
}

/// One chunk's extraction output for a group.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub value: Value,
}

/// Merge per-chunk group results into one object.
pub fn merge_chunk_results(
    chunk_results: &[ChunkResult],
    group: &FieldGroup,
    conflict_detection_enabled: bool,
) -> Value {
    if chunk_results.is_empty() {
        return Value::Object(Map::new());
    }
    if chunk_results.len() == 1 {
        // A single chunk merges to itself and never carries conflicts.
        return chunk_results[0].value.clone();
    }

    if group.is_entity_list {
        return merge_entity_lists(chunk_results, group);
    }

    let mut merged = Map::new();
    let mut conflicts = Map::new();

    for field in &group.fields {
        let observations = collect_observations(chunk_results, &field.name);
        if observations.is_empty() {
            merged.insert(field.name.clone(), Value::Null);
            continue;
        }

        let (resolved, conflict) = match field.field_type {
            FieldType::Boolean => merge_booleans(&observations),
            FieldType::Integer | FieldType::Float => merge_numerics(&observations),
            FieldType::Text | FieldType::Enum => merge_textual(&observations),
            FieldType::List => (merge_lists(&observations), None),
        };

        merged.insert(field.name.clone(), resolved.clone());

        if conflict_detection_enabled {
            if let Some((resolution, values)) = conflict {
                let mut record = Map::new();
                record.insert("values".into(), Value::Array(values));
                record.insert("resolution".into(), Value::String(resolution.into()));
                record.insert("resolved_value".into(), resolved);
                conflicts.insert(field.name.clone(), Value::Object(record));
            }
        }
    }

    merged.insert(
        "confidence".into(),
        average_confidence(chunk_results, group),
    );
    merge_quotes(chunk_results, &mut merged);

    if conflict_detection_enabled && !conflicts.is_empty() {
        merged.insert("_conflicts".into(), Value::Object(conflicts));
    }

    Value::Object(merged)
}

/// A non-null field observation from one chunk.
struct Observation {
    chunk_index: usize,
    confidence: f64,
    value: Value,
}

impl Observation {
    fn to_record(&self) -> Value {
        let mut map = Map::new();
        map.insert("value".into(), self.value.clone());
        map.insert("chunk_index".into(), Value::from(self.chunk_index));
        map.insert("confidence".into(), Value::from(self.confidence));
        Value::Object(map)
    }
}

fn collect_observations(chunk_results: &[ChunkResult], field_name: &str) -> Vec<Observation> {
    chunk_results
        .iter()
        .filter_map(|result| {
            let value = result.value.get(field_name)?;
            if value.is_null() {
                return None;
            }
            Some(Observation {
                chunk_index: result.chunk_index,
                confidence: chunk_confidence(&result.value),
                value: value.clone(),
            })
        })
        .collect()
}

fn chunk_confidence(value: &Value) -> f64 {
    value.get("confidence").and_then(Value::as_f64).unwrap_or(0.0)
}

type Conflict = Option<(&'static str, Vec<Value>)>;

fn merge_booleans(observations: &[Observation]) -> (Value, Conflict) {
    let bools: Vec<bool> = observations
        .iter()
        .filter_map(|o| o.value.as_bool())
        .collect();
    let merged = bools.iter().any(|&b| b);

    let unanimous = bools.windows(2).all(|w| w[0] == w[1]);
    let conflict = if !unanimous {
        Some((
            "majority_vote",
            observations.iter().map(Observation::to_record).collect(),
        ))
    } else {
        None
    };
    (Value::Bool(merged), conflict)
}

fn merge_numerics(observations: &[Observation]) -> (Value, Conflict) {
    let numbers: Vec<f64> = observations
        .iter()
        .filter_map(|o| o.value.as_f64())
        .collect();
    if numbers.is_empty() {
        return (observations[0].value.clone(), None);
    }

    let max = numbers.iter().cloned().fold(f64::MIN, f64::max);
    let min = numbers.iter().cloned().fold(f64::MAX, f64::min);

    // Prefer the original JSON value so integers stay integers.
    let resolved = observations
        .iter()
        .find(|o| o.value.as_f64() == Some(max))
        .map(|o| o.value.clone())
        .unwrap_or(Value::from(max));

    let spread_exceeds = max != 0.0 && (max - min).abs() / max.abs() > 0.10;
    let conflict = if spread_exceeds {
        Some((
            "max",
            observations.iter().map(Observation::to_record).collect(),
        ))
    } else {
        None
    };
    (resolved, conflict)
}

fn merge_textual(observations: &[Observation]) -> (Value, Conflict) {
    let first_non_empty = observations
        .iter()
        .find(|o| {
            o.value
                .as_str()
                .map(|s| !s.trim().is_empty())
                .unwrap_or(true)
        })
        .map(|o| o.value.clone())
        .unwrap_or(Value::Null);

    let mut distinct: Vec<String> = observations
        .iter()
        .filter_map(|o| o.value.as_str().map(str::to_string))
        .filter(|s| !s.trim().is_empty())
        .collect();
    distinct.sort();
    distinct.dedup();

    let conflict = if distinct.len() > 1 {
        Some((
            "concat",
            observations.iter().map(Observation::to_record).collect(),
        ))
    } else {
        None
    };
    (first_non_empty, conflict)
}

fn merge_lists(observations: &[Observation]) -> Value {
    let mut seen: Vec<String> = Vec::new();
    let mut merged: Vec<Value> = Vec::new();

    for observation in observations {
        let items: Vec<Value> = match &observation.value {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        for item in items {
            let key = canonical_json(&item);
            if !seen.contains(&key) {
                seen.push(key);
                merged.push(item);
            }
        }
    }
    Value::Array(merged)
}

/// Entity lists merge across chunks by the group id field; for entities
/// sharing an id, the last chunk's non-null fields win.
fn merge_entity_lists(chunk_results: &[ChunkResult], group: &FieldGroup) -> Value {
    let id_field = group.id_field().unwrap_or("entity_id");
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, Map<String, Value>> = HashMap::new();

    for result in chunk_results {
        let Some(entities) = result.value.get(&group.name).and_then(Value::as_array) else {
            continue;
        };
        for entity in entities {
            let Some(entity_map) = entity.as_object() else {
                continue;
            };
            let Some(id) = entity_map.get(id_field).and_then(Value::as_str) else {
                continue;
            };
            let key = id.trim().to_lowercase();

            let slot = by_id.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                Map::new()
            });
            for (field_name, value) in entity_map {
                if !value.is_null() {
                    slot.insert(field_name.clone(), value.clone());
                }
            }
        }
    }

    let entities: Vec<Value> = order
        .into_iter()
        .filter_map(|key| by_id.remove(&key).map(Value::Object))
        .collect();

    let mut merged = Map::new();
    merged.insert(group.name.clone(), Value::Array(entities));
    merged.insert(
        "confidence".into(),
        average_confidence(chunk_results, group),
    );
    Value::Object(merged)
}

/// Mean confidence over chunks that contributed something.
fn average_confidence(chunk_results: &[ChunkResult], group: &FieldGroup) -> Value {
    let contributing: Vec<f64> = chunk_results
        .iter()
        .filter(|result| chunk_contributed(result, group))
        .map(|result| chunk_confidence(&result.value))
        .collect();

    if contributing.is_empty() {
        return Value::from(0.0);
    }
    Value::from(contributing.iter().sum::<f64>() / contributing.len() as f64)
}

fn chunk_contributed(result: &ChunkResult, group: &FieldGroup) -> bool {
    if group.is_entity_list {
        return result
            .value
            .get(&group.name)
            .and_then(Value::as_array)
            .map(|entities| !entities.is_empty())
            .unwrap_or(false);
    }
    group.fields.iter().any(|field| {
        result
            .value
            .get(&field.name)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    })
}

/// Per quoted field, keep the quote from the highest-confidence chunk that
/// carried one.
fn merge_quotes(chunk_results: &[ChunkResult], merged: &mut Map<String, Value>) {
    let mut best: HashMap<String, (f64, Value)> = HashMap::new();

    for result in chunk_results {
        let Some(quotes) = result.value.get("_quotes").and_then(Value::as_object) else {
            continue;
        };
        let confidence = chunk_confidence(&result.value);
        for (field_name, quote) in quotes {
            let keep = best
                .get(field_name)
                .map(|(existing, _)| confidence > *existing)
                .unwrap_or(true);
            if keep {
                best.insert(field_name.clone(), (confidence, quote.clone()));
            }
        }
    }

    if !best.is_empty() {
        let mut quotes = Map::new();
        for (field_name, (_, quote)) in best {
            quotes.insert(field_name, quote);
        }
        merged.insert("_quotes".into(), Value::Object(quotes));
    }
}

/// Canonical JSON with sorted object keys, for value-identity dedup.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{:?}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}
