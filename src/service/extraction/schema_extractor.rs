//! Schema-driven LLM extraction for one field group.
//!
//! Builds the per-group prompt, runs the completion (directly or through
//! the request queue), parses the JSON and applies declared defaults.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{FieldGroup, FieldType};
use crate::error::{AppError, Result};
use crate::service::llm::json_repair::try_repair_json;
use crate::service::llm::queue::{LlmRequest, LlmRequestQueue, LlmResponseStatus};
use crate::service::llm::LlmClient;

/// Prompts longer than this get their content truncated; headers carry the
/// most signal and sit at the front.
const CONTENT_CHAR_LIMIT: usize = 8000;

#[derive(Debug, Clone)]
pub struct SchemaExtractorConfig {
    pub base_temperature: f64,
    pub quoting_enabled: bool,
    /// Deadline for one queued request, seconds.
    pub request_timeout_secs: i64,
}

impl Default for SchemaExtractorConfig {
    fn default() -> Self {
        Self {
            base_temperature: 0.1,
            quoting_enabled: true,
            request_timeout_secs: 300,
        }
    }
}

pub struct SchemaExtractor {
    llm: Arc<LlmClient>,
    queue: Option<Arc<LlmRequestQueue>>,
    config: SchemaExtractorConfig,
}

impl SchemaExtractor {
    pub fn new(
        llm: Arc<LlmClient>,
        queue: Option<Arc<LlmRequestQueue>>,
        config: SchemaExtractorConfig,
    ) -> Self {
        Self { llm, queue, config }
    }

    /// Extract one field group from one chunk of content.
    pub async fn extract_field_group(
        &self,
        content: &str,
        group: &FieldGroup,
        source_group: Option<&str>,
    ) -> Result<Value> {
        let system_prompt = build_system_prompt(group, self.config.quoting_enabled);
        let user_prompt = build_user_prompt(content, group, source_group);

        log::info!(
            "Extracting group {} ({} chars, entity_list={})",
            group.name,
            content.len(),
            group.is_entity_list
        );

        let raw = match &self.queue {
            Some(queue) => {
                let request = LlmRequest::new(
                    "extract_field_group",
                    json!({
                        "system_prompt": system_prompt,
                        "user_prompt": user_prompt,
                        "field_group": group.name,
                    }),
                    5,
                    self.config.request_timeout_secs,
                );
                let request_id = queue.enqueue(&request).await?;
                let response = queue
                    .wait_for_result(
                        &request_id,
                        Duration::from_secs(self.config.request_timeout_secs as u64),
                    )
                    .await?;
                match response.status {
                    LlmResponseStatus::Success => {
                        return self.finish(response.result.unwrap_or(Value::Null), group)
                    }
                    LlmResponseStatus::Timeout => {
                        return Err(AppError::Timeout(format!("llm request {}", request_id)))
                    }
                    LlmResponseStatus::Error => {
                        return Err(AppError::llm(
                            response.error.unwrap_or_else(|| "worker error".into()),
                        ))
                    }
                }
            }
            None => {
                self.llm
                    .chat_json(&system_prompt, &user_prompt, self.config.base_temperature)
                    .await?
            }
        };

        let parsed = try_repair_json(&raw, &format!("extract:{}", group.name))?;
        self.finish(parsed, group)
    }

    fn finish(&self, parsed: Value, group: &FieldGroup) -> Result<Value> {
        let with_defaults = apply_defaults(parsed, group);
        let populated = with_defaults
            .as_object()
            .map(|map| map.values().filter(|v| !v.is_null()).count())
            .unwrap_or(0);
        log::info!("Extracted group {} ({} populated keys)", group.name, populated);
        Ok(with_defaults)
    }
}

/// System prompt for a flat (non-entity) group.
pub fn build_system_prompt(group: &FieldGroup, quoting_enabled: bool) -> String {
    if group.is_entity_list {
        return build_entity_list_system_prompt(group, quoting_enabled);
    }

    let field_specs: Vec<String> = group
        .fields
        .iter()
        .map(|f| {
            let mut spec = format!("- \"{}\" ({}): {}", f.name, f.field_type.as_str(), f.description);
            if !f.enum_values.is_empty() {
                spec.push_str(&format!(" [options: {}]", f.enum_values.join(", ")));
            }
            if f.required {
                spec.push_str(" [REQUIRED]");
            }
            spec
        })
        .collect();

    let quoting = if quoting_enabled {
        "\nAdd a \"_quotes\" object mapping each extracted field to the verbatim source excerpt supporting it."
    } else {
        ""
    };

    format!(
        "You are extracting {} from documentation.\n\n\
         Fields to extract:\n{}\n\n{}\n\n\
         Output a JSON object with exactly these fields plus a \"confidence\" number between 0.0 and 1.0. \
         Use null for unknown values. For boolean fields, only return true if there is clear evidence.{}",
        group.description,
        field_specs.join("\n"),
        group.effective_prompt_hint(),
        quoting
    )
}

/// System prompt for an entity-list group. The output key is the group
/// name and each entity is identified by the group's id field.
fn build_entity_list_system_prompt(group: &FieldGroup, quoting_enabled: bool) -> String {
    let field_specs: Vec<String> = group
        .fields
        .iter()
        .map(|f| format!("- \"{}\" ({}): {}", f.name, f.field_type.as_str(), f.description))
        .collect();

    let id_field = group.id_field().unwrap_or("name");
    let quoting = if quoting_enabled {
        "Each entity may carry a \"_quote\" string with the verbatim source excerpt.\n"
    } else {
        ""
    };

    format!(
        "You are extracting {} from documentation.\n\n\
         For each entity found, extract:\n{}\n\n{}\n\n\
         Output JSON with structure:\n\
         {{\n  \"{}\": [\n    {{\"{}\": \"...\", ...}}\n  ],\n  \"confidence\": 0.0-1.0\n}}\n\n\
         {}Only include entities you find clear evidence for. Return an empty list if none are found.",
        group.description,
        field_specs.join("\n"),
        group.effective_prompt_hint(),
        group.name,
        id_field,
        quoting
    )
}

/// User prompt: optional source-group context plus truncated content.
pub fn build_user_prompt(content: &str, group: &FieldGroup, source_group: Option<&str>) -> String {
    let context = source_group
        .map(|name| format!("Source: {}\n\n", name))
        .unwrap_or_default();

    format!(
        "{}Extract {} information from this content:\n\n---\n{}\n---",
        context,
        group.name,
        truncate_chars(content, CONTENT_CHAR_LIMIT)
    )
}

/// Fill in missing fields: declared default, else false for booleans and
/// [] for lists, null otherwise.
pub fn apply_defaults(result: Value, group: &FieldGroup) -> Value {
    let mut map = match result {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    if group.is_entity_list {
        // Entity lists default to an empty list under the group key.
        if !map.contains_key(&group.name) {
            map.insert(group.name.clone(), Value::Array(Vec::new()));
        }
        return Value::Object(map);
    }

    for field in &group.fields {
        let missing = map.get(&field.name).map(Value::is_null).unwrap_or(true);
        if missing {
            let default = match (&field.default, field.field_type) {
                (Some(value), _) => value.clone(),
                (None, FieldType::Boolean) => Value::Bool(false),
                (None, FieldType::List) => Value::Array(Vec::new()),
                _ => Value::Null,
            };
            map.insert(field.name.clone(), default);
        }
    }

    Value::Object(map)
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldDefinition;
    use serde_json::json;

    fn flat_group() -> FieldGroup {
        FieldGroup {
            name: "company_info".into(),
            description: "company information".into(),
            fields: vec![
                FieldDefinition {
                    name: "name".into(),
                    field_type: FieldType::Text,
                    description: "Company name".into(),
                    enum_values: vec![],
                    required: true,
                    default: None,
                },
                FieldDefinition {
                    name: "industry".into(),
                    field_type: FieldType::Enum,
                    description: "Industry".into(),
                    enum_values: vec!["manufacturing".into(), "services".into()],
                    required: false,
                    default: None,
                },
                FieldDefinition {
                    name: "is_public".into(),
                    field_type: FieldType::Boolean,
                    description: "Publicly listed".into(),
                    enum_values: vec![],
                    required: false,
                    default: None,
                },
                FieldDefinition {
                    name: "certifications".into(),
                    field_type: FieldType::List,
                    description: "Certifications held".into(),
                    enum_values: vec![],
                    required: false,
                    default: None,
                },
            ],
            prompt_hint: Some("Prefer the about page.".into()),
            is_entity_list: false,
            entity_id_field: None,
        }
    }

    fn entity_group() -> FieldGroup {
        FieldGroup {
            name: "products_list".into(),
            description: "products offered".into(),
            fields: vec![
                FieldDefinition {
                    name: "product_name".into(),
                    field_type: FieldType::Text,
                    description: "Product name".into(),
                    enum_values: vec![],
                    required: true,
                    default: None,
                },
                FieldDefinition {
                    name: "power_kw".into(),
                    field_type: FieldType::Float,
                    description: "Rated power".into(),
                    enum_values: vec![],
                    required: false,
                    default: None,
                },
            ],
            prompt_hint: None,
            is_entity_list: true,
            entity_id_field: Some("product_name".into()),
        }
    }

    #[test]
    fn flat_prompt_lists_fields_types_and_options() {
        let prompt = build_system_prompt(&flat_group(), false);
        assert!(prompt.contains("\"name\" (text)"));
        assert!(prompt.contains("[options: manufacturing, services]"));
        assert!(prompt.contains("[REQUIRED]"));
        assert!(prompt.contains("Prefer the about page."));
        assert!(prompt.contains("confidence"));
        assert!(!prompt.contains("_quotes"));
    }

    #[test]
    fn quoting_flag_adds_quotes_instruction() {
        let prompt = build_system_prompt(&flat_group(), true);
        assert!(prompt.contains("_quotes"));
    }

    #[test]
    fn entity_prompt_keys_output_by_group_name() {
        let prompt = build_system_prompt(&entity_group(), false);
        assert!(prompt.contains("\"products_list\": ["));
        assert!(prompt.contains("\"product_name\": \"...\""));
        assert!(!prompt.contains("\"products\": ["));
    }

    #[test]
    fn entity_prompt_quote_is_per_entity() {
        let prompt = build_system_prompt(&entity_group(), true);
        assert!(prompt.contains("_quote"));
        assert!(!prompt.contains("_quotes"));
    }

    #[test]
    fn user_prompt_carries_source_context_and_truncates() {
        let long_content = "x".repeat(CONTENT_CHAR_LIMIT + 500);
        let prompt = build_user_prompt(&long_content, &flat_group(), Some("Acme"));
        assert!(prompt.starts_with("Source: Acme"));
        assert!(prompt.len() < long_content.len() + 200);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let result = apply_defaults(json!({"name": "Acme"}), &flat_group());
        assert_eq!(result["name"], "Acme");
        assert_eq!(result["is_public"], false);
        assert_eq!(result["certifications"], json!([]));
        assert_eq!(result["industry"], Value::Null);
    }

    #[test]
    fn declared_default_wins() {
        let mut group = flat_group();
        group.fields[1].default = Some(json!("manufacturing"));
        let result = apply_defaults(json!({}), &group);
        assert_eq!(result["industry"], "manufacturing");
    }

    #[test]
    fn entity_list_defaults_to_empty_list() {
        let result = apply_defaults(json!({"confidence": 0.4}), &entity_group());
        assert_eq!(result["products_list"], json!([]));
        assert_eq!(result["confidence"], 0.4);
    }

    #[test]
    fn null_fields_are_overwritten_by_defaults() {
        let result = apply_defaults(json!({"is_public": null}), &flat_group());
        assert_eq!(result["is_public"], false);
    }
}
