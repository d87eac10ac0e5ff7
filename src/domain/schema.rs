//! Field-group schema: the unit of LLM extraction.
//!
//! A project's `extraction_schema` is a JSON document of the shape
//! `{"field_groups": [{name, description, fields: [...], ...}]}`. Parsing it
//! at the boundary yields strongly typed groups; anything malformed fails
//! loudly instead of producing half-validated extractions.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared type of an extraction field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    Enum,
    List,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Enum => "enum",
            Self::List => "list",
        }
    }
}

/// One extractable field within a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// A named set of fields extracted together in one LLM call.
///
/// Entity-list groups produce a list of entity objects under the group name
/// instead of a flat object; `entity_id_field` names the field that
/// identifies each entity across chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub prompt_hint: Option<String>,
    #[serde(default)]
    pub is_entity_list: bool,
    #[serde(default)]
    pub entity_id_field: Option<String>,
}

impl FieldGroup {
    /// Field identifying an entity within an entity-list group.
    ///
    /// Falls back to the first text field when none is configured.
    pub fn id_field(&self) -> Option<&str> {
        if let Some(name) = self.entity_id_field.as_deref() {
            return Some(name);
        }
        self.fields
            .iter()
            .find(|f| f.field_type == FieldType::Text)
            .map(|f| f.name.as_str())
    }

    /// Human prompt hint: explicit from the schema, otherwise generated
    /// from the description and field names.
    pub fn effective_prompt_hint(&self) -> String {
        if let Some(hint) = self.prompt_hint.as_deref() {
            if !hint.trim().is_empty() {
                return hint.to_string();
            }
        }
        let field_names: Vec<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        format!(
            "Focus on {}. Look for explicit statements about: {}.",
            self.description.trim().to_lowercase(),
            field_names.join(", ")
        )
    }
}

/// Parse the `field_groups` array out of a project's extraction schema.
pub fn parse_field_groups(extraction_schema: &Value) -> Result<Vec<FieldGroup>> {
    let groups = extraction_schema
        .get("field_groups")
        .context("extraction_schema is missing field_groups")?;
    serde_json::from_value(groups.clone()).context("invalid field_groups definition")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> Value {
        json!({
            "field_groups": [
                {
                    "name": "company_info",
                    "description": "Company information",
                    "fields": [
                        {"name": "name", "type": "text", "description": "Company name"},
                        {"name": "employees", "type": "integer", "description": "Headcount"},
                        {
                            "name": "industry",
                            "type": "enum",
                            "description": "Industry",
                            "enum_values": ["manufacturing", "services"]
                        }
                    ],
                    "prompt_hint": "Prefer the about page."
                },
                {
                    "name": "products_list",
                    "description": "Products offered",
                    "is_entity_list": true,
                    "entity_id_field": "product_name",
                    "fields": [
                        {"name": "product_name", "type": "text", "description": "Name"},
                        {"name": "power_kw", "type": "float", "description": "Rated power"}
                    ]
                }
            ]
        })
    }

    #[test]
    fn parses_field_groups() {
        let groups = parse_field_groups(&sample_schema()).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "company_info");
        assert_eq!(groups[0].fields.len(), 3);
        assert!(groups[1].is_entity_list);
    }

    #[test]
    fn id_field_prefers_configured_name() {
        let groups = parse_field_groups(&sample_schema()).unwrap();
        assert_eq!(groups[1].id_field(), Some("product_name"));
    }

    #[test]
    fn id_field_falls_back_to_first_text_field() {
        let mut groups = parse_field_groups(&sample_schema()).unwrap();
        groups[1].entity_id_field = None;
        assert_eq!(groups[1].id_field(), Some("product_name"));
    }

    #[test]
    fn missing_field_groups_is_an_error() {
        assert!(parse_field_groups(&json!({})).is_err());
    }

    #[test]
    fn generated_hint_mentions_fields() {
        let mut groups = parse_field_groups(&sample_schema()).unwrap();
        groups[0].prompt_hint = None;
        let hint = groups[0].effective_prompt_hint();
        assert!(hint.contains("name"));
        assert!(hint.contains("employees"));
    }
}
