//! Schema-aware validation and type coercion for extraction results.
//!
//! LLMs return numbers as strings, enums in the wrong case, and scalars
//! where lists belong. Coercion fixes what it can and records a violation;
//! what it cannot fix becomes null with a violation. Metadata keys pass
//! through untouched.

use serde_json::{Map, Value};

use crate::domain::{FieldDefinition, FieldGroup, FieldType};

/// Keys that are metadata, not extracted fields.
pub const METADATA_KEYS: [&str; 4] = ["confidence", "_quotes", "_conflicts", "_validation"];

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub field: String,
    pub issue: String,
    pub detail: String,
    pub entity_index: Option<usize>,
}

impl Violation {
    fn new(field: &str, issue: &str, detail: String) -> Self {
        Self {
            field: field.to_string(),
            issue: issue.to_string(),
            detail,
            entity_index: None,
        }
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("field".into(), Value::String(self.field.clone()));
        map.insert("issue".into(), Value::String(self.issue.clone()));
        map.insert("detail".into(), Value::String(self.detail.clone()));
        if let Some(index) = self.entity_index {
            map.insert("entity_index".into(), Value::String(index.to_string()));
        }
        Value::Object(map)
    }
}

pub struct SchemaValidator {
    min_confidence: f64,
}

impl SchemaValidator {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    /// Validate and coerce `data` against the group schema.
    ///
    /// Returns the cleaned object and the violations recorded into its
    /// `_validation` key.
    pub fn validate(&self, data: &Value, group: &FieldGroup) -> (Value, Vec<Violation>) {
        let empty = Map::new();
        let data_map = data.as_object().unwrap_or(&empty);
        let mut violations: Vec<Violation> = Vec::new();

        // Confidence gating: below threshold, null everything.
        let confidence = data_map
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if self.min_confidence > 0.0 && confidence < self.min_confidence {
            let mut cleaned = keep_metadata(data_map);
            violations.push(Violation::new(
                "*",
                "confidence_below_threshold",
                format!("confidence {} < threshold {}", confidence, self.min_confidence),
            ));
            for field in &group.fields {
                cleaned.insert(field.name.clone(), Value::Null);
            }
            insert_validation(&mut cleaned, &violations);
            return (Value::Object(cleaned), violations);
        }

        if group.is_entity_list {
            return self.validate_entity_list(data_map, group, violations);
        }

        let mut cleaned = keep_metadata(data_map);
        for field in &group.fields {
            let value = data_map.get(&field.name).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                cleaned.insert(field.name.clone(), Value::Null);
                continue;
            }
            let (coerced, violation) = coerce_value(value, field);
            cleaned.insert(field.name.clone(), coerced);
            if let Some(violation) = violation {
                violations.push(violation);
            }
        }

        if !violations.is_empty() {
            insert_validation(&mut cleaned, &violations);
            log::info!(
                "Validation recorded {} violations for group {}",
                violations.len(),
                group.name
            );
        }
        (Value::Object(cleaned), violations)
    }

    /// Validate each entity of an entity-list group independently;
    /// violations carry the entity index, per-entity `_quote` survives.
    fn validate_entity_list(
        &self,
        data_map: &Map<String, Value>,
        group: &FieldGroup,
        mut violations: Vec<Violation>,
    ) -> (Value, Vec<Violation>) {
        let mut cleaned = keep_metadata(data_map);

        let entity_key = data_map
            .iter()
            .find(|(key, value)| !METADATA_KEYS.contains(&key.as_str()) && value.is_array())
            .map(|(key, _)| key.clone());

        let Some(entity_key) = entity_key else {
            insert_validation(&mut cleaned, &violations);
            return (Value::Object(cleaned), violations);
        };

        let entities = data_map[&entity_key].as_array().cloned().unwrap_or_default();
        let mut validated: Vec<Value> = Vec::with_capacity(entities.len());

        for (index, entity) in entities.into_iter().enumerate() {
            let Some(entity_map) = entity.as_object() else {
                continue;
            };
            let mut out = Map::new();
            for field in &group.fields {
                let value = entity_map.get(&field.name).cloned().unwrap_or(Value::Null);
                if value.is_null() {
                    out.insert(field.name.clone(), Value::Null);
                    continue;
                }
                let (coerced, violation) = coerce_value(value, field);
                out.insert(field.name.clone(), coerced);
                if let Some(mut violation) = violation {
                    violation.entity_index = Some(index);
                    violations.push(violation);
                }
            }
            if let Some(quote) = entity_map.get("_quote") {
                out.insert("_quote".into(), quote.clone());
            }
            validated.push(Value::Object(out));
        }

        cleaned.insert(entity_key, Value::Array(validated));
        if !violations.is_empty() {
            insert_validation(&mut cleaned, &violations);
        }
        (Value::Object(cleaned), violations)
    }
}

fn keep_metadata(data: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for key in METADATA_KEYS {
        if let Some(value) = data.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    out
}

fn insert_validation(map: &mut Map<String, Value>, violations: &[Violation]) {
    map.insert(
        "_validation".into(),
        Value::Array(violations.iter().map(Violation::to_value).collect()),
    );
}

/// Coerce one value to its declared field type.
pub fn coerce_value(value: Value, field: &FieldDefinition) -> (Value, Option<Violation>) {
    match field.field_type {
        FieldType::Boolean => coerce_bool(value, field),
        FieldType::Integer => coerce_int(value, field),
        FieldType::Float => coerce_float(value, field),
        FieldType::Enum => coerce_enum(value, field),
        FieldType::List => coerce_list(value, field),
        FieldType::Text => (value, None),
    }
}

fn coerce_bool(value: Value, field: &FieldDefinition) -> (Value, Option<Violation>) {
    match &value {
        Value::Bool(_) => (value, None),
        Value::String(s) => {
            let lowered = s.to_lowercase();
            if ["true", "yes", "1"].contains(&lowered.as_str()) {
                (
                    Value::Bool(true),
                    Some(Violation::new(
                        &field.name,
                        "type_coerced",
                        format!("string '{}' -> true", s),
                    )),
                )
            } else if ["false", "no", "0"].contains(&lowered.as_str()) {
                (
                    Value::Bool(false),
                    Some(Violation::new(
                        &field.name,
                        "type_coerced",
                        format!("string '{}' -> false", s),
                    )),
                )
            } else {
                invalid(value, field, "bool")
            }
        }
        Value::Number(n) => {
            let truthy = n.as_f64().map(|f| f != 0.0).unwrap_or(false);
            (
                Value::Bool(truthy),
                Some(Violation::new(
                    &field.name,
                    "type_coerced",
                    format!("number {} -> {}", n, truthy),
                )),
            )
        }
        _ => invalid(value, field, "bool"),
    }
}

fn coerce_int(value: Value, field: &FieldDefinition) -> (Value, Option<Violation>) {
    match &value {
        Value::Number(n) if n.is_i64() || n.is_u64() => (value, None),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() => (
                Value::from(f.trunc() as i64),
                Some(Violation::new(
                    &field.name,
                    "type_coerced",
                    format!("float {} -> int {}", f, f.trunc() as i64),
                )),
            ),
            _ => invalid(value, field, "int"),
        },
        Value::String(s) => {
            let cleaned: String = s.replace([',', ' '], "");
            match cleaned.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => {
                    let int_value = f.trunc() as i64;
                    (
                        Value::from(int_value),
                        Some(Violation::new(
                            &field.name,
                            "type_coerced",
                            format!("string '{}' -> int {}", s, int_value),
                        )),
                    )
                }
                _ => invalid(value, field, "int"),
            }
        }
        _ => invalid(value, field, "int"),
    }
}

fn coerce_float(value: Value, field: &FieldDefinition) -> (Value, Option<Violation>) {
    match &value {
        Value::Number(n) if n.is_f64() => (value, None),
        Value::Number(n) => match n.as_f64() {
            Some(f) => (Value::from(f), None),
            None => invalid(value, field, "float"),
        },
        Value::String(s) => {
            let cleaned: String = s.replace([',', ' '], "");
            match cleaned.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => (
                    Value::from(f),
                    Some(Violation::new(
                        &field.name,
                        "type_coerced",
                        format!("string '{}' -> float {}", s, f),
                    )),
                ),
                _ => invalid(value, field, "float"),
            }
        }
        _ => invalid(value, field, "float"),
    }
}

fn coerce_enum(value: Value, field: &FieldDefinition) -> (Value, Option<Violation>) {
    if field.enum_values.is_empty() {
        return (Value::String(value_to_string(&value)), None);
    }

    let str_value = value_to_string(&value);
    if field.enum_values.iter().any(|ev| ev == &str_value) {
        return (Value::String(str_value), None);
    }

    let lowered = str_value.to_lowercase();
    if let Some(matched) = field.enum_values.iter().find(|ev| ev.to_lowercase() == lowered) {
        return (
            Value::String(matched.clone()),
            Some(Violation::new(
                &field.name,
                "type_coerced",
                format!("enum case corrected '{}' -> '{}'", str_value, matched),
            )),
        );
    }

    (
        Value::Null,
        Some(Violation::new(
            &field.name,
            "invalid_enum",
            format!("'{}' not in {:?}", str_value, field.enum_values),
        )),
    )
}

fn coerce_list(value: Value, field: &FieldDefinition) -> (Value, Option<Violation>) {
    match value {
        Value::Array(_) => (value, None),
        other => (
            Value::Array(vec![other]),
            Some(Violation::new(
                &field.name,
                "type_coerced",
                "single value wrapped in list".to_string(),
            )),
        ),
    }
}

fn invalid(value: Value, field: &FieldDefinition, target: &str) -> (Value, Option<Violation>) {
    (
        Value::Null,
        Some(Violation::new(
            &field.name,
            "invalid_type",
            format!("cannot coerce {} to {}", value_to_string(&value), target),
        )),
    )
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, field_type: FieldType) -> FieldDefinition {
        FieldDefinition {
            name: name.into(),
            field_type,
            description: String::new(),
            enum_values: vec![],
            required: false,
            default: None,
        }
    }

    fn enum_field(name: &str, options: &[&str]) -> FieldDefinition {
        FieldDefinition {
            enum_values: options.iter().map(|s| s.to_string()).collect(),
            ..field(name, FieldType::Enum)
        }
    }

    fn group() -> FieldGroup {
        FieldGroup {
            name: "company_info".into(),
            description: "Company information".into(),
            fields: vec![
                field("name", FieldType::Text),
                field("employees", FieldType::Integer),
                field("revenue", FieldType::Float),
                field("is_public", FieldType::Boolean),
                enum_field("industry", &["manufacturing", "services"]),
                field("certifications", FieldType::List),
            ],
            prompt_hint: None,
            is_entity_list: false,
            entity_id_field: None,
        }
    }

    #[test]
    fn comma_separated_integer_coerces() {
        let (value, violation) = coerce_value(json!("1,500"), &field("employees", FieldType::Integer));
        assert_eq!(value, json!(1500));
        assert_eq!(violation.unwrap().issue, "type_coerced");
    }

    #[test]
    fn plain_integer_passes_untouched() {
        let (value, violation) = coerce_value(json!(42), &field("employees", FieldType::Integer));
        assert_eq!(value, json!(42));
        assert!(violation.is_none());
    }

    #[test]
    fn numeric_string_coerces_to_int() {
        let (value, violation) = coerce_value(json!("42"), &field("employees", FieldType::Integer));
        assert_eq!(value, json!(42));
        assert!(violation.is_some());
    }

    #[test]
    fn garbage_integer_nullifies() {
        let (value, violation) = coerce_value(json!("plenty"), &field("employees", FieldType::Integer));
        assert_eq!(value, Value::Null);
        assert_eq!(violation.unwrap().issue, "invalid_type");
    }

    #[test]
    fn bool_strings_coerce() {
        for truthy in ["true", "Yes", "1"] {
            let (value, violation) = coerce_value(json!(truthy), &field("is_public", FieldType::Boolean));
            assert_eq!(value, json!(true), "{truthy}");
            assert!(violation.is_some());
        }
        for falsy in ["false", "No", "0"] {
            let (value, _) = coerce_value(json!(falsy), &field("is_public", FieldType::Boolean));
            assert_eq!(value, json!(false), "{falsy}");
        }
    }

    #[test]
    fn enum_matches_case_insensitively_with_violation() {
        let (value, violation) = coerce_value(
            json!("Manufacturing"),
            &enum_field("industry", &["manufacturing", "services"]),
        );
        assert_eq!(value, json!("manufacturing"));
        assert_eq!(violation.unwrap().issue, "type_coerced");
    }

    #[test]
    fn unknown_enum_value_nullifies() {
        let (value, violation) = coerce_value(
            json!("agriculture"),
            &enum_field("industry", &["manufacturing", "services"]),
        );
        assert_eq!(value, Value::Null);
        assert_eq!(violation.unwrap().issue, "invalid_enum");
    }

    #[test]
    fn single_value_wraps_into_list() {
        let (value, violation) = coerce_value(json!("ISO 9001"), &field("certifications", FieldType::List));
        assert_eq!(value, json!(["ISO 9001"]));
        assert!(violation.is_some());
    }

    #[test]
    fn float_string_with_commas_coerces() {
        let (value, _) = coerce_value(json!("12,500.5"), &field("revenue", FieldType::Float));
        assert_eq!(value, json!(12500.5));
    }

    #[test]
    fn validate_preserves_metadata_and_records_violations() {
        let validator = SchemaValidator::new(0.0);
        let data = json!({
            "name": "Acme",
            "employees": "1,500",
            "is_public": "yes",
            "confidence": 0.85,
            "_quotes": {"name": "Acme Corp was founded"},
        });

        let (cleaned, violations) = validator.validate(&data, &group());

        assert_eq!(cleaned["name"], "Acme");
        assert_eq!(cleaned["employees"], 1500);
        assert_eq!(cleaned["is_public"], true);
        assert_eq!(cleaned["confidence"], 0.85);
        assert_eq!(cleaned["_quotes"]["name"], "Acme Corp was founded");
        assert_eq!(violations.len(), 2);
        assert!(cleaned["_validation"].is_array());
    }

    #[test]
    fn confidence_gate_nullifies_all_fields() {
        let validator = SchemaValidator::new(0.5);
        let data = json!({"name": "Acme", "employees": 10, "confidence": 0.2});

        let (cleaned, violations) = validator.validate(&data, &group());

        assert_eq!(cleaned["name"], Value::Null);
        assert_eq!(cleaned["employees"], Value::Null);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].issue, "confidence_below_threshold");
        assert_eq!(violations[0].field, "*");
    }

    #[test]
    fn entity_list_validates_each_entity() {
        let validator = SchemaValidator::new(0.0);
        let entity_group = FieldGroup {
            name: "products_list".into(),
            description: "Products".into(),
            fields: vec![
                field("product_name", FieldType::Text),
                field("power_kw", FieldType::Float),
            ],
            prompt_hint: None,
            is_entity_list: true,
            entity_id_field: Some("product_name".into()),
        };
        let data = json!({
            "products_list": [
                {"product_name": "X200", "power_kw": "200", "_quote": "X200 delivers 200kW"},
                {"product_name": "X300", "power_kw": "lots"},
            ],
            "confidence": 0.9,
        });

        let (cleaned, violations) = validator.validate(&data, &entity_group);

        let products = cleaned["products_list"].as_array().unwrap();
        assert_eq!(products[0]["power_kw"], 200.0);
        assert_eq!(products[0]["_quote"], "X200 delivers 200kW");
        assert_eq!(products[1]["power_kw"], Value::Null);
        // One coercion on entity 0, one invalid on entity 1.
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].entity_index, Some(0));
        assert_eq!(violations[1].entity_index, Some(1));
    }
}
