//! Repair for malformed LLM JSON output.
//!
//! Models truncate mid-string, wrap output in markdown fences, or fall back
//! to Python-style single quotes. Each repair strategy targets one failure
//! shape; they are tried in a fixed order, cheapest first.

use serde_json::Value;

use crate::error::{AppError, Result};

/// Attempt to parse `text` as a JSON object, repairing on failure.
///
/// Strategy order:
/// 1. direct parse
/// 2. strip markdown code fences
/// 3. close unterminated strings
/// 4. balance brackets/braces
/// 5. strings + brackets combined
/// 6. strip trailing commas, then balance
/// 7. single quotes to double quotes, then balance
/// 8. the full chain
pub fn repair_json(malformed: &str) -> Result<Value> {
    let text = malformed.trim();
    if text.is_empty() {
        return Err(AppError::MalformedJson("empty response".into()));
    }

    if let Ok(value) = parse_object(text) {
        return Ok(value);
    }

    let unfenced = strip_code_fences(text);
    if let Ok(value) = parse_object(&unfenced) {
        return Ok(value);
    }

    if let Ok(value) = parse_object(&fix_unterminated_strings(text)) {
        return Ok(value);
    }

    if let Ok(value) = parse_object(&balance_brackets(text)) {
        return Ok(value);
    }

    if let Ok(value) = parse_object(&balance_brackets(&fix_unterminated_strings(text))) {
        return Ok(value);
    }

    if let Ok(value) = parse_object(&balance_brackets(&remove_trailing_commas(text))) {
        return Ok(value);
    }

    if let Ok(value) = parse_object(&balance_brackets(&fix_quotes(text))) {
        return Ok(value);
    }

    let full = balance_brackets(&remove_trailing_commas(&fix_unterminated_strings(&unfenced)));
    if let Ok(value) = parse_object(&full) {
        return Ok(value);
    }

    Err(AppError::MalformedJson(format!(
        "all repair strategies failed for content of {} chars",
        malformed.len()
    )))
}

/// Parse with a repair fallback, logging repair activity.
pub fn try_repair_json(text: &str, context: &str) -> Result<Value> {
    match parse_object(text) {
        Ok(value) => Ok(value),
        Err(original) => {
            log::warn!(
                "JSON parse failed in {} ({} chars), attempting repair: {}",
                context,
                text.len(),
                original
            );
            match repair_json(text) {
                Ok(value) => {
                    log::info!("JSON repair succeeded in {}", context);
                    Ok(value)
                }
                Err(err) => {
                    log::warn!("JSON repair failed in {}: {}", context, err);
                    Err(err)
                }
            }
        }
    }
}

fn parse_object(text: &str) -> std::result::Result<Value, serde_json::Error> {
    serde_json::from_str(text)
}

/// Remove ```json ... ``` wrappers.
fn strip_code_fences(text: &str) -> String {
    let mut out = text.trim();
    if let Some(rest) = out.strip_prefix("```json") {
        out = rest;
    } else if let Some(rest) = out.strip_prefix("```") {
        out = rest;
    }
    if let Some(rest) = out.strip_suffix("```") {
        out = rest;
    }
    out.trim().to_string()
}

/// Close a string left open by truncation, e.g. `{"name": "test`.
fn fix_unterminated_strings(text: &str) -> String {
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_string = !in_string,
            _ => {}
        }
    }

    if in_string {
        let mut repaired = text.to_string();
        repaired.push('"');
        repaired
    } else {
        text.to_string()
    }
}

/// Append closers for unbalanced brackets/braces outside strings.
fn balance_brackets(text: &str) -> String {
    let mut brace_depth: i32 = 0;
    let mut bracket_depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' => brace_depth += 1,
            '}' => brace_depth -= 1,
            '[' => bracket_depth += 1,
            ']' => bracket_depth -= 1,
            _ => {}
        }
    }

    let mut repaired = text.to_string();
    // Inner brackets close before outer braces.
    for _ in 0..bracket_depth.max(0) {
        repaired.push(']');
    }
    for _ in 0..brace_depth.max(0) {
        repaired.push('}');
    }
    repaired
}

/// Drop `,` immediately before `]` or `}`.
fn remove_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();

    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            // Look past whitespace for a closer.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == ']' || chars[j] == '}') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Convert single-quoted JSON to double quotes when the text clearly uses
/// single quotes for structure.
fn fix_quotes(text: &str) -> String {
    if text.contains('\'') && !text.contains('"') {
        return text.replace('\'', "\"");
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_passes_through() {
        let value = repair_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn strips_code_fences() {
        let value = repair_json("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn closes_truncated_string() {
        let value = repair_json(r#"{"name": "test"#).unwrap();
        assert_eq!(value, json!({"name": "test"}));
    }

    #[test]
    fn balances_brackets() {
        let value = repair_json(r#"{"items": [1, 2"#).unwrap();
        assert_eq!(value, json!({"items": [1, 2]}));
    }

    #[test]
    fn removes_trailing_commas() {
        let value = repair_json(r#"{"a": 1,}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
        let value = repair_json(r#"{"a": [1, 2,]}"#).unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[test]
    fn converts_single_quotes() {
        let value = repair_json("{'key': 'value'}").unwrap();
        assert_eq!(value, json!({"key": "value"}));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(repair_json("").is_err());
        assert!(repair_json("   ").is_err());
    }

    #[test]
    fn hopeless_input_is_an_error() {
        assert!(repair_json("definitely not json at all").is_err());
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let value = repair_json(r#"{"text": "a { b"#).unwrap();
        assert_eq!(value, json!({"text": "a { b"}));
    }

    #[test]
    fn try_repair_reports_context_errors() {
        let err = try_repair_json("nonsense", "extract_fields").unwrap_err();
        assert!(matches!(err, AppError::MalformedJson(_)));
    }
}
