//! Agent output parsing and validation
//!
//! Runner output claimed to be JSON gets three passes before it reaches
//! hooks: extraction (models wrap objects in fences or prose), enum
//! normalization (case folding, pipe-joined lists collapsed to the first
//! valid option), and schema validation. Normalization is idempotent.

use crate::error::{HarmoniaError, Result};
use serde_json::{json, Value};

/// Minimal default schema for agents that do not declare one
pub fn default_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "result": {}
        },
        "required": ["summary"]
    })
}

/// Extract one JSON object from raw runner output
///
/// Accepts a bare object, an object inside markdown code fences, or an
/// object embedded in surrounding prose.
pub fn extract_json(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    // Fenced block: ```json ... ``` or plain ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let candidate = after[..end].trim();
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                return Ok(value);
            }
        }
    }

    // Outermost braces in prose
    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if open < close {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[open..=close]) {
                return Ok(value);
            }
        }
    }

    Err(HarmoniaError::Parse(format!(
        "no JSON object found in output ({} bytes)",
        raw.len()
    )))
}

/// Normalize enum-constrained strings in `value` against `schema`
///
/// - Case-insensitive matches are rewritten to the canonical enum value
///   (`simple` → `SIMPLE`)
/// - Pipe-joined lists collapse to the first segment that is a valid
///   option (`simple|complex` → the canonical form of `simple`)
pub fn normalize_enums(value: &mut Value, schema: &Value) {
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if let Value::String(s) = value {
            if let Some(canonical) = normalize_enum_string(s, options) {
                *value = Value::String(canonical);
            }
        }
        return;
    }

    match value {
        Value::Object(map) => {
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (key, prop_schema) in properties {
                    if let Some(child) = map.get_mut(key) {
                        normalize_enums(child, prop_schema);
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for item in items {
                    normalize_enums(item, item_schema);
                }
            }
        }
        _ => {}
    }
}

fn normalize_enum_string(s: &str, options: &[Value]) -> Option<String> {
    let canonical = |candidate: &str| -> Option<String> {
        options.iter().find_map(|opt| {
            opt.as_str()
                .filter(|o| o.eq_ignore_ascii_case(candidate))
                .map(String::from)
        })
    };

    if let Some(exact) = canonical(s) {
        return Some(exact);
    }
    if s.contains('|') {
        for segment in s.split('|') {
            if let Some(found) = canonical(segment.trim()) {
                return Some(found);
            }
        }
    }
    None
}

/// Validate `value` against `schema`; returns every violation message
pub fn validate_schema(value: &Value, schema: &Value) -> std::result::Result<(), Vec<String>> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| vec![format!("schema does not compile: {e}")])?;

    let result = match compiled.validate(value) {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors.map(|e| e.to_string()).collect()),
    };
    result
}

/// Full parse pipeline: extract, normalize, validate
///
/// On validation failure the normalized value is still returned so
/// non-validator roles can pass it through alongside the warning.
pub fn parse_structured(
    raw: &str,
    schema: &Value,
) -> Result<(Value, std::result::Result<(), Vec<String>>)> {
    let mut value = extract_json(raw)?;
    normalize_enums(&mut value, schema);
    let validation = validate_schema(&value, schema);
    Ok((value, validation))
}
