//! Validation of run input variables against a procedure's variables
//! schema, mirrored at the API boundary so bad inputs never reach the
//! executor.
//!
//! Schema entry format (flat, per variable):
//! `{type, required, default, description, validation: {regex, min, max,
//! allowed_values}}`. The nested required/optional form is flattened by the
//! parser before it gets here.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};

/// Validate `input_vars` against the schema. Returns per-field error
/// messages; empty map means everything is valid.
pub fn validate_input_vars(
    schema: &Map<String, Value>,
    input_vars: &Map<String, Value>,
) -> BTreeMap<String, String> {
    let mut errors = BTreeMap::new();

    for (name, meta) in schema {
        let Some(meta) = meta.as_object() else {
            continue;
        };
        let value = input_vars.get(name);
        let required = meta
            .get("required")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let field_type = meta.get("type").and_then(Value::as_str);
        let validation = meta
            .get("validation")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        // Required presence: empty strings count as absent.
        let absent = match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            _ => false,
        };
        if absent {
            if required && meta.get("default").is_none() {
                errors.insert(name.clone(), "this field is required".to_string());
            }
            continue;
        }
        let value = value.expect("present");

        // Type checks.
        match field_type {
            Some("number") => {
                let ok = value.is_number()
                    || value
                        .as_str()
                        .map(|s| s.parse::<f64>().is_ok())
                        .unwrap_or(false);
                if !ok {
                    errors.insert(name.clone(), "must be a number".to_string());
                    continue;
                }
            }
            Some("boolean") => {
                if !value.is_boolean() {
                    errors.insert(name.clone(), "must be a boolean (true/false)".to_string());
                    continue;
                }
            }
            Some("array") => {
                if !value.is_array() {
                    errors.insert(name.clone(), "must be a valid array".to_string());
                    continue;
                }
            }
            Some("object") => {
                if !value.is_object() {
                    errors.insert(name.clone(), "must be a valid object".to_string());
                    continue;
                }
            }
            _ => {}
        }

        // Allowed values (compared as strings, as the UI does).
        if let Some(allowed) = validation.get("allowed_values").and_then(Value::as_array) {
            let as_text = value_text(value);
            if !allowed.iter().any(|v| value_text(v) == as_text) {
                let list: Vec<String> = allowed.iter().map(value_text).collect();
                errors.insert(name.clone(), format!("must be one of: {}", list.join(", ")));
                continue;
            }
        }

        // Regex (full match), skipped when the schema pattern is invalid.
        if let (Some(pattern), Some(text)) = (
            validation.get("regex").and_then(Value::as_str),
            value.as_str(),
        ) {
            if let Ok(re) = Regex::new(&format!("^(?:{pattern})$")) {
                if !re.is_match(text) {
                    errors.insert(
                        name.clone(),
                        format!("does not match required pattern: {pattern}"),
                    );
                    continue;
                }
            }
        }

        // min/max: numeric bounds for numbers, length bounds for strings.
        let min = validation.get("min").and_then(Value::as_f64);
        let max = validation.get("max").and_then(Value::as_f64);
        if let Some(n) = value.as_f64() {
            if let Some(min) = min {
                if n < min {
                    errors.insert(name.clone(), format!("must be at least {min}"));
                    continue;
                }
            }
            if let Some(max) = max {
                if n > max {
                    errors.insert(name.clone(), format!("must be at most {max}"));
                    continue;
                }
            }
        } else if let Some(s) = value.as_str() {
            let len = s.chars().count() as f64;
            if let Some(min) = min {
                if len < min {
                    errors.insert(name.clone(), format!("must be at least {min} characters"));
                    continue;
                }
            }
            if let Some(max) = max {
                if len > max {
                    errors.insert(name.clone(), format!("must be at most {max} characters"));
                    continue;
                }
            }
        }
    }

    errors
}

/// Fold schema defaults into the input vars for every omitted variable.
pub fn apply_defaults(schema: &Map<String, Value>, input_vars: &mut Map<String, Value>) {
    for (name, meta) in schema {
        if input_vars.contains_key(name) {
            continue;
        }
        if let Some(default) = meta.get("default") {
            input_vars.insert(name.clone(), default.clone());
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Map<String, Value> {
        json!({
            "invoice_id": {"type": "string", "required": true,
                           "validation": {"regex": "INV-\\d+"}},
            "amount": {"type": "number",
                       "validation": {"min": 0, "max": 1000}},
            "region": {"type": "string", "default": "eu",
                       "validation": {"allowed_values": ["eu", "us"]}},
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn missing_required_field_is_reported() {
        let errors = validate_input_vars(&schema(), &Map::new());
        assert_eq!(errors["invoice_id"], "this field is required");
        // Optional fields may be absent.
        assert!(!errors.contains_key("amount"));
    }

    #[test]
    fn type_and_range_checks() {
        let input = json!({"invoice_id": "INV-7", "amount": 2000})
            .as_object()
            .cloned()
            .unwrap();
        let errors = validate_input_vars(&schema(), &input);
        assert!(errors["amount"].contains("at most"));

        let input = json!({"invoice_id": "INV-7", "amount": "not-a-number"})
            .as_object()
            .cloned()
            .unwrap();
        let errors = validate_input_vars(&schema(), &input);
        assert_eq!(errors["amount"], "must be a number");
    }

    #[test]
    fn regex_and_allowed_values() {
        let input = json!({"invoice_id": "bad", "region": "apac"})
            .as_object()
            .cloned()
            .unwrap();
        let errors = validate_input_vars(&schema(), &input);
        assert!(errors["invoice_id"].contains("pattern"));
        assert!(errors["region"].contains("one of"));
    }

    #[test]
    fn defaults_fill_missing_vars() {
        let mut input = json!({"invoice_id": "INV-7"})
            .as_object()
            .cloned()
            .unwrap();
        apply_defaults(&schema(), &mut input);
        assert_eq!(input["region"], json!("eu"));
        assert_eq!(input["invoice_id"], json!("INV-7"));
    }
}
