//! Safe condition evaluator: restricted comparisons only, no expression
//! language and no code execution.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::template::{render_str, resolve_path_value};

/// `left op right`, e.g. `{{status}} == 'approved'` or `count >= 5`.
fn binary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(.+?)\s+(==|!=|>=|<=|>|<|contains|not_contains|starts_with|ends_with|in)\s+(.+)$",
        )
        .expect("binary condition regex is valid")
    })
}

/// `is_empty {{var}}` / `is_not_empty {{var}}`.
fn unary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(is_empty|is_not_empty)\s+(.+)$").expect("unary condition regex is valid")
    })
}

/// True when the expression matches one of the supported condition forms
/// (used by the compiler verifier to reject malformed rules).
pub fn is_valid_condition(expr: &str) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return false;
    }
    matches!(expr.to_lowercase().as_str(), "true" | "false" | "yes" | "no")
        || unary_re().is_match(expr)
        || binary_re().is_match(expr)
}

/// Evaluate a comparison condition against the template context. Unknown
/// operators and comparison failures yield `false`, never an error.
pub fn evaluate_condition(expr: &str, ctx: &Value) -> bool {
    let expr = expr.trim();

    match expr.to_lowercase().as_str() {
        "true" | "yes" | "1" => return true,
        "false" | "no" | "0" => return false,
        _ => {}
    }

    // Substitute {{templates}} before parsing the comparison.
    let rendered = render_str(expr, ctx);

    if let Some(caps) = unary_re().captures(&rendered) {
        let operand = coerce(caps[2].trim());
        return match &caps[1] {
            "is_empty" => is_empty(&operand),
            _ => !is_empty(&operand),
        };
    }

    if let Some(caps) = binary_re().captures(&rendered) {
        let left = coerce(caps[1].trim());
        let op = caps[2].trim().to_string();
        let right = coerce(caps[3].trim());
        return apply_op(&op, &left, &right);
    }

    // Anything expression-shaped that matched no supported form carries an
    // unknown operator: the condition is false, never an error.
    if rendered.split_whitespace().count() > 1 {
        return false;
    }

    // Single token: truthiness of the resolved value or the literal itself.
    match resolve_path_value(&rendered, ctx) {
        Some(value) => is_truthy(&value),
        None => is_truthy(&coerce(&rendered)),
    }
}

/// Coerce a token into a JSON value: quoted strings, booleans, null,
/// numbers, else a bare string.
fn coerce(token: &str) -> Value {
    let stripped = token.trim();

    if (stripped.starts_with('\'') && stripped.ends_with('\'') && stripped.len() >= 2)
        || (stripped.starts_with('"') && stripped.ends_with('"') && stripped.len() >= 2)
    {
        return Value::String(stripped[1..stripped.len() - 1].to_string());
    }

    match stripped.to_lowercase().as_str() {
        "true" | "yes" => return Value::Bool(true),
        "false" | "no" => return Value::Bool(false),
        "none" | "null" => return Value::Null,
        _ => {}
    }

    if stripped.contains('.') {
        if let Ok(f) = stripped.parse::<f64>() {
            if let Some(num) = serde_json::Number::from_f64(f) {
                return Value::Number(num);
            }
        }
    } else if let Ok(i) = stripped.parse::<i64>() {
        return Value::Number(i.into());
    }

    Value::String(stripped.to_string())
}

fn apply_op(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "==" => loose_eq(left, right),
        "!=" => !loose_eq(left, right),
        ">" | ">=" | "<" | "<=" => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => match op {
                ">" => a > b,
                ">=" => a >= b,
                "<" => a < b,
                _ => a <= b,
            },
            // Fall back to lexicographic comparison for strings.
            _ => match (left.as_str(), right.as_str()) {
                (Some(a), Some(b)) => match op {
                    ">" => a > b,
                    ">=" => a >= b,
                    "<" => a < b,
                    _ => a <= b,
                },
                _ => false,
            },
        },
        "contains" => match left {
            Value::String(s) => s.contains(&value_as_text(right)),
            Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
            _ => false,
        },
        "not_contains" => !apply_op("contains", left, right),
        "starts_with" => value_as_text(left).starts_with(&value_as_text(right)),
        "ends_with" => value_as_text(left).ends_with(&value_as_text(right)),
        "in" => match right {
            Value::String(s) => s.contains(&value_as_text(left)),
            Value::Array(items) => items.iter().any(|item| loose_eq(item, left)),
            _ => false,
        },
        _ => false,
    }
}

/// Equality that treats `5` and `5.0` as equal and otherwise compares
/// rendered text for mixed types.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
        return a == b;
    }
    match (left, right) {
        (Value::String(_), _) | (_, Value::String(_)) => {
            value_as_text(left) == value_as_text(right)
        }
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "status": "approved",
            "count": 5,
            "tags": ["red", "blue"],
            "name": "",
        })
    }

    #[test]
    fn equality_against_literals() {
        assert!(evaluate_condition("{{status}} == 'approved'", &ctx()));
        assert!(!evaluate_condition("{{status}} == 'rejected'", &ctx()));
        assert!(evaluate_condition("{{status}} != 'rejected'", &ctx()));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(evaluate_condition("{{count}} >= 5", &ctx()));
        assert!(evaluate_condition("{{count}} > 4.5", &ctx()));
        assert!(!evaluate_condition("{{count}} < 5", &ctx()));
    }

    #[test]
    fn string_operators() {
        assert!(evaluate_condition("{{status}} contains 'rov'", &ctx()));
        assert!(evaluate_condition("{{status}} starts_with 'app'", &ctx()));
        assert!(evaluate_condition("{{status}} ends_with 'ved'", &ctx()));
        assert!(evaluate_condition("{{status}} not_contains 'xyz'", &ctx()));
        assert!(evaluate_condition("'red' in 'red,green'", &ctx()));
    }

    #[test]
    fn unary_operators() {
        assert!(evaluate_condition("is_empty {{name}}", &ctx()));
        assert!(evaluate_condition("is_not_empty {{status}}", &ctx()));
        // Unresolved placeholders render back verbatim and are non-empty.
        assert!(evaluate_condition("is_not_empty {{missing}}", &ctx()));
    }

    #[test]
    fn boolean_literals() {
        assert!(evaluate_condition("true", &ctx()));
        assert!(evaluate_condition("yes", &ctx()));
        assert!(!evaluate_condition("false", &ctx()));
        assert!(!evaluate_condition("no", &ctx()));
    }

    #[test]
    fn unknown_operator_is_false_not_error() {
        assert!(!evaluate_condition("{{count}} %% 5", &ctx()));
    }

    #[test]
    fn validation_accepts_supported_forms_only() {
        assert!(is_valid_condition("{{status}} == 'approved'"));
        assert!(is_valid_condition("is_empty {{name}}"));
        assert!(is_valid_condition("true"));
        assert!(!is_valid_condition(""));
        assert!(!is_valid_condition("   "));
    }
}
