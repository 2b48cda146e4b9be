use std::sync::OnceLock;

use regex::RegexSet;
use serde_json::Value;

pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

/// Recursion cap: deeply nested payloads stop being rewritten past this.
const MAX_DEPTH: usize = 10;

fn sensitive_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RegexSet::new([
            r"(?i)password",
            r"(?i)token",
            r"(?i)api[_-]?key",
            r"(?i)secret",
            r"(?i)credential",
            r"(?i)authorization",
            r"(?i)auth",
            r"(?i)private[_-]?key",
            r"(?i)access[_-]?key",
            r"(?i)client[_-]?secret",
        ])
        .expect("sensitive patterns are valid regexes")
    })
}

/// True when a key name looks like it holds a secret.
pub fn is_sensitive_key(key: &str) -> bool {
    sensitive_patterns().is_match(key)
}

/// Recursively replace values of sensitive-looking keys with the
/// redaction placeholder. Applied to every event payload and failure
/// payload before persistence.
pub fn redact_value(value: Value) -> Value {
    redact_at_depth(value, MAX_DEPTH)
}

fn redact_at_depth(value: Value, depth: usize) -> Value {
    if depth == 0 {
        return value;
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| {
                    if is_sensitive_key(&key) {
                        (key, Value::String(REDACTION_PLACEHOLDER.to_string()))
                    } else {
                        (key, redact_at_depth(val, depth - 1))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| redact_at_depth(item, depth - 1))
                .collect(),
        ),
        primitive => primitive,
    }
}
