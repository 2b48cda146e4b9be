use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

/// Matches `{{path.to.var}}` or `{{path.to.var | default_value}}`.
fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([\w.]+)\s*(?:\|\s*(.+?))?\s*\}\}").expect("template regex is valid")
    })
}

/// Resolve a dotted path like `results.extraction.name` against a context
/// value. On sequences, `length`/`len`/`count` resolve to the cardinality
/// and numeric segments index into the sequence.
pub fn resolve_path_value(path: &str, ctx: &Value) -> Option<Value> {
    let mut current = ctx.clone();
    for part in path.split('.') {
        current = match current {
            Value::Object(mut map) => map.remove(part)?,
            Value::Array(items) => {
                if matches!(part, "length" | "len" | "count") {
                    Value::from(items.len())
                } else {
                    let idx: usize = part.parse().ok()?;
                    items.into_iter().nth(idx)?
                }
            }
            _ => return None,
        };
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}

/// Render a scalar for interpolation into a template string.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace all `{{path}}` placeholders in a string with values from the
/// context. Missing paths substitute the literal default (quote-stripped)
/// or leave the placeholder untouched.
pub fn render_str(template: &str, ctx: &Value) -> String {
    template_re()
        .replace_all(template, |caps: &Captures| {
            let path = &caps[1];
            match resolve_path_value(path, ctx) {
                Some(value) => value_to_string(&value),
                None => match caps.get(2) {
                    Some(default) => default
                        .as_str()
                        .trim()
                        .trim_matches(|c| c == '\'' || c == '"')
                        .to_string(),
                    None => caps[0].to_string(),
                },
            }
        })
        .into_owned()
}

/// Recursively render templates in every string of a JSON value.
pub fn render_value(value: &Value, ctx: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render_str(s, ctx)),
        Value::Object(map) => Value::Object(render_map(map, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, ctx)).collect()),
        other => other.clone(),
    }
}

/// Render templates in all string values of a params map.
pub fn render_map(params: &Map<String, Value>, ctx: &Value) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v, ctx)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "city": "Bergen",
            "count": 4,
            "items": ["a", "b", "c"],
            "results": {"extraction": {"name": "invoice-17"}},
        })
    }

    #[test]
    fn renders_simple_and_nested_paths() {
        assert_eq!(render_str("Go to {{city}}", &ctx()), "Go to Bergen");
        assert_eq!(
            render_str("found {{results.extraction.name}}", &ctx()),
            "found invoice-17"
        );
    }

    #[test]
    fn sequence_length_and_indexing() {
        assert_eq!(render_str("{{items.length}}", &ctx()), "3");
        assert_eq!(render_str("{{items.len}}", &ctx()), "3");
        assert_eq!(render_str("{{items.1}}", &ctx()), "b");
        // Out-of-range index falls back to the untouched placeholder.
        assert_eq!(render_str("{{items.9}}", &ctx()), "{{items.9}}");
    }

    #[test]
    fn missing_path_uses_default_or_stays() {
        assert_eq!(render_str("{{missing | 'n/a'}}", &ctx()), "n/a");
        assert_eq!(render_str("{{missing | 0}}", &ctx()), "0");
        assert_eq!(render_str("{{missing}}", &ctx()), "{{missing}}");
    }

    #[test]
    fn non_string_values_are_stringified() {
        assert_eq!(render_str("n={{count}}", &ctx()), "n=4");
    }

    #[test]
    fn renders_recursively_through_params() {
        let params = json!({
            "url": "https://example.test/{{city}}",
            "nested": {"label": "{{results.extraction.name}}"},
            "list": ["{{count}}", 7],
        });
        let rendered = render_value(&params, &ctx());
        assert_eq!(rendered["url"], json!("https://example.test/Bergen"));
        assert_eq!(rendered["nested"]["label"], json!("invoice-17"));
        assert_eq!(rendered["list"], json!(["4", 7]));
    }
}
