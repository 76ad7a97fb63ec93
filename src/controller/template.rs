//! # Expression Templates
//!
//! `${{ .path.to.field }}` placeholders resolved against JSON documents.
//! Used by webhook test expressions and deny messages, and by health check
//! URLs that reference module outputs.

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Failed to compile regex: {0}")]
    Regex(#[from] regex::Error),
}

fn placeholder_regex() -> Result<Regex, TemplateError> {
    Ok(Regex::new(r"\$\{\{\s*\.([A-Za-z0-9_.\-]*)\s*\}\}")?)
}

/// Value at a dot-separated path; numeric segments index arrays
#[must_use]
pub fn resolve<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(data, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every placeholder with its value; unresolved placeholders become empty
pub fn render(template: &str, data: &Value) -> Result<String, TemplateError> {
    let regex = placeholder_regex()?;
    Ok(regex
        .replace_all(template, |captures: &regex::Captures<'_>| {
            resolve(data, &captures[1]).map(display).unwrap_or_default()
        })
        .into_owned())
}

/// Evaluate an expression
///
/// An expression that is a single placeholder yields the referenced value with
/// its JSON type intact, so `${{ .passed }}` can be the boolean `true`. Anything
/// else renders to a string.
pub fn evaluate(expression: &str, data: &Value) -> Result<Option<Value>, TemplateError> {
    let regex = placeholder_regex()?;
    let trimmed = expression.trim();
    if let Some(captures) = regex.captures(trimmed) {
        if captures.get(0).is_some_and(|m| m.as_str() == trimmed) {
            return Ok(resolve(data, &captures[1]).cloned());
        }
    }
    Ok(Some(Value::String(render(trimmed, data)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_nested_paths() {
        let data = json!({"result": {"checks": [{"ok": true}]}});
        assert_eq!(resolve(&data, "result.checks.0.ok"), Some(&json!(true)));
        assert_eq!(resolve(&data, "result.missing"), None);
        assert_eq!(resolve(&data, ""), Some(&data));
    }

    #[test]
    fn test_render_mixed_text() {
        let data = json!({"endpoint": "api.example.com", "port": 8443});
        assert_eq!(
            render("https://${{ .endpoint }}:${{.port}}/health", &data).unwrap(),
            "https://api.example.com:8443/health"
        );
        assert_eq!(render("x${{ .nope }}y", &data).unwrap(), "xy");
    }

    #[test]
    fn test_evaluate_keeps_json_type_of_single_placeholder() {
        let data = json!({"passed": true, "message": "ok"});
        assert_eq!(evaluate("${{ .passed }}", &data).unwrap(), Some(json!(true)));
        assert_eq!(evaluate("${{ .absent }}", &data).unwrap(), None);
        assert_eq!(
            evaluate("status: ${{ .message }}", &data).unwrap(),
            Some(json!("status: ok"))
        );
    }
}
