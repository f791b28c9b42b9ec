//! `{{ path }}` variable references inside parameter templates.
//!
//! Paths are dotted names. Resolution picks the longest prefix that names a
//! bound variable and descends into the JSON value with the rest, so
//! `steps.gather.output.items.0` resolves against the `steps.gather.output`
//! binding.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated reference in '{0}'")]
    Unterminated(String),

    #[error("empty reference in '{0}'")]
    Empty(String),

    #[error("unbound reference '{0}'")]
    Unbound(String),
}

/// Parse the references of a template string, in order of appearance.
pub fn references(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut refs = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(template.to_string()))?;
        let path = after[..end].trim();
        if path.is_empty() {
            return Err(TemplateError::Empty(template.to_string()));
        }
        refs.push(path.to_string());
        rest = &after[end + 2..];
    }
    Ok(refs)
}

/// Collect every string inside a JSON value, with its JSON path suffix.
pub fn strings(value: &Value) -> Vec<(String, &str)> {
    let mut out = Vec::new();
    let mut stack: Vec<(String, &Value)> = vec![(String::new(), value)];
    while let Some((path, v)) = stack.pop() {
        match v {
            Value::String(s) => out.push((path, s.as_str())),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate().rev() {
                    stack.push((format!("{path}[{i}]"), item));
                }
            }
            Value::Object(map) => {
                for (k, item) in map.iter().rev() {
                    stack.push((format!("{path}.{k}"), item));
                }
            }
            _ => {}
        }
    }
    out
}

/// Resolve one reference path against the variable bindings.
pub fn resolve(path: &str, vars: &BTreeMap<String, Value>) -> Result<Value, TemplateError> {
    let segments: Vec<&str> = path.split('.').collect();
    for split in (1..=segments.len()).rev() {
        let key = segments[..split].join(".");
        let Some(bound) = vars.get(&key) else {
            continue;
        };
        let mut current = bound;
        for segment in &segments[split..] {
            current = match current {
                Value::Object(map) => map.get(*segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| TemplateError::Unbound(path.to_string()))?;
        }
        return Ok(current.clone());
    }
    Err(TemplateError::Unbound(path.to_string()))
}

/// Render a string template.
///
/// A template that is exactly one reference evaluates to the referenced value
/// with its JSON type intact. Anything else is text interpolation.
pub fn render_str(template: &str, vars: &BTreeMap<String, Value>) -> Result<Value, TemplateError> {
    let trimmed = template.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
    {
        if !inner.contains("{{") && !inner.contains("}}") {
            let path = inner.trim();
            if path.is_empty() {
                return Err(TemplateError::Empty(template.to_string()));
            }
            return resolve(path, vars);
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(template.to_string()))?;
        let path = after[..end].trim();
        if path.is_empty() {
            return Err(TemplateError::Empty(template.to_string()));
        }
        match resolve(path, vars)? {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Render every string inside a parameter template.
pub fn render_value(template: &Value, vars: &BTreeMap<String, Value>) -> Result<Value, TemplateError> {
    Ok(match template {
        Value::String(s) => render_str(s, vars)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, vars))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                rendered.insert(k.clone(), render_value(v, vars)?);
            }
            Value::Object(rendered)
        }
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> BTreeMap<String, Value> {
        let mut vars = BTreeMap::new();
        vars.insert("inputs.topic".to_string(), json!("rust"));
        vars.insert(
            "steps.gather.output".to_string(),
            json!({ "items": [ { "title": "a" }, { "title": "b" } ], "count": 2 }),
        );
        vars
    }

    #[test]
    fn test_references_in_order() {
        let refs = references("{{ inputs.topic }} and {{steps.a.output}}").unwrap();
        assert_eq!(refs, vec!["inputs.topic", "steps.a.output"]);
        assert!(references("plain").unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_reference() {
        assert!(matches!(
            references("{{ inputs.topic"),
            Err(TemplateError::Unterminated(_))
        ));
    }

    #[test]
    fn test_whole_reference_preserves_type() {
        let rendered = render_str("{{steps.gather.output.items}}", &vars()).unwrap();
        assert!(rendered.is_array());
        let count = render_str("{{ steps.gather.output.count }}", &vars()).unwrap();
        assert_eq!(count, json!(2));
    }

    #[test]
    fn test_interpolation_and_array_index() {
        let rendered = render_str(
            "topic={{inputs.topic}} first={{steps.gather.output.items.0.title}}",
            &vars(),
        )
        .unwrap();
        assert_eq!(rendered, json!("topic=rust first=a"));
    }

    #[test]
    fn test_render_nested_params() {
        let params = json!({ "q": "{{inputs.topic}}", "n": 3, "list": ["{{steps.gather.output.count}}"] });
        let rendered = render_value(&params, &vars()).unwrap();
        assert_eq!(rendered, json!({ "q": "rust", "n": 3, "list": [2] }));
    }

    #[test]
    fn test_unbound_reference() {
        assert_eq!(
            render_str("{{inputs.missing}}", &vars()),
            Err(TemplateError::Unbound("inputs.missing".to_string()))
        );
        assert!(resolve("steps.gather.output.nope", &vars()).is_err());
    }
}
