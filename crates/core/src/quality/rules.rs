//! Deterministic in-process scoring rules.

use pe_protocol::quality_models::Rule;
use serde_json::Value;

fn text_of(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Score one output against one rule. Returns the score in [0, 1] and the
/// issues found.
pub fn score_rule(rule: &Rule, output: &Value) -> (f64, Vec<String>) {
    match rule {
        Rule::NonEmpty => {
            let empty = match output {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                _ => false,
            };
            if empty {
                (0.0, vec!["output is empty".to_string()])
            } else {
                (1.0, vec![])
            }
        }

        Rule::RequiredKeys { keys } => {
            if keys.is_empty() {
                return (1.0, vec![]);
            }
            let Some(map) = output.as_object() else {
                return (0.0, vec!["output is not an object".to_string()]);
            };
            let missing: Vec<String> = keys
                .iter()
                .filter(|k| map.get(k.as_str()).map_or(true, Value::is_null))
                .map(|k| format!("missing key '{k}'"))
                .collect();
            let present = keys.len() - missing.len();
            (present as f64 / keys.len() as f64, missing)
        }

        Rule::MinLength { min_chars } => {
            if *min_chars == 0 {
                return (1.0, vec![]);
            }
            let len = text_of(output).chars().count();
            if len >= *min_chars {
                (1.0, vec![])
            } else {
                (
                    len as f64 / *min_chars as f64,
                    vec![format!(
                        "output has {len} characters, expected at least {min_chars}"
                    )],
                )
            }
        }

        Rule::Contains { text } => {
            if text_of(output).contains(text.as_str()) {
                (1.0, vec![])
            } else {
                (0.0, vec![format!("output does not mention '{text}'")])
            }
        }

        Rule::ScoreField { field } => match output.get(field).and_then(Value::as_f64) {
            Some(score) => (score.clamp(0.0, 1.0), vec![]),
            None => (0.0, vec![format!("field '{field}' is missing or not a number")]),
        },
    }
}
