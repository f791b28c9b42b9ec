//! Schema conformance for definition documents.
//!
//! The document arrives already deserialized (from YAML, JSON or anything
//! else serde can read into a [`serde_json::Value`]). Shape problems are
//! reported with their location so an author sees all of them at once.

use super::{IssueKind, ValidationReport};
use pe_protocol::definition_models::ProcessDefinition;
use serde_json::{Map, Value};

/// Check a document's shape and decode it into a [`ProcessDefinition`].
///
/// # Errors
///
/// Returns a [`ValidationReport`] listing every schema violation. Structural
/// checks (cycles, references) are left to the validator.
pub fn parse_document(document: &Value) -> Result<ProcessDefinition, ValidationReport> {
    let mut report = ValidationReport::default();
    check_definition(document, "", &mut report);
    if !report.is_empty() {
        return Err(report);
    }

    serde_json::from_value(document.clone()).map_err(|e| {
        let mut report = ValidationReport::default();
        report.push("", IssueKind::Schema, format!("undecodable definition: {e}"));
        report
    })
}

/// Parse a YAML or JSON string (JSON is valid YAML) into a definition.
pub fn parse_str(content: &str) -> Result<ProcessDefinition, ValidationReport> {
    let document: Value = serde_yaml::from_str(content).map_err(|e| {
        let mut report = ValidationReport::default();
        report.push("", IssueKind::Schema, format!("unreadable document: {e}"));
        report
    })?;
    parse_document(&document)
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn check_definition(value: &Value, prefix: &str, report: &mut ValidationReport) {
    let Some(obj) = value.as_object() else {
        report.push(prefix, IssueKind::Schema, "definition must be a mapping");
        return;
    };

    require_string(obj, "name", prefix, report);
    optional_string_list(obj, "inputs", prefix, report);
    optional_bool(obj, "trivial", prefix, report);

    if let Some(outputs) = obj.get("outputs") {
        match outputs.as_object() {
            Some(map) => {
                for (name, v) in map {
                    if !v.is_string() {
                        report.push(
                            join(prefix, &format!("outputs.{name}")),
                            IssueKind::Schema,
                            "output template must be a string",
                        );
                    }
                }
            }
            None => report.push(join(prefix, "outputs"), IssueKind::Schema, "must be a mapping"),
        }
    }

    if let Some(planning) = obj.get("planning") {
        let path = join(prefix, "planning");
        match planning.as_object() {
            Some(p) => {
                require_string(p, "goal", &path, report);
                require_string(p, "proposer_capability", &path, report);
                optional_uint(p, "max_depth", &path, report);
                optional_uint(p, "min_proposals", &path, report);
            }
            None => report.push(path, IssueKind::Schema, "must be a mapping"),
        }
    }

    if let Some(budget) = obj.get("budget") {
        let path = join(prefix, "budget");
        match budget.as_object() {
            Some(b) => {
                for field in ["max_iterations", "max_external_calls", "max_wall_clock_ms"] {
                    require_uint(b, field, &path, report);
                }
                match b.get("max_spend") {
                    Some(v) if v.is_number() => {}
                    Some(_) => report.push(join(&path, "max_spend"), IssueKind::Schema, "must be a number"),
                    None => report.push(
                        join(&path, "max_spend"),
                        IssueKind::Schema,
                        "missing required field",
                    ),
                }
            }
            None => report.push(path, IssueKind::Schema, "must be a mapping"),
        }
    }

    match obj.get("steps") {
        None => {
            // Planning may synthesize the whole step list.
            if !obj.contains_key("planning") {
                report.push(join(prefix, "steps"), IssueKind::Schema, "missing required field");
            }
        }
        Some(Value::Array(steps)) => {
            for (i, step) in steps.iter().enumerate() {
                check_step(step, &join(prefix, &format!("steps[{i}]")), report);
            }
        }
        Some(_) => report.push(join(prefix, "steps"), IssueKind::Schema, "must be a list"),
    }
}

fn check_step(value: &Value, path: &str, report: &mut ValidationReport) {
    let Some(obj) = value.as_object() else {
        report.push(path, IssueKind::Schema, "step must be a mapping");
        return;
    };

    require_string(obj, "id", path, report);
    optional_string(obj, "capability", path, report);
    optional_string_list(obj, "depends_on", path, report);
    optional_string_list(obj, "outputs", path, report);
    optional_uint(obj, "timeout_ms", path, report);

    let kinds: Vec<&str> = ["action", "subprocess", "loop"]
        .into_iter()
        .filter(|k| obj.get(*k).is_some_and(|v| !v.is_null()))
        .collect();
    match kinds.len() {
        0 => report.push(
            path,
            IssueKind::Schema,
            "step must define one of action, subprocess or loop",
        ),
        1 => {}
        _ => report.push(
            path,
            IssueKind::Schema,
            format!("step defines more than one of {}", kinds.join(", ")),
        ),
    }

    optional_string(obj, "action", path, report);

    if let Some(sub) = obj.get("subprocess") {
        check_definition(sub, &join(path, "subprocess"), report);
    }

    if let Some(lp) = obj.get("loop") {
        let loop_path = join(path, "loop");
        match lp.as_object() {
            Some(l) => {
                require_string(l, "over", &loop_path, report);
                match l.get("subprocess") {
                    Some(body) => check_definition(body, &join(&loop_path, "subprocess"), report),
                    None => report.push(
                        join(&loop_path, "subprocess"),
                        IssueKind::Schema,
                        "missing required field",
                    ),
                }
            }
            None => report.push(loop_path, IssueKind::Schema, "must be a mapping"),
        }
    }

    if let Some(retry) = obj.get("retry") {
        let retry_path = join(path, "retry");
        match retry.as_object() {
            Some(r) => {
                optional_uint(r, "max_attempts", &retry_path, report);
                optional_uint(r, "initial_backoff_ms", &retry_path, report);
                optional_uint(r, "max_backoff_ms", &retry_path, report);
                optional_string_list(r, "retry_on", &retry_path, report);
            }
            None => report.push(retry_path, IssueKind::Schema, "must be a mapping"),
        }
    }

    if let Some(quality) = obj.get("quality") {
        check_quality(quality, &join(path, "quality"), report);
    }
}

fn check_quality(value: &Value, path: &str, report: &mut ValidationReport) {
    let Some(obj) = value.as_object() else {
        report.push(path, IssueKind::Schema, "must be a mapping");
        return;
    };
    optional_uint(obj, "max_attempts", path, report);
    for field in ["pass_threshold", "marginal_threshold"] {
        if obj.get(field).is_some_and(|v| !v.is_number()) {
            report.push(join(path, field), IssueKind::Schema, "must be a number");
        }
    }

    let Some(criteria) = obj.get("criteria") else {
        report.push(join(path, "criteria"), IssueKind::Schema, "missing required field");
        return;
    };
    let Some(criteria) = criteria.as_array() else {
        report.push(join(path, "criteria"), IssueKind::Schema, "must be a list");
        return;
    };
    for (i, criterion) in criteria.iter().enumerate() {
        let cpath = join(path, &format!("criteria[{i}]"));
        let Some(c) = criterion.as_object() else {
            report.push(cpath, IssueKind::Schema, "criterion must be a mapping");
            continue;
        };
        require_string(c, "name", &cpath, report);
        optional_string(c, "description", &cpath, report);
        if c.get("weight").is_some_and(|v| !v.is_number()) {
            report.push(join(&cpath, "weight"), IssueKind::Schema, "must be a number");
        }
        match c.get("evaluator").and_then(Value::as_object) {
            Some(e) if e.contains_key("rule") || e.contains_key("capability") => {}
            Some(_) => report.push(
                join(&cpath, "evaluator"),
                IssueKind::Schema,
                "evaluator must be a rule or a capability",
            ),
            None => report.push(join(&cpath, "evaluator"), IssueKind::Schema, "missing required field"),
        }
    }
}

fn require_string(obj: &Map<String, Value>, field: &str, prefix: &str, report: &mut ValidationReport) {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(Value::String(_)) => report.push(join(prefix, field), IssueKind::Schema, "must not be empty"),
        Some(_) => report.push(join(prefix, field), IssueKind::Schema, "must be a string"),
        None => report.push(join(prefix, field), IssueKind::Schema, "missing required field"),
    }
}

fn optional_string(obj: &Map<String, Value>, field: &str, prefix: &str, report: &mut ValidationReport) {
    if obj.get(field).is_some_and(|v| !v.is_string() && !v.is_null()) {
        report.push(join(prefix, field), IssueKind::Schema, "must be a string");
    }
}

fn optional_bool(obj: &Map<String, Value>, field: &str, prefix: &str, report: &mut ValidationReport) {
    if obj.get(field).is_some_and(|v| !v.is_boolean()) {
        report.push(join(prefix, field), IssueKind::Schema, "must be a boolean");
    }
}

fn require_uint(obj: &Map<String, Value>, field: &str, prefix: &str, report: &mut ValidationReport) {
    match obj.get(field) {
        Some(v) if v.is_u64() => {}
        Some(_) => report.push(
            join(prefix, field),
            IssueKind::Schema,
            "must be a non-negative integer",
        ),
        None => report.push(join(prefix, field), IssueKind::Schema, "missing required field"),
    }
}

fn optional_uint(obj: &Map<String, Value>, field: &str, prefix: &str, report: &mut ValidationReport) {
    if obj.get(field).is_some_and(|v| !v.is_u64()) {
        report.push(
            join(prefix, field),
            IssueKind::Schema,
            "must be a non-negative integer",
        );
    }
}

fn optional_string_list(obj: &Map<String, Value>, field: &str, prefix: &str, report: &mut ValidationReport) {
    match obj.get(field) {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                if !item.is_string() {
                    report.push(
                        join(prefix, &format!("{field}[{i}]")),
                        IssueKind::Schema,
                        "must be a string",
                    );
                }
            }
        }
        Some(_) => report.push(join(prefix, field), IssueKind::Schema, "must be a list of strings"),
    }
}
