//! Structural validation of process definitions.
//!
//! Checks, in order, for every scope (the root definition and each nested
//! subprocess or loop body):
//! 1. step shape and unique ids
//! 2. every `depends_on` target exists in the same scope
//! 3. the dependency graph is acyclic (DFS with a visiting set; the exact
//!    cycle path is reported)
//! 4. every `{{...}}` reference resolves to a declared input, an output of a
//!    step the referencing step transitively depends on, or a loop variable
//! 5. retry, quality, planning and budget settings are within bounds

use super::template;
use super::{IssueKind, ValidationReport};
use pe_protocol::definition_models::{ProcessDefinition, StepDefinition, StepKind};
use pe_protocol::quality_models::{EvaluatorRef, QualityPolicy, Rule};
use std::collections::{HashMap, HashSet};

/// Validate a definition, reporting every issue found.
pub fn validate(definition: &ProcessDefinition) -> Result<(), ValidationReport> {
    let mut report = ValidationReport::default();
    check_scope(definition, "", &[], false, &mut report);
    report.into_result()
}

/// Names an enclosing scope makes visible to a nested one.
struct Visible {
    inputs: HashSet<String>,
    /// Steps the enclosing step depends on, with their declared outputs.
    steps: HashMap<String, HashSet<String>>,
}

struct RefContext<'a> {
    inputs: &'a [String],
    local_ids: &'a HashMap<&'a str, usize>,
    local_outputs: &'a HashMap<&'a str, HashSet<String>>,
    allowed: &'a HashSet<usize>,
    ancestors: &'a [Visible],
    in_loop: bool,
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn check_scope(
    def: &ProcessDefinition,
    prefix: &str,
    ancestors: &[Visible],
    in_loop: bool,
    report: &mut ValidationReport,
) {
    if def.steps.is_empty() && def.planning.is_none() {
        report.push(join(prefix, "steps"), IssueKind::Schema, "definition has no steps");
    }

    let mut ids: HashMap<&str, usize> = HashMap::new();
    for (i, step) in def.steps.iter().enumerate() {
        let path = join(prefix, &format!("steps[{i}]"));
        check_step_shape(step, &path, report);
        if ids.contains_key(step.id.as_str()) {
            report.push(
                join(&path, "id"),
                IssueKind::DuplicateStep,
                format!("duplicate step id '{}'", step.id),
            );
        } else {
            ids.insert(step.id.as_str(), i);
        }
    }

    for (i, step) in def.steps.iter().enumerate() {
        for (j, dep) in step.depends_on.iter().enumerate() {
            if !ids.contains_key(dep.as_str()) {
                report.push(
                    join(prefix, &format!("steps[{i}].depends_on[{j}]")),
                    IssueKind::UnknownDependency,
                    format!("unknown dependency '{dep}'"),
                );
            }
        }
    }

    for cycle in find_cycles(def, &ids) {
        report.push(
            join(prefix, "steps"),
            IssueKind::Cycle(cycle.clone()),
            format!("dependency cycle: {}", cycle.join(" -> ")),
        );
    }

    let outputs: HashMap<&str, HashSet<String>> = def
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.outputs.iter().cloned().collect()))
        .collect();

    for (i, step) in def.steps.iter().enumerate() {
        let path = join(prefix, &format!("steps[{i}]"));
        let allowed = transitive_dependencies(def, &ids, i);
        let ctx = RefContext {
            inputs: &def.inputs,
            local_ids: &ids,
            local_outputs: &outputs,
            allowed: &allowed,
            ancestors,
            in_loop,
        };

        for (suffix, text) in template::strings(&step.params) {
            check_template(text, &format!("{path}.params{suffix}"), &ctx, report);
        }

        if let Some(retry) = &step.retry {
            let rpath = join(&path, "retry");
            if retry.max_attempts == 0 {
                report.push(join(&rpath, "max_attempts"), IssueKind::InvalidPolicy, "must be at least 1");
            }
            if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
                report.push(join(&rpath, "multiplier"), IssueKind::InvalidPolicy, "must be at least 1.0");
            }
        }
        if step.timeout_ms == Some(0) {
            report.push(join(&path, "timeout_ms"), IssueKind::InvalidPolicy, "must be positive");
        }

        match step.kind() {
            StepKind::Action { .. } => {
                if let Some(quality) = &step.quality {
                    check_quality(quality, &join(&path, "quality"), report);
                }
            }
            StepKind::Subprocess(nested) => {
                if step.quality.is_some() {
                    report.push(
                        join(&path, "quality"),
                        IssueKind::InvalidPolicy,
                        "quality policies apply to action steps only",
                    );
                }
                let visible = visible_for(def, &allowed, &outputs);
                let nested_path = join(&path, "subprocess");
                check_child_inputs(step, nested, &nested_path, def, ancestors, report);
                let mut chain: Vec<Visible> = Vec::with_capacity(ancestors.len() + 1);
                chain.extend(ancestors.iter().map(clone_visible));
                chain.push(visible);
                check_scope(nested, &nested_path, &chain, in_loop, report);
            }
            StepKind::Loop(spec) => {
                if step.quality.is_some() {
                    report.push(
                        join(&path, "quality"),
                        IssueKind::InvalidPolicy,
                        "quality policies apply to action steps only",
                    );
                }
                let over_path = join(&path, "loop.over");
                check_template(&spec.over, &over_path, &ctx, report);
                if template::references(&spec.over).map(|r| r.is_empty()).unwrap_or(false) {
                    report.push(over_path, IssueKind::UnresolvedReference, "loop must iterate over a reference");
                }
                let visible = visible_for(def, &allowed, &outputs);
                let nested_path = join(&path, "loop.subprocess");
                check_child_inputs(step, &spec.body, &nested_path, def, ancestors, report);
                let mut chain: Vec<Visible> = Vec::with_capacity(ancestors.len() + 1);
                chain.extend(ancestors.iter().map(clone_visible));
                chain.push(visible);
                check_scope(&spec.body, &nested_path, &chain, true, report);
            }
        }
    }

    // Definition outputs may read any step of their own scope.
    let every_step: HashSet<usize> = (0..def.steps.len()).collect();
    let ctx = RefContext {
        inputs: &def.inputs,
        local_ids: &ids,
        local_outputs: &outputs,
        allowed: &every_step,
        ancestors,
        in_loop,
    };
    for (name, text) in &def.outputs {
        check_template(text, &join(prefix, &format!("outputs.{name}")), &ctx, report);
    }

    if let Some(planning) = &def.planning {
        let ppath = join(prefix, "planning");
        if planning.goal.trim().is_empty() {
            report.push(join(&ppath, "goal"), IssueKind::InvalidPolicy, "must not be empty");
        }
        if planning.proposer_capability.trim().is_empty() {
            report.push(
                join(&ppath, "proposer_capability"),
                IssueKind::InvalidPolicy,
                "must not be empty",
            );
        }
        if planning.min_proposals == 0 {
            report.push(join(&ppath, "min_proposals"), IssueKind::InvalidPolicy, "must be at least 1");
        }
    }

    if let Some(budget) = &def.budget {
        if !budget.max_spend.is_finite() || budget.max_spend < 0.0 {
            report.push(
                join(prefix, "budget.max_spend"),
                IssueKind::InvalidPolicy,
                "must be a non-negative number",
            );
        }
    }
}

fn clone_visible(v: &Visible) -> Visible {
    Visible {
        inputs: v.inputs.clone(),
        steps: v.steps.clone(),
    }
}

fn visible_for(
    def: &ProcessDefinition,
    allowed: &HashSet<usize>,
    outputs: &HashMap<&str, HashSet<String>>,
) -> Visible {
    Visible {
        inputs: def.inputs.iter().cloned().collect(),
        steps: allowed
            .iter()
            .map(|&i| {
                let id = def.steps[i].id.as_str();
                (id.to_string(), outputs.get(id).cloned().unwrap_or_default())
            })
            .collect(),
    }
}

/// Inputs a nested definition declares must be bound by the parent step's
/// params or inherited from an enclosing scope.
fn check_child_inputs(
    step: &StepDefinition,
    nested: &ProcessDefinition,
    nested_path: &str,
    def: &ProcessDefinition,
    ancestors: &[Visible],
    report: &mut ValidationReport,
) {
    for (k, input) in nested.inputs.iter().enumerate() {
        let bound_by_params = step
            .params
            .as_object()
            .is_some_and(|p| p.contains_key(input));
        let inherited = def.inputs.contains(input) || ancestors.iter().any(|a| a.inputs.contains(input));
        if !bound_by_params && !inherited {
            report.push(
                join(nested_path, &format!("inputs[{k}]")),
                IssueKind::UnresolvedReference,
                format!("input '{input}' is not bound by step '{}'", step.id),
            );
        }
    }
}

fn check_step_shape(step: &StepDefinition, path: &str, report: &mut ValidationReport) {
    if step.id.trim().is_empty() {
        report.push(join(path, "id"), IssueKind::Schema, "must not be empty");
    } else if step.id.contains('.') || step.id.contains("{{") {
        report.push(join(path, "id"), IssueKind::Schema, "must not contain '.' or '{{'");
    }

    let defined = [
        step.action.is_some(),
        step.subprocess.is_some(),
        step.loop_spec.is_some(),
    ]
    .into_iter()
    .filter(|d| *d)
    .count();
    if defined != 1 {
        report.push(
            path,
            IssueKind::Schema,
            "step must define exactly one of action, subprocess or loop",
        );
    } else if step.action.as_deref().is_some_and(|a| a.trim().is_empty()) {
        report.push(join(path, "action"), IssueKind::Schema, "must not be empty");
    }
}

fn check_quality(policy: &QualityPolicy, path: &str, report: &mut ValidationReport) {
    if policy.criteria.is_empty() {
        report.push(join(path, "criteria"), IssueKind::InvalidPolicy, "at least one criterion is required");
    }
    if !(0.0..=1.0).contains(&policy.pass_threshold) {
        report.push(join(path, "pass_threshold"), IssueKind::InvalidPolicy, "must be within [0, 1]");
    }
    if !(0.0..=1.0).contains(&policy.marginal_threshold) || policy.marginal_threshold > policy.pass_threshold {
        report.push(
            join(path, "marginal_threshold"),
            IssueKind::InvalidPolicy,
            "must be within [0, pass_threshold]",
        );
    }
    if policy.max_attempts == 0 {
        report.push(join(path, "max_attempts"), IssueKind::InvalidPolicy, "must be at least 1");
    }

    let mut names = HashSet::new();
    for (i, criterion) in policy.criteria.iter().enumerate() {
        let cpath = join(path, &format!("criteria[{i}]"));
        if !names.insert(criterion.name.as_str()) {
            report.push(
                join(&cpath, "name"),
                IssueKind::InvalidPolicy,
                format!("duplicate criterion '{}'", criterion.name),
            );
        }
        if !criterion.weight.is_finite() || criterion.weight <= 0.0 {
            report.push(join(&cpath, "weight"), IssueKind::InvalidPolicy, "must be positive");
        }
        match &criterion.evaluator {
            EvaluatorRef::Rule(Rule::RequiredKeys { keys }) if keys.is_empty() => report.push(
                join(&cpath, "evaluator"),
                IssueKind::InvalidPolicy,
                "required_keys needs at least one key",
            ),
            EvaluatorRef::Rule(Rule::MinLength { min_chars: 0 }) => report.push(
                join(&cpath, "evaluator"),
                IssueKind::InvalidPolicy,
                "min_length needs a positive min_chars",
            ),
            EvaluatorRef::Capability(cap) if cap.trim().is_empty() => report.push(
                join(&cpath, "evaluator"),
                IssueKind::InvalidPolicy,
                "capability must not be empty",
            ),
            _ => {}
        }
    }
}

fn check_template(text: &str, path: &str, ctx: &RefContext<'_>, report: &mut ValidationReport) {
    let refs = match template::references(text) {
        Ok(refs) => refs,
        Err(e) => {
            report.push(path, IssueKind::UnresolvedReference, e.to_string());
            return;
        }
    };
    for reference in refs {
        if let Err(reason) = check_reference(&reference, ctx) {
            report.push(
                path,
                IssueKind::UnresolvedReference,
                format!("unresolved reference '{{{{{reference}}}}}': {reason}"),
            );
        }
    }
}

fn check_reference(reference: &str, ctx: &RefContext<'_>) -> Result<(), String> {
    let segments: Vec<&str> = reference.split('.').collect();
    match segments.as_slice() {
        ["inputs", name, ..] => {
            let declared = ctx.inputs.iter().any(|i| i == name)
                || ctx.ancestors.iter().any(|a| a.inputs.contains(*name));
            if declared {
                Ok(())
            } else {
                Err(format!("unknown input '{name}'"))
            }
        }
        ["steps", id, field, ..] => {
            if let Some(&index) = ctx.local_ids.get(id) {
                if !ctx.allowed.contains(&index) {
                    return Err(format!("step '{id}' is not a dependency"));
                }
                return check_field(id, field, ctx.local_outputs.get(id));
            }
            for scope in ctx.ancestors.iter().rev() {
                if let Some(declared) = scope.steps.get(*id) {
                    return check_field(id, field, Some(declared));
                }
            }
            Err(format!("unknown step '{id}'"))
        }
        ["steps", ..] => Err("expected steps.<id>.<output>".to_string()),
        ["loop", "item", ..] | ["loop", "index"] => {
            if ctx.in_loop {
                Ok(())
            } else {
                Err("loop variables are only bound inside a loop body".to_string())
            }
        }
        _ => Err("unknown variable".to_string()),
    }
}

fn check_field(id: &str, field: &str, declared: Option<&HashSet<String>>) -> Result<(), String> {
    if field == "output" || declared.is_some_and(|d| d.contains(field)) {
        Ok(())
    } else {
        Err(format!("step '{id}' declares no output '{field}'"))
    }
}

/// Every step reachable from step `index` through `depends_on`.
fn transitive_dependencies(
    def: &ProcessDefinition,
    ids: &HashMap<&str, usize>,
    index: usize,
) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = Vec::new();
    stack.extend(
        def.steps[index]
            .depends_on
            .iter()
            .filter_map(|d| ids.get(d.as_str()).copied()),
    );
    while let Some(next) = stack.pop() {
        if seen.insert(next) {
            stack.extend(
                def.steps[next]
                    .depends_on
                    .iter()
                    .filter_map(|d| ids.get(d.as_str()).copied()),
            );
        }
    }
    seen
}

/// Depth-first search with a visiting set. Each back edge yields one cycle,
/// written from the step where it was entered back to that same step.
fn find_cycles(def: &ProcessDefinition, ids: &HashMap<&str, usize>) -> Vec<Vec<String>> {
    const UNVISITED: u8 = 0;
    const VISITING: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![UNVISITED; def.steps.len()];
    let mut cycles = Vec::new();

    for start in 0..def.steps.len() {
        if state[start] != UNVISITED {
            continue;
        }
        state[start] = VISITING;
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let deps = &def.steps[node].depends_on;
            if top.1 >= deps.len() {
                state[node] = DONE;
                stack.pop();
                continue;
            }
            let dep = &deps[top.1];
            top.1 += 1;

            let Some(&target) = ids.get(dep.as_str()) else {
                continue;
            };
            match state[target] {
                UNVISITED => {
                    state[target] = VISITING;
                    stack.push((target, 0));
                }
                VISITING => {
                    let from = stack.iter().position(|(n, _)| *n == target).unwrap_or(0);
                    let mut path: Vec<String> = stack[from..]
                        .iter()
                        .map(|(n, _)| def.steps[*n].id.clone())
                        .collect();
                    path.push(def.steps[target].id.clone());
                    cycles.push(path);
                }
                _ => {}
            }
        }
    }
    cycles
}
