//! Execution graph compiler.
//!
//! Turns a validated definition into a dependency graph with a topological
//! order. Ties between steps that become eligible together are broken by
//! declaration order, so the order is deterministic.

use pe_protocol::definition_models::ProcessDefinition;
use pe_protocol::instance_models::StepStatus;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// A compiled dependency graph over one scope's steps.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionGraph {
    /// Step ids in declaration order.
    steps: Vec<String>,
    index: HashMap<String, usize>,
    /// `deps[i]`: indices step `i` depends on.
    deps: Vec<Vec<usize>>,
    /// `dependents[i]`: indices depending on step `i`.
    dependents: Vec<Vec<usize>>,
    /// Topological order as indices.
    order: Vec<usize>,
}

impl ExecutionGraph {
    /// Compile a definition's top-level steps.
    ///
    /// Nested subprocess and loop bodies are compiled separately when their
    /// child instances are created.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] for duplicate ids, unknown dependencies or
    /// cycles. Validation reports these with more detail; compilation only
    /// refuses to build an unsound graph.
    pub fn compile(definition: &ProcessDefinition) -> Result<Self, CompileError> {
        let mut index = HashMap::with_capacity(definition.steps.len());
        for (i, step) in definition.steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(CompileError::DuplicateStep(step.id.clone()));
            }
        }

        let n = definition.steps.len();
        let mut deps = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];
        for (i, step) in definition.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let &d = index
                    .get(dep)
                    .ok_or_else(|| CompileError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    })?;
                if !deps[i].contains(&d) {
                    deps[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        // Kahn's algorithm; the ready set is ordered by declaration index.
        let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != n {
            let stuck = (0..n)
                .filter(|i| in_degree[*i] > 0)
                .map(|i| definition.steps[i].id.clone())
                .collect();
            return Err(CompileError::Cycle(stuck));
        }

        Ok(Self {
            steps: definition.steps.iter().map(|s| s.id.clone()).collect(),
            index,
            deps,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step ids in topological order.
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.steps[i].as_str()).collect()
    }

    /// Direct dependencies of a step.
    pub fn dependencies(&self, step_id: &str) -> Vec<&str> {
        self.index
            .get(step_id)
            .map(|&i| self.deps[i].iter().map(|&d| self.steps[d].as_str()).collect())
            .unwrap_or_default()
    }

    /// Steps that directly depend on a step.
    pub fn dependents(&self, step_id: &str) -> Vec<&str> {
        self.index
            .get(step_id)
            .map(|&i| self.dependents[i].iter().map(|&d| self.steps[d].as_str()).collect())
            .unwrap_or_default()
    }

    /// Every step reachable through `depends_on`.
    pub fn transitive_dependencies(&self, step_id: &str) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(step_id) else {
            return seen;
        };
        let mut stack = self.deps[start].clone();
        while let Some(i) = stack.pop() {
            if seen.insert(self.steps[i].as_str()) {
                stack.extend(self.deps[i].iter().copied());
            }
        }
        seen
    }

    /// Pending steps whose dependencies have all succeeded, in declaration
    /// order. These may be dispatched concurrently.
    pub fn eligible<F>(&self, status: F) -> Vec<&str>
    where
        F: Fn(&str) -> Option<StepStatus>,
    {
        (0..self.steps.len())
            .filter(|&i| status(&self.steps[i]) == Some(StepStatus::Pending))
            .filter(|&i| {
                self.deps[i]
                    .iter()
                    .all(|&d| status(&self.steps[d]) == Some(StepStatus::Succeeded))
            })
            .map(|i| self.steps[i].as_str())
            .collect()
    }

    /// Steps grouped into waves that can run in parallel.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let mut level = vec![0usize; self.steps.len()];
        for &i in &self.order {
            level[i] = self.deps[i].iter().map(|&d| level[d] + 1).max().unwrap_or(0);
        }
        let depth = level.iter().max().map_or(0, |m| m + 1);
        let mut waves: Vec<Vec<&str>> = vec![Vec::new(); depth];
        for (i, id) in self.steps.iter().enumerate() {
            waves[level[i]].push(id.as_str());
        }
        waves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pe_protocol::definition_models::StepDefinition;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn def(steps: Vec<StepDefinition>) -> ProcessDefinition {
        ProcessDefinition {
            name: "g".to_string(),
            inputs: vec![],
            steps,
            outputs: Default::default(),
            trivial: false,
            planning: None,
            budget: None,
        }
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let graph = ExecutionGraph::compile(&def(vec![
            StepDefinition::action("c", "x").with_depends_on(["a"]),
            StepDefinition::action("b", "x"),
            StepDefinition::action("a", "x"),
        ]))
        .unwrap();
        assert_eq!(graph.order(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_diamond_levels_and_eligibility() {
        let graph = ExecutionGraph::compile(&def(vec![
            StepDefinition::action("a", "x"),
            StepDefinition::action("b", "x").with_depends_on(["a"]),
            StepDefinition::action("c", "x").with_depends_on(["a"]),
            StepDefinition::action("d", "x").with_depends_on(["b", "c"]),
        ]))
        .unwrap();

        assert_eq!(graph.levels(), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(graph.dependents("a"), vec!["b", "c"]);

        let eligible = graph.eligible(|id| {
            Some(if id == "a" {
                StepStatus::Succeeded
            } else {
                StepStatus::Pending
            })
        });
        assert_eq!(eligible, vec!["b", "c"]);
        assert_eq!(
            graph.transitive_dependencies("d").into_iter().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_cycle_refuses_to_compile() {
        let err = ExecutionGraph::compile(&def(vec![
            StepDefinition::action("a", "x").with_depends_on(["b"]),
            StepDefinition::action("b", "x").with_depends_on(["a"]),
            StepDefinition::action("c", "x"),
        ]))
        .unwrap_err();
        assert_eq!(err, CompileError::Cycle(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = ExecutionGraph::compile(&def(vec![
            StepDefinition::action("a", "x").with_depends_on(["zzz"])
        ]))
        .unwrap_err();
        assert!(matches!(err, CompileError::UnknownDependency { .. }));
    }

    proptest! {
        /// Any acyclic graph compiles to an order where every step comes
        /// after all of its dependencies.
        #[test]
        fn prop_order_respects_dependencies(
            ranks in prop::collection::vec(0u32..1000, 1..16),
            edges in prop::collection::vec((0usize..16, 0usize..16), 0..40),
        ) {
            let n = ranks.len();
            // Orient every edge from lower to higher rank: always acyclic,
            // independent of declaration order.
            let key = |i: usize| (ranks[i], i);
            let mut steps: Vec<StepDefinition> =
                (0..n).map(|i| StepDefinition::action(format!("s{i}"), "x")).collect();
            for (a, b) in edges {
                let (a, b) = (a % n, b % n);
                if a == b {
                    continue;
                }
                let (dep, dependent) = if key(a) < key(b) { (a, b) } else { (b, a) };
                let dep_id = format!("s{dep}");
                if !steps[dependent].depends_on.contains(&dep_id) {
                    steps[dependent].depends_on.push(dep_id);
                }
            }
            let definition = def(steps);
            let graph = ExecutionGraph::compile(&definition).unwrap();
            let order = graph.order();
            prop_assert_eq!(order.len(), n);

            let position: HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
            for step in &definition.steps {
                for dep in &step.depends_on {
                    prop_assert!(position[dep.as_str()] < position[step.id.as_str()]);
                }
            }
        }
    }
}
