//! Fixed-priority merge of plan proposals.
//!
//! Author-declared steps come first and always win. Proposals follow in
//! order of confidence (highest first), ties broken by worker id. Within
//! that order:
//! - a step whose id is already taken is dropped,
//! - steps depending on ids that do not exist after the merge are dropped,
//! - a proposal whose steps would close a dependency cycle is rejected as a
//!   whole.
//!
//! The result depends only on the inputs, never on arrival order.

use crate::graph::{CompileError, ExecutionGraph};
use pe_protocol::definition_models::{ProcessDefinition, StepDefinition};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, warn};

/// A partial plan offered by one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub worker_id: String,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
    pub steps: Vec<StepDefinition>,
}

fn priority(a: &Proposal, b: &Proposal) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.worker_id.cmp(&b.worker_id))
}

/// Drop added steps whose dependencies are missing, until none are.
fn prune_unresolved(steps: &mut Vec<StepDefinition>, first_added: usize) {
    loop {
        let ids: HashSet<String> = steps.iter().map(|s| s.id.clone()).collect();
        let before = steps.len();
        let mut index = 0;
        steps.retain(|step| {
            let keep = index < first_added || step.depends_on.iter().all(|d| ids.contains(d));
            if !keep {
                debug!(step_id = %step.id, "Dropping proposed step with unresolved dependency");
            }
            index += 1;
            keep
        });
        if steps.len() == before {
            return;
        }
    }
}

/// Merge `proposals` into `base`.
pub fn merge(base: &ProcessDefinition, mut proposals: Vec<Proposal>) -> ProcessDefinition {
    proposals.sort_by(priority);
    let mut merged = base.clone();

    for proposal in proposals {
        let mut candidate = merged.steps.clone();
        let first_added = candidate.len();
        let mut taken: HashSet<String> = candidate.iter().map(|s| s.id.clone()).collect();
        for step in proposal.steps {
            if taken.insert(step.id.clone()) {
                candidate.push(step);
            } else {
                debug!(
                    worker_id = %proposal.worker_id,
                    step_id = %step.id,
                    "Dropping proposed step with a taken id"
                );
            }
        }
        prune_unresolved(&mut candidate, first_added);

        let trial = ProcessDefinition {
            steps: candidate,
            ..merged.clone()
        };
        match ExecutionGraph::compile(&trial) {
            Ok(_) => merged = trial,
            Err(CompileError::Cycle(stuck)) => warn!(
                worker_id = %proposal.worker_id,
                steps = ?stuck,
                "Rejecting proposal that would create a cycle"
            ),
            Err(e) => warn!(
                worker_id = %proposal.worker_id,
                error = %e,
                "Rejecting unusable proposal"
            ),
        }
    }
    merged
}
