//! Budget ledger arithmetic.

use chrono::{DateTime, Utc};
use pe_protocol::instance_models::{Budget, BudgetDimension, ProcessInstance};

/// Resources one action is about to consume.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Charge {
    pub iterations: u32,
    pub external_calls: u32,
    pub spend: f64,
}

impl Charge {
    /// One dispatch: one iteration and one external call.
    pub fn dispatch() -> Self {
        Self {
            iterations: 1,
            external_calls: 1,
            spend: 0.0,
        }
    }

    pub fn external_calls(n: u32) -> Self {
        Self {
            external_calls: n,
            ..Self::default()
        }
    }

    pub fn spend(amount: f64) -> Self {
        Self {
            spend: amount.max(0.0),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iterations == 0 && self.external_calls == 0 && self.spend <= 0.0
    }
}

pub fn elapsed_ms(instance: &ProcessInstance, now: DateTime<Utc>) -> u64 {
    (now - instance.created_at).num_milliseconds().max(0) as u64
}

pub fn wall_clock_exhausted(instance: &ProcessInstance, now: DateTime<Utc>) -> bool {
    elapsed_ms(instance, now) >= instance.budget.max_wall_clock_ms
}

/// Check whether `charge` fits into what is left.
///
/// # Errors
///
/// Returns the first exhausted dimension, wall clock first.
pub fn check(
    instance: &ProcessInstance,
    charge: &Charge,
    now: DateTime<Utc>,
) -> Result<(), BudgetDimension> {
    let (budget, spent) = (&instance.budget, &instance.spent);
    if wall_clock_exhausted(instance, now) {
        return Err(BudgetDimension::WallClock);
    }
    if u64::from(spent.iterations) + u64::from(charge.iterations) > u64::from(budget.max_iterations) {
        return Err(BudgetDimension::Iterations);
    }
    if u64::from(spent.external_calls) + u64::from(charge.external_calls)
        > u64::from(budget.max_external_calls)
    {
        return Err(BudgetDimension::ExternalCalls);
    }
    if spent.spend + charge.spend > budget.max_spend + f64::EPSILON {
        return Err(BudgetDimension::Spend);
    }
    Ok(())
}

/// Clamp a worker-reported cost to the remaining spend allowance.
///
/// Returns the amount to record and whether the allowance was overrun.
pub fn clamp_spend(instance: &ProcessInstance, cost: f64) -> (f64, bool) {
    let cost = cost.max(0.0);
    let left = (instance.budget.max_spend - instance.spent.spend).max(0.0);
    if cost > left + f64::EPSILON {
        (left, true)
    } else {
        (cost, false)
    }
}

/// The part of `charge` that still fits, dimension by dimension.
pub fn clamp(instance: &ProcessInstance, charge: &Charge) -> Charge {
    let (budget, spent) = (&instance.budget, &instance.spent);
    Charge {
        iterations: charge
            .iterations
            .min(budget.max_iterations.saturating_sub(spent.iterations)),
        external_calls: charge
            .external_calls
            .min(budget.max_external_calls.saturating_sub(spent.external_calls)),
        spend: charge.spend.min((budget.max_spend - spent.spend).max(0.0)),
    }
}

/// Budget handed to each of `count` children spawned at `now`.
///
/// Every countable dimension gets `remaining * (1 - reserve) / count`;
/// wall clock is the parent's remaining wall clock.
pub fn child_share(
    instance: &ProcessInstance,
    count: usize,
    reserve: f64,
    now: DateTime<Utc>,
) -> Budget {
    let (budget, spent) = (&instance.budget, &instance.spent);
    let n = count.max(1) as f64;
    let keep = (1.0 - reserve).clamp(0.0, 1.0);
    let share = |remaining: f64| remaining * keep / n;

    let iterations = share(f64::from(budget.max_iterations.saturating_sub(spent.iterations)));
    let external_calls = share(f64::from(
        budget.max_external_calls.saturating_sub(spent.external_calls),
    ));
    let spend = share((budget.max_spend - spent.spend).max(0.0));

    Budget {
        max_iterations: iterations.floor() as u32,
        max_external_calls: external_calls.floor() as u32,
        max_spend: spend,
        max_wall_clock_ms: budget
            .max_wall_clock_ms
            .saturating_sub(elapsed_ms(instance, now)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::process::create;
    use chrono::Duration;
    use pe_protocol::definition_models::ProcessDefinition;
    use pe_protocol::transition_models::{Transition, TransitionRecord};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn instance(budget: Budget) -> ProcessInstance {
        let id = Uuid::new_v4();
        create(&TransitionRecord {
            instance_id: id,
            seq: 0,
            at: Utc::now(),
            transition: Transition::Created {
                definition: ProcessDefinition {
                    name: "b".to_string(),
                    inputs: vec![],
                    steps: vec![],
                    outputs: Default::default(),
                    trivial: true,
                    planning: None,
                    budget: None,
                },
                parent: None,
                root_id: id,
                depth: 0,
                path: vec![],
                budget,
                variables: BTreeMap::new(),
            },
        })
        .unwrap()
    }

    fn budget() -> Budget {
        Budget {
            max_iterations: 10,
            max_external_calls: 4,
            max_spend: 1.0,
            max_wall_clock_ms: 60_000,
        }
    }

    #[test]
    fn test_check_reports_the_exhausted_dimension() {
        let mut inst = instance(budget());
        let now = inst.created_at;
        assert_eq!(check(&inst, &Charge::dispatch(), now), Ok(()));

        inst.spent.external_calls = 4;
        assert_eq!(
            check(&inst, &Charge::dispatch(), now),
            Err(BudgetDimension::ExternalCalls)
        );
        assert_eq!(check(&inst, &Charge::spend(0.5), now), Ok(()));
        assert_eq!(
            check(&inst, &Charge::spend(1.5), now),
            Err(BudgetDimension::Spend)
        );
    }

    #[test]
    fn test_wall_clock_wins() {
        let inst = instance(budget());
        let later = inst.created_at + Duration::milliseconds(60_000);
        assert_eq!(
            check(&inst, &Charge::default(), later),
            Err(BudgetDimension::WallClock)
        );
    }

    #[test]
    fn test_clamp_spend() {
        let mut inst = instance(budget());
        inst.spent.spend = 0.75;
        assert_eq!(clamp_spend(&inst, 0.2), (0.2, false));
        assert_eq!(clamp_spend(&inst, 0.5), (0.25, true));
    }

    #[test]
    fn test_clamp_keeps_what_fits() {
        let mut inst = instance(budget());
        inst.spent.external_calls = 3;
        let clamped = clamp(&inst, &Charge::external_calls(5));
        assert_eq!(clamped.external_calls, 1);
        assert_eq!(clamped.iterations, 0);
    }

    #[test]
    fn test_child_share_withholds_reserve() {
        let mut inst = instance(budget());
        inst.spent.iterations = 2;
        let now = inst.created_at + Duration::milliseconds(10_000);
        let share = child_share(&inst, 2, 0.25, now);
        // (10 - 2) * 0.75 / 2 = 3
        assert_eq!(share.max_iterations, 3);
        // 4 * 0.75 / 2 = 1.5 -> 1
        assert_eq!(share.max_external_calls, 1);
        assert!((share.max_spend - 0.375).abs() < 1e-9);
        assert_eq!(share.max_wall_clock_ms, 50_000);
    }
}
