//! Custom assertion helpers for engine tests.

use pe_protocol::instance_models::{Phase, StepStatus};
use pe_protocol::ipc::Event;
use uuid::Uuid;

/// Phases an instance went through, in emission order.
#[allow(dead_code)]
pub fn phases_of(events: &[Event], instance_id: Uuid) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::PhaseChanged {
                instance_id: id,
                phase,
            } if *id == instance_id => Some(*phase),
            _ => None,
        })
        .collect()
}

/// Statuses a step went through, in emission order.
#[allow(dead_code)]
pub fn step_statuses(events: &[Event], instance_id: Uuid, step: &str) -> Vec<StepStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StepStatusChanged {
                instance_id: id,
                step_id,
                status,
                ..
            } if *id == instance_id && step_id == step => Some(*status),
            _ => None,
        })
        .collect()
}

#[allow(dead_code)]
pub fn has_started(events: &[Event], instance_id: Uuid) -> bool {
    events.iter().any(|e| {
        matches!(e, Event::InstanceStarted { instance_id: id, .. } if *id == instance_id)
    })
}

#[allow(dead_code)]
pub fn has_completed(events: &[Event], instance_id: Uuid) -> bool {
    events.iter().any(|e| {
        matches!(e, Event::InstanceCompleted { instance_id: id } if *id == instance_id)
    })
}

#[allow(dead_code)]
pub fn has_escalated(events: &[Event], instance_id: Uuid) -> bool {
    events.iter().any(|e| {
        matches!(e, Event::InstanceEscalated { instance_id: id, .. } if *id == instance_id)
    })
}

#[allow(dead_code)]
pub fn has_cancelled(events: &[Event], instance_id: Uuid) -> bool {
    events.iter().any(|e| {
        matches!(e, Event::InstanceCancelled { instance_id: id } if *id == instance_id)
    })
}

/// Assert the instance's phase events start with `Executing` and end with
/// `last`.
#[allow(dead_code)]
pub fn assert_phase_sequence(events: &[Event], instance_id: Uuid, last: Phase) {
    let phases = phases_of(events, instance_id);
    assert!(
        !phases.is_empty(),
        "Instance {instance_id} emitted no phase changes"
    );
    assert_eq!(
        phases.last(),
        Some(&last),
        "Last phase should be {last}, got: {phases:?}"
    );
    let terminal = phases.iter().filter(|p| p.is_terminal()).count();
    assert_eq!(terminal, 1, "Exactly one terminal phase expected: {phases:?}");
}
