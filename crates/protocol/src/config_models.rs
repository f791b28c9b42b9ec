//! Engine settings from `.process-kit/config.toml`.

use serde::{Deserialize, Serialize};

use crate::definition_models::RetryPolicy;
use crate::instance_models::Budget;

/// Engine-wide settings. Every field is optional in the TOML file.
///
/// # Example
///
/// ```toml
/// # .process-kit/config.toml
/// default_timeout_ms = 15000
/// blocked_ceiling_ms = 120000
/// force_direct_execution = false
///
/// [default_retry]
/// max_attempts = 4
///
/// [default_budget]
/// max_iterations = 200
/// max_external_calls = 200
/// max_spend = 25.0
/// max_wall_clock_ms = 1800000
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Per-step timeout when the step does not set one.
    pub default_timeout_ms: u64,

    /// How often blocked steps are re-checked for capacity.
    pub capacity_check_interval_ms: u64,

    /// How long a step may stay blocked before the instance escalates.
    pub blocked_ceiling_ms: u64,

    /// Deepest allowed nesting of child instances (root is 0).
    pub max_depth: u32,

    /// Fraction of the parent's remaining budget withheld from children.
    pub child_reserve_fraction: f64,

    /// Parameter payloads above this many bytes go to the artifact store.
    pub inline_payload_limit: usize,

    /// Units for worker `w` are published to `<prefix><w>`.
    pub dispatch_topic_prefix: String,

    /// Destination workers reply to.
    pub reply_topic: String,

    /// Operator override: never run collaborative planning.
    pub force_direct_execution: bool,

    /// Capacity of the observer event channel.
    pub event_buffer: usize,

    pub default_retry: RetryPolicy,

    pub default_budget: Budget,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            capacity_check_interval_ms: 1_000,
            blocked_ceiling_ms: 60_000,
            max_depth: 8,
            child_reserve_fraction: 0.1,
            inline_payload_limit: 4_096,
            dispatch_topic_prefix: "work.".to_string(),
            reply_topic: "engine.replies".to_string(),
            force_direct_execution: false,
            event_buffer: 256,
            default_retry: RetryPolicy::default(),
            default_budget: Budget::default(),
        }
    }
}
