//! Process state: the transition function, the decision function and the
//! budget ledger.
//!
//! Everything in this module is pure. The engine owns the instances and
//! feeds records and triggers through these functions; nothing here touches
//! the journal, the transport or a clock of its own.

pub mod budget;
pub mod machine;
pub mod process;

pub use budget::Charge;
pub use machine::{decide, terminal_phase, Decision, DecisionInput, Trigger};
pub use process::{apply, create, replay, TransitionError, TransitionResult};
