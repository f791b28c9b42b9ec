//! # pe-core
//!
//! Core process orchestration engine for process-kit.
//!
//! This crate provides:
//! - Configuration loading from the `.process-kit/` directory
//! - Definition parsing, validation and dependency graph compilation
//! - A journaled state machine for process instances
//! - Dispatch of work units to capability-matched workers
//! - Quality evaluation, collaborative planning, and nested subprocesses
//! - Crash recovery by replaying the transition journal
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading
//! - [`definition`]: Definition parsing, templates and validation
//! - [`graph`]: Execution graph compiled from a definition
//! - [`state`]: Transitions, replay, budgets and the step decision table
//! - [`journal`]: Append-only transition log
//! - [`directory`]: Capability directory of known workers
//! - [`transport`]: Worker transport and artifact storage seams
//! - [`dispatch`]: Work unit preparation and reply timeouts
//! - [`quality`]: Criterion scoring and verdicts
//! - [`planning`]: Collaborative plan synthesis
//! - [`engine`]: The orchestration loop and its handle
//! - [`recovery`]: Restart from the journal

pub mod config;
pub mod definition;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod graph;
pub mod journal;
pub mod planning;
pub mod quality;
pub mod recovery;
pub mod state;
pub mod transport;

pub use engine::{Engine, EngineDeps, EngineHandle};
pub use error::{EngineError, EngineResult};
