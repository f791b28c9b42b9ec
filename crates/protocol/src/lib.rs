//! # pe-protocol
//!
//! Data model for the process orchestration engine.
//!
//! This crate defines every serializable structure the engine exchanges or
//! persists:
//! - Process definitions and their steps, retry and quality policies
//! - Runtime process instances, step state and budgets
//! - Transition log records
//! - Bus messages (work units, worker replies, artifact references)
//! - Control signals and engine events
//! - Engine settings and worker manifests
//!
//! ## Modules
//!
//! - [`definition_models`]: Process definitions
//! - [`instance_models`]: Runtime instance state
//! - [`quality_models`]: Quality policies and verdicts
//! - [`transition_models`]: Transition log records
//! - [`bus_models`]: Worker dispatch, replies and artifacts
//! - [`ipc`]: Control signals and engine events
//! - [`config_models`]: Engine settings from config.toml
//! - [`worker_models`]: Worker manifests
//!
//! ## Design Principles
//!
//! - Minimal dependencies: only serde, serde_json, uuid and chrono
//! - No behaviour beyond small accessors; the engine lives in `pe-core`

pub mod bus_models;
pub mod config_models;
pub mod definition_models;
pub mod instance_models;
pub mod ipc;
pub mod quality_models;
pub mod transition_models;
pub mod worker_models;

// Re-export all public types for convenience
pub use bus_models::*;
pub use config_models::*;
pub use definition_models::*;
pub use instance_models::*;
pub use ipc::*;
pub use quality_models::*;
pub use transition_models::*;
pub use worker_models::*;
