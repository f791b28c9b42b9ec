//! Configuration loading and management.
//!
//! This module loads every configuration file from the `.process-kit/`
//! directory structure.

pub mod error;
pub mod loader;
pub mod models;

pub use error::{ConfigError, ConfigResult};
pub use loader::load_config;
pub use models::ProcessKitConfig;
