//! Common test utilities shared by the engine integration tests.
//!
//! - Harness wiring an engine to scripted workers and a memory journal
//! - Sample definitions
//! - Event assertions
//! - Scripted workers, judges and proposers

pub mod assertions;
pub mod fixtures;
pub mod mock_workers;

#[allow(unused_imports)]
pub use assertions::*;
pub use fixtures::*;
#[allow(unused_imports)]
pub use mock_workers::*;
