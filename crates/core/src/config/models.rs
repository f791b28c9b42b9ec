//! Aggregated configuration of a `.process-kit/` directory.

use pe_protocol::config_models::EngineSettings;
use pe_protocol::definition_models::ProcessDefinition;
use pe_protocol::worker_models::WorkerManifest;

/// Everything loaded from `.process-kit/`:
/// - `config.toml`: engine settings
/// - `workers/*.md`: worker manifests
/// - `processes/*.yaml|yml|json`: validated process definitions
///
/// # Example
///
/// ```rust,no_run
/// use pe_core::config::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!("Loaded {} workers and {} processes",
///          config.workers.len(),
///          config.processes.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProcessKitConfig {
    pub settings: EngineSettings,

    /// Sorted by id.
    pub workers: Vec<WorkerManifest>,

    /// Sorted by name.
    pub processes: Vec<ProcessDefinition>,
}

impl ProcessKitConfig {
    pub fn process(&self, name: &str) -> Option<&ProcessDefinition> {
        self.processes.iter().find(|p| p.name == name)
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerManifest> {
        self.workers.iter().find(|w| w.id == id)
    }
}
