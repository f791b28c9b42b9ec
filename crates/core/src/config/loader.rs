//! Configuration file loader for the `.process-kit/` directory structure.
//!
//! - `config.toml`: engine settings
//! - `workers/*.md`: worker manifests with YAML front matter
//! - `processes/*.yaml`, `*.yml`, `*.json`: process definitions

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::models::ProcessKitConfig;
use crate::definition::load_definition;
use gray_matter::engine::YAML;
use gray_matter::Matter;
use pe_protocol::config_models::EngineSettings;
use pe_protocol::definition_models::ProcessDefinition;
use pe_protocol::worker_models::WorkerManifest;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Name of the configuration directory under a project root.
pub const CONFIG_DIR: &str = ".process-kit";

/// Loads all configuration from `<root>/.process-kit/`.
///
/// Missing directories and files yield defaults rather than errors.
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - Files exist but cannot be read
/// - Files have invalid syntax (TOML, YAML, or Markdown front matter)
/// - A process definition fails validation
/// - Two files declare the same worker id or process name
pub async fn load_config(root: &Path) -> ConfigResult<ProcessKitConfig> {
    let dir = root.join(CONFIG_DIR);
    if !dir.exists() {
        return Ok(ProcessKitConfig::default());
    }

    let settings = load_settings(&dir)?;
    let workers = load_workers(&dir)?;
    let processes = load_processes(&dir)?;
    debug!(
        dir = %dir.display(),
        workers = workers.len(),
        processes = processes.len(),
        "Configuration loaded"
    );

    Ok(ProcessKitConfig {
        settings,
        workers,
        processes,
    })
}

fn read(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Files directly inside `dir` whose extension is one of `extensions`,
/// sorted by path.
fn files_with(dir: &Path, extensions: &[&str]) -> ConfigResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|source| ConfigError::DirectoryWalk {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let ext = path.extension().and_then(|s| s.to_str());
        if ext.is_some_and(|e| extensions.contains(&e)) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn load_settings(dir: &Path) -> ConfigResult<EngineSettings> {
    let path = dir.join("config.toml");
    if !path.exists() {
        return Ok(EngineSettings::default());
    }
    let content = read(&path)?;
    toml::from_str(&content).map_err(|source| ConfigError::TomlParse { path, source })
}

fn load_workers(dir: &Path) -> ConfigResult<Vec<WorkerManifest>> {
    let mut workers = Vec::new();
    let mut seen = HashSet::new();
    for path in files_with(&dir.join("workers"), &["md"])? {
        let content = read(&path)?;
        let matter = Matter::<YAML>::new();
        let parsed = matter.parse(&content);

        let mut worker: WorkerManifest = parsed
            .data
            .ok_or_else(|| ConfigError::MarkdownParse {
                path: path.clone(),
                reason: "Missing YAML front matter".to_string(),
            })?
            .deserialize()
            .map_err(|e| ConfigError::MarkdownParse {
                path: path.clone(),
                reason: format!("Failed to deserialize front matter: {e}"),
            })?;
        worker.notes = parsed.content;

        if !seen.insert(worker.id.clone()) {
            return Err(ConfigError::Duplicate {
                kind: "worker",
                name: worker.id,
                path,
            });
        }
        workers.push(worker);
    }
    workers.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(workers)
}

fn load_processes(dir: &Path) -> ConfigResult<Vec<ProcessDefinition>> {
    let mut processes = Vec::new();
    let mut seen = HashSet::new();
    for path in files_with(&dir.join("processes"), &["yaml", "yml", "json"])? {
        let content = read(&path)?;
        // JSON is valid YAML, so one parser covers all three extensions.
        let document: Value =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlParse {
                path: path.clone(),
                source,
            })?;
        let definition = load_definition(&document).map_err(|report| {
            ConfigError::InvalidDefinition {
                path: path.clone(),
                report,
            }
        })?;
        if !seen.insert(definition.name.clone()) {
            return Err(ConfigError::Duplicate {
                kind: "process",
                name: definition.name,
                path,
            });
        }
        processes.push(definition);
    }
    processes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(processes)
}
