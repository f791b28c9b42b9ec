//! `pe`: operator tooling for process-kit.
//!
//! - `pe validate <file>`: check a definition document and show its waves
//! - `pe replay <dir>`: rebuild instances from a transition-log directory
//! - `pe config`: summarize a `.process-kit/` directory

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use colored::Colorize;
use pe_core::config::load_config;
use pe_core::definition::load_definition;
use pe_core::graph::ExecutionGraph;
use pe_core::journal::{FileJournal, TransitionLog};
use pe_core::state;
use pe_protocol::instance_models::{Phase, ProcessInstance};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pe", version, about = "Process orchestration engine tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a definition document (YAML or JSON)
    Validate {
        /// Path to the document
        file: PathBuf,
    },

    /// Rebuild instances from a transition-log directory
    Replay {
        /// Directory holding `<instance_id>.jsonl` segments
        dir: PathBuf,

        /// Only this instance
        #[arg(long)]
        instance: Option<Uuid>,

        /// Print the full instance state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarize the configuration under a project root
    Config {
        /// Project root containing `.process-kit/`
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { file } => validate(&file),
        Command::Replay {
            dir,
            instance,
            json,
        } => replay(&dir, instance, json).await,
        Command::Config { root } => config(&root).await,
    }
}

fn validate(file: &Path) -> color_eyre::Result<()> {
    let content = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
    let document: Value = serde_yaml::from_str(&content)
        .wrap_err_with(|| format!("Failed to parse {}", file.display()))?;

    let definition = match load_definition(&document) {
        Ok(definition) => definition,
        Err(report) => {
            eprintln!(
                "{} {} ({} issue(s))",
                "✗".red().bold(),
                file.display(),
                report.issues.len()
            );
            for issue in &report.issues {
                eprintln!("  {} {}", "-".red(), issue);
            }
            bail!("definition is invalid");
        }
    };

    let graph = ExecutionGraph::compile(&definition)?;
    println!(
        "{} {} ({} steps)",
        "✓".green().bold(),
        definition.name.bold(),
        definition.steps.len()
    );
    for (i, wave) in graph.levels().iter().enumerate() {
        println!("  wave {}: {}", i + 1, wave.join(", "));
    }
    if definition.planning.is_some() {
        println!("  {}", "runs collaborative planning first".dimmed());
    }
    Ok(())
}

async fn replay(dir: &Path, only: Option<Uuid>, json: bool) -> color_eyre::Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let journal = FileJournal::open(dir)?;
    let ids = match only {
        Some(id) => vec![id],
        None => journal.instances().await?,
    };
    debug!(dir = %dir.display(), instances = ids.len(), "Replaying journal");

    let mut broken = 0;
    for id in ids {
        let rebuilt = match journal.read(id).await {
            Ok(records) => state::replay(&records).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match rebuilt {
            Ok(instance) if json => println!("{}", serde_json::to_string_pretty(&instance)?),
            Ok(instance) => print_instance(&instance),
            Err(reason) => {
                broken += 1;
                println!("{} {} {}", "!".red().bold(), id, reason.red());
            }
        }
    }
    if broken > 0 {
        bail!("{broken} log(s) could not be replayed");
    }
    Ok(())
}

fn phase_label(phase: Phase) -> colored::ColoredString {
    let text = phase.to_string();
    match phase {
        Phase::Completed => text.green(),
        Phase::Failed | Phase::Escalated => text.red(),
        Phase::Cancelled => text.yellow(),
        _ => text.cyan(),
    }
}

fn print_instance(instance: &ProcessInstance) {
    let parent = instance
        .parent_id()
        .map(|p| format!(" child of {p}"))
        .unwrap_or_default();
    println!(
        "{} {} [{}]{}",
        instance.id,
        instance.definition.name.bold(),
        phase_label(instance.phase),
        parent.dimmed()
    );
    if let Some(outcome) = &instance.outcome {
        println!("  outcome: {outcome}");
    }
    for step in instance.steps.values() {
        println!(
            "  {:<24} {:<16} attempts={}",
            step.step_id, step.status, step.attempts
        );
    }
    let (budget, spent) = (&instance.budget, &instance.spent);
    println!(
        "  spent: iterations {}/{}, calls {}/{}, spend {:.2}/{:.2}",
        spent.iterations,
        budget.max_iterations,
        spent.external_calls,
        budget.max_external_calls,
        spent.spend,
        budget.max_spend
    );
}

async fn config(root: &Path) -> color_eyre::Result<()> {
    let config = load_config(root).await?;
    let settings = &config.settings;
    println!("{}", "Settings".bold());
    println!("  default timeout:   {} ms", settings.default_timeout_ms);
    println!("  blocked ceiling:   {} ms", settings.blocked_ceiling_ms);
    println!("  max depth:         {}", settings.max_depth);
    println!("  inline limit:      {} bytes", settings.inline_payload_limit);
    println!("  direct execution:  {}", settings.force_direct_execution);

    println!("{} ({})", "Workers".bold(), config.workers.len());
    for worker in &config.workers {
        println!("  {} [{}]", worker.id.green(), worker.capabilities.join(", "));
    }

    println!("{} ({})", "Processes".bold(), config.processes.len());
    for process in &config.processes {
        let planning = if process.planning.is_some() { " (planned)" } else { "" };
        println!(
            "  {} {} steps{}",
            process.name.green(),
            process.steps.len(),
            planning.dimmed()
        );
    }
    Ok(())
}
