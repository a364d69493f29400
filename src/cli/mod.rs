//! Command-line interface for sagaflow.
//!
//! Provides commands for starting orchestration instances, checking their
//! status and history, resuming interrupted instances and cancelling them.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::adapters::etl::EtlServices;
use crate::adapters::order::{OrderServices, OrderSettings};
use crate::config::{self, ResolvedConfig};
use crate::core::{InstanceStatusReport, Registry, Runtime};
use crate::domain::{EventKind, HistoryEvent, InstanceStatus};
use crate::etl::{EtlOrchestration, EtlSettings, ETL_ORCHESTRATOR};
use crate::saga::order::{OrderSagaOrchestration, ORDER_SAGA};

/// sagaflow - Durable saga and fan-out/fan-in orchestration
#[derive(Parser, Debug)]
#[command(name = "sagaflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an orchestration instance
    Start {
        /// Orchestrator name (e.g. OrderSagaOrchestrator, EtlOrchestrator)
        orchestrator: String,

        /// JSON input file (reads from stdin if piped)
        #[arg(short, long, conflicts_with = "json")]
        input: Option<PathBuf>,

        /// Inline JSON input
        #[arg(long)]
        json: Option<String>,

        /// Instance ID (generated if not provided)
        #[arg(long)]
        id: Option<String>,

        /// Drive the instance to completion before returning
        #[arg(short, long)]
        wait: bool,
    },

    /// Check the status of an instance
    Status {
        /// Instance ID
        instance_id: String,
    },

    /// Show the event history of an instance
    History {
        /// Instance ID
        instance_id: String,
    },

    /// Terminate a running instance
    Terminate {
        /// Instance ID
        instance_id: String,

        /// Reason recorded in history
        #[arg(short, long, default_value = "Terminated by user")]
        reason: String,
    },

    /// Drive an existing instance to completion (recovers after a crash)
    Resume {
        /// Instance ID
        instance_id: String,
    },

    /// List recent instances
    List {
        /// Maximum number of instances to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Start {
                orchestrator,
                input,
                json,
                id,
                wait,
            } => start_instance(&orchestrator, input, json, id, wait).await,
            Commands::Status { instance_id } => show_status(&instance_id).await,
            Commands::History { instance_id } => show_history(&instance_id).await,
            Commands::Terminate { instance_id, reason } => terminate_instance(&instance_id, &reason).await,
            Commands::Resume { instance_id } => resume_instance(&instance_id).await,
            Commands::List { limit } => list_instances(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Registry with the built-in orchestrations and their activities
pub fn builtin_registry(order: &OrderSettings, etl: &EtlSettings) -> Result<Registry> {
    let builder = Registry::builder()
        .orchestration(ORDER_SAGA, OrderSagaOrchestration::new())
        .orchestration(ETL_ORCHESTRATOR, EtlOrchestration::new(etl.sources.clone()));

    let builder = OrderServices::new(order.clone()).register(builder);
    let etl_services = EtlServices::new(etl.clone()).context("Invalid ETL validation rules")?;
    let builder = etl_services.register(builder);

    Ok(builder.build()?)
}

/// Build a runtime from resolved configuration
pub fn build_runtime(cfg: &ResolvedConfig) -> Result<Runtime> {
    let store = cfg.open_history_store()?;
    let registry = builtin_registry(&cfg.order, &cfg.etl)?;
    Ok(Runtime::new(store, registry, cfg.runtime.clone()))
}

fn runtime() -> Result<Runtime> {
    build_runtime(config::config()?)
}

/// Read the instance input from --json, --input or piped stdin
fn read_input(input_file: Option<PathBuf>, json: Option<String>) -> Result<Value> {
    let text = if let Some(json) = json {
        json
    } else if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Use --json <JSON>, --input <file> or pipe to stdin");
    };

    if text.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }

    serde_json::from_str(&text).context("Input is not valid JSON")
}

async fn start_instance(
    orchestrator: &str,
    input_file: Option<PathBuf>,
    json: Option<String>,
    id: Option<String>,
    wait: bool,
) -> Result<()> {
    let input = read_input(input_file, json)?;
    let runtime = runtime()?;

    let instance_id = match id {
        Some(id) => {
            runtime.start_with_id(&id, orchestrator, input).await?;
            id
        }
        None => runtime.start(orchestrator, input).await?,
    };

    if !wait {
        println!("{}", instance_id);
        eprintln!("[Instance {} started; run `sagaflow resume {}` to drive it]", instance_id, instance_id);
        return Ok(());
    }

    let report = runtime.run_to_completion(&instance_id).await?;
    print_report(&report)
}

async fn resume_instance(instance_id: &str) -> Result<()> {
    let runtime = runtime()?;
    let report = runtime.run_to_completion(instance_id).await?;
    print_report(&report)
}

/// Print the output of a finished instance and exit non-zero on failure
fn print_report(report: &InstanceStatusReport) -> Result<()> {
    if let Some(output) = &report.output {
        println!("{}", serde_json::to_string_pretty(output)?);
    }

    match report.status {
        InstanceStatus::Completed => {
            eprintln!("\n[Instance {} completed]", report.instance_id);
        }
        InstanceStatus::Failed | InstanceStatus::Terminated => {
            eprintln!(
                "\n[Instance {} {}: {}]",
                report.instance_id,
                report.status,
                report.failure_reason.as_deref().unwrap_or("no reason recorded")
            );
            std::process::exit(1);
        }
        status => {
            eprintln!("\n[Instance {} in state: {}]", report.instance_id, status);
        }
    }

    Ok(())
}

async fn show_status(instance_id: &str) -> Result<()> {
    let runtime = runtime()?;
    let instance = runtime.get_instance(instance_id).await?;

    println!("Instance ID:  {}", instance.instance_id);
    println!("Orchestrator: {}", instance.orchestrator_name);
    println!("Status:       {}", instance.status_summary());
    println!("Created:      {}", instance.created_at);
    println!("Updated:      {}", instance.last_updated_at);

    let records = instance.task_records();
    if !records.is_empty() {
        println!("\nTasks:");
        for record in records {
            let state = match &record.outcome {
                None => "pending".to_string(),
                Some(Ok(_)) => "completed".to_string(),
                Some(Err(failure)) => format!("failed ({})", failure.message),
            };
            println!("  #{:<4} {:<24} {}", record.task.task_id, record.task.activity_name, state);
        }
    }

    if let Some(output) = &instance.output {
        println!("\nOutput:\n{}", serde_json::to_string_pretty(output)?);
    }

    Ok(())
}

fn describe(event: &HistoryEvent) -> String {
    match event.kind {
        EventKind::OrchestratorStarted => event.name.clone().unwrap_or_default(),
        EventKind::TaskScheduled | EventKind::TaskCompleted => format!(
            "#{} {}",
            event.task_id.unwrap_or_default(),
            event.name.as_deref().unwrap_or("")
        ),
        EventKind::TaskFailed => format!(
            "#{} {}: {}",
            event.task_id.unwrap_or_default(),
            event.name.as_deref().unwrap_or(""),
            event.error.as_deref().unwrap_or("")
        ),
        EventKind::OrchestratorCompleted => String::new(),
        EventKind::OrchestratorFailed | EventKind::OrchestratorTerminated => {
            event.error.clone().unwrap_or_default()
        }
    }
}

async fn show_history(instance_id: &str) -> Result<()> {
    let runtime = runtime()?;
    let history = runtime.history(instance_id).await?;

    println!("{:<5} {:<26} {:<24} {}", "SEQ", "TIMESTAMP", "EVENT", "DETAIL");
    println!("{}", "-".repeat(90));

    for event in &history {
        println!(
            "{:<5} {:<26} {:<24} {}",
            event.sequence,
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            event.kind.to_string(),
            describe(event)
        );
    }

    Ok(())
}

async fn terminate_instance(instance_id: &str, reason: &str) -> Result<()> {
    let runtime = runtime()?;
    runtime.terminate(instance_id, reason).await?;
    eprintln!("[Instance {} terminated: {}]", instance_id, reason);
    Ok(())
}

async fn list_instances(limit: usize) -> Result<()> {
    let runtime = runtime()?;
    let instances = runtime.list_instances().await?;

    if instances.is_empty() {
        println!("No instances found");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<12} {}", "INSTANCE ID", "ORCHESTRATOR", "STATUS", "CREATED");
    println!("{}", "-".repeat(100));

    for instance in instances.into_iter().take(limit) {
        println!(
            "{:<38} {:<24} {:<12} {}",
            instance.instance_id,
            instance.orchestrator_name,
            instance.status.to_string(),
            instance.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let runtime = &cfg.runtime;

    println!("sagaflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  History:     {} ({:?})", cfg.history_path.display(), cfg.history_backend);
    println!("  ETL output:  {}", cfg.etl.output_dir.display());
    if let Some(csv) = &cfg.etl.csv_source {
        println!("  CSV source:  {}", csv.display());
    }
    println!();
    println!("Runtime:");
    println!("  Max concurrent activities: {}", runtime.max_concurrent_activities);
    println!("  Activity timeout:          {}s", runtime.activity_timeout_seconds);
    println!("  Instance timeout:          {}s", runtime.instance_timeout_seconds);
    println!();
    println!("Retry:");
    println!("  Max attempts:  {}", runtime.retry.max_attempts);
    println!("  Initial delay: {}ms", runtime.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", runtime.retry.max_delay_ms);
    println!("  Multiplier:    {}", runtime.retry.backoff_multiplier);
    println!("  Jitter:        {}", runtime.retry.jitter);
    println!();
    println!("Safety limits:");
    println!("  Max tasks per instance: {}", runtime.safety.max_tasks_per_instance);
    println!("  Max payload bytes:      {}", runtime.safety.max_payload_bytes);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry(&OrderSettings::default(), &EtlSettings::default()).unwrap();

        assert_eq!(
            registry.orchestration_names(),
            vec![ETL_ORCHESTRATOR.to_string(), ORDER_SAGA.to_string()]
        );
        assert_eq!(registry.activity_names().len(), 11);
    }

    #[test]
    fn test_read_inline_json() {
        let value = read_input(None, Some(r#"{"id": "o1"}"#.to_string())).unwrap();
        assert_eq!(value["id"], "o1");
        assert!(read_input(None, Some("{".to_string())).is_err());
    }

    #[test]
    fn test_parse_start_command() {
        let cli = Cli::try_parse_from(["sagaflow", "start", "EtlOrchestrator", "--json", "\"run-1\"", "--wait"]).unwrap();
        match cli.command {
            Commands::Start { orchestrator, json, wait, .. } => {
                assert_eq!(orchestrator, "EtlOrchestrator");
                assert_eq!(json.as_deref(), Some("\"run-1\""));
                assert!(wait);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
