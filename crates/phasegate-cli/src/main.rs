use clap::{Parser, Subcommand};
use phasegate_core::{PhasegateError, WorkItemStatus};
use phasegate_orchestrator::{PipelineConfig, PipelineEngine};
use phasegate_security::AuditTrail;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Exit code when a run ends BLOCKED.
const EXIT_BLOCKED: u8 = 5;

#[derive(Parser)]
#[command(name = "phasegate", about = "Phasegate: gated multi-agent work-item pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "phasegate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the configuration: pipelines, agents and capabilities
    Validate,
    /// List configured pipelines and their phases
    Pipelines,
    /// Submit a work item, wait until it settles and print it as JSON
    #[command(alias = "run")]
    Submit {
        /// Pipeline to run
        pipeline: String,
        /// Work item title
        title: String,
        /// Free-text description
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Print a work item as JSON, rebuilt from the audit trail
    Query {
        /// Work item id
        work_item: Uuid,
    },
    /// Re-run the phase a BLOCKED work item stopped at, wait and print it
    Restart {
        /// Work item id
        work_item: Uuid,
    },
    /// Cancel a BLOCKED work item and print it
    Cancel {
        /// Work item id
        work_item: Uuid,
    },
    /// Print the recorded audit trail of a work item
    Audit {
        /// Work item id
        work_item: Uuid,
        /// Audit file (defaults to the configured `audit_path`)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<PhasegateError>()
                .map_or(1, PhasegateError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = PipelineConfig::load(&cli.config)?;

    match cli.command {
        Commands::Validate => {
            let registry = config.build_registry()?;
            let catalog = config.catalog()?;
            catalog.validate_agents(&registry)?;
            println!(
                "{}: {} pipeline(s), {} agent(s) OK",
                cli.config.display(),
                catalog.len(),
                registry.agent_count()
            );
        }
        Commands::Pipelines => {
            let catalog = config.catalog()?;
            if catalog.is_empty() {
                println!("No pipelines configured.");
                println!("Declare them in phasegate.toml under [[pipelines]]");
            }
            for name in catalog.names() {
                let pipeline = catalog.get(name)?;
                println!("{name}");
                for (i, phase) in pipeline.phases.iter().enumerate() {
                    println!(
                        "  {}. {} (agent: {}, capabilities: [{}], max_retry: {}, timeout: {}s)",
                        i + 1,
                        phase.name,
                        phase.agent,
                        phase.capabilities,
                        phase.max_retry,
                        phase.timeout_secs
                    );
                }
            }
        }
        Commands::Submit {
            pipeline,
            title,
            description,
        } => {
            let engine = PipelineEngine::from_config(&config)?;
            let id = engine.submit(title, description, &pipeline)?;
            info!(work_item = %id, pipeline = %pipeline, "Waiting for work item");
            return wait_and_print(&engine, id).await;
        }
        Commands::Query { work_item } => {
            let engine = PipelineEngine::from_config(&config)?;
            let item = engine.query_recorded(work_item).await?;
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Commands::Restart { work_item } => {
            let engine = PipelineEngine::from_config(&config)?;
            engine.resume_blocked(work_item).await?;
            engine.restart_blocked(work_item).await?;
            return wait_and_print(&engine, work_item).await;
        }
        Commands::Cancel { work_item } => {
            let engine = PipelineEngine::from_config(&config)?;
            engine.resume_blocked(work_item).await?;
            engine.cancel(work_item)?;
            let item = engine.wait_terminal(work_item).await?;
            engine.audit().flush().await;
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Commands::Audit { work_item, path } => {
            let path = path.unwrap_or(config.engine.audit_path);
            let entries = AuditTrail::read_entries(&path, Some(work_item)).await?;
            if entries.is_empty() {
                return Err(
                    PhasegateError::NotFound(format!("No audit entries for {work_item}")).into(),
                );
            }
            for entry in &entries {
                println!("{}", serde_json::to_string(entry)?);
            }
        }
    }

    Ok(0)
}

/// Wait for the item to settle, print it and map BLOCKED to its exit code.
async fn wait_and_print(engine: &PipelineEngine, id: Uuid) -> anyhow::Result<u8> {
    let item = engine.wait(id).await?;
    engine.audit().flush().await;
    println!("{}", serde_json::to_string_pretty(&item)?);

    if item.status == WorkItemStatus::Blocked {
        return Ok(EXIT_BLOCKED);
    }
    Ok(0)
}
