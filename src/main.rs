use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use maestro::config::Config;
use maestro::orchestration::{
    LoggingSink, ParallelExecutor, ShellExecutor, TaskRouter, WorkflowCoordinator, SHELL_KIND,
};
use maestro::recovery::CircuitBreakerRegistry;
use maestro::state::{MemoryBackend, StateStore};
use maestro::workflow::{WorkflowDefinition, WorkflowId, WorkflowState, WorkflowStatus};
use maestro::{Error, Result};

/// Maestro - dependency-aware workflow runner with retries and circuit breaking
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.maestro/maestro.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a workflow definition without running it
    Validate {
        /// Workflow definition (.json or .toml)
        file: PathBuf,
    },

    /// Print the execution levels of a workflow
    Plan {
        /// Workflow definition (.json or .toml)
        file: PathBuf,
    },

    /// Run a workflow of shell tasks
    Run {
        /// Workflow definition (.json or .toml)
        file: PathBuf,

        /// Override the worker limit from the config
        #[arg(long)]
        max_workers: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    maestro::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Validate { file } => run_validate(&file),
        Command::Plan { file } => run_plan(&file),
        Command::Run { file, max_workers } => {
            let config = match &cli.config {
                Some(path) => Config::load_from(path)?,
                None => Config::load()?,
            };
            let state = run_workflow(&file, config, max_workers)?;
            if state.status != WorkflowStatus::Completed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn run_validate(file: &Path) -> Result<()> {
    let definition = WorkflowDefinition::load(file)?;
    let graph = definition.plan()?;
    println!(
        "{}: ok ({} tasks, {} dependencies)",
        definition.id,
        graph.task_count(),
        graph.dependency_count()
    );
    Ok(())
}

fn run_plan(file: &Path) -> Result<()> {
    let definition = WorkflowDefinition::load(file)?;
    let levels = definition.plan()?.topological_levels()?;

    println!("Workflow: {}", definition.id);
    for level in &levels {
        let ids: Vec<String> = level.tasks.iter().map(|id| id.to_string()).collect();
        println!("  Level {}: {}", level.index, ids.join(", "));
    }
    Ok(())
}

/// Run a workflow with the shell backend and print its final state as JSON.
fn run_workflow(file: &Path, config: Config, max_workers: Option<usize>) -> Result<WorkflowState> {
    let definition = WorkflowDefinition::load(file)?;

    let mut executor_config = config.executor_config();
    if let Some(n) = max_workers {
        executor_config.max_workers = n.max(1);
    }
    let mut executor = ParallelExecutor::new(executor_config).with_policy(config.recovery_policy());
    if let Some(breakers) = config.circuit_breaker_config() {
        executor = executor.with_breakers(Arc::new(CircuitBreakerRegistry::new(breakers)));
    }

    let cwd = std::env::current_dir()?;
    let router = TaskRouter::new().route(SHELL_KIND, Arc::new(ShellExecutor::new().with_cwd(cwd)));
    let store = StateStore::new(Arc::new(MemoryBackend::new()), config.state_config());

    let rt = tokio::runtime::Runtime::new()?;
    let state = rt.block_on(async {
        let coordinator = WorkflowCoordinator::new(executor, Arc::new(router), store)
            .with_sink(Arc::new(LoggingSink));
        let workflow_id = coordinator.start(&definition).await?;
        info!(workflow_id = %workflow_id, file = %file.display(), "running workflow");

        let state = tokio::select! {
            state = wait_until_done(&coordinator, &workflow_id) => state?,
            _ = tokio::signal::ctrl_c() => {
                warn!(workflow_id = %workflow_id, "interrupted, cancelling");
                coordinator.cancel(&workflow_id).await?;
                wait_until_done(&coordinator, &workflow_id).await?
            }
        };
        coordinator.close().await;
        Ok::<_, Error>(state)
    })?;

    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(state)
}

/// `wait_for_completion` without a deadline.
async fn wait_until_done(coordinator: &WorkflowCoordinator, workflow_id: &WorkflowId) -> Result<WorkflowState> {
    loop {
        match coordinator.wait_for_completion(workflow_id).await {
            Err(Error::WorkflowTimeout { .. }) => continue,
            other => return other,
        }
    }
}
