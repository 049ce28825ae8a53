//! `stepflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    start the HTTP API.
//! - `run`      execute a workflow file in-process and print its final state.
//! - `validate` check a workflow file and print its execution order.
//! - `migrate`  apply the Postgres migrations.

mod config;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use actions::ActionRegistry;
use engine::{
    ExecutionStatus, MemoryStateStore, StateStore, TracingNotifier, WorkflowDefinition,
    WorkflowEngine,
};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "stepflow", about = "Graph workflow execution engine", version)]
struct Cli {
    /// TOML settings file.
    #[arg(long, global = true, env = "STEPFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Override `engine.max_concurrent_steps`.
    #[arg(long, global = true, env = "STEPFLOW_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long, env = "STEPFLOW_BIND")]
        bind: Option<String>,
        /// Persist executions in Postgres instead of memory.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Execute a workflow with the built-in actions and print the final state.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Initial inputs as a JSON object.
        #[arg(long)]
        inputs: Option<String>,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(max) = cli.max_concurrency {
        settings.engine.max_concurrent_steps = max;
    }

    match cli.command {
        Command::Serve { bind, database_url } => {
            if let Some(bind) = bind {
                settings.server.bind = bind;
            }
            if database_url.is_some() {
                settings.database.url = database_url;
            }
            serve(settings).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { path, inputs } => run(settings, &path, inputs.as_deref()).await,
        Command::Validate { path } => {
            let definition = read_definition(&path)?;
            match engine::validate_dag(&definition) {
                Ok(order) => {
                    println!("workflow '{}' is valid, execution order: {order:?}", definition.id);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("validation failed: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Migrate { database_url } => {
            let pool = db::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::run_migrations(&pool).await.context("migration failed")?;
            info!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let addr: SocketAddr = settings
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.server.bind))?;

    let store: Arc<dyn StateStore> = match &settings.database.url {
        Some(url) => {
            let pool = db::create_pool(url, settings.database.max_connections)
                .await
                .context("failed to connect to database")?;
            info!("using Postgres execution store");
            Arc::new(db::PgStateStore::new(pool))
        }
        None => {
            info!("no database configured, executions are kept in memory");
            Arc::new(MemoryStateStore::new())
        }
    };

    let engine = WorkflowEngine::new(
        Arc::new(ActionRegistry::with_builtins()),
        store,
        Arc::new(TracingNotifier),
        settings.engine,
    );
    api::serve(addr, api::AppState::new(engine))
        .await
        .context("HTTP server stopped")
}

async fn run(settings: Settings, path: &Path, inputs: Option<&str>) -> Result<ExitCode> {
    let definition = read_definition(path)?;
    let inputs = match inputs {
        Some(raw) => serde_json::from_str::<Map<String, Value>>(raw)
            .context("--inputs must be a JSON object")?,
        None => Map::new(),
    };

    let engine = WorkflowEngine::new(
        Arc::new(ActionRegistry::with_builtins()),
        Arc::new(MemoryStateStore::new()),
        Arc::new(TracingNotifier),
        settings.engine,
    );
    let state = engine
        .execute(&definition, inputs)
        .await
        .with_context(|| format!("workflow '{}' could not run", definition.id))?;

    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(if state.status == ExecutionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_definition(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read workflow file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid workflow definition in {}", path.display()))
}
