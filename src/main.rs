use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agentflow_core::config::{expand_home, AppConfig};
use agentflow_core::event::EventBus;
use agentflow_core::traits::{FlowStore, LlmClient, RunStore};
use agentflow_core::types::{FlowDefinition, RunStatus};
use agentflow_engine::{unreachable_nodes, FlowEngine, RunLogger};
use agentflow_nodes::HandlerRegistry;
use agentflow_store::SqliteStore;

#[derive(Parser)]
#[command(name = "agentflow", version, about = "Run graphs of prompt, code and LLM nodes")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentflow.toml", env = "AGENTFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow and print its execution record
    Run {
        /// Flow JSON file, or the id of a stored flow
        flow: String,
        /// Initial input (JSON) handed to start nodes
        #[arg(short, long)]
        input: Option<String>,
        /// Store the flow definition before running it
        #[arg(long)]
        save: bool,
    },
    /// Check a flow file without executing it
    Validate {
        /// Flow JSON file
        file: PathBuf,
    },
    /// List the available node types
    NodeTypes,
    /// Manage stored flows
    Flows {
        #[command(subcommand)]
        action: FlowAction,
    },
    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum FlowAction {
    /// List stored flows
    List,
    /// Print a stored flow as JSON
    Show { id: String },
    /// Store (or replace) a flow from a JSON file
    Put { file: PathBuf },
    /// Delete a stored flow
    Delete { id: String },
}

#[derive(Subcommand)]
enum RunAction {
    /// List runs of a flow, newest first
    List { flow_id: String },
    /// Print one execution record
    Show { run_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries JSON output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("AGENTFLOW_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("agentflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "agentflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        Commands::NodeTypes => {
            let registry = build_registry(&config);
            println!("{}", serde_json::to_string_pretty(&registry.catalog())?);
        }
        Commands::Validate { file } => {
            let flow = read_flow(&file)?;
            let engine = FlowEngine::new(Arc::new(build_registry(&config)), config.engine.clone());
            match engine.validate(&flow) {
                Ok(order) => {
                    for id in unreachable_nodes(&flow) {
                        println!("warning: node '{}' is not reachable from any start node", id);
                    }
                    println!("ok: execution order {}", order.join(" -> "));
                }
                Err(e) => bail!("invalid flow '{}': {}", flow.id, e),
            }
        }
        Commands::Run { flow, input, save } => {
            let store = Arc::new(open_store(&config)?);
            let flow = match Path::new(&flow).exists() {
                true => read_flow(Path::new(&flow))?,
                false => FlowStore::get(store.as_ref(), &flow)
                    .await?
                    .with_context(|| format!("no flow file or stored flow named '{}'", flow))?,
            };
            let flow = if save { store.put(flow).await? } else { flow };
            let initial_input = input
                .map(|raw| serde_json::from_str(&raw).context("--input is not valid JSON"))
                .transpose()?;

            let status = run_flow(&config, store, flow, initial_input).await?;
            if status != RunStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Flows { action } => {
            let store = open_store(&config)?;
            match action {
                FlowAction::List => {
                    for flow in store.list().await? {
                        println!(
                            "{}\t{}\t{} nodes\t{}",
                            flow.id,
                            flow.name,
                            flow.nodes.len(),
                            flow.updated_at.map(|t| t.to_rfc3339()).unwrap_or_default()
                        );
                    }
                }
                FlowAction::Show { id } => {
                    let flow = FlowStore::get(&store, &id)
                        .await?
                        .with_context(|| format!("flow not found: {}", id))?;
                    println!("{}", serde_json::to_string_pretty(&flow)?);
                }
                FlowAction::Put { file } => {
                    let stored = store.put(read_flow(&file)?).await?;
                    println!("stored flow '{}'", stored.id);
                }
                FlowAction::Delete { id } => {
                    if !store.delete(&id).await? {
                        bail!("flow not found: {}", id);
                    }
                    println!("deleted flow '{}'", id);
                }
            }
        }
        Commands::Runs { action } => {
            let store = open_store(&config)?;
            match action {
                RunAction::List { flow_id } => {
                    for run in store.list_for_flow(&flow_id).await? {
                        println!(
                            "{}\t{}\t{}\t{}ms",
                            run.id,
                            run.status,
                            run.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                            run.duration_ms().unwrap_or(0)
                        );
                    }
                }
                RunAction::Show { run_id } => {
                    let run = RunStore::get(&store, &run_id)
                        .await?
                        .with_context(|| format!("run not found: {}", run_id))?;
                    println!("{}", serde_json::to_string_pretty(&run)?);
                }
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run_flow(
    config: &AppConfig,
    store: Arc<SqliteStore>,
    flow: FlowDefinition,
    initial_input: Option<serde_json::Value>,
) -> anyhow::Result<RunStatus> {
    let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
    let cancel = CancellationToken::new();

    let logger_task = config.log_dir().map(|log_dir| {
        let logger = RunLogger::new(log_dir);
        info!(path = %logger.log_path(&flow.id).display(), "Writing run log");
        tokio::spawn(logger.run(event_bus.clone(), flow.id.clone(), Some(1), cancel.child_token()))
    });

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            ctrl_c.cancel();
        }
    });

    let engine = FlowEngine::new(Arc::new(build_registry(config)), config.engine.clone())
        .with_events(event_bus)
        .with_run_store(store);
    let run = engine.execute_with_cancel(&flow, initial_input, cancel).await;

    if let Some(task) = logger_task {
        task.await.ok();
    }

    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(run.status)
}

fn build_registry(config: &AppConfig) -> HandlerRegistry {
    let llm: Arc<dyn LlmClient> = Arc::new(agentflow_llm::create_retrying_client(&config.model));
    HandlerRegistry::with_builtins(config, llm)
}

fn open_store(config: &AppConfig) -> anyhow::Result<SqliteStore> {
    let path = config.store_path();
    SqliteStore::open(&path).with_context(|| format!("opening store at {}", path.display()))
}

fn read_flow(path: &Path) -> anyhow::Result<FlowDefinition> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading flow file {}", path.display()))?;
    FlowDefinition::from_json(&json).with_context(|| format!("parsing flow file {}", path.display()))
}

/// Explicit path, then `~/.agentflow/config.toml`, then defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = expand_home("~/.agentflow/config.toml");
    if home_config.exists() {
        info!(path = %home_config.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }
    Ok(env_config())
}

/// Defaults, with the API key taken from the environment.
fn env_config() -> AppConfig {
    let mut config = AppConfig::default();
    if let Ok(provider) = std::env::var("AGENTFLOW_PROVIDER") {
        config.model.provider = provider;
    }
    let key_var = match config.model.provider.as_str() {
        "anthropic" | "claude" => "ANTHROPIC_API_KEY",
        _ => "OPENAI_API_KEY",
    };
    config.model.api_key = std::env::var(key_var).ok();
    config
}
