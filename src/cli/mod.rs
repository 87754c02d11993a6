pub mod config;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::progress::ProgressEvent;
use crate::engine::types::{ExecutionState, FlowStatus, RunInputs};
use crate::engine::{EngineError, StartOptions, campaign_graph, time_budget};
use crate::storage::validate_run_key;

use self::config::{CampaignFlowConfig, ProviderKind, StoreKind};

#[derive(Parser)]
#[command(
    name = "campaignflow",
    version,
    about = "Resumable campaign optimisation workflow"
)]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to the YAML config (default: auto-detect campaignflow.yaml in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage backend
    #[arg(long, global = true, value_enum, env = "CAMPAIGNFLOW_STORE")]
    store: Option<StoreKind>,

    /// Directory of the JSON file store
    #[arg(long, global = true, env = "CAMPAIGNFLOW_STORE_DIR")]
    store_dir: Option<String>,

    /// Database URL of the SQLite store
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Decision provider used by the router node
    #[arg(long, global = true, value_enum, env = "CAMPAIGNFLOW_PROVIDER")]
    provider: Option<ProviderKind>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run, resume or start a new session of a project
    ///
    /// Only one process may drive a given project at a time. Two runs of the
    /// same project are refused inside one process, but `run` and `serve` on
    /// the same store do not see each other: do not run a project from the
    /// command line while a server on that store may be running it.
    Run {
        /// Project key
        #[arg(short, long)]
        project: String,

        /// Data file uploaded for this session (repeatable)
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,

        /// User context as a JSON object, e.g. '{"target_budget": 150}'
        #[arg(short, long)]
        context: Option<String>,

        /// Discard flow progress and start at the entry node
        #[arg(long)]
        restart: bool,

        /// Stop the run after this many seconds (progress so far is kept)
        #[arg(long)]
        timeout_s: Option<f64>,

        /// Print every message, not just the latest per node
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show the latest checkpoint of a project
    Inspect {
        /// Project key
        project: String,
    },

    /// List projects
    List {
        /// Filter by status (not_started, in_progress, completed, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Delete every stored record of a project
    Delete {
        /// Project key
        project: String,
    },

    /// Print the workflow graph
    Graph,

    /// Start the REST API server
    ///
    /// The server refuses a second run of a project it is already running.
    /// It cannot see runs started by another process on the same store, so
    /// keep `campaignflow run` away from projects the server may be running.
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    load_dotenv(cli.dotenv.as_deref());

    let mut config = CampaignFlowConfig::load(cli.config.as_deref())?;
    if cli.store.is_some() {
        config.store = cli.store;
    }
    if cli.store_dir.is_some() {
        config.store_dir = cli.store_dir;
    }
    if cli.database_url.is_some() {
        config.database_url = cli.database_url;
    }
    if cli.provider.is_some() {
        config.decision_provider = cli.provider;
    }

    match cli.command {
        Commands::Run {
            project,
            files,
            context,
            restart,
            timeout_s,
            verbose,
        } => cmd_run(&config, project, files, context, restart, timeout_s, verbose).await,
        Commands::Inspect { project } => cmd_inspect(&config, project).await,
        Commands::List { status, format } => cmd_list(&config, status, format).await,
        Commands::Delete { project } => cmd_delete(&config, project).await,
        Commands::Graph => cmd_graph(),
        Commands::Serve { host, port } => {
            if host.is_some() {
                config.host = host;
            }
            if port.is_some() {
                config.port = port;
            }
            crate::api::serve(config).await
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path.
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

/// Parse `--context` into a JSON object.
pub fn parse_context(raw: Option<&str>) -> Result<serde_json::Map<String, serde_json::Value>> {
    match raw {
        None => Ok(serde_json::Map::new()),
        Some(json) => {
            let value: serde_json::Value =
                serde_json::from_str(json).context("Failed to parse --context JSON")?;
            match value {
                serde_json::Value::Object(map) => Ok(map),
                _ => anyhow::bail!("--context must be a JSON object"),
            }
        }
    }
}

fn render_event(event: &ProgressEvent, verbose: bool) {
    match event {
        ProgressEvent::RunStarted {
            run_key,
            session_num,
            entry,
            mode,
        } => println!(
            "Project {} (session {}): {} from '{}'",
            run_key, session_num, mode, entry
        ),
        ProgressEvent::NodeStarted { node, index, .. } => {
            println!("  [{}] {} ...", index + 1, node)
        }
        ProgressEvent::NodeCompleted {
            node,
            elapsed_ms,
            last_message,
            ..
        } => {
            println!("  ✓ {} ({}ms)", node, elapsed_ms);
            if let Some(msg) = last_message {
                println!("      {}", msg);
            }
        }
        ProgressEvent::NodeFailed { node, error, .. } => println!("  ✗ {}: {}", node, error),
        ProgressEvent::Routed { decision, next, .. } => {
            println!("  → decision '{}' routes to {}", decision, next)
        }
        ProgressEvent::Message { text, .. } => {
            if verbose {
                println!("      {}", text);
            }
        }
        ProgressEvent::RunFinished { status, .. } => println!("Status: {}", status),
    }
}

fn print_summary(state: &ExecutionState, verbose: bool) {
    println!("\nCompleted nodes: {}", state.completed_nodes.join(" → "));
    if let Some(decision) = &state.decision {
        println!(
            "Decision: {} ({})",
            decision,
            state.decision_reasoning.as_deref().unwrap_or("")
        );
    }
    for key in ["current_phase", "iteration", "threshold_status"] {
        if let Some(value) = state.field(key) {
            println!("{}: {}", key, value);
        }
    }
    if verbose {
        println!("\nMessages:");
        for msg in &state.messages {
            println!("  {}", msg);
        }
    }
    if !state.errors.is_empty() {
        println!("\nErrors:");
        for err in &state.errors {
            println!("  {}", err);
        }
    }
}

fn print_failure(project: &str, err: &EngineError) {
    println!("\nRun stopped: {}", err);
    if let Some(node) = err.failed_node() {
        println!("Failing node: {}", node);
    }
    if let Some(state) = err.state() {
        if !state.messages.is_empty() {
            println!("\nMessages:");
            for msg in &state.messages {
                println!("  {}", msg);
            }
        }
        if !state.errors.is_empty() {
            println!("\nErrors:");
            for e in &state.errors {
                println!("  {}", e);
            }
        }
    }
    if err.is_resumable() {
        println!(
            "\nProgress is saved. Resume with: campaignflow run --project {}",
            project
        );
    }
}

async fn cmd_run(
    config: &CampaignFlowConfig,
    project: String,
    files: Vec<PathBuf>,
    context: Option<String>,
    restart: bool,
    timeout_s: Option<f64>,
    verbose: bool,
) -> Result<()> {
    validate_run_key(&project)?;
    let deadline = time_budget(timeout_s).context("Invalid --timeout-s")?;
    for file in &files {
        if !file.exists() {
            anyhow::bail!("File not found: {}", file.display());
        }
    }
    let inputs = RunInputs {
        files,
        context: parse_context(context.as_deref())?,
    };

    let engine = config.build_engine().await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received, abandoning the current node");
            on_signal.cancel();
        }
    });

    let done = CancellationToken::new();
    let printer_done = done.clone();
    let mut rx = engine.events().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => render_event(&event, verbose),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = printer_done.cancelled() => {
                    loop {
                        match rx.try_recv() {
                            Ok(event) => render_event(&event, verbose),
                            Err(TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
    });

    let options = StartOptions {
        force_restart: restart,
        cancel: Some(cancel),
        deadline,
    };
    let result = engine.start(&project, inputs, options).await;

    done.cancel();
    let _ = printer.await;

    match result {
        Ok(state) => {
            print_summary(&state, verbose);
            Ok(())
        }
        Err(e) => {
            print_failure(&project, &e);
            Err(e.into())
        }
    }
}

async fn cmd_inspect(config: &CampaignFlowConfig, project: String) -> Result<()> {
    validate_run_key(&project)?;
    let store = config.open_store().await?;

    let checkpoint = store
        .load_checkpoint(&project)
        .await?
        .with_context(|| format!("Project '{}' not found", project))?;

    println!("{}", serde_json::to_string_pretty(&checkpoint)?);

    if let Some(snapshot) = store.load_snapshot(&project).await? {
        println!(
            "\nProject record saved at {} (session {})",
            snapshot.saved_at.format("%Y-%m-%d %H:%M:%S"),
            snapshot.session_num
        );
    }
    Ok(())
}

async fn cmd_list(config: &CampaignFlowConfig, status: Option<String>, format: String) -> Result<()> {
    let status = status
        .as_deref()
        .map(|s| FlowStatus::parse(s).ok_or_else(|| anyhow::anyhow!("Invalid status filter: {}", s)))
        .transpose()?;

    let store = config.open_store().await?;
    let checkpoints = store.list_checkpoints(status).await?;

    if checkpoints.is_empty() {
        println!("No projects found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<8} {:<12} {:<16} {:<20}",
        "PROJECT", "SESSION", "STATUS", "LAST NODE", "SAVED"
    );
    println!("{}", "-".repeat(84));

    for cp in &checkpoints {
        println!(
            "{:<24} {:<8} {:<12} {:<16} {:<20}",
            cp.run_key,
            cp.session_num,
            cp.flow_status,
            cp.last_completed_node.as_deref().unwrap_or("-"),
            cp.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} project(s)", checkpoints.len());
    Ok(())
}

async fn cmd_delete(config: &CampaignFlowConfig, project: String) -> Result<()> {
    validate_run_key(&project)?;
    let store = config.open_store().await?;
    store.delete_run(&project).await?;
    println!("Deleted project '{}'", project);
    Ok(())
}

fn cmd_graph() -> Result<()> {
    let graph = campaign_graph();

    println!("Entry:    {}", graph.entry());
    println!("Branch:   {}", graph.branch());
    println!("Terminal: {}", graph.terminal());

    println!("\nEdges:");
    for (from, to) in graph.edges() {
        println!("  {} → {}", from, to);
    }

    let routes = graph.routes();
    println!("\nRoutes from {}:", graph.branch());
    println!("  initialize → {}", routes.initialize);
    println!("  reflect    → {}", routes.reflect);
    println!("  enrich     → {}", routes.enrich);
    for (phase, next) in &routes.continue_by_phase {
        println!("  continue ({}) → {}", phase, next);
    }
    println!("  otherwise  → {}", routes.fallback);
    Ok(())
}
