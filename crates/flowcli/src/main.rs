// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use flowcore::{
    Connection, ExecutionEvent, ItemSet, NodeEvent, NodeSpec, ResumeKey, RunState, RunStatus,
    Workflow,
};
use flowruntime::{FileStore, FlowRuntime, RuntimeConfig};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Directory holding workflows and run state
    #[arg(long, global = true, default_value = ".flow")]
    store: PathBuf,

    /// Runtime configuration file
    #[arg(long, global = true, default_value = "flow.toml")]
    config: PathBuf,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input items as a JSON object or array of objects
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Resume a waiting run
    Resume {
        /// Resume key reported when the run started waiting
        #[arg(short, long, required_unless_present = "expired")]
        key: Option<String>,

        /// Items handed to the waiting node, as JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Resume every run whose wait has expired
        #[arg(long, conflicts_with = "key")]
        expired: bool,
    },

    /// Show the state of a run
    Status {
        run_id: Uuid,

        /// Print the full run state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cancel a waiting run
    Cancel { run_id: Uuid },

    /// Store a workflow so sub-workflow nodes can call it
    Register {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    match cli.command {
        Commands::Run { file, input } => {
            let runtime = build_runtime(&cli.global).await?;
            run_workflow(&runtime, &file, input).await?;
        }

        Commands::Resume {
            key,
            input,
            expired,
        } => {
            let runtime = build_runtime(&cli.global).await?;
            if expired {
                resume_expired(&runtime).await?;
            } else if let Some(key) = key {
                resume_run(&runtime, ResumeKey::from(key), input).await?;
            }
        }

        Commands::Status { run_id, json } => {
            let runtime = build_runtime(&cli.global).await?;
            let state = runtime.get_run_state(run_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                print_summary(&state);
            }
        }

        Commands::Cancel { run_id } => {
            let runtime = build_runtime(&cli.global).await?;
            runtime.cancel_run(run_id).await?;
            println!("🛑 Run {} canceled", run_id);
        }

        Commands::Register { file } => {
            register_workflow(&cli.global, &file).await?;
        }

        Commands::Validate { file } => {
            let runtime = build_runtime(&cli.global).await?;
            validate_workflow(&runtime, &file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }
    }

    Ok(())
}

async fn build_runtime(global: &GlobalArgs) -> Result<FlowRuntime> {
    let config = RuntimeConfig::load(&global.config)
        .with_context(|| format!("Failed to load config {}", global.config.display()))?;
    let store = FileStore::open(&global.store)
        .await
        .with_context(|| format!("Failed to open store {}", global.store.display()))?;

    let runtime = FlowRuntime::builder()
        .registry(flownodes::standard_registry())
        .store(Arc::new(store))
        .config(config)
        .build();

    let recovered = runtime.recover_waiting().await?;
    if recovered > 0 {
        tracing::debug!("Recovered {} waiting run(s)", recovered);
    }
    Ok(runtime)
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let workflow: Workflow = serde_json::from_str(&workflow_json)
        .with_context(|| format!("Invalid workflow JSON in {}", file.display()))?;
    Ok(workflow)
}

/// Parse input items: an object becomes one item, an array one item per element
fn parse_items(input: Option<String>) -> Result<ItemSet> {
    let Some(input_str) = input else {
        return Ok(ItemSet::from_json([json!({})]));
    };
    match serde_json::from_str::<serde_json::Value>(&input_str)? {
        serde_json::Value::Array(values) => Ok(ItemSet::from_json(values)),
        value @ serde_json::Value::Object(_) => Ok(ItemSet::from_json([value])),
        _ => bail!("Input must be a JSON object or an array of objects"),
    }
}

/// Print run events as they arrive until the returned handle is aborted
fn spawn_event_printer(runtime: &FlowRuntime) -> tokio::task::JoinHandle<()> {
    let mut events = runtime.subscribe_events();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::RunStarted { run_id, .. } => {
                    println!("▶️  Run {} started", run_id);
                }
                ExecutionEvent::RunResumed { node, .. } => {
                    println!("⏯️  Resumed at node: {}", node);
                }
                ExecutionEvent::NodeStarted {
                    node,
                    node_type,
                    attempt,
                    ..
                } => {
                    if attempt > 0 {
                        println!("  🔁 Retrying node: {} (attempt {})", node, attempt + 1);
                    } else {
                        println!("  ⚡ Starting node: {} ({})", node, node_type);
                    }
                }
                ExecutionEvent::NodeCompleted {
                    node, duration_ms, ..
                } => {
                    println!("  ✅ Node {} completed in {}ms", node, duration_ms);
                }
                ExecutionEvent::NodeFailed { node, error, .. } => {
                    println!("  ❌ Node {} failed: {}", node, error);
                }
                ExecutionEvent::NodeEvent { node, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", node, message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", node, message);
                    }
                    NodeEvent::Progress { percent, message } => {
                        if let Some(msg) = message {
                            println!("     📊 [{}] {}% - {}", node, percent, msg);
                        } else {
                            println!("     📊 [{}] {}%", node, percent);
                        }
                    }
                },
                ExecutionEvent::RunWaiting { resume_keys, .. } => {
                    for key in resume_keys {
                        println!("⏸️  Waiting on resume key: {}", key);
                    }
                }
                ExecutionEvent::RunFinished {
                    status,
                    duration_ms,
                    ..
                } => match status {
                    RunStatus::Success => {
                        println!("✨ Run completed successfully in {}ms", duration_ms)
                    }
                    other => println!("💥 Run finished as {} after {}ms", other, duration_ms),
                },
            }
        }
    })
}

async fn finish_printing(event_task: tokio::task::JoinHandle<()>) {
    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();
}

async fn run_workflow(runtime: &FlowRuntime, file: &Path, input: Option<String>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow(file)?;
    let items = parse_items(input)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let event_task = spawn_event_printer(runtime);
    let state = runtime.start_run(&workflow, items).await?;
    finish_printing(event_task).await;

    print_summary(&state);
    Ok(())
}

async fn resume_run(runtime: &FlowRuntime, key: ResumeKey, input: Option<String>) -> Result<()> {
    let items = parse_items(input)?;

    let event_task = spawn_event_printer(runtime);
    let state = runtime.resume_run(&key, items).await?;
    finish_printing(event_task).await;

    print_summary(&state);
    Ok(())
}

async fn resume_expired(runtime: &FlowRuntime) -> Result<()> {
    let event_task = spawn_event_printer(runtime);
    let states = runtime.resume_expired(chrono::Utc::now()).await?;
    finish_printing(event_task).await;

    if states.is_empty() {
        println!("No expired waits");
    }
    for state in &states {
        print_summary(state);
    }
    Ok(())
}

fn print_summary(state: &RunState) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Run ID: {}", state.run_id);
    println!("   Workflow: {} ({})", state.workflow_name, state.workflow_id);
    println!("   Status: {}", state.status);
    println!("   Nodes executed: {}", state.run_data.len());

    if let Some(error) = &state.error {
        println!();
        println!("💥 Error: {}", error.message);
        if let Some(node) = &error.node {
            println!("   Node: {} ({} attempt(s))", node, error.attempts);
        }
    }

    for wait in &state.waiting {
        println!("   ⏸️  {} waits on {}", wait.node, wait.resume_key);
    }

    let output = state.final_output();
    if !output.is_empty() {
        println!();
        println!("📤 Output:");
        for value in output.json_values() {
            println!("   {}", value);
        }
    }
}

async fn register_workflow(global: &GlobalArgs, file: &Path) -> Result<()> {
    let workflow = load_workflow(file)?;

    let registry = flownodes::standard_registry();
    let runtime = FlowRuntime::builder().registry(registry).build();
    runtime
        .validate(&workflow)
        .with_context(|| format!("Workflow {} is invalid", workflow.name))?;

    let store = FileStore::open(&global.store).await?;
    store.save_workflow(&workflow).await?;

    println!("📥 Registered workflow: {}", workflow.name);
    println!("   ID: {}", workflow.id);
    Ok(())
}

fn validate_workflow(runtime: &FlowRuntime, file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(file)?;
    runtime.validate(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = flownodes::standard_registry();

    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = Workflow::new("Example Approval Workflow");
    workflow.description =
        Some("Routes large orders to a manual approval step".to_string());

    let trigger = workflow.add_node(
        NodeSpec::new("Start", "trigger.manual").with_position(100.0, 100.0),
    );
    let check = workflow.add_node(
        NodeSpec::new("Large Order", "flow.if")
            .with_parameter("condition", "={{ json.amount > 100 }}")
            .with_position(300.0, 100.0),
    );
    let approval = workflow.add_node(
        NodeSpec::new("Await Approval", "flow.wait")
            .with_parameter("path", "approval")
            .with_position(500.0, 50.0),
    );
    let merge = workflow.add_node(
        NodeSpec::new("Join", "flow.merge").with_position(700.0, 100.0),
    );
    let log = workflow.add_node(
        NodeSpec::new("Log Order", "debug.log")
            .with_parameter("message", "=Order {{ json.id }} processed")
            .with_position(900.0, 100.0),
    );

    workflow.connect_main(&trigger, &check);
    workflow
        .connections
        .push(Connection::new(&check, &approval).from_output("true"));
    workflow
        .connections
        .push(Connection::new(&approval, &merge).to_input("input1"));
    workflow.connections.push(
        Connection::new(&check, &merge)
            .from_output("false")
            .to_input("input2"),
    );
    workflow.connect_main(&merge, &log);

    // Save to file
    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '{{\"id\": 7, \"amount\": 250}}'",
        output.display()
    );

    Ok(())
}
