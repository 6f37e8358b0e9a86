use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use wardloop_agent::{AgentLoopConfig, AgentLoopDeps, AgentLoopOptions, CompositeSandboxExecutor, run_agent_loop};
use wardloop_core::{AgentError, ChatSession, EventKind, ModelRegistry, TelemetryConfig};
use wardloop_llm::HttpChatCompletionAdapter;
use wardloop_observe::Observer;
use wardloop_store::{SessionStore, SqliteSessionStore};

#[derive(Parser)]
#[command(name = "wardloop", about = "Runs a local-model worker/main agent loop against a workspace")]
struct Cli {
    /// Workspace directory the agent operates in; defaults to the current directory.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent loop once against a goal and print the final answer.
    Run(RunArgs),
    /// Clear a session's stored messages.
    Reset(ResetArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// What the agent should accomplish.
    goal: String,
    /// Agent id to route through the model registry.
    #[arg(long, default_value = "default")]
    agent_id: String,
    /// Session id; reusing one resumes its prior conversation.
    #[arg(long, default_value = "default")]
    session_id: String,
    /// Print every loop event as it is published, not just the final answer.
    #[arg(long)]
    verbose: bool,
}

#[derive(clap::Args)]
struct ResetArgs {
    #[arg(long, default_value = "default")]
    session_id: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = cli.workspace.unwrap_or(std::env::current_dir()?);

    match cli.command {
        Command::Run(args) => run_once(&workspace, args),
        Command::Reset(args) => reset_session(&workspace, args),
    }
}

fn registry_path(workspace: &std::path::Path) -> PathBuf {
    wardloop_core::runtime_dir(workspace).join("agents.toml")
}

fn session_dir(workspace: &std::path::Path, session_id: &str) -> PathBuf {
    wardloop_core::runtime_dir(workspace).join("sessions").join(session_id)
}

fn run_once(workspace: &std::path::Path, args: RunArgs) -> Result<()> {
    let registry = ModelRegistry::ensure(&registry_path(workspace)).context("loading agent route registry")?;
    let adapter = HttpChatCompletionAdapter::new(Duration::from_secs(120)).context("building chat completion adapter")?;
    let sandbox = CompositeSandboxExecutor::new(workspace.to_path_buf());
    let store = SqliteSessionStore::new(&session_dir(workspace, &args.session_id)).context("opening session store")?;
    let observer = Observer::new(workspace, &TelemetryConfig::default()).context("initializing observer")?;
    let config = AgentLoopConfig::default();

    let mut deps = AgentLoopDeps {
        adapter: &adapter,
        sandbox: &sandbox,
        store: &store,
        observer: Some(&observer),
        registry: &registry,
        config: &config,
    };

    let mut session = store.load_or_create(&args.session_id, None).context("loading session")?;

    let verbose = args.verbose;
    let mut on_event = |envelope: &wardloop_core::EventEnvelope| print_event(&envelope.kind, verbose);
    let mut ask_user = |question: &str| -> std::result::Result<String, AgentError> {
        print!("{question}\n> ");
        io::stdout().flush().ok();
        let mut line = String::new();
        io::stdin()
            .read_line(&mut line)
            .map_err(|e| AgentError::ConfigError(format!("failed to read answer from stdin: {e}")))?;
        Ok(line.trim().to_string())
    };

    let options = AgentLoopOptions {
        on_event: Some(&mut on_event),
        ask_user: Some(&mut ask_user),
        ..AgentLoopOptions::default()
    };

    let summary = run_agent_loop(&mut deps, &mut session, &args.goal, &args.agent_id, options)?;

    println!("\n{}", summary.summary);
    Ok(())
}

fn reset_session(workspace: &std::path::Path, args: ResetArgs) -> Result<()> {
    let store = SqliteSessionStore::new(&session_dir(workspace, &args.session_id)).context("opening session store")?;
    store.reset(&args.session_id, None).context("resetting session")?;
    println!("session '{}' reset", args.session_id);
    Ok(())
}

fn print_event(kind: &EventKind, verbose: bool) {
    match kind {
        EventKind::WorkerToken { token, .. } | EventKind::MainToken { token, .. } => {
            print!("{token}");
            io::stdout().flush().ok();
        }
        EventKind::PlanningResult { next, reason, .. } if verbose => {
            println!("\n[planning] next={next:?} reason={reason}");
        }
        EventKind::ToolStart { cmd, .. } if verbose => {
            println!("\n[tool] $ {cmd}");
        }
        EventKind::ToolResult { exit_code, .. } if verbose => {
            println!("[tool] exit={exit_code}");
        }
        EventKind::CompactionStart { .. } if verbose => {
            println!("\n[context] compacting session history");
        }
        EventKind::Ask { question, .. } => {
            println!("\n[ask] {question}");
        }
        EventKind::Complete { steps, evidence_count } if verbose => {
            println!("\n[done] steps={steps} evidence={evidence_count}");
        }
        _ => {}
    }
}
