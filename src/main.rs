// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! afk main entry point - daemon and inspection commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};

use afk::agent::{AgentRuntime, CodexRuntime, StreamJsonRuntime};
use afk::config::{self, AgentRuntimeKind, CliOptions, ResolvedConfig};
use afk::events::{EventBus, EventKind, EventLevel, SessionEvent};
use afk::projects::ConfiguredProjects;
use afk::session::{ManagerDeps, ManagerOptions, SessionManager, SessionState, SessionStore};
use afk::telemetry::{init_telemetry, TelemetryConfig};
#[cfg(feature = "telemetry")]
use afk::telemetry::GLOBAL_METRICS;
use afk::workspace::{provider_for, CommitMessageProvider, GitWorktreeIsolator, WorkspaceLayout};
use afk::Commands;

/// afk version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// afk - run AI agent sessions in isolated git worktrees.
#[derive(Parser)]
#[command(name = "afk")]
#[command(author, version, about = "Away-from-keyboard agent daemon", long_about = None)]
struct Cli {
    /// Config file (JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (sessions database and logs)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Show debug output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Subcommands for afk.
#[derive(Subcommand)]
enum Command {
    /// Run the daemon until Ctrl-C
    Run {
        /// Also append logs to this file
        #[arg(long, env = "AFK_LOG_FILE")]
        log_file: Option<PathBuf>,

        /// Branch sessions merge into
        #[arg(long)]
        main_branch: Option<String>,

        /// Agent CLI family: claude or codex
        #[arg(long)]
        agent: Option<AgentRuntimeKind>,

        /// Agent CLI to launch
        #[arg(long)]
        agent_program: Option<String>,

        /// Auto-deny unanswered permission requests after this many seconds
        #[arg(long)]
        permission_timeout_secs: Option<u64>,

        /// Directory searched for projects by name
        #[arg(long)]
        projects_root: Option<PathBuf>,
    },

    /// List persisted sessions
    Sessions {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show resolved configuration
    Config,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cli_options = CliOptions {
        data_dir: cli.data_dir.clone(),
        ..CliOptions::default()
    };

    match cli.command.unwrap_or(Command::Run {
        log_file: None,
        main_branch: None,
        agent: None,
        agent_program: None,
        permission_timeout_secs: None,
        projects_root: None,
    }) {
        Command::Run {
            log_file,
            main_branch,
            agent,
            agent_program,
            permission_timeout_secs,
            projects_root,
        } => {
            cli_options.log_file = log_file;
            cli_options.main_branch = main_branch;
            cli_options.agent_runtime = agent;
            cli_options.agent_program = agent_program;
            cli_options.permission_timeout_secs = permission_timeout_secs;
            cli_options.projects_root = projects_root;
            let config = config::load_config(cli.config.as_deref(), cli_options)?;
            run_daemon(config, cli.verbose).await
        }
        Command::Sessions { json } => {
            let config = config::load_config(cli.config.as_deref(), cli_options)?;
            show_sessions(&config, json)
        }
        Command::Config => {
            let config = config::load_config(cli.config.as_deref(), cli_options)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Version => {
            println!("afk {}", VERSION);
            Ok(())
        }
    }
}

async fn run_daemon(config: ResolvedConfig, verbose: bool) -> anyhow::Result<()> {
    let mut telemetry = if verbose {
        TelemetryConfig::development()
    } else {
        TelemetryConfig::production()
    };
    if let Some(path) = &config.log_file {
        telemetry = telemetry.with_log_file(path);
    }
    let _guard = init_telemetry(&telemetry).context("Failed to initialize logging")?;

    info!("afk {} starting (data dir {:?})", VERSION, config.data_dir);

    let store = Arc::new(
        SessionStore::open(&config.data_dir)
            .with_context(|| format!("Failed to open session store in {:?}", config.data_dir))?,
    );
    let bus = EventBus::with_capacity(config.event_queue_capacity);

    let layout = WorkspaceLayout::new(&config.workspace_dir, &config.branch_prefix);
    let isolator = Arc::new(GitWorktreeIsolator::new(layout, &config.main_branch));
    let grace = Duration::from_secs(config.stop_grace_secs);
    let runtime: Arc<dyn AgentRuntime> = match config.agent_runtime {
        AgentRuntimeKind::Claude => Arc::new(StreamJsonRuntime::new(config.agent.clone(), grace)),
        AgentRuntimeKind::Codex => Arc::new(CodexRuntime::new(config.agent.clone(), grace)),
    };
    info!("Agent runtime: {} ({})", config.agent_runtime, config.agent.program);
    let commit_messages: Arc<dyn CommitMessageProvider> = Arc::from(provider_for(
        config.commit_messages,
        config.agent_runtime,
        &config.agent,
    ));

    let deps = ManagerDeps::new(bus.clone(), isolator, runtime, store.clone())
        .with_commit_messages(commit_messages);
    let manager = SessionManager::new(deps, ManagerOptions::from_config(&config));
    let commands = Commands::new(
        manager.clone(),
        Arc::new(ConfiguredProjects::from_config(&config)),
    );

    let sinks = spawn_event_sinks(&bus);

    let (records, unreadable) = store
        .load_all_lenient()
        .context("Failed to read persisted sessions")?;
    for err in unreadable {
        warn!("Skipping persisted session: {}", err);
    }
    let report = commands.recover(records).await;
    info!(
        "Recovery: {} resumed, {} stopped, {} failed, {} orphan workspaces removed",
        report.resumed.len(),
        report.stopped.len(),
        report.failed.len(),
        report.orphans_removed.len()
    );
    for (name, reason) in &report.failed {
        warn!("Session {} not recovered: {}", name, reason);
    }

    info!("afk ready, {} sessions registered", manager.session_count());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    manager.suspend_all().await;
    bus.close();
    for sink in sinks {
        let _ = sink.await;
    }

    #[cfg(feature = "telemetry")]
    debug!("{}", GLOBAL_METRICS.snapshot().format_report());

    Ok(())
}

/// Log every published event until the bus closes.
fn spawn_event_sinks(bus: &EventBus) -> Vec<JoinHandle<()>> {
    EventKind::ALL
        .iter()
        .map(|kind| {
            let mut subscription = bus.subscribe(*kind);
            tokio::spawn(async move {
                while let Some(event) = subscription.next().await {
                    log_event(&event);
                }
            })
        })
        .collect()
}

fn log_event(event: &SessionEvent) {
    let payload = serde_json::to_string(event).unwrap_or_else(|e| format!("<unserializable: {}>", e));
    match event.level() {
        EventLevel::Internal | EventLevel::Progress => {
            tracing::event!(Level::DEBUG, channel = event.channel_id(), "{}", payload)
        }
        EventLevel::Info | EventLevel::Notify => {
            tracing::event!(Level::INFO, channel = event.channel_id(), "{}", payload)
        }
    }
}

fn show_sessions(config: &ResolvedConfig, json: bool) -> anyhow::Result<()> {
    let store = SessionStore::open(&config.data_dir)
        .with_context(|| format!("Failed to open session store in {:?}", config.data_dir))?;
    let records = store.load_all()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("{}", "No sessions".dimmed());
        return Ok(());
    }

    for record in records {
        let state = match record.state {
            SessionState::Idle => record.state.as_str().green(),
            SessionState::Running => record.state.as_str().cyan(),
            SessionState::WaitingPermission => record.state.as_str().yellow(),
            SessionState::Stopped => record.state.as_str().red(),
        };
        println!(
            "{}  {}  {}  {}",
            record.name.bold(),
            state,
            record.branch,
            record.channel_id.dimmed()
        );
        println!("    {}", record.workspace_path.display());
    }
    Ok(())
}
