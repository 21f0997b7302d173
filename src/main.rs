// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Foreman main entry point - CLI and service loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;

use foreman::config::{self, CliOverrides, RuntimeConfig};
use foreman::runtime::{
    format, AgentRegistry, ChannelSession, ConsoleChannel, DecisionAction, RuntimeService,
    TaskRequest,
};
use foreman::store::{shared, Task, TaskStatus, TaskStorage};
use foreman::telemetry::{init_telemetry, TelemetryConfig};
use foreman::workspace::WorktreeManager;

/// Foreman version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Session used by tasks created from the command line.
const CLI_PLATFORM: &str = "cli";
const CLI_CHANNEL: &str = "local";

/// Foreman - autonomous coding tasks with a human at the gate.
#[derive(Parser)]
#[command(name = "foreman")]
#[command(author, version, about = "Autonomous coding tasks with a human at the gate", long_about = None)]
struct Cli {
    /// Repository root (defaults to the git top-level of the current directory)
    #[arg(long, global = true, env = "FOREMAN_REPO")]
    repo: Option<PathBuf>,

    /// Task database path
    #[arg(long, global = true, env = "FOREMAN_DB")]
    database: Option<PathBuf>,

    /// Parent directory for task worktrees
    #[arg(long, global = true)]
    worktree_root: Option<PathBuf>,

    /// Actor id recorded on decisions (defaults to $USER)
    #[arg(long, global = true, env = "FOREMAN_ACTOR")]
    actor: Option<String>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for foreman.
#[derive(Subcommand)]
enum Commands {
    /// Run workers and the janitor until interrupted
    Serve {
        /// Number of workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Create and manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Initialize a new configuration file
    Init,

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

/// Task subcommand actions.
#[derive(Subcommand)]
enum TaskAction {
    /// Create a task
    Create {
        /// What the agent should achieve
        #[arg(required = true, trailing_var_arg = true)]
        goal: Vec<String>,
        /// Preferred agent
        #[arg(short, long)]
        agent: Option<String>,
        /// Authoritative test command
        #[arg(short, long)]
        test_command: Option<String>,
        #[arg(long)]
        max_steps: Option<u32>,
        #[arg(long)]
        max_minutes: Option<u32>,
        /// Wait for approval even if the task looks safe
        #[arg(long)]
        draft: bool,
        /// Thread to report in
        #[arg(long, default_value = "cli")]
        thread: String,
    },
    /// List tasks
    List {
        /// Only tasks with this status
        #[arg(short, long)]
        status: Option<TaskStatus>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Include tasks from every channel
        #[arg(long)]
        all: bool,
    },
    /// Show one task
    Show { id: String },
    /// Show status, recent events and output tails
    Logs { id: String },
    /// List files changed by a task
    Changes { id: String },
    /// Approve a draft
    Approve { id: String },
    /// Reject a draft
    Reject { id: String },
    /// Attach a suggestion to a draft
    Suggest {
        id: String,
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Merge a finished task into the current branch
    Merge { id: String },
    /// Drop a finished task's result
    Discard { id: String },
    /// Send a finished task back for another iteration
    RequestChanges {
        id: String,
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Requeue a blocked or paused task
    Resume {
        id: String,
        #[arg(trailing_var_arg = true)]
        instruction: Vec<String>,
    },
    /// Pause a task
    Pause { id: String },
    /// Stop a task
    Stop { id: String },
    /// Remove a task's worktree, or run a janitor pass without an id
    Cleanup { id: Option<String> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = match (&cli.command, cli.verbose) {
        (Commands::Serve { .. }, 0) => TelemetryConfig::service(),
        (_, 0) => TelemetryConfig::default().with_level(tracing::Level::WARN),
        (_, v) => TelemetryConfig::from_verbosity(v),
    };
    let _guard = init_telemetry(&telemetry)?;

    let actor = cli
        .actor
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string());

    match cli.command {
        Commands::Serve { workers } => {
            let runtime = open_runtime(&cli.repo, &cli.database, &cli.worktree_root, workers).await?;
            serve(runtime).await
        }
        Commands::Task { ref action } => {
            let runtime = open_runtime(&cli.repo, &cli.database, &cli.worktree_root, None).await?;
            handle_task_command(&runtime, action, &actor).await
        }
        Commands::Config { action } => {
            let repo = resolve_repo(&cli.repo).await?;
            match action {
                Some(ConfigAction::Show) | None => {
                    let config = config::load_config(&repo, overrides(&cli.database, &cli.worktree_root, None))?;
                    println!("{}", serde_yaml::to_string(&config)?);
                }
            }
            Ok(())
        }
        Commands::Init => {
            let repo = resolve_repo(&cli.repo).await?;
            let path = config::init_config(&repo, &RuntimeConfig::default())?;
            println!("Created config file: {}", path.display());
            Ok(())
        }
        Commands::Version => {
            println!("foreman {}", VERSION);
            Ok(())
        }
    }
}

fn overrides(
    database: &Option<PathBuf>,
    worktree_root: &Option<PathBuf>,
    workers: Option<usize>,
) -> CliOverrides {
    CliOverrides {
        database_path: database.clone(),
        worktree_root: worktree_root.clone(),
        worker_concurrency: workers,
        ..CliOverrides::default()
    }
}

async fn resolve_repo(repo: &Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match repo {
        Some(path) => Ok(path.clone()),
        None => {
            let cwd = std::env::current_dir()?;
            WorktreeManager::discover_repo_root(&cwd)
                .await
                .context("not inside a git repository; pass --repo")
        }
    }
}

async fn open_runtime(
    repo: &Option<PathBuf>,
    database: &Option<PathBuf>,
    worktree_root: &Option<PathBuf>,
    workers: Option<usize>,
) -> anyhow::Result<RuntimeService> {
    let repo = resolve_repo(repo).await?;
    let config = config::load_config(&repo, overrides(database, worktree_root, workers))?;
    let db_path = config
        .resolved_database_path()
        .context("cannot resolve a database path; pass --database")?;
    let storage = shared(TaskStorage::open_at(&db_path)?);
    let worktrees = WorktreeManager::new(&repo, config.resolved_worktree_root(&repo))
        .with_branch_prefix(config.branch_prefix.clone());
    let agents = Arc::new(AgentRegistry::from_config(&config.agents));

    let runtime = RuntimeService::new(config, storage, worktrees)?;
    runtime
        .register_session(ChannelSession::new(
            CLI_PLATFORM,
            CLI_CHANNEL,
            Arc::new(ConsoleChannel::new()),
            agents,
        ))
        .await;
    Ok(runtime)
}

async fn serve(runtime: RuntimeService) -> anyhow::Result<()> {
    if !runtime.enabled() {
        println!("{}", "Task runtime is disabled in configuration.".yellow());
        return Ok(());
    }
    if runtime.config().agents.is_empty() {
        println!(
            "{}",
            "No agents configured; tasks will fail until `agents` is set.".yellow()
        );
    }
    runtime.start().await?;
    println!(
        "{} serving {} with {} worker(s). Press Ctrl-C to stop.",
        "foreman".bright_cyan().bold(),
        runtime.repo_root().display(),
        runtime.config().worker_concurrency
    );
    tokio::signal::ctrl_c().await?;
    println!("{}", "Stopping...".dimmed());
    runtime.shutdown().await;
    Ok(())
}

async fn handle_task_command(
    runtime: &RuntimeService,
    action: &TaskAction,
    actor: &str,
) -> anyhow::Result<()> {
    match action {
        TaskAction::Create {
            goal,
            agent,
            test_command,
            max_steps,
            max_minutes,
            draft,
            thread,
        } => {
            let goal = goal.join(" ");
            let request = TaskRequest::new(CLI_PLATFORM, CLI_CHANNEL, thread, actor, goal)
                .with_agent(agent.clone())
                .with_test_command(test_command.clone())
                .with_budget(*max_steps, *max_minutes)
                .draft(*draft);
            let task = runtime.create_task(request).await?;
            println!(
                "Created task {} ({})",
                task.id.bright_white().bold(),
                colorize_status(task.status)
            );
            if task.status == TaskStatus::Pending {
                println!(
                    "{}",
                    "Run `foreman serve` to execute queued tasks.".dimmed()
                );
            }
        }
        TaskAction::List { status, limit, all } => {
            let tasks = if *all {
                runtime.list_recent(*status, *limit).await?
            } else {
                runtime
                    .list_tasks(CLI_PLATFORM, CLI_CHANNEL, *status, *limit)
                    .await?
            };
            if tasks.is_empty() {
                println!("{}", "No tasks.".dimmed());
            }
            for task in &tasks {
                println!(
                    "{}  {:<14} {:>2}/{:<2}  {}",
                    task.id.bright_white(),
                    colorize_status(task.status),
                    task.step_no,
                    task.max_steps,
                    format::goal_short(&task.goal)
                );
            }
        }
        TaskAction::Show { id } => {
            let task = runtime
                .get_task(id)
                .await?
                .with_context(|| format!("task `{}` not found", id))?;
            print_task(&task);
        }
        TaskAction::Logs { id } => {
            let logs = runtime.task_logs(id).await?;
            println!("{}", logs.render());
        }
        TaskAction::Changes { id } => {
            let changes = runtime.task_changes(id).await?;
            println!("{}", format::changes_text(id, &changes));
        }
        TaskAction::Approve { id } => {
            decide(runtime, id, DecisionAction::Approve, actor, None).await?;
        }
        TaskAction::Reject { id } => {
            decide(runtime, id, DecisionAction::Reject, actor, None).await?;
        }
        TaskAction::Suggest { id, text } => {
            decide(runtime, id, DecisionAction::Suggest, actor, Some(text.join(" "))).await?;
        }
        TaskAction::Merge { id } => {
            let task = decide(runtime, id, DecisionAction::Merge, actor, None).await?;
            if let Some(hash) = &task.merge_commit_hash {
                println!("Commit {}", hash.bright_yellow());
            }
            if let Some(error) = &task.merge_error {
                eprintln!("{}", error.red());
            }
        }
        TaskAction::Discard { id } => {
            decide(runtime, id, DecisionAction::Discard, actor, None).await?;
        }
        TaskAction::RequestChanges { id, text } => {
            let note = (!text.is_empty()).then(|| text.join(" "));
            decide(runtime, id, DecisionAction::RequestChanges, actor, note).await?;
        }
        TaskAction::Resume { id, instruction } => {
            let task = runtime.resume(id, &instruction.join(" "), actor).await?;
            print_status_line(&task);
        }
        TaskAction::Pause { id } => {
            let task = runtime.pause(id, actor).await?;
            print_status_line(&task);
        }
        TaskAction::Stop { id } => {
            let task = runtime.stop(id, actor).await?;
            print_status_line(&task);
        }
        TaskAction::Cleanup { id: Some(id) } => {
            if runtime.cleanup_task(id, actor).await? {
                println!("Removed workspace of task {}", id.bright_white());
            } else {
                println!("{}", "Task has no workspace to remove.".dimmed());
            }
        }
        TaskAction::Cleanup { id: None } => {
            let cleaned = runtime.run_janitor(actor).await?;
            println!("Removed {} expired workspace(s)", cleaned);
        }
    }
    Ok(())
}

async fn decide(
    runtime: &RuntimeService,
    id: &str,
    action: DecisionAction,
    actor: &str,
    suggestion: Option<String>,
) -> anyhow::Result<Task> {
    let task = runtime.decide(id, action, actor, suggestion).await?;
    print_status_line(&task);
    Ok(task)
}

fn print_status_line(task: &Task) {
    println!("Task {} is now {}", task.id.bright_white(), colorize_status(task.status));
}

fn print_task(task: &Task) {
    println!("{} {}", "Task".bold(), task.id.bright_white().bold());
    println!("  Status:   {}", colorize_status(task.status));
    println!("  Goal:     {}", task.goal);
    println!("  Step:     {}/{}", task.step_no, task.max_steps);
    println!("  Budget:   {} min", task.max_minutes);
    println!("  Agent:    {}", task.preferred_agent.as_deref().unwrap_or("-"));
    println!("  Tests:    {}", task.test_command);
    println!("  Source:   {} by {}", task.source.as_str(), task.created_by);
    if let Some(path) = &task.workspace_path {
        println!("  Worktree: {}", path);
    }
    if let Some(reason) = &task.blocked_reason {
        println!("  Blocked:  {}", reason.yellow());
    }
    if let Some(instruction) = &task.resume_instruction {
        println!("  Next:     {}", instruction);
    }
    if let Some(summary) = &task.summary {
        println!("  Summary:  {}", summary);
    }
    if let Some(error) = &task.error {
        println!("  Error:    {}", format::truncate_chars(error, 400).red());
    }
    if let Some(hash) = &task.merge_commit_hash {
        println!("  Commit:   {}", hash.bright_yellow());
    }
    if let Some(error) = &task.merge_error {
        println!("  Merge:    {}", error.red());
    }
}

fn colorize_status(status: TaskStatus) -> colored::ColoredString {
    let text = status.as_str();
    match status {
        TaskStatus::Merged | TaskStatus::Applied => text.green(),
        TaskStatus::Running | TaskStatus::Validating => text.cyan(),
        TaskStatus::Draft | TaskStatus::Pending | TaskStatus::WaitingMerge => text.yellow(),
        TaskStatus::Blocked | TaskStatus::Paused => text.magenta(),
        TaskStatus::Discarded | TaskStatus::Rejected | TaskStatus::Stopped => text.dimmed(),
        TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::MergeFailed => text.red(),
    }
}
