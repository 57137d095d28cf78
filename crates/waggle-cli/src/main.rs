//! Waggle - agent orchestration CLI.
//!
//! Thin driver over `waggle_core::queen::Queen`: flag parsing, config
//! loading, signal wiring and report rendering. Exit codes: 0 success,
//! 1 user error, 2 objective failed, 130 interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use waggle_core::config::Config;
use waggle_core::queen::{AgentOutcome, Queen};
use waggle_core::task::{Task, TaskStatus, TaskType};
use waggle_core::{paths, storage};

const EXIT_OK: u8 = 0;
const EXIT_USER_ERROR: u8 = 1;
const EXIT_OBJECTIVE_FAILED: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "waggle")]
#[command(about = "Agent orchestration: an LLM queen drives a hive of CLI workers")]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true, default_value = "waggle.json")]
    config: PathBuf,

    /// Project directory
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Default adapter (claude-code, codex, gemini, kimi, opencode, exec)
    #[arg(long, global = true)]
    adapter: Option<String>,

    /// Max parallel workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queen with an objective
    Run {
        /// The objective, in natural language
        objective: Vec<String>,
        /// Load pre-defined tasks from a JSON file
        #[arg(long)]
        tasks: Option<PathBuf>,
    },
    /// Resume an interrupted session
    Resume {
        /// Session id (default: most recent resumable)
        session: Option<String>,
    },
    /// Show the status of a session
    Status {
        /// Session id (default: latest)
        session: Option<String>,
    },
    /// List all sessions
    Sessions,
    /// Print a session's event log
    Logs {
        /// Session id (default: latest)
        session: Option<String>,
        /// Keep following new events
        #[arg(long)]
        follow: bool,
    },
    /// Initialise the .hive directory and write a default config
    Init,
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_USER_ERROR)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut cfg = Config::load(&cli.config)?;
    if let Some(project) = cli.project {
        cfg.project_dir = project;
    }
    if let Some(adapter) = cli.adapter {
        cfg.workers.default_adapter = adapter;
    }
    if let Some(workers) = cli.workers {
        cfg.workers.max_parallel = workers;
    }

    match cli.command {
        Commands::Run { objective, tasks } => {
            let objective = objective.join(" ");
            if objective.trim().is_empty() {
                anyhow::bail!("usage: waggle run <objective>");
            }
            let predefined = tasks
                .map(|path| load_tasks_file(&path, &cfg))
                .transpose()?;
            cmd_run(cfg, &objective, predefined).await
        }
        Commands::Resume { session } => cmd_resume(cfg, session).await,
        Commands::Status { session } => cmd_status(&cfg, session.as_deref()),
        Commands::Sessions => cmd_sessions(&cfg),
        Commands::Logs { session, follow } => cmd_logs(&cfg, session.as_deref(), follow).await,
        Commands::Init => cmd_init(&cfg, &cli.config),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(ExitCode::from(EXIT_OK))
        }
    }
}

async fn cmd_run(
    cfg: Config,
    objective: &str,
    predefined: Option<Vec<Task>>,
) -> Result<ExitCode> {
    let queen = Queen::new(cfg)?;
    if let Some(tasks) = predefined {
        queen.set_tasks(tasks);
    }

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    let outcome = queen.run(&cancel, objective).await;
    report_outcome(outcome, &cancel)
}

async fn cmd_resume(cfg: Config, session: Option<String>) -> Result<ExitCode> {
    let queen = Queen::new(cfg)?;
    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    let outcome = queen.resume(&cancel, session.as_deref()).await;
    report_outcome(outcome, &cancel)
}

fn report_outcome(
    outcome: Result<AgentOutcome>,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    match outcome {
        Ok(AgentOutcome::Completed(summary)) => {
            println!("objective complete: {summary}");
            Ok(ExitCode::from(EXIT_OK))
        }
        Ok(AgentOutcome::Failed(reason)) => {
            println!("objective failed: {reason}");
            Ok(ExitCode::from(EXIT_OBJECTIVE_FAILED))
        }
        Err(_) if cancel.is_cancelled() => {
            println!("interrupted; resume with: waggle resume");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(e) => Err(e),
    }
}

fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::warn!("shutdown signal received, stopping gracefully");
        cancel.cancel();
    });
}

fn open_db(cfg: &Config) -> Result<storage::Database> {
    let hive = paths::hive_dir(&cfg.project_dir);
    if !paths::db_path(&cfg.project_dir).exists() {
        anyhow::bail!("no hive found at {}; run 'waggle init' first", hive.display());
    }
    storage::Database::open(&hive)
}

fn cmd_status(cfg: &Config, session: Option<&str>) -> Result<ExitCode> {
    let db = open_db(cfg)?;
    let sessions = db.sessions();
    let row = match session {
        Some(id) => sessions
            .get(id)?
            .with_context(|| format!("session {id:?} not found"))?,
        None => sessions.latest()?.context("no sessions recorded yet")?,
    };

    let counts = db.tasks().count_by_status(&row.id)?;
    let tasks = db.tasks().get_tasks(&row.id)?;
    let events = db.events().count(&row.id)?;
    let total: u32 = counts.values().sum();

    println!("session:   {}", row.id);
    println!("objective: {}", row.objective);
    println!("status:    {}", row.status);
    println!("phase:     {} (iteration {})", row.phase, row.iteration);
    println!("events:    {events}");
    println!("tasks:     {total} total");
    for status in [
        TaskStatus::Complete,
        TaskStatus::Running,
        TaskStatus::Assigned,
        TaskStatus::Pending,
        TaskStatus::Retrying,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ] {
        if let Some(count) = counts.get(status.as_str()) {
            println!("  {:<10} {count}", status.as_str());
        }
    }
    if !tasks.is_empty() {
        println!();
        for task in tasks {
            let worker = task
                .worker_id
                .map(|w| format!(" (worker: {w})"))
                .unwrap_or_default();
            println!(
                "  [{}] {:<10} {}{}",
                task.task_type,
                task.status.as_str(),
                task.title,
                worker
            );
        }
    }
    Ok(ExitCode::from(EXIT_OK))
}

fn cmd_sessions(cfg: &Config) -> Result<ExitCode> {
    let db = open_db(cfg)?;
    let rows = db.sessions().list()?;
    if rows.is_empty() {
        println!("no sessions recorded yet");
        return Ok(ExitCode::from(EXIT_OK));
    }
    for row in rows {
        println!(
            "{}  {:<12} {}  {}",
            row.id, row.status, row.created_at, row.objective
        );
    }
    Ok(ExitCode::from(EXIT_OK))
}

async fn cmd_logs(cfg: &Config, session: Option<&str>, follow: bool) -> Result<ExitCode> {
    let db = open_db(cfg)?;
    let sessions = db.sessions();
    let row = match session {
        Some(id) => sessions
            .get(id)?
            .with_context(|| format!("session {id:?} not found"))?,
        None => sessions.latest()?.context("no sessions recorded yet")?,
    };

    let events = db.events();
    let mut last_id = 0;
    loop {
        for event in events.list_since(&row.id, last_id)? {
            last_id = event.id;
            let subject = event
                .task_id
                .or(event.worker_id)
                .map(|s| format!(" {s}"))
                .unwrap_or_default();
            let payload = event
                .payload_json
                .map(|p| format!(" {p}"))
                .unwrap_or_default();
            println!("{} {}{subject}{payload}", event.ts, event.event_type);
        }
        if !follow {
            break;
        }
        let current = sessions.get(&row.id)?.map(|r| r.status);
        if matches!(current, Some(status) if status.is_terminal()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    Ok(ExitCode::from(EXIT_OK))
}

fn cmd_init(cfg: &Config, config_path: &std::path::Path) -> Result<ExitCode> {
    let hive = paths::ensure_hive_dir(&cfg.project_dir)?;
    storage::Database::open(&hive)?;
    if !config_path.exists() {
        cfg.save(config_path)?;
        println!("wrote default config to {}", config_path.display());
    }
    println!("initialised hive at {}", hive.display());
    Ok(ExitCode::from(EXIT_OK))
}

/// Parse a pre-defined tasks file: a JSON array of
/// `{id?, type, title, description, priority?, depends_on?, max_retries?}`.
fn load_tasks_file(path: &std::path::Path, cfg: &Config) -> Result<Vec<Task>> {
    #[derive(serde::Deserialize)]
    struct RawTask {
        #[serde(default)]
        id: Option<String>,
        #[serde(rename = "type")]
        task_type: String,
        title: String,
        description: String,
        #[serde(default)]
        priority: Option<u8>,
        #[serde(default)]
        depends_on: Vec<String>,
        #[serde(default)]
        max_retries: Option<u32>,
    }

    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read tasks file {}", path.display()))?;
    let raw: Vec<RawTask> =
        serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;

    let mut tasks = Vec::with_capacity(raw.len());
    for rt in raw {
        let task_type = TaskType::parse(&rt.task_type)
            .with_context(|| format!("unknown task type {:?}", rt.task_type))?;
        let id = rt
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
        let mut task = Task::new(id, task_type, rt.title, rt.description);
        if let Some(p) = rt.priority {
            task.priority = waggle_core::task::Priority::try_from(p)
                .map_err(|e| anyhow::anyhow!(e))
                .context("priority out of range")?;
        }
        task.depends_on = rt.depends_on;
        task.max_retries = rt.max_retries.unwrap_or(cfg.workers.max_retries);
        task.timeout_secs = cfg.workers.default_timeout_secs;
        tasks.push(task);
    }
    Ok(tasks)
}
