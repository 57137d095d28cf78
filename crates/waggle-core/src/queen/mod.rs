//! The queen: session lifecycle around the agent loop.
//!
//! `run` opens a fresh durable session and drives the loop until the model
//! declares the objective complete or failed; `resume` picks up the most
//! recent non-terminal session, rebuilding the graph and conversation from
//! storage. `close` is idempotent and never downgrades a terminal outcome.

mod agent;
mod compact;
mod prompt;
pub(crate) mod tools;

pub use agent::AgentOutcome;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterRegistry, TaskRouter};
use crate::blackboard::Blackboard;
use crate::bus::{MessageBus, Subscription};
use crate::config::Config;
use crate::llm::anthropic::AnthropicClient;
use crate::llm::{ContentBlock, Role, ToolClient, ToolMessage, Usage};
use crate::paths;
use crate::safety::Guard;
use crate::storage::{Database, SessionRow, SessionStatus};
use crate::task::{Task, TaskGraph};
use crate::worker::WorkerPool;

const BUS_HISTORY: usize = 10_000;

pub struct Queen {
    pub(crate) cfg: Config,
    pub(crate) bus: MessageBus,
    pub(crate) db: Database,
    pub(crate) board: Blackboard,
    pub(crate) graph: TaskGraph,
    pub(crate) guard: Arc<Guard>,
    pub(crate) registry: Arc<AdapterRegistry>,
    pub(crate) router: TaskRouter,
    pub(crate) pool: WorkerPool,
    pub(crate) llm: Arc<dyn ToolClient>,

    session: Mutex<Option<String>>,
    phase: Mutex<String>,
    pub(crate) iteration: AtomicU32,
    next_seq: AtomicU64,
    pub(crate) assignments: Mutex<HashMap<String, String>>,
    /// Adapters that have passed their one-time health check this session.
    pub(crate) health_checked: Mutex<std::collections::HashSet<String>>,
    predefined: Mutex<Vec<Task>>,
    pub(crate) usage: Mutex<Usage>,
    event_subs: Mutex<Vec<Subscription>>,
    closed: AtomicBool,
}

/// Point-in-time view of a session for external observers.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub session: SessionRow,
    pub task_counts: HashMap<String, u32>,
    pub tasks: Vec<Task>,
    pub event_count: u64,
}

impl Queen {
    /// Build a queen from config, constructing the LLM client from the
    /// configured provider.
    pub fn new(cfg: Config) -> Result<Self> {
        let llm: Arc<dyn ToolClient> = match cfg.queen.provider.as_str() {
            "anthropic" => Arc::new(AnthropicClient::from_env(cfg.queen.model.clone())?),
            "" => bail!("no LLM provider configured (set queen.provider in waggle.json)"),
            other => bail!("unknown LLM provider: {other:?}"),
        };
        Self::with_client(cfg, llm)
    }

    /// Build a queen with an explicit LLM client (tests, alternative
    /// providers).
    pub fn with_client(cfg: Config, llm: Arc<dyn ToolClient>) -> Result<Self> {
        let project_dir = cfg
            .project_dir
            .canonicalize()
            .with_context(|| format!("project dir {}", cfg.project_dir.display()))?;
        let hive_dir = paths::ensure_hive_dir(&project_dir)?;

        let bus = MessageBus::new(BUS_HISTORY);
        let db = Database::open(&hive_dir)?;
        let board = Blackboard::new(bus.clone());
        let graph = TaskGraph::new(bus.clone());
        let guard = Arc::new(Guard::new(cfg.safety.clone(), &project_dir)?);

        let registry = Arc::new(AdapterRegistry::standard(
            &cfg.adapters,
            &project_dir,
            Arc::clone(&guard),
            bus.clone(),
            cfg.workers.max_output_size,
        ));
        let router = TaskRouter::new(Arc::clone(&registry), &cfg.workers.default_adapter);
        let pool = WorkerPool::new(
            cfg.workers.max_parallel,
            registry.worker_factory(),
            bus.clone(),
        );

        let mut cfg = cfg;
        cfg.project_dir = project_dir;

        Ok(Self {
            cfg,
            bus,
            db,
            board,
            graph,
            guard,
            registry,
            router,
            pool,
            llm,
            session: Mutex::new(None),
            phase: Mutex::new("agent".to_string()),
            iteration: AtomicU32::new(0),
            next_seq: AtomicU64::new(0),
            assignments: Mutex::new(HashMap::new()),
            health_checked: Mutex::new(std::collections::HashSet::new()),
            predefined: Mutex::new(Vec::new()),
            usage: Mutex::new(Usage::default()),
            event_subs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.board
    }

    /// Load pre-defined tasks to be inserted when the session starts.
    pub fn set_tasks(&self, tasks: Vec<Task>) {
        *self.predefined.lock().expect("predefined lock poisoned") = tasks;
    }

    pub fn session_id(&self) -> String {
        self.session
            .lock()
            .expect("session lock poisoned")
            .clone()
            .unwrap_or_default()
    }

    pub(crate) fn phase(&self) -> String {
        self.phase.lock().expect("phase lock poisoned").clone()
    }

    /// Start a fresh session for the objective and drive the agent loop to
    /// an outcome.
    pub async fn run(&self, cancel: &CancellationToken, objective: &str) -> Result<AgentOutcome> {
        let session_id = self.create_session(objective)?;
        tracing::info!(session_id = %session_id, objective, "session started");

        self.attach_event_persistence(&session_id);
        self.insert_predefined_tasks()?;

        let seed = ToolMessage::user_text(format!(
            "Objective: {objective}\n\nProject directory: {}",
            self.cfg.project_dir.display()
        ));
        let mut conversation = vec![seed.clone()];
        self.persist_message(&seed, None)?;

        self.drive(cancel, &mut conversation).await
    }

    /// Resume the given (or most recent non-terminal) session.
    pub async fn resume(
        &self,
        cancel: &CancellationToken,
        session_id: Option<&str>,
    ) -> Result<AgentOutcome> {
        let sessions = self.db.sessions();
        let row = match session_id {
            Some(id) => sessions
                .get(id)?
                .ok_or_else(|| anyhow!("session {id:?} not found"))?,
            None => sessions
                .find_resumable()?
                .ok_or_else(|| anyhow!("no resumable session"))?,
        };
        if row.status.is_terminal() {
            bail!("session {} already finished ({})", row.id, row.status);
        }
        tracing::info!(session_id = %row.id, "resuming session");

        {
            let mut session = self.session.lock().expect("session lock poisoned");
            *session = Some(row.id.clone());
        }
        sessions.set_status(&row.id, SessionStatus::Running)?;
        sessions.set_phase(&row.id, "agent")?;
        self.attach_event_persistence(&row.id);

        // rebuild the in-memory graph and the worker->task map; the workers
        // themselves died with the previous process
        let tasks = self.db.tasks().get_tasks(&row.id)?;
        {
            let mut assignments = self.assignments.lock().expect("assignments lock poisoned");
            for task in tasks {
                if let (Some(worker_id), false) = (&task.worker_id, task.status.is_terminal()) {
                    assignments.insert(worker_id.clone(), task.id.clone());
                }
                self.graph.restore(task);
            }
        }

        // resume starts with an empty in-memory blackboard: entries are
        // persisted as posted but deliberately not rehydrated
        let mut conversation = self.load_conversation(&row.id)?;
        if conversation.is_empty() {
            let seed = ToolMessage::user_text(format!(
                "Objective: {}\n\nProject directory: {}",
                row.objective,
                self.cfg.project_dir.display()
            ));
            conversation.push(seed.clone());
            self.persist_message(&seed, None)?;
        }

        self.drive(cancel, &mut conversation).await
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        conversation: &mut Vec<ToolMessage>,
    ) -> Result<AgentOutcome> {
        let session_id = self.session_id();
        let outcome = agent::run_loop(self, cancel, conversation).await;
        let sessions = self.db.sessions();

        let result = match outcome {
            Ok(AgentOutcome::Completed(summary)) => {
                let _ = sessions.set_status_if_not_terminal(&session_id, SessionStatus::Done);
                tracing::info!(session_id = %session_id, "objective complete");
                Ok(AgentOutcome::Completed(summary))
            }
            Ok(AgentOutcome::Failed(reason)) => {
                let _ = sessions.set_status_if_not_terminal(&session_id, SessionStatus::Failed);
                tracing::warn!(session_id = %session_id, reason, "objective failed");
                Ok(AgentOutcome::Failed(reason))
            }
            Err(e) if cancel.is_cancelled() => {
                tracing::warn!(session_id = %session_id, "session interrupted");
                Err(e)
            }
            Err(e) => {
                let _ = sessions.set_status_if_not_terminal(&session_id, SessionStatus::Failed);
                tracing::error!(session_id = %session_id, error = %e, "session aborted");
                Err(e)
            }
        };

        self.close().await;
        result
    }

    /// Flush state and record the outcome. Idempotent; a terminal status
    /// written by the loop survives, an interrupted session is recorded as
    /// such.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for e in self.pool.kill_all().await {
            tracing::warn!(error = %e, "worker kill during close");
        }

        let session_id = self.session_id();
        if !session_id.is_empty() {
            match self
                .db
                .sessions()
                .set_status_if_not_terminal(&session_id, SessionStatus::Interrupted)
            {
                Ok(true) => tracing::info!(session_id = %session_id, "session interrupted"),
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "record interrupted status"),
            }
        }

        for sub in self
            .event_subs
            .lock()
            .expect("event subs lock poisoned")
            .drain(..)
        {
            sub.unsubscribe();
        }
    }

    /// Status snapshot for the driver: the given session or the latest one.
    pub fn status(&self, session_id: Option<&str>) -> Result<StatusSnapshot> {
        let sessions = self.db.sessions();
        let row = match session_id {
            Some(id) => sessions
                .get(id)?
                .ok_or_else(|| anyhow!("session {id:?} not found"))?,
            None => sessions.latest()?.ok_or_else(|| anyhow!("no sessions"))?,
        };
        Ok(StatusSnapshot {
            task_counts: self.db.tasks().count_by_status(&row.id)?,
            tasks: self.db.tasks().get_tasks(&row.id)?,
            event_count: self.db.events().count(&row.id)?,
            session: row,
        })
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        self.db.sessions().list()
    }

    pub fn usage_total(&self) -> Usage {
        *self.usage.lock().expect("usage lock poisoned")
    }

    // ── internals ──────────────────────────────────────────────────────

    fn create_session(&self, objective: &str) -> Result<String> {
        let sessions = self.db.sessions();
        // short opaque id; regenerate on the (unlikely) collision
        for _ in 0..4 {
            let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            match sessions.create(&id, objective) {
                Ok(()) => {
                    sessions.set_phase(&id, "agent")?;
                    let mut session = self.session.lock().expect("session lock poisoned");
                    *session = Some(id.clone());
                    return Ok(id);
                }
                Err(e) => tracing::warn!(error = %e, "session id collision, retrying"),
            }
        }
        bail!("could not allocate a session id")
    }

    /// Mirror every bus event into the durable event log, and blackboard
    /// updates into the blackboard table.
    fn attach_event_persistence(&self, session_id: &str) {
        let events = self.db.events();
        let sid = session_id.to_string();
        let event_sub = self.bus.subscribe_all(move |msg| {
            if let Err(e) = events.append(&sid, msg) {
                tracing::error!(error = %e, "persist event");
            }
        });

        let board_store = self.db.blackboard();
        let sid = session_id.to_string();
        let board_sub = self
            .bus
            .subscribe(crate::bus::EventType::BlackboardUpdate, move |msg| {
                let entry = crate::blackboard::Entry {
                    key: msg.payload["key"].as_str().unwrap_or_default().to_string(),
                    value: msg.payload["value"].as_str().unwrap_or_default().to_string(),
                    posted_by: msg.payload["posted_by"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    time: msg.time,
                };
                if let Err(e) = board_store.put(&sid, &entry) {
                    tracing::error!(error = %e, "persist blackboard entry");
                }
            });

        let mut subs = self.event_subs.lock().expect("event subs lock poisoned");
        subs.push(event_sub);
        subs.push(board_sub);
    }

    fn insert_predefined_tasks(&self) -> Result<()> {
        let tasks = std::mem::take(&mut *self.predefined.lock().expect("predefined lock poisoned"));
        if tasks.is_empty() {
            return Ok(());
        }
        let session_id = self.session_id();
        self.db.tasks().upsert_batch(&session_id, &tasks)?;
        let count = tasks.len();
        for task in tasks {
            self.graph.add(task);
        }
        tracing::info!(count, "loaded pre-defined tasks");
        Ok(())
    }

    fn load_conversation(&self, session_id: &str) -> Result<Vec<ToolMessage>> {
        let stored = self.db.messages().load(session_id)?;
        let next_seq = self.db.messages().next_seq(session_id)?;
        self.next_seq.store(next_seq, Ordering::SeqCst);

        let mut conversation = Vec::with_capacity(stored.len());
        for msg in stored {
            let Some(role) = Role::parse(&msg.role) else {
                tracing::warn!(seq = msg.seq, role = %msg.role, "skipping unknown role");
                continue;
            };
            match serde_json::from_str::<Vec<ContentBlock>>(&msg.content_json) {
                Ok(content) => conversation.push(ToolMessage { role, content }),
                Err(e) => {
                    tracing::warn!(seq = msg.seq, error = %e, "skipping unparseable message")
                }
            }
        }
        Ok(conversation)
    }

    pub(crate) fn persist_message(
        &self,
        msg: &ToolMessage,
        usage: Option<&Usage>,
    ) -> Result<()> {
        let session_id = self.session_id();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let content_json = serde_json::to_string(&msg.content)?;
        let usage_json = usage.map(serde_json::to_string).transpose()?;
        self.db
            .messages()
            .append(
                &session_id,
                seq,
                msg.role.as_str(),
                &content_json,
                usage_json.as_deref(),
            )
            .context("append message")
    }

    /// Write a task's current state through to storage. Returns a fatal
    /// loop signal when the write fails.
    pub(crate) fn persist_task_state(
        &self,
        handle: &crate::task::TaskHandle,
    ) -> Option<tools::LoopSignal> {
        let session_id = self.session_id();
        let snapshot = handle.snapshot();
        match self.db.tasks().upsert(&session_id, &snapshot) {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(task_id = %snapshot.id, error = %e, "persist task");
                Some(tools::LoopSignal::Fatal(format!(
                    "database write failed: {e}"
                )))
            }
        }
    }

    /// Trim text for the model's context: anything over the threshold is
    /// written in full to the session outputs directory and replaced by its
    /// head and tail plus a pointer to the file.
    pub(crate) fn truncate_for_context(&self, key: &str, text: &str) -> String {
        if text.len() <= tools::OUTPUT_CONTEXT_THRESHOLD {
            return text.to_string();
        }

        let safe_key: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = paths::task_output_path(&self.cfg.project_dir, &safe_key);
        let hint = match std::fs::write(&path, text) {
            Ok(()) => format!("full output: {}", path.display()),
            Err(e) => {
                tracing::warn!(error = %e, "spill task output");
                "full output unavailable".to_string()
            }
        };

        let half = tools::OUTPUT_CONTEXT_THRESHOLD / 2;
        let head_end = floor_char_boundary(text, half);
        let tail_start = ceil_char_boundary(text, text.len() - half);
        format!(
            "{}\n[... {} bytes omitted; {hint} ...]\n{}",
            &text[..head_end],
            text.len() - head_end - (text.len() - tail_start),
            &text[tail_start..]
        )
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
