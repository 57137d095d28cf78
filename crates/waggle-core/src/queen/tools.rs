//! The orchestration tool catalog exposed to the LLM.
//!
//! Every handler is a pure function of (queen, input) that returns a
//! [`ToolOutcome`]; failures become `is_error=true` results for the model
//! to react to, never propagated errors. The only exceptions are fatal
//! database failures, which surface as a loop signal so the session can
//! abort with status=failed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::Queen;
use crate::bus::{BusMessage, EventType};
use crate::errors::{self, ErrorClass};
use crate::llm::ToolDef;
use crate::task::{Priority, Task, TaskStatus, TaskType};
use crate::worker::WorkerStatus;

/// Worker-retry backoff base; doubled per prior retry, then jittered.
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(2);
/// Output longer than this is spilled to a file and trimmed to head+tail.
pub(crate) const OUTPUT_CONTEXT_THRESHOLD: usize = 8 * 1024;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub(crate) struct ToolOutcome {
    pub output: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl std::fmt::Display) -> Self {
        Self {
            output: output.to_string(),
            is_error: true,
        }
    }
}

/// Loop-terminating outcomes a handler can raise alongside its result.
#[derive(Debug, Clone)]
pub(crate) enum LoopSignal {
    Complete(String),
    Fail(String),
    /// Fatal infrastructure failure (DB write on a critical path).
    Fatal(String),
}

/// The full tool catalog as described to the model.
pub(super) fn catalog() -> Vec<ToolDef> {
    let string_prop = |desc: &str| json!({ "type": "string", "description": desc });
    vec![
        ToolDef {
            name: "create_tasks".to_string(),
            description: "Create one or more tasks in the task graph. Dependencies may \
                          reference tasks in the same batch or existing tasks. The whole \
                          batch is rejected if any id, dependency or the dependency graph \
                          is invalid."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": string_prop("Unique task id (generated when omitted)"),
                                "type": { "type": "string",
                                          "enum": ["code", "research", "test", "review", "generic"] },
                                "title": string_prop("Short human-readable title"),
                                "description": string_prop("Complete, self-contained instructions"),
                                "priority": { "type": "integer", "minimum": 0, "maximum": 3 },
                                "depends_on": { "type": "array", "items": { "type": "string" } },
                                "constraints": { "type": "array", "items": { "type": "string" } },
                                "allowed_paths": { "type": "array", "items": { "type": "string" } },
                                "context": { "type": "object",
                                             "additionalProperties": { "type": "string" } },
                                "max_retries": { "type": "integer", "minimum": 0 }
                            },
                            "required": ["type", "title", "description"]
                        }
                    }
                },
                "required": ["tasks"]
            }),
        },
        ToolDef {
            name: "assign_task".to_string(),
            description: "Dispatch a pending task whose dependencies are all complete to a \
                          worker. Optionally pin the adapter; otherwise it is routed by \
                          task type."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": string_prop("Task to dispatch"),
                    "adapter": string_prop("Adapter name override")
                },
                "required": ["task_id"]
            }),
        },
        ToolDef {
            name: "wait_for_workers".to_string(),
            description: "Block until at least one of the given workers (default: all \
                          running workers) terminates, then return a completion record per \
                          finished worker. Applies the retry policy to failures."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "worker_ids": { "type": "array", "items": { "type": "string" } },
                    "timeout_sec": { "type": "integer", "minimum": 1 }
                }
            }),
        },
        ToolDef {
            name: "get_status".to_string(),
            description: "Snapshot of the session: task counts by status, running workers, \
                          phase and iteration."
                .to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDef {
            name: "get_task_output".to_string(),
            description: "Current output of a task's worker (or its final result). Large \
                          output is trimmed to head and tail with a pointer to the full \
                          log file."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "task_id": string_prop("Task to inspect") },
                "required": ["task_id"]
            }),
        },
        ToolDef {
            name: "approve_task".to_string(),
            description: "Accept a task's result and mark it complete.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": string_prop("Task to approve"),
                    "reason": string_prop("Optional note")
                },
                "required": ["task_id"]
            }),
        },
        ToolDef {
            name: "reject_task".to_string(),
            description: "Reject a task's result: the reason is recorded, retry bookkeeping \
                          is incremented and the task is re-queued as pending."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": string_prop("Task to reject"),
                    "reason": string_prop("Why the result is unacceptable")
                },
                "required": ["task_id"]
            }),
        },
        ToolDef {
            name: "read_file".to_string(),
            description: "Read a file inside the allowed project paths.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "path": string_prop("File path, relative to the project root") },
                "required": ["path"]
            }),
        },
        ToolDef {
            name: "list_files".to_string(),
            description: "List a directory inside the allowed project paths.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "path": string_prop("Directory path, relative to the project root") },
                "required": ["path"]
            }),
        },
        ToolDef {
            name: "complete".to_string(),
            description: "Declare the objective achieved and end the session.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "summary": string_prop("What was accomplished") },
                "required": ["summary"]
            }),
        },
        ToolDef {
            name: "fail".to_string(),
            description: "Declare the objective unachievable and end the session."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "reason": string_prop("Why the objective cannot be met") },
                "required": ["reason"]
            }),
        },
    ]
}

pub(super) async fn dispatch(
    queen: &Queen,
    cancel: &CancellationToken,
    name: &str,
    input: &Value,
) -> (ToolOutcome, Option<LoopSignal>) {
    match name {
        "create_tasks" => create_tasks(queen, input),
        "assign_task" => assign_task(queen, cancel, input).await,
        "wait_for_workers" => wait_for_workers(queen, cancel, input).await,
        "get_status" => (get_status(queen).await, None),
        "get_task_output" => (get_task_output(queen, input).await, None),
        "approve_task" => (approve_task(queen, input), None),
        "reject_task" => (reject_task(queen, input), None),
        "read_file" => (read_file(queen, input), None),
        "list_files" => (list_files(queen, input), None),
        "complete" => {
            let summary = input
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("objective complete")
                .to_string();
            queen.bus.publish(
                BusMessage::new(EventType::QueenDecision)
                    .with_payload(json!({ "decision": "complete", "summary": summary })),
            );
            (
                ToolOutcome::ok(format!("session complete: {summary}")),
                Some(LoopSignal::Complete(summary)),
            )
        }
        "fail" => {
            let reason = input
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unspecified failure")
                .to_string();
            queen.bus.publish(
                BusMessage::new(EventType::QueenDecision)
                    .with_payload(json!({ "decision": "fail", "reason": reason })),
            );
            (
                ToolOutcome::ok(format!("session failed: {reason}")),
                Some(LoopSignal::Fail(reason)),
            )
        }
        other => (ToolOutcome::error(format!("unknown tool: {other}")), None),
    }
}

// ── create_tasks ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateTasksInput {
    tasks: Vec<TaskSpec>,
}

#[derive(Deserialize)]
struct TaskSpec {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    task_type: String,
    title: String,
    description: String,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    depends_on: Option<Vec<String>>,
    #[serde(default)]
    constraints: Option<Vec<String>>,
    #[serde(default)]
    allowed_paths: Option<Vec<String>>,
    #[serde(default)]
    context: Option<HashMap<String, String>>,
    #[serde(default)]
    max_retries: Option<u32>,
}

fn create_tasks(queen: &Queen, input: &Value) -> (ToolOutcome, Option<LoopSignal>) {
    let parsed: CreateTasksInput = match serde_json::from_value(input.clone()) {
        Ok(p) => p,
        Err(e) => return (ToolOutcome::error(format!("invalid input: {e}")), None),
    };
    if parsed.tasks.is_empty() {
        return (ToolOutcome::error("no tasks supplied"), None);
    }

    // resolve ids first so intra-batch dependencies can be validated
    let mut ids = Vec::with_capacity(parsed.tasks.len());
    let mut seen: HashSet<String> = HashSet::new();
    for spec in &parsed.tasks {
        let id = match &spec.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => format!("task-{}", short_id()),
        };
        if !seen.insert(id.clone()) {
            return (
                ToolOutcome::error(format!("duplicate task id in batch: {id:?}")),
                None,
            );
        }
        if queen.graph.contains(&id) {
            return (
                ToolOutcome::error(format!("task id already exists: {id:?}")),
                None,
            );
        }
        ids.push(id);
    }

    let mut tasks = Vec::with_capacity(parsed.tasks.len());
    for (spec, id) in parsed.tasks.iter().zip(&ids) {
        let Some(task_type) = TaskType::parse(&spec.task_type) else {
            return (
                ToolOutcome::error(format!(
                    "task {id:?} has unknown type {:?} (expected code|research|test|review|generic)",
                    spec.task_type
                )),
                None,
            );
        };
        let deps = spec.depends_on.clone().unwrap_or_default();
        for dep in &deps {
            if !ids.contains(dep) && !queen.graph.contains(dep) {
                return (
                    ToolOutcome::error(format!(
                        "task {id:?} depends on unknown task {dep:?}"
                    )),
                    None,
                );
            }
        }

        let mut task = Task::new(id.clone(), task_type, &spec.title, &spec.description);
        task.priority = spec
            .priority
            .and_then(|p| Priority::try_from(p).ok())
            .unwrap_or_default();
        task.depends_on = deps;
        task.constraints = spec.constraints.clone().unwrap_or_default();
        task.allowed_paths = spec.allowed_paths.clone().unwrap_or_default();
        task.context = spec.context.clone().unwrap_or_default();
        task.max_retries = spec.max_retries.unwrap_or(queen.cfg.workers.max_retries);
        task.timeout_secs = queen.cfg.workers.default_timeout_secs;
        tasks.push(task);
    }

    // cycle-check the projected graph before anything is inserted
    let mut edges = queen.graph.edges();
    for task in &tasks {
        edges.insert(task.id.clone(), task.depends_on.clone());
    }
    if let Some(cycle) = crate::task::detect_cycle(&edges) {
        return (
            ToolOutcome::error(format!(
                "circular dependency detected: {}",
                crate::task::format_cycle(&cycle)
            )),
            None,
        );
    }

    let session_id = queen.session_id();
    if let Err(e) = queen.db.tasks().upsert_batch(&session_id, &tasks) {
        return (
            ToolOutcome::error(format!("persist tasks: {e}")),
            Some(LoopSignal::Fatal(format!("database write failed: {e}"))),
        );
    }
    for task in tasks {
        queen.graph.add(task);
    }

    (
        ToolOutcome::ok(format!("created {} tasks: {}", ids.len(), ids.join(", "))),
        None,
    )
}

// ── assign_task ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AssignTaskInput {
    task_id: String,
    #[serde(default)]
    adapter: Option<String>,
}

async fn assign_task(
    queen: &Queen,
    cancel: &CancellationToken,
    input: &Value,
) -> (ToolOutcome, Option<LoopSignal>) {
    let parsed: AssignTaskInput = match serde_json::from_value(input.clone()) {
        Ok(p) => p,
        Err(e) => return (ToolOutcome::error(format!("invalid input: {e}")), None),
    };

    let Some(handle) = queen.graph.get(&parsed.task_id) else {
        return (
            ToolOutcome::error(format!("task {:?} not found", parsed.task_id)),
            None,
        );
    };

    let status = handle.status();
    if status != TaskStatus::Pending {
        return (
            ToolOutcome::error(format!(
                "task {:?} is not pending (status: {status})",
                parsed.task_id
            )),
            None,
        );
    }
    let unmet: Vec<String> = handle
        .depends_on()
        .into_iter()
        .filter(|dep| {
            queen
                .graph
                .get(dep)
                .map(|d| d.status() != TaskStatus::Complete)
                .unwrap_or(true)
        })
        .collect();
    if !unmet.is_empty() {
        return (
            ToolOutcome::error(format!(
                "task {:?} has incomplete dependencies: {}",
                parsed.task_id,
                unmet.join(", ")
            )),
            None,
        );
    }
    if let Some(after) = handle.retry_after() {
        if chrono::Utc::now() < after {
            return (
                ToolOutcome::error(format!(
                    "task {:?} is backing off until {}",
                    parsed.task_id,
                    after.to_rfc3339()
                )),
                None,
            );
        }
    }

    let snapshot = handle.snapshot();
    let adapter = match parsed.adapter.filter(|a| !a.is_empty()) {
        Some(name) => name,
        None => match queen.router.route(&snapshot) {
            Some(name) => name,
            None => return (ToolOutcome::error("no adapters available"), None),
        },
    };

    // one health check per adapter per session, before its first dispatch
    let first_use = queen
        .health_checked
        .lock()
        .expect("health check lock poisoned")
        .insert(adapter.clone());
    if first_use {
        if let Some(instance) = queen.registry.get(&adapter) {
            if let Err(e) = instance.health_check(cancel).await {
                queen
                    .health_checked
                    .lock()
                    .expect("health check lock poisoned")
                    .remove(&adapter);
                return (
                    ToolOutcome::error(format!("adapter {adapter:?} failed health check: {e}")),
                    None,
                );
            }
        }
    }

    let worker_id = match queen.pool.spawn(cancel, &snapshot, &adapter).await {
        Ok(id) => id,
        Err(e) => return (ToolOutcome::error(format!("spawn worker: {e}")), None),
    };

    handle.set_worker_id(Some(worker_id.clone()));
    if let Err(e) = queen.graph.update_status(&parsed.task_id, TaskStatus::Assigned) {
        return (ToolOutcome::error(format!("update status: {e}")), None);
    }
    queen
        .assignments
        .lock()
        .expect("assignments lock poisoned")
        .insert(worker_id.clone(), parsed.task_id.clone());
    queen.bus.publish(
        BusMessage::new(EventType::TaskAssigned)
            .with_task(parsed.task_id.clone())
            .with_worker(worker_id.clone())
            .with_payload(json!({ "adapter": adapter })),
    );

    let signal = queen.persist_task_state(&handle);
    (
        ToolOutcome::ok(format!(
            "assigned task {} to worker {worker_id} via {adapter}",
            parsed.task_id
        )),
        signal,
    )
}

// ── wait_for_workers ───────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct WaitInput {
    #[serde(default)]
    worker_ids: Option<Vec<String>>,
    #[serde(default)]
    timeout_sec: Option<u64>,
}

async fn wait_for_workers(
    queen: &Queen,
    cancel: &CancellationToken,
    input: &Value,
) -> (ToolOutcome, Option<LoopSignal>) {
    let parsed: WaitInput = serde_json::from_value(input.clone()).unwrap_or_default();
    let timeout = Duration::from_secs(parsed.timeout_sec.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS));

    let targets: Vec<String> = match parsed.worker_ids.filter(|ids| !ids.is_empty()) {
        Some(ids) => ids,
        None => queen
            .pool
            .snapshot()
            .await
            .into_iter()
            .map(|(id, _, _)| id)
            .collect(),
    };
    if targets.is_empty() {
        return (ToolOutcome::ok("no running workers"), None);
    }

    // one bounded timer for the whole wait; dropped on every return path
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let finished = loop {
        let snapshot = queen.pool.snapshot().await;
        let finished: Vec<(String, String, WorkerStatus)> = snapshot
            .into_iter()
            .filter(|(id, _, status)| targets.contains(id) && status.is_terminal())
            .collect();
        if !finished.is_empty() {
            break finished;
        }

        tokio::select! {
            _ = &mut deadline => {
                return (
                    ToolOutcome::ok(format!(
                        "timed out after {}s with no worker completions",
                        timeout.as_secs()
                    )),
                    None,
                );
            }
            _ = cancel.cancelled() => {
                return (ToolOutcome::error("cancelled while waiting for workers"), None);
            }
            _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
        }
    };

    let mut records = Vec::new();
    let mut signal = None;
    for (worker_id, task_id, status) in &finished {
        let worker = queen.pool.get(worker_id).await;
        let result = worker.as_ref().and_then(|w| w.result());
        let output = worker
            .as_ref()
            .map(|w| w.output())
            .or_else(|| result.as_ref().map(|r| r.output.clone()))
            .unwrap_or_default();

        let record = match status {
            WorkerStatus::Complete => {
                if let Some(handle) = queen.graph.get(task_id) {
                    handle.set_result(result.clone());
                    if let Err(e) = queen.graph.update_status(task_id, TaskStatus::Complete) {
                        tracing::warn!(task_id = %task_id, "complete transition rejected: {e}");
                    }
                    signal = signal.or(queen.persist_task_state(&handle));
                }
                json!({
                    "task_id": task_id,
                    "worker_id": worker_id,
                    "status": "complete",
                    "output": queen.truncate_for_context(task_id, &output),
                })
            }
            WorkerStatus::Failed => {
                let error_text = result
                    .as_ref()
                    .map(|r| r.errors.join("; "))
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "worker failed".to_string());
                let disposition = apply_retry_policy(queen, task_id, &error_text, result.clone());
                signal = signal.or(disposition.1);
                json!({
                    "task_id": task_id,
                    "worker_id": worker_id,
                    "status": "failed",
                    "exit_code": worker.as_ref().and_then(|w| w.exit_code()),
                    "error": error_text,
                    "disposition": disposition.0,
                    "output": queen.truncate_for_context(task_id, &output),
                })
            }
            _ => continue,
        };
        records.push(record);
    }

    // reap terminated workers and drop their stale assignments
    let reaped = queen.pool.cleanup().await;
    {
        let mut assignments = queen
            .assignments
            .lock()
            .expect("assignments lock poisoned");
        for id in &reaped {
            assignments.remove(id);
        }
    }

    (
        ToolOutcome::ok(
            serde_json::to_string_pretty(&records)
                .unwrap_or_else(|_| "completion records unavailable".to_string()),
        ),
        signal,
    )
}

/// Classify a worker failure and either schedule a retry (backoff with
/// non-degenerate jitter) or mark the task failed. Returns the disposition
/// string for the completion record.
fn apply_retry_policy(
    queen: &Queen,
    task_id: &str,
    error_text: &str,
    result: Option<crate::task::TaskResult>,
) -> (String, Option<LoopSignal>) {
    let Some(handle) = queen.graph.get(task_id) else {
        return ("task missing from graph".to_string(), None);
    };
    handle.set_result(result);

    let snapshot = handle.snapshot();
    let class = errors::classify_message(error_text);

    if let Err(e) = queen.graph.update_status(task_id, TaskStatus::Failed) {
        tracing::warn!(task_id = %task_id, "failed transition rejected: {e}");
    }

    let disposition = if class == ErrorClass::Retryable && snapshot.retry_count < snapshot.max_retries
    {
        let exponent = 2u32.pow(snapshot.retry_count.min(16));
        let base = RETRY_BACKOFF_BASE * exponent;
        // thundering-herd protection needs real randomness per call
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let backoff = base.mul_f64(jitter);
        let retry_after = chrono::Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(2));

        handle.record_retry(error_text, class.to_string().as_str(), retry_after);
        handle.set_worker_id(None);
        let _ = queen.graph.update_status(task_id, TaskStatus::Retrying);
        let _ = queen.graph.update_status(task_id, TaskStatus::Pending);
        format!(
            "retry {}/{} scheduled after {:.1}s",
            snapshot.retry_count + 1,
            snapshot.max_retries,
            backoff.as_secs_f64()
        )
    } else {
        handle.record_failure(error_text, class.to_string().as_str());
        "failed permanently".to_string()
    };

    let signal = queen.persist_task_state(&handle);
    (disposition, signal)
}

// ── queries ────────────────────────────────────────────────────────────

async fn get_status(queen: &Queen) -> ToolOutcome {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for handle in queen.graph.all() {
        *counts.entry(handle.status().as_str()).or_default() += 1;
    }

    let workers: Vec<Value> = queen
        .pool
        .snapshot()
        .await
        .into_iter()
        .map(|(worker_id, task_id, status)| {
            json!({ "worker_id": worker_id, "task_id": task_id, "status": status.as_str() })
        })
        .collect();

    ToolOutcome::ok(
        serde_json::to_string_pretty(&json!({
            "phase": queen.phase(),
            "iteration": queen.iteration.load(Ordering::Relaxed),
            "tasks": counts,
            "workers": workers,
        }))
        .unwrap_or_default(),
    )
}

#[derive(Deserialize)]
struct TaskIdInput {
    task_id: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn get_task_output(queen: &Queen, input: &Value) -> ToolOutcome {
    let parsed: TaskIdInput = match serde_json::from_value(input.clone()) {
        Ok(p) => p,
        Err(e) => return ToolOutcome::error(format!("invalid input: {e}")),
    };
    let Some(handle) = queen.graph.get(&parsed.task_id) else {
        return ToolOutcome::error(format!("task {:?} not found", parsed.task_id));
    };

    let live = match handle.worker_id() {
        Some(worker_id) => queen.pool.get(&worker_id).await.map(|w| w.output()),
        None => None,
    };
    let output = live
        .or_else(|| handle.result().map(|r| r.output))
        .unwrap_or_default();
    if output.is_empty() {
        return ToolOutcome::ok("(no output yet)");
    }
    ToolOutcome::ok(queen.truncate_for_context(&parsed.task_id, &output))
}

fn approve_task(queen: &Queen, input: &Value) -> ToolOutcome {
    let parsed: TaskIdInput = match serde_json::from_value(input.clone()) {
        Ok(p) => p,
        Err(e) => return ToolOutcome::error(format!("invalid input: {e}")),
    };
    let Some(handle) = queen.graph.get(&parsed.task_id) else {
        return ToolOutcome::error(format!("task {:?} not found", parsed.task_id));
    };

    if let Err(e) = queen.graph.update_status(&parsed.task_id, TaskStatus::Complete) {
        return ToolOutcome::error(format!("approve: {e}"));
    }
    let _ = queen.persist_task_state(&handle);
    ToolOutcome::ok(format!("task {} approved", parsed.task_id))
}

fn reject_task(queen: &Queen, input: &Value) -> ToolOutcome {
    let parsed: TaskIdInput = match serde_json::from_value(input.clone()) {
        Ok(p) => p,
        Err(e) => return ToolOutcome::error(format!("invalid input: {e}")),
    };
    let Some(handle) = queen.graph.get(&parsed.task_id) else {
        return ToolOutcome::error(format!("task {:?} not found", parsed.task_id));
    };

    let reason = parsed
        .reason
        .unwrap_or_else(|| "rejected by queen".to_string());

    // route to failed first when the task is still active, then re-queue
    if handle.status() != TaskStatus::Failed {
        if let Err(e) = queen.graph.update_status(&parsed.task_id, TaskStatus::Failed) {
            return ToolOutcome::error(format!("reject: {e}"));
        }
    }
    handle.update(|t| {
        let prior = t.last_error.take();
        t.last_error = Some(match prior {
            Some(prev) => format!("{prev}; rejected: {reason}"),
            None => format!("rejected: {reason}"),
        });
        t.retry_count += 1;
        t.worker_id = None;
    });
    if let Err(e) = queen.graph.update_status(&parsed.task_id, TaskStatus::Retrying) {
        return ToolOutcome::error(format!("reject: {e}"));
    }
    if let Err(e) = queen.graph.update_status(&parsed.task_id, TaskStatus::Pending) {
        return ToolOutcome::error(format!("reject: {e}"));
    }
    let _ = queen.persist_task_state(&handle);
    ToolOutcome::ok(format!("task {} re-queued: {reason}", parsed.task_id))
}

#[derive(Deserialize)]
struct PathInput {
    path: String,
}

fn read_file(queen: &Queen, input: &Value) -> ToolOutcome {
    let parsed: PathInput = match serde_json::from_value(input.clone()) {
        Ok(p) => p,
        Err(e) => return ToolOutcome::error(format!("invalid input: {e}")),
    };
    if let Err(e) = queen.guard.check_path(&parsed.path) {
        return ToolOutcome::error(e);
    }

    let full = queen.guard.project_root().join(&parsed.path);
    if let Err(e) = queen.guard.check_file_size(&full) {
        return ToolOutcome::error(e);
    }
    match std::fs::read_to_string(&full) {
        Ok(contents) => ToolOutcome::ok(queen.truncate_for_context(&parsed.path, &contents)),
        Err(e) => ToolOutcome::error(format!("read {}: {e}", parsed.path)),
    }
}

fn list_files(queen: &Queen, input: &Value) -> ToolOutcome {
    let parsed: PathInput = match serde_json::from_value(input.clone()) {
        Ok(p) => p,
        Err(e) => return ToolOutcome::error(format!("invalid input: {e}")),
    };
    if let Err(e) = queen.guard.check_path(&parsed.path) {
        return ToolOutcome::error(e);
    }

    let full = queen.guard.project_root().join(&parsed.path);
    let entries = match std::fs::read_dir(&full) {
        Ok(entries) => entries,
        Err(e) => return ToolOutcome::error(format!("list {}: {e}", parsed.path)),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| {
            let mut name = e.file_name().to_string_lossy().into_owned();
            if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort();
    if names.is_empty() {
        return ToolOutcome::ok("(empty directory)");
    }
    ToolOutcome::ok(names.join("\n"))
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::{LlmResponse, ToolClient, ToolDef, ToolMessage};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoopClient;

    #[async_trait]
    impl ToolClient for NoopClient {
        async fn chat_with_tools(
            &self,
            _cancel: &CancellationToken,
            _system_prompt: &str,
            _messages: &[ToolMessage],
            _tools: &[ToolDef],
        ) -> Result<LlmResponse> {
            Ok(LlmResponse::default())
        }
    }

    /// Queen with an open session, ready for direct handler calls.
    fn seeded_queen(dir: &std::path::Path) -> Queen {
        let mut cfg = Config::default();
        cfg.project_dir = dir.to_path_buf();
        cfg.workers.default_adapter = "exec".to_string();
        let queen = Queen::with_client(cfg, Arc::new(NoopClient)).unwrap();
        queen.db.sessions().create("s-test", "objective").unwrap();
        *queen.session.lock().unwrap() = Some("s-test".to_string());
        queen
    }

    fn make_task(queen: &Queen, id: &str, deps: &[&str]) {
        let (outcome, _) = create_tasks(
            queen,
            &json!({"tasks": [{
                "id": id, "type": "test", "title": id, "description": "echo hi",
                "depends_on": deps,
            }]}),
        );
        assert!(!outcome.is_error, "setup failed: {}", outcome.output);
    }

    #[test]
    fn catalog_lists_exactly_the_eleven_tools() {
        let names: Vec<String> = catalog().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "create_tasks",
                "assign_task",
                "wait_for_workers",
                "get_status",
                "get_task_output",
                "approve_task",
                "reject_task",
                "read_file",
                "list_files",
                "complete",
                "fail",
            ]
        );
    }

    #[tokio::test]
    async fn create_tasks_generates_ids_and_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());

        let (outcome, signal) = create_tasks(
            &queen,
            &json!({"tasks": [{"type": "code", "title": "t", "description": "d"}]}),
        );
        assert!(!outcome.is_error, "{}", outcome.output);
        assert!(signal.is_none());
        assert!(outcome.output.starts_with("created 1 tasks: task-"));

        let task = queen.graph.all()[0].snapshot();
        assert_eq!(task.max_retries, queen.cfg.workers.max_retries);
        assert_eq!(task.timeout_secs, queen.cfg.workers.default_timeout_secs);
        assert_eq!(task.status, TaskStatus::Pending);
        // persisted too
        assert_eq!(queen.db.tasks().get_tasks("s-test").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_tasks_rejects_unknown_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());

        let (outcome, _) = create_tasks(
            &queen,
            &json!({"tasks": [{"id": "x", "type": "code", "title": "x",
                               "description": "d", "depends_on": ["missing"]}]}),
        );
        assert!(outcome.is_error);
        assert!(outcome.output.contains("unknown task"));
        assert!(queen.graph.is_empty());
    }

    #[tokio::test]
    async fn create_tasks_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        make_task(&queen, "t1", &[]);

        let (outcome, _) = create_tasks(
            &queen,
            &json!({"tasks": [{"id": "t1", "type": "code", "title": "again",
                               "description": "d"}]}),
        );
        assert!(outcome.is_error);
        assert!(outcome.output.contains("already exists"));
    }

    #[tokio::test]
    async fn create_tasks_allows_intra_batch_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());

        let (outcome, _) = create_tasks(
            &queen,
            &json!({"tasks": [
                {"id": "a", "type": "code", "title": "a", "description": "d"},
                {"id": "b", "type": "code", "title": "b", "description": "d",
                 "depends_on": ["a"]},
            ]}),
        );
        assert!(!outcome.is_error, "{}", outcome.output);
        assert_eq!(queen.graph.len(), 2);
    }

    #[tokio::test]
    async fn assign_rejects_unmet_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        make_task(&queen, "base", &[]);
        make_task(&queen, "top", &["base"]);

        let cancel = CancellationToken::new();
        let (outcome, _) =
            assign_task(&queen, &cancel, &json!({"task_id": "top"})).await;
        assert!(outcome.is_error);
        assert!(outcome.output.contains("incomplete dependencies"));
    }

    #[tokio::test]
    async fn assign_rejects_non_pending_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        make_task(&queen, "t1", &[]);
        queen.graph.update_status("t1", TaskStatus::Cancelled).unwrap();

        let cancel = CancellationToken::new();
        let (outcome, _) = assign_task(&queen, &cancel, &json!({"task_id": "t1"})).await;
        assert!(outcome.is_error);
        assert!(outcome.output.contains("not pending"));
    }

    #[tokio::test]
    async fn assign_dispatches_to_exec_worker() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        make_task(&queen, "t1", &[]);

        let cancel = CancellationToken::new();
        let (outcome, _) = assign_task(&queen, &cancel, &json!({"task_id": "t1"})).await;
        assert!(!outcome.is_error, "{}", outcome.output);
        assert!(outcome.output.contains("via exec"));

        let handle = queen.graph.get("t1").unwrap();
        assert_eq!(handle.status(), TaskStatus::Assigned);
        assert!(handle.worker_id().is_some());
        assert_eq!(queen.assignments.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn wait_with_no_workers_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        let cancel = CancellationToken::new();

        let (outcome, _) = wait_for_workers(&queen, &cancel, &json!({})).await;
        assert!(!outcome.is_error);
        assert!(outcome.output.contains("no running workers"));
    }

    #[tokio::test]
    async fn wait_reaps_and_prunes_assignments() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        make_task(&queen, "t1", &[]);

        let cancel = CancellationToken::new();
        let (outcome, _) = assign_task(&queen, &cancel, &json!({"task_id": "t1"})).await;
        assert!(!outcome.is_error, "{}", outcome.output);

        let (outcome, _) =
            wait_for_workers(&queen, &cancel, &json!({"timeout_sec": 30})).await;
        assert!(!outcome.is_error, "{}", outcome.output);
        assert!(outcome.output.contains("\"status\": \"complete\""));

        assert_eq!(queen.graph.get("t1").unwrap().status(), TaskStatus::Complete);
        assert!(queen.assignments.lock().unwrap().is_empty());
        assert_eq!(queen.pool.count().await, 0);
    }

    #[tokio::test]
    async fn approve_completes_an_assigned_task() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        make_task(&queen, "t1", &[]);
        queen.graph.update_status("t1", TaskStatus::Assigned).unwrap();

        let outcome = approve_task(&queen, &json!({"task_id": "t1"}));
        assert!(!outcome.is_error, "{}", outcome.output);
        assert_eq!(queen.graph.get("t1").unwrap().status(), TaskStatus::Complete);
    }

    #[tokio::test]
    async fn approve_rejects_pending_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        make_task(&queen, "t1", &[]);

        let outcome = approve_task(&queen, &json!({"task_id": "t1"}));
        assert!(outcome.is_error);
    }

    #[tokio::test]
    async fn reject_requeues_with_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        make_task(&queen, "t1", &[]);
        queen.graph.update_status("t1", TaskStatus::Assigned).unwrap();

        let outcome = reject_task(
            &queen,
            &json!({"task_id": "t1", "reason": "wrong file touched"}),
        );
        assert!(!outcome.is_error, "{}", outcome.output);

        let task = queen.graph.get("t1").unwrap().snapshot();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task
            .last_error
            .as_deref()
            .unwrap()
            .contains("rejected: wrong file touched"));
        assert!(task.worker_id.is_none());
    }

    #[tokio::test]
    async fn read_file_is_guarded() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        std::fs::write(dir.path().join("notes.txt"), "hello notes").unwrap();

        let outcome = read_file(&queen, &json!({"path": "notes.txt"}));
        assert!(!outcome.is_error);
        assert!(outcome.output.contains("hello notes"));

        let outcome = read_file(&queen, &json!({"path": "../escape.txt"}));
        assert!(outcome.is_error);
        assert!(outcome.output.contains("outside allowed"));
    }

    #[tokio::test]
    async fn list_files_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("README.md"), "x").unwrap();

        let outcome = list_files(&queen, &json!({"path": "."}));
        assert!(!outcome.is_error);
        let lines: Vec<&str> = outcome.output.lines().collect();
        assert!(lines.contains(&"README.md"));
        assert!(lines.contains(&"src/"));
    }

    #[tokio::test]
    async fn unknown_tool_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        let cancel = CancellationToken::new();

        let (outcome, signal) = dispatch(&queen, &cancel, "summon_bees", &json!({})).await;
        assert!(outcome.is_error);
        assert!(outcome.output.contains("unknown tool"));
        assert!(signal.is_none());
    }

    #[tokio::test]
    async fn complete_and_fail_raise_signals() {
        let dir = tempfile::tempdir().unwrap();
        let queen = seeded_queen(dir.path());
        let cancel = CancellationToken::new();

        let (outcome, signal) =
            dispatch(&queen, &cancel, "complete", &json!({"summary": "all done"})).await;
        assert!(!outcome.is_error);
        assert!(matches!(signal, Some(LoopSignal::Complete(s)) if s == "all done"));

        let (_, signal) =
            dispatch(&queen, &cancel, "fail", &json!({"reason": "impossible"})).await;
        assert!(matches!(signal, Some(LoopSignal::Fail(r)) if r == "impossible"));
    }
}
