//! Task model: the unit of work the queen delegates to workers.

mod graph;

pub use graph::{detect_cycle, format_cycle, TaskGraph};

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Complete,
    Failed,
    Retrying,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "assigned" => Some(TaskStatus::Assigned),
            "running" => Some(TaskStatus::Running),
            "complete" => Some(TaskStatus::Complete),
            "failed" => Some(TaskStatus::Failed),
            "retrying" => Some(TaskStatus::Retrying),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are never overwritten by the graph.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Cancelled)
    }

    /// Legal transition table. `retrying -> pending` re-queues a task after
    /// backoff; everything out of a terminal status is rejected.
    /// `assigned -> complete` is admitted because a fast worker can finish
    /// before the loop ever observes it running.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Running)
                | (Assigned, Complete)
                | (Assigned, Cancelled)
                | (Assigned, Failed)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Retrying)
                | (Failed, Retrying)
                | (Failed, Cancelled)
                | (Retrying, Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Code,
    Research,
    Test,
    Review,
    Generic,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Code => "code",
            TaskType::Research => "research",
            TaskType::Test => "test",
            TaskType::Review => "review",
            TaskType::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(TaskType::Code),
            "research" => Some(TaskType::Research),
            "test" => Some(TaskType::Test),
            "review" => Some(TaskType::Review),
            "generic" => Some(TaskType::Generic),
            _ => None,
        }
    }

    pub fn all() -> [TaskType; 5] {
        [
            TaskType::Code,
            TaskType::Research,
            TaskType::Test,
            TaskType::Review,
            TaskType::Generic,
        ]
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Critical),
            other => Err(format!("priority out of range: {other}")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        match p {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

/// Outcome reported by a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub artifacts: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-task deadline in seconds; 0 disables it.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Not eligible to run before this instant (retry backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        task_type: TaskType,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type,
            status: TaskStatus::Pending,
            priority: Priority::Normal,
            title: title.into(),
            description: description.into(),
            constraints: Vec::new(),
            context: HashMap::new(),
            allowed_paths: Vec::new(),
            worker_id: None,
            result: None,
            max_retries: 0,
            retry_count: 0,
            last_error: None,
            last_error_type: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_secs: 0,
            depends_on: Vec::new(),
            retry_after: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Shared, lock-guarded task state.
///
/// The id is immutable and readable without the lock; everything else goes
/// through accessors so a UI thread reading while the loop writes cannot
/// observe a torn task.
pub struct TaskHandle {
    id: String,
    state: Mutex<Task>,
}

impl TaskHandle {
    pub fn new(task: Task) -> Self {
        Self {
            id: task.id.clone(),
            state: Mutex::new(task),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> Task {
        self.state.lock().expect("task lock poisoned").clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().expect("task lock poisoned").status
    }

    pub fn depends_on(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("task lock poisoned")
            .depends_on
            .clone()
    }

    pub fn worker_id(&self) -> Option<String> {
        self.state
            .lock()
            .expect("task lock poisoned")
            .worker_id
            .clone()
    }

    pub fn set_worker_id(&self, worker_id: Option<String>) {
        self.state.lock().expect("task lock poisoned").worker_id = worker_id;
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.state.lock().expect("task lock poisoned").result.clone()
    }

    pub fn set_result(&self, result: Option<TaskResult>) {
        self.state.lock().expect("task lock poisoned").result = result;
    }

    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expect("task lock poisoned").retry_after
    }

    /// Record a retry decision: error bookkeeping plus the next eligibility
    /// instant.
    pub fn record_retry(&self, error: &str, error_type: &str, retry_after: DateTime<Utc>) {
        let mut t = self.state.lock().expect("task lock poisoned");
        t.retry_count += 1;
        t.last_error = Some(error.to_string());
        t.last_error_type = Some(error_type.to_string());
        t.retry_after = Some(retry_after);
    }

    pub fn record_failure(&self, error: &str, error_type: &str) {
        let mut t = self.state.lock().expect("task lock poisoned");
        t.last_error = Some(error.to_string());
        t.last_error_type = Some(error_type.to_string());
    }

    /// Mutate under the lock. Used by callers that need a compound update.
    pub fn update<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut t = self.state.lock().expect("task lock poisoned");
        f(&mut t)
    }

    /// Apply a status change with timestamp bookkeeping. Returns the old
    /// status. Transition legality is checked by the graph, not here.
    pub(crate) fn apply_status(&self, status: TaskStatus) -> TaskStatus {
        let mut t = self.state.lock().expect("task lock poisoned");
        let old = t.status;
        t.status = status;
        let now = Utc::now();
        match status {
            TaskStatus::Running => t.started_at = Some(now),
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Cancelled => {
                t.completed_at = Some(now)
            }
            _ => {}
        }
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Retrying));
        assert!(Failed.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Pending));
        assert!(!Complete.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn priority_serde_uses_integers() {
        let p: Priority = serde_json::from_str("3").unwrap();
        assert_eq!(p, Priority::Critical);
        assert_eq!(serde_json::to_string(&Priority::Low).unwrap(), "0");
        assert!(serde_json::from_str::<Priority>("9").is_err());
    }

    #[test]
    fn handle_guards_compound_updates() {
        let handle = TaskHandle::new(Task::new("t1", TaskType::Code, "title", "desc"));
        handle.record_retry("connection reset", "retryable", Utc::now());
        let snap = handle.snapshot();
        assert_eq!(snap.retry_count, 1);
        assert_eq!(snap.last_error_type.as_deref(), Some("retryable"));
        assert!(snap.retry_after.is_some());
    }

    #[test]
    fn apply_status_stamps_timestamps() {
        let handle = TaskHandle::new(Task::new("t1", TaskType::Test, "t", "d"));
        handle.apply_status(TaskStatus::Running);
        assert!(handle.snapshot().started_at.is_some());
        handle.apply_status(TaskStatus::Complete);
        assert!(handle.snapshot().completed_at.is_some());
    }
}
