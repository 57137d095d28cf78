//! Worker contract and the pool that supervises them.

mod pool;

pub use pool::WorkerPool;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::task::{Task, TaskResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Running,
    Complete,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Running => "running",
            WorkerStatus::Complete => "complete",
            WorkerStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::Complete | WorkerStatus::Failed)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ephemeral external-process executor for a single task.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &str;

    fn adapter_name(&self) -> &str;

    /// Start the task. Guard rejections fail the worker synchronously (the
    /// call still returns `Ok`); spawn errors propagate.
    async fn spawn(&self, cancel: CancellationToken, task: Task) -> Result<()>;

    fn monitor(&self) -> WorkerStatus;

    fn result(&self) -> Option<TaskResult>;

    /// Exit code of the underlying process, when it has one.
    fn exit_code(&self) -> Option<i32> {
        None
    }

    /// Terminate the underlying process, if any.
    async fn kill(&self) -> Result<()>;

    /// Output captured so far (bounded).
    fn output(&self) -> String;
}

/// Creates a worker for (worker_id, adapter_name).
pub type WorkerFactory = Box<dyn Fn(&str, &str) -> Result<Arc<dyn Worker>> + Send + Sync>;
