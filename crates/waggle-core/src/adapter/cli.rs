//! Generic CLI adapter: wraps a coding CLI that takes a prompt and works
//! autonomously in the project directory (claude-code, codex, gemini, kimi,
//! opencode are all instances with different invocations).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::process::{run_process, signal_process_tree, CappedBuffer, ProcessState};
use super::{build_prompt, Adapter, READ_ONLY_WARNING};
use crate::bus::MessageBus;
use crate::safety::Guard;
use crate::task::{Task, TaskResult};
use crate::worker::{Worker, WorkerStatus};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// How the prompt reaches the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Appended as the final argument (`claude -p "<prompt>"`).
    Arg,
    /// Written to the process's stdin (`gemini < prompt`).
    Stdin,
}

#[derive(Clone)]
pub struct CliAdapterConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub work_dir: PathBuf,
    pub prompt_mode: PromptMode,
}

pub struct CliAdapter {
    cfg: CliAdapterConfig,
    guard: Arc<Guard>,
    bus: MessageBus,
    max_output: usize,
}

impl CliAdapter {
    pub fn new(
        cfg: CliAdapterConfig,
        guard: Arc<Guard>,
        bus: MessageBus,
        max_output: usize,
    ) -> Self {
        Self {
            cfg,
            guard,
            bus,
            max_output,
        }
    }
}

#[async_trait]
impl Adapter for CliAdapter {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn available(&self) -> bool {
        which::which(&self.cfg.command).is_ok()
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&self.cfg.command);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("{} health check spawn failed: {e}", self.cfg.name))?;
        tokio::select! {
            result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, child.wait()) => {
                match result {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(anyhow!("{} health check failed: {e}", self.cfg.name)),
                    Err(_) => {
                        let _ = child.kill().await;
                        Err(anyhow!("{} health check timed out", self.cfg.name))
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(anyhow!("cancelled"))
            }
        }
    }

    fn create_worker(&self, id: &str) -> Arc<dyn Worker> {
        Arc::new(CliWorker {
            id: id.to_string(),
            cfg: self.cfg.clone(),
            guard: Arc::clone(&self.guard),
            bus: self.bus.clone(),
            state: Arc::new(Mutex::new(ProcessState::new())),
            output: Arc::new(Mutex::new(CappedBuffer::new(self.max_output))),
        })
    }
}

pub struct CliWorker {
    id: String,
    cfg: CliAdapterConfig,
    guard: Arc<Guard>,
    bus: MessageBus,
    state: Arc<Mutex<ProcessState>>,
    output: Arc<Mutex<CappedBuffer>>,
}

#[async_trait]
impl Worker for CliWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn adapter_name(&self) -> &str {
        &self.cfg.name
    }

    async fn spawn(&self, cancel: CancellationToken, task: Task) -> Result<()> {
        if let Err(e) = self.guard.validate_task_paths(&task.allowed_paths) {
            self.state
                .lock()
                .expect("worker state poisoned")
                .fail(vec![format!("safety check failed: {e}")], String::new());
            return Ok(());
        }
        if self.guard.enforce_command_blocking(&self.cfg.name) {
            if let Err(e) = self.guard.check_command(&task.description) {
                self.state
                    .lock()
                    .expect("worker state poisoned")
                    .fail(vec![format!("safety check failed: {e}")], String::new());
                return Ok(());
            }
        }

        let mut prompt = build_prompt(&task);
        if self.guard.is_read_only() {
            prompt = format!("{READ_ONLY_WARNING}{prompt}");
        }

        let mut cmd = tokio::process::Command::new(&self.cfg.command);
        cmd.args(&self.cfg.args);
        let stdin_data = match self.cfg.prompt_mode {
            PromptMode::Arg => {
                cmd.arg(&prompt);
                None
            }
            PromptMode::Stdin => Some(prompt),
        };
        for (key, value) in &self.cfg.env {
            cmd.env(key, value);
        }
        cmd.current_dir(&self.cfg.work_dir);

        run_process(
            cmd,
            stdin_data,
            cancel,
            self.id.clone(),
            task.id.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.output),
            self.bus.clone(),
        )
    }

    fn monitor(&self) -> WorkerStatus {
        self.state.lock().expect("worker state poisoned").status
    }

    fn result(&self) -> Option<TaskResult> {
        self.state
            .lock()
            .expect("worker state poisoned")
            .result
            .clone()
    }

    fn exit_code(&self) -> Option<i32> {
        self.state.lock().expect("worker state poisoned").exit_code
    }

    async fn kill(&self) -> Result<()> {
        let pid = {
            let mut s = self.state.lock().expect("worker state poisoned");
            if !s.status.is_terminal() {
                s.status = WorkerStatus::Failed;
            }
            s.pid
        };
        if let Some(pid) = pid {
            signal_process_tree(pid);
        }
        Ok(())
    }

    fn output(&self) -> String {
        self.output
            .lock()
            .expect("output buffer poisoned")
            .contents()
    }
}
