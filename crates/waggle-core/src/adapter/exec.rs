//! Raw-shell adapter: runs the task description (or `context["command"]`)
//! as a shell script. The fallback when no AI CLI is installed, and the
//! right tool for pure shell tasks (tests, builds, linting). The only
//! adapter whose scripts go through the command blocklist by default.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::process::{run_process, signal_process_tree, CappedBuffer, ProcessState};
use super::Adapter;
use crate::bus::MessageBus;
use crate::safety::Guard;
use crate::task::{Task, TaskResult};
use crate::worker::{Worker, WorkerStatus};

pub struct ExecAdapter {
    shell: String,
    work_dir: PathBuf,
    guard: Arc<Guard>,
    bus: MessageBus,
    max_output: usize,
}

impl ExecAdapter {
    pub fn new(
        work_dir: PathBuf,
        guard: Arc<Guard>,
        bus: MessageBus,
        max_output: usize,
    ) -> Self {
        let shell = which::which("bash")
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/bin/sh".to_string());
        Self {
            shell,
            work_dir,
            guard,
            bus,
            max_output,
        }
    }
}

#[async_trait]
impl Adapter for ExecAdapter {
    fn name(&self) -> &str {
        "exec"
    }

    fn available(&self) -> bool {
        true
    }

    async fn health_check(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn create_worker(&self, id: &str) -> Arc<dyn Worker> {
        Arc::new(ExecWorker {
            id: id.to_string(),
            shell: self.shell.clone(),
            work_dir: self.work_dir.clone(),
            guard: Arc::clone(&self.guard),
            bus: self.bus.clone(),
            state: Arc::new(Mutex::new(ProcessState::new())),
            output: Arc::new(Mutex::new(CappedBuffer::new(self.max_output))),
        })
    }
}

pub struct ExecWorker {
    id: String,
    shell: String,
    work_dir: PathBuf,
    guard: Arc<Guard>,
    bus: MessageBus,
    state: Arc<Mutex<ProcessState>>,
    output: Arc<Mutex<CappedBuffer>>,
}

#[async_trait]
impl Worker for ExecWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn adapter_name(&self) -> &str {
        "exec"
    }

    async fn spawn(&self, cancel: CancellationToken, task: Task) -> Result<()> {
        // for exec, the script body is the task description unless the
        // context carries an explicit command
        let script = task
            .context
            .get("command")
            .cloned()
            .unwrap_or_else(|| task.description.clone());

        if let Err(e) = self.guard.validate_task_paths(&task.allowed_paths) {
            self.state
                .lock()
                .expect("worker state poisoned")
                .fail(vec![format!("safety check failed: {e}")], String::new());
            return Ok(());
        }
        if self.guard.enforce_command_blocking("exec") {
            if let Err(e) = self.guard.check_command(&script) {
                self.state
                    .lock()
                    .expect("worker state poisoned")
                    .fail(vec![format!("safety check failed: {e}")], String::new());
                return Ok(());
            }
        }

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c").arg(&script);
        cmd.current_dir(&self.work_dir);

        run_process(
            cmd,
            None,
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
