//! Shared process machinery for adapter workers: capped output capture,
//! spawn-and-wait with cancellation, and process-tree termination.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusMessage, EventType, MessageBus};
use crate::errors;
use crate::task::TaskResult;
use crate::worker::WorkerStatus;

const KILL_GRACE: Duration = Duration::from_millis(800);

static ANSI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").expect("valid regex"));

/// Coding CLIs colour their output; the model does not need the escapes.
fn strip_ansi(text: &str) -> String {
    ANSI_PATTERN.replace_all(text, "").into_owned()
}

pub(crate) const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Thread-safe output sink with a byte cap. Once the cap is reached a single
/// truncation marker is appended and subsequent bytes are counted but
/// dropped, so writers keep succeeding while memory stays bounded.
pub(crate) struct CappedBuffer {
    buf: String,
    cap: usize,
    dropped: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap: cap.max(1),
            dropped: 0,
            truncated: false,
        }
    }

    /// Append text, honouring the cap. Returns the number of bytes dropped
    /// by this write.
    pub fn push(&mut self, text: &str) -> usize {
        if self.truncated {
            self.dropped += text.len();
            return text.len();
        }
        let remaining = self.cap.saturating_sub(self.buf.len());
        if text.len() <= remaining {
            self.buf.push_str(text);
            return 0;
        }

        // cut at a char boundary inside the allowance
        let mut cut = remaining;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buf.push_str(&text[..cut]);
        self.buf.push_str(TRUNCATION_MARKER);
        self.truncated = true;
        let dropped = text.len() - cut;
        self.dropped += dropped;
        dropped
    }

    pub fn contents(&self) -> String {
        self.buf.clone()
    }

    pub fn dropped_bytes(&self) -> usize {
        self.dropped
    }
}

/// Mutable worker state shared between the worker facade, its supervisor
/// task and the pool.
pub(crate) struct ProcessState {
    pub status: WorkerStatus,
    pub result: Option<TaskResult>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

impl ProcessState {
    pub fn new() -> Self {
        Self {
            status: WorkerStatus::Idle,
            result: None,
            pid: None,
            exit_code: None,
        }
    }

    pub fn fail(&mut self, errors: Vec<String>, output: String) {
        self.status = WorkerStatus::Failed;
        self.result = Some(TaskResult {
            success: false,
            output,
            errors,
            ..Default::default()
        });
    }
}

/// Spawn the command and drive it to completion in a background task.
///
/// Stdout lines stream into the capped buffer (and onto the bus as
/// worker.output); stderr is collected separately and appended under a
/// marker at exit. Cancellation of `cancel` tears the process tree down.
pub(crate) fn run_process(
    mut cmd: Command,
    stdin_data: Option<String>,
    cancel: CancellationToken,
    worker_id: String,
    task_id: String,
    state: Arc<Mutex<ProcessState>>,
    output: Arc<Mutex<CappedBuffer>>,
    bus: MessageBus,
) -> Result<()> {
    cmd.stdin(if stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().context("spawn worker process")?;
    {
        let mut s = state.lock().expect("worker state poisoned");
        s.status = WorkerStatus::Running;
        s.pid = child.id();
    }

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(data.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stderr_buf = Arc::new(Mutex::new(CappedBuffer::new(64 * 1024)));

    let out_handle = {
        let output = Arc::clone(&output);
        let bus = bus.clone();
        let worker_id = worker_id.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = strip_ansi(&line);
                output
                    .lock()
                    .expect("output buffer poisoned")
                    .push(&format!("{line}\n"));
                bus.publish(
                    BusMessage::new(EventType::WorkerOutput)
                        .with_worker(worker_id.clone())
                        .with_task(task_id.clone())
                        .with_payload(json!({ "stream": "stdout", "chunk": line })),
                );
            }
        })
    };

    let err_handle = {
        let stderr_buf = Arc::clone(&stderr_buf);
        tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_buf
                    .lock()
                    .expect("stderr buffer poisoned")
                    .push(&format!("{}\n", strip_ansi(&line)));
            }
        })
    };

    tokio::spawn(async move {
        let wait_result = tokio::select! {
            result = child.wait() => Some(result),
            _ = cancel.cancelled() => {
                terminate_process_tree(&mut child).await;
                None
            }
        };

        let _ = out_handle.await;
        let _ = err_handle.await;

        let stderr_text = stderr_buf.lock().expect("stderr buffer poisoned").contents();
        if !stderr_text.is_empty() {
            output
                .lock()
                .expect("output buffer poisoned")
                .push(&format!("\n[STDERR]\n{stderr_text}"));
        }
        let stdout_text = output.lock().expect("output buffer poisoned").contents();

        let mut s = state.lock().expect("worker state poisoned");
        match wait_result {
            None => {
                s.fail(vec!["cancelled".to_string()], stdout_text);
            }
            Some(Err(e)) => {
                s.fail(vec![format!("wait failed: {e}")], stdout_text);
            }
            Some(Ok(status)) if status.success() => {
                s.status = WorkerStatus::Complete;
                s.exit_code = status.code();
                s.result = Some(TaskResult {
                    success: true,
                    output: stdout_text,
                    ..Default::default()
                });
            }
            Some(Ok(status)) => {
                let code = status.code();
                s.exit_code = code;
                let message = match code {
                    Some(c) => format!("exit status {c}"),
                    None => "terminated by signal".to_string(),
                };
                let class = errors::classify_with_exit_code(
                    &format!("{message}\n{stderr_text}"),
                    code,
                );
                let tagged = if class == errors::ErrorClass::Retryable {
                    format!("[retryable] {message}")
                } else {
                    message
                };
                let mut errs = vec![tagged];
                if !stderr_text.is_empty() {
                    errs.push(stderr_text);
                }
                s.fail(errs, stdout_text);
            }
        }
    });

    Ok(())
}

/// SIGTERM the process group, wait a short grace, then SIGKILL what remains.
pub(crate) async fn terminate_process_tree(child: &mut tokio::process::Child) {
    let Some(pid) = child.id() else {
        let _ = child.kill().await;
        return;
    };

    #[cfg(unix)]
    {
        let pgid = format!("-{pid}");
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pgid])
            .status();
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        let _ = std::process::Command::new("kill")
            .args(["-KILL", &pgid])
            .status();
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Kill a process tree by pid, for workers whose child handle lives in the
/// supervisor task.
pub(crate) fn signal_process_tree(pid: u32) {
    #[cfg(unix)]
    {
        let pgid = format!("-{pid}");
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pgid])
            .status();
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
    }
}
