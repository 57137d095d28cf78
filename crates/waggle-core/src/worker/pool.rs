//! Capacity-limited worker pool with per-worker supervision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Worker, WorkerFactory, WorkerStatus};
use crate::bus::{BusMessage, EventType, MessageBus};
use crate::task::Task;

const MONITOR_INTERVAL: Duration = Duration::from_millis(250);

struct PoolEntry {
    worker: Arc<dyn Worker>,
    task_id: String,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

pub struct WorkerPool {
    max_workers: usize,
    factory: WorkerFactory,
    bus: MessageBus,
    // tokio Mutex so the capacity check and the admit stay atomic across
    // the factory/spawn awaits (no TOCTOU window)
    entries: tokio::sync::Mutex<HashMap<String, PoolEntry>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, factory: WorkerFactory, bus: MessageBus) -> Self {
        Self {
            max_workers: max_workers.max(1),
            factory,
            bus,
            entries: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a worker for the task. Fails fast when the pool is at
    /// capacity; a failed spawn never holds a slot or a live cancel guard.
    pub async fn spawn(
        &self,
        parent: &CancellationToken,
        task: &Task,
        adapter_name: &str,
    ) -> Result<String> {
        let mut entries = self.entries.lock().await;

        let in_flight = entries
            .values()
            .filter(|e| !e.worker.monitor().is_terminal())
            .count();
        if in_flight >= self.max_workers {
            return Err(anyhow!(
                "worker pool full ({in_flight}/{})",
                self.max_workers
            ));
        }

        let worker_id = format!("bee-{}", short_id());
        let worker = (self.factory)(&worker_id, adapter_name)?;

        let spawn_cancel = parent.child_token();
        if let Err(e) = worker.spawn(spawn_cancel.clone(), task.clone()).await {
            // release the cancel guard immediately; no slot was taken
            spawn_cancel.cancel();
            return Err(e);
        }

        self.bus.publish(
            BusMessage::new(EventType::WorkerSpawned)
                .with_worker(worker_id.clone())
                .with_task(task.id.clone())
                .with_payload(json!({ "adapter": adapter_name })),
        );

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&worker),
            task.id.clone(),
            task.timeout(),
            parent.clone(),
            spawn_cancel.clone(),
            self.bus.clone(),
        ));

        entries.insert(
            worker_id.clone(),
            PoolEntry {
                worker,
                task_id: task.id.clone(),
                cancel: spawn_cancel,
                supervisor,
            },
        );

        Ok(worker_id)
    }

    pub async fn get(&self, worker_id: &str) -> Option<Arc<dyn Worker>> {
        self.entries
            .lock()
            .await
            .get(worker_id)
            .map(|e| Arc::clone(&e.worker))
    }

    /// (worker_id, task_id, status) for every tracked worker.
    pub async fn snapshot(&self) -> Vec<(String, String, WorkerStatus)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.task_id.clone(), e.worker.monitor()))
            .collect()
    }

    pub async fn running_ids(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, e)| !e.worker.monitor().is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Reap terminated workers. Returns the reaped worker ids so the caller
    /// can drop stale worker-to-task assignments. Each reaped worker's
    /// supervisor is awaited, not aborted, so its terminal event is always
    /// published before the worker disappears from the pool.
    pub async fn cleanup(&self) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let reaped: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.worker.monitor().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &reaped {
            if let Some(entry) = entries.remove(id) {
                if let Err(e) = entry.supervisor.await {
                    if !e.is_cancelled() {
                        tracing::warn!(worker_id = %id, "supervisor join: {e}");
                    }
                }
            }
        }
        reaped
    }

    /// Terminate everything. Collected errors are returned to the caller
    /// instead of being logged here.
    pub async fn kill_all(&self) -> Vec<anyhow::Error> {
        let entries = {
            let mut guard = self.entries.lock().await;
            std::mem::take(&mut *guard)
        };
        let mut errors = Vec::new();
        for (_, entry) in entries {
            entry.cancel.cancel();
            if let Err(e) = entry.worker.kill().await {
                errors.push(e);
            }
            entry.supervisor.abort();
        }
        errors
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Watch one worker: enforce its deadline, propagate cancellation, publish
/// the terminal event. The deadline is a single stoppable timer, not a
/// repeating `time::after` construct.
async fn supervise(
    worker: Arc<dyn Worker>,
    task_id: String,
    timeout: Option<Duration>,
    parent: CancellationToken,
    spawn_cancel: CancellationToken,
    bus: MessageBus,
) {
    let deadline = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut poll = tokio::time::interval(MONITOR_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = parent.cancelled() => {
                // child token is already cancelled with the parent; make the
                // kill explicit for workers without a live process
                spawn_cancel.cancel();
                let _ = worker.kill().await;
                bus.publish(
                    BusMessage::new(EventType::WorkerFailed)
                        .with_worker(worker.id().to_string())
                        .with_task(task_id.clone())
                        .with_payload(json!({ "error": "cancelled" })),
                );
                return;
            }
            _ = &mut deadline => {
                spawn_cancel.cancel();
                let _ = worker.kill().await;
                bus.publish(
                    BusMessage::new(EventType::WorkerFailed)
                        .with_worker(worker.id().to_string())
                        .with_task(task_id.clone())
                        .with_payload(json!({ "error": "timed out" })),
                );
                return;
            }
            _ = poll.tick() => {
                match worker.monitor() {
                    WorkerStatus::Complete => {
                        bus.publish(
                            BusMessage::new(EventType::WorkerCompleted)
                                .with_worker(worker.id().to_string())
                                .with_task(task_id.clone())
                                .with_payload(json!({ "success": true })),
                        );
                        return;
                    }
                    WorkerStatus::Failed => {
                        let error = worker
                            .result()
                            .map(|r| r.errors.join("; "))
                            .unwrap_or_else(|| "worker failed".to_string());
                        bus.publish(
                            BusMessage::new(EventType::WorkerFailed)
                                .with_worker(worker.id().to_string())
                                .with_task(task_id.clone())
                                .with_payload(json!({ "error": error })),
                        );
                        return;
                    }
                    WorkerStatus::Idle | WorkerStatus::Running => {}
                }
            }
        }
    }
}
