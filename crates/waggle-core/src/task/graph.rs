//! Dependency graph over tasks.
//!
//! Mutations serialise through the outer write lock; readers take consistent
//! snapshots under the read lock. Individual task fields are additionally
//! guarded by the per-task lock in [`TaskHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::json;

use crate::bus::{BusMessage, EventType, MessageBus};
use crate::task::{Task, TaskHandle, TaskStatus};

pub struct TaskGraph {
    tasks: RwLock<HashMap<String, Arc<TaskHandle>>>,
    bus: MessageBus,
}

impl TaskGraph {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Insert a task and announce it.
    pub fn add(&self, task: Task) -> Arc<TaskHandle> {
        let payload = serde_json::to_value(&task).unwrap_or_default();
        let id = task.id.clone();
        let handle = Arc::new(TaskHandle::new(task));
        self.tasks
            .write()
            .expect("graph lock poisoned")
            .insert(id.clone(), Arc::clone(&handle));
        self.bus.publish(
            BusMessage::new(EventType::TaskCreated)
                .with_task(id)
                .with_payload(payload),
        );
        handle
    }

    /// Insert a task without announcing it. Used when rebuilding the graph
    /// from storage on resume, where task.created already happened in a
    /// previous run.
    pub fn restore(&self, task: Task) -> Arc<TaskHandle> {
        let id = task.id.clone();
        let handle = Arc::new(TaskHandle::new(task));
        self.tasks
            .write()
            .expect("graph lock poisoned")
            .insert(id, Arc::clone(&handle));
        handle
    }

    pub fn get(&self, id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks
            .read()
            .expect("graph lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks
            .read()
            .expect("graph lock poisoned")
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.read().expect("graph lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a status change, enforcing the legal-transition table and
    /// stamping started/completed timestamps. Emits task.status_changed.
    pub fn update_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let handle = {
            let tasks = self.tasks.write().expect("graph lock poisoned");
            match tasks.get(id) {
                Some(h) => Arc::clone(h),
                None => bail!("task {id} not found"),
            }
        };

        let current = handle.status();
        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            bail!("illegal task transition {current} -> {status} for {id}");
        }
        let old = handle.apply_status(status);

        self.bus.publish(
            BusMessage::new(EventType::TaskStatusChanged)
                .with_task(id)
                .with_payload(json!({ "old": old.as_str(), "new": status.as_str() })),
        );
        Ok(())
    }

    /// Tasks eligible to run: pending, every dependency present and
    /// complete, and past any retry backoff.
    pub fn ready(&self) -> Vec<Arc<TaskHandle>> {
        let tasks = self.tasks.read().expect("graph lock poisoned");
        let now = Utc::now();
        let mut ready = Vec::new();
        for handle in tasks.values() {
            if handle.status() != TaskStatus::Pending {
                continue;
            }
            if let Some(after) = handle.retry_after() {
                if now < after {
                    continue;
                }
            }
            let deps_done = handle.depends_on().iter().all(|dep| {
                tasks
                    .get(dep)
                    .map(|d| d.status() == TaskStatus::Complete)
                    .unwrap_or(false)
            });
            if deps_done {
                ready.push(Arc::clone(handle));
            }
        }
        ready
    }

    pub fn all(&self) -> Vec<Arc<TaskHandle>> {
        self.tasks
            .read()
            .expect("graph lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn failed(&self) -> Vec<Arc<TaskHandle>> {
        self.tasks
            .read()
            .expect("graph lock poisoned")
            .values()
            .filter(|h| h.status() == TaskStatus::Failed)
            .cloned()
            .collect()
    }

    /// True when the graph is non-empty and every task is complete or
    /// cancelled.
    pub fn all_complete(&self) -> bool {
        let tasks = self.tasks.read().expect("graph lock poisoned");
        !tasks.is_empty()
            && tasks
                .values()
                .all(|h| matches!(h.status(), TaskStatus::Complete | TaskStatus::Cancelled))
    }

    /// Dependency edges of the current graph, for cycle checks against a
    /// projected batch.
    pub fn edges(&self) -> HashMap<String, Vec<String>> {
        self.tasks
            .read()
            .expect("graph lock poisoned")
            .values()
            .map(|h| (h.id().to_string(), h.depends_on()))
            .collect()
    }

    /// Check the live graph for circular dependencies.
    pub fn detect_cycles(&self) -> Option<String> {
        detect_cycle(&self.edges()).map(|cycle| format_cycle(&cycle))
    }
}

/// DFS cycle detection over an edge map. Dependencies pointing at ids absent
/// from the map are skipped: an unresolved dependency is permanently
/// unsatisfied, not circular. Returns the first cycle found, with the
/// starting node repeated at the end.
pub fn detect_cycle(edges: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_stack: HashSet<&str> = HashSet::new();

    // Deterministic start order keeps reported cycles stable across runs.
    let mut roots: Vec<&String> = edges.keys().collect();
    roots.sort();

    for root in roots {
        if !visited.contains(root.as_str()) {
            if let Some(cycle) = dfs(root, edges, &mut visited, &mut in_stack, Vec::new()) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs<'a>(
    node: &'a str,
    edges: &'a HashMap<String, Vec<String>>,
    visited: &mut HashSet<&'a str>,
    in_stack: &mut HashSet<&'a str>,
    path: Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(node);
    in_stack.insert(node);

    // Each descent owns its own path; a mutating shared buffer would leave
    // the reported cycle aliasing later writes.
    let mut path = path;
    path.push(node.to_string());

    if let Some(deps) = edges.get(node) {
        for dep in deps {
            if !edges.contains_key(dep) {
                continue;
            }
            if in_stack.contains(dep.as_str()) {
                if let Some(start) = path.iter().position(|p| p == dep) {
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
            if !visited.contains(dep.as_str()) {
                if let Some(cycle) = dfs(dep, edges, visited, in_stack, path.clone()) {
                    return Some(cycle);
                }
            }
        }
    }

    in_stack.remove(node);
    None
}

/// "a -> b -> c -> a"
pub fn format_cycle(cycle: &[String]) -> String {
    cycle.join(" -> ")
}
