//! Adapters wrap external CLI tools behind a uniform worker factory.

mod cli;
mod exec;
mod process;

pub use cli::{CliAdapter, CliAdapterConfig, PromptMode};
pub use exec::ExecAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::AdapterConfig;
use crate::safety::Guard;
use crate::task::{Task, TaskType};
use crate::worker::Worker;

/// A uniform facade over one external CLI (or the raw shell), producing
/// workers on demand.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    /// The backing binary is present on PATH.
    fn available(&self) -> bool;

    /// A trivial round trip against the backend (binary runs at all).
    async fn health_check(&self, cancel: &CancellationToken) -> Result<()>;

    fn create_worker(&self, id: &str) -> Arc<dyn Worker>;
}

/// All registered adapters, keyed by name.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn available_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .adapters
            .values()
            .filter(|a| a.available())
            .map(|a| a.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Build the standard fleet: the coding CLIs plus the raw shell.
    /// Per-adapter config overrides command/args/env.
    pub fn standard(
        configs: &HashMap<String, AdapterConfig>,
        work_dir: &std::path::Path,
        guard: Arc<Guard>,
        bus: crate::bus::MessageBus,
        max_output: usize,
    ) -> Self {
        let mut registry = Self::new();
        let cli = |name: &str, command: &str, args: &[&str], mode: PromptMode| {
            let cfg = configs.get(name);
            CliAdapterConfig {
                name: name.to_string(),
                command: cfg
                    .filter(|c| !c.command.is_empty())
                    .map(|c| c.command.clone())
                    .unwrap_or_else(|| command.to_string()),
                args: cfg
                    .filter(|c| !c.args.is_empty())
                    .map(|c| c.args.clone())
                    .unwrap_or_else(|| args.iter().map(ToString::to_string).collect()),
                env: cfg.map(|c| c.env.clone()).unwrap_or_default(),
                work_dir: work_dir.to_path_buf(),
                prompt_mode: mode,
            }
        };

        registry.register(Arc::new(CliAdapter::new(
            cli("claude-code", "claude", &["-p"], PromptMode::Arg),
            Arc::clone(&guard),
            bus.clone(),
            max_output,
        )));
        registry.register(Arc::new(CliAdapter::new(
            cli("codex", "codex", &["exec"], PromptMode::Arg),
            Arc::clone(&guard),
            bus.clone(),
            max_output,
        )));
        registry.register(Arc::new(CliAdapter::new(
            cli("gemini", "gemini", &[], PromptMode::Stdin),
            Arc::clone(&guard),
            bus.clone(),
            max_output,
        )));
        registry.register(Arc::new(CliAdapter::new(
            cli(
                "kimi",
                "kimi",
                &["--print", "--final-message-only", "-p"],
                PromptMode::Arg,
            ),
            Arc::clone(&guard),
            bus.clone(),
            max_output,
        )));
        registry.register(Arc::new(CliAdapter::new(
            cli("opencode", "opencode", &["run"], PromptMode::Arg),
            Arc::clone(&guard),
            bus.clone(),
            max_output,
        )));
        registry.register(Arc::new(ExecAdapter::new(
            work_dir.to_path_buf(),
            guard,
            bus,
            max_output,
        )));
        registry
    }

    /// Factory closure handed to the worker pool.
    pub fn worker_factory(self: &Arc<Self>) -> crate::worker::WorkerFactory {
        let registry = Arc::clone(self);
        Box::new(move |worker_id, adapter_name| {
            let adapter = registry
                .get(adapter_name)
                .ok_or_else(|| anyhow!("adapter {adapter_name:?} not registered"))?;
            if !adapter.available() {
                return Err(anyhow!(
                    "adapter {adapter_name:?} not available (CLI not found in PATH)"
                ));
            }
            Ok(adapter.create_worker(worker_id))
        })
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps task types to adapter names, with availability fallback.
pub struct TaskRouter {
    registry: Arc<AdapterRegistry>,
    routes: HashMap<TaskType, String>,
}

impl TaskRouter {
    pub fn new(registry: Arc<AdapterRegistry>, default_adapter: &str) -> Self {
        let default_adapter = if default_adapter.is_empty() {
            "claude-code"
        } else {
            default_adapter
        };
        let routes = TaskType::all()
            .into_iter()
            .map(|t| (t, default_adapter.to_string()))
            .collect();
        Self { registry, routes }
    }

    pub fn set_route(&mut self, task_type: TaskType, adapter_name: impl Into<String>) {
        self.routes.insert(task_type, adapter_name.into());
    }

    /// Preferred adapter for the task's type when registered and available,
    /// else the first available adapter, else `None`.
    pub fn route(&self, task: &Task) -> Option<String> {
        if let Some(name) = self.routes.get(&task.task_type) {
            if let Some(adapter) = self.registry.get(name) {
                if adapter.available() {
                    return Some(name.clone());
                }
            }
        }
        self.registry.available_names().into_iter().next()
    }
}

/// Construct the prompt sent to a worker CLI.
pub fn build_prompt(task: &Task) -> String {
    use std::fmt::Write;

    let mut prompt = String::new();
    let _ = writeln!(prompt, "Task: {}", task.title);
    let _ = writeln!(prompt, "Type: {}", task.task_type);
    let _ = writeln!(prompt, "Description:\n{}", task.description);

    if !task.context.is_empty() {
        let _ = writeln!(prompt, "\nContext:");
        let mut keys: Vec<_> = task.context.keys().collect();
        keys.sort();
        for key in keys {
            let _ = writeln!(prompt, "- {}: {}", key, task.context[key]);
        }
    }

    if !task.allowed_paths.is_empty() {
        let _ = writeln!(
            prompt,
            "\nOnly modify files in: {}",
            task.allowed_paths.join(", ")
        );
    }

    if !task.constraints.is_empty() {
        let _ = writeln!(prompt, "\n--- SCOPE CONSTRAINTS (you MUST follow these) ---");
        for c in &task.constraints {
            let _ = writeln!(prompt, "* {c}");
        }
        let _ = writeln!(prompt, "--- END CONSTRAINTS ---");
    }

    prompt
}

pub const READ_ONLY_WARNING: &str = "[SAFETY WARNING: System is in read-only mode]\n\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::config::SafetyConfig;

    fn test_guard() -> Arc<Guard> {
        Arc::new(Guard::new(SafetyConfig::default(), &std::env::temp_dir()).unwrap())
    }

    fn test_registry() -> Arc<AdapterRegistry> {
        let bus = MessageBus::new(10);
        Arc::new(AdapterRegistry::standard(
            &HashMap::new(),
            &std::env::temp_dir(),
            test_guard(),
            bus,
            1024,
        ))
    }

    #[test]
    fn standard_fleet_registers_all_adapters() {
        let registry = test_registry();
        for name in ["claude-code", "codex", "gemini", "kimi", "opencode", "exec"] {
            assert!(registry.get(name).is_some(), "missing adapter {name}");
        }
    }

    #[test]
    fn exec_adapter_is_always_available() {
        let registry = test_registry();
        assert!(registry.available_names().contains(&"exec".to_string()));
    }

    #[test]
    fn router_falls_back_to_first_available() {
        let registry = test_registry();
        // prefer an adapter that is almost certainly not installed in CI
        let router = TaskRouter::new(Arc::clone(&registry), "kimi");
        let task = Task::new("t", TaskType::Code, "t", "d");
        let routed = router.route(&task).expect("some adapter");
        if !registry.get("kimi").unwrap().available() {
            assert_eq!(routed, registry.available_names()[0]);
        }
    }

    #[test]
    fn unknown_adapter_rejected_by_factory() {
        let registry = test_registry();
        let factory = registry.worker_factory();
        assert!(factory("w1", "nope").is_err());
    }

    #[test]
    fn prompt_includes_constraints_and_paths() {
        let mut task = Task::new("t1", TaskType::Code, "Fix login", "Repair the JWT check");
        task.constraints = vec!["do not touch tests".to_string()];
        task.allowed_paths = vec!["src/auth".to_string()];
        task.context.insert("branch".to_string(), "main".to_string());

        let prompt = build_prompt(&task);
        assert!(prompt.contains("Task: Fix login"));
        assert!(prompt.contains("Type: code"));
        assert!(prompt.contains("- branch: main"));
        assert!(prompt.contains("Only modify files in: src/auth"));
        assert!(prompt.contains("SCOPE CONSTRAINTS"));
        assert!(prompt.contains("* do not touch tests"));
    }
}
