//! Configuration: queen, workers, adapters, safety.
//!
//! Loaded from `waggle.json` (all keys optional, defaults applied), then
//! overridden by driver flags. `Config::load` tolerates a missing file so a
//! bare `waggle run` works out of the box.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SAFETY_MODE_STRICT: &str = "strict";
pub const SAFETY_MODE_PERMISSIVE: &str = "permissive";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project_dir: PathBuf,
    pub queen: QueenConfig,
    pub workers: WorkerConfig,
    pub adapters: HashMap<String, AdapterConfig>,
    pub safety: SafetyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            queen: QueenConfig::default(),
            workers: WorkerConfig::default(),
            adapters: HashMap::new(),
            safety: SafetyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueenConfig {
    /// LLM provider: "anthropic" is the only tool-capable provider.
    pub provider: String,
    pub model: String,
    /// Turn budget for the agent loop.
    pub max_iterations: u32,
    /// Conversation length that triggers compaction.
    pub compact_after_messages: usize,
}

impl Default for QueenConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: String::new(),
            max_iterations: 50,
            compact_after_messages: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_parallel: usize,
    /// Per-task timeout in seconds; 0 disables the deadline.
    pub default_timeout_secs: u64,
    pub max_retries: u32,
    /// Cap on captured worker output, in bytes.
    pub max_output_size: usize,
    pub default_adapter: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            default_timeout_secs: 300,
            max_retries: 2,
            max_output_size: 1024 * 1024,
            default_adapter: "claude-code".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Override for a single adapter's invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// "strict" or "permissive"; anything else normalises to strict.
    pub mode: String,
    pub allowed_paths: Vec<String>,
    pub blocked_executables: Vec<String>,
    pub blocked_patterns: Vec<String>,
    pub allow_executables: Vec<String>,
    /// Adapters whose scripts go through the command blocklist.
    pub enforce_on_adapters: Vec<String>,
    pub read_only_mode: bool,
    /// 0 disables the file-size check.
    pub max_file_size: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            mode: SAFETY_MODE_STRICT.to_string(),
            allowed_paths: Vec::new(),
            blocked_executables: vec![
                "shutdown".to_string(),
                "reboot".to_string(),
                "halt".to_string(),
            ],
            blocked_patterns: vec![
                "rm -rf /".to_string(),
                "rm --no-preserve-root".to_string(),
                "git push --force".to_string(),
            ],
            allow_executables: Vec::new(),
            enforce_on_adapters: vec!["exec".to_string()],
            read_only_mode: false,
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

impl SafetyConfig {
    /// Normalise the mode string and fill fallback fields. Unknown modes
    /// fall back to strict.
    pub fn normalized(mut self) -> Self {
        let mode = self.mode.trim().to_ascii_lowercase();
        self.mode = match mode.as_str() {
            SAFETY_MODE_PERMISSIVE => SAFETY_MODE_PERMISSIVE.to_string(),
            _ => SAFETY_MODE_STRICT.to_string(),
        };
        if self.enforce_on_adapters.is_empty() {
            self.enforce_on_adapters = vec!["exec".to_string()];
        }
        self
    }

    pub fn is_strict(&self) -> bool {
        self.mode != SAFETY_MODE_PERMISSIVE
    }
}

impl Config {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.queen.max_iterations, 50);
        assert_eq!(cfg.workers.max_parallel, 4);
        assert_eq!(cfg.workers.max_retries, 2);
        assert_eq!(cfg.workers.max_output_size, 1024 * 1024);
        assert!(cfg.safety.is_strict());
    }

    #[test]
    fn unknown_safety_mode_falls_back_to_strict() {
        let cfg = SafetyConfig {
            mode: "yolo".to_string(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.mode, SAFETY_MODE_STRICT);
    }

    #[test]
    fn enforce_on_adapters_defaults_to_exec() {
        let cfg = SafetyConfig {
            enforce_on_adapters: Vec::new(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.enforce_on_adapters, vec!["exec".to_string()]);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.workers.default_adapter, "claude-code");
    }

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waggle.json");
        let mut cfg = Config::default();
        cfg.workers.max_parallel = 8;
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.workers.max_parallel, 8);
    }
}
