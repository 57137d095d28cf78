//! Per-project state directory layout.
//!
//! All durable state lives under `<project>/.hive/`:
//! - `hive.db` — SQLite store (sessions, tasks, events, messages)
//! - `outputs/<task_id>.log` — full worker output when it exceeds the
//!   in-context threshold

use std::path::{Path, PathBuf};

pub const HIVE_DIR: &str = ".hive";
pub const DB_FILE: &str = "hive.db";

pub fn hive_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(HIVE_DIR)
}

pub fn db_path(project_dir: &Path) -> PathBuf {
    hive_dir(project_dir).join(DB_FILE)
}

pub fn outputs_dir(project_dir: &Path) -> PathBuf {
    hive_dir(project_dir).join("outputs")
}

/// Path where a task's full output is spilled when too large for context.
pub fn task_output_path(project_dir: &Path, task_id: &str) -> PathBuf {
    outputs_dir(project_dir).join(format!("{task_id}.log"))
}

/// Create the state directory tree if missing.
pub fn ensure_hive_dir(project_dir: &Path) -> std::io::Result<PathBuf> {
    let dir = hive_dir(project_dir);
    std::fs::create_dir_all(outputs_dir(project_dir))?;
    Ok(dir)
}
