//! Safety guard: path containment and command policy for worker operations.

mod command_policy;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::config::SafetyConfig;

/// Enforces safety constraints on worker operations.
///
/// Paths are canonicalised at construction (symlinks resolved) so containment
/// checks compare like with like; `/var` vs `/private/var` style aliases and
/// sibling-prefix bypasses (`/repo-sibling` when `/repo` is allowed) are both
/// handled by component-wise comparison of canonical paths.
pub struct Guard {
    cfg: SafetyConfig,
    project_root: PathBuf,
    resolved_paths: Vec<PathBuf>,
}

impl Guard {
    pub fn new(cfg: SafetyConfig, project_root: &Path) -> Result<Self> {
        let cfg = cfg.normalized();

        let abs_root = canonical_path(project_root)
            .with_context(|| format!("resolve project root {}", project_root.display()))?;

        let mut resolved = Vec::with_capacity(cfg.allowed_paths.len());
        for p in &cfg.allowed_paths {
            let path = PathBuf::from(p);
            let path = if path.is_absolute() {
                path
            } else {
                abs_root.join(path)
            };
            if let Ok(abs) = canonical_path(&path) {
                resolved.push(abs);
            }
        }
        if resolved.is_empty() {
            resolved.push(abs_root.clone());
        }

        Ok(Self {
            cfg,
            project_root: abs_root,
            resolved_paths: resolved,
        })
    }

    /// Verify a file path is inside one of the allowed directories.
    pub fn check_path(&self, path: &str) -> Result<()> {
        let candidate = PathBuf::from(path);
        let candidate = if candidate.is_absolute() {
            candidate
        } else {
            self.project_root.join(candidate)
        };
        let resolved =
            canonical_path(&candidate).with_context(|| format!("resolve path {path:?}"))?;

        if self
            .resolved_paths
            .iter()
            .any(|allowed| is_within_dir(allowed, &resolved))
        {
            return Ok(());
        }
        Err(anyhow!("path {path:?} outside allowed directories"))
    }

    /// All-or-nothing check over a task's allowed_paths.
    pub fn validate_task_paths(&self, paths: &[String]) -> Result<()> {
        for p in paths {
            self.check_path(p)?;
        }
        Ok(())
    }

    /// Reject files larger than the configured cap. Missing files pass: the
    /// worker may be about to create them.
    pub fn check_file_size(&self, path: &Path) -> Result<()> {
        if self.cfg.max_file_size == 0 {
            return Ok(());
        }
        let Ok(meta) = std::fs::metadata(path) else {
            return Ok(());
        };
        if meta.len() > self.cfg.max_file_size {
            return Err(anyhow!(
                "file {:?} ({} bytes) exceeds max size ({} bytes)",
                path,
                meta.len(),
                self.cfg.max_file_size
            ));
        }
        Ok(())
    }

    /// Whether scripts routed through the named adapter go through the
    /// command blocklist.
    pub fn enforce_command_blocking(&self, adapter_name: &str) -> bool {
        let name = adapter_name.trim().to_ascii_lowercase();
        self.cfg
            .enforce_on_adapters
            .iter()
            .any(|a| a.trim().to_ascii_lowercase() == name)
    }

    pub fn is_read_only(&self) -> bool {
        self.cfg.read_only_mode
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub(crate) fn config(&self) -> &SafetyConfig {
        &self.cfg
    }
}

/// Component-wise containment; equal paths count as contained.
fn is_within_dir(base: &Path, target: &Path) -> bool {
    target.starts_with(base)
}

/// Absolute path with symlinks resolved. Paths that do not fully exist are
/// resolved up to the deepest existing ancestor, with the missing suffix
/// re-appended, so a target inside a symlinked allowed root still compares
/// equal after canonicalisation.
fn canonical_path(path: &Path) -> Result<PathBuf> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("current dir")?
            .join(path)
    };

    if let Ok(resolved) = abs.canonicalize() {
        return Ok(resolved);
    }

    let mut base = abs.clone();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    while !base.exists() {
        match base.file_name() {
            Some(name) => suffix.push(name.to_owned()),
            None => return Ok(normalize_lexically(&abs)),
        }
        if !base.pop() {
            return Ok(normalize_lexically(&abs));
        }
    }

    let mut resolved = base
        .canonicalize()
        .with_context(|| format!("canonicalize {}", base.display()))?;
    for part in suffix.into_iter().rev() {
        resolved.push(part);
    }
    Ok(normalize_lexically(&resolved))
}

/// Remove `.` and fold `..` without touching the filesystem. Applied to the
/// re-appended suffix so `root/sub/../..`-style escapes do not survive into
/// the containment check.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn guard_for(root: &Path) -> Guard {
        Guard::new(SafetyConfig::default(), root).unwrap()
    }

    #[test]
    fn allows_paths_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_for(dir.path());

        fs::write(dir.path().join("file.txt"), "x").unwrap();
        assert!(guard.check_path("file.txt").is_ok());
        assert!(guard
            .check_path(dir.path().join("file.txt").to_str().unwrap())
            .is_ok());
        // not-yet-existing children are still inside
        assert!(guard.check_path("sub/dir/new.txt").is_ok());
    }

    #[test]
    fn rejects_escape_via_dotdot() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_for(dir.path());
        assert!(guard.check_path("../outside.txt").is_err());
        assert!(guard.check_path("sub/../../outside.txt").is_err());
    }

    #[test]
    fn rejects_sibling_prefix_bypass() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("repo");
        let sibling = parent.path().join("repo-sibling");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&sibling).unwrap();

        let guard = guard_for(&root);
        assert!(guard
            .check_path(sibling.join("f.txt").to_str().unwrap())
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolves_symlinked_escape() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("repo");
        let outside = parent.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let guard = guard_for(&root);
        assert!(guard.check_path("link/escape.txt").is_err());
    }

    #[test]
    fn empty_allowed_paths_default_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_for(dir.path());
        assert_eq!(guard.resolved_paths.len(), 1);
        assert!(guard.check_path(".").is_ok());
    }

    #[test]
    fn file_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SafetyConfig {
            max_file_size: 4,
            ..Default::default()
        };
        let guard = Guard::new(cfg, dir.path()).unwrap();

        let small = dir.path().join("small");
        fs::write(&small, "ok").unwrap();
        assert!(guard.check_file_size(&small).is_ok());

        let big = dir.path().join("big");
        fs::write(&big, "way too large").unwrap();
        assert!(guard.check_file_size(&big).is_err());

        // missing files pass
        assert!(guard.check_file_size(&dir.path().join("nope")).is_ok());
    }

    #[test]
    fn enforcement_set_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_for(dir.path());
        assert!(guard.enforce_command_blocking("exec"));
        assert!(guard.enforce_command_blocking(" Exec "));
        assert!(!guard.enforce_command_blocking("claude-code"));
    }

    #[test]
    fn validate_task_paths_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_for(dir.path());
        let paths = vec!["ok.txt".to_string(), "../bad.txt".to_string()];
        assert!(guard.validate_task_paths(&paths).is_err());
    }
}
