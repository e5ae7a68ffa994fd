//! Per-run artifact layout under the output folder.
//!
//! ```text
//! <output>/node_init/            pre-search artifacts
//! <output>/node_<id>/            one directory per node
//!     generated_code.py
//!     execution_script.sh
//!     output/                    subprocess working directory
//!     states/                    prompts, replies and parsed results
//! <output>/best_run -> node_<id> promoted node
//! <output>/token_usage.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::tokens::TokenReport;
use crate::tree::NodeId;

const BEST_RUN: &str = "best_run";
const NODE_INIT: &str = "node_init";
const TOKEN_USAGE: &str = "token_usage.json";

/// Paths owned by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePaths {
    pub dir: PathBuf,
    pub python_path: PathBuf,
    pub script_path: PathBuf,
    pub output_dir: PathBuf,
    pub states_dir: PathBuf,
}

impl NodePaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            python_path: dir.join("generated_code.py"),
            script_path: dir.join("execution_script.sh"),
            output_dir: dir.join("output"),
            states_dir: dir.join("states"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        for dir in [&self.output_dir, &self.states_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Deterministic layout of one run's output folder.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create output folder {}", self.root.display()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn init_dir(&self) -> PathBuf {
        self.root.join(NODE_INIT)
    }

    pub fn init_states_dir(&self) -> PathBuf {
        self.init_dir().join("states")
    }

    pub fn node(&self, id: NodeId) -> NodePaths {
        NodePaths::new(self.root.join(node_dir_name(id)))
    }

    pub fn best_run_link(&self) -> PathBuf {
        self.root.join(BEST_RUN)
    }

    pub fn token_usage_path(&self) -> PathBuf {
        self.root.join(TOKEN_USAGE)
    }

    /// Absolute path `best_run` currently resolves to, if any.
    pub fn current_best_target(&self) -> Option<PathBuf> {
        let link = self.best_run_link();
        fs::symlink_metadata(&link).ok()?;
        fs::canonicalize(&link).ok()
    }

    /// Point `best_run` at `node_dir` and copy its `output/` into the run root.
    ///
    /// When the link previously pointed elsewhere, the files copied from the
    /// old target are removed from the run root, and the old target itself is
    /// deleted if `remove_previous` is set.
    pub fn promote_best_run(&self, node_dir: &Path, remove_previous: bool) -> Result<()> {
        let target = fs::canonicalize(node_dir)
            .with_context(|| format!("resolve best-run target {}", node_dir.display()))?;
        let previous = self.current_best_target();

        if let Some(previous) = previous.as_ref().filter(|p| **p != target) {
            self.remove_copied_outputs(&previous.join("output"));
            if remove_previous {
                info!(path = %previous.display(), "removing previous best run");
                fs::remove_dir_all(previous)
                    .with_context(|| format!("remove previous best run {}", previous.display()))?;
            }
        }

        let output_dir = target.join("output");
        if output_dir.is_dir() {
            self.copy_outputs(&output_dir)?;
        }
        self.link_best_run(&target)?;
        info!(target = %target.display(), "promoted best run");
        Ok(())
    }

    /// Delete a finished node directory unless `best_run` resolves to it.
    ///
    /// Returns whether anything was removed.
    pub fn prune_iteration(&self, node_dir: &Path) -> Result<bool> {
        let Ok(resolved) = fs::canonicalize(node_dir) else {
            return Ok(false);
        };
        if self.current_best_target().as_deref() == Some(resolved.as_path()) {
            debug!(path = %resolved.display(), "keeping best-run target");
            return Ok(false);
        }
        fs::remove_dir_all(&resolved)
            .with_context(|| format!("remove iteration folder {}", resolved.display()))?;
        Ok(true)
    }

    pub fn write_token_usage(&self, report: &TokenReport) -> Result<()> {
        write_json(&self.token_usage_path(), report)
    }

    fn copy_outputs(&self, output_dir: &Path) -> Result<()> {
        for entry in fs::read_dir(output_dir)
            .with_context(|| format!("read {}", output_dir.display()))?
        {
            let entry = entry.with_context(|| format!("read {}", output_dir.display()))?;
            let name = entry.file_name();
            if is_reserved(&name.to_string_lossy()) {
                warn!(name = %name.to_string_lossy(), "output name collides with run layout, skipping");
                continue;
            }
            copy_tree(&entry.path(), &self.root.join(&name))?;
        }
        Ok(())
    }

    fn remove_copied_outputs(&self, previous_output: &Path) {
        let Ok(entries) = fs::read_dir(previous_output) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if is_reserved(&name.to_string_lossy()) {
                continue;
            }
            let copied = self.root.join(&name);
            let result = if copied.is_dir() {
                fs::remove_dir_all(&copied)
            } else {
                fs::remove_file(&copied)
            };
            if let Err(e) = result
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %copied.display(), err = %e, "failed to remove stale output");
            }
        }
    }

    #[cfg(unix)]
    fn link_best_run(&self, target: &Path) -> Result<()> {
        let link = self.best_run_link();
        let relative = target
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| target.to_path_buf());
        let tmp = self.root.join(format!("{BEST_RUN}.tmp"));
        if fs::symlink_metadata(&tmp).is_ok() {
            fs::remove_file(&tmp).with_context(|| format!("remove {}", tmp.display()))?;
        }
        std::os::unix::fs::symlink(&relative, &tmp)
            .with_context(|| format!("create symlink {}", tmp.display()))?;
        fs::rename(&tmp, &link).with_context(|| format!("replace {}", link.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn link_best_run(&self, target: &Path) -> Result<()> {
        let link = self.best_run_link();
        if link.exists() {
            fs::remove_dir_all(&link).with_context(|| format!("remove {}", link.display()))?;
        }
        copy_tree(target, &link)
    }
}

pub fn node_dir_name(id: NodeId) -> String {
    format!("node_{id}")
}

fn is_reserved(name: &str) -> bool {
    name == BEST_RUN || name == TOKEN_USAGE || name == NODE_INIT || name.starts_with("node_")
}

/// Copy a file or directory tree from `src` to `dst`, overwriting files.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::copy(src, dst)
            .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
        return Ok(());
    }
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out).with_context(|| format!("create directory {}", out.display()))?;
        } else {
            fs::copy(entry.path(), &out)
                .with_context(|| format!("copy {} to {}", entry.path().display(), out.display()))?;
        }
    }
    Ok(())
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_text(path, &buf)
}

/// Write a non-critical state file; failures are logged, not returned.
pub fn write_state(states_dir: &Path, name: &str, contents: &str) {
    let path = states_dir.join(name);
    if let Err(e) = write_text(&path, contents) {
        warn!(path = %path.display(), err = %format!("{e:#}"), "failed to write state file");
    }
}

/// JSON flavour of [`write_state`].
pub fn write_state_json<T: Serialize>(states_dir: &Path, name: &str, value: &T) {
    let path = states_dir.join(name);
    if let Err(e) = write_json(&path, value) {
        warn!(path = %path.display(), err = %format!("{e:#}"), "failed to write state file");
    }
}
