//! Isolated worker dispatch.
//!
//! Each task gets its own workspace (a detached git worktree, or a filtered
//! copy when the repo is not a work tree), runs the agent command there with
//! the prompt on stdin, and has its permitted files checked before they are
//! folded back into the main tree.

use crate::process::run_with_deadline;
use anyhow::{anyhow, Result};
use chrono::Utc;
use qa_core::{atomic_write_bytes, ensure_dir, sha256_file, QaConfig};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const WORKSPACE_PREFIX: &str = "qa-workspace-";

const COPY_EXCLUDES: &[&str] = &[
    ".git",
    ".qa",
    "target",
    "node_modules",
    ".venv",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".next",
    "coverage",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Fix,
    Optimize,
    RecordFix,
}

impl WorkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fix => "fix",
            Self::Optimize => "optimize",
            Self::RecordFix => "record_fix",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub kind: WorkerKind,
    pub label: String,
    pub prompt: String,
    /// Repo-relative paths the worker may change. Anything else is ignored.
    pub allowed_files: Vec<PathBuf>,
}

/// Main-tree content of one file before integration; `None` if it did not exist.
#[derive(Debug, Clone)]
pub struct FileBackup {
    pub path: PathBuf,
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerOutcome {
    pub label: String,
    pub kind: WorkerKind,
    pub workspace: PathBuf,
    pub changed_files: Vec<PathBuf>,
    pub accepted: bool,
    pub timed_out: bool,
    pub detail: String,
    #[serde(skip)]
    pub backups: Vec<FileBackup>,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub repo_root: PathBuf,
    pub workspace_parent: PathBuf,
    pub log_dir: PathBuf,
    pub command: Vec<String>,
    pub timeout: Duration,
    pub max_workers: usize,
}

impl DispatchConfig {
    pub fn from_qa_config(config: &QaConfig, repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            workspace_parent: config.workspace_parent(),
            log_dir: config.results_dir.join("logs"),
            command: config.worker.command.clone(),
            timeout: Duration::from_secs(config.worker.timeout_secs),
            max_workers: config.worker.max_workers.max(1),
        }
    }
}

#[derive(Debug)]
enum Backend {
    Worktree { repo: PathBuf },
    Copy,
}

/// Ephemeral checkout bound to one task. Torn down on drop.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    backend: Backend,
}

fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| anyhow!("failed to run git {}: {}", args.join(" "), e))
}

fn is_git_work_tree(repo: &Path) -> bool {
    git(repo, &["rev-parse", "--is-inside-work-tree"])
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
        .unwrap_or(false)
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

impl Workspace {
    pub fn create(repo_root: &Path, parent: &Path, label: &str) -> Result<Self> {
        ensure_dir(parent)?;
        let root = parent.join(format!(
            "{}{}-{}-{}",
            WORKSPACE_PREFIX,
            sanitize_label(label),
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        if is_git_work_tree(repo_root) {
            let path = root.to_string_lossy().to_string();
            let out = git(repo_root, &["worktree", "add", "--detach", &path, "HEAD"])?;
            if out.status.success() {
                debug!(workspace = %root.display(), "created git worktree");
                return Ok(Self {
                    root,
                    backend: Backend::Worktree {
                        repo: repo_root.to_path_buf(),
                    },
                });
            }
            warn!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "git worktree add failed, falling back to a copy"
            );
        }
        copy_dir_filtered(repo_root, &root, COPY_EXCLUDES)?;
        debug!(workspace = %root.display(), "created workspace copy");
        Ok(Self {
            root,
            backend: Backend::Copy,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bring uncommitted main-tree state for `paths` into the workspace.
    fn sync_from(&self, repo_root: &Path, paths: &[PathBuf]) -> Result<()> {
        for rel in paths {
            let src = repo_root.join(rel);
            let dst = self.root.join(rel);
            if src.is_file() {
                if let Some(parent) = dst.parent() {
                    ensure_dir(parent)?;
                }
                fs::copy(&src, &dst)?;
            } else if dst.exists() {
                fs::remove_file(&dst)?;
            }
        }
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Backend::Worktree { repo } = &self.backend {
            let path = self.root.to_string_lossy().to_string();
            if let Err(e) = git(repo, &["worktree", "remove", "--force", &path]) {
                warn!(error = %e, "git worktree remove failed");
            }
        }
        if self.root.exists() {
            if let Err(e) = fs::remove_dir_all(&self.root) {
                warn!(path = %self.root.display(), error = %e, "workspace cleanup failed");
            }
        }
        if let Backend::Worktree { repo } = &self.backend {
            let _ = git(repo, &["worktree", "prune"]);
        }
    }
}

/// Copy `src` into `dst`, skipping any top-level path that starts with an `exclude` entry.
pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        rel.as_os_str().is_empty() || !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    ensure_dir(dst)?;
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            let link_target = fs::read_link(path)?;
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            std::os::unix::fs::symlink(&link_target, &target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target)?;
        }
    }
    Ok(())
}

fn snapshot(root: &Path, paths: &[PathBuf]) -> BTreeMap<PathBuf, Option<String>> {
    paths
        .iter()
        .map(|rel| (rel.clone(), sha256_file(&root.join(rel)).ok()))
        .collect()
}

/// Cheap validity check before a worker's edit is trusted.
pub fn sanity_check(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|_| anyhow!("{} was removed", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("sh") => {
            let out = Command::new("bash")
                .arg("-n")
                .arg(path)
                .stdin(Stdio::null())
                .output()
                .map_err(|e| anyhow!("failed to run bash -n: {}", e))?;
            if !out.status.success() {
                return Err(anyhow!(
                    "syntax error in {}: {}",
                    path.display(),
                    String::from_utf8_lossy(&out.stderr).trim()
                ));
            }
        }
        Some("json") => {
            let bytes = fs::read(path)?;
            serde_json::from_slice::<serde_json::Value>(&bytes)
                .map_err(|e| anyhow!("invalid JSON in {}: {}", path.display(), e))?;
        }
        _ => {
            if meta.len() == 0 {
                return Err(anyhow!("{} is empty", path.display()));
            }
        }
    }
    Ok(())
}

pub struct Dispatcher {
    config: DispatchConfig,
    integrate_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            integrate_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run one task end to end. Failures are reported in the outcome and
    /// leave the main tree untouched.
    pub fn dispatch(&self, task: &WorkerTask) -> WorkerOutcome {
        let mut outcome = WorkerOutcome {
            label: task.label.clone(),
            kind: task.kind,
            workspace: PathBuf::new(),
            changed_files: Vec::new(),
            accepted: false,
            timed_out: false,
            detail: String::new(),
            backups: Vec::new(),
        };
        if let Err(e) = self.dispatch_inner(task, &mut outcome) {
            outcome.accepted = false;
            outcome.backups.clear();
            outcome.detail = e.to_string();
        }
        info!(
            label = %outcome.label,
            kind = outcome.kind.as_str(),
            changed = outcome.changed_files.len(),
            accepted = outcome.accepted,
            timed_out = outcome.timed_out,
            "worker finished"
        );
        outcome
    }

    fn dispatch_inner(&self, task: &WorkerTask, outcome: &mut WorkerOutcome) -> Result<()> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker command is empty"))?;
        let workspace = Workspace::create(
            &self.config.repo_root,
            &self.config.workspace_parent,
            &task.label,
        )?;
        outcome.workspace = workspace.root().to_path_buf();
        workspace.sync_from(&self.config.repo_root, &task.allowed_files)?;
        let before = snapshot(workspace.root(), &task.allowed_files);

        ensure_dir(&self.config.log_dir)?;
        let log_path = self
            .config
            .log_dir
            .join(format!("worker-{}.log", sanitize_label(&task.label)));
        let log = fs::File::create(&log_path)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace.root())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        let process = run_with_deadline(cmd, Some(task.prompt.clone().into_bytes()), self.config.timeout)?;
        outcome.timed_out = process.timed_out;

        let after = snapshot(workspace.root(), &task.allowed_files);
        let changed: Vec<PathBuf> = task
            .allowed_files
            .iter()
            .filter(|rel| before.get(*rel) != after.get(*rel))
            .cloned()
            .collect();
        outcome.changed_files = changed.clone();
        // A deadline kill still gets its edits checked; a failed exit does not.
        if !process.timed_out && !process.success() {
            outcome.detail = format!(
                "worker failed (exit {}), {} change(s) discarded",
                process.exit_code_label(),
                changed.len()
            );
            return Ok(());
        }
        if changed.is_empty() {
            outcome.detail = format!("no changes (exit {})", process.exit_code_label());
            return Ok(());
        }
        for rel in &changed {
            sanity_check(&workspace.root().join(rel))?;
        }
        outcome.backups = self.integrate(workspace.root(), &changed)?;
        outcome.accepted = true;
        outcome.detail = format!(
            "integrated {} file(s) (exit {})",
            changed.len(),
            process.exit_code_label()
        );
        Ok(())
    }

    /// Copy changed files into the main tree. Serialized across workers, and
    /// all-or-nothing: a failed write puts back every file already copied.
    fn integrate(&self, workspace_root: &Path, changed: &[PathBuf]) -> Result<Vec<FileBackup>> {
        let _guard = self
            .integrate_lock
            .lock()
            .map_err(|_| anyhow!("integration lock poisoned"))?;
        let staged = changed
            .iter()
            .map(|rel| -> Result<(&PathBuf, Vec<u8>)> { Ok((rel, fs::read(workspace_root.join(rel))?)) })
            .collect::<Result<Vec<_>>>()?;
        let mut backups = Vec::with_capacity(staged.len());
        for (rel, bytes) in staged {
            let main_path = self.config.repo_root.join(rel);
            backups.push(FileBackup {
                path: rel.clone(),
                content: fs::read(&main_path).ok(),
            });
            if let Err(e) = atomic_write_bytes(&main_path, &bytes) {
                if let Err(restore_err) = self.restore(&backups) {
                    warn!(error = %restore_err, "failed to roll back a partial integration");
                }
                return Err(anyhow!(
                    "integrating {} failed, {} file(s) rolled back: {}",
                    rel.display(),
                    backups.len() - 1,
                    e
                ));
            }
            copy_mode(&workspace_root.join(rel), &main_path);
        }
        Ok(backups)
    }

    /// Caller holds the integration lock.
    fn restore(&self, backups: &[FileBackup]) -> Result<()> {
        for backup in backups {
            let main_path = self.config.repo_root.join(&backup.path);
            match &backup.content {
                Some(bytes) => atomic_write_bytes(&main_path, bytes)?,
                None => {
                    if main_path.exists() {
                        fs::remove_file(&main_path)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Restore the main tree to its state before `outcome` was integrated.
    pub fn revert(&self, outcome: &WorkerOutcome) -> Result<()> {
        let _guard = self
            .integrate_lock
            .lock()
            .map_err(|_| anyhow!("integration lock poisoned"))?;
        self.restore(&outcome.backups)?;
        info!(label = %outcome.label, files = outcome.backups.len(), "reverted worker changes");
        Ok(())
    }

    /// Run `tasks` with at most `max_workers` in flight; outcomes keep task order.
    pub fn dispatch_all(&self, tasks: &[WorkerTask]) -> Vec<WorkerOutcome> {
        let slots: Vec<Mutex<Option<WorkerOutcome>>> = tasks.iter().map(|_| Mutex::new(None)).collect();
        let next = Mutex::new(0usize);
        let workers = self.config.max_workers.clamp(1, tasks.len().max(1));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let idx = match next.lock() {
                        Ok(mut n) => {
                            let idx = *n;
                            *n += 1;
                            idx
                        }
                        Err(_) => break,
                    };
                    let Some(task) = tasks.get(idx) else {
                        break;
                    };
                    let outcome = self.dispatch(task);
                    if let Ok(mut slot) = slots[idx].lock() {
                        *slot = Some(outcome);
                    }
                });
            }
        });
        slots
            .into_iter()
            .zip(tasks)
            .map(|(slot, task)| {
                slot.into_inner().ok().flatten().unwrap_or_else(|| WorkerOutcome {
                    label: task.label.clone(),
                    kind: task.kind,
                    workspace: PathBuf::new(),
                    changed_files: Vec::new(),
                    accepted: false,
                    timed_out: false,
                    detail: "worker thread panicked".to_string(),
                    backups: Vec::new(),
                })
            })
            .collect()
    }
}

fn copy_mode(from: &Path, to: &Path) {
    if let Ok(meta) = fs::metadata(from) {
        let _ = fs::set_permissions(to, meta.permissions());
    }
}

/// Remove workspaces left behind by killed harness processes.
pub fn remove_stale_workspaces(parent: &Path) -> Result<usize> {
    crate::remove_prefixed_dirs(parent, WORKSPACE_PREFIX)
}
