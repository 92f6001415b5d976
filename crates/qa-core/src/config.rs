use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "qa.yaml";

/// Harness configuration. Loaded from `qa.yaml` at the repo root when present;
/// every field has a default so an empty or missing file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    pub fixtures_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Cached provider credentials; defaults to `$HOME/.config/qa`.
    pub credentials_dir: Option<PathBuf>,
    /// `owner/repo` whose raw source URLs are served from the local checkout.
    pub repo_slug: String,
    pub executor: ExecutorSettings,
    pub pipeline: PipelineSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub run_timeout_secs: u64,
    /// 0 means one slot per available CPU.
    pub max_parallel: usize,
    pub sandbox_parent: Option<PathBuf>,
    pub validate_body: bool,
    pub track_state: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub cycle_budget_secs: u64,
    pub record_retry_limit: u32,
    pub slow_ceiling_secs: f64,
    pub regression_ratio: f64,
    pub peer_ratio: f64,
    pub optimize: bool,
    pub update_readme: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Agent command; the prompt is written to its stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub max_workers: usize,
    pub workspace_parent: Option<PathBuf>,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            fixtures_dir: PathBuf::from("test/fixtures"),
            results_dir: PathBuf::from(".qa/results"),
            credentials_dir: None,
            repo_slug: "OpenRouterTeam/spawn".to_string(),
            executor: ExecutorSettings::default(),
            pipeline: PipelineSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            run_timeout_secs: 900,
            max_parallel: 0,
            sandbox_parent: None,
            validate_body: false,
            track_state: false,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cycle_budget_secs: 45 * 60,
            record_retry_limit: 1,
            slow_ceiling_secs: 120.0,
            regression_ratio: 1.5,
            peer_ratio: 2.0,
            optimize: false,
            update_readme: false,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            timeout_secs: 15 * 60,
            max_workers: 4,
            workspace_parent: None,
        }
    }
}

impl QaConfig {
    /// Read `<repo_root>/qa.yaml` if it exists and anchor relative paths at `repo_root`.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str::<Self>(&raw)
                    .map_err(|e| anyhow!("invalid {}: {}", path.display(), e))?
            }
        } else {
            Self::default()
        };
        config.anchor_paths(repo_root);
        config.validate()?;
        Ok(config)
    }

    fn anchor_paths(&mut self, repo_root: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = repo_root.join(&*p);
            }
        };
        anchor(&mut self.fixtures_dir);
        anchor(&mut self.results_dir);
        if let Some(dir) = self.credentials_dir.as_mut() {
            anchor(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.run_timeout_secs == 0 {
            return Err(anyhow!("executor.run_timeout_secs must be > 0"));
        }
        if self.worker.timeout_secs == 0 {
            return Err(anyhow!("worker.timeout_secs must be > 0"));
        }
        if self.worker.command.is_empty() {
            return Err(anyhow!("worker.command must not be empty"));
        }
        if self.pipeline.regression_ratio < 1.0 || self.pipeline.peer_ratio < 1.0 {
            return Err(anyhow!("pipeline ratios must be >= 1.0"));
        }
        if !self.repo_slug.contains('/') {
            return Err(anyhow!("repo_slug must look like owner/repo"));
        }
        Ok(())
    }

    pub fn credentials_dir(&self) -> PathBuf {
        if let Some(dir) = &self.credentials_dir {
            return dir.clone();
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        home.join(".config").join("qa")
    }

    pub fn sandbox_parent(&self) -> PathBuf {
        self.executor
            .sandbox_parent
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn workspace_parent(&self) -> PathBuf {
        self.worker
            .workspace_parent
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
