use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

pub mod config;
pub mod registry;

pub use config::{ExecutorSettings, PipelineSettings, QaConfig, WorkerSettings};
pub use registry::{provider, provider_for_url, providers, LiveCycle, ProviderSpec};

/// Secret every installer must forward to the provisioned agent.
pub const SHARED_SECRET_ENV: &str = "OPENROUTER_API_KEY";
pub const NON_INTERACTIVE_ENV: &str = "QA_NON_INTERACTIVE";
pub const MOCK_SHARED_SECRET: &str = "sk-or-v1-0000000000000000000000000000000000000000000000000000000000qamock";

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| anyhow!("failed to create directory {}: {}", path.display(), e))
}

/// Write through a sibling temp file and rename it over `path`. The temp file
/// never outlives a failed write.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "qa".to_string());
    let tmp = parent.join(format!(
        ".{}.{}.{}.partial",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let written = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(anyhow!("failed to write {}: {}", path.display(), e));
    }
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Pretty JSON with a trailing newline. `Value` maps are ordered, so keys come out sorted.
pub fn pretty_json_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    atomic_write_bytes(path, &pretty_json_bytes(value)?)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(sha256_bytes(&bytes))
}

/// One installer script: `<provider>/<agent>.sh`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Combination {
    pub provider: String,
    pub agent: String,
}

impl Combination {
    pub fn new(provider: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            agent: agent.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.agent)
    }

    /// Filesystem-safe form, used for log and sandbox names.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.provider, self.agent)
    }

    pub fn script_path(&self, repo_root: &Path) -> std::path::PathBuf {
        repo_root
            .join(&self.provider)
            .join(format!("{}.sh", self.agent))
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.key())
    }
}

impl FromStr for Combination {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (provider, agent) = raw
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid combination '{}': expected provider/agent", raw))?;
        if provider.trim().is_empty() || agent.trim().is_empty() || agent.contains('/') {
            return Err(anyhow!(
                "invalid combination '{}': expected provider/agent",
                raw
            ));
        }
        Ok(Self::new(provider.trim(), agent.trim()))
    }
}

impl TryFrom<String> for Combination {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Combination> for String {
    fn from(value: Combination) -> Self {
        value.key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Pass,
    Fail,
    Timeout,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_pass(self) -> bool {
        self == Self::Pass
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "timeout" => Ok(Self::Timeout),
            other => Err(anyhow!("unknown run outcome: {}", other)),
        }
    }
}

/// Cut `s` to at most `max` chars on a char boundary, marking the cut with `...`.
pub fn trim_reason(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_atomic_write_leaves_no_partial_file() {
        let root = std::env::temp_dir().join(format!(
            "qa_core_write_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let target = root.join("busy");
        fs::create_dir_all(target.join("inside")).unwrap();

        let err = atomic_write_bytes(&target, b"data").unwrap_err();
        assert!(err.to_string().contains("busy"), "{}", err);
        let names: Vec<String> = fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["busy".to_string()]);

        atomic_write_bytes(&root.join("ok.txt"), b"data").unwrap();
        assert_eq!(fs::read(root.join("ok.txt")).unwrap(), b"data");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn combination_parses_and_renders_key() {
        let combo: Combination = "hetzner/claude".parse().expect("combo");
        assert_eq!(combo.provider, "hetzner");
        assert_eq!(combo.agent, "claude");
        assert_eq!(combo.to_string(), "hetzner/claude");
        assert_eq!(combo.slug(), "hetzner-claude");
        assert!("hetzner".parse::<Combination>().is_err());
        assert!("a/b/c".parse::<Combination>().is_err());
        assert!("/claude".parse::<Combination>().is_err());
    }

    #[test]
    fn combination_serializes_as_key_string() {
        let combo = Combination::new("vultr", "aider");
        let value = serde_json::to_value(&combo).expect("serialize");
        assert_eq!(value, Value::String("vultr/aider".to_string()));
        let back: Combination = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, combo);
    }

    #[test]
    fn run_outcome_parses_known_values_only() {
        assert_eq!("pass".parse::<RunOutcome>().unwrap(), RunOutcome::Pass);
        assert_eq!("timeout".parse::<RunOutcome>().unwrap(), RunOutcome::Timeout);
        assert!("skipped".parse::<RunOutcome>().is_err());
    }

    #[test]
    fn pretty_json_sorts_keys() {
        let value: Value = serde_json::from_str(r#"{"b":1,"a":{"d":2,"c":3}}"#).unwrap();
        let text = String::from_utf8(pretty_json_bytes(&value).unwrap()).unwrap();
        let a = text.find("\"a\"").unwrap();
        let b = text.find("\"b\"").unwrap();
        let c = text.find("\"c\"").unwrap();
        let d = text.find("\"d\"").unwrap();
        assert!(a < b && c < d);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn trim_reason_respects_char_boundaries() {
        assert_eq!(trim_reason("  short  ", 10), "short");
        let long = "é".repeat(50);
        let trimmed = trim_reason(&long, 10);
        assert_eq!(trimmed.chars().count(), 10);
        assert!(trimmed.ends_with("..."));
    }
}
