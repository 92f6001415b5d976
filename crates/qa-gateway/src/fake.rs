//! Fake executables for a sandbox.
//!
//! Every name in the registry is a symlink to the `qa-mock` binary inside the
//! sandbox `bin/`; the binary looks itself up by `argv[0]` and plays back the
//! canned behavior, logging an `EXEC:` line first.

use crate::log::{CallLog, LogEntry};
use anyhow::{anyhow, Result};
use qa_core::atomic_write_json_pretty;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const REGISTRY_FILE_NAME: &str = ".fake-commands.json";
pub const REGISTRY_ENV: &str = "MOCK_FAKE_COMMANDS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeCommand {
    pub name: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    /// When false the invocation is not written to the call log.
    #[serde(default = "default_true")]
    pub log: bool,
}

fn default_true() -> bool {
    true
}

impl FakeCommand {
    pub fn silent_ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exit_code: 0,
            stdout: String::new(),
            log: true,
        }
    }

    pub fn with_stdout(name: &str, stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Self::silent_ok(name)
        }
    }
}

const REMOTE_COMMANDS: &[&str] = &["ssh", "scp", "ssh-keyscan", "sleep"];
const AGENT_COMMANDS: &[&str] = &[
    "claude",
    "aider",
    "codex",
    "goose",
    "opencode",
    "openclaw",
    "nanoclaw",
    "interpreter",
    "gptme",
];
const INSTALL_COMMANDS: &[&str] = &["npm", "npx", "pip", "pip3", "bun", "uv", "pipx"];

const KEYGEN_FINGERPRINT: &str =
    "256 SHA256:qaMockFingerprint0000000000000000000000000000 qa@sandbox (ED25519)\n";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FakeCommandRegistry {
    pub commands: BTreeMap<String, FakeCommand>,
}

impl FakeCommandRegistry {
    /// Stand-ins for remote access, agent binaries and package installers.
    pub fn defaults() -> Self {
        let mut registry = Self::default();
        for name in REMOTE_COMMANDS.iter().chain(AGENT_COMMANDS).chain(INSTALL_COMMANDS) {
            registry.insert(FakeCommand::silent_ok(name));
        }
        registry.insert(FakeCommand::with_stdout("ssh-keygen", KEYGEN_FINGERPRINT));
        registry
    }

    pub fn insert(&mut self, command: FakeCommand) {
        self.commands.insert(command.name.clone(), command);
    }

    pub fn get(&self, name: &str) -> Option<&FakeCommand> {
        self.commands.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| anyhow!("failed to read fake command registry {}: {}", path.display(), e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| anyhow!("invalid fake command registry {}: {}", path.display(), e))
    }

    /// Write the registry into `bin_dir` and link `curl` plus every registered
    /// name to `mock_binary`.
    pub fn install(&self, bin_dir: &Path, mock_binary: &Path) -> Result<PathBuf> {
        let registry_path = bin_dir.join(REGISTRY_FILE_NAME);
        atomic_write_json_pretty(&registry_path, &serde_json::to_value(self)?)?;
        for name in std::iter::once("curl").chain(self.names()) {
            let link = bin_dir.join(name);
            if link.symlink_metadata().is_ok() {
                fs::remove_file(&link)?;
            }
            std::os::unix::fs::symlink(mock_binary, &link).map_err(|e| {
                anyhow!("failed to link {} -> {}: {}", link.display(), mock_binary.display(), e)
            })?;
        }
        debug!(bin = %bin_dir.display(), count = self.commands.len(), "installed fake commands");
        Ok(registry_path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// Local file arguments of `scp`, i.e. anything that exists on disk and is not
/// a `host:path` remote spec.
fn local_file_args(args: &[String]) -> Vec<&String> {
    args.iter()
        .filter(|a| !a.starts_with('-') && !a.contains(':'))
        .filter(|a| Path::new(a.as_str()).is_file())
        .collect()
}

/// Play back `name`. Unknown names succeed silently so an unexpected helper
/// never aborts a run on its own.
pub fn run(registry: &FakeCommandRegistry, log: &CallLog, name: &str, args: &[String]) -> FakeOutput {
    let command = registry.get(name);
    if command.map_or(true, |c| c.log) {
        log.append(&LogEntry::Exec {
            command: name.to_string(),
            args: args.join(" "),
        });
    }
    // Uploaded files go in the log so secret propagation can be checked.
    if name == "scp" {
        for path in local_file_args(args) {
            if let Ok(content) = fs::read_to_string(path) {
                log.append(&LogEntry::Body(content));
            }
        }
    }
    match command {
        Some(c) => FakeOutput {
            stdout: c.stdout.clone(),
            exit_code: c.exit_code,
        },
        None => FakeOutput::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use qa_core::ensure_dir;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "qa_fake_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_cover_remote_and_agent_commands() {
        let registry = FakeCommandRegistry::defaults();
        for name in ["ssh", "scp", "ssh-keygen", "claude", "npm", "sleep"] {
            assert!(registry.get(name).is_some(), "{}", name);
        }
        assert!(registry.get("curl").is_none());
        assert!(registry.get("ssh-keygen").unwrap().stdout.contains("SHA256"));
    }

    #[test]
    fn install_links_curl_and_commands() {
        let dir = temp_dir("install");
        let mock = dir.join("qa-mock");
        fs::write(&mock, "#!/bin/sh\n").unwrap();
        let mut registry = FakeCommandRegistry::default();
        registry.insert(FakeCommand::silent_ok("ssh"));
        let path = registry.install(&dir, &mock).unwrap();
        assert_eq!(FakeCommandRegistry::load(&path).unwrap(), registry);
        assert_eq!(fs::read_link(dir.join("curl")).unwrap(), mock);
        assert_eq!(fs::read_link(dir.join("ssh")).unwrap(), mock);
        // second install replaces links in place
        registry.install(&dir, &mock).unwrap();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_logs_exec_and_scp_uploads() {
        let dir = temp_dir("run");
        let env_file = dir.join("agent.env");
        fs::write(&env_file, "export OPENROUTER_API_KEY=sk-test\n").unwrap();
        let log_path = dir.join("mock.log");
        let log = CallLog::new(Some(log_path.clone()));
        let registry = FakeCommandRegistry::defaults();

        let args = vec![env_file.display().to_string(), "root@192.0.2.10:/tmp/agent.env".to_string()];
        let out = run(&registry, &log, "scp", &args);
        assert_eq!(out.exit_code, 0);

        let entries = CallLog::read(&log_path).unwrap();
        assert!(matches!(&entries[0], LogEntry::Exec { command, .. } if command == "scp"));
        assert!(entries
            .iter()
            .any(|e| matches!(e, LogEntry::Body(b) if b.contains("OPENROUTER_API_KEY"))));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn configured_exit_code_is_returned() {
        let mut registry = FakeCommandRegistry::default();
        registry.insert(FakeCommand {
            name: "ssh".into(),
            exit_code: 255,
            stdout: String::new(),
            log: false,
        });
        let out = run(&registry, &CallLog::default(), "ssh", &[]);
        assert_eq!(out.exit_code, 255);
    }
}
