//! Per-run call log and resource ledger.
//!
//! Both files are line-oriented and append-only. Every fake executable in a
//! sandbox is its own process, so each entry is written with a single
//! `write_all` on an `O_APPEND` handle.

use anyhow::Result;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Call { method: String, url: String },
    Body(String),
    NoFixture { provider: String, name: String },
    BodyError(String),
    ErrorInjected { scenario: String, url: String },
    Exec { command: String, args: String },
}

impl LogEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix("CALL ") {
            let (method, url) = rest.split_once(' ')?;
            return Some(Self::Call {
                method: method.to_string(),
                url: url.to_string(),
            });
        }
        if let Some(rest) = line.strip_prefix("BODY:") {
            return Some(Self::Body(rest.to_string()));
        }
        if let Some(rest) = line.strip_prefix("NO_FIXTURE:") {
            let (provider, name) = rest.split_once('/').unwrap_or(("", rest));
            return Some(Self::NoFixture {
                provider: provider.to_string(),
                name: name.to_string(),
            });
        }
        if let Some(rest) = line.strip_prefix("BODY_ERROR:") {
            return Some(Self::BodyError(rest.to_string()));
        }
        if let Some(rest) = line.strip_prefix("ERROR_INJECTED:") {
            let (scenario, url) = rest.split_once(' ').unwrap_or((rest, ""));
            return Some(Self::ErrorInjected {
                scenario: scenario.to_string(),
                url: url.to_string(),
            });
        }
        if let Some(rest) = line.strip_prefix("EXEC:") {
            let (command, args) = rest.split_once(' ').unwrap_or((rest, ""));
            return Some(Self::Exec {
                command: command.to_string(),
                args: args.to_string(),
            });
        }
        None
    }
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call { method, url } => write!(f, "CALL {} {}", method, single_line(url)),
            Self::Body(body) => write!(f, "BODY:{}", single_line(body)),
            Self::NoFixture { provider, name } => write!(f, "NO_FIXTURE:{}/{}", provider, name),
            Self::BodyError(detail) => write!(f, "BODY_ERROR:{}", detail),
            Self::ErrorInjected { scenario, url } => {
                write!(f, "ERROR_INJECTED:{} {}", scenario, single_line(url))
            }
            Self::Exec { command, args } => {
                write!(f, "EXEC:{} {}", command, single_line(args))
            }
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(format!("{}\n", line).as_bytes())
}

/// Call log for one sandboxed run. A missing path turns appends into no-ops.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    path: Option<PathBuf>,
}

impl CallLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn append(&self, entry: &LogEntry) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = append_line(path, &entry.to_string()) {
            warn!(path = %path.display(), error = %e, "call log append failed");
        }
    }

    pub fn read(path: &Path) -> Result<Vec<LogEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(path)?;
        Ok(data.lines().filter_map(LogEntry::parse).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Created,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEvent {
    pub kind: StateKind,
    pub provider: String,
    pub endpoint: String,
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            StateKind::Created => "CREATED",
            StateKind::Deleted => "DELETED",
        };
        write!(f, "{} {} {}", kind, self.provider, self.endpoint)
    }
}

impl StateEvent {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let kind = match parts.next()? {
            "CREATED" => StateKind::Created,
            "DELETED" => StateKind::Deleted,
            _ => return None,
        };
        Some(Self {
            kind,
            provider: parts.next()?.to_string(),
            endpoint: parts.next().unwrap_or("").to_string(),
        })
    }
}

/// Resource lifecycle ledger used for leak detection.
#[derive(Debug, Clone, Default)]
pub struct StateLedger {
    path: Option<PathBuf>,
}

impl StateLedger {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn record(&self, event: &StateEvent) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = append_line(path, &event.to_string()) {
            warn!(path = %path.display(), error = %e, "state ledger append failed");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeakReport {
    pub created: usize,
    pub deleted: usize,
}

impl LeakReport {
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut report = Self::default();
        if !path.exists() {
            return Ok(report);
        }
        for event in fs::read_to_string(path)?.lines().filter_map(StateEvent::parse) {
            match event.kind {
                StateKind::Created => report.created += 1,
                StateKind::Deleted => report.deleted += 1,
            }
        }
        Ok(report)
    }

    pub fn leaked(&self) -> usize {
        self.created.saturating_sub(self.deleted)
    }

    pub fn surplus_deletes(&self) -> usize {
        self.deleted.saturating_sub(self.created)
    }

    /// Human-readable anomalies; empty when every created resource was deleted.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.leaked() > 0 {
            out.push(format!(
                "resource leak: {} created, {} deleted",
                self.created, self.deleted
            ));
        }
        if self.surplus_deletes() > 0 {
            out.push(format!(
                "delete surplus: {} deleted but only {} created",
                self.deleted, self.created
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entries_render_and_parse_back() {
        let entries = vec![
            LogEntry::Call {
                method: "GET".into(),
                url: "https://api.hetzner.cloud/v1/servers".into(),
            },
            LogEntry::Body("{\"name\":\"x\"}".into()),
            LogEntry::NoFixture {
                provider: "hetzner".into(),
                name: "locations".into(),
            },
            LogEntry::BodyError("missing_field:name".into()),
            LogEntry::ErrorInjected {
                scenario: "auth_failure".into(),
                url: "https://api.hetzner.cloud/v1/servers".into(),
            },
            LogEntry::Exec {
                command: "ssh".into(),
                args: "root@192.0.2.10 true".into(),
            },
        ];
        for entry in entries {
            let line = entry.to_string();
            assert_eq!(LogEntry::parse(&line), Some(entry), "{}", line);
        }
        assert_eq!(LogEntry::parse("garbage"), None);
    }

    #[test]
    fn multi_line_bodies_stay_on_one_line() {
        let line = LogEntry::Body("{\n  \"a\": 1\n}".into()).to_string();
        assert!(!line.contains('\n'));
    }

    #[test]
    fn leak_report_counts_and_flags_anomalies() {
        let balanced = LeakReport {
            created: 2,
            deleted: 2,
        };
        assert!(balanced.warnings().is_empty());
        let leak = LeakReport {
            created: 2,
            deleted: 1,
        };
        assert_eq!(leak.leaked(), 1);
        assert_eq!(leak.warnings().len(), 1);
        let surplus = LeakReport {
            created: 0,
            deleted: 1,
        };
        assert_eq!(surplus.surplus_deletes(), 1);
        assert!(surplus.warnings()[0].contains("surplus"));
    }

    #[test]
    fn state_events_parse() {
        let event = StateEvent::parse("CREATED hetzner /servers").expect("event");
        assert_eq!(event.kind, StateKind::Created);
        assert_eq!(event.endpoint, "/servers");
        assert!(StateEvent::parse("RENAMED hetzner /servers").is_none());
    }
}
