//! Timing history: the last few runs per combination plus the best passing time.

use crate::executor::RunResult;
use anyhow::{anyhow, Result};
use qa_core::{atomic_write_json_pretty, Combination, PipelineSettings, RunOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

pub const HISTORY_FILE_NAME: &str = "history.json";
pub const MAX_RUNS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingEntry {
    pub date: String,
    pub total_seconds: f64,
    pub status: RunOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTime {
    pub total_seconds: f64,
    pub date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinationHistory {
    #[serde(default)]
    pub runs: Vec<TimingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<BestTime>,
}

impl CombinationHistory {
    fn push(&mut self, entry: TimingEntry) {
        if entry.status.is_pass() {
            let improves = self
                .best
                .as_ref()
                .map_or(true, |b| entry.total_seconds < b.total_seconds);
            if improves {
                self.best = Some(BestTime {
                    total_seconds: entry.total_seconds,
                    date: entry.date.clone(),
                });
            }
        }
        self.runs.push(entry);
        if self.runs.len() > MAX_RUNS {
            let excess = self.runs.len() - MAX_RUNS;
            self.runs.drain(..excess);
        }
    }

    pub fn latest(&self) -> Option<&TimingEntry> {
        self.runs.last()
    }
}

/// Whole `history.json` document, keyed by `provider/agent`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimingHistory {
    pub entries: BTreeMap<String, CombinationHistory>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlowThresholds {
    pub ceiling_secs: f64,
    pub regression_ratio: f64,
    pub peer_ratio: f64,
}

impl From<&PipelineSettings> for SlowThresholds {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            ceiling_secs: settings.slow_ceiling_secs,
            regression_ratio: settings.regression_ratio,
            peer_ratio: settings.peer_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlowReason {
    Absolute { elapsed: f64, ceiling: f64 },
    Regression { elapsed: f64, best: f64 },
    Peer { elapsed: f64, peer: String, peer_best: f64 },
}

impl fmt::Display for SlowReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute { elapsed, ceiling } => {
                write!(f, "took {:.0}s, over the {:.0}s ceiling", elapsed, ceiling)
            }
            Self::Regression { elapsed, best } => {
                write!(f, "took {:.0}s, regressed from its best of {:.0}s", elapsed, best)
            }
            Self::Peer {
                elapsed,
                peer,
                peer_best,
            } => write!(
                f,
                "took {:.0}s while {} does the same agent in {:.0}s",
                elapsed, peer, peer_best
            ),
        }
    }
}

impl TimingHistory {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| anyhow!("invalid timing history {}: {}", path.display(), e))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &serde_json::to_value(self)?)
    }

    pub fn get(&self, combo: &Combination) -> Option<&CombinationHistory> {
        self.entries.get(&combo.key())
    }

    pub fn record(&mut self, result: &RunResult, date: &str) {
        self.entries
            .entry(result.combination.key())
            .or_default()
            .push(TimingEntry {
                date: date.to_string(),
                total_seconds: result.elapsed_seconds,
                status: result.outcome,
            });
    }

    /// Record a whole phase at once, after its join.
    pub fn record_all(&mut self, results: &[RunResult], date: &str) {
        for result in results {
            self.record(result, date);
        }
    }

    pub fn best(&self, combo: &Combination) -> Option<f64> {
        self.get(combo)?.best.as_ref().map(|b| b.total_seconds)
    }

    /// Fastest best time for `agent` on any provider other than `exclude_provider`.
    pub fn peer_best(&self, agent: &str, exclude_provider: &str) -> Option<(String, f64)> {
        self.entries
            .iter()
            .filter_map(|(key, hist)| {
                let combo: Combination = key.parse().ok()?;
                if combo.agent != agent || combo.provider == exclude_provider {
                    return None;
                }
                Some((combo.provider, hist.best.as_ref()?.total_seconds))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Slowness reasons for a passing run; empty for anything else.
    pub fn slow_reasons(&self, result: &RunResult, thresholds: &SlowThresholds) -> Vec<SlowReason> {
        if !result.outcome.is_pass() {
            return Vec::new();
        }
        let elapsed = result.elapsed_seconds;
        let mut reasons = Vec::new();
        if elapsed > thresholds.ceiling_secs {
            reasons.push(SlowReason::Absolute {
                elapsed,
                ceiling: thresholds.ceiling_secs,
            });
        }
        if let Some(best) = self.best(&result.combination) {
            if elapsed > best * thresholds.regression_ratio {
                reasons.push(SlowReason::Regression { elapsed, best });
            }
        }
        if let Some((peer, peer_best)) =
            self.peer_best(&result.combination.agent, &result.combination.provider)
        {
            if elapsed > peer_best * thresholds.peer_ratio {
                reasons.push(SlowReason::Peer {
                    elapsed,
                    peer,
                    peer_best,
                });
            }
        }
        reasons
    }

    pub fn render_table(&self) -> String {
        let mut out = format!(
            "{:<32} {:>8} {:>8} {:>6} {:<10}\n",
            "combination", "latest", "best", "runs", "status"
        );
        for (key, hist) in &self.entries {
            let latest = hist.latest();
            out.push_str(&format!(
                "{:<32} {:>8} {:>8} {:>6} {:<10}\n",
                key,
                latest.map_or("-".to_string(), |e| format!("{:.1}s", e.total_seconds)),
                hist.best
                    .as_ref()
                    .map_or("-".to_string(), |b| format!("{:.1}s", b.total_seconds)),
                hist.runs.len(),
                latest.map_or("-", |e| e.status.as_str()),
            ));
        }
        out
    }

    /// Latest and best time for one agent across every provider.
    pub fn render_compare(&self, agent: &str) -> String {
        let mut rows: Vec<(String, &CombinationHistory)> = self
            .entries
            .iter()
            .filter_map(|(key, hist)| {
                let combo: Combination = key.parse().ok()?;
                (combo.agent == agent).then_some((combo.provider, hist))
            })
            .collect();
        if rows.is_empty() {
            return format!("no timing history for agent '{}'\n", agent);
        }
        rows.sort_by(|a, b| {
            let best = |h: &CombinationHistory| h.best.as_ref().map_or(f64::MAX, |b| b.total_seconds);
            best(a.1).total_cmp(&best(b.1))
        });
        let mut out = format!("{:<16} {:>8} {:>8}\n", "provider", "latest", "best");
        for (provider, hist) in rows {
            out.push_str(&format!(
                "{:<16} {:>8} {:>8}\n",
                provider,
                hist.latest()
                    .map_or("-".to_string(), |e| format!("{:.1}s", e.total_seconds)),
                hist.best
                    .as_ref()
                    .map_or("-".to_string(), |b| format!("{:.1}s", b.total_seconds)),
            ));
        }
        out
    }
}
