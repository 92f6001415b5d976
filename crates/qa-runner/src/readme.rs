//! Support-matrix updater for the repository README.
//!
//! The matrix header row starts with `| |` and names each provider column as
//! `[Display Name](dir/)`; agent rows start with `[**Agent Name**](...)`.
//! Only cells with a pass or fail result are rewritten.

use anyhow::{anyhow, Result};
use qa_core::{Combination, RunOutcome};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

pub const PASS_MARK: &str = "\u{2713}";
pub const FAIL_MARK: &str = "\u{2717}";

#[derive(Debug, Deserialize)]
struct Manifest {
    agents: BTreeMap<String, AgentInfo>,
}

#[derive(Debug, Deserialize)]
struct AgentInfo {
    name: String,
}

/// Display name → agent key, from `manifest.json`.
pub fn agent_names(manifest_json: &str) -> Result<BTreeMap<String, String>> {
    let manifest: Manifest =
        serde_json::from_str(manifest_json).map_err(|e| anyhow!("invalid manifest.json: {}", e))?;
    Ok(manifest
        .agents
        .into_iter()
        .map(|(key, info)| (info.name, key))
        .collect())
}

/// `[Name](dir/)` → `dir`.
fn column_dir(cell: &str) -> Option<&str> {
    let open = cell.find("](")?;
    let rest = &cell[open + 2..];
    let close = rest.find(')')?;
    let target = &rest[..close];
    let dir = target.split('/').next()?;
    (!dir.is_empty()).then_some(dir)
}

/// `[**Claude Code**](https://...)` → `Claude Code`.
fn row_agent_name(cell: &str) -> Option<&str> {
    let start = cell.find("[**")? + 3;
    let len = cell[start..].find("**]")?;
    Some(&cell[start..start + len])
}

fn replace_cell(cell: &str, mark: &str) -> Option<String> {
    let stripped = cell.trim();
    if stripped == mark {
        return None;
    }
    if stripped.is_empty() {
        return Some(format!(" {} ", mark));
    }
    Some(cell.replacen(stripped, mark, 1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixUpdate {
    pub cells_changed: usize,
}

/// Rewrite matrix cells in `readme` from `results`. Returns the new text and
/// how many cells changed.
pub fn update_matrix(
    readme: &str,
    agent_names: &BTreeMap<String, String>,
    results: &[(Combination, RunOutcome)],
) -> Result<(String, MatrixUpdate)> {
    let by_key: BTreeMap<String, RunOutcome> =
        results.iter().map(|(c, o)| (c.key(), *o)).collect();
    let mut lines: Vec<String> = readme.split_inclusive('\n').map(str::to_string).collect();
    let header_idx = lines
        .iter()
        .position(|l| l.starts_with("| |"))
        .ok_or_else(|| anyhow!("could not find the support matrix header (a row starting with '| |')"))?;

    let columns: Vec<(usize, String)> = lines[header_idx]
        .split('|')
        .enumerate()
        .filter_map(|(idx, cell)| column_dir(cell).map(|dir| (idx, dir.to_string())))
        .collect();

    let mut cells_changed = 0;
    for line in lines.iter_mut().skip(header_idx + 2) {
        if !line.starts_with('|') {
            break;
        }
        let newline = line.ends_with('\n');
        let body = line.trim_end_matches('\n');
        let mut cells: Vec<String> = body.split('|').map(str::to_string).collect();
        if cells.len() < 3 {
            continue;
        }
        let Some(agent) = row_agent_name(&cells[1]).and_then(|name| agent_names.get(name)) else {
            continue;
        };
        let mut row_changed = false;
        for (idx, dir) in &columns {
            let Some(outcome) = by_key.get(&format!("{}/{}", dir, agent)) else {
                continue;
            };
            let mark = match outcome {
                RunOutcome::Pass => PASS_MARK,
                RunOutcome::Fail => FAIL_MARK,
                RunOutcome::Timeout => continue,
            };
            let Some(cell) = cells.get_mut(*idx) else {
                continue;
            };
            if let Some(new_cell) = replace_cell(cell, mark) {
                *cell = new_cell;
                cells_changed += 1;
                row_changed = true;
            }
        }
        if row_changed {
            *line = cells.join("|");
            if newline {
                line.push('\n');
            }
        }
    }
    Ok((lines.concat(), MatrixUpdate { cells_changed }))
}

/// Apply a results file to `<repo>/README.md` using `<repo>/manifest.json`.
pub fn update_readme_file(repo_root: &Path, results: &[(Combination, RunOutcome)]) -> Result<MatrixUpdate> {
    if results.is_empty() {
        return Ok(MatrixUpdate { cells_changed: 0 });
    }
    let readme_path = repo_root.join("README.md");
    let readme = fs::read_to_string(&readme_path)
        .map_err(|e| anyhow!("failed to read {}: {}", readme_path.display(), e))?;
    let manifest = fs::read_to_string(repo_root.join("manifest.json"))
        .map_err(|e| anyhow!("failed to read manifest.json: {}", e))?;
    let (updated, summary) = update_matrix(&readme, &agent_names(&manifest)?, results)?;
    if summary.cells_changed > 0 {
        qa_core::atomic_write_bytes(&readme_path, updated.as_bytes())?;
    }
    info!(cells = summary.cells_changed, "README matrix updated");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const README: &str = "# Fleet\n\n\
| | [Hetzner Cloud](hetzner/) | [Vultr](vultr/) |\n\
|---|---|---|\n\
| [**Claude Code**](https://claude.ai) | \u{2717} | \u{2713} |\n\
| [**Aider**](https://aider.chat) |  | \u{2713} |\n\
\nFooter | not a table\n";

    const MANIFEST: &str = r#"{"agents": {"claude": {"name": "Claude Code"}, "aider": {"name": "Aider"}}}"#;

    fn results(entries: &[(&str, RunOutcome)]) -> Vec<(Combination, RunOutcome)> {
        entries.iter().map(|(c, o)| (c.parse().unwrap(), *o)).collect()
    }

    #[test]
    fn pass_and_fail_cells_are_rewritten_keeping_padding() {
        let names = agent_names(MANIFEST).unwrap();
        let (text, summary) = update_matrix(
            README,
            &names,
            &results(&[
                ("hetzner/claude", RunOutcome::Pass),
                ("vultr/aider", RunOutcome::Fail),
                ("hetzner/aider", RunOutcome::Pass),
            ]),
        )
        .unwrap();
        assert_eq!(summary.cells_changed, 3);
        assert!(text.contains("| [**Claude Code**](https://claude.ai) | \u{2713} | \u{2713} |\n"));
        assert!(text.contains("| [**Aider**](https://aider.chat) | \u{2713} | \u{2717} |\n"));
        assert!(text.ends_with("Footer | not a table\n"));
    }

    #[test]
    fn untested_and_timeout_cells_are_untouched() {
        let names = agent_names(MANIFEST).unwrap();
        let (text, summary) = update_matrix(
            README,
            &names,
            &results(&[("vultr/claude", RunOutcome::Pass), ("hetzner/claude", RunOutcome::Timeout)]),
        )
        .unwrap();
        assert_eq!(summary.cells_changed, 0);
        assert_eq!(text, README);
    }

    #[test]
    fn missing_header_is_an_error() {
        let names = agent_names(MANIFEST).unwrap();
        assert!(update_matrix("# nothing\n", &names, &[]).is_err());
    }
}
