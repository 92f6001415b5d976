//! Sandboxed execution, fixture recording, timing history, worker dispatch and
//! the pipeline that ties them together.

pub mod dispatch;
pub mod executor;
pub mod history;
pub mod pipeline;
pub mod process;
pub mod readme;
pub mod recorder;

use anyhow::Result;
use std::fs;
use std::path::Path;
use tracing::warn;

pub use dispatch::{DispatchConfig, Dispatcher, WorkerKind, WorkerOutcome, WorkerTask};
pub use executor::{
    discover_combinations, filter_combinations, parse_results_txt, write_results, Executor,
    ExecutorConfig, OutcomeCounts, RunResult,
};
pub use history::{SlowReason, SlowThresholds, TimingHistory};
pub use pipeline::{Phase, Pipeline, PipelineConfig, PipelineReport};
pub use recorder::{
    list_providers, select_providers, ApiTransport, CredentialResolver, HttpTransport,
    RecordError, RecordSummary, Recorder,
};

/// Remove every directory directly under `parent` whose name starts with
/// `prefix`. Missing `parent` is not an error.
pub fn remove_prefixed_dirs(parent: &Path, prefix: &str) -> Result<usize> {
    if !parent.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(prefix) || !entry.file_type()?.is_dir() {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove stale dir"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn only_prefixed_directories_are_removed() {
        let root = std::env::temp_dir().join(format!(
            "qa_cleanup_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(root.join("qa-sandbox-1/nested")).unwrap();
        fs::create_dir_all(root.join("qa-sandbox-2")).unwrap();
        fs::create_dir_all(root.join("keep-me")).unwrap();
        fs::write(root.join("qa-sandbox-file"), b"x").unwrap();

        assert_eq!(remove_prefixed_dirs(&root, "qa-sandbox-").unwrap(), 2);
        assert!(root.join("keep-me").is_dir());
        assert!(root.join("qa-sandbox-file").is_file());
        assert_eq!(remove_prefixed_dirs(&root.join("absent"), "qa-").unwrap(), 0);
        let _ = fs::remove_dir_all(root);
    }
}
