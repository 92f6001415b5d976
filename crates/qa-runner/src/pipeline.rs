//! Pipeline Orchestrator.
//!
//! `KeyPreflight → RecordFixtures → RunMockTests → TriageAndFix → Reverify →
//! TriageAndOptimize (opt-in) → Report`. The cycle budget is checked between
//! phases only; once exceeded the pipeline jumps straight to `Report`.

use crate::dispatch::{Dispatcher, WorkerKind, WorkerOutcome, WorkerTask};
use crate::executor::{write_results, Executor, OutcomeCounts, RunResult};
use crate::history::{SlowReason, SlowThresholds, TimingHistory, HISTORY_FILE_NAME};
use crate::readme::update_readme_file;
use crate::recorder::{ApiTransport, CredentialResolver, RecordError, RecordSummary, Recorder};
use anyhow::Result;
use chrono::Utc;
use qa_core::{atomic_write_bytes, provider, providers, Combination, ProviderSpec, QaConfig, RunOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const REPORT_FILE_NAME: &str = "pipeline_report.md";
const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    KeyPreflight,
    RecordFixtures,
    RunMockTests,
    TriageAndFix,
    Reverify,
    TriageAndOptimize,
    Report,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeyPreflight => "KeyPreflight",
            Self::RecordFixtures => "RecordFixtures",
            Self::RunMockTests => "RunMockTests",
            Self::TriageAndFix => "TriageAndFix",
            Self::Reverify => "Reverify",
            Self::TriageAndOptimize => "TriageAndOptimize",
            Self::Report => "Report",
        }
    }

    fn dir_name(self) -> &'static str {
        match self {
            Self::RunMockTests => "run_mock_tests",
            Self::Reverify => "reverify",
            Self::TriageAndOptimize => "optimize_confirm",
            _ => "misc",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub repo_root: PathBuf,
    pub fixtures_dir: PathBuf,
    pub results_dir: PathBuf,
    pub cycle_budget: Duration,
    pub record_retry_limit: u32,
    pub thresholds: SlowThresholds,
    pub optimize: bool,
    pub update_readme: bool,
}

impl PipelineConfig {
    pub fn from_qa_config(config: &QaConfig, repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            fixtures_dir: config.fixtures_dir.clone(),
            results_dir: config.results_dir.clone(),
            cycle_budget: Duration::from_secs(config.pipeline.cycle_budget_secs),
            record_retry_limit: config.pipeline.record_retry_limit,
            thresholds: SlowThresholds::from(&config.pipeline),
            optimize: config.pipeline.optimize,
            update_readme: config.pipeline.update_readme,
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.results_dir.join(HISTORY_FILE_NAME)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureLine {
    pub combination: Combination,
    pub outcome: RunOutcome,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<OutcomeCounts>,
    pub elapsed_seconds: f64,
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureLine>,
}

impl PhaseSummary {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            counts: None,
            elapsed_seconds: 0.0,
            notes: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn with_results(mut self, results: &[RunResult]) -> Self {
        self.counts = Some(OutcomeCounts::tally(results));
        self.failures = results
            .iter()
            .filter(|r| !r.outcome.is_pass())
            .map(|r| FailureLine {
                combination: r.combination.clone(),
                outcome: r.outcome,
                reason: r.reason.clone(),
            })
            .collect();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: String,
    pub elapsed_seconds: f64,
    pub phases: Vec<PhaseSummary>,
    /// First phase skipped because the cycle budget ran out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_before: Option<Phase>,
    pub workers: Vec<WorkerOutcome>,
    /// Counts from the last full-matrix run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_counts: Option<OutcomeCounts>,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        self.final_counts.is_some_and(|c| c.total() > 0 && c.all_pass())
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::from("# QA pipeline report\n\n");
        out.push_str(&format!("- started: {}\n", self.started_at));
        out.push_str(&format!("- elapsed: {:.0}s\n", self.elapsed_seconds));
        out.push_str(&format!(
            "- result: {}\n",
            if self.success() { "PASS" } else { "FAIL" }
        ));
        if let Some(phase) = self.stopped_before {
            out.push_str(&format!("- cycle budget exhausted before {}\n", phase));
        }
        out.push_str("\n| phase | pass | fail | timeout | elapsed |\n|---|---|---|---|---|\n");
        for p in &self.phases {
            let (pass, fail, timeout) = p
                .counts
                .map(|c| (c.pass.to_string(), c.fail.to_string(), c.timeout.to_string()))
                .unwrap_or_else(|| ("-".into(), "-".into(), "-".into()));
            out.push_str(&format!(
                "| {} | {} | {} | {} | {:.0}s |\n",
                p.phase, pass, fail, timeout, p.elapsed_seconds
            ));
        }
        for p in &self.phases {
            if p.notes.is_empty() && p.failures.is_empty() {
                continue;
            }
            out.push_str(&format!("\n## {}\n\n", p.phase));
            for note in &p.notes {
                out.push_str(&format!("- {}\n", note));
            }
            for f in &p.failures {
                out.push_str(&format!("- `{}` {}: {}\n", f.combination, f.outcome, f.reason));
            }
        }
        if !self.workers.is_empty() {
            out.push_str("\n## Workers\n\n");
            for w in &self.workers {
                out.push_str(&format!(
                    "- {} ({}): {}{}, {}\n",
                    w.label,
                    w.kind.as_str(),
                    if w.accepted { "accepted" } else { "not applied" },
                    if w.timed_out { ", timed out" } else { "" },
                    w.detail
                ));
            }
        }
        out
    }
}

fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

fn fenced(lang: &str, body: &str) -> String {
    format!("```{}\n{}\n```\n", lang, body.trim_end())
}

pub struct Pipeline<'a, T: ApiTransport> {
    config: PipelineConfig,
    executor: Executor,
    dispatcher: Dispatcher,
    credentials: CredentialResolver,
    transport: &'a T,
    started: Instant,
}

impl<'a, T: ApiTransport> Pipeline<'a, T> {
    pub fn new(
        config: PipelineConfig,
        executor: Executor,
        dispatcher: Dispatcher,
        credentials: CredentialResolver,
        transport: &'a T,
    ) -> Self {
        Self {
            config,
            executor,
            dispatcher,
            credentials,
            transport,
            started: Instant::now(),
        }
    }

    fn over_budget(&self) -> bool {
        self.started.elapsed() >= self.config.cycle_budget
    }

    fn rel(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.config.repo_root).ok().map(Path::to_path_buf)
    }

    pub fn run(mut self) -> Result<PipelineReport> {
        let started_at = Utc::now().to_rfc3339();
        let mut report = PipelineReport {
            started_at,
            elapsed_seconds: 0.0,
            phases: Vec::new(),
            stopped_before: None,
            workers: Vec::new(),
            final_counts: None,
        };
        let mut history = TimingHistory::load(&self.config.history_path()).unwrap_or_else(|e| {
            warn!(error = %e, "starting with an empty timing history");
            TimingHistory::default()
        });

        let phases = [
            Phase::KeyPreflight,
            Phase::RecordFixtures,
            Phase::RunMockTests,
            Phase::TriageAndFix,
            Phase::Reverify,
            Phase::TriageAndOptimize,
            Phase::Report,
        ];
        let mut keyed: Vec<&'static ProviderSpec> = Vec::new();
        let mut results: Vec<RunResult> = Vec::new();
        let mut integrated_fixes = 0;

        for phase in phases {
            if phase == Phase::TriageAndOptimize && !self.config.optimize {
                continue;
            }
            if phase != Phase::Report {
                if report.stopped_before.is_some() {
                    continue;
                }
                if self.over_budget() {
                    warn!(phase = %phase, "cycle budget exhausted, skipping to report");
                    report.stopped_before = Some(phase);
                    continue;
                }
            }
            let phase_started = Instant::now();
            info!(phase = %phase, "phase starting");
            let mut summary = match phase {
                Phase::KeyPreflight => {
                    let (summary, found) = self.key_preflight();
                    keyed = found;
                    summary
                }
                Phase::RecordFixtures => self.record_fixtures(&keyed, &mut report.workers),
                Phase::RunMockTests => {
                    results = self.run_matrix(phase, &mut history)?;
                    report.final_counts = Some(OutcomeCounts::tally(&results));
                    PhaseSummary::new(phase).with_results(&results)
                }
                Phase::TriageAndFix => {
                    let (summary, outcomes) = self.triage_and_fix(&results);
                    integrated_fixes = outcomes.iter().filter(|o| o.accepted).count();
                    report.workers.extend(outcomes);
                    summary
                }
                Phase::Reverify => {
                    let before = report.final_counts;
                    results = self.run_matrix(phase, &mut history)?;
                    let after = OutcomeCounts::tally(&results);
                    report.final_counts = Some(after);
                    let mut s = PhaseSummary::new(phase).with_results(&results);
                    if let Some(before) = before {
                        s.notes.push(format!(
                            "{} integrated fix(es); passing {} -> {}",
                            integrated_fixes, before.pass, after.pass
                        ));
                    }
                    s
                }
                Phase::TriageAndOptimize => {
                    let (summary, outcomes) =
                        self.triage_and_optimize(&mut results, &mut history)?;
                    report.final_counts = Some(OutcomeCounts::tally(&results));
                    report.workers.extend(outcomes);
                    summary
                }
                Phase::Report => self.report_phase(&results),
            };
            summary.elapsed_seconds = phase_started.elapsed().as_secs_f64();
            report.phases.push(summary);
        }
        report.elapsed_seconds = self.started.elapsed().as_secs_f64();

        let path = self.config.results_dir.join(REPORT_FILE_NAME);
        atomic_write_bytes(&path, report.render_markdown().as_bytes())?;
        info!(report = %path.display(), success = report.success(), "pipeline finished");
        Ok(report)
    }

    fn key_preflight(&self) -> (PhaseSummary, Vec<&'static ProviderSpec>) {
        let mut summary = PhaseSummary::new(Phase::KeyPreflight);
        let mut keyed = Vec::new();
        for spec in providers() {
            match self.credentials.peek(spec) {
                Some(source) => {
                    summary
                        .notes
                        .push(format!("{}: credentials from {}", spec.id, source.as_str()));
                    keyed.push(spec);
                }
                None => summary.notes.push(format!(
                    "{}: no credentials ({} unset), skipped for recording",
                    spec.id, spec.credential_env
                )),
            }
        }
        (summary, keyed)
    }

    /// Record the given providers in parallel, one thread per provider.
    fn record_providers(
        &self,
        specs: &[&'static ProviderSpec],
    ) -> Vec<(&'static ProviderSpec, Result<RecordSummary, RecordError>)> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = specs
                .iter()
                .map(|spec| {
                    let spec = *spec;
                    (spec, scope.spawn(move || self.record_one(spec)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(spec, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(RecordError::Transport("recorder thread panicked".into()))
                    });
                    (spec, result)
                })
                .collect()
        })
    }

    fn record_one(&self, spec: &ProviderSpec) -> Result<RecordSummary, RecordError> {
        let (token, _) = self.credentials.resolve(spec)?;
        Recorder::new(self.transport, &self.config.fixtures_dir).record(spec, &token)
    }

    fn record_fixtures(
        &mut self,
        keyed: &[&'static ProviderSpec],
        workers: &mut Vec<WorkerOutcome>,
    ) -> PhaseSummary {
        let mut summary = PhaseSummary::new(Phase::RecordFixtures);
        if keyed.is_empty() {
            summary.notes.push("no provider credentials; fixtures left as they are".into());
            return summary;
        }

        let mut drifted: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        let mut stale: Vec<&'static ProviderSpec> = Vec::new();
        for (spec, result) in self.record_providers(keyed) {
            self.classify(spec, result, &mut summary, &mut drifted, &mut stale);
        }

        // Stale credentials are re-requested, never handed to a fix worker.
        if !stale.is_empty() {
            for spec in &stale {
                self.credentials.invalidate(spec);
            }
            let retry: Vec<&'static ProviderSpec> = stale
                .iter()
                .copied()
                .filter(|spec| self.credentials.resolve(spec).is_ok())
                .collect();
            for spec in stale.iter().filter(|s| !retry.iter().any(|r| r.id == s.id)) {
                summary
                    .notes
                    .push(format!("{}: credentials invalid and no replacement available", spec.id));
            }
            let mut still_stale = Vec::new();
            for (spec, result) in self.record_providers(&retry) {
                self.classify(spec, result, &mut summary, &mut drifted, &mut still_stale);
            }
            for spec in still_stale {
                summary
                    .notes
                    .push(format!("{}: replacement credentials rejected too", spec.id));
            }
        }

        let mut attempt = 0;
        while !drifted.is_empty() && attempt < self.config.record_retry_limit {
            attempt += 1;
            let tasks: Vec<WorkerTask> = drifted
                .iter()
                .filter_map(|(id, errors)| provider(id).map(|spec| self.record_fix_task(spec, errors)))
                .collect();
            let outcomes = self.dispatcher.dispatch_all(&tasks);
            workers.extend(outcomes);

            let specs: Vec<&'static ProviderSpec> =
                drifted.keys().filter_map(|id| provider(id)).collect();
            drifted.clear();
            let mut ignored = Vec::new();
            for (spec, result) in self.record_providers(&specs) {
                self.classify(spec, result, &mut summary, &mut drifted, &mut ignored);
            }
        }
        for (id, errors) in &drifted {
            summary.notes.push(format!(
                "{}: {} endpoint(s) still failing after {} fix attempt(s)",
                id,
                errors.len(),
                attempt
            ));
        }
        summary
    }

    fn classify(
        &self,
        spec: &'static ProviderSpec,
        result: Result<RecordSummary, RecordError>,
        summary: &mut PhaseSummary,
        drifted: &mut BTreeMap<&'static str, Vec<String>>,
        stale: &mut Vec<&'static ProviderSpec>,
    ) {
        match result {
            Ok(rec) if rec.ok() => summary.notes.push(format!(
                "{}: {} written, {} unchanged",
                spec.id, rec.recorded_count, rec.unchanged_count
            )),
            Ok(rec) => {
                summary.notes.push(format!(
                    "{}: {} written, {} error(s)",
                    spec.id, rec.recorded_count, rec.error_count
                ));
                drifted.insert(spec.id, rec.errors);
            }
            Err(e) if e.is_auth() => {
                summary.notes.push(format!("{}: {}", spec.id, e));
                stale.push(spec);
            }
            Err(e @ RecordError::MissingCredentials { .. }) => {
                summary.notes.push(format!("{}: {}", spec.id, e));
            }
            Err(e) => {
                summary.notes.push(format!("{}: {}", spec.id, e));
                drifted.insert(spec.id, vec![e.to_string()]);
            }
        }
    }

    fn run_matrix(&self, phase: Phase, history: &mut TimingHistory) -> Result<Vec<RunResult>> {
        let combos = crate::executor::discover_combinations(&self.config.repo_root)?;
        let results = self.executor.run_matrix(&combos);
        write_results(&self.config.results_dir.join(phase.dir_name()), &results)?;
        write_results(&self.config.results_dir, &results)?;
        history.record_all(&results, &Utc::now().format("%Y-%m-%d").to_string());
        history.save(&self.config.history_path())?;
        Ok(results)
    }

    fn script_rel(&self, combo: &Combination) -> PathBuf {
        PathBuf::from(&combo.provider).join(format!("{}.sh", combo.agent))
    }

    fn output_tail(&self, combo: &Combination) -> String {
        tail_lines(
            &read_or_empty(&self.executor.config().output_log_path(combo)),
            OUTPUT_TAIL_LINES,
        )
    }

    fn api_lib_section(&self, spec: &ProviderSpec, allowed: &mut Vec<PathBuf>) -> String {
        let rel = PathBuf::from(spec.api_lib_path());
        let source = read_or_empty(&self.config.repo_root.join(&rel));
        allowed.push(rel.clone());
        if source.is_empty() {
            return String::new();
        }
        format!("\n## Provider API library ({})\n\n{}", rel.display(), fenced("bash", &source))
    }

    /// Same agent on another provider that currently passes.
    fn reference_for<'r>(&self, combo: &Combination, results: &'r [RunResult]) -> Option<&'r RunResult> {
        results.iter().find(|r| {
            r.outcome.is_pass()
                && r.combination.agent == combo.agent
                && r.combination.provider != combo.provider
        })
    }

    fn fix_task(
        &self,
        spec: &ProviderSpec,
        failing: &[&RunResult],
        all: &[RunResult],
    ) -> WorkerTask {
        let mut allowed = Vec::new();
        let mut prompt = format!(
            "Installer scripts for {} fail when run against the mock provider API.\n\
             Fix them so each run lists SSH keys, creates a server, reaches it over ssh, \
             forwards OPENROUTER_API_KEY and exits 0. Keep every script non-interactive.\n",
            spec.display_name
        );
        for result in failing {
            let rel = self.script_rel(&result.combination);
            let source = read_or_empty(&self.config.repo_root.join(&rel));
            prompt.push_str(&format!(
                "\n## {} ({})\n\nFailure: {}\n\nOutput tail:\n{}\nCurrent source:\n{}",
                rel.display(),
                result.outcome,
                result.reason,
                fenced("", &self.output_tail(&result.combination)),
                fenced("bash", &source)
            ));
            if let Some(reference) = self.reference_for(&result.combination, all) {
                let ref_rel = self.script_rel(&reference.combination);
                prompt.push_str(&format!(
                    "\nReference implementation ({}, currently passing):\n{}",
                    ref_rel.display(),
                    fenced("bash", &read_or_empty(&self.config.repo_root.join(&ref_rel)))
                ));
            }
            allowed.push(rel);
        }
        prompt.push_str(&self.api_lib_section(spec, &mut allowed));
        prompt.push_str(&format!(
            "\nOnly these files may change: {}\n",
            allowed
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        WorkerTask {
            kind: WorkerKind::Fix,
            label: format!("fix-{}", spec.id),
            prompt,
            allowed_files: allowed,
        }
    }

    fn record_fix_task(&self, spec: &ProviderSpec, errors: &[String]) -> WorkerTask {
        let mut allowed = Vec::new();
        let mut prompt = format!(
            "Recording live API fixtures for {} failed. The provider API or the integration \
             code has drifted. Errors:\n\n",
            spec.display_name
        );
        for e in errors {
            prompt.push_str(&format!("- {}\n", e));
        }
        prompt.push_str(&self.api_lib_section(spec, &mut allowed));
        if let Some(fixtures_rel) = self.rel(&self.config.fixtures_dir.join(spec.id)) {
            prompt.push_str(&format!(
                "\nRecorded fixtures live under {}.\n",
                fixtures_rel.display()
            ));
        }
        prompt.push_str("\nUpdate the API library so it matches the current provider API.\n");
        WorkerTask {
            kind: WorkerKind::RecordFix,
            label: format!("record-fix-{}", spec.id),
            prompt,
            allowed_files: allowed,
        }
    }

    fn triage_and_fix(&self, results: &[RunResult]) -> (PhaseSummary, Vec<WorkerOutcome>) {
        let mut summary = PhaseSummary::new(Phase::TriageAndFix);
        let mut by_provider: BTreeMap<&str, Vec<&RunResult>> = BTreeMap::new();
        for r in results.iter().filter(|r| !r.outcome.is_pass()) {
            by_provider.entry(r.combination.provider.as_str()).or_default().push(r);
        }
        if by_provider.is_empty() {
            summary.notes.push("nothing to fix".into());
            return (summary, Vec::new());
        }
        let tasks: Vec<WorkerTask> = by_provider
            .iter()
            .filter_map(|(id, failing)| provider(id).map(|spec| self.fix_task(spec, failing, results)))
            .collect();
        let outcomes = self.dispatcher.dispatch_all(&tasks);
        for o in &outcomes {
            summary.notes.push(format!(
                "{}: {} ({} file(s) changed)",
                o.label,
                if o.accepted { "integrated" } else { "no change" },
                o.changed_files.len()
            ));
        }
        (summary, outcomes)
    }

    fn optimize_task(&self, spec: &ProviderSpec, slow: &[(&RunResult, Vec<SlowReason>)]) -> WorkerTask {
        let mut allowed = Vec::new();
        let mut prompt = format!(
            "These {} installer scripts pass but are slow. Make them faster. Do not break \
             passing behavior: every script must still pass against the mock provider API.\n",
            spec.display_name
        );
        for (result, reasons) in slow {
            let rel = self.script_rel(&result.combination);
            let why = reasons.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
            prompt.push_str(&format!(
                "\n## {}\n\nWhy it is slow: {}\n\n{}",
                rel.display(),
                why,
                fenced("bash", &read_or_empty(&self.config.repo_root.join(&rel)))
            ));
            allowed.push(rel);
        }
        prompt.push_str(&self.api_lib_section(spec, &mut allowed));
        WorkerTask {
            kind: WorkerKind::Optimize,
            label: format!("optimize-{}", spec.id),
            prompt,
            allowed_files: allowed,
        }
    }

    /// Optimize slow passing combinations; re-run what the worker touched and
    /// revert it when any of those stops passing. An edit to the shared API
    /// library re-runs every combination of that provider.
    fn triage_and_optimize(
        &self,
        results: &mut Vec<RunResult>,
        history: &mut TimingHistory,
    ) -> Result<(PhaseSummary, Vec<WorkerOutcome>)> {
        let mut summary = PhaseSummary::new(Phase::TriageAndOptimize);
        let mut by_provider: BTreeMap<String, Vec<(&RunResult, Vec<SlowReason>)>> = BTreeMap::new();
        for r in results.iter() {
            let reasons = history.slow_reasons(r, &self.config.thresholds);
            if !reasons.is_empty() {
                by_provider
                    .entry(r.combination.provider.clone())
                    .or_default()
                    .push((r, reasons));
            }
        }
        if by_provider.is_empty() {
            summary.notes.push("no slow combinations".into());
            return Ok((summary.with_results(results), Vec::new()));
        }
        let mut targets: BTreeMap<String, Vec<Combination>> = BTreeMap::new();
        let tasks: Vec<WorkerTask> = by_provider
            .iter()
            .filter_map(|(id, slow)| {
                let spec = provider(id)?;
                targets.insert(
                    format!("optimize-{}", spec.id),
                    slow.iter().map(|(r, _)| r.combination.clone()).collect(),
                );
                Some(self.optimize_task(spec, slow))
            })
            .collect();
        let outcomes = self.dispatcher.dispatch_all(&tasks);

        let date = Utc::now().format("%Y-%m-%d").to_string();
        for outcome in outcomes.iter().filter(|o| o.accepted) {
            let combos = targets.get(&outcome.label).cloned().unwrap_or_default();
            let combos = self.rerun_scope(results, combos, &outcome.changed_files);
            let rerun = self.executor.run_matrix(&combos);
            history.record_all(&rerun, &date);
            if rerun.iter().all(|r| r.outcome.is_pass()) {
                summary.notes.push(format!("{}: kept, still passing", outcome.label));
                for fresh in rerun {
                    if let Some(slot) = results.iter_mut().find(|r| r.combination == fresh.combination) {
                        *slot = fresh;
                    }
                }
            } else {
                self.dispatcher.revert(outcome)?;
                summary
                    .notes
                    .push(format!("{}: reverted, broke a passing combination", outcome.label));
            }
        }
        history.save(&self.config.history_path())?;
        write_results(&self.config.results_dir.join(Phase::TriageAndOptimize.dir_name()), results)?;
        write_results(&self.config.results_dir, results)?;
        Ok((summary.with_results(results), outcomes))
    }

    /// `targets` alone when only their scripts changed, otherwise every known
    /// combination of the targets' provider.
    fn rerun_scope(
        &self,
        results: &[RunResult],
        targets: Vec<Combination>,
        changed: &[PathBuf],
    ) -> Vec<Combination> {
        let scripts: Vec<PathBuf> = targets.iter().map(|c| self.script_rel(c)).collect();
        if changed.iter().all(|f| scripts.contains(f)) {
            return targets;
        }
        let Some(provider) = targets.first().map(|c| c.provider.clone()) else {
            return targets;
        };
        results
            .iter()
            .map(|r| &r.combination)
            .filter(|c| c.provider == provider)
            .cloned()
            .collect()
    }

    fn report_phase(&self, results: &[RunResult]) -> PhaseSummary {
        let mut summary = PhaseSummary::new(Phase::Report);
        if self.config.update_readme && !results.is_empty() {
            let pairs: Vec<(Combination, RunOutcome)> = results
                .iter()
                .map(|r| (r.combination.clone(), r.outcome))
                .collect();
            match update_readme_file(&self.config.repo_root, &pairs) {
                Ok(update) => summary
                    .notes
                    .push(format!("README matrix: {} cell(s) updated", update.cells_changed)),
                Err(e) => summary.notes.push(format!("README matrix not updated: {}", e)),
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchConfig;
    use crate::executor::{ExecutorConfig, RESULTS_TXT};
    use crate::recorder::ApiResponse;
    use qa_core::ensure_dir;
    use serde_json::Value;
    use std::os::unix::fs::PermissionsExt;

    struct NoNetwork;

    impl ApiTransport for NoNetwork {
        fn get(&self, url: &str, _: &str) -> Result<ApiResponse, RecordError> {
            Err(RecordError::Transport(format!("offline: {}", url)))
        }
        fn post(&self, url: &str, _: &str, _: &Value) -> Result<ApiResponse, RecordError> {
            Err(RecordError::Transport(format!("offline: {}", url)))
        }
        fn delete(&self, url: &str, _: &str) -> Result<ApiResponse, RecordError> {
            Err(RecordError::Transport(format!("offline: {}", url)))
        }
    }

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "qa_pipeline_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).unwrap();
        root
    }

    fn script(repo: &Path, rel: &str, body: &str) {
        let path = repo.join(rel);
        ensure_dir(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn pipeline<'a>(
        root: &Path,
        worker: &str,
        transport: &'a NoNetwork,
        budget: Duration,
    ) -> Pipeline<'a, NoNetwork> {
        let repo = root.join("repo");
        let mut qa = QaConfig::default();
        qa.fixtures_dir = repo.join("test/fixtures");
        qa.results_dir = root.join("results");
        qa.executor.run_timeout_secs = 10;
        qa.executor.max_parallel = 2;
        qa.executor.sandbox_parent = Some(root.join("sandboxes"));
        qa.worker.workspace_parent = Some(root.join("workspaces"));
        qa.worker.command = vec!["sh".into(), "-c".into(), worker.into()];
        qa.worker.timeout_secs = 20;
        let mut config = PipelineConfig::from_qa_config(&qa, &repo);
        config.cycle_budget = budget;
        Pipeline::new(
            config,
            Executor::new(ExecutorConfig::from_qa_config(&qa, &repo, PathBuf::from("/bin/true"))),
            Dispatcher::new(DispatchConfig::from_qa_config(&qa, &repo)),
            CredentialResolver::new(root.join("creds"), BTreeMap::new(), false),
            transport,
        )
    }

    #[test]
    fn failing_matrix_dispatches_one_fix_per_provider_and_reports() {
        let root = temp_root("fix");
        let repo = root.join("repo");
        script(&repo, "hetzner/claude.sh", "echo 'fatal: no server' >&2\nexit 1\n");
        script(&repo, "hetzner/aider.sh", "exit 1\n");
        script(&repo, "vultr/claude.sh", "exit 1\n");
        script(&repo, "hetzner/lib/common.sh", "echo lib\n");

        let transport = NoNetwork;
        let report = pipeline(&root, "cat >/dev/null", &transport, Duration::from_secs(600))
            .run()
            .unwrap();

        let fix_labels: Vec<&str> = report.workers.iter().map(|w| w.label.as_str()).collect();
        assert_eq!(fix_labels, vec!["fix-hetzner", "fix-vultr"]);
        assert!(report.workers.iter().all(|w| !w.accepted));
        assert!(!report.success());
        let counts = report.final_counts.unwrap();
        assert_eq!(counts.fail, 3);

        let phases: Vec<Phase> = report.phases.iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::KeyPreflight,
                Phase::RecordFixtures,
                Phase::RunMockTests,
                Phase::TriageAndFix,
                Phase::Reverify,
                Phase::Report
            ]
        );
        let markdown = fs::read_to_string(root.join("results").join(REPORT_FILE_NAME)).unwrap();
        assert!(markdown.contains("| RunMockTests | 0 | 3 | 0 |"), "{}", markdown);
        assert!(markdown.contains("`hetzner/claude` fail"));
        let txt = fs::read_to_string(root.join("results").join(RESULTS_TXT)).unwrap();
        assert_eq!(txt.lines().count(), 3);
        let history = TimingHistory::load(&root.join("results").join(HISTORY_FILE_NAME)).unwrap();
        assert_eq!(history.entries.len(), 3);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fix_prompt_carries_reference_implementation() {
        let root = temp_root("prompt");
        let repo = root.join("repo");
        script(&repo, "hetzner/claude.sh", "exit 1\n");
        script(&repo, "vultr/claude.sh", "echo 'vultr way'\n");
        let transport = NoNetwork;
        let p = pipeline(&root, "true", &transport, Duration::from_secs(600));
        let failing = RunResult {
            combination: "hetzner/claude".parse().unwrap(),
            outcome: RunOutcome::Fail,
            elapsed_seconds: 1.0,
            reason: "non-zero exit".into(),
            warnings: Vec::new(),
        };
        let passing = RunResult {
            combination: "vultr/claude".parse().unwrap(),
            outcome: RunOutcome::Pass,
            ..failing.clone()
        };
        let all = vec![failing.clone(), passing];
        let task = p.fix_task(provider("hetzner").unwrap(), &[&all[0]], &all);
        assert!(task.prompt.contains("Reference implementation (vultr/claude.sh"));
        assert!(task.prompt.contains("vultr way"));
        assert_eq!(
            task.allowed_files,
            vec![PathBuf::from("hetzner/claude.sh"), PathBuf::from("hetzner/lib/common.sh")]
        );
        let _ = fs::remove_dir_all(root);
    }

    const PASSING_LIB: &str = "provision() {\n\
        echo 'CALL GET https://api.hetzner.cloud/v1/ssh_keys' >> \"$MOCK_LOG\"\n\
        echo 'CALL POST https://api.hetzner.cloud/v1/servers' >> \"$MOCK_LOG\"\n\
        echo 'EXEC:ssh root@192.0.2.10 true' >> \"$MOCK_LOG\"\n\
        echo \"$OPENROUTER_API_KEY\"\n\
        }\n";

    #[test]
    fn shared_library_edit_reruns_every_agent_of_the_provider() {
        let root = temp_root("optimize");
        let repo = root.join("repo");
        script(&repo, "hetzner/lib/common.sh", PASSING_LIB);
        for agent in ["claude", "aider"] {
            script(
                &repo,
                &format!("hetzner/{}.sh", agent),
                ". \"$MOCK_REPO_ROOT/hetzner/lib/common.sh\"\nprovision\n",
            );
        }
        // Faster for claude, broken for every other agent that sources it.
        let edited = PASSING_LIB.replacen(
            "provision() {\n",
            "provision() {\ncase \"$0\" in *aider*) exit 3;; esac\n",
            1,
        );
        fs::write(root.join("edited.sh"), edited).unwrap();
        let worker = format!(
            "cat >/dev/null; cp {} hetzner/lib/common.sh",
            root.join("edited.sh").display()
        );

        let transport = NoNetwork;
        let p = pipeline(&root, &worker, &transport, Duration::from_secs(600));
        let combos = crate::executor::discover_combinations(&repo).unwrap();
        let mut results = p.executor.run_matrix(&combos);
        assert!(results.iter().all(|r| r.outcome.is_pass()), "{:?}", results);

        let mut history = TimingHistory::default();
        let claude: Combination = "hetzner/claude".parse().unwrap();
        let fast = RunResult {
            combination: claude.clone(),
            outcome: RunOutcome::Pass,
            elapsed_seconds: 0.0001,
            reason: String::new(),
            warnings: Vec::new(),
        };
        history.record(&fast, "2026-01-01");

        let (summary, outcomes) = p.triage_and_optimize(&mut results, &mut history).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].accepted, "{}", outcomes[0].detail);
        assert!(
            summary.notes.iter().any(|n| n.contains("optimize-hetzner: reverted")),
            "{:?}",
            summary.notes
        );
        assert_eq!(
            fs::read_to_string(repo.join("hetzner/lib/common.sh")).unwrap(),
            PASSING_LIB
        );
        assert!(results.iter().all(|r| r.outcome.is_pass()));

        let aider = history.get(&"hetzner/aider".parse().unwrap()).unwrap();
        assert_eq!(aider.latest().unwrap().status, RunOutcome::Fail);
        assert_eq!(history.get(&claude).unwrap().runs.len(), 2);
        let saved = TimingHistory::load(&root.join("results").join(HISTORY_FILE_NAME)).unwrap();
        assert_eq!(saved.get(&claude).unwrap().runs.len(), 2);
        assert!(saved.get(&"hetzner/aider".parse().unwrap()).is_some());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn exhausted_budget_stops_at_phase_boundary() {
        let root = temp_root("budget");
        script(&root.join("repo"), "hetzner/claude.sh", "exit 0\n");
        let transport = NoNetwork;
        let report = pipeline(&root, "true", &transport, Duration::ZERO).run().unwrap();
        assert_eq!(report.stopped_before, Some(Phase::KeyPreflight));
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.phases[0].phase, Phase::Report);
        assert!(!report.success());
        assert!(root.join("results").join(REPORT_FILE_NAME).is_file());
        let _ = fs::remove_dir_all(root);
    }
}
