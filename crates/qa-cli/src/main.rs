use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use qa_core::{providers, QaConfig, NON_INTERACTIVE_ENV};
use qa_gateway::{ErrorScenario, MOCK_BINARY_NAME};
use qa_runner::dispatch::remove_stale_workspaces;
use qa_runner::executor::remove_stale_sandboxes;
use qa_runner::history::HISTORY_FILE_NAME;
use qa_runner::pipeline::REPORT_FILE_NAME;
use qa_runner::{
    discover_combinations, filter_combinations, list_providers, parse_results_txt,
    select_providers, write_results, CredentialResolver, DispatchConfig, Dispatcher, Executor,
    ExecutorConfig, HttpTransport, OutcomeCounts, Pipeline, PipelineConfig, RecordError,
    Recorder, TimingHistory,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qa", version = "0.3.0", about = "Installer-script QA harness")]
struct Cli {
    /// Repository root holding `<provider>/<agent>.sh` scripts.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record live API fixtures: a provider id, `all` or `all-saved`.
    Record {
        target: Option<String>,
        #[arg(long)]
        list: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run installer scripts against the mock gateway.
    MockTest {
        provider: Option<String>,
        agent: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run the full record/test/fix/verify cycle.
    Pipeline {
        /// Include the optimization phase.
        #[arg(long)]
        all: bool,
        /// Remove leftover sandboxes and workspaces before starting.
        #[arg(long)]
        cleanup: bool,
        /// Print the timing history and exit.
        #[arg(long)]
        history: bool,
        /// Print per-provider timings for one agent and exit.
        #[arg(long)]
        compare: Option<String>,
        #[arg(long)]
        update_readme: bool,
        #[arg(long)]
        json: bool,
    },
    /// Apply a results file to the README support matrix.
    Readme {
        results: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

/// Outcome of one command: optional JSON payload plus its pass criterion.
struct CommandOutput {
    payload: Option<Value>,
    ok: bool,
}

impl CommandOutput {
    fn new(payload: Option<Value>, ok: bool) -> Self {
        Self { payload, ok }
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(&cli.repo, cli.command) {
        Ok(output) => {
            if let Some(payload) = output.payload {
                emit_json(&payload);
            }
            if !output.ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
}

/// Credential variables visible to this process, one per registered provider.
fn credential_env() -> BTreeMap<String, String> {
    providers()
        .iter()
        .filter_map(|spec| {
            let value = std::env::var(spec.credential_env).ok()?;
            (!value.trim().is_empty()).then(|| (spec.credential_env.to_string(), value))
        })
        .collect()
}

fn credential_resolver(config: &QaConfig) -> CredentialResolver {
    let interactive = !env_flag(NON_INTERACTIVE_ENV).unwrap_or(false);
    CredentialResolver::new(config.credentials_dir(), credential_env(), interactive)
}

fn load_config(repo: &Path) -> Result<(PathBuf, QaConfig)> {
    let repo_root = repo
        .canonicalize()
        .map_err(|e| anyhow!("repository root {}: {}", repo.display(), e))?;
    let mut config = QaConfig::load(&repo_root)?;
    if let Some(v) = env_flag("MOCK_VALIDATE_BODY") {
        config.executor.validate_body = v;
    }
    if let Some(v) = env_flag("MOCK_TRACK_STATE") {
        config.executor.track_state = v;
    }
    Ok((repo_root, config))
}

fn mock_binary() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("QA_MOCK_BIN") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()?;
    let sibling = exe
        .parent()
        .ok_or_else(|| anyhow!("cannot locate the directory of {}", exe.display()))?
        .join(MOCK_BINARY_NAME);
    if !sibling.is_file() {
        return Err(anyhow!(
            "{} not found next to {} (set QA_MOCK_BIN)",
            MOCK_BINARY_NAME,
            exe.display()
        ));
    }
    Ok(sibling)
}

fn executor_config(config: &QaConfig, repo_root: &Path) -> Result<ExecutorConfig> {
    let mut exec = ExecutorConfig::from_qa_config(config, repo_root, mock_binary()?);
    if let Ok(raw) = std::env::var("MOCK_ERROR_SCENARIO") {
        if !raw.trim().is_empty() {
            exec.error_scenario = Some(raw.parse::<ErrorScenario>()?);
        }
    }
    if let Ok(path) = std::env::var("PATH") {
        exec.base_path = path;
    }
    Ok(exec)
}

fn run_command(repo: &Path, command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Record { target, list, json } => {
            let (_, config) = load_config(repo)?;
            let mut resolver = credential_resolver(&config);
            if list {
                let statuses = list_providers(&resolver);
                if json {
                    return Ok(CommandOutput::new(
                        Some(json!({"ok": true, "command": "record", "providers": statuses})),
                        true,
                    ));
                }
                for s in &statuses {
                    println!(
                        "{:<14} {:<24} {}",
                        s.provider,
                        s.credential_env,
                        s.source.map_or("missing", |src| src.as_str())
                    );
                }
                return Ok(CommandOutput::new(None, true));
            }
            let target = target.ok_or_else(|| anyhow!("record needs a provider, all or all-saved"))?;
            let specs = select_providers(&target, &resolver)?;
            let single = specs.len() == 1 && target != "all" && target != "all-saved";
            let transport = HttpTransport::new()?;
            let mut ok = true;
            let mut rows = Vec::new();
            for spec in specs {
                let result = resolver
                    .resolve(spec)
                    .and_then(|(token, _)| Recorder::new(&transport, &config.fixtures_dir).record(spec, &token));
                let row = match result {
                    Ok(summary) => {
                        ok &= summary.ok();
                        println_unless(json, &format!(
                            "{}: {} recorded, {} unchanged, {} error(s)",
                            spec.id, summary.recorded_count, summary.unchanged_count, summary.error_count
                        ));
                        for e in &summary.errors {
                            println_unless(json, &format!("  {}", e));
                        }
                        json!({"provider": spec.id, "summary": summary})
                    }
                    Err(e @ RecordError::MissingCredentials { .. }) if !single => {
                        warn!(provider = spec.id, "skipped: {}", e);
                        json!({"provider": spec.id, "skipped": e.to_string()})
                    }
                    Err(e) => {
                        ok = false;
                        if e.is_auth() {
                            resolver.invalidate(spec);
                        }
                        println_unless(json, &format!("{}: {}", spec.id, e));
                        json!({"provider": spec.id, "error": e.to_string()})
                    }
                };
                rows.push(row);
            }
            let payload = json.then(|| json!({"ok": ok, "command": "record", "providers": rows}));
            Ok(CommandOutput::new(payload, ok))
        }
        Commands::MockTest {
            provider,
            agent,
            json,
        } => {
            let (repo_root, config) = load_config(repo)?;
            let combos = filter_combinations(
                discover_combinations(&repo_root)?,
                provider.as_deref(),
                agent.as_deref(),
            );
            if combos.is_empty() {
                return Err(anyhow!("no installer scripts match the given filters"));
            }
            let executor = Executor::new(executor_config(&config, &repo_root)?);
            info!(combinations = combos.len(), "running mock tests");
            let results = executor.run_matrix(&combos);
            write_results(&config.results_dir, &results)?;
            let history_path = config.results_dir.join(HISTORY_FILE_NAME);
            let mut history = TimingHistory::load(&history_path)?;
            history.record_all(&results, &Utc::now().format("%Y-%m-%d").to_string());
            history.save(&history_path)?;

            let counts = OutcomeCounts::tally(&results);
            if json {
                return Ok(CommandOutput::new(
                    Some(json!({
                        "ok": counts.all_pass(),
                        "command": "mock-test",
                        "counts": counts,
                        "results": results
                    })),
                    counts.all_pass(),
                ));
            }
            for r in &results {
                if r.outcome.is_pass() {
                    println!("{:<32} {:<8} {:>6.1}s", r.combination, r.outcome, r.elapsed_seconds);
                } else {
                    println!(
                        "{:<32} {:<8} {:>6.1}s  {}",
                        r.combination, r.outcome, r.elapsed_seconds, r.reason
                    );
                }
            }
            println!(
                "{} passed, {} failed, {} timed out",
                counts.pass, counts.fail, counts.timeout
            );
            Ok(CommandOutput::new(None, counts.all_pass()))
        }
        Commands::Pipeline {
            all,
            cleanup,
            history,
            compare,
            update_readme,
            json,
        } => {
            let (repo_root, mut config) = load_config(repo)?;
            let history_path = config.results_dir.join(HISTORY_FILE_NAME);
            if history || compare.is_some() {
                let doc = TimingHistory::load(&history_path)?;
                if json {
                    return Ok(CommandOutput::new(
                        Some(json!({"ok": true, "command": "pipeline", "history": doc})),
                        true,
                    ));
                }
                match compare {
                    Some(agent) => print!("{}", doc.render_compare(&agent)),
                    None => print!("{}", doc.render_table()),
                }
                return Ok(CommandOutput::new(None, true));
            }
            if cleanup {
                let sandboxes = remove_stale_sandboxes(&config.sandbox_parent())?;
                let workspaces = remove_stale_workspaces(&config.workspace_parent())?;
                info!(sandboxes, workspaces, "removed leftovers");
            }
            config.pipeline.optimize |= all;
            config.pipeline.update_readme |= update_readme;

            let executor = Executor::new(executor_config(&config, &repo_root)?);
            let dispatcher = Dispatcher::new(DispatchConfig::from_qa_config(&config, &repo_root));
            let transport = HttpTransport::new()?;
            let report = Pipeline::new(
                PipelineConfig::from_qa_config(&config, &repo_root),
                executor,
                dispatcher,
                credential_resolver(&config),
                &transport,
            )
            .run()?;
            let ok = report.success();
            if json {
                return Ok(CommandOutput::new(
                    Some(json!({"ok": ok, "command": "pipeline", "report": report})),
                    ok,
                ));
            }
            print!("{}", report.render_markdown());
            println!(
                "\nreport: {}",
                config.results_dir.join(REPORT_FILE_NAME).display()
            );
            Ok(CommandOutput::new(None, ok))
        }
        Commands::Readme { results, json } => {
            let (repo_root, _) = load_config(repo)?;
            let text = std::fs::read_to_string(&results)
                .map_err(|e| anyhow!("failed to read {}: {}", results.display(), e))?;
            let parsed = parse_results_txt(&text);
            let update = qa_runner::readme::update_readme_file(&repo_root, &parsed)?;
            if json {
                return Ok(CommandOutput::new(
                    Some(json!({
                        "ok": true,
                        "command": "readme",
                        "results": parsed.len(),
                        "cells_changed": update.cells_changed
                    })),
                    true,
                ));
            }
            println!(
                "{} result(s), {} README cell(s) changed",
                parsed.len(),
                update.cells_changed
            );
            Ok(CommandOutput::new(None, true))
        }
    }
}

fn println_unless(quiet: bool, line: &str) {
    if !quiet {
        println!("{}", line);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Record { json, .. }
        | Commands::MockTest { json, .. }
        | Commands::Pipeline { json, .. }
        | Commands::Readme { json, .. } => *json,
    }
}
