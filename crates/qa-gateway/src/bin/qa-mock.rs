//! Multiplexed sandbox executable.
//!
//! Invoked as `curl` it answers from the mock gateway; invoked under any other
//! name it plays back that fake command. `qa-mock curl ...` and
//! `qa-mock exec NAME ...` do the same without a symlink.

use qa_gateway::{curl, fake, CallLog, FakeCommandRegistry, Gateway, GatewayConfig, REGISTRY_ENV};
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("QA_MOCK_TRACE").unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn emit(stdout: &str, stderr: &str) {
    let _ = std::io::stdout().write_all(stdout.as_bytes());
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().write_all(stderr.as_bytes());
}

fn run_curl(args: &[String]) -> ExitCode {
    let config = GatewayConfig::from_lookup(|k| std::env::var(k).ok());
    let gateway = Gateway::new(config);
    let out = curl::run(&gateway, args);
    emit(&out.stdout, &out.stderr);
    exit_code(out.exit_code)
}

fn run_fake(name: &str, args: &[String]) -> ExitCode {
    let config = GatewayConfig::from_lookup(|k| std::env::var(k).ok());
    let log = CallLog::new(config.log_path);
    let registry = match std::env::var_os(REGISTRY_ENV) {
        Some(path) => match FakeCommandRegistry::load(Path::new(&path)) {
            Ok(registry) => registry,
            Err(e) => {
                tracing::warn!(error = %e, "falling back to default fake commands");
                FakeCommandRegistry::defaults()
            }
        },
        None => FakeCommandRegistry::defaults(),
    };
    let out = fake::run(&registry, &log, name, args);
    emit(&out.stdout, "");
    exit_code(out.exit_code)
}

/// Arguments as text; bytes that are not UTF-8 become U+FFFD instead of aborting.
fn lossy_args(args: impl IntoIterator<Item = OsString>) -> Vec<String> {
    args.into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect()
}

fn invoked_name(argv0: &str) -> String {
    Path::new(argv0)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv0.to_string())
}

fn main() -> ExitCode {
    init_logging();
    let argv = lossy_args(std::env::args_os());
    let invoked_as = argv.first().map(|a| invoked_name(a)).unwrap_or_default();
    let rest = argv.get(1..).unwrap_or(&[]);

    if invoked_as == "curl" {
        return run_curl(rest);
    }
    if invoked_as != qa_gateway::MOCK_BINARY_NAME {
        return run_fake(&invoked_as, rest);
    }
    match rest.split_first() {
        Some((cmd, tail)) if cmd == "curl" => run_curl(tail),
        Some((cmd, tail)) if cmd == "exec" => match tail.split_first() {
            Some((name, args)) => run_fake(name, args),
            None => {
                eprintln!("usage: qa-mock exec NAME [ARGS...]");
                ExitCode::from(2)
            }
        },
        _ => {
            eprintln!("usage: qa-mock curl [CURL ARGS...] | qa-mock exec NAME [ARGS...]");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStringExt;

    #[test]
    fn non_utf8_arguments_are_kept_lossily() {
        let argv = lossy_args(vec![
            OsString::from("/tmp/sandbox/bin/curl"),
            OsString::from("-d"),
            OsString::from_vec(vec![b'n', b'a', 0xff, b'e']),
        ]);
        assert_eq!(argv[2], "na\u{fffd}e");
        assert_eq!(invoked_name(&argv[0]), "curl");
        assert_eq!(invoked_name("ssh"), "ssh");
    }
}
