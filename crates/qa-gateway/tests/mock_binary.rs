use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Scratch {
    root: PathBuf,
}

impl Scratch {
    fn new(tag: &str) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "qa_mock_bin_{}_{}_{}",
            tag,
            std::process::id(),
            nanos
        ));
        fs::create_dir_all(root.join("fixtures/hetzner")).unwrap();
        Self { root }
    }

    fn log(&self) -> String {
        fs::read_to_string(self.root.join("mock.log")).unwrap_or_default()
    }

    fn curl(&self, envs: &[(&str, &str)], args: &[&str]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_qa-mock"));
        cmd.arg("curl")
            .args(args)
            .env("MOCK_FIXTURE_DIR", self.root.join("fixtures"))
            .env("MOCK_LOG", self.root.join("mock.log"))
            .env("MOCK_STATE_LOG", self.root.join("state.log"))
            .env("MOCK_CLOUD", "hetzner")
            .env_remove("MOCK_ERROR_SCENARIO")
            .env_remove("MOCK_VALIDATE_BODY")
            .env_remove("MOCK_TRACK_STATE");
        for (k, v) in envs {
            cmd.env(k, v);
        }
        cmd.output().unwrap()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

#[test]
fn unknown_collection_answers_empty_object() {
    let s = Scratch::new("nofixture");
    let out = s.curl(&[], &["-s", "https://api.hetzner.cloud/v1/locations"]);
    assert!(out.status.success());
    assert_eq!(stdout(&out), "{}");
    assert!(s.log().contains("CALL GET https://api.hetzner.cloud/v1/locations"));
    assert!(s.log().contains("NO_FIXTURE:hetzner/locations"));
}

#[test]
fn numeric_id_gets_synthetic_active_resource() {
    let s = Scratch::new("synthetic");
    let out = s.curl(&[], &["-s", "https://api.hetzner.cloud/v1/servers/12345"]);
    assert!(out.status.success());
    let body: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(body["server"]["status"], "running");
    assert!(!s.log().contains("NO_FIXTURE"));
}

#[test]
fn body_validation_logs_missing_field() {
    let s = Scratch::new("validate");
    let out = s.curl(
        &[("MOCK_VALIDATE_BODY", "1")],
        &[
            "-s",
            "-X",
            "POST",
            "-H",
            "Content-Type: application/json",
            "-d",
            r#"{"server_type":"cx22","image":"ubuntu-24.04"}"#,
            "https://api.hetzner.cloud/v1/servers",
        ],
    );
    assert!(out.status.success());
    assert!(!stdout(&out).is_empty());
    assert!(s.log().lines().any(|l| l == "BODY_ERROR:missing_field:name"));
}

#[test]
fn auth_failure_scenario_exits_nonzero_with_status_suffix() {
    let s = Scratch::new("auth");
    let out = s.curl(
        &[("MOCK_ERROR_SCENARIO", "auth_failure")],
        &["-s", "-w", "\\n%{http_code}", "https://api.hetzner.cloud/v1/servers"],
    );
    assert_eq!(out.status.code(), Some(22));
    let text = stdout(&out);
    assert!(text.starts_with(r#"{"error":"Unauthorized"}"#), "{}", text);
    assert!(text.trim_end().ends_with("401"), "{}", text);
    assert!(s.log().contains("ERROR_INJECTED:auth_failure"));
}

#[test]
fn symlinked_fake_command_logs_exec() {
    let s = Scratch::new("symlink");
    let bin = s.root.join("bin");
    fs::create_dir_all(&bin).unwrap();
    let ssh = bin.join("ssh");
    std::os::unix::fs::symlink(Path::new(env!("CARGO_BIN_EXE_qa-mock")), &ssh).unwrap();
    let out = Command::new(&ssh)
        .args(["-o", "StrictHostKeyChecking=no", "root@192.0.2.10", "true"])
        .env("MOCK_LOG", s.root.join("mock.log"))
        .env_remove("MOCK_FAKE_COMMANDS")
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(s.log().contains("EXEC:ssh -o StrictHostKeyChecking=no root@192.0.2.10 true"));
}
