//! Fixture Recorder: snapshots real provider responses into the fixture store.
//!
//! Read-only endpoints are recorded for every provider; providers with a
//! registered live cycle additionally create and delete one real server.

use chrono::Utc;
use qa_core::{atomic_write_json_pretty, provider, providers, ProviderSpec};
use qa_gateway::{Fixture, FixtureStore, WriteStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("no credentials for {provider} (set {env})")]
    MissingCredentials { provider: String, env: String },
    #[error("{provider} rejected the credentials (HTTP {status})")]
    Auth { provider: String, status: u16 },
    #[error("{endpoint}: {detail}")]
    Provider { endpoint: String, detail: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl RecordError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// Network seam so recording logic can run against canned responses.
pub trait ApiTransport: Sync {
    fn get(&self, url: &str, token: &str) -> Result<ApiResponse, RecordError>;
    fn post(&self, url: &str, token: &str, body: &Value) -> Result<ApiResponse, RecordError>;
    fn delete(&self, url: &str, token: &str) -> Result<ApiResponse, RecordError>;
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, RecordError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("qa-recorder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RecordError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn send(&self, req: reqwest::blocking::RequestBuilder) -> Result<ApiResponse, RecordError> {
        let resp = req
            .send()
            .map_err(|e| RecordError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .map_err(|e| RecordError::Transport(e.to_string()))?;
        Ok(ApiResponse { status, body })
    }
}

impl ApiTransport for HttpTransport {
    fn get(&self, url: &str, token: &str) -> Result<ApiResponse, RecordError> {
        self.send(self.client.get(url).bearer_auth(token))
    }

    fn post(&self, url: &str, token: &str, body: &Value) -> Result<ApiResponse, RecordError> {
        self.send(self.client.post(url).bearer_auth(token).json(body))
    }

    fn delete(&self, url: &str, token: &str) -> Result<ApiResponse, RecordError> {
        self.send(self.client.delete(url).bearer_auth(token))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Env,
    Cache,
    Cli,
    Prompt,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::Cache => "cache",
            Self::Cli => "cli",
            Self::Prompt => "prompt",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedCredential {
    api_key: String,
}

/// Resolves provider credentials: environment, then the local cache, then the
/// provider CLI, then an interactive prompt.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    cache_dir: PathBuf,
    /// Snapshot of credential variables taken at the CLI boundary.
    env: BTreeMap<String, String>,
    interactive: bool,
}

impl CredentialResolver {
    pub fn new(cache_dir: PathBuf, env: BTreeMap<String, String>, interactive: bool) -> Self {
        Self {
            cache_dir,
            env,
            interactive,
        }
    }

    pub fn cache_path(&self, spec: &ProviderSpec) -> PathBuf {
        self.cache_dir.join(format!("{}.json", spec.id))
    }

    fn from_env(&self, spec: &ProviderSpec) -> Option<String> {
        self.env
            .get(spec.credential_env)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn from_cache(&self, spec: &ProviderSpec) -> Option<String> {
        let bytes = fs::read(self.cache_path(spec)).ok()?;
        let cached: CachedCredential = serde_json::from_slice(&bytes).ok()?;
        Some(cached.api_key).filter(|k| !k.trim().is_empty())
    }

    fn from_cli(&self, spec: &ProviderSpec) -> Option<String> {
        let argv = spec.cli_token_command?;
        let (program, args) = argv.split_first()?;
        let output = Command::new(program).args(args).output().ok()?;
        if !output.status.success() {
            return None;
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!token.is_empty()).then_some(token)
    }

    /// Credential source that resolves without prompting, if any.
    pub fn peek(&self, spec: &ProviderSpec) -> Option<CredentialSource> {
        self.resolve_saved(spec).map(|(_, source)| source)
    }

    fn resolve_saved(&self, spec: &ProviderSpec) -> Option<(String, CredentialSource)> {
        if let Some(key) = self.from_env(spec) {
            return Some((key, CredentialSource::Env));
        }
        if let Some(key) = self.from_cache(spec) {
            return Some((key, CredentialSource::Cache));
        }
        self.from_cli(spec).map(|key| (key, CredentialSource::Cli))
    }

    pub fn resolve(&self, spec: &ProviderSpec) -> Result<(String, CredentialSource), RecordError> {
        if let Some(found) = self.resolve_saved(spec) {
            return Ok(found);
        }
        let missing = || RecordError::MissingCredentials {
            provider: spec.id.to_string(),
            env: spec.credential_env.to_string(),
        };
        if !self.interactive || !std::io::stdin().is_terminal() {
            return Err(missing());
        }
        eprint!("{} API token ({}): ", spec.display_name, spec.credential_env);
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| RecordError::Transport(e.to_string()))?;
        let key = line.trim().to_string();
        if key.is_empty() {
            return Err(missing());
        }
        self.save(spec, &key)?;
        Ok((key, CredentialSource::Prompt))
    }

    pub fn save(&self, spec: &ProviderSpec, key: &str) -> Result<(), RecordError> {
        let path = self.cache_path(spec);
        atomic_write_json_pretty(&path, &json!({ "api_key": key }))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    /// Forget a stale credential: drop the cached copy and the env snapshot.
    pub fn invalidate(&mut self, spec: &ProviderSpec) {
        let path = self.cache_path(spec);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove cached credential");
            }
        }
        self.env.remove(spec.credential_env);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub provider: String,
    pub recorded_count: usize,
    pub unchanged_count: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
}

impl RecordSummary {
    pub fn ok(&self) -> bool {
        self.error_count == 0
    }
}

pub struct Recorder<'a, T: ApiTransport> {
    transport: &'a T,
    store: FixtureStore,
    /// Overrides every provider's settle delay; tests set zero.
    settle_override: Option<Duration>,
}

fn endpoint_url(spec: &ProviderSpec, path: &str) -> String {
    format!("{}{}", spec.primary_base(), path)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl<'a, T: ApiTransport> Recorder<'a, T> {
    pub fn new(transport: &'a T, fixtures_dir: &Path) -> Self {
        Self {
            transport,
            store: FixtureStore::new(fixtures_dir),
            settle_override: None,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle_override = Some(settle);
        self
    }

    /// Parse and vet one response. Auth rejections are fatal for the provider.
    fn validate(
        &self,
        spec: &ProviderSpec,
        path: &str,
        resp: &ApiResponse,
    ) -> Result<Value, RecordError> {
        if resp.status == 401 || resp.status == 403 {
            return Err(RecordError::Auth {
                provider: spec.id.to_string(),
                status: resp.status,
            });
        }
        let provider_err = |detail: String| RecordError::Provider {
            endpoint: path.to_string(),
            detail,
        };
        if resp.status >= 400 {
            return Err(provider_err(format!(
                "HTTP {}: {}",
                resp.status,
                qa_core::trim_reason(&resp.body, 120)
            )));
        }
        let body: Value = serde_json::from_str(&resp.body)
            .map_err(|e| provider_err(format!("invalid JSON: {}", e)))?;
        if spec.is_error_response(&body) {
            return Err(provider_err(format!(
                "error-shaped response: {}",
                qa_core::trim_reason(&body.to_string(), 120)
            )));
        }
        Ok(body)
    }

    fn persist(
        &self,
        spec: &ProviderSpec,
        name: &str,
        path: &str,
        body: Value,
        summary: &mut RecordSummary,
        written: &mut Vec<Fixture>,
    ) -> Result<(), RecordError> {
        let fixture = Fixture {
            provider: spec.id.to_string(),
            logical_name: name.to_string(),
            endpoint_template: path.to_string(),
            body,
            recorded_at: now_rfc3339(),
        };
        match self.store.write_fixture(&fixture)? {
            WriteStatus::Written => summary.recorded_count += 1,
            WriteStatus::Unchanged => summary.unchanged_count += 1,
        }
        written.push(fixture);
        Ok(())
    }

    fn note_error(summary: &mut RecordSummary, err: RecordError) -> Result<(), RecordError> {
        if err.is_auth() {
            return Err(err);
        }
        warn!(provider = %summary.provider, error = %err, "fixture not recorded");
        summary.error_count += 1;
        summary.errors.push(err.to_string());
        Ok(())
    }

    /// Record every read endpoint, then the live cycle, then the manifest.
    /// Per-endpoint failures are counted; an auth rejection aborts the provider.
    pub fn record(&self, spec: &ProviderSpec, token: &str) -> Result<RecordSummary, RecordError> {
        let mut summary = RecordSummary {
            provider: spec.id.to_string(),
            ..RecordSummary::default()
        };
        let mut written = Vec::new();

        for (name, path) in spec.read_endpoints {
            let outcome = self
                .transport
                .get(&endpoint_url(spec, path), token)
                .and_then(|resp| self.validate(spec, path, &resp));
            match outcome {
                Ok(body) => self.persist(spec, name, path, body, &mut summary, &mut written)?,
                Err(e) => Self::note_error(&mut summary, e)?,
            }
        }

        if let Err(e) = self.live_cycle(spec, token, &mut summary, &mut written) {
            Self::note_error(&mut summary, e)?;
        }

        if !written.is_empty() {
            self.store.update_manifest(spec.id, &written)?;
        }
        info!(
            provider = spec.id,
            recorded = summary.recorded_count,
            unchanged = summary.unchanged_count,
            errors = summary.error_count,
            "recording finished"
        );
        Ok(summary)
    }

    fn live_cycle(
        &self,
        spec: &ProviderSpec,
        token: &str,
        summary: &mut RecordSummary,
        written: &mut Vec<Fixture>,
    ) -> Result<(), RecordError> {
        let Some(cycle) = &spec.live_cycle else {
            return Ok(());
        };
        let name = format!("qa-record-{}-{}", spec.id, Utc::now().timestamp());
        let body = (cycle.create_body)(&name);
        let resp = self
            .transport
            .post(&endpoint_url(spec, cycle.create_path), token, &body)?;
        let created = self.validate(spec, cycle.create_path, &resp)?;
        let id = match created.pointer(cycle.id_pointer) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(RecordError::Provider {
                    endpoint: cycle.create_path.to_string(),
                    detail: format!("no resource id at {}", cycle.id_pointer),
                })
            }
        };
        // The server exists now; delete it even when the fixture cannot be stored.
        let persisted = self.persist(spec, "create_server", cycle.create_path, created, summary, written);

        let settle = self.settle_override.unwrap_or(cycle.settle);
        debug!(provider = spec.id, id = %id, settle_s = settle.as_secs(), "waiting before delete");
        std::thread::sleep(settle);

        let delete_path = (cycle.delete_path)(&id);
        let resp = self
            .transport
            .delete(&endpoint_url(spec, &delete_path), token)?;
        persisted?;
        let deleted = if resp.body.trim().is_empty() && resp.status < 300 {
            json!({"status": 204, "message": "No Content"})
        } else {
            self.validate(spec, &delete_path, &resp)?
        };
        let template = (cycle.delete_path)("{id}");
        self.persist(spec, "delete_server", &template, deleted, summary, written)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCredentialStatus {
    pub provider: String,
    pub credential_env: String,
    pub source: Option<CredentialSource>,
}

/// Every registered provider with the credential source that would be used.
pub fn list_providers(resolver: &CredentialResolver) -> Vec<ProviderCredentialStatus> {
    providers()
        .iter()
        .map(|spec| ProviderCredentialStatus {
            provider: spec.id.to_string(),
            credential_env: spec.credential_env.to_string(),
            source: resolver.peek(spec),
        })
        .collect()
}

/// Which providers a `record` target names. `all-saved` keeps only providers
/// whose credentials resolve without a prompt.
pub fn select_providers(
    target: &str,
    resolver: &CredentialResolver,
) -> anyhow::Result<Vec<&'static ProviderSpec>> {
    match target {
        "all" => Ok(providers().iter().collect()),
        "all-saved" => Ok(providers()
            .iter()
            .filter(|spec| resolver.peek(spec).is_some())
            .collect()),
        id => provider(id)
            .map(|spec| vec![spec])
            .ok_or_else(|| anyhow::anyhow!("unknown provider '{}'", id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Canned transport keyed by `METHOD url`.
    struct FakeTransport {
        responses: BTreeMap<String, ApiResponse>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new(entries: &[(&str, u16, &str)]) -> Self {
            Self {
                responses: entries
                    .iter()
                    .map(|(k, status, body)| {
                        (
                            k.to_string(),
                            ApiResponse {
                                status: *status,
                                body: body.to_string(),
                            },
                        )
                    })
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn answer(&self, key: String) -> Result<ApiResponse, RecordError> {
            self.calls.lock().unwrap().push(key.clone());
            self.responses
                .get(&key)
                .cloned()
                .ok_or_else(|| RecordError::Transport(format!("unexpected call {}", key)))
        }
    }

    impl ApiTransport for FakeTransport {
        fn get(&self, url: &str, _token: &str) -> Result<ApiResponse, RecordError> {
            self.answer(format!("GET {}", url))
        }
        fn post(&self, url: &str, _token: &str, _body: &Value) -> Result<ApiResponse, RecordError> {
            self.answer(format!("POST {}", url))
        }
        fn delete(&self, url: &str, _token: &str) -> Result<ApiResponse, RecordError> {
            self.answer(format!("DELETE {}", url))
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "qa_recorder_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    const H: &str = "https://api.hetzner.cloud/v1";

    fn hetzner_transport(locations: (u16, &str)) -> FakeTransport {
        FakeTransport::new(&[
            (&format!("GET {}/ssh_keys", H), 200, r#"{"ssh_keys":[]}"#),
            (&format!("GET {}/server_types", H), 200, r#"{"server_types":[{"name":"cx22"}]}"#),
            (&format!("GET {}/locations", H), locations.0, locations.1),
            (&format!("GET {}/servers", H), 200, r#"{"servers":[]}"#),
            (&format!("POST {}/servers", H), 201, r#"{"server":{"id":77,"status":"initializing"}}"#),
            (&format!("DELETE {}/servers/77", H), 204, ""),
        ])
    }

    #[test]
    fn records_endpoints_and_live_cycle_then_manifest() {
        let dir = temp_dir("full");
        let transport = hetzner_transport((200, r#"{"locations":[]}"#));
        let recorder = Recorder::new(&transport, &dir).with_settle(Duration::ZERO);
        let spec = provider("hetzner").unwrap();
        let summary = recorder.record(spec, "tok").unwrap();
        assert!(summary.ok(), "{:?}", summary.errors);
        assert_eq!(summary.recorded_count, 6);

        let store = FixtureStore::new(&dir);
        assert_eq!(
            store.load("hetzner", "delete_server"),
            Some(json!({"status": 204, "message": "No Content"}))
        );
        assert_eq!(store.load("hetzner", "create_server").unwrap()["server"]["id"], 77);
        let manifest = store.load_manifest("hetzner").unwrap();
        assert_eq!(manifest.entries.len(), 6);
        assert_eq!(manifest.entries["delete_server"].endpoint, "/servers/{id}");

        let again = recorder.record(spec, "tok").unwrap();
        assert_eq!(again.recorded_count, 0);
        assert_eq!(again.unchanged_count, 6);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn error_shaped_endpoint_is_counted_and_not_written() {
        let dir = temp_dir("drift");
        let transport = hetzner_transport((200, r#"{"error":{"code":"not_found","message":"gone"}}"#));
        let recorder = Recorder::new(&transport, &dir).with_settle(Duration::ZERO);
        let summary = recorder.record(provider("hetzner").unwrap(), "tok").unwrap();
        assert_eq!(summary.error_count, 1);
        assert!(summary.errors[0].contains("/locations"));
        let store = FixtureStore::new(&dir);
        assert!(!store.contains("hetzner", "locations"));
        assert!(store.contains("hetzner", "servers"));
        assert!(!store.load_manifest("hetzner").unwrap().entries.contains_key("locations"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn created_server_is_deleted_when_its_fixture_cannot_be_stored() {
        let dir = temp_dir("leak");
        // A directory where the create fixture should go makes that one write fail.
        fs::create_dir_all(dir.join("hetzner/create_server.json/blocker")).unwrap();
        let transport = hetzner_transport((200, r#"{"locations":[]}"#));
        let recorder = Recorder::new(&transport, &dir).with_settle(Duration::ZERO);
        let summary = recorder.record(provider("hetzner").unwrap(), "tok").unwrap();

        let calls = transport.calls.lock().unwrap().clone();
        assert!(calls.contains(&format!("DELETE {}/servers/77", H)), "{:?}", calls);
        assert_eq!(summary.error_count, 1, "{:?}", summary.errors);
        assert_eq!(summary.recorded_count, 4);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn auth_rejection_aborts_the_provider() {
        let dir = temp_dir("auth");
        let transport = FakeTransport::new(&[(
            &format!("GET {}/ssh_keys", H),
            401,
            r#"{"error":{"code":"unauthorized"}}"#,
        )]);
        let recorder = Recorder::new(&transport, &dir);
        let err = recorder.record(provider("hetzner").unwrap(), "bad").unwrap_err();
        assert!(err.is_auth());
        assert_eq!(transport.calls.lock().unwrap().len(), 1);
        assert!(!FixtureStore::new(&dir).manifest_path("hetzner").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn credentials_resolve_env_before_cache_and_invalidate() {
        let dir = temp_dir("creds");
        let spec = provider("vultr").unwrap();
        let mut env = BTreeMap::new();
        env.insert("VULTR_API_KEY".to_string(), "from-env".to_string());
        let mut resolver = CredentialResolver::new(dir.clone(), env, false);
        resolver.save(spec, "from-cache").unwrap();

        assert_eq!(
            resolver.resolve(spec).unwrap(),
            ("from-env".to_string(), CredentialSource::Env)
        );
        resolver.invalidate(spec);
        assert!(matches!(
            resolver.resolve(spec),
            Err(RecordError::MissingCredentials { .. })
        ));

        let resolver = CredentialResolver::new(dir.clone(), BTreeMap::new(), false);
        resolver.save(spec, "from-cache").unwrap();
        assert_eq!(resolver.peek(spec), Some(CredentialSource::Cache));
        let saved = select_providers("all-saved", &resolver).unwrap();
        assert!(saved.iter().any(|p| p.id == "vultr"));
        assert!(select_providers("nope", &resolver).is_err());
        assert_eq!(list_providers(&resolver).len(), providers().len());
        let _ = fs::remove_dir_all(dir);
    }
}
