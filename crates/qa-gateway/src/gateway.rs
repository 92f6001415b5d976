//! Fixture-backed stand-in for every provider REST API an installer talks to.
//!
//! `Gateway::handle` never fails: a request it cannot resolve degrades to an
//! empty or synthetic JSON object plus a log line, so gaps surface as
//! assertion discrepancies rather than crashes inside the installer.

use crate::fixtures::FixtureStore;
use crate::log::{CallLog, LogEntry, StateEvent, StateKind, StateLedger};
use qa_core::{provider, provider_for_url, ProviderSpec, MOCK_SHARED_SECRET};
use serde_json::{json, Value};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

/// Hosts whose downloads are installer bootstraps; they are answered with a no-op script.
const INSTALLER_HOSTS: &[&str] = &[
    "claude.ai",
    "bun.sh",
    "deno.land",
    "astral.sh",
    "get.docker.com",
    "sh.rustup.rs",
    "deb.nodesource.com",
    "opencode.ai",
    "install.goose.ai",
    "raw.githubusercontent.com",
    "github.com",
    "objects.githubusercontent.com",
    "registry.npmjs.org",
];

const AUTH_EXCHANGE_URLS: &[&str] = &["https://openrouter.ai/api/v1/auth/keys"];

pub const NOOP_INSTALLER_BODY: &str = "#!/bin/sh\n# qa mock installer\nexit 0\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScenario {
    AuthFailure,
    RateLimit,
    ServerError,
    CreateFailure,
}

impl ErrorScenario {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthFailure => "auth_failure",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::CreateFailure => "create_failure",
        }
    }

    pub fn status(self) -> u16 {
        match self {
            Self::AuthFailure => 401,
            Self::RateLimit => 429,
            Self::ServerError => 500,
            Self::CreateFailure => 422,
        }
    }

    pub fn body(self) -> Value {
        let message = match self {
            Self::AuthFailure => "Unauthorized",
            Self::RateLimit => "Rate limit exceeded",
            Self::ServerError => "Internal server error",
            Self::CreateFailure => "Unprocessable entity",
        };
        json!({ "error": message })
    }
}

impl fmt::Display for ErrorScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorScenario {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw.trim() {
            "auth_failure" => Ok(Self::AuthFailure),
            "rate_limit" => Ok(Self::RateLimit),
            "server_error" => Ok(Self::ServerError),
            "create_failure" => Ok(Self::CreateFailure),
            other => Err(anyhow::anyhow!("unknown error scenario: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub fixture_dir: PathBuf,
    pub log_path: Option<PathBuf>,
    pub state_log_path: Option<PathBuf>,
    /// Provider assumed when a URL matches no registered API base.
    pub default_provider: Option<String>,
    pub error_scenario: Option<ErrorScenario>,
    pub validate_body: bool,
    pub track_state: bool,
    pub repo_root: Option<PathBuf>,
    pub repo_slug: Option<String>,
}

fn flag_enabled(raw: Option<String>) -> bool {
    matches!(
        raw.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

impl GatewayConfig {
    /// Build from a variable lookup; `qa-mock` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            fixture_dir: non_empty("MOCK_FIXTURE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("test/fixtures")),
            log_path: non_empty("MOCK_LOG").map(PathBuf::from),
            state_log_path: non_empty("MOCK_STATE_LOG").map(PathBuf::from),
            default_provider: non_empty("MOCK_CLOUD"),
            error_scenario: non_empty("MOCK_ERROR_SCENARIO").and_then(|s| s.parse().ok()),
            validate_body: flag_enabled(lookup("MOCK_VALIDATE_BODY")),
            track_state: flag_enabled(lookup("MOCK_TRACK_STATE")),
            repo_root: non_empty("MOCK_REPO_ROOT").map(PathBuf::from),
            repo_slug: non_empty("MOCK_REPO_SLUG"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub body: Option<String>,
}

impl Request {
    pub fn new(method: &str, url: &str, body: Option<&str>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            body: body.map(|b| b.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
    /// Set for error-scenario responses; the client exits non-zero for these.
    pub injected: bool,
}

impl Response {
    fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            body: value.to_string(),
            injected: false,
        }
    }

    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            injected: false,
        }
    }
}

/// Strip query/fragment and the provider API base (or a generic host + version
/// prefix), yielding a path like `/servers/123`.
pub fn canonical_endpoint(url: &str, provider: Option<&ProviderSpec>) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = match provider.and_then(|p| p.strip_base(without_query)) {
        Some(rest) => rest.to_string(),
        None => generic_path(without_query),
    };
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn generic_path(url: &str) -> String {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = match after_scheme.find('/') {
        Some(idx) => &after_scheme[idx..],
        None => "/",
    };
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first().is_some_and(|s| is_version_segment(s)) {
        segments.remove(0);
    }
    format!("/{}", segments.join("/"))
}

fn is_version_segment(segment: &str) -> bool {
    let Some(rest) = segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Numeric ids, or hex/uuid-like ids of at least 8 chars containing a digit.
pub fn is_id_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    segment.len() >= 8
        && segment.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
        && segment.chars().any(|c| c.is_ascii_digit())
}

/// `/account/ssh-keys` becomes `account_ssh_keys`.
pub fn flatten_endpoint(endpoint: &str) -> String {
    let flat = endpoint
        .trim_matches('/')
        .replace(['/', '-', '.'], "_");
    if flat.is_empty() {
        "root".to_string()
    } else {
        flat
    }
}

/// Endpoint with id-like segments removed, or `None` when there were none.
pub fn strip_id_segments(endpoint: &str) -> Option<String> {
    let segments: Vec<&str> = endpoint.split('/').filter(|s| !s.is_empty()).collect();
    let kept: Vec<&str> = segments.iter().copied().filter(|s| !is_id_segment(s)).collect();
    if kept.len() == segments.len() {
        return None;
    }
    Some(format!("/{}", kept.join("/")))
}

fn looks_like_ssh_key_path(endpoint: &str) -> bool {
    let lower = endpoint.to_ascii_lowercase();
    lower.contains("ssh") && lower.contains("key")
}

fn url_host(url: &str) -> &str {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split('@')
        .last()
        .unwrap_or("")
}

pub struct Gateway {
    config: GatewayConfig,
    fixtures: FixtureStore,
    log: CallLog,
    ledger: StateLedger,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let fixtures = FixtureStore::new(config.fixture_dir.clone());
        let log = CallLog::new(config.log_path.clone());
        let ledger = StateLedger::new(config.state_log_path.clone());
        Self {
            config,
            fixtures,
            log,
            ledger,
        }
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }

    pub fn handle(&self, req: &Request) -> Response {
        self.log.append(&LogEntry::Call {
            method: req.method.clone(),
            url: req.url.clone(),
        });
        if let Some(body) = req.body.as_deref().filter(|b| !b.is_empty()) {
            self.log.append(&LogEntry::Body(body.to_string()));
        }

        let bootstrap = self.is_bootstrap_url(&req.url);
        let spec = self.provider_for(&req.url);

        if let Some(scenario) = self.config.error_scenario {
            if !bootstrap && self.scenario_applies(scenario, req, spec) {
                self.log.append(&LogEntry::ErrorInjected {
                    scenario: scenario.to_string(),
                    url: req.url.clone(),
                });
                let mut resp = Response::json(scenario.status(), &scenario.body());
                resp.injected = true;
                return resp;
            }
        }

        if let Some(resp) = self.special_url(req) {
            return resp;
        }

        let endpoint = canonical_endpoint(&req.url, spec);
        debug!(method = %req.method, endpoint = %endpoint, "mock request");

        if req.method == "POST" && self.config.validate_body {
            self.validate_body(req, spec, &endpoint);
        }
        if self.config.track_state {
            self.track_state(req, spec, &endpoint);
        }

        match req.method.as_str() {
            "GET" | "HEAD" => self.resolve_get(spec, &endpoint),
            "POST" => self.resolve_post(spec, &endpoint),
            "DELETE" => self.resolve_fixture_or(spec, "delete_server", 200, json!({})),
            _ => self.resolve_get(spec, &endpoint),
        }
    }

    fn provider_for(&self, url: &str) -> Option<&'static ProviderSpec> {
        provider_for_url(url).or_else(|| {
            self.config
                .default_provider
                .as_deref()
                .and_then(provider)
        })
    }

    fn provider_name(&self, spec: Option<&ProviderSpec>) -> String {
        spec.map(|p| p.id.to_string())
            .or_else(|| self.config.default_provider.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn scenario_applies(
        &self,
        scenario: ErrorScenario,
        req: &Request,
        spec: Option<&ProviderSpec>,
    ) -> bool {
        match scenario {
            ErrorScenario::CreateFailure => {
                req.method == "POST"
                    && spec.is_some_and(|p| canonical_endpoint(&req.url, Some(p)) == p.create_path)
            }
            _ => true,
        }
    }

    fn is_bootstrap_url(&self, url: &str) -> bool {
        self.repo_source_path(url).is_some()
            || AUTH_EXCHANGE_URLS.iter().any(|u| url.starts_with(u))
            || self.is_installer_download(url)
    }

    fn is_installer_download(&self, url: &str) -> bool {
        if provider_for_url(url).is_some() {
            return false;
        }
        let host = url_host(url);
        let path = url.split(['?', '#']).next().unwrap_or(url);
        INSTALLER_HOSTS.iter().any(|h| host == *h || host.ends_with(&format!(".{}", h)))
            || path.ends_with("/install.sh")
            || path.ends_with("/install")
    }

    /// Relative repo path for `https://raw.githubusercontent.com/<slug>/<ref>/<path>`.
    fn repo_source_path(&self, url: &str) -> Option<String> {
        let slug = self.config.repo_slug.as_deref()?;
        let prefix = format!("https://raw.githubusercontent.com/{}/", slug);
        let rest = url.strip_prefix(&prefix)?;
        let (_git_ref, path) = rest.split_once('/')?;
        let path = path.split(['?', '#']).next().unwrap_or(path);
        if path.is_empty() || path.split('/').any(|s| s == "..") {
            return None;
        }
        Some(path.to_string())
    }

    fn special_url(&self, req: &Request) -> Option<Response> {
        if let (Some(rel), Some(root)) = (self.repo_source_path(&req.url), &self.config.repo_root) {
            return Some(match fs::read_to_string(root.join(rel)) {
                Ok(content) => Response::text(200, content),
                Err(_) => Response::text(404, "404: Not Found"),
            });
        }
        if AUTH_EXCHANGE_URLS.iter().any(|u| req.url.starts_with(u)) {
            return Some(Response::json(
                200,
                &json!({"key": MOCK_SHARED_SECRET, "user_id": "qa-mock-user"}),
            ));
        }
        if self.is_installer_download(&req.url) {
            return Some(Response::text(200, NOOP_INSTALLER_BODY));
        }
        None
    }

    fn validate_body(&self, req: &Request, spec: Option<&ProviderSpec>, endpoint: &str) {
        let required = spec.map(|p| p.required_fields(endpoint)).unwrap_or(&[]);
        let body = req.body.as_deref().map(str::trim).unwrap_or("");
        if body.is_empty() {
            if !required.is_empty() {
                self.log.append(&LogEntry::BodyError("missing_body".to_string()));
            }
            return;
        }
        let parsed: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => {
                self.log.append(&LogEntry::BodyError("invalid_json".to_string()));
                return;
            }
        };
        for field in required {
            if parsed.get(field).is_none() {
                self.log
                    .append(&LogEntry::BodyError(format!("missing_field:{}", field)));
            }
        }
    }

    fn track_state(&self, req: &Request, spec: Option<&ProviderSpec>, endpoint: &str) {
        let kind = match req.method.as_str() {
            "POST" if spec.is_some_and(|p| p.is_resource_collection(endpoint)) => StateKind::Created,
            "DELETE" => StateKind::Deleted,
            _ => return,
        };
        self.ledger.record(&StateEvent {
            kind,
            provider: self.provider_name(spec),
            endpoint: endpoint.to_string(),
        });
    }

    fn resolve_get(&self, spec: Option<&ProviderSpec>, endpoint: &str) -> Response {
        let provider_name = self.provider_name(spec);
        let name = flatten_endpoint(endpoint);
        if let Some(body) = self.fixtures.load(&provider_name, &name) {
            return Response::json(200, &body);
        }

        let last = endpoint.rsplit('/').next().unwrap_or("");
        if is_id_segment(last) {
            let body = match spec {
                Some(p) => (p.synthetic_active)(last),
                None => json!({"id": last, "status": "active"}),
            };
            return Response::json(200, &body);
        }

        if let Some(stripped) = strip_id_segments(endpoint) {
            let stripped_name = flatten_endpoint(&stripped);
            if let Some(body) = self.fixtures.load(&provider_name, &stripped_name) {
                return Response::json(200, &body);
            }
        }

        self.log.append(&LogEntry::NoFixture {
            provider: provider_name,
            name,
        });
        Response::json(200, &json!({}))
    }

    fn resolve_post(&self, spec: Option<&ProviderSpec>, endpoint: &str) -> Response {
        let is_key_path = spec.is_some_and(|p| p.ssh_key_path == endpoint)
            || looks_like_ssh_key_path(endpoint);
        if is_key_path {
            return Response::json(
                201,
                &json!({"ssh_key": {"id": 1001, "name": "qa-key",
                    "fingerprint": "b7:2f:30:a0:2f:6c:58:6c:21:04:58:61:ba:06:3b:2c"}}),
            );
        }
        let synthetic = match spec {
            Some(p) => (p.synthetic_create)(),
            None => json!({"id": "qa-mock-1", "status": "created"}),
        };
        self.resolve_fixture_or(spec, "create_server", 201, synthetic)
    }

    fn resolve_fixture_or(
        &self,
        spec: Option<&ProviderSpec>,
        name: &str,
        status: u16,
        fallback: Value,
    ) -> Response {
        let provider_name = self.provider_name(spec);
        match self.fixtures.load(&provider_name, name) {
            Some(body) => Response::json(status, &body),
            None => Response::json(status, &fallback),
        }
    }
}
