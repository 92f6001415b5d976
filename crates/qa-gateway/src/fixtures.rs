//! On-disk fixture store: `<root>/<provider>/<name>.json` plus a per-provider
//! `_metadata.json` manifest mapping fixture name to endpoint and record time.

use anyhow::{anyhow, Result};
use qa_core::{atomic_write_bytes, ensure_dir, pretty_json_bytes, sha256_bytes};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MANIFEST_FILE_NAME: &str = "_metadata.json";

#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub provider: String,
    pub logical_name: String,
    pub endpoint_template: String,
    pub body: Value,
    pub recorded_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub endpoint: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixtureManifest {
    pub entries: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct FixtureStore {
    root: PathBuf,
}

impl FixtureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn provider_dir(&self, provider: &str) -> PathBuf {
        self.root.join(provider)
    }

    pub fn fixture_path(&self, provider: &str, name: &str) -> PathBuf {
        self.provider_dir(provider).join(format!("{}.json", name))
    }

    pub fn manifest_path(&self, provider: &str) -> PathBuf {
        self.provider_dir(provider).join(MANIFEST_FILE_NAME)
    }

    /// Fixture body, or `None` when absent or unreadable.
    pub fn load(&self, provider: &str, name: &str) -> Option<Value> {
        let path = self.fixture_path(provider, name);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "fixture is not valid JSON");
                None
            }
        }
    }

    pub fn contains(&self, provider: &str, name: &str) -> bool {
        self.fixture_path(provider, name).is_file()
    }

    pub fn load_manifest(&self, provider: &str) -> Result<FixtureManifest> {
        let path = self.manifest_path(provider);
        if !path.exists() {
            return Ok(FixtureManifest::default());
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| anyhow!("invalid manifest {}: {}", path.display(), e))
    }

    /// Write one fixture body. Identical content is left untouched on disk.
    pub fn write_fixture(&self, fixture: &Fixture) -> Result<WriteStatus> {
        let path = self.fixture_path(&fixture.provider, &fixture.logical_name);
        let bytes = pretty_json_bytes(&fixture.body)?;
        if let Ok(existing) = fs::read(&path) {
            if sha256_bytes(&existing) == sha256_bytes(&bytes) {
                debug!(path = %path.display(), "fixture unchanged");
                return Ok(WriteStatus::Unchanged);
            }
        }
        atomic_write_bytes(&path, &bytes)?;
        Ok(WriteStatus::Written)
    }

    /// Merge freshly recorded entries into the existing manifest and write it.
    pub fn update_manifest(&self, provider: &str, fixtures: &[Fixture]) -> Result<FixtureManifest> {
        let mut manifest = self.load_manifest(provider)?;
        for fixture in fixtures {
            manifest.entries.insert(
                fixture.logical_name.clone(),
                ManifestEntry {
                    endpoint: fixture.endpoint_template.clone(),
                    recorded_at: fixture.recorded_at.clone(),
                },
            );
        }
        ensure_dir(&self.provider_dir(provider))?;
        let value = serde_json::to_value(&manifest)?;
        atomic_write_bytes(&self.manifest_path(provider), &pretty_json_bytes(&value)?)?;
        Ok(manifest)
    }

    /// Provider directories currently present in the store.
    pub fn providers(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut out: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn temp_store(tag: &str) -> FixtureStore {
        let root = std::env::temp_dir().join(format!(
            "qa_fixtures_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        FixtureStore::new(root)
    }

    fn fixture(name: &str, body: Value, at: &str) -> Fixture {
        Fixture {
            provider: "hetzner".into(),
            logical_name: name.into(),
            endpoint_template: format!("/{}", name),
            body,
            recorded_at: at.into(),
        }
    }

    #[test]
    fn rewriting_identical_content_only_moves_manifest_timestamp() {
        let store = temp_store("idem");
        let first = fixture("servers", json!({"servers": [], "meta": {"page": 1}}), "2026-01-01T00:00:00Z");
        assert_eq!(store.write_fixture(&first).unwrap(), WriteStatus::Written);
        store.update_manifest("hetzner", &[first.clone()]).unwrap();
        let body_before = fs::read(store.fixture_path("hetzner", "servers")).unwrap();

        let second = fixture("servers", json!({"meta": {"page": 1}, "servers": []}), "2026-02-01T00:00:00Z");
        assert_eq!(store.write_fixture(&second).unwrap(), WriteStatus::Unchanged);
        let manifest = store.update_manifest("hetzner", &[second]).unwrap();

        let body_after = fs::read(store.fixture_path("hetzner", "servers")).unwrap();
        assert_eq!(body_before, body_after);
        let entry = &manifest.entries["servers"];
        assert_eq!(entry.endpoint, "/servers");
        assert_eq!(entry.recorded_at, "2026-02-01T00:00:00Z");
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn manifest_merge_keeps_entries_not_rerecorded() {
        let store = temp_store("merge");
        let a = fixture("servers", json!({"servers": []}), "t1");
        let b = fixture("locations", json!({"locations": []}), "t1");
        store.write_fixture(&a).unwrap();
        store.write_fixture(&b).unwrap();
        store.update_manifest("hetzner", &[a, b]).unwrap();
        let a2 = fixture("servers", json!({"servers": [{"id": 1}]}), "t2");
        store.write_fixture(&a2).unwrap();
        let manifest = store.update_manifest("hetzner", &[a2]).unwrap();
        assert_eq!(manifest.entries["locations"].recorded_at, "t1");
        assert_eq!(manifest.entries["servers"].recorded_at, "t2");
        assert_eq!(store.load("hetzner", "servers"), Some(json!({"servers": [{"id": 1}]})));
        assert_eq!(store.providers(), vec!["hetzner".to_string()]);
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn unreadable_fixture_loads_as_none() {
        let store = temp_store("bad");
        ensure_dir(&store.provider_dir("vultr")).unwrap();
        fs::write(store.fixture_path("vultr", "plans"), "{not json").unwrap();
        assert!(store.contains("vultr", "plans"));
        assert_eq!(store.load("vultr", "plans"), None);
        assert_eq!(store.load("vultr", "absent"), None);
        let _ = fs::remove_dir_all(store.root());
    }
}
