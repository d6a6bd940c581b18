//! Collaborators of the audit engine.
//!
//! The engine reads data files through a [`DataSource`], facts through a
//! [`FactProvider`], stores lookup logs in a [`KeyUsageStore`] and publishes
//! estate reports to a [`ReconciliationResultStore`]. This module defines the
//! traits plus the local and in-memory implementations; SQLite-backed stores
//! live in [`crate::db`].

use crate::error::{AuditError, AuditResult};
use crate::flatten::Value;
use crate::hierarchy::DATA_EXTENSIONS;
use crate::retention::LoggedKeyUsage;
use crate::service::EstateReport;
use crate::substitute::FactMap;
use arc_swap::ArcSwapOption;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Read access to hierarchy data files.
pub trait DataSource: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    /// Parsed content of `path`; `None` when the file does not exist.
    fn read_structured(&self, path: &str) -> AuditResult<Option<Value>>;

    /// Every data file below `dir`, in the same path form the hierarchy
    /// resolver produces for that directory.
    fn list_data_files(&self, dir: &str) -> AuditResult<Vec<String>>;
}

/// Facts per identity. An empty map means the identity is unknown.
pub trait FactProvider: Send + Sync {
    fn facts_for(&self, identity: &str) -> AuditResult<FactMap>;
}

/// Persistent per-identity lookup logs.
pub trait KeyUsageStore: Send + Sync {
    fn get(&self, identity: &str) -> AuditResult<Vec<LoggedKeyUsage>>;
    fn put(&self, identity: &str, entries: &[LoggedKeyUsage]) -> AuditResult<()>;
    fn identities(&self) -> AuditResult<Vec<String>>;
}

/// Holder of the latest estate-wide report.
pub trait ReconciliationResultStore: Send + Sync {
    fn latest(&self) -> AuditResult<Option<EstateReport>>;
    fn replace(&self, report: EstateReport) -> AuditResult<()>;
}

// ---------------------------------------------------------------------------
// Data files on disk
// ---------------------------------------------------------------------------

/// YAML, JSON and eyaml data files on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct YamlDataDir;

impl YamlDataDir {
    pub fn new() -> Self {
        Self
    }
}

fn is_data_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| DATA_EXTENSIONS.contains(&ext))
}

impl DataSource for YamlDataDir {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    fn read_structured(&self, path: &str) -> AuditResult<Option<Value>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        // JSON is a subset of YAML, one parser covers both.
        let raw: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|e| AuditError::malformed(path, e))?;
        Ok(Some(Value::from(raw)))
    }

    fn list_data_files(&self, dir: &str) -> AuditResult<Vec<String>> {
        let root = Path::new(dir);
        if !root.is_dir() {
            warn!(dir, "data directory does not exist");
            return Ok(Vec::new());
        }
        let prefix = dir.trim_end_matches('/');
        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| AuditError::Io(e.into()))?;
            if !entry.file_type().is_file() || !is_data_file(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let relative: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(format!("{}/{}", prefix, relative.join("/")));
        }
        debug!(count = files.len(), root = %prefix, "listed data files");
        Ok(files)
    }
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

/// Facts stored as `<dir>/<identity>.yaml` (or `.json`).
///
/// Accepts both a Puppet facts cache document (facts under `values:`) and a
/// plain map. Structured facts are flattened with dots, so `os: {family: x}`
/// is available as `os.family`.
#[derive(Debug, Clone)]
pub struct YamlFactsDir {
    dir: PathBuf,
}

impl YamlFactsDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, identity: &str) -> Option<PathBuf> {
        DATA_EXTENSIONS
            .iter()
            .filter(|ext| **ext != "eyaml")
            .map(|ext| self.dir.join(format!("{}.{}", identity, ext)))
            .find(|p| p.is_file())
    }
}

impl FactProvider for YamlFactsDir {
    fn facts_for(&self, identity: &str) -> AuditResult<FactMap> {
        // Identities name files; refuse anything that could leave the directory.
        if identity.is_empty() || identity.contains('/') || identity.contains("..") {
            return Err(AuditError::invalid_value("certname", "not a valid node name"));
        }
        let Some(path) = self.file_for(identity) else {
            debug!(identity, dir = %self.dir.display(), "no facts file");
            return Ok(FactMap::new());
        };
        let content = std::fs::read_to_string(&path)?;
        let raw: serde_yaml::Value = serde_yaml::from_str(&content)
            .map_err(|e| AuditError::malformed(&path.display().to_string(), e))?;
        let mut facts = FactMap::new();
        match raw.get("values") {
            Some(values) if values.is_mapping() => {
                flatten_facts(values, None, &mut facts);
                // The facts cache records the environment beside the values.
                if let Some(env) = raw.get("environment").and_then(scalar_string) {
                    facts.entry("environment".to_string()).or_insert(env);
                }
            }
            _ => flatten_facts(&raw, None, &mut facts),
        }
        Ok(facts)
    }
}

fn flatten_facts(value: &serde_yaml::Value, prefix: Option<&str>, out: &mut FactMap) {
    use serde_yaml::Value as Yaml;
    match value {
        Yaml::Mapping(map) => {
            for (k, v) in map {
                let Some(name) = scalar_string(k) else {
                    continue;
                };
                let full = match prefix {
                    Some(p) => format!("{}.{}", p, name),
                    None => name,
                };
                flatten_facts(v, Some(&full), out);
            }
        }
        Yaml::Sequence(items) => {
            if let Some(name) = prefix {
                let parts: Vec<String> = items.iter().filter_map(scalar_string).collect();
                if parts.len() == items.len() {
                    out.insert(name.to_string(), parts.join(","));
                }
            }
        }
        Yaml::Tagged(tagged) => flatten_facts(&tagged.value, prefix, out),
        scalar => {
            if let (Some(name), Some(text)) = (prefix, scalar_string(scalar)) {
                out.insert(name.to_string(), text);
            }
        }
    }
}

fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    use serde_yaml::Value as Yaml;
    match value {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Bool(b) => Some(b.to_string()),
        Yaml::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Fixed facts held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticFacts {
    facts: BTreeMap<String, FactMap>,
}

impl StaticFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, identity: &str, facts: &[(&str, &str)]) -> Self {
        self.insert(identity, facts.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        self
    }

    pub fn insert(&mut self, identity: &str, facts: FactMap) {
        self.facts.insert(identity.to_string(), facts);
    }
}

impl FactProvider for StaticFacts {
    fn facts_for(&self, identity: &str) -> AuditResult<FactMap> {
        Ok(self.facts.get(identity).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// In-memory stores
// ---------------------------------------------------------------------------

/// Lookup logs held in process memory.
#[derive(Debug, Default)]
pub struct MemoryKeyUsageStore {
    logs: RwLock<BTreeMap<String, Vec<LoggedKeyUsage>>>,
}

impl MemoryKeyUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyUsageStore for MemoryKeyUsageStore {
    fn get(&self, identity: &str) -> AuditResult<Vec<LoggedKeyUsage>> {
        let logs = self
            .logs
            .read()
            .map_err(|e| AuditError::storage(format!("lock poisoned: {}", e)))?;
        Ok(logs.get(identity).cloned().unwrap_or_default())
    }

    fn put(&self, identity: &str, entries: &[LoggedKeyUsage]) -> AuditResult<()> {
        let mut logs = self
            .logs
            .write()
            .map_err(|e| AuditError::storage(format!("lock poisoned: {}", e)))?;
        logs.insert(identity.to_string(), entries.to_vec());
        Ok(())
    }

    fn identities(&self) -> AuditResult<Vec<String>> {
        let logs = self
            .logs
            .read()
            .map_err(|e| AuditError::storage(format!("lock poisoned: {}", e)))?;
        Ok(logs.keys().cloned().collect())
    }
}

/// Latest estate report, swapped atomically.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    latest: ArcSwapOption<EstateReport>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReconciliationResultStore for MemoryResultStore {
    fn latest(&self) -> AuditResult<Option<EstateReport>> {
        Ok(self.latest.load_full().map(|report| (*report).clone()))
    }

    fn replace(&self, report: EstateReport) -> AuditResult<()> {
        self.latest.store(Some(Arc::new(report)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_reads_as_none() {
        let temp = TempDir::new().unwrap();
        let source = YamlDataDir::new();
        let path = temp.path().join("nope.yaml").display().to_string();
        assert!(!source.exists(&path));
        assert!(source.read_structured(&path).unwrap().is_none());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.yaml");
        std::fs::write(&path, "a: [unclosed\n").unwrap();
        let source = YamlDataDir::new();
        let err = source.read_structured(&path.display().to_string()).unwrap_err();
        assert!(matches!(err, AuditError::Malformed { .. }));
    }

    #[test]
    fn test_list_data_files_recurses() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("nodes")).unwrap();
        std::fs::write(temp.path().join("common.yaml"), "a: 1\n").unwrap();
        std::fs::write(temp.path().join("nodes/web01.yml"), "b: 2\n").unwrap();
        std::fs::write(temp.path().join("nodes/web02.json"), "{}").unwrap();
        std::fs::write(temp.path().join("secrets.eyaml"), "c: ENC[PKCS7,x]\n").unwrap();
        std::fs::write(temp.path().join("README.md"), "docs").unwrap();
        let root = temp.path().display().to_string();
        assert_eq!(
            YamlDataDir::new().list_data_files(&format!("{}/", root)).unwrap(),
            vec![
                format!("{}/common.yaml", root),
                format!("{}/nodes/web01.yml", root),
                format!("{}/nodes/web02.json", root),
                format!("{}/secrets.eyaml", root),
            ]
        );
        assert!(YamlDataDir::new().list_data_files(&format!("{}/missing", root)).unwrap().is_empty());
    }

    #[test]
    fn test_facts_cache_document_flattened() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("web01.yaml"),
            "name: web01\nvalues:\n  environment: production\n  os:\n    family: Debian\n    release:\n      major: 12\n  ips: [10.0.0.1, 10.0.0.2]\n",
        )
        .unwrap();
        let facts = YamlFactsDir::new(temp.path()).facts_for("web01").unwrap();
        assert_eq!(facts.get("environment").map(String::as_str), Some("production"));
        assert_eq!(facts.get("os.family").map(String::as_str), Some("Debian"));
        assert_eq!(facts.get("os.release.major").map(String::as_str), Some("12"));
        assert_eq!(facts.get("ips").map(String::as_str), Some("10.0.0.1,10.0.0.2"));
        assert!(!facts.contains_key("name"));
    }

    #[test]
    fn test_facts_cache_environment_beside_values() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("web02.yaml"),
            "name: web02\nenvironment: staging\nvalues:\n  kernel: Linux\n",
        )
        .unwrap();
        let facts = YamlFactsDir::new(temp.path()).facts_for("web02").unwrap();
        assert_eq!(facts.get("environment").map(String::as_str), Some("staging"));
        assert_eq!(facts.get("kernel").map(String::as_str), Some("Linux"));
    }

    #[test]
    fn test_plain_fact_map_and_unknown_identity() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("db01.json"), r#"{"env": "dev", "virtual": true}"#).unwrap();
        let provider = YamlFactsDir::new(temp.path());
        let facts = provider.facts_for("db01").unwrap();
        assert_eq!(facts.get("env").map(String::as_str), Some("dev"));
        assert_eq!(facts.get("virtual").map(String::as_str), Some("true"));
        assert!(provider.facts_for("ghost").unwrap().is_empty());
        assert!(provider.facts_for("../etc/passwd").is_err());
    }

    #[test]
    fn test_memory_usage_store() {
        let store = MemoryKeyUsageStore::new();
        assert!(store.get("web01").unwrap().is_empty());
        let entries = vec![LoggedKeyUsage::new("web01", "a", "t")];
        store.put("web01", &entries).unwrap();
        assert_eq!(store.get("web01").unwrap(), entries);
        assert_eq!(store.identities().unwrap(), vec!["web01"]);
    }

    #[test]
    fn test_memory_result_store_replace() {
        let store = MemoryResultStore::new();
        assert!(store.latest().unwrap().is_none());
        let report = EstateReport {
            identities: vec!["web01".into()],
            ..Default::default()
        };
        store.replace(report.clone()).unwrap();
        assert_eq!(store.latest().unwrap(), Some(report));
    }
}
