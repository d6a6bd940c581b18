//! Configuration types.

use crate::hierarchy::HierarchyEntry;
use crate::retention::{DEFAULT_TIMESTAMP_FORMAT, DEFAULT_TTL_MINUTES, RetentionPolicy};
use crate::service::DEFAULT_VARIABLE_NAMESPACE;
use crate::substitute::{DEFAULT_SENTINEL, MAX_PASSES, UnresolvedFact};
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the hierarchy data files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Optional `hiera.yaml`; replaces `hierarchy` and may set the data dir.
    #[serde(default)]
    pub hiera_file: Option<PathBuf>,

    /// Inline hierarchy, highest priority first.
    #[serde(default = "default_hierarchy")]
    pub hierarchy: Vec<HierarchyEntry>,

    /// Directory of `<certname>.yaml` fact files.
    #[serde(default = "default_facts_dir")]
    pub facts_dir: PathBuf,

    /// Age in minutes after which a logged lookup is dropped.
    #[serde(default = "default_key_ttl")]
    pub key_ttl_minutes: i64,

    /// chrono format of logged lookup timestamps.
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,

    #[serde(default)]
    pub substitution: SubstitutionConfig,

    #[serde(default)]
    pub lookup: LookupConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            hiera_file: None,
            hierarchy: default_hierarchy(),
            facts_dir: default_facts_dir(),
            key_ttl_minutes: default_key_ttl(),
            timestamp_format: default_timestamp_format(),
            substitution: SubstitutionConfig::default(),
            lookup: LookupConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_hierarchy() -> Vec<HierarchyEntry> {
    vec![
        HierarchyEntry::Single("nodes/%{::trusted.certname}".to_string()),
        HierarchyEntry::Single("common".to_string()),
    ]
}

fn default_facts_dir() -> PathBuf {
    PathBuf::from("facts")
}

fn default_key_ttl() -> i64 {
    DEFAULT_TTL_MINUTES
}

fn default_timestamp_format() -> String {
    DEFAULT_TIMESTAMP_FORMAT.to_string()
}

/// How unknown facts are handled in path templates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    #[default]
    Sentinel,
    Leave,
}

/// Placeholder substitution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstitutionConfig {
    #[serde(default)]
    pub unresolved_fact: UnresolvedPolicy,

    /// Replacement for unknown facts under the `sentinel` policy.
    #[serde(default = "default_sentinel_token")]
    pub sentinel_token: String,

    /// Pass bound per template, capped at 50.
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,
}

impl Default for SubstitutionConfig {
    fn default() -> Self {
        Self {
            unresolved_fact: UnresolvedPolicy::default(),
            sentinel_token: default_sentinel_token(),
            max_passes: default_max_passes(),
        }
    }
}

impl SubstitutionConfig {
    pub fn policy(&self) -> UnresolvedFact {
        match self.unresolved_fact {
            UnresolvedPolicy::Sentinel => UnresolvedFact::Sentinel(self.sentinel_token.clone()),
            UnresolvedPolicy::Leave => UnresolvedFact::Leave,
        }
    }
}

fn default_sentinel_token() -> String {
    DEFAULT_SENTINEL.to_string()
}

fn default_max_passes() -> usize {
    MAX_PASSES
}

/// Key lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    /// Namespace of `${ns::name}` variables inside data values.
    #[serde(default = "default_variable_namespace")]
    pub variable_namespace: String,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            variable_namespace: default_variable_namespace(),
        }
    }
}

fn default_variable_namespace() -> String {
    DEFAULT_VARIABLE_NAMESPACE.to_string()
}

/// Where lookup logs and estate reports are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("hiera-audit/audit.db")
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allow cross-origin requests from any origin.
    #[serde(default = "default_cors")]
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors: default_cors(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8162
}

fn default_cors() -> bool {
    true
}

impl Config {
    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.key_ttl_minutes <= 0 {
            bail!("key_ttl_minutes must be positive, got {}", self.key_ttl_minutes);
        }
        if self.substitution.max_passes == 0 {
            bail!("substitution.max_passes must be at least 1");
        }
        if self.substitution.max_passes > MAX_PASSES {
            tracing::warn!(
                max_passes = self.substitution.max_passes,
                "substitution.max_passes is capped at {}",
                MAX_PASSES
            );
        }
        let retention = RetentionPolicy::new(self.key_ttl_minutes, self.timestamp_format.clone());
        if !retention.round_trips() {
            bail!(
                "timestamp_format {:?} does not produce parseable date-times, expired lookups would never be pruned",
                self.timestamp_format
            );
        }
        if self.lookup.variable_namespace.trim().is_empty() {
            bail!("lookup.variable_namespace must not be empty");
        }
        Ok(())
    }
}
