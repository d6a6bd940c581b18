//! Configuration loader with tier-based merging.
//!
//! Loads configuration from multiple tiers and merges them field-by-field.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Built-in defaults (lowest priority)
    Defaults = 0,
    /// Project-level config (`$CWD/hiera-audit/`)
    Project = 1,
    /// User-level config (`~/.hiera-audit/`)
    User = 2,
    /// Environment variables (highest priority)
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// `./hiera-audit` and `~/.hiera-audit`.
    pub fn discover() -> Self {
        Self {
            project_dir: Some(PathBuf::from("hiera-audit")),
            user_dir: dirs::home_dir().map(|h| h.join(".hiera-audit")),
        }
    }

    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: Config,
    /// Tiers that contributed, lowest first: file paths or variable names.
    sources: Vec<(ConfigTier, String)>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load() -> Result<Self> {
        match std::env::var("HIERA_AUDIT_CONFIG_PATH") {
            Ok(explicit) => Self::load_explicit(Path::new(&explicit)),
            Err(_) => Self::load_with_paths(ConfigPaths::discover()),
        }
    }

    /// Defaults plus one explicit file, then environment overrides.
    ///
    /// The explicit file replaces the project and user tiers.
    pub fn load_explicit(path: &Path) -> Result<Self> {
        let file_tier = read_tier(path)?
            .with_context(|| format!("config file {} does not exist", path.display()))?;
        let merged = deep_merge_all([serde_json::to_value(Config::default())?, file_tier]);
        let mut config: Config = serde_json::from_value(merged)
            .with_context(|| format!("invalid config in {}", path.display()))?;
        let mut sources = vec![(ConfigTier::Project, path.display().to_string())];
        record_env(&mut sources, apply_env_overrides(&mut config, env_var)?);
        config.validate()?;
        Ok(Self {
            paths: ConfigPaths::with_dirs(None, None),
            config,
            sources,
        })
    }

    /// Load configuration with explicit tier directories.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        let mut tiers: Vec<Value> = vec![serde_json::to_value(Config::default())?];
        let mut sources = Vec::new();

        let candidates = [
            (ConfigTier::Project, paths.project_dir.as_deref()),
            (ConfigTier::User, paths.user_dir.as_deref()),
        ];
        for (tier, dir) in candidates {
            let Some(dir) = dir else { continue };
            let file = dir.join("config.yaml");
            match read_tier(&file) {
                Ok(Some(value)) => {
                    debug!(tier = %tier, path = %file.display(), "config tier loaded");
                    tiers.push(value);
                    sources.push((tier, file.display().to_string()));
                }
                Ok(None) => {}
                Err(err) => warn!(tier = %tier, path = %file.display(), error = %err, "ignoring unreadable config"),
            }
        }

        let merged = deep_merge_all(tiers);
        let mut config: Config = serde_json::from_value(merged)?;
        record_env(&mut sources, apply_env_overrides(&mut config, env_var)?);
        config.validate()?;

        Ok(Self {
            paths,
            config,
            sources,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Config files and environment variables that were applied, lowest
    /// priority first.
    pub fn sources(&self) -> &[(ConfigTier, String)] {
        &self.sources
    }
}

/// Parse one YAML tier into a JSON value; `None` when the file is absent.
fn read_tier(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("invalid YAML in {}", path.display()))?;
    Ok(Some(value))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn record_env(sources: &mut Vec<(ConfigTier, String)>, applied: Vec<&'static str>) {
    for name in applied {
        debug!(variable = name, "config override from environment");
        sources.push((ConfigTier::Environment, name.to_string()));
    }
}

/// Apply environment variable overrides to config, returning the variables used.
fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<&'static str>> {
    let mut applied = Vec::new();
    if let Some(data_dir) = lookup("HIERA_AUDIT_DATA_DIR") {
        config.data_dir = PathBuf::from(data_dir);
        applied.push("HIERA_AUDIT_DATA_DIR");
    }
    if let Some(hiera_file) = lookup("HIERA_AUDIT_HIERA_FILE") {
        config.hiera_file = Some(PathBuf::from(hiera_file));
        applied.push("HIERA_AUDIT_HIERA_FILE");
    }
    if let Some(facts_dir) = lookup("HIERA_AUDIT_FACTS_DIR") {
        config.facts_dir = PathBuf::from(facts_dir);
        applied.push("HIERA_AUDIT_FACTS_DIR");
    }
    if let Some(db_path) = lookup("HIERA_AUDIT_DB_PATH") {
        config.storage.db_path = PathBuf::from(db_path);
        applied.push("HIERA_AUDIT_DB_PATH");
    }
    if let Some(ttl) = lookup("HIERA_AUDIT_TTL_MINUTES") {
        config.key_ttl_minutes = ttl
            .trim()
            .parse()
            .with_context(|| format!("HIERA_AUDIT_TTL_MINUTES is not a number: {}", ttl))?;
        applied.push("HIERA_AUDIT_TTL_MINUTES");
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp = TempDir::new().unwrap();
        let paths = ConfigPaths::with_dirs(
            Some(temp.path().join("project")),
            Some(temp.path().join("user")),
        );

        let loader = ConfigLoader::load_with_paths(paths).unwrap();
        assert_eq!(loader.config().server.port, 8162);
        assert!(loader.sources().is_empty());
    }

    #[test]
    fn test_user_overrides_project_field_by_field() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("hiera-audit");
        let user_dir = temp.path().join("user");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::create_dir_all(&user_dir).unwrap();

        std::fs::write(
            project_dir.join("config.yaml"),
            "server:\n  port: 9000\n  host: 0.0.0.0\nstorage:\n  backend: memory\n",
        )
        .unwrap();
        std::fs::write(user_dir.join("config.yaml"), "server:\n  port: 9100\n").unwrap();

        let loader =
            ConfigLoader::load_with_paths(ConfigPaths::with_dirs(Some(project_dir), Some(user_dir))).unwrap();
        let config = loader.config();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(loader.sources().len(), 2);
        assert_eq!(loader.sources()[1].0, ConfigTier::User);
    }

    #[test]
    fn test_hierarchy_replaced_not_merged() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("hiera-audit");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("config.yaml"), "hierarchy:\n  - \"%{env}\"\n").unwrap();

        let loader = ConfigLoader::load_with_paths(ConfigPaths::with_dirs(Some(project_dir), None)).unwrap();
        assert_eq!(loader.config().hierarchy.len(), 1);
    }

    #[test]
    fn test_explicit_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("custom.yaml");
        std::fs::write(&file, "key_ttl_minutes: 30\n").unwrap();
        let loader = ConfigLoader::load_explicit(&file).unwrap();
        assert_eq!(loader.config().server.port, 8162);
        assert!(ConfigLoader::load_explicit(&temp.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_env_overrides_recorded() {
        let vars = std::collections::HashMap::from([
            ("HIERA_AUDIT_TTL_MINUTES", "30"),
            ("HIERA_AUDIT_DB_PATH", "/tmp/audit.db"),
        ]);
        let mut config = Config::default();
        let applied =
            apply_env_overrides(&mut config, |name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.key_ttl_minutes, 30);
        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/audit.db"));
        assert_eq!(applied, vec!["HIERA_AUDIT_DB_PATH", "HIERA_AUDIT_TTL_MINUTES"]);

        let mut sources = Vec::new();
        record_env(&mut sources, applied);
        assert_eq!(sources[0], (ConfigTier::Environment, "HIERA_AUDIT_DB_PATH".to_string()));
    }

    #[test]
    fn test_env_ttl_must_be_numeric() {
        let mut config = Config::default();
        let result = apply_env_overrides(&mut config, |name| {
            (name == "HIERA_AUDIT_TTL_MINUTES").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }
}
