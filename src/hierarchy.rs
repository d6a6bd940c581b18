//! Hierarchy resolution.
//!
//! A hierarchy is an ordered list of layers, each naming one or more data
//! file templates relative to a data directory. Resolving it for an identity
//! expands the fact placeholders in every template, keeping layer order.

use crate::error::{AuditError, AuditResult};
use crate::substitute::{FactMap, Substitutor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File extensions recognised as data files.
pub const DATA_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "eyaml"];

/// Extension appended to templates that name no data file type.
pub const DEFAULT_EXTENSION: &str = "yaml";

/// A named hierarchy level as written in `hiera.yaml` version 5.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyLevel {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    /// Level-specific data directory.
    #[serde(default)]
    pub datadir: Option<String>,
}

/// One layer of the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HierarchyEntry {
    Single(String),
    Multiple(Vec<String>),
    Level(HierarchyLevel),
}

impl HierarchyEntry {
    /// Path templates of this layer, in declaration order.
    pub fn templates(&self) -> Vec<&str> {
        match self {
            HierarchyEntry::Single(path) => vec![path.as_str()],
            HierarchyEntry::Multiple(paths) => paths.iter().map(String::as_str).collect(),
            HierarchyEntry::Level(level) => {
                let mut out: Vec<&str> = Vec::new();
                if let Some(ref paths) = level.paths {
                    out.extend(paths.iter().map(String::as_str));
                }
                if let Some(ref path) = level.path {
                    out.push(path.as_str());
                }
                out
            }
        }
    }

    fn datadir(&self) -> Option<&str> {
        match self {
            HierarchyEntry::Level(level) => level.datadir.as_deref(),
            _ => None,
        }
    }

    fn label(&self) -> String {
        match self {
            HierarchyEntry::Level(HierarchyLevel {
                name: Some(name), ..
            }) => name.clone(),
            other => other.templates().join(", "),
        }
    }
}

/// Paths and referenced facts of a hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyResolution {
    pub paths: Vec<String>,
    #[serde(rename = "vars")]
    pub variables: Vec<String>,
}

/// Turns hierarchy entries into concrete data file paths.
#[derive(Debug, Clone, Default)]
pub struct HierarchyResolver {
    substitutor: Substitutor,
}

impl HierarchyResolver {
    pub fn new(substitutor: Substitutor) -> Self {
        Self { substitutor }
    }

    pub fn substitutor(&self) -> &Substitutor {
        &self.substitutor
    }

    /// Resolve every template against `facts`, in layer order.
    pub fn resolve(&self, entries: &[HierarchyEntry], data_dir: &str, facts: &FactMap) -> Vec<String> {
        self.templates(entries, data_dir)
            .into_iter()
            .map(|template| self.substitutor.expand(&template, facts))
            .collect()
    }

    /// Prefixed templates with placeholders left in place.
    pub fn templates(&self, entries: &[HierarchyEntry], data_dir: &str) -> Vec<String> {
        let mut out = Vec::new();
        for entry in entries {
            let templates = entry.templates();
            if templates.is_empty() {
                debug!(level = %entry.label(), "hierarchy level has no path or paths, skipping");
                continue;
            }
            let dir = entry.datadir().unwrap_or(data_dir);
            for template in templates {
                out.push(join_data_path(dir, &with_data_extension(template)));
            }
        }
        out
    }

    /// Directories holding data files: `data_dir` plus any per-level datadir.
    pub fn data_dirs(&self, entries: &[HierarchyEntry], data_dir: &str) -> Vec<String> {
        let mut dirs = vec![data_dir.to_string()];
        for dir in entries.iter().filter_map(HierarchyEntry::datadir) {
            if !dirs.iter().any(|d| d.trim_end_matches('/') == dir.trim_end_matches('/')) {
                dirs.push(dir.to_string());
            }
        }
        dirs
    }

    /// Fact names referenced anywhere in the hierarchy, deduplicated.
    pub fn variables(&self, entries: &[HierarchyEntry]) -> Vec<String> {
        let mut vars: Vec<String> = Vec::new();
        for entry in entries {
            for template in entry.templates() {
                for fact in self.substitutor.referenced_facts(template) {
                    if !vars.contains(&fact) {
                        vars.push(fact);
                    }
                }
            }
        }
        vars
    }

    /// Templates plus variables, without any facts.
    pub fn overview(&self, entries: &[HierarchyEntry], data_dir: &str) -> HierarchyResolution {
        HierarchyResolution {
            paths: self.templates(entries, data_dir),
            variables: self.variables(entries),
        }
    }

    /// Resolved paths plus variables for one identity's facts.
    pub fn resolution(
        &self,
        entries: &[HierarchyEntry],
        data_dir: &str,
        facts: &FactMap,
    ) -> HierarchyResolution {
        HierarchyResolution {
            paths: self.resolve(entries, data_dir, facts),
            variables: self.variables(entries),
        }
    }
}

/// Append the default extension when the last path segment names no data type.
fn with_data_extension(template: &str) -> String {
    let file = template.rsplit('/').next().unwrap_or(template);
    let has_extension = file
        .rsplit_once('.')
        .map(|(_, ext)| DATA_EXTENSIONS.contains(&ext))
        .unwrap_or(false);
    if has_extension {
        template.to_string()
    } else {
        format!("{}.{}", template, DEFAULT_EXTENSION)
    }
}

fn join_data_path(dir: &str, template: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let template = template.trim_start_matches('/');
    if dir.is_empty() {
        template.to_string()
    } else {
        format!("{}/{}", dir, template)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HieraDefaults {
    #[serde(default)]
    datadir: Option<String>,
}

/// Parsed `hiera.yaml` (version 5 layout).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HieraFile {
    #[serde(default)]
    pub version: Option<u8>,
    #[serde(default)]
    defaults: HieraDefaults,
    #[serde(default)]
    hierarchy: Vec<HierarchyLevel>,
    /// Directory holding the file, used for relative datadirs.
    #[serde(skip)]
    base_dir: PathBuf,
}

impl HieraFile {
    /// Load and parse a hiera file.
    pub fn load(path: &Path) -> AuditResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut file = Self::parse(&content).map_err(|e| AuditError::malformed(&path.display().to_string(), e))?;
        file.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(file)
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        let file: HieraFile = serde_yaml::from_str(content)?;
        if let Some(version) = file.version {
            if version != 5 {
                tracing::warn!(version, "hiera file is not version 5, reading it as version 5");
            }
        }
        Ok(file)
    }

    /// Default data directory declared in the file, resolved against its location.
    pub fn datadir(&self) -> Option<String> {
        self.defaults.datadir.as_deref().map(|d| self.resolve_dir(d))
    }

    /// Hierarchy entries with level datadirs made absolute.
    pub fn entries(&self) -> Vec<HierarchyEntry> {
        self.hierarchy
            .iter()
            .cloned()
            .map(|mut level| {
                level.datadir = level.datadir.as_deref().map(|d| self.resolve_dir(d));
                HierarchyEntry::Level(level)
            })
            .collect()
    }

    fn resolve_dir(&self, dir: &str) -> String {
        let path = Path::new(dir);
        if path.is_absolute() || self.base_dir.as_os_str().is_empty() {
            dir.to_string()
        } else {
            self.base_dir.join(path).display().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(pairs: &[(&str, &str)]) -> FactMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_preserves_layer_order() {
        let entries = vec![
            HierarchyEntry::Single("common".into()),
            HierarchyEntry::Single("%{env}".into()),
        ];
        let resolver = HierarchyResolver::default();
        let paths = resolver.resolve(&entries, "/data", &facts(&[("env", "prod")]));
        assert_eq!(paths, vec!["/data/common.yaml", "/data/prod.yaml"]);
    }

    #[test]
    fn test_resolve_multiple_templates_keep_sub_order() {
        let entries = vec![
            HierarchyEntry::Single("nodes/%{::certname}.yaml".into()),
            HierarchyEntry::Multiple(vec!["os/%{osfamily}".into(), "common.yaml".into()]),
        ];
        let resolver = HierarchyResolver::default();
        let f = facts(&[("certname", "web01.example.com"), ("osfamily", "Debian")]);
        assert_eq!(
            resolver.resolve(&entries, "/data/", &f),
            vec![
                "/data/nodes/web01.example.com.yaml",
                "/data/os/Debian.yaml",
                "/data/common.yaml"
            ]
        );
    }

    #[test]
    fn test_fact_values_with_dots_still_get_extension() {
        let entries = vec![HierarchyEntry::Single("nodes/%{trusted.certname}".into())];
        let resolver = HierarchyResolver::default();
        let f = facts(&[("trusted.certname", "db01.example.com")]);
        assert_eq!(
            resolver.resolve(&entries, "/data", &f),
            vec!["/data/nodes/db01.example.com.yaml"]
        );
    }

    #[test]
    fn test_variables_deduplicated() {
        let entries = vec![
            HierarchyEntry::Single("%{env}/%{role}".into()),
            HierarchyEntry::Multiple(vec!["%{::env}".into(), "common".into()]),
        ];
        let resolver = HierarchyResolver::default();
        assert_eq!(resolver.variables(&entries), vec!["env", "role"]);
        let overview = resolver.overview(&entries, "/d");
        assert_eq!(
            overview.paths,
            vec!["/d/%{env}/%{role}.yaml", "/d/%{::env}.yaml", "/d/common.yaml"]
        );
    }

    #[test]
    fn test_untagged_entries_deserialize() {
        let entries: Vec<HierarchyEntry> =
            serde_yaml::from_str("- common\n- [a, b]\n- name: Per node\n  path: nodes/%{certname}.yaml\n")
                .unwrap();
        assert_eq!(entries[0], HierarchyEntry::Single("common".into()));
        assert_eq!(entries[1], HierarchyEntry::Multiple(vec!["a".into(), "b".into()]));
        assert_eq!(entries[2].templates(), vec!["nodes/%{certname}.yaml"]);
    }

    #[test]
    fn test_hiera_file_levels() {
        let yaml = r#"
version: 5
defaults:
  datadir: data
hierarchy:
  - name: "Per-node data"
    path: "nodes/%{trusted.certname}.yaml"
  - name: "Per-OS defaults"
    paths:
      - "os/%{facts.os.family}.yaml"
      - "os/%{facts.os.name}.yaml"
  - name: "Secrets"
    lookup_key: eyaml_lookup_key
    glob: "secrets/*.eyaml"
  - name: "Common"
    path: "common.yaml"
    datadir: /srv/shared
"#;
        let mut file = HieraFile::parse(yaml).unwrap();
        file.base_dir = PathBuf::from("/etc/puppet");
        assert_eq!(file.datadir().as_deref(), Some("/etc/puppet/data"));

        let entries = file.entries();
        let resolver = HierarchyResolver::default();
        let f = facts(&[
            ("trusted.certname", "web01"),
            ("os.family", "Debian"),
            ("os.name", "Ubuntu"),
        ]);
        let paths = resolver.resolve(&entries, "/etc/puppet/data", &f);
        assert_eq!(
            paths,
            vec![
                "/etc/puppet/data/nodes/web01.yaml",
                "/etc/puppet/data/os/Debian.yaml",
                "/etc/puppet/data/os/Ubuntu.yaml",
                "/srv/shared/common.yaml"
            ]
        );
        assert_eq!(
            resolver.variables(&entries),
            vec!["trusted.certname", "os.family", "os.name"]
        );
        assert_eq!(
            resolver.data_dirs(&entries, "/etc/puppet/data/"),
            vec!["/etc/puppet/data/", "/srv/shared"]
        );
        assert_eq!(resolver.data_dirs(&entries, "/srv/shared/"), vec!["/srv/shared/"]);
    }
}
