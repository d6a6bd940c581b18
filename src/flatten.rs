//! Structural flattening of hierarchy data files.
//!
//! A data file is a tree of maps, lists and scalars. Flattening turns it into
//! leaf entries keyed by the `::`-joined chain of map keys leading to them.
//! Lists do not add a key segment: their map elements contribute children of
//! the list's own key and their scalar elements are kept together as a single
//! list leaf.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Separator of hierarchical keys.
pub const KEY_SEPARATOR: &str = "::";

/// Separator of the companion dotted keys.
pub const DOT_SEPARATOR: &str = ".";

/// Structured value read from a data file.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Map entries in document order.
    Map(Vec<(String, Value)>),
    List(Vec<Value>),
    /// Anything else (null, tagged YAML, out-of-range numbers), stored as read.
    Other(serde_yaml::Value),
}

impl Value {
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::String(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_)
        )
    }

    /// Scalars and lists made only of scalars compare by value.
    pub fn is_comparable(&self) -> bool {
        match self {
            Value::List(items) => items.iter().all(Value::is_scalar),
            other => other.is_scalar(),
        }
    }

    pub fn leaf_type(&self) -> LeafType {
        match self {
            Value::String(_) => LeafType::String,
            Value::Int(_) => LeafType::Int,
            Value::Float(_) => LeafType::Float,
            Value::Bool(_) => LeafType::Bool,
            _ => LeafType::Other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Child value under a map key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<serde_yaml::Value> for Value {
    fn from(raw: serde_yaml::Value) -> Self {
        use serde_yaml::Value as Yaml;
        match raw {
            Yaml::String(s) => Value::String(s),
            Yaml::Bool(b) => Value::Bool(b),
            Yaml::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if n.is_f64() {
                    n.as_f64().map(Value::Float).unwrap_or(Value::Other(Yaml::Number(n)))
                } else {
                    Value::Other(Yaml::Number(n))
                }
            }
            Yaml::Sequence(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Yaml::Mapping(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (key_to_string(k), Value::from(v)))
                    .collect(),
            ),
            other => Value::Other(other),
        }
    }
}

/// YAML allows any value as a map key; non-string keys are stringified.
fn key_to_string(key: serde_yaml::Value) -> String {
    use serde_yaml::Value as Yaml;
    match key {
        Yaml::String(s) => s,
        Yaml::Bool(b) => b.to_string(),
        Yaml::Number(n) => n.to_string(),
        Yaml::Null => "~".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::String(s) => serializer.serialize_str(s),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Other(raw) => raw.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_yaml::Value::deserialize(deserializer).map(Value::from)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            other => match serde_json::to_string(other) {
                Ok(s) => write!(f, "{}", s),
                Err(_) => write!(f, "{:?}", other),
            },
        }
    }
}

/// Runtime type tag of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafType {
    String,
    Int,
    Float,
    Bool,
    Other,
}

/// One terminal value found while flattening a data file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeafEntry {
    /// Data file the value came from.
    pub path: String,
    /// `::`-joined key chain.
    pub key: String,
    /// The key chain itself.
    pub segments: Vec<String>,
    /// Ancestor container keys, outermost first, each `::`-joined.
    pub sub_keys: Vec<String>,
    #[serde(rename = "type")]
    pub leaf_type: LeafType,
    pub value: Value,
}

impl LeafEntry {
    fn new(path: &str, segments: &[String], value: Value) -> Self {
        let sub_keys = (1..segments.len())
            .map(|n| segments[..n].join(KEY_SEPARATOR))
            .collect();
        Self {
            path: path.to_string(),
            key: segments.join(KEY_SEPARATOR),
            segments: segments.to_vec(),
            sub_keys,
            leaf_type: value.leaf_type(),
            value,
        }
    }

    /// Dotted form of the key.
    pub fn dotted_key(&self) -> String {
        self.segments.join(DOT_SEPARATOR)
    }
}

/// Flatten `raw` read from `source_path` into leaf entries.
pub fn flatten(raw: &Value, source_path: &str) -> Vec<LeafEntry> {
    let mut leaves = Vec::new();
    let mut chain = Vec::new();
    match raw {
        Value::Map(entries) => walk_map(entries, &mut chain, source_path, &mut leaves),
        // A document that is not a map has no keys to report.
        Value::Other(serde_yaml::Value::Null) => {}
        other => {
            tracing::debug!(path = source_path, "data file root is not a map, ignoring {:?}", other.leaf_type());
        }
    }
    leaves
}

fn walk_map(
    entries: &[(String, Value)],
    chain: &mut Vec<String>,
    path: &str,
    leaves: &mut Vec<LeafEntry>,
) {
    for (key, value) in entries {
        chain.push(key.clone());
        walk_value(value, chain, path, leaves);
        chain.pop();
    }
}

fn walk_value(value: &Value, chain: &mut Vec<String>, path: &str, leaves: &mut Vec<LeafEntry>) {
    match value {
        Value::Map(entries) if entries.is_empty() => {
            leaves.push(LeafEntry::new(path, chain, Value::Other(empty_mapping())));
        }
        Value::Map(entries) => walk_map(entries, chain, path, leaves),
        Value::List(items) if items.iter().all(Value::is_scalar) => {
            leaves.push(LeafEntry::new(path, chain, value.clone()));
        }
        Value::List(items) => {
            let mut scalars = Vec::new();
            walk_list(items, chain, path, leaves, &mut scalars);
            if !scalars.is_empty() {
                leaves.push(LeafEntry::new(path, chain, Value::List(scalars)));
            }
        }
        scalar => leaves.push(LeafEntry::new(path, chain, scalar.clone())),
    }
}

/// Mixed lists: maps and nested lists merge under the current key, scalars
/// are collected for a single list leaf.
fn walk_list(
    items: &[Value],
    chain: &mut Vec<String>,
    path: &str,
    leaves: &mut Vec<LeafEntry>,
    scalars: &mut Vec<Value>,
) {
    for item in items {
        match item {
            Value::Map(entries) => walk_map(entries, chain, path, leaves),
            Value::List(nested) => walk_list(nested, chain, path, leaves, scalars),
            other => scalars.push(other.clone()),
        }
    }
}

fn empty_mapping() -> serde_yaml::Value {
    serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
}

/// Flattened content of one data file with key indexes for membership tests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlattenedSource {
    pub path: String,
    pub leaves: Vec<LeafEntry>,
    /// `::` key → indexes into `leaves`.
    #[serde(skip)]
    by_key: HashMap<String, Vec<usize>>,
    /// Same keys joined with `.`.
    #[serde(skip)]
    dotted: BTreeSet<String>,
    /// Every container key on any leaf's chain.
    #[serde(skip)]
    containers: BTreeSet<String>,
}

impl FlattenedSource {
    /// Source with no content, used for missing files.
    pub fn empty(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Flatten `raw` once and build both key styles from the same walk.
    pub fn from_value(path: impl Into<String>, raw: &Value) -> Self {
        let path = path.into();
        let leaves = flatten(raw, &path);
        Self::from_leaves(path, leaves)
    }

    pub fn from_leaves(path: impl Into<String>, leaves: Vec<LeafEntry>) -> Self {
        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
        let mut dotted = BTreeSet::new();
        let mut containers = BTreeSet::new();
        for (idx, leaf) in leaves.iter().enumerate() {
            by_key.entry(leaf.key.clone()).or_default().push(idx);
            dotted.insert(leaf.dotted_key());
            for n in 1..leaf.segments.len() {
                containers.insert(leaf.segments[..n].join(KEY_SEPARATOR));
                containers.insert(leaf.segments[..n].join(DOT_SEPARATOR));
            }
        }
        Self {
            path: path.into(),
            leaves,
            by_key,
            dotted,
            containers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Whether `key` names a leaf (either join style) or a container in this source.
    pub fn contains_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key) || self.dotted.contains(key) || self.containers.contains(key)
    }

    /// Leaves stored under the `::` key.
    pub fn leaves_for(&self, key: &str) -> impl Iterator<Item = &LeafEntry> {
        self.by_key
            .get(key)
            .into_iter()
            .flatten()
            .map(|&idx| &self.leaves[idx])
    }

    /// Distinct `::` keys in document order.
    pub fn keys(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.leaves
            .iter()
            .filter(|leaf| seen.insert(leaf.key.as_str()))
            .map(|leaf| leaf.key.as_str())
            .collect()
    }

    /// Dotted keys, sorted.
    pub fn dotted_keys(&self) -> impl Iterator<Item = &str> {
        self.dotted.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str::<serde_yaml::Value>(yaml).unwrap().into()
    }

    #[test]
    fn test_nested_maps_join_with_separator() {
        let raw = parse("a:\n  b: x\n  c:\n    d: 1\ntop: true\n");
        let leaves = flatten(&raw, "/data/common.yaml");
        let keys: Vec<&str> = leaves.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(keys, vec!["a::b", "a::c::d", "top"]);
        assert_eq!(leaves[0].leaf_type, LeafType::String);
        assert_eq!(leaves[1].leaf_type, LeafType::Int);
        assert_eq!(leaves[2].leaf_type, LeafType::Bool);
        assert_eq!(leaves[1].sub_keys, vec!["a", "a::c"]);
        assert!(leaves.iter().all(|l| l.path == "/data/common.yaml"));
    }

    #[test]
    fn test_scalar_list_kept_whole() {
        let raw = parse("servers:\n  - ntp1\n  - ntp2\n");
        let leaves = flatten(&raw, "p");
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].key, "servers");
        assert_eq!(leaves[0].leaf_type, LeafType::Other);
        assert_eq!(
            leaves[0].value,
            Value::List(vec![
                Value::String("ntp1".into()),
                Value::String("ntp2".into())
            ])
        );
    }

    #[test]
    fn test_list_of_maps_merges_under_parent() {
        let raw = parse("users:\n  - name: bob\n  - shell: zsh\n  - extra\n");
        let leaves = flatten(&raw, "p");
        let keys: Vec<&str> = leaves.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(keys, vec!["users::name", "users::shell", "users"]);
        assert_eq!(leaves[2].value, Value::List(vec![Value::String("extra".into())]));
    }

    #[test]
    fn test_other_values_kept() {
        let raw = parse("nothing: ~\nempty: {}\nratio: 0.5\n");
        let leaves = flatten(&raw, "p");
        assert_eq!(leaves[0].leaf_type, LeafType::Other);
        assert_eq!(leaves[0].value, Value::Other(serde_yaml::Value::Null));
        assert_eq!(leaves[1].key, "empty");
        assert_eq!(leaves[1].leaf_type, LeafType::Other);
        assert_eq!(leaves[2].leaf_type, LeafType::Float);
    }

    #[test]
    fn test_keys_split_back_into_traversal() {
        let raw = parse("a:\n  b:\n    c: 1\n  d: [1, 2]\ne: x\n");
        for leaf in flatten(&raw, "p") {
            let split: Vec<String> = leaf.key.split(KEY_SEPARATOR).map(String::from).collect();
            assert_eq!(split, leaf.segments);
        }
    }

    #[test]
    fn test_non_string_map_keys_stringified() {
        let raw = parse("ports:\n  80: http\n  true: yes\n");
        let keys: Vec<String> = flatten(&raw, "p").into_iter().map(|l| l.key).collect();
        assert_eq!(keys, vec!["ports::80", "ports::true"]);
    }

    #[test]
    fn test_source_membership_both_styles() {
        let raw = parse("profile:\n  ntp:\n    servers: [a]\n\"role::web::port\": 80\n");
        let source = FlattenedSource::from_value("p", &raw);
        assert!(source.contains_key("profile::ntp::servers"));
        assert!(source.contains_key("profile.ntp.servers"));
        assert!(source.contains_key("profile::ntp"));
        assert!(source.contains_key("profile"));
        assert!(source.contains_key("role::web::port"));
        assert!(!source.contains_key("profile::ntp::pool"));
        assert_eq!(source.keys(), vec!["profile::ntp::servers", "role::web::port"]);
    }

    #[test]
    fn test_non_map_root_yields_nothing() {
        assert!(flatten(&parse("- a\n- b\n"), "p").is_empty());
        assert!(flatten(&parse("~"), "p").is_empty());
    }
}
