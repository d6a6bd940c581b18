//! Reconciliation of logged key usage against hierarchy data.
//!
//! Given the keys an identity actually looked up and the flattened data files
//! of its hierarchy, work out which logged keys are missing from the data,
//! which data keys are never looked up, and which key/value pairs are defined
//! identically in more than one layer.

use crate::flatten::{DOT_SEPARATOR, FlattenedSource, LeafEntry, Value};
use crate::retention::LoggedKeyUsage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A key and the data files it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPaths {
    pub key: String,
    pub paths: Vec<String>,
}

/// A key/value pair defined identically in several data files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateEntry {
    pub key: String,
    pub value: Value,
    pub paths: Vec<String>,
}

/// Outcome of reconciling one identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationResult {
    /// Looked up, but defined in no layer.
    pub logged_not_in_hierarchy: Vec<String>,
    /// Looked up and defined, with every defining layer.
    pub logged_and_in_hierarchy: Vec<KeyPaths>,
    /// Defined, never looked up.
    pub in_hierarchy_not_logged: Vec<KeyPaths>,
    pub duplicates: Vec<DuplicateEntry>,
}

impl ReconciliationResult {
    pub fn found(&self, key: &str) -> Option<&KeyPaths> {
        self.logged_and_in_hierarchy.iter().find(|e| e.key == key)
    }

    pub fn unused(&self, key: &str) -> Option<&KeyPaths> {
        self.in_hierarchy_not_logged.iter().find(|e| e.key == key)
    }

    pub fn duplicate(&self, key: &str) -> Option<&DuplicateEntry> {
        self.duplicates.iter().find(|e| e.key == key)
    }
}

/// Insertion-ordered key → paths accumulator.
#[derive(Debug, Default)]
struct KeyPathIndex {
    entries: Vec<KeyPaths>,
    positions: HashMap<String, usize>,
}

impl KeyPathIndex {
    fn add(&mut self, key: &str, path: &str) {
        match self.positions.get(key) {
            Some(&idx) => {
                let paths = &mut self.entries[idx].paths;
                if !paths.iter().any(|p| p == path) {
                    paths.push(path.to_string());
                }
            }
            None => {
                self.positions.insert(key.to_string(), self.entries.len());
                self.entries.push(KeyPaths {
                    key: key.to_string(),
                    paths: vec![path.to_string()],
                });
            }
        }
    }

    fn into_vec(self) -> Vec<KeyPaths> {
        self.entries
    }
}

/// Reconcile one identity's logged lookups against its hierarchy sources.
pub fn reconcile(logged: &[LoggedKeyUsage], sources: &[FlattenedSource]) -> ReconciliationResult {
    let mut found = KeyPathIndex::default();
    let mut missing: Vec<String> = Vec::new();
    let mut logged_keys: HashSet<&str> = HashSet::new();

    for usage in logged {
        if !logged_keys.insert(usage.key.as_str()) {
            continue;
        }
        let mut matched = false;
        for source in sources {
            if source.contains_key(&usage.key) {
                found.add(&usage.key, &source.path);
                matched = true;
            }
        }
        if !matched {
            missing.push(usage.key.clone());
        }
    }

    let mut unused = KeyPathIndex::default();
    for source in sources {
        for leaf in &source.leaves {
            if !is_logged(leaf, &logged_keys) {
                unused.add(&leaf.key, &source.path);
            }
        }
    }

    let leaves = sources.iter().flat_map(|s| s.leaves.iter());
    ReconciliationResult {
        logged_not_in_hierarchy: missing,
        logged_and_in_hierarchy: found.into_vec(),
        in_hierarchy_not_logged: unused.into_vec(),
        duplicates: find_duplicates(leaves),
    }
}

/// A leaf counts as used when its own key, its dotted form, or any of its
/// containers was looked up.
fn is_logged(leaf: &LeafEntry, logged: &HashSet<&str>) -> bool {
    logged.contains(leaf.key.as_str())
        || logged.contains(leaf.dotted_key().as_str())
        || leaf.sub_keys.iter().any(|k| logged.contains(k.as_str()))
        || (1..leaf.segments.len())
            .any(|n| logged.contains(leaf.segments[..n].join(DOT_SEPARATOR).as_str()))
}

/// Group scalar-equal leaves by key across distinct data files.
///
/// Paths appear in the order their leaves are met.
pub fn find_duplicates<'a>(leaves: impl IntoIterator<Item = &'a LeafEntry>) -> Vec<DuplicateEntry> {
    // key -> groups of (value, paths); order of first appearance
    let mut groups: Vec<DuplicateEntry> = Vec::new();
    let mut by_key: HashMap<&str, Vec<usize>> = HashMap::new();

    for leaf in leaves {
        if !leaf.value.is_comparable() {
            debug!(key = %leaf.key, path = %leaf.path, "skipping non-scalar value in duplicate detection");
            continue;
        }
        let candidates = by_key.entry(leaf.key.as_str()).or_default();
        match candidates.iter().find(|&&idx| groups[idx].value == leaf.value) {
            Some(&idx) => {
                let paths = &mut groups[idx].paths;
                if !paths.contains(&leaf.path) {
                    paths.push(leaf.path.clone());
                }
            }
            None => {
                candidates.push(groups.len());
                groups.push(DuplicateEntry {
                    key: leaf.key.clone(),
                    value: leaf.value.clone(),
                    paths: vec![leaf.path.clone()],
                });
            }
        }
    }

    groups.retain(|g| g.paths.len() >= 2);
    groups
}

/// Estate-wide audit over an arbitrary set of leaves.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EstateAudit {
    pub duplicates: Vec<DuplicateEntry>,
    /// Keys no identity ever looked up, with the files defining them.
    pub keys_never_logged: Vec<KeyPaths>,
}

/// Duplicate detection plus "never looked up by anyone" over a flat leaf list.
pub fn look_for_duplicate_data<'a, I>(leaves: I, logged_keys: &HashSet<String>) -> EstateAudit
where
    I: IntoIterator<Item = &'a LeafEntry>,
    I::IntoIter: Clone,
{
    let leaves = leaves.into_iter();
    let logged: HashSet<&str> = logged_keys.iter().map(String::as_str).collect();

    let mut never = KeyPathIndex::default();
    for leaf in leaves.clone() {
        if !is_logged(leaf, &logged) {
            never.add(&leaf.key, &leaf.path);
        }
    }

    EstateAudit {
        duplicates: find_duplicates(leaves),
        keys_never_logged: never.into_vec(),
    }
}
