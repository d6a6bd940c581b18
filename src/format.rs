//! Output formatting for the CLI: plain text reports and JSON.

use crate::hierarchy::HierarchyResolution;
use crate::reconcile::{DuplicateEntry, KeyPaths, ReconciliationResult};
use crate::retention::LoggedKeyUsage;
use crate::service::{EstateReport, IdentityLog, KeyLookup};
use serde::Serialize;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Pretty JSON for any serializable result.
pub fn to_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

fn push_key_paths(out: &mut String, title: &str, entries: &[KeyPaths]) {
    out.push_str(&format!("\n## {} ({})\n", title, entries.len()));
    for entry in entries {
        out.push_str(&format!("- {}\n", entry.key));
        for path in &entry.paths {
            out.push_str(&format!("    {}\n", path));
        }
    }
}

fn push_duplicates(out: &mut String, duplicates: &[DuplicateEntry]) {
    out.push_str(&format!("\n## Duplicates ({})\n", duplicates.len()));
    for dup in duplicates {
        out.push_str(&format!("- {} = {}\n", dup.key, dup.value));
        for path in &dup.paths {
            out.push_str(&format!("    {}\n", path));
        }
    }
}

pub fn format_hierarchy(title: &str, resolution: &HierarchyResolution) -> String {
    let mut out = format!("# Hierarchy: {}\n", title);
    out.push_str(&format!("\n## Paths ({})\n", resolution.paths.len()));
    for (idx, path) in resolution.paths.iter().enumerate() {
        out.push_str(&format!("{:>3}. {}\n", idx + 1, path));
    }
    if !resolution.variables.is_empty() {
        out.push_str(&format!("\n## Facts used\n{}\n", resolution.variables.join(", ")));
    }
    out
}

pub fn format_reconciliation(identity: &str, result: &ReconciliationResult) -> String {
    let mut out = format!("# Clean report: {}\n", identity);

    out.push_str(&format!(
        "\n## Looked up but not in hierarchy ({})\n",
        result.logged_not_in_hierarchy.len()
    ));
    for key in &result.logged_not_in_hierarchy {
        out.push_str(&format!("- {}\n", key));
    }
    push_key_paths(&mut out, "Looked up and found", &result.logged_and_in_hierarchy);
    push_key_paths(&mut out, "Never looked up", &result.in_hierarchy_not_logged);
    push_duplicates(&mut out, &result.duplicates);
    out
}

pub fn format_estate(report: &EstateReport) -> String {
    let mut out = format!(
        "# Estate report ({})\n\nAudited: {}\nSkipped (no facts): {}\n",
        report.generated_at.to_rfc3339(),
        report.identities.len(),
        report.skipped_identities.len()
    );
    if !report.skipped_identities.is_empty() {
        out.push_str(&format!("  {}\n", report.skipped_identities.join(", ")));
    }
    out.push_str(&format!("\n## Files never used ({})\n", report.paths_never_used.len()));
    for path in &report.paths_never_used {
        out.push_str(&format!("- {}\n", path));
    }
    push_key_paths(&mut out, "Keys never looked up", &report.keys_never_used);
    push_duplicates(&mut out, &report.duplicates);
    out
}

pub fn format_usage(identity: &str, entries: &[LoggedKeyUsage]) -> String {
    let mut out = format!("# Lookup log: {} ({})\n", identity, entries.len());
    for entry in entries {
        out.push_str(&format!("- {}  {}\n", entry.timestamp, entry.key));
    }
    out
}

pub fn format_all_usage(logs: &[IdentityLog]) -> String {
    if logs.is_empty() {
        return "No lookups recorded\n".to_string();
    }
    logs.iter()
        .map(|log| format_usage(&log.identity, &log.entries))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_lookup(identity: &str, key: &str, found: Option<&KeyLookup>) -> String {
    match found {
        None => format!("{} is not defined for {}\n", key, identity),
        Some(lookup) => {
            let mut out = format!("{} = {}\n  from {}\n", lookup.key, lookup.value, lookup.path);
            for shadowed in lookup.paths.iter().skip(1) {
                out.push_str(&format!("  also in {}\n", shadowed));
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::Value;

    #[test]
    fn test_reconciliation_sections() {
        let result = ReconciliationResult {
            logged_not_in_hierarchy: vec!["z".into()],
            logged_and_in_hierarchy: vec![KeyPaths {
                key: "a::b".into(),
                paths: vec!["/data/common.yaml".into()],
            }],
            in_hierarchy_not_logged: vec![],
            duplicates: vec![DuplicateEntry {
                key: "a::b".into(),
                value: Value::String("x".into()),
                paths: vec!["/data/common.yaml".into(), "/data/prod.yaml".into()],
            }],
        };
        let text = format_reconciliation("web01", &result);
        assert!(text.starts_with("# Clean report: web01\n"));
        assert!(text.contains("## Looked up but not in hierarchy (1)\n- z\n"));
        assert!(text.contains("## Never looked up (0)"));
        assert!(text.contains("- a::b = x\n    /data/common.yaml\n    /data/prod.yaml\n"));
    }

    #[test]
    fn test_all_usage() {
        assert_eq!(format_all_usage(&[]), "No lookups recorded\n");
        let logs = vec![IdentityLog {
            identity: "web01".into(),
            entries: vec![LoggedKeyUsage::new("web01", "motd", "2024-01-01T00:00:00+0000")],
        }];
        assert_eq!(
            format_all_usage(&logs),
            "# Lookup log: web01 (1)\n- 2024-01-01T00:00:00+0000  motd\n"
        );
    }

    #[test]
    fn test_lookup_not_found() {
        assert_eq!(format_lookup("web01", "k", None), "k is not defined for web01\n");
    }
}
