//! Fact placeholder substitution.
//!
//! Templates embed placeholders such as `%{::osfamily}`, `%{facts.env}` or
//! `${ns::name}`. Expansion works one placeholder per pass, leftmost first,
//! and stops after a fixed number of passes so that self-referential fact
//! values cannot loop forever.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Facts resolved for one identity, keyed by bare fact name.
pub type FactMap = BTreeMap<String, String>;

/// Hard upper bound on substitution passes.
pub const MAX_PASSES: usize = 50;

/// Token substituted for unknown facts under the sentinel policy.
pub const DEFAULT_SENTINEL: &str = "fact_not_found";

/// What to do with a placeholder whose fact is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedFact {
    /// Replace the placeholder with a fixed token.
    Sentinel(String),
    /// Keep the placeholder text untouched.
    Leave,
}

impl Default for UnresolvedFact {
    fn default() -> Self {
        UnresolvedFact::Sentinel(DEFAULT_SENTINEL.to_string())
    }
}

/// Placeholder grammar recognised by a [`Substitutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderSyntax {
    /// Hiera interpolation: `%{name}`, `%{::name}`, `%{facts.name}`.
    Hiera,
    /// Namespaced variables: `${<namespace>::name}`.
    Namespaced { namespace: String },
}

impl PlaceholderSyntax {
    fn pattern(&self) -> Regex {
        let source = match self {
            PlaceholderSyntax::Hiera => r"%\{([^{}]*)\}".to_string(),
            PlaceholderSyntax::Namespaced { namespace } => {
                format!(r"\$\{{\s*(?:::)?{}::([^{{}}]*)\}}", escape(namespace))
            }
        };
        // Fixed template plus an escaped literal, always a valid pattern.
        Regex::new(&source).expect("placeholder pattern")
    }

    /// Reduce a placeholder body to the bare fact name.
    fn fact_name(&self, body: &str) -> String {
        let name = body.trim().trim_start_matches("::");
        let name = match self {
            PlaceholderSyntax::Hiera => name.strip_prefix("facts.").unwrap_or(name),
            PlaceholderSyntax::Namespaced { .. } => name,
        };
        name.trim().to_string()
    }
}

fn escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Bounded placeholder expander.
#[derive(Debug, Clone)]
pub struct Substitutor {
    syntax: PlaceholderSyntax,
    pattern: Regex,
    unresolved: UnresolvedFact,
    max_passes: usize,
}

impl Substitutor {
    pub fn new(syntax: PlaceholderSyntax) -> Self {
        let pattern = syntax.pattern();
        Self {
            syntax,
            pattern,
            unresolved: UnresolvedFact::default(),
            max_passes: MAX_PASSES,
        }
    }

    /// Hiera `%{...}` substitutor with the default sentinel policy.
    pub fn hiera() -> Self {
        Self::new(PlaceholderSyntax::Hiera)
    }

    pub fn with_unresolved(mut self, policy: UnresolvedFact) -> Self {
        self.unresolved = policy;
        self
    }

    /// Set the pass bound; values above [`MAX_PASSES`] are clamped.
    pub fn with_max_passes(mut self, passes: usize) -> Self {
        self.max_passes = passes.clamp(1, MAX_PASSES);
        self
    }

    pub fn syntax(&self) -> &PlaceholderSyntax {
        &self.syntax
    }

    /// Expand placeholders in `template` using `facts`.
    ///
    /// Returns the partially substituted string if the pass bound is reached.
    pub fn expand(&self, template: &str, facts: &FactMap) -> String {
        let mut out = template.to_string();
        let mut cursor = 0;

        for _ in 0..self.max_passes {
            let Some(caps) = self.pattern.captures(&out[cursor..]) else {
                return out;
            };
            let Some(whole) = caps.get(0) else {
                return out;
            };
            let placeholder = whole.as_str().to_string();
            let start = cursor + whole.start();
            let name = caps
                .get(1)
                .map(|m| self.syntax.fact_name(m.as_str()))
                .unwrap_or_default();

            match (facts.get(&name), &self.unresolved) {
                (Some(value), _) => {
                    out.replace_range(start..start + placeholder.len(), value);
                }
                (None, UnresolvedFact::Sentinel(token)) => {
                    tracing::debug!(fact = %name, template, "unresolved fact, substituting sentinel");
                    out.replace_range(start..start + placeholder.len(), token);
                }
                (None, UnresolvedFact::Leave) => {
                    tracing::debug!(fact = %name, template, "unresolved fact left in place");
                    cursor = start + placeholder.len();
                }
            }
        }

        if self.pattern.is_match(&out[cursor..]) {
            tracing::warn!(
                template,
                passes = self.max_passes,
                "placeholder expansion hit the pass bound, returning partial result"
            );
        }
        out
    }

    /// Fact names referenced by `template`, deduplicated, in order of appearance.
    pub fn referenced_facts(&self, template: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in self.pattern.captures_iter(template) {
            if let Some(body) = caps.get(1) {
                let name = self.syntax.fact_name(body.as_str());
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Whether `text` still contains a placeholder of this grammar.
    pub fn has_placeholder(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

impl Default for Substitutor {
    fn default() -> Self {
        Self::hiera()
    }
}
