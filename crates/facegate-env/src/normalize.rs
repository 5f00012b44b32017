//! Package-name normalization and the alias table.
//!
//! Declared specs (`deepface==0.0.96`, `Pillow[webp]>=10`, `conda-forge::dlib`)
//! and installed names (`opencv_python`, `PyYAML`) are reduced to one
//! canonical form before they are compared.

use std::collections::{BTreeMap, BTreeSet};

/// Lowercase and fold `_`/`.` runs to `-`.
pub fn canonicalize_package_name(name: &str) -> String {
    let normalized = name.trim().to_ascii_lowercase().replace(['_', '.'], "-");
    let mut collapsed = String::with_capacity(normalized.len());
    for ch in normalized.chars() {
        if ch == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(ch);
    }
    collapsed
}

/// Canonical bare name of a package spec.
///
/// Strips quotes, a `channel::` prefix, version constraints, environment
/// markers and extras.
pub fn dependency_name(spec: &str) -> String {
    let trimmed = strip_wrapping_quotes(spec.trim());
    let unchanneled = trimmed.rsplit("::").next().unwrap_or(trimmed);
    let end = unchanneled
        .find(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '=' | '!' | '~' | ';'))
        .unwrap_or(unchanneled.len());
    let head = &unchanneled[..end];
    let base = head.split('[').next().unwrap_or(head);
    canonicalize_package_name(base)
}

fn strip_wrapping_quotes(input: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = input
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    input
}

/// Declared name → installed names that also satisfy it.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl AliasTable {
    pub fn new(raw: &BTreeMap<String, Vec<String>>) -> Self {
        let entries = raw
            .iter()
            .map(|(declared, accepted)| {
                (
                    canonicalize_package_name(declared),
                    accepted.iter().map(|a| canonicalize_package_name(a)).collect(),
                )
            })
            .collect();
        Self { entries }
    }

    /// Whether `spec` is satisfied by the canonical `installed` set.
    pub fn is_satisfied(&self, spec: &str, installed: &BTreeSet<String>) -> bool {
        let name = dependency_name(spec);
        installed.contains(&name)
            || self
                .entries
                .get(&name)
                .is_some_and(|accepted| accepted.iter().any(|a| installed.contains(a)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
