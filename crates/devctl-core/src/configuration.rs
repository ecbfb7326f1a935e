//! Named configuration tables.
//!
//! A configuration is a preset: `{idx, name, value}` where `value` is a single
//! number for a Motion Device and an axis-to-number map for a Composite
//! Device. Lookups by position scan the table in order and return the first
//! entry inside the tolerance window, so with overlapping windows the earlier
//! entry wins even when a later one is closer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::str::FromStr;

/// Default match tolerance for reverse lookups, in logical units.
pub const DEFAULT_TOLERANCE: f64 = 0.1;

/// Name reported when no entry matches.
pub const UNKNOWN_CONFIGURATION: &str = "Unknown";

/// One preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationEntry<V> {
    /// Stable index, unique within the table.
    pub idx: u32,
    /// Display name, matched case-insensitively.
    pub name: String,
    /// Position (or per-axis positions) of the preset.
    pub value: V,
}

impl<V> ConfigurationEntry<V> {
    /// Entry `idx` named `name` at `value`.
    pub fn new(idx: u32, name: impl Into<String>, value: V) -> Self {
        Self {
            idx,
            name: name.into(),
            value,
        }
    }
}

/// Preset of a composite device: logical position per axis.
pub type JointValue = BTreeMap<String, f64>;

/// How a caller names a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSelector {
    /// Exact `idx`.
    Index(u32),
    /// Case-insensitive `name`.
    Name(String),
}

impl FromStr for ConfigSelector {
    type Err = Infallible;

    /// All-digit strings select by index, anything else by name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(idx) = trimmed.parse::<u32>() {
                return Ok(ConfigSelector::Index(idx));
            }
        }
        Ok(ConfigSelector::Name(trimmed.to_string()))
    }
}

impl From<u32> for ConfigSelector {
    fn from(idx: u32) -> Self {
        ConfigSelector::Index(idx)
    }
}

impl From<&str> for ConfigSelector {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(selector) => selector,
            Err(never) => match never {},
        }
    }
}

impl std::fmt::Display for ConfigSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSelector::Index(idx) => write!(f, "index {}", idx),
            ConfigSelector::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// Result of a reverse lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationMatch {
    /// `None` when nothing matched.
    pub idx: Option<u32>,
    /// Entry name, or `Unknown`.
    pub name: String,
}

impl ConfigurationMatch {
    /// Match for a position outside every preset.
    pub fn unknown() -> Self {
        Self {
            idx: None,
            name: UNKNOWN_CONFIGURATION.to_string(),
        }
    }

    /// Whether a preset matched.
    pub fn is_known(&self) -> bool {
        self.idx.is_some()
    }
}

impl<V> From<&ConfigurationEntry<V>> for ConfigurationMatch {
    fn from(entry: &ConfigurationEntry<V>) -> Self {
        Self {
            idx: Some(entry.idx),
            name: entry.name.clone(),
        }
    }
}

impl std::fmt::Display for ConfigurationMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.idx {
            Some(idx) => write!(f, "{}: {}", idx, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Entry selected by `selector`, first in table order.
pub fn find_entry<'a, V>(
    entries: &'a [ConfigurationEntry<V>],
    selector: &ConfigSelector,
) -> Option<&'a ConfigurationEntry<V>> {
    match selector {
        ConfigSelector::Index(idx) => entries.iter().find(|e| e.idx == *idx),
        ConfigSelector::Name(name) => {
            let wanted = name.to_lowercase();
            entries.iter().find(|e| e.name.to_lowercase() == wanted)
        }
    }
}

/// First scalar entry within `tolerance` of `position`.
pub fn match_scalar(entries: &[ConfigurationEntry<f64>], position: f64, tolerance: f64) -> ConfigurationMatch {
    entries
        .iter()
        .find(|e| (e.value - position).abs() <= tolerance)
        .map(ConfigurationMatch::from)
        .unwrap_or_else(ConfigurationMatch::unknown)
}

/// First joint entry whose every listed axis is within `tolerance`.
///
/// Axes missing from `positions` never match. An entry listing no axes never
/// matches.
pub fn match_joint(
    entries: &[ConfigurationEntry<JointValue>],
    positions: &BTreeMap<String, f64>,
    tolerance: f64,
) -> ConfigurationMatch {
    entries
        .iter()
        .find(|e| {
            !e.value.is_empty()
                && e.value.iter().all(|(axis, value)| {
                    positions
                        .get(axis)
                        .is_some_and(|position| (value - position).abs() <= tolerance)
                })
        })
        .map(ConfigurationMatch::from)
        .unwrap_or_else(ConfigurationMatch::unknown)
}

/// Stable sort by `idx`.
pub fn sort_entries<V>(entries: &mut [ConfigurationEntry<V>]) {
    entries.sort_by_key(|e| e.idx);
}

/// Why [`upsert_entry`] refused to change the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertError {
    /// No index given and the position matches no entry.
    UnknownConfiguration,
    /// A new entry needs a non-empty name.
    NameRequired(u32),
}

impl std::fmt::Display for UpsertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpsertError::UnknownConfiguration => f.write_str("cannot save to an unknown configuration"),
            UpsertError::NameRequired(idx) => {
                write!(f, "a name is required to create configuration {}", idx)
            }
        }
    }
}

/// Update or append the entry at `index` (or at `inferred` when `index` is
/// `None`) and re-sort the table. Returns the index written.
pub fn upsert_entry<V>(
    entries: &mut Vec<ConfigurationEntry<V>>,
    index: Option<u32>,
    inferred: Option<u32>,
    name: Option<&str>,
    value: V,
) -> Result<u32, UpsertError> {
    let idx = index.or(inferred).ok_or(UpsertError::UnknownConfiguration)?;
    let name = name.map(str::trim).filter(|n| !n.is_empty());

    match entries.iter_mut().find(|e| e.idx == idx) {
        Some(entry) => {
            entry.value = value;
            if let Some(name) = name {
                entry.name = name.to_string();
            }
        }
        None => {
            let name = name.ok_or(UpsertError::NameRequired(idx))?;
            entries.push(ConfigurationEntry::new(idx, name, value));
        }
    }

    sort_entries(entries);
    Ok(idx)
}
