//! # Configuration Precedence
//!
//! Merges configuration sources into one mapping with tier-based precedence
//! and per-key merge strategies.
//!
//! # Precedence Order (lowest first)
//! 1. `default`
//! 2. `template`
//! 3. `preset`
//! 4. `environment`
//! 5. `override`
//! 6. `env_var`
//! 7. `restored`
//! 8. `runtime` (highest priority)
//!
//! Within one tier, sources merge in name order. A `restored` source is a
//! complete configuration pinned by a rollback: it replaces everything
//! merged below it instead of merging into it.

use errors::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Priority tier of a configuration source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Default,
    Template,
    Preset,
    Environment,
    Override,
    EnvVar,
    Restored,
    Runtime
}

impl SourceTier {
    pub const ALL: [SourceTier; 8] = [
        SourceTier::Default,
        SourceTier::Template,
        SourceTier::Preset,
        SourceTier::Environment,
        SourceTier::Override,
        SourceTier::EnvVar,
        SourceTier::Restored,
        SourceTier::Runtime,
    ];

    pub fn priority(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Template => "template",
            Self::Preset => "preset",
            Self::Environment => "environment",
            Self::Override => "override",
            Self::EnvVar => "env_var",
            Self::Restored => "restored",
            Self::Runtime => "runtime"
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceTier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| format!("unknown source tier: {s}"))
    }
}

/// One parsed configuration source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSource {
    pub name: String,
    pub tier: SourceTier,
    pub mapping: Map<String, Value>,
    pub path: Option<PathBuf>
}

impl ConfigSource {
    pub fn new(name: impl Into<String>, tier: SourceTier, mapping: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            tier,
            mapping,
            path: None
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Names listed under the top-level `extends` key.
    pub fn extends(&self) -> Vec<String> {
        match self.mapping.get("extends") {
            Some(Value::String(name)) => vec![name.clone()],
            Some(Value::Array(names)) => names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new()
        }
    }

    /// Value at a dotted key path inside this source.
    pub fn lookup(&self, key_path: &str) -> Option<&Value> {
        let (head, rest) = match key_path.split_once('.') {
            Some((head, rest)) => (head, rest),
            None => (key_path, "")
        };
        utils::lookup(self.mapping.get(head)?, rest)
    }
}

/// How two values at the same key combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Recursive mapping merge; lists concatenate.
    Merge,
    /// Later value replaces the earlier one wholesale.
    #[default]
    Override,
    /// Lists concatenate; a scalar is pushed onto a list.
    Append,
    /// Lists concatenate, keeping the first occurrence of each element.
    Unique
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Self::Merge),
            "override" => Ok(Self::Override),
            "append" => Ok(Self::Append),
            "unique" => Ok(Self::Unique),
            other => Err(format!("unknown merge strategy: {other}"))
        }
    }
}

const MERGED_SECTIONS: [&str; 11] = [
    "system",
    "database",
    "redis",
    "api",
    "ai_service",
    "document_processor",
    "web_crawler",
    "logging",
    "monitoring",
    "security",
    "storage",
];

const UNIQUE_LISTS: [&str; 5] = [
    "api.cors_origins",
    "api.cors_methods",
    "api.cors_headers",
    "document_processor.supported_formats",
    "storage.allowed_extensions",
];

/// Pattern → strategy rules.
///
/// A pattern ending in `*` matches every path starting with the text before
/// the star. Any other pattern matches that exact path and its subtree
/// (`api` covers `api.host`). The longest matching pattern wins; on equal
/// length an exact pattern beats a prefix one. Unmatched paths use
/// [`MergeStrategy::Override`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyTable {
    rules: BTreeMap<String, MergeStrategy>
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for section in MERGED_SECTIONS {
            table.set(section, MergeStrategy::Merge);
        }
        for list in UNIQUE_LISTS {
            table.set(list, MergeStrategy::Unique);
        }
        table
    }

    pub fn set(&mut self, pattern: impl Into<String>, strategy: MergeStrategy) -> &mut Self {
        self.rules.insert(pattern.into(), strategy);
        self
    }

    pub fn rules(&self) -> impl Iterator<Item = (&str, MergeStrategy)> {
        self.rules.iter().map(|(p, s)| (p.as_str(), *s))
    }

    /// Most specific rule matching `path`, if any.
    pub fn resolve(&self, path: &str) -> Option<MergeStrategy> {
        self.rules
            .iter()
            .filter_map(|(pattern, strategy)| {
                specificity(pattern, path).map(|rank| (rank, *strategy))
            })
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, strategy)| strategy)
    }

    pub fn strategy_for(&self, path: &str) -> MergeStrategy {
        self.resolve(path).unwrap_or_default()
    }
}

fn specificity(pattern: &str, path: &str) -> Option<(usize, u8)> {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.starts_with(prefix).then_some((prefix.len(), 0));
    }
    let subtree = path
        .strip_prefix(pattern)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'));
    subtree.then_some((pattern.len(), 1))
}

/// Top-level keys that describe a source rather than configure the system.
fn is_metadata_key(key: &str) -> bool {
    key.starts_with('_') || key == "extends"
}

/// Merge sources in ascending (tier, name) order.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Produces the merged configuration from every source. The result depends
/// only on the sources and the strategy table, so merging the same inputs
/// twice yields identical output.
///
/// ## Usage
/// ```rust
/// use config::precedence::{ConfigSource, SourceTier, StrategyTable, merge_sources};
/// use serde_json::json;
///
/// let base = json!({"system": {"name": "x", "debug": false}});
/// let dev = json!({"system": {"debug": true}});
/// let sources = vec![
///     ConfigSource::new("default", SourceTier::Default, base.as_object().cloned().unwrap()),
///     ConfigSource::new("development", SourceTier::Environment, dev.as_object().cloned().unwrap()),
/// ];
/// let merged = merge_sources(&sources, &StrategyTable::with_defaults()).unwrap();
/// assert_eq!(merged["system"]["debug"], json!(true));
/// assert_eq!(merged["system"]["name"], json!("x"));
/// ```
///
/// ## Error Handling
/// Returns `ConfigError::Merge` when a strategy cannot combine the two
/// values it is given (a `unique` list receiving a non-list).
pub fn merge_sources(sources: &[ConfigSource], table: &StrategyTable) -> ConfigResult<Value> {
    let mut ordered: Vec<&ConfigSource> = sources.iter().collect();
    ordered.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));

    let mut merged = Map::new();
    for source in ordered {
        if source.tier == SourceTier::Restored {
            merged = source
                .mapping
                .iter()
                .filter(|(key, _)| !is_metadata_key(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            tracing::debug!(source = %source.name, "restored snapshot replaces lower tiers");
            continue;
        }
        let mut changes = Vec::new();
        for (key, value) in &source.mapping {
            if is_metadata_key(key) {
                continue;
            }
            let before = merged.get(key).cloned();
            merge_entry(&mut merged, key, value, key, table)?;
            if before.as_ref() != merged.get(key) {
                changes.push(key.as_str());
            }
        }
        tracing::debug!(
            source = %source.name,
            tier = %source.tier,
            ?changes,
            "Configuration from {}",
            source.name
        );
    }
    Ok(Value::Object(merged))
}

fn merge_entry(
    target: &mut Map<String, Value>,
    key: &str,
    incoming: &Value,
    path: &str,
    table: &StrategyTable
) -> ConfigResult<()> {
    let combined = match target.remove(key) {
        None => incoming.clone(),
        Some(existing) => combine(existing, incoming, path, table.strategy_for(path), table)?
    };
    target.insert(key.to_string(), combined);
    Ok(())
}

fn combine(
    existing: Value,
    incoming: &Value,
    path: &str,
    strategy: MergeStrategy,
    table: &StrategyTable
) -> ConfigResult<Value> {
    match (strategy, existing, incoming) {
        (MergeStrategy::Override, _, value) => Ok(value.clone()),

        (MergeStrategy::Merge, Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_entry(&mut base, key, value, &format!("{path}.{key}"), table)?;
            }
            Ok(Value::Object(base))
        }
        (MergeStrategy::Merge | MergeStrategy::Append, Value::Array(mut base), Value::Array(extra)) => {
            base.extend(extra.iter().cloned());
            Ok(Value::Array(base))
        }
        (MergeStrategy::Append, Value::Array(mut base), value) => {
            base.push(value.clone());
            Ok(Value::Array(base))
        }

        (MergeStrategy::Unique, Value::Array(base), Value::Array(extra)) => {
            Ok(Value::Array(dedupe(base.into_iter().chain(extra.iter().cloned()))))
        }
        (MergeStrategy::Unique, Value::Array(_), value) => Err(ConfigError::Merge {
            key: path.to_string(),
            reason: format!("unique strategy expects a list, got {}", type_name(value))
        }),

        (_, _, value) => Ok(value.clone())
    }
}

fn dedupe(items: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    items
        .filter(|item| seen.insert(utils::canonical_json(item)))
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping"
    }
}

/// Highest-priority source that defines `key_path`. Sources masked by a
/// `restored` snapshot never count.
pub fn source_of<'a>(sources: &'a [ConfigSource], key_path: &str) -> Option<&'a ConfigSource> {
    let floor = if sources.iter().any(|s| s.tier == SourceTier::Restored) {
        SourceTier::Restored
    } else {
        SourceTier::Default
    };
    sources
        .iter()
        .filter(|source| source.tier >= floor && source.lookup(key_path).is_some())
        .max_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)))
}
