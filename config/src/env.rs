//! # Environment Variables
//!
//! `${VAR}` / `${VAR:default}` interpolation over merged configuration and
//! the `env_var` source tier built from prefixed process variables.
//!
//! # Naming Convention
//! With the default prefix `STRATA__`, `STRATA__DATABASE__POOL_SIZE=20`
//! becomes `database.pool_size: 20`. Segments are lower-cased and values are
//! read as YAML scalars, so `true`, `20` and `[a, b]` keep their types.

use crate::precedence::{ConfigSource, SourceTier};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}:]+)(?::([^}]*))?\}").expect("reference pattern is valid")
});

/// Read access to an environment.
pub trait EnvLookup: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    /// All `(name, value)` pairs whose name starts with `prefix`, sorted.
    fn with_prefix(&self, prefix: &str) -> Vec<(String, String)>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let mut vars: Vec<_> = std::env::vars().filter(|(k, _)| k.starts_with(prefix)).collect();
        vars.sort();
        vars
    }
}

impl EnvLookup for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }

    fn with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let mut vars: Vec<_> = self
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.sort();
        vars
    }
}

/// Substitutes every reference in `text`. Unset variables without a default
/// stay in place.
pub fn interpolate_str(text: &str, env: &dyn EnvLookup) -> String {
    REFERENCE
        .replace_all(text, |caps: &Captures<'_>| {
            let name = caps[1].trim();
            env.get(name)
                .or_else(|| caps.get(2).map(|d| d.as_str().to_string()))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Interpolates every string in `value` in place. Results are always
/// strings, even when the whole string is one reference: `"${PORT}"` with
/// `PORT=5432` stays `"5432"`.
pub fn interpolate(value: &mut Value, env: &dyn EnvLookup) {
    match value {
        Value::String(text) if text.contains("${") => {
            *text = interpolate_str(text, env);
        }
        Value::Array(items) => items.iter_mut().for_each(|item| interpolate(item, env)),
        Value::Object(map) => map.values_mut().for_each(|item| interpolate(item, env)),
        _ => {}
    }
}

/// Every reference left unresolved, as `(key_path, variable)` pairs.
pub fn unresolved_references(value: &Value) -> Vec<(String, String)> {
    let mut found = Vec::new();
    collect_unresolved(value, "", &mut found);
    found
}

fn collect_unresolved(value: &Value, path: &str, found: &mut Vec<(String, String)>) {
    match value {
        Value::String(text) => {
            for caps in REFERENCE.captures_iter(text) {
                found.push((path.to_string(), caps[1].trim().to_string()));
            }
        }
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                collect_unresolved(item, &format!("{path}[{idx}]"), found);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                collect_unresolved(item, &child, found);
            }
        }
        _ => {}
    }
}

/// Reads `raw` as a YAML scalar or flow list, falling back to a string.
pub fn parse_scalar(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::String(raw.to_string());
    }
    match serde_yaml::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::Array(_))) => v,
        Ok(Value::Null) if matches!(raw.trim(), "null" | "~") => Value::Null,
        _ => Value::String(raw.to_string())
    }
}

/// Builds the `env_var` source from variables starting with `prefix`.
/// Returns `None` when no such variable is set.
pub fn env_source(prefix: &str, env: &dyn EnvLookup) -> Option<ConfigSource> {
    let mut root = Value::Object(Map::new());
    let mut count = 0usize;
    for (name, raw) in env.with_prefix(prefix) {
        let segments: Vec<String> = name[prefix.len()..]
            .split("__")
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
            .collect();
        if segments.is_empty() {
            continue;
        }
        utils::set_path(&mut root, &segments.join("."), parse_scalar(&raw));
        count += 1;
    }
    tracing::debug!(prefix, count, "collected environment overrides");
    match root {
        Value::Object(mapping) if !mapping.is_empty() => {
            Some(ConfigSource::new("env_var", SourceTier::EnvVar, mapping))
        }
        _ => None
    }
}
