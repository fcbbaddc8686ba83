//! Top-level structural diff between two configurations.

use serde::Serialize;
use serde_json::Value;

/// Top-level keys grouped by how they differ between two mappings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: Vec<String>
}

impl ConfigDiff {
    /// Non-mapping values are treated as empty mappings.
    pub fn between(old: &Value, new: &Value) -> Self {
        let empty = serde_json::Map::new();
        let old = old.as_object().unwrap_or(&empty);
        let new = new.as_object().unwrap_or(&empty);

        let mut diff = Self::default();
        for (key, value) in new {
            match old.get(key) {
                None => diff.added.push(key.clone()),
                Some(previous) if previous == value => diff.unchanged.push(key.clone()),
                Some(_) => diff.modified.push(key.clone())
            }
        }
        diff.removed = old
            .keys()
            .filter(|key| !new.contains_key(*key))
            .cloned()
            .collect();
        diff
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty())
    }

    /// Added, removed and modified keys, sorted.
    pub fn changed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .added
            .iter()
            .chain(&self.removed)
            .chain(&self.modified)
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
