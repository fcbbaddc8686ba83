//! Dotted key-path access (`"a.b.c"`) over JSON mappings.

use serde_json::{Map, Value};

/// Returns the value at `path`, or `None` when any segment is absent or
/// traverses a non-mapping. An empty path addresses the root.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.')
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

/// Sets `value` at `path`, creating intermediate mappings and replacing any
/// scalar found on the way.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    if path.is_empty() {
        *root = value;
        return;
    }
    let mut node = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Removes and returns the value at `path`.
pub fn remove_path(root: &mut Value, path: &str) -> Option<Value> {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (parent, leaf),
        None => ("", path),
    };
    let mut node = root;
    if !parent.is_empty() {
        for segment in parent.split('.') {
            node = node.as_object_mut()?.get_mut(segment)?;
        }
    }
    node.as_object_mut()?.remove(leaf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested() {
        let cfg = json!({"database": {"pool": {"size": 10}}, "debug": false});
        assert_eq!(lookup(&cfg, "database.pool.size"), Some(&json!(10)));
        assert_eq!(lookup(&cfg, "debug"), Some(&json!(false)));
        assert_eq!(lookup(&cfg, "database.pool.missing"), None);
        assert_eq!(lookup(&cfg, "debug.deeper"), None);
        assert_eq!(lookup(&cfg, ""), Some(&cfg));
    }

    #[test]
    fn test_set_path_creates_parents() {
        let mut cfg = json!({"a": 1});
        set_path(&mut cfg, "b.c.d", json!("x"));
        set_path(&mut cfg, "a.e", json!(true));
        assert_eq!(cfg, json!({"a": {"e": true}, "b": {"c": {"d": "x"}}}));
    }

    #[test]
    fn test_remove_path() {
        let mut cfg = json!({"a": {"b": 1, "c": 2}});
        assert_eq!(remove_path(&mut cfg, "a.b"), Some(json!(1)));
        assert_eq!(remove_path(&mut cfg, "a.zz"), None);
        assert_eq!(remove_path(&mut cfg, "a"), Some(json!({"c": 2})));
        assert_eq!(cfg, json!({}));
    }
}
