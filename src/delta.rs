//! Config tree diffing.
//!
//! Computes the set of added, modified and deleted fields between two
//! configuration trees, keyed by dotted path (e.g. `editor.fontSize`).
//! Deletions are an explicit path set, never `null` markers, so "removed"
//! stays distinguishable from "set to empty". Objects are recursed into;
//! arrays and scalars are leaves and change as a whole.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The difference between two configuration trees.
///
/// Guarantees `apply_delta(old, &compute_delta(old, new)) == new` for any
/// pair of trees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDelta {
    /// Paths present in `new` but not in `old`, with their values.
    pub added: BTreeMap<String, Value>,
    /// Paths present in both with differing values, with the new value.
    pub modified: BTreeMap<String, Value>,
    /// Paths present in `old` but not in `new`.
    pub deleted: BTreeSet<String>,
}

impl ConfigDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Number of changed paths.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// Every path this delta touches, sorted.
    pub fn changed_paths(&self) -> Vec<String> {
        let mut paths: BTreeSet<String> = BTreeSet::new();
        paths.extend(self.added.keys().cloned());
        paths.extend(self.modified.keys().cloned());
        paths.extend(self.deleted.iter().cloned());
        paths.into_iter().collect()
    }
}

/// Compute the delta that transforms `old` into `new`.
pub fn compute_delta(old: &Value, new: &Value) -> ConfigDelta {
    let mut delta = ConfigDelta::default();
    diff_recursive(old, new, "", &mut delta);
    delta
}

fn diff_recursive(old: &Value, new: &Value, path: &str, delta: &mut ConfigDelta) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    delta.deleted.insert(paths::join(path, key));
                }
            }

            for (key, new_val) in new_map {
                let full_path = paths::join(path, key);
                match old_map.get(key) {
                    Some(old_val) if old_val == new_val => {}
                    Some(old_val) => {
                        if old_val.is_object() && new_val.is_object() {
                            diff_recursive(old_val, new_val, &full_path, delta);
                        } else {
                            delta.modified.insert(full_path, new_val.clone());
                        }
                    }
                    None => {
                        delta.added.insert(full_path, new_val.clone());
                    }
                }
            }
        }
        // Non-object root (or type change at the root): whole-tree
        // replacement, recorded at the empty path.
        _ => {
            if old != new {
                delta.modified.insert(path.to_string(), new.clone());
            }
        }
    }
}

/// Apply a delta to a base tree, producing the patched tree.
pub fn apply_delta(base: &Value, delta: &ConfigDelta) -> Result<Value, DeltaError> {
    let mut doc = base.clone();
    for path in &delta.deleted {
        paths::remove(&mut doc, path)?;
    }
    for (path, value) in &delta.added {
        paths::set(&mut doc, path, value.clone())?;
    }
    for (path, value) in &delta.modified {
        paths::set(&mut doc, path, value.clone())?;
    }
    Ok(doc)
}

/// Error types for delta application
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaError {
    PathNotFound(String),
    NotAnObject(String),
}

impl std::fmt::Display for DeltaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeltaError::PathNotFound(path) => write!(f, "Path '{}' not found", path),
            DeltaError::NotAnObject(path) => {
                write!(f, "Path '{}' traverses a non-object value", path)
            }
        }
    }
}

impl std::error::Error for DeltaError {}

impl From<DeltaError> for crate::error::SyncError {
    fn from(err: DeltaError) -> Self {
        crate::error::SyncError::InvalidPayload(err.to_string())
    }
}

/// Dotted-path navigation over configuration trees.
///
/// The empty path addresses the root. Field names must not contain `.`;
/// snapshot validation rejects trees that would be unaddressable.
pub mod paths {
    use super::{DeltaError, Value};

    pub(super) fn join(prefix: &str, key: &str) -> String {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        }
    }

    /// Whether two paths address the same subtree or one contains the
    /// other. Segment-aware: `a.b` overlaps `a.b.c` but not `a.bc`.
    pub fn overlaps(a: &str, b: &str) -> bool {
        if a == b || a.is_empty() || b.is_empty() {
            return true;
        }
        b.starts_with(&format!("{}.", a)) || a.starts_with(&format!("{}.", b))
    }

    /// Whether `ancestor` strictly contains `path`.
    pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
        if ancestor.is_empty() {
            return !path.is_empty();
        }
        path.starts_with(&format!("{}.", ancestor))
    }

    /// Look up the value at a dotted path, if present.
    pub fn get<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
        if path.is_empty() {
            return Some(doc);
        }
        let mut current = doc;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Set the value at a dotted path, creating intermediate objects as
    /// needed. The empty path replaces the root.
    pub fn set(doc: &mut Value, path: &str, value: Value) -> Result<(), DeltaError> {
        if path.is_empty() {
            *doc = value;
            return Ok(());
        }

        let segments: Vec<&str> = path.split('.').collect();
        let mut current = doc;
        for segment in &segments[..segments.len() - 1] {
            let map = current
                .as_object_mut()
                .ok_or_else(|| DeltaError::NotAnObject(path.to_string()))?;
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }

        let last = segments[segments.len() - 1];
        current
            .as_object_mut()
            .ok_or_else(|| DeltaError::NotAnObject(path.to_string()))?
            .insert(last.to_string(), value);
        Ok(())
    }

    /// Remove the value at a dotted path, returning it.
    pub fn remove(doc: &mut Value, path: &str) -> Result<Value, DeltaError> {
        if path.is_empty() {
            return Err(DeltaError::PathNotFound(path.to_string()));
        }

        let segments: Vec<&str> = path.split('.').collect();
        let mut current = doc;
        for segment in &segments[..segments.len() - 1] {
            current = current
                .as_object_mut()
                .ok_or_else(|| DeltaError::NotAnObject(path.to_string()))?
                .get_mut(*segment)
                .ok_or_else(|| DeltaError::PathNotFound(path.to_string()))?;
        }

        let last = segments[segments.len() - 1];
        current
            .as_object_mut()
            .ok_or_else(|| DeltaError::NotAnObject(path.to_string()))?
            .remove(last)
            .ok_or_else(|| DeltaError::PathNotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compute_delta_added_field() {
        let old = json!({"editor": {"theme": "dark"}});
        let new = json!({"editor": {"theme": "dark", "fontSize": 14}});

        let delta = compute_delta(&old, &new);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.added.get("editor.fontSize"), Some(&json!(14)));
    }

    #[test]
    fn test_compute_delta_deleted_field() {
        let old = json!({"editor": {"theme": "dark", "fontSize": 14}});
        let new = json!({"editor": {"theme": "dark"}});

        let delta = compute_delta(&old, &new);
        assert_eq!(delta.len(), 1);
        assert!(delta.deleted.contains("editor.fontSize"));
    }

    #[test]
    fn test_compute_delta_modified_field() {
        let old = json!({"editor": {"fontSize": 14}});
        let new = json!({"editor": {"fontSize": 16}});

        let delta = compute_delta(&old, &new);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.modified.get("editor.fontSize"), Some(&json!(16)));
    }

    #[test]
    fn test_deletion_is_not_null() {
        let deleted = json!({"a": 1});
        let nulled = json!({"a": 1, "b": null});
        let base = json!({"a": 1, "b": 2});

        let delta_deleted = compute_delta(&base, &deleted);
        assert!(delta_deleted.deleted.contains("b"));
        assert!(delta_deleted.modified.is_empty());

        let delta_nulled = compute_delta(&base, &nulled);
        assert!(delta_nulled.deleted.is_empty());
        assert_eq!(delta_nulled.modified.get("b"), Some(&json!(null)));
    }

    #[test]
    fn test_equal_trees_give_empty_delta() {
        let doc = json!({"a": {"b": [1, 2, 3]}, "c": "x"});
        let delta = compute_delta(&doc, &doc.clone());
        assert!(delta.is_empty());
        assert!(delta.changed_paths().is_empty());
    }

    #[test]
    fn test_arrays_change_as_leaves() {
        let old = json!({"servers": ["a", "b"]});
        let new = json!({"servers": ["a", "b", "c"]});

        let delta = compute_delta(&old, &new);
        assert_eq!(delta.modified.get("servers"), Some(&json!(["a", "b", "c"])));
        assert!(delta.added.is_empty());
    }

    #[test]
    fn test_type_change_is_modification() {
        let old = json!({"proxy": {"host": "localhost"}});
        let new = json!({"proxy": "disabled"});

        let delta = compute_delta(&old, &new);
        assert_eq!(delta.modified.get("proxy"), Some(&json!("disabled")));
    }

    #[test]
    fn test_round_trip_law() {
        let old = json!({
            "editor": {"theme": "dark", "fontSize": 14, "rulers": [80, 120]},
            "terminal": {"shell": "/bin/zsh"},
            "telemetry": true
        });
        let new = json!({
            "editor": {"theme": "light", "fontSize": 14, "ligatures": true},
            "terminal": {"shell": "/bin/zsh", "cursor": "block"},
            "keybindings": {"copy": "ctrl+c"}
        });

        let delta = compute_delta(&old, &new);
        let patched = apply_delta(&old, &delta).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_round_trip_with_root_type_change() {
        let old = json!({"a": 1});
        let new = json!(42);

        let delta = compute_delta(&old, &new);
        let patched = apply_delta(&old, &delta).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_apply_creates_intermediate_objects() {
        let base = json!({});
        let mut delta = ConfigDelta::default();
        delta
            .added
            .insert("a.b.c".to_string(), json!("deep"));

        let patched = apply_delta(&base, &delta).unwrap();
        assert_eq!(patched, json!({"a": {"b": {"c": "deep"}}}));
    }

    #[test]
    fn test_apply_delete_missing_path_errors() {
        let base = json!({"a": 1});
        let mut delta = ConfigDelta::default();
        delta.deleted.insert("b".to_string());

        let err = apply_delta(&base, &delta).unwrap_err();
        assert_eq!(err, DeltaError::PathNotFound("b".to_string()));
    }

    #[test]
    fn test_apply_through_scalar_errors() {
        let base = json!({"a": 5});
        let mut delta = ConfigDelta::default();
        delta.added.insert("a.b".to_string(), json!(1));

        let err = apply_delta(&base, &delta).unwrap_err();
        assert_eq!(err, DeltaError::NotAnObject("a.b".to_string()));
    }

    #[test]
    fn test_changed_paths_sorted_and_deduped() {
        let old = json!({"b": 1, "a": {"x": 1}, "c": 3});
        let new = json!({"b": 2, "a": {"y": 1}, "d": 4});

        let delta = compute_delta(&old, &new);
        assert_eq!(
            delta.changed_paths(),
            vec!["a.x", "a.y", "b", "c", "d"]
        );
    }

    #[test]
    fn test_path_overlap_rules() {
        assert!(paths::overlaps("a.b", "a.b"));
        assert!(paths::overlaps("a.b", "a.b.c"));
        assert!(paths::overlaps("a.b.c", "a.b"));
        assert!(!paths::overlaps("a.b", "a.bc"));
        assert!(!paths::overlaps("a.b", "a.c"));
        assert!(paths::overlaps("", "a.b"));

        assert!(paths::is_ancestor("a", "a.b"));
        assert!(!paths::is_ancestor("a.b", "a.b"));
        assert!(!paths::is_ancestor("a.b", "a.bc"));
    }

    #[test]
    fn test_get_path() {
        let doc = json!({"a": {"b": {"c": 7}}});
        assert_eq!(paths::get(&doc, "a.b.c"), Some(&json!(7)));
        assert_eq!(paths::get(&doc, "a.b"), Some(&json!({"c": 7})));
        assert_eq!(paths::get(&doc, ""), Some(&doc));
        assert_eq!(paths::get(&doc, "a.x"), None);
    }
}
