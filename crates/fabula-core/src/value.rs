//! Path-addressed access into the world-state tree.
//!
//! The world state is an arbitrarily nested `serde_json::Value` tree
//! addressed by dotted paths (`"characters.elara.location"`). This module
//! owns path parsing, reads, the write classification rules (create /
//! update / delete), and the canonical checksum used by snapshots and the
//! persistence file.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::WorldError;

/// How a path-addressed write changed the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// Split a dotted path into segments, rejecting empty paths and segments.
pub fn parse_path(path: &str) -> Result<Vec<&str>, WorldError> {
    if path.is_empty() {
        return Err(WorldError::InvalidPath {
            path: path.to_string(),
            reason: "path is empty".to_string(),
        });
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(WorldError::InvalidPath {
            path: path.to_string(),
            reason: "path contains an empty segment".to_string(),
        });
    }
    Ok(segments)
}

/// Look up the value at `path`, if present.
pub fn get_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path).ok()?;
    let (last, intermediate) = segments.split_last()?;
    let mut current = root;
    for segment in intermediate {
        current = current.get(*segment)?.as_object()?;
    }
    current.get(*last)
}

/// Write `value` at `path`, returning the change kind and displaced value.
///
/// Classification: absent terminal key means create, a `Null` new value
/// means delete, anything else is an update. Deleting an absent key is a
/// no-op and returns `None`.
///
/// A missing or wrong-typed intermediate segment is replaced by an empty
/// map. That destructively discards whatever was there; callers rely on
/// this overwrite rule, so it must not be "fixed" to error instead.
pub fn set_path(
    root: &mut Map<String, Value>,
    path: &str,
    value: Value,
) -> Result<Option<(ChangeKind, Option<Value>)>, WorldError> {
    let segments = parse_path(path)?;
    let (last, intermediate) = segments
        .split_last()
        .expect("parse_path guarantees at least one segment");

    let mut current = root;
    for segment in intermediate {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot
            .as_object_mut()
            .expect("slot was just coerced to an object");
    }

    if value.is_null() {
        return Ok(current
            .remove(*last)
            .map(|old| (ChangeKind::Delete, Some(old))));
    }

    match current.insert(last.to_string(), value) {
        Some(old) => Ok(Some((ChangeKind::Update, Some(old)))),
        None => Ok(Some((ChangeKind::Create, None))),
    }
}

/// SHA-256 hex digest over a key-sorted serialization of `value`.
///
/// Map entries are hashed in sorted key order so the result is stable
/// regardless of insertion order.
pub fn canonical_checksum(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_value(value, &mut hasher);
    hex_digest(hasher)
}

fn hash_value(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update([*b as u8]);
        }
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(s.len().to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"a");
            hasher.update(items.len().to_le_bytes());
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Object(map) => {
            hasher.update(b"m");
            hasher.update(map.len().to_le_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update(key.len().to_le_bytes());
                hasher.update(key.as_bytes());
                hash_value(&map[key], hasher);
            }
        }
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn parse_rejects_empty_paths() {
        assert!(parse_path("").is_err());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path(".a").is_err());
        assert_eq!(parse_path("a.b.c").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn set_creates_nested_path() {
        let mut root = Map::new();
        let change = set_path(&mut root, "a.b.c", json!(1)).unwrap().unwrap();
        assert_eq!(change, (ChangeKind::Create, None));
        assert_eq!(get_path(&root, "a.b.c"), Some(&json!(1)));
    }

    #[test]
    fn set_null_deletes_and_absent_delete_is_noop() {
        let mut root = tree(json!({"a": {"b": {"c": 1}}}));
        let change = set_path(&mut root, "a.b.c", Value::Null).unwrap().unwrap();
        assert_eq!(change, (ChangeKind::Delete, Some(json!(1))));
        assert_eq!(get_path(&root, "a.b.c"), None);

        assert!(set_path(&mut root, "a.b.c", Value::Null).unwrap().is_none());
    }

    #[test]
    fn set_overwrites_wrong_typed_intermediate() {
        let mut root = tree(json!({"a": 7}));
        let change = set_path(&mut root, "a.b", json!("x")).unwrap().unwrap();
        assert_eq!(change, (ChangeKind::Create, None));
        // The scalar at "a" was destructively replaced by a map.
        assert_eq!(get_path(&root, "a.b"), Some(&json!("x")));
    }

    #[test]
    fn update_returns_old_value() {
        let mut root = tree(json!({"k": "old"}));
        let change = set_path(&mut root, "k", json!("new")).unwrap().unwrap();
        assert_eq!(change, (ChangeKind::Update, Some(json!("old"))));
    }

    #[test]
    fn checksum_is_insertion_order_independent() {
        let a = json!({"x": 1, "y": {"p": true, "q": [1, 2]}});
        let mut map = Map::new();
        map.insert(
            "y".to_string(),
            json!({"q": [1, 2], "p": true}),
        );
        map.insert("x".to_string(), json!(1));
        let b = Value::Object(map);
        assert_eq!(canonical_checksum(&a), canonical_checksum(&b));
    }

    #[test]
    fn checksum_differs_on_content_change() {
        let a = json!({"x": 1});
        let b = json!({"x": 2});
        assert_ne!(canonical_checksum(&a), canonical_checksum(&b));
    }
}
