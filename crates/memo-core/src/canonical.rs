//! Value canonicalization.
//!
//! Values flowing between stages are JSON: scalars, arrays, and
//! string-keyed maps. The canonical form replaces every bare string that
//! names an existing regular file with a file-record object
//!
//! ```json
//! { "file": "<path as supplied>", "hash": "<hex sha256>" }
//! ```
//!
//! so that a persisted input/output map captures file identity by content,
//! not just by name. The inverse operation projects each record back to a
//! single field: the path (for handing results to user code) or the digest
//! (for cache equality).
//!
//! A file-record is recognized only by the simultaneous presence of
//! exactly the `file` and `hash` string keys; any larger object is an
//! ordinary map and is walked normally.
//!
//! The existence test is a filesystem snapshot at canonicalization time.
//! A string that used to name a file whose target is gone is treated as a
//! plain string again.

use std::path::Path;

use serde_json::{Map, Value};

use crate::digest::digest_file;
use crate::errors::{MemoError, MemoResult};

/// String-keyed JSON map. The default serde_json map is BTreeMap-backed,
/// so serialization emits sorted keys without extra work.
pub type ValueMap = Map<String, Value>;

/// Which field a file-record collapses to under [`project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Replace each file-record with its path string.
    Paths,
    /// Replace each file-record with its content digest.
    Digests,
}

/// Returns the `(path, hash)` fields when `map` is a file-record.
pub fn as_file_record(map: &ValueMap) -> Option<(&str, &str)> {
    if map.len() != 2 {
        return None;
    }
    match (map.get("file"), map.get("hash")) {
        (Some(Value::String(file)), Some(Value::String(hash))) => Some((file, hash)),
        _ => None,
    }
}

fn file_record(path: &str, hash: &str) -> Value {
    let mut map = Map::new();
    map.insert("file".to_string(), Value::String(path.to_string()));
    map.insert("hash".to_string(), Value::String(hash.to_string()));
    Value::Object(map)
}

/// Replace every bare string naming an existing regular file with a
/// file-record, recursively through arrays and maps. Other scalars pass
/// through untouched; values that already are file-records are kept.
pub fn canonicalize(value: &Value) -> MemoResult<Value> {
    match value {
        Value::String(s) if Path::new(s).is_file() => {
            let hash = digest_file(s)?;
            Ok(file_record(s, &hash))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(canonicalize(item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            if as_file_record(map).is_some() {
                return Ok(value.clone());
            }
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), canonicalize(item)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Canonicalize every value of a map, preserving keys.
pub fn canonicalize_map(map: &ValueMap) -> MemoResult<ValueMap> {
    let mut out = Map::new();
    for (key, value) in map {
        out.insert(key.clone(), canonicalize(value)?);
    }
    Ok(out)
}

/// Collapse every file-record in `value` to the requested field, leaving
/// all other values unchanged.
pub fn project(value: &Value, mode: Projection) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| project(v, mode)).collect()),
        Value::Object(map) => {
            if let Some((file, hash)) = as_file_record(map) {
                return match mode {
                    Projection::Paths => Value::String(file.to_string()),
                    Projection::Digests => Value::String(hash.to_string()),
                };
            }
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), project(item, mode));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Project every value of a map, preserving keys.
pub fn project_map(map: &ValueMap, mode: Projection) -> ValueMap {
    let mut out = Map::new();
    for (key, value) in map {
        out.insert(key.clone(), project(value, mode));
    }
    out
}

/// Cache equality between two canonicalized values.
///
/// Two values match when they are equal under the digests-only projection
/// AND under the paths-only projection: replacing an input file with
/// byte-different content at the same path invalidates, and so does moving
/// identical bytes to a different path.
pub fn matches(cached: &Value, current: &Value) -> bool {
    project(cached, Projection::Digests) == project(current, Projection::Digests)
        && project(cached, Projection::Paths) == project(current, Projection::Paths)
}

/// Presentation helper: rewrite bare strings that name existing files to
/// absolute paths. Nested maps are walked; this never touches persisted
/// cache JSON, which stores caller-supplied paths inside file-records.
pub fn rewrite_abspaths(value: &Value) -> Value {
    match value {
        Value::String(s) if Path::new(s).is_file() => match std::fs::canonicalize(s) {
            Ok(abs) => Value::String(abs.to_string_lossy().into_owned()),
            Err(_) => value.clone(),
        },
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), rewrite_abspaths(item));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Pretty-print a map as the persisted cache JSON form (sorted keys).
pub fn to_pretty_json(map: &ValueMap) -> MemoResult<String> {
    serde_json::to_string_pretty(&Value::Object(map.clone()))
        .map_err(|e| MemoError::serialization(format!("failed to encode cache JSON: {e}")))
}
