//! Flat key→value view of a JSON payload used by rule evaluation.
//!
//! Objects recurse with `.`-joined keys, arrays produce an aggregate entry
//! at the array path plus one `path[i]` entry per element, scalars land at
//! their path. The mapping is deterministic for equivalent inputs.

use std::collections::BTreeMap;

use serde_json::Value;

/// Flatten a JSON value into dotted-path keys.
///
/// Non-object inputs (including `null`) produce an empty mapping.
#[must_use]
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Value::Object(map) = value {
        for (key, child) in map {
            flatten_into(key.clone(), child, &mut out);
        }
    }
    out
}

fn flatten_into(path: String, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            if map.is_empty() {
                out.insert(path, value.clone());
                return;
            }
            for (key, child) in map {
                flatten_into(format!("{path}.{key}"), child, out);
            }
        }
        Value::Array(items) => {
            // Aggregate entry lets rules compare whole arrays; indexed
            // entries let them address elements.
            out.insert(path.clone(), value.clone());
            for (i, item) in items.iter().enumerate() {
                flatten_into(format!("{path}[{i}]"), item, out);
            }
        }
        _ => {
            out.insert(path, value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn scalars_and_nesting() {
        let flat = flatten(&json!({
            "action": "opened",
            "pull_request": {"draft": false, "number": 7},
        }));
        assert_eq!(flat["action"], json!("opened"));
        assert_eq!(flat["pull_request.draft"], json!(false));
        assert_eq!(flat["pull_request.number"], json!(7));
    }

    #[test]
    fn arrays_get_aggregate_and_indexed_entries() {
        let flat = flatten(&json!({
            "labels": [{"name": "bug"}, {"name": "p1"}],
            "ids": [1, 2, 3],
        }));
        assert_eq!(flat["labels"], json!([{"name": "bug"}, {"name": "p1"}]));
        assert_eq!(flat["labels[0].name"], json!("bug"));
        assert_eq!(flat["labels[1].name"], json!("p1"));
        assert_eq!(flat["ids"], json!([1, 2, 3]));
        assert_eq!(flat["ids[2]"], json!(3));
    }

    #[test]
    fn empty_or_invalid_object_is_empty() {
        assert!(flatten(&json!({})).is_empty());
        assert!(flatten(&json!(null)).is_empty());
        assert!(flatten(&json!([1, 2])).is_empty());
        assert!(flatten(&json!("scalar")).is_empty());
    }

    #[test]
    fn empty_containers_are_preserved() {
        let flat = flatten(&json!({"meta": {}, "tags": []}));
        assert_eq!(flat["meta"], json!({}));
        assert_eq!(flat["tags"], json!([]));
        assert_eq!(flat.len(), 2);
    }

    #[test]
    fn flattening_is_deterministic() {
        let payload = json!({
            "b": {"z": 1, "a": 2},
            "a": [true, {"k": "v"}],
        });
        let first: Vec<String> = flatten(&payload).into_keys().collect();
        let second: Vec<String> = flatten(&payload).into_keys().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn round_trip_against_navigation() {
        // Flattening then reading back a key yields the value the original
        // object navigates to.
        let payload = json!({
            "repository": {"id": 42, "owner": {"login": "octo"}},
            "commits": [{"id": "a"}, {"id": "b"}],
        });
        let flat = flatten(&payload);
        assert_eq!(
            flat["repository.owner.login"],
            payload["repository"]["owner"]["login"]
        );
        assert_eq!(flat["commits[1].id"], payload["commits"][1]["id"]);
    }
}
