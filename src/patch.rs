//! JSON Patch (RFC 6902) application on sprout state.
//!
//! The state a turn produces is always a fresh document: the previous state stays in the
//! history untouched, and a failed patch leaves nothing behind.

use crate::error::{Result, SproutError};
use crate::types::SproutState;
use json_patch::{Patch, PatchOperation};
use serde_json::{json, Value};

/// Applies `patch` to a copy of `state` and returns the copy.
pub fn apply(state: &SproutState, patch: &Patch) -> Result<SproutState> {
    let mut document = state.clone();
    json_patch::patch(&mut document, &patch.0)?;
    Ok(document)
}

/// Computes the patch that turns `apply(state, patch)` back into `state`.
///
/// Every operation is replayed against a scratch copy so that the values it displaces can
/// be captured; the undo operations are then emitted in reverse order.
pub fn inverse(state: &SproutState, patch: &Patch) -> Result<Patch> {
    let mut document = state.clone();
    let mut groups: Vec<Vec<Value>> = Vec::with_capacity(patch.0.len());

    for operation in patch.0.iter() {
        let before = document.clone();
        json_patch::patch(&mut document, std::slice::from_ref(operation))?;

        let op = serde_json::to_value(operation)
            .map_err(|e| SproutError::parse("Could not serialize patch operation", e))?;
        let kind = op.get("op").and_then(Value::as_str).unwrap_or_default();
        let path = op.get("path").and_then(Value::as_str).unwrap_or_default();
        let from = op.get("from").and_then(Value::as_str).unwrap_or_default();

        let undo = match kind {
            "add" | "copy" => undo_insert(&before, path),
            "remove" => vec![json!({"op": "add", "path": path, "value": lookup(&before, path)})],
            "replace" => {
                vec![json!({"op": "replace", "path": path, "value": lookup(&before, path)})]
            }
            "move" => undo_move(&before, &document, from, path)?,
            _ => Vec::new(),
        };
        groups.push(undo);
    }

    let operations: Vec<PatchOperation> = groups
        .into_iter()
        .rev()
        .flatten()
        .map(serde_json::from_value)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| SproutError::parse("Could not build inverse patch", e))?;
    Ok(Patch(operations))
}

/// The value a successfully applied operation displaced.
fn lookup(document: &Value, path: &str) -> Value {
    document.pointer(path).cloned().unwrap_or(Value::Null)
}

/// Undo for an operation that writes a value at `path` (`add`, `copy`).
fn undo_insert(document: &Value, path: &str) -> Vec<Value> {
    if path.is_empty() {
        return vec![json!({"op": "replace", "path": "", "value": document.clone()})];
    }
    if is_array_slot(document, path) {
        let resolved = resolve_end_token(document, path, false);
        return vec![json!({"op": "remove", "path": resolved})];
    }
    match document.pointer(path) {
        Some(old) => vec![json!({"op": "replace", "path": path, "value": old.clone()})],
        None => vec![json!({"op": "remove", "path": path})],
    }
}

/// Undo for `move`: clear the value out of `path`, then put it back at `from`.
fn undo_move(before: &Value, after: &Value, from: &str, path: &str) -> Result<Vec<Value>> {
    if from == path {
        return Ok(Vec::new());
    }

    // Moving onto an ancestor overwrote the subtree that held `from`.
    if from.starts_with(&format!("{path}/")) {
        let mut undo = Vec::new();
        if !path.is_empty() && is_array_slot(after, path) {
            undo.push(json!({"op": "remove", "path": path}));
        }
        undo.push(json!({"op": "replace", "path": path, "value": lookup(before, path)}));
        return Ok(undo);
    }

    // `path` is interpreted against the document with `from` already removed.
    let mut removed = before.clone();
    let removal: Patch = serde_json::from_value(json!([{"op": "remove", "path": from}]))
        .map_err(|e| SproutError::parse("Could not build removal", e))?;
    json_patch::patch(&mut removed, &removal.0)?;

    let clear_target = if is_array_slot(&removed, path) {
        json!({"op": "remove", "path": resolve_end_token(after, path, true)})
    } else {
        match removed.pointer(path) {
            Some(old) => json!({"op": "replace", "path": path, "value": old.clone()}),
            None => json!({"op": "remove", "path": path}),
        }
    };
    Ok(vec![
        clear_target,
        json!({"op": "add", "path": from, "value": lookup(before, from)}),
    ])
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(index) => (&path[..index], &path[index + 1..]),
        None => ("", path),
    }
}

fn is_array_slot(document: &Value, path: &str) -> bool {
    let (parent, _) = split_parent(path);
    matches!(document.pointer(parent), Some(Value::Array(_)))
}

/// Replaces a trailing `-` with a concrete index. `after_insert` selects the index of the
/// last element (the value is already there) instead of the next free slot.
fn resolve_end_token(document: &Value, path: &str, after_insert: bool) -> String {
    let (parent, last) = split_parent(path);
    if last != "-" {
        return path.to_string();
    }
    let len = document
        .pointer(parent)
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or_default();
    let index = if after_insert { len.saturating_sub(1) } else { len };
    format!("{parent}/{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(value: Value) -> Patch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_empty_patch_is_identity() {
        let state = json!({"count": 0, "items": ["a", {"b": null}]});
        assert_eq!(apply(&state, &patch(json!([]))).unwrap(), state);
    }

    #[test]
    fn test_apply_does_not_touch_input() {
        let state = json!({"count": 0});
        let next = apply(
            &state,
            &patch(json!([{"op": "replace", "path": "/count", "value": 1}])),
        )
        .unwrap();
        assert_eq!(next, json!({"count": 1}));
        assert_eq!(state, json!({"count": 0}));
    }

    #[test]
    fn test_add_to_end_of_array() {
        let state = json!({"words": ["apple"]});
        let next = apply(
            &state,
            &patch(json!([{"op": "add", "path": "/words/-", "value": "pear"}])),
        )
        .unwrap();
        assert_eq!(next, json!({"words": ["apple", "pear"]}));
    }

    #[test]
    fn test_failures() {
        let state = json!({"count": 0});

        let bad_pointer = apply(
            &state,
            &patch(json!([{"op": "replace", "path": "/missing/deep", "value": 1}])),
        );
        assert!(matches!(bad_pointer, Err(SproutError::Patch(_))));

        let failed_test = apply(
            &state,
            &patch(json!([{"op": "test", "path": "/count", "value": 5}])),
        );
        assert!(matches!(failed_test, Err(SproutError::Patch(_))));

        let remove_missing = apply(&state, &patch(json!([{"op": "remove", "path": "/nope"}])));
        assert!(matches!(remove_missing, Err(SproutError::Patch(_))));
    }

    #[test]
    fn test_inverse_round_trip() {
        let state = json!({
            "count": 3,
            "words": ["apple", "pear"],
            "board": {"a": 1, "b": 2},
            "log": []
        });
        let forward = patch(json!([
            {"op": "replace", "path": "/count", "value": 4},
            {"op": "add", "path": "/words/-", "value": "plum"},
            {"op": "add", "path": "/words/0", "value": "fig"},
            {"op": "remove", "path": "/board/a"},
            {"op": "add", "path": "/board/c", "value": {"nested": true}},
            {"op": "add", "path": "/board/b", "value": 20},
            {"op": "copy", "from": "/count", "path": "/log/-"},
            {"op": "move", "from": "/words/1", "path": "/board/moved"},
            {"op": "test", "path": "/count", "value": 4},
            {"op": "move", "from": "/board/c/nested", "path": "/board/c"}
        ]));

        let next = apply(&state, &forward).unwrap();
        let undo = inverse(&state, &forward).unwrap();
        assert_eq!(apply(&next, &undo).unwrap(), state);
    }

    #[test]
    fn test_inverse_of_move_over_existing_key() {
        let state = json!({"a": 1, "b": 2});
        let forward = patch(json!([{"op": "move", "from": "/a", "path": "/b"}]));
        let next = apply(&state, &forward).unwrap();
        assert_eq!(next, json!({"b": 1}));
        let undo = inverse(&state, &forward).unwrap();
        assert_eq!(apply(&next, &undo).unwrap(), state);
    }

    #[test]
    fn test_inverse_of_move_onto_ancestor() {
        let state = json!({"a": {"b": 1, "c": 2}});
        let forward = patch(json!([{"op": "move", "from": "/a/b", "path": "/a"}]));
        let next = apply(&state, &forward).unwrap();
        assert_eq!(next, json!({"a": 1}));
        let undo = inverse(&state, &forward).unwrap();
        assert_eq!(apply(&next, &undo).unwrap(), state);
    }

    #[test]
    fn test_inverse_of_each_operation() {
        let state = json!({
            "count": 3,
            "words": ["apple", "pear", "plum"],
            "board": {"a": 1, "b": {"c": 2, "d": [1, 2]}},
            "grid": [[1, 2], [3, 4]]
        });
        let operations = [
            json!({"op": "add", "path": "/board/new", "value": [true]}),
            json!({"op": "add", "path": "/board/a", "value": 10}),
            json!({"op": "add", "path": "/words/1", "value": "fig"}),
            json!({"op": "add", "path": "/words/-", "value": "fig"}),
            json!({"op": "add", "path": "/grid/0/-", "value": 9}),
            json!({"op": "add", "path": "", "value": {"fresh": true}}),
            json!({"op": "remove", "path": "/board/a"}),
            json!({"op": "remove", "path": "/words/0"}),
            json!({"op": "remove", "path": "/grid/1"}),
            json!({"op": "replace", "path": "/count", "value": 4}),
            json!({"op": "replace", "path": "/words/2", "value": "kiwi"}),
            json!({"op": "replace", "path": "", "value": []}),
            json!({"op": "copy", "from": "/board/b", "path": "/board/copy"}),
            json!({"op": "copy", "from": "/count", "path": "/words/-"}),
            json!({"op": "copy", "from": "/board/b", "path": "/board/a"}),
            json!({"op": "copy", "from": "/words/0", "path": "/words/0"}),
            json!({"op": "move", "from": "/board/a", "path": "/board/z"}),
            json!({"op": "move", "from": "/board/a", "path": "/count"}),
            json!({"op": "move", "from": "/words/0", "path": "/words/2"}),
            json!({"op": "move", "from": "/words/2", "path": "/words/0"}),
            json!({"op": "move", "from": "/words/0", "path": "/words/-"}),
            json!({"op": "move", "from": "/words/1", "path": "/board/w"}),
            json!({"op": "move", "from": "/board/a", "path": "/words/1"}),
            json!({"op": "move", "from": "/grid/1", "path": "/grid/0/-"}),
            json!({"op": "move", "from": "/grid/0", "path": "/grid/1"}),
            json!({"op": "move", "from": "/board/b/c", "path": "/board/b"}),
            json!({"op": "move", "from": "/board/b/d/0", "path": "/board/b/d"}),
            json!({"op": "move", "from": "/grid/0/1", "path": "/grid/0"}),
            json!({"op": "move", "from": "/board/b", "path": ""}),
            json!({"op": "test", "path": "/count", "value": 3}),
        ];

        for operation in operations {
            let forward = patch(json!([operation.clone()]));
            let next = apply(&state, &forward).unwrap_or_else(|e| panic!("{operation}: {e}"));
            let undo = inverse(&state, &forward).unwrap();
            assert_eq!(
                apply(&next, &undo).unwrap(),
                state,
                "undo of {operation} was {undo:?}"
            );
        }
    }
}
