//! RFC 6902 JSON patches: application and generation.
//!
//! Patches are plain `serde_json::Value` arrays so they can travel inside
//! [`Change::ApplyJsonPatch`](crate::model::Change) unchanged. Generation
//! produces a minimal patch; replacements are emitted either bare (`Rfc`)
//! or guarded by a `test` op carrying the expected old value (`Safe`).

use serde_json::{json, Value};

use crate::error::{Error, Result};

/// How `replace` operations are emitted during generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// emit `test` + `replace` so application fails on concurrent edits
    Safe,
    /// emit a bare `replace`
    Rfc,
}

fn parse_pointer(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(Error::conflict(format!("invalid JSON pointer: {pointer}")));
    }
    Ok(pointer[1..]
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn parse_index(token: &str, len: usize, allow_end: bool) -> Result<usize> {
    if token == "-" && allow_end {
        return Ok(len);
    }
    // reject leading zeros and signs per RFC 6901
    if token != "0" && (token.starts_with('0') || token.starts_with('+') || token.starts_with('-')) {
        return Err(Error::conflict(format!("invalid array index: {token}")));
    }
    let index: usize = token
        .parse()
        .map_err(|_| Error::conflict(format!("invalid array index: {token}")))?;
    let limit = if allow_end { len } else { len.saturating_sub(1) };
    if index > limit || (!allow_end && len == 0) {
        return Err(Error::conflict(format!("array index out of bounds: {token}")));
    }
    Ok(index)
}

fn lookup<'a>(doc: &'a Value, tokens: &[String]) -> Result<&'a Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get(token.as_str())
                .ok_or_else(|| Error::conflict(format!("no such member: {token}")))?,
            Value::Array(items) => {
                let index = parse_index(token, items.len(), false)?;
                &items[index]
            }
            _ => return Err(Error::conflict(format!("cannot traverse into {token}"))),
        };
    }
    Ok(current)
}

fn lookup_mut<'a>(doc: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token.as_str())
                .ok_or_else(|| Error::conflict(format!("no such member: {token}")))?,
            Value::Array(items) => {
                let len = items.len();
                let index = parse_index(token, len, false)?;
                &mut items[index]
            }
            _ => return Err(Error::conflict(format!("cannot traverse into {token}"))),
        };
    }
    Ok(current)
}

fn add(doc: &mut Value, tokens: &[String], value: Value) -> Result<()> {
    let Some((last, parent_tokens)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    let parent = lookup_mut(doc, parent_tokens)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(items) => {
            let index = parse_index(last, items.len(), true)?;
            items.insert(index, value);
        }
        _ => return Err(Error::conflict(format!("cannot add under {last}"))),
    }
    Ok(())
}

fn remove(doc: &mut Value, tokens: &[String]) -> Result<Value> {
    let Some((last, parent_tokens)) = tokens.split_last() else {
        return Err(Error::conflict("cannot remove the document root"));
    };
    let parent = lookup_mut(doc, parent_tokens)?;
    match parent {
        Value::Object(map) => map
            .shift_remove(last.as_str())
            .ok_or_else(|| Error::conflict(format!("no such member: {last}"))),
        Value::Array(items) => {
            let index = parse_index(last, items.len(), false)?;
            Ok(items.remove(index))
        }
        _ => Err(Error::conflict(format!("cannot remove from {last}"))),
    }
}

fn replace(doc: &mut Value, tokens: &[String], value: Value) -> Result<()> {
    let target = lookup_mut(doc, tokens)?;
    *target = value;
    Ok(())
}

fn op_field<'a>(op: &'a Value, field: &str) -> Result<&'a str> {
    op.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::conflict(format!("patch op lacks {field:?}: {op}")))
}

/// Apply an RFC 6902 patch (a JSON array of operations) to a document.
pub fn apply(doc: &Value, patch: &Value) -> Result<Value> {
    let ops = patch
        .as_array()
        .ok_or_else(|| Error::conflict("JSON patch must be an array of operations"))?;

    let mut result = doc.clone();
    for op in ops {
        let kind = op_field(op, "op")?;
        let path = parse_pointer(op_field(op, "path")?)?;
        match kind {
            "add" => {
                let value = op
                    .get("value")
                    .ok_or_else(|| Error::conflict("add op lacks value"))?
                    .clone();
                add(&mut result, &path, value)?;
            }
            "remove" => {
                remove(&mut result, &path)?;
            }
            "replace" => {
                let value = op
                    .get("value")
                    .ok_or_else(|| Error::conflict("replace op lacks value"))?
                    .clone();
                lookup(&result, &path)?;
                replace(&mut result, &path, value)?;
            }
            "move" => {
                let from = parse_pointer(op_field(op, "from")?)?;
                if path.len() > from.len() && path[..from.len()] == from[..] {
                    return Err(Error::conflict("cannot move a value into its own child"));
                }
                let value = remove(&mut result, &from)?;
                add(&mut result, &path, value)?;
            }
            "copy" => {
                let from = parse_pointer(op_field(op, "from")?)?;
                let value = lookup(&result, &from)?.clone();
                add(&mut result, &path, value)?;
            }
            "test" => {
                let expected = op
                    .get("value")
                    .ok_or_else(|| Error::conflict("test op lacks value"))?;
                let actual = lookup(&result, &path)?;
                if actual != expected {
                    return Err(Error::conflict(format!(
                        "test failed at {}: expected {expected}, found {actual}",
                        op_field(op, "path")?
                    )));
                }
            }
            other => return Err(Error::conflict(format!("unknown patch op: {other}"))),
        }
    }
    Ok(result)
}

/// Generate a minimal patch that transforms `old` into `new`.
pub fn generate(old: &Value, new: &Value, mode: ReplaceMode) -> Value {
    let mut ops = Vec::new();
    diff_values("", old, new, mode, &mut ops);
    Value::Array(ops)
}

fn push_replace(path: &str, old: &Value, new: &Value, mode: ReplaceMode, ops: &mut Vec<Value>) {
    if mode == ReplaceMode::Safe {
        ops.push(json!({"op": "test", "path": path, "value": old.clone()}));
    }
    ops.push(json!({"op": "replace", "path": path, "value": new.clone()}));
}

fn diff_values(path: &str, old: &Value, new: &Value, mode: ReplaceMode, ops: &mut Vec<Value>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                let child = format!("{path}/{}", escape_token(key));
                match new_map.get(key) {
                    Some(new_value) => diff_values(&child, old_value, new_value, mode, ops),
                    None => ops.push(json!({"op": "remove", "path": child})),
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    let child = format!("{path}/{}", escape_token(key));
                    ops.push(json!({"op": "add", "path": child, "value": new_value.clone()}));
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            // Diff the changed window between the common prefix and suffix.
            let mut start = 0;
            while start < old_items.len()
                && start < new_items.len()
                && old_items[start] == new_items[start]
            {
                start += 1;
            }
            let mut old_end = old_items.len();
            let mut new_end = new_items.len();
            while old_end > start && new_end > start && old_items[old_end - 1] == new_items[new_end - 1]
            {
                old_end -= 1;
                new_end -= 1;
            }

            let pairs = (old_end - start).min(new_end - start);
            for i in 0..pairs {
                let child = format!("{path}/{}", start + i);
                diff_values(&child, &old_items[start + i], &new_items[start + i], mode, ops);
            }
            if old_end - start > pairs {
                // back to front so earlier indices stay valid
                for i in (start + pairs..old_end).rev() {
                    ops.push(json!({"op": "remove", "path": format!("{path}/{i}")}));
                }
            } else {
                for i in start + pairs..new_end {
                    ops.push(json!({
                        "op": "add",
                        "path": format!("{path}/{i}"),
                        "value": new_items[i].clone(),
                    }));
                }
            }
        }
        _ => push_replace(path, old, new, mode, ops),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_add_and_remove() {
        let doc = json!({"a": 1});
        let patch = json!([
            {"op": "add", "path": "/b", "value": 2},
            {"op": "remove", "path": "/a"},
        ]);
        assert_eq!(apply(&doc, &patch).unwrap(), json!({"b": 2}));
    }

    #[test]
    fn test_apply_array_ops() {
        let doc = json!({"items": [1, 2, 3]});
        let patch = json!([
            {"op": "add", "path": "/items/1", "value": 9},
            {"op": "add", "path": "/items/-", "value": 4},
            {"op": "remove", "path": "/items/0"},
        ]);
        assert_eq!(apply(&doc, &patch).unwrap(), json!({"items": [9, 2, 3, 4]}));
    }

    #[test]
    fn test_apply_move_copy_test() {
        let doc = json!({"a": {"x": 1}, "b": 2});
        let patch = json!([
            {"op": "test", "path": "/b", "value": 2},
            {"op": "copy", "from": "/b", "path": "/c"},
            {"op": "move", "from": "/a/x", "path": "/y"},
        ]);
        assert_eq!(
            apply(&doc, &patch).unwrap(),
            json!({"a": {}, "b": 2, "c": 2, "y": 1})
        );
    }

    #[test]
    fn test_apply_test_failure() {
        let doc = json!({"a": 1});
        let patch = json!([{"op": "test", "path": "/a", "value": 2}]);
        assert!(apply(&doc, &patch).unwrap_err().is_conflict());
    }

    #[test]
    fn test_apply_replace_missing_path() {
        let doc = json!({"a": 1});
        let patch = json!([{"op": "replace", "path": "/missing", "value": 2}]);
        assert!(apply(&doc, &patch).unwrap_err().is_conflict());
    }

    #[test]
    fn test_apply_whole_document() {
        let doc = json!(null);
        let patch = json!([{"op": "replace", "path": "", "value": {"a": 1}}]);
        assert_eq!(apply(&doc, &patch).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_pointer_escaping() {
        let doc = json!({"a/b": {"m~n": 1}});
        let patch = json!([{"op": "replace", "path": "/a~1b/m~0n", "value": 2}]);
        assert_eq!(apply(&doc, &patch).unwrap(), json!({"a/b": {"m~n": 2}}));
    }

    #[test]
    fn test_generate_safe_replace() {
        let old = json!({"a": 1});
        let new = json!({"a": 2});
        let patch = generate(&old, &new, ReplaceMode::Safe);
        assert_eq!(
            patch,
            json!([
                {"op": "test", "path": "/a", "value": 1},
                {"op": "replace", "path": "/a", "value": 2},
            ])
        );
    }

    #[test]
    fn test_generate_rfc_replace() {
        let old = json!({"a": 1});
        let new = json!({"a": 2});
        let patch = generate(&old, &new, ReplaceMode::Rfc);
        assert_eq!(patch, json!([{"op": "replace", "path": "/a", "value": 2}]));
    }

    #[test]
    fn test_generate_identity_is_empty() {
        let doc = json!({"a": [1, {"b": 2}]});
        assert_eq!(generate(&doc, &doc, ReplaceMode::Safe), json!([]));
    }

    #[test]
    fn test_generate_apply_roundtrip() {
        let cases = [
            (json!({"a": 1, "b": 2}), json!({"a": 1, "c": 3})),
            (json!([1, 2, 3]), json!([1, 4, 3, 5])),
            (json!({"deep": {"x": [1, 2]}}), json!({"deep": {"x": [2]}})),
            (json!(null), json!({"fresh": true})),
            (json!("text"), json!(42)),
        ];
        for (old, new) in cases {
            for mode in [ReplaceMode::Safe, ReplaceMode::Rfc] {
                let patch = generate(&old, &new, mode);
                assert_eq!(apply(&old, &patch).unwrap(), new, "patch: {patch}");
            }
        }
    }
}
