//! Deep merge of JSON values.
//!
//! Used for two things: layering configuration tiers, and resolving the
//! Global → Project → Branch → Task context inheritance chain. Arrays are
//! replaced entirely, not concatenated.

use serde_json::Value;

/// Deep merge two JSON values, with `overlay` taking precedence over `base`.
///
/// - Objects are merged recursively: keys in overlay override keys in base
/// - Arrays, strings, numbers, booleans are replaced entirely
/// - If overlay is null, the base value is preserved (null means "not specified")
///
/// # Example
/// ```
/// use serde_json::json;
/// use taskhub_server::config::deep_merge;
///
/// let global = json!({ "style": { "indent": 4, "quotes": "double" }, "tags": ["a"] });
/// let project = json!({ "style": { "indent": 2 }, "tags": ["b"] });
/// let merged = deep_merge(global, project);
/// assert_eq!(merged, json!({ "style": { "indent": 2, "quotes": "double" }, "tags": ["b"] }));
/// ```
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged_value = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged_value);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Apply `patch` to `target` the way JSON Merge Patch (RFC 7386) does.
///
/// Same as [`deep_merge`] except that a null in the patch removes the key.
pub fn merge_patch(target: Value, patch: Value) -> Value {
    match (target, patch) {
        (Value::Object(mut target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    target_map.remove(&key);
                    continue;
                }
                let merged_value = match target_map.remove(&key) {
                    Some(target_value) => merge_patch(target_value, patch_value),
                    None => strip_nulls(patch_value),
                };
                target_map.insert(key, merged_value);
            }
            Value::Object(target_map)
        }
        (_, patch) => strip_nulls(patch),
    }
}

/// Drop null members from objects, recursively. Nulls inside arrays stay.
fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Merge multiple values in order, with later values taking precedence.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}
