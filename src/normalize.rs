//! Key-style normalization for facade arguments (spec.md §4.8, §9 "Naming
//! convention bridging": callers may pass either `camelCase` or
//! `snake_case` argument keys; everything past the facade boundary is
//! canonical `snake_case`). Also folds the handful of accepted aliases
//! spec.md §4.8/§9 names (`model_id`/`model`, `stream`/`streaming`,
//! `add_special_tokens`/`add_bos`) onto one canonical key, applied after
//! case-folding so any casing of an alias collapses the same way.

use serde_json::{Map, Value};

/// `fooBarBaz` -> `foo_bar_baz`. Leaves already-`snake_case` keys
/// unchanged.
pub fn camel_to_snake(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    for (i, ch) in input.char_indices() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Accepted alternate spellings, keyed by the case-folded alias, mapped to
/// the one canonical `snake_case` name every component past the facade
/// boundary expects (spec.md §4.8 "common aliases").
const ALIASES: &[(&str, &str)] = &[
    ("model", "model_id"),
    ("streaming", "stream"),
    ("add_bos", "add_special_tokens"),
];

fn canonical_key(raw_key: &str) -> String {
    let folded = camel_to_snake(raw_key);
    for (alias, canonical) in ALIASES {
        if folded == *alias {
            return (*canonical).to_string();
        }
    }
    folded
}

/// Recursively rewrites every object key in `value` to its canonical
/// `snake_case` name, case-folding and then alias-substituting. Array
/// elements and scalar values are walked but never renamed. Idempotent:
/// `normalize_keys(normalize_keys(v)) == normalize_keys(v)` (L3), since
/// every canonical key is already its own fixed point under both steps.
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut normalized = Map::with_capacity(map.len());
            for (key, v) in map {
                normalized.insert(canonical_key(&key), normalize_keys(v));
            }
            Value::Object(normalized)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_to_snake_basic() {
        assert_eq!(camel_to_snake("modelId"), "model_id");
        assert_eq!(camel_to_snake("timeToFirstToken"), "time_to_first_token");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
        assert_eq!(camel_to_snake("id"), "id");
    }

    #[test]
    fn normalize_keys_recurses_through_arrays_and_objects() {
        let input = serde_json::json!({
            "modelId": "m1",
            "messages": [{"role": "user", "maxTokens": 16}],
        });
        let normalized = normalize_keys(input);
        assert_eq!(normalized["model_id"], "m1");
        assert_eq!(normalized["messages"][0]["max_tokens"], 16);
    }

    #[test]
    fn aliases_collapse_onto_the_canonical_key_regardless_of_casing() {
        assert_eq!(normalize_keys(serde_json::json!({"model": "m1"}))["model_id"], "m1");
        assert_eq!(normalize_keys(serde_json::json!({"streaming": true}))["stream"], true);
        assert_eq!(
            normalize_keys(serde_json::json!({"addBos": true}))["add_special_tokens"],
            true
        );
        assert_eq!(
            normalize_keys(serde_json::json!({"add_bos": true}))["add_special_tokens"],
            true
        );
    }

    #[test]
    fn normalize_keys_is_idempotent() {
        let input = serde_json::json!({
            "modelId": "m1",
            "addBos": true,
            "streaming": true,
            "nested": [{"maxTokens": 16}],
        });
        let once = normalize_keys(input);
        let twice = normalize_keys(once.clone());
        assert_eq!(once, twice, "L3: normalizing an already-normalized value must be a no-op");
    }
}
