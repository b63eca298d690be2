//! Deterministic cache keys.
//!
//! State is canonicalized (object keys sorted at every depth), serialized to JSON
//! and hashed with SHA-256. Structurally equal state always yields the same key.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::{Datasource, QueryObject};

/// Prefix of whole-context keys.
pub const CONTEXT_KEY_PREFIX: &str = "qc-";
/// Prefix of per-query keys.
pub const QUERY_KEY_PREFIX: &str = "qo-";

pub fn derive_key(state: &Value, prefix: &str) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(&canonicalize(state))?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{prefix}{}", hex::encode(digest)))
}

/// Copy of `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonicalize(value)))
                    .collect::<Map<_, _>>(),
            )
        }
        Value::Array(values) => Value::Array(values.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Per-query key: the query's own result-shaping fields plus the datasource
/// state that can change its rows.
pub fn query_cache_key(
    query: &QueryObject,
    datasource: &dyn Datasource,
    row_level_security_ids: &[i64],
) -> Result<String, serde_json::Error> {
    let mut state = query.cache_state();
    state.insert(String::from("datasource"), Value::String(datasource.uid()));
    state.insert(
        String::from("extra_cache_keys"),
        Value::Array(datasource.extra_cache_keys(query)),
    );
    state.insert(
        String::from("rls"),
        Value::Array(
            row_level_security_ids
                .iter()
                .map(|id| Value::from(*id))
                .collect(),
        ),
    );
    state.insert(
        String::from("changed_on"),
        datasource
            .changed_on()
            .map(|changed_on| Value::from(changed_on.unix_millis()))
            .unwrap_or(Value::Null),
    );

    derive_key(&Value::Object(state), QUERY_KEY_PREFIX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_ignores_object_field_order() {
        let left = json!({"a": 1, "b": {"x": [1, 2], "y": null}});
        let right = json!({"b": {"y": null, "x": [1, 2]}, "a": 1});
        assert_eq!(
            derive_key(&left, "qc-").expect("key"),
            derive_key(&right, "qc-").expect("key")
        );
    }

    #[test]
    fn key_is_prefixed_sha256_hex() {
        let key = derive_key(&json!({}), QUERY_KEY_PREFIX).expect("key");
        assert!(key.starts_with("qo-"));
        assert_eq!(key.len(), 3 + 64);
        // sha256("{}")
        assert!(key.ends_with("44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"));
    }

    #[test]
    fn array_order_is_significant() {
        assert_ne!(
            derive_key(&json!([1, 2]), "qc-").expect("key"),
            derive_key(&json!([2, 1]), "qc-").expect("key")
        );
    }
}
