use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Serializes a JSON value in canonical form.
///
/// Object keys are sorted lexicographically at every depth, no insignificant
/// whitespace is emitted, and numbers keep their original representation.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    sort_value(value).to_string()
}

/// Returns the SHA-256 hex digest of the canonical form of a JSON value.
#[must_use]
pub fn canonical_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns the SHA-256 hex digest of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(entries) => {
            let mut sorted: Vec<(&String, &Value)> = entries.iter().collect();
            sorted.sort_by(|(left, _), (right, _)| left.cmp(right));

            let mut output = Map::with_capacity(sorted.len());
            for (key, entry) in sorted {
                output.insert(key.clone(), sort_value(entry));
            }

            Value::Object(output)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{canonical_hash, canonical_json};

    #[test]
    fn canonical_json_sorts_keys_at_every_depth() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [ {"y": 1, "x": 2} ]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn canonical_hash_is_order_insensitive() {
        let left = json!({"orderId": "o-1", "total": 12});
        let right = json!({"total": 12, "orderId": "o-1"});
        assert_eq!(canonical_hash(&left), canonical_hash(&right));
    }

    #[test]
    fn canonical_hash_distinguishes_payloads() {
        let left = json!({"orderId": "o-1"});
        let right = json!({"orderId": "o-2"});
        assert_ne!(canonical_hash(&left), canonical_hash(&right));
    }
}
