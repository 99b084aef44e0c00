//! Canonical JSON: object keys sorted at every level, no insignificant whitespace.
//!
//! Content hashes (snapshots, bundles, idempotency keys) are SHA-256 over this
//! form, so equality of hashes means equality of values independent of key order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialises a value with object keys sorted recursively.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // Scalars have a single serde_json rendering.
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Hex SHA-256 of the canonical serialisation.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(value).as_bytes());
    hex(&hasher.finalize())
}

/// Hex SHA-256 of raw bytes (bundle blobs).
pub fn bytes_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: Key order does not affect the canonical form or the hash.
    #[test]
    fn key_order_is_irrelevant() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"d":4,"c":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"c":3,"d":4},"b":1}"#).unwrap();
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    /// **Scenario**: Array order is significant.
    #[test]
    fn array_order_matters() {
        assert_ne!(content_hash(&json!([1, 2])), content_hash(&json!([2, 1])));
    }

    /// **Scenario**: Canonical form is itself valid JSON parsing back to the same value.
    #[test]
    fn canonical_is_valid_json() {
        let v = json!({"z":[1,{"b":null,"a":"x"}],"m":true});
        let reparsed: Value = serde_json::from_str(&canonical_string(&v)).unwrap();
        assert_eq!(reparsed, v);
    }
}
