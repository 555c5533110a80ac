/*!
Checksums and timestamps shared by every layer of the engine.

Checksums are SHA-256 over a canonical JSON encoding: object keys are emitted
in sorted order at every depth, so two equal states always hash the same
regardless of how their maps were built.
*/

use crate::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// A whole-state object: string keys to dynamic values.
pub type State = Map<String, Value>;

/// Compute the SHA-256 hex digest of raw bytes
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Canonical JSON encoding of any serializable value
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&canonicalize(value))?)
}

/// Checksum of the canonical encoding of a value
pub fn compute_checksum<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(hash_bytes(&canonical_bytes(value)?))
}

/// Checksum and canonical size of a whole state
pub fn state_fingerprint(state: &State) -> Result<(String, u64)> {
    let bytes = canonical_bytes(state)?;
    Ok((hash_bytes(&bytes), bytes.len() as u64))
}

/// Current time as fractional seconds since the UNIX epoch
pub fn timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_bytes_known_vector() {
        assert_eq!(
            hash_bytes(b"test data"),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let mut first = State::new();
        first.insert("b".into(), json!(2));
        first.insert("a".into(), json!({"y": 1, "x": [1, 2]}));

        let mut second = State::new();
        second.insert("a".into(), json!({"x": [1, 2], "y": 1}));
        second.insert("b".into(), json!(2));

        assert_eq!(
            compute_checksum(&first).unwrap(),
            compute_checksum(&second).unwrap()
        );
    }

    #[test]
    fn test_checksum_sensitive_to_values() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(compute_checksum(&a).unwrap(), compute_checksum(&b).unwrap());
    }

    #[test]
    fn test_canonical_bytes_sorted() {
        let bytes = canonical_bytes(&json!({"z": 1, "a": {"d": 0, "c": 0}})).unwrap();
        assert_eq!(bytes, br#"{"a":{"c":0,"d":0},"z":1}"#.to_vec());
    }

    #[test]
    fn test_state_fingerprint_size() {
        let state: State = serde_json::from_value(json!({"k": "v"})).unwrap();
        let (checksum, size) = state_fingerprint(&state).unwrap();
        assert_eq!(size, br#"{"k":"v"}"#.len() as u64);
        assert_eq!(checksum.len(), 64);
    }

    #[test]
    fn test_timestamp_is_recent() {
        let now = timestamp();
        assert!(now > 1_600_000_000.0);
    }
}
