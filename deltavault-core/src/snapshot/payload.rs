/*!
Stored snapshot payloads.

Each version owns one blob: gzip-compressed (by default) JSON of a
[`StoredPayload`]. Decoding sniffs the gzip magic, so a vault written with one
codec setting stays readable after the setting changes.
*/

use crate::compression::{decompress_auto, CompressionAdapter};
use crate::delta::DeltaRecord;
use crate::integrity::State;
use crate::{PersistError, Result};
use serde::{Deserialize, Serialize};

/// Directory holding snapshots as first written
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Directory holding delta snapshots rewritten as full snapshots
pub const MATERIALIZED_DIR: &str = "materialized";

/// Extension of stored payload blobs
pub const PAYLOAD_EXTENSION: &str = "snap";

/// Contents of one snapshot data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoredPayload {
    /// The whole state
    Full { state: State },
    /// A delta against another version, resolved through the registry
    Delta {
        base_version: String,
        delta: DeltaRecord,
    },
}

impl StoredPayload {
    /// Encode and compress for storage
    pub fn encode(&self, compressor: &dyn CompressionAdapter) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        compressor.compress(&json)
    }

    /// Decompress and decode stored bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let json = decompress_auto(data)?;
        serde_json::from_slice(&json)
            .map_err(|e| PersistError::snapshot(format!("Malformed snapshot payload: {e}")))
    }

    pub fn base_version(&self) -> Option<&str> {
        match self {
            StoredPayload::Full { .. } => None,
            StoredPayload::Delta { base_version, .. } => Some(base_version),
        }
    }
}

/// Storage key for a snapshot as first written
pub fn payload_key(version: &str) -> String {
    format!("{SNAPSHOT_DIR}/{version}.{PAYLOAD_EXTENSION}")
}

/// Storage key for a snapshot rewritten as a full snapshot
pub fn materialized_key(version: &str) -> String {
    format!("{MATERIALIZED_DIR}/{version}.{PAYLOAD_EXTENSION}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{GzipCompressor, NoCompression};
    use crate::delta::{DeltaCompressor, DeltaStrategy};
    use serde_json::json;

    fn state(value: serde_json::Value) -> State {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_full_payload_encoding() {
        let payload = StoredPayload::Full {
            state: state(json!({"a": 1})),
        };
        let gzip = GzipCompressor::new();
        let bytes = payload.encode(&gzip).unwrap();
        assert!(crate::compression::is_gzip(&bytes));
        assert_eq!(StoredPayload::decode(&bytes).unwrap(), payload);
        assert_eq!(payload.base_version(), None);
    }

    #[test]
    fn test_delta_payload_wire_shape() {
        let compressor = DeltaCompressor::new(DeltaStrategy::Dict);
        let record = compressor
            .create_delta_record(state(json!({"b": 3})), vec!["c".to_string()], Some(1.0))
            .unwrap();
        let payload = StoredPayload::Delta {
            base_version: "v1".to_string(),
            delta: record,
        };

        let bytes = payload.encode(&NoCompression::new()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["kind"], json!("delta"));
        assert_eq!(json["base_version"], json!("v1"));
        assert_eq!(json["delta"]["removed_keys"], json!(["c"]));

        let decoded = StoredPayload::decode(&bytes).unwrap();
        assert_eq!(decoded.base_version(), Some("v1"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = StoredPayload::decode(b"not a payload").unwrap_err();
        assert!(matches!(err, PersistError::Snapshot(_)));
    }

    #[test]
    fn test_keys() {
        assert_eq!(payload_key("v1"), "snapshots/v1.snap");
        assert_eq!(materialized_key("v1"), "materialized/v1.snap");
    }
}
