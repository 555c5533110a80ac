/*!
Delta value objects: the transient [`DeltaInfo`] produced by a diff and the
immutable, checksummed [`DeltaRecord`] that gets chained and stored.
*/

use super::binary::BinaryPatch;
use crate::integrity::{canonical_bytes, hash_bytes, State};
use crate::{PersistError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Metadata key recording which strategy produced a record
pub const STRATEGY_KEY: &str = "strategy";

/// How a delta between two states is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaStrategy {
    /// Per-key structural diff
    Dict,
    /// Byte-level diff over the canonical encoding
    Binary,
}

impl DeltaStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaStrategy::Dict => "dict",
            DeltaStrategy::Binary => "binary",
        }
    }
}

impl fmt::Display for DeltaStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeltaStrategy {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dict" => Ok(DeltaStrategy::Dict),
            "binary" => Ok(DeltaStrategy::Binary),
            other => Err(PersistError::validation(format!(
                "unknown delta strategy '{other}'"
            ))),
        }
    }
}

/// Result of comparing two states
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaInfo {
    /// Strategy that actually produced this delta (after any fallback)
    pub strategy: DeltaStrategy,
    /// Added or modified keys (plus unchanged keys when requested)
    pub changes: State,
    /// Keys present in the old state but not the new one
    pub removed_keys: Vec<String>,
    /// Number of keys identical in both states
    pub unchanged: usize,
    /// Byte patch, binary strategy only
    pub patch: Option<BinaryPatch>,
    /// Set when the binary strategy was requested but dict was used
    pub fell_back: bool,
}

impl DeltaInfo {
    /// True if applying this delta changes nothing
    pub fn is_empty(&self) -> bool {
        match &self.patch {
            Some(patch) => patch.base_checksum == patch.target_checksum,
            None => self.changes.is_empty() && self.removed_keys.is_empty(),
        }
    }
}

/// Immutable, checksummed delta between two consecutive states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub(crate) timestamp: f64,
    pub(crate) changes: State,
    pub(crate) removed_keys: Vec<String>,
    pub(crate) metadata: Map<String, Value>,
    pub(crate) compression_ratio: f64,
    pub(crate) size_bytes: u64,
    pub(crate) checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) patch: Option<BinaryPatch>,
}

/// The part of a record covered by its checksum
#[derive(Serialize)]
struct ChecksumView<'a> {
    changes: &'a State,
    removed_keys: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    patch: Option<&'a BinaryPatch>,
}

/// Canonical encoding of the checksummed part of a record
pub(crate) fn content_bytes(
    changes: &State,
    removed_keys: &[String],
    patch: Option<&BinaryPatch>,
) -> Result<Vec<u8>> {
    canonical_bytes(&ChecksumView {
        changes,
        removed_keys,
        patch,
    })
}

impl DeltaRecord {
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn changes(&self) -> &State {
        &self.changes
    }

    pub fn removed_keys(&self) -> &[String] {
        &self.removed_keys
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn compression_ratio(&self) -> f64 {
        self.compression_ratio
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn patch(&self) -> Option<&BinaryPatch> {
        self.patch.as_ref()
    }

    /// Strategy recorded in the metadata; binary if a patch is present
    pub fn strategy(&self) -> DeltaStrategy {
        if self.patch.is_some() {
            DeltaStrategy::Binary
        } else {
            DeltaStrategy::Dict
        }
    }

    pub fn is_binary(&self) -> bool {
        self.patch.is_some()
    }

    /// Number of key-level operations this record carries
    pub fn operation_count(&self) -> usize {
        self.changes.len() + self.removed_keys.len()
    }

    /// Recompute the checksum and compare it with the stored one
    pub fn verify_checksum(&self) -> Result<()> {
        let actual = hash_bytes(&content_bytes(
            &self.changes,
            &self.removed_keys,
            self.patch.as_ref(),
        )?);
        if actual == self.checksum {
            Ok(())
        } else {
            Err(PersistError::delta(format!(
                "delta record checksum mismatch: expected {}, got {actual}",
                self.checksum
            )))
        }
    }

    /// Check that no key is both changed and removed
    pub(crate) fn check_disjoint(changes: &State, removed_keys: &[String]) -> Result<()> {
        if let Some(key) = removed_keys.iter().find(|k| changes.contains_key(k.as_str())) {
            return Err(PersistError::delta(format!(
                "key '{key}' is both changed and removed"
            )));
        }
        Ok(())
    }
}
