/*!
Delta computation, application, merging and serialization.
*/

use super::binary::{self, BinaryPatch};
use super::record::{content_bytes, DeltaInfo, DeltaRecord, DeltaStrategy, STRATEGY_KEY};
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::integrity::{canonical_bytes, hash_bytes, timestamp, State};
use crate::{PersistError, Result};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Magic bytes opening a serialized delta record
const DELTA_MAGIC: &[u8; 4] = b"PDLT";

/// Serialized delta frame version
const DELTA_FORMAT_VERSION: u8 = 1;

const CODEC_NONE: u8 = 0;
const CODEC_GZIP: u8 = 1;

/// magic + version + codec + body length
const HEADER_LEN: usize = 4 + 1 + 1 + 4;

/// Why a binary delta was computed with the dict strategy instead
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyFallback {
    /// This build has no binary diff codec
    CodecUnavailable,
    /// Caller asked for unchanged keys, which only the dict strategy enumerates
    UnchangedKeysRequested,
}

impl std::fmt::Display for StrategyFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyFallback::CodecUnavailable => f.write_str("binary diff codec unavailable"),
            StrategyFallback::UnchangedKeysRequested => {
                f.write_str("unchanged keys requested from binary strategy")
            }
        }
    }
}

/// Running totals reported by [`DeltaCompressor::get_compression_stats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub deltas_created: u64,
    pub average_compression_ratio: f64,
    pub strategy_usage: BTreeMap<String, u64>,
    pub fallback_count: u64,
    pub merges_performed: u64,
    pub deltas_applied: u64,
    pub total_delta_bytes: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    deltas_created: u64,
    ratio_sum: f64,
    strategy_usage: BTreeMap<String, u64>,
    fallback_count: u64,
    merges_performed: u64,
    deltas_applied: u64,
    total_delta_bytes: u64,
}

/// Computes and applies deltas between whole states
///
/// The compressor is shared between chains and snapshot managers, so all
/// methods take `&self`; statistics live behind an internal lock.
#[derive(Debug)]
pub struct DeltaCompressor {
    strategy: DeltaStrategy,
    codec: GzipCompressor,
    stats: Mutex<StatsInner>,
}

impl Default for DeltaCompressor {
    fn default() -> Self {
        Self::new(DeltaStrategy::Dict)
    }
}

impl DeltaCompressor {
    pub fn new(strategy: DeltaStrategy) -> Self {
        Self {
            strategy,
            codec: GzipCompressor::new(),
            stats: Mutex::new(StatsInner::default()),
        }
    }

    /// Use a specific gzip level for record ratios and serialization
    pub fn with_codec(mut self, codec: GzipCompressor) -> Self {
        self.codec = codec;
        self
    }

    pub fn strategy(&self) -> DeltaStrategy {
        self.strategy
    }

    /// Compute the difference between two states with the configured strategy
    ///
    /// The binary strategy falls back to dict (and counts a fallback) when the
    /// states cannot be diffed as bytes, e.g. when `include_unchanged` is set.
    ///
    /// # Arguments
    /// * `old_state` - The state the delta will be applied to
    /// * `new_state` - The state the delta must reproduce
    /// * `include_unchanged` - Also copy keys whose values did not change into `changes`
    ///
    /// # Returns
    /// A DeltaInfo describing added/modified keys, removed keys and the strategy used
    ///
    /// # Example
    /// ```rust
    /// use deltavault_core::{DeltaCompressor, State};
    /// use serde_json::json;
    ///
    /// let old: State = serde_json::from_value(json!({"x": 1, "y": 2}))?;
    /// let new: State = serde_json::from_value(json!({"x": 1, "z": 3}))?;
    ///
    /// let compressor = DeltaCompressor::default();
    /// let info = compressor.calculate_delta(&old, &new, false)?;
    /// assert_eq!(info.removed_keys, vec!["y".to_string()]);
    /// assert_eq!(compressor.apply_delta(&old, &info)?, new);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn calculate_delta(
        &self,
        old_state: &State,
        new_state: &State,
        include_unchanged: bool,
    ) -> Result<DeltaInfo> {
        let info = match self.strategy {
            DeltaStrategy::Dict => Self::dict_delta(old_state, new_state, include_unchanged),
            DeltaStrategy::Binary => {
                match self.try_binary_delta(old_state, new_state, include_unchanged)? {
                    Ok(info) => info,
                    Err(reason) => {
                        warn!(%reason, "binary delta unavailable, using dict strategy");
                        self.stats.lock().fallback_count += 1;
                        let mut info = Self::dict_delta(old_state, new_state, include_unchanged);
                        info.fell_back = true;
                        info
                    }
                }
            }
        };

        debug!(
            strategy = %info.strategy,
            changes = info.changes.len(),
            removed = info.removed_keys.len(),
            "calculated delta"
        );
        Ok(info)
    }

    /// Structural per-key diff
    pub fn dict_delta(old_state: &State, new_state: &State, include_unchanged: bool) -> DeltaInfo {
        let mut changes = State::new();
        let mut unchanged = 0;

        for (key, value) in new_state {
            match old_state.get(key) {
                Some(old) if old == value => {
                    unchanged += 1;
                    if include_unchanged {
                        changes.insert(key.clone(), value.clone());
                    }
                }
                _ => {
                    changes.insert(key.clone(), value.clone());
                }
            }
        }

        let removed_keys = old_state
            .keys()
            .filter(|key| !new_state.contains_key(key.as_str()))
            .cloned()
            .collect();

        DeltaInfo {
            strategy: DeltaStrategy::Dict,
            changes,
            removed_keys,
            unchanged,
            patch: None,
            fell_back: false,
        }
    }

    /// Binary diff, or the reason it cannot be used
    ///
    /// The outer `Result` carries serialization failures; the inner one is the
    /// deterministic fallback decision.
    fn try_binary_delta(
        &self,
        old_state: &State,
        new_state: &State,
        include_unchanged: bool,
    ) -> Result<std::result::Result<DeltaInfo, StrategyFallback>> {
        if include_unchanged {
            return Ok(Err(StrategyFallback::UnchangedKeysRequested));
        }
        if !binary::codec_available() {
            return Ok(Err(StrategyFallback::CodecUnavailable));
        }
        Ok(Ok(Self::binary_delta(old_state, new_state)?))
    }

    #[cfg(feature = "binary-diff")]
    fn binary_delta(old_state: &State, new_state: &State) -> Result<DeltaInfo> {
        let old_bytes = canonical_bytes(old_state)?;
        let new_bytes = canonical_bytes(new_state)?;
        let ops = binary::diff(&old_bytes, &new_bytes);

        let unchanged = new_state
            .iter()
            .filter(|(key, value)| old_state.get(key.as_str()) == Some(*value))
            .count();

        Ok(DeltaInfo {
            strategy: DeltaStrategy::Binary,
            changes: State::new(),
            removed_keys: Vec::new(),
            unchanged,
            patch: Some(BinaryPatch {
                base_checksum: hash_bytes(&old_bytes),
                target_checksum: hash_bytes(&new_bytes),
                target_len: new_bytes.len() as u64,
                ops: binary::encode_ops(&ops),
            }),
            fell_back: false,
        })
    }

    #[cfg(not(feature = "binary-diff"))]
    fn binary_delta(_old_state: &State, _new_state: &State) -> Result<DeltaInfo> {
        Err(PersistError::delta("binary diff codec unavailable"))
    }

    /// Apply a delta to a base state
    pub fn apply_delta(&self, base_state: &State, delta: &DeltaInfo) -> Result<State> {
        let result = match &delta.patch {
            Some(patch) => Self::apply_patch(base_state, patch)?,
            None => Self::apply_changes(base_state, &delta.changes, &delta.removed_keys),
        };
        self.stats.lock().deltas_applied += 1;
        Ok(result)
    }

    /// Verify a stored record and apply it to a base state
    pub fn apply_record(&self, base_state: &State, record: &DeltaRecord) -> Result<State> {
        record.verify_checksum()?;
        let result = match &record.patch {
            Some(patch) => Self::apply_patch(base_state, patch)?,
            None => Self::apply_changes(base_state, &record.changes, &record.removed_keys),
        };
        self.stats.lock().deltas_applied += 1;
        Ok(result)
    }

    fn apply_changes(base_state: &State, changes: &State, removed_keys: &[String]) -> State {
        let mut state = base_state.clone();
        for (key, value) in changes {
            state.insert(key.clone(), value.clone());
        }
        for key in removed_keys {
            state.remove(key);
        }
        state
    }

    fn apply_patch(base_state: &State, patch: &BinaryPatch) -> Result<State> {
        let base_bytes = canonical_bytes(base_state)?;
        let base_checksum = hash_bytes(&base_bytes);
        if base_checksum != patch.base_checksum {
            return Err(PersistError::delta(format!(
                "binary delta base mismatch: expected {}, got {base_checksum}",
                patch.base_checksum
            )));
        }

        let target = binary::apply(&base_bytes, &patch.operations()?)?;
        let target_checksum = hash_bytes(&target);
        if target.len() as u64 != patch.target_len || target_checksum != patch.target_checksum {
            return Err(PersistError::delta(format!(
                "binary delta produced unexpected target: expected {}, got {target_checksum}",
                patch.target_checksum
            )));
        }

        serde_json::from_slice(&target)
            .map_err(|e| PersistError::delta(format!("binary delta target is not a state: {e}")))
    }

    /// Wrap raw changes into a checksummed dict-strategy record
    pub fn create_delta_record(
        &self,
        changes: State,
        removed_keys: Vec<String>,
        timestamp: Option<f64>,
    ) -> Result<DeltaRecord> {
        let mut metadata = Map::new();
        metadata.insert(
            STRATEGY_KEY.to_string(),
            Value::from(DeltaStrategy::Dict.as_str()),
        );
        self.build_record(changes, removed_keys, None, metadata, timestamp)
    }

    /// Turn a computed delta into a record
    pub fn record_from_info(&self, info: DeltaInfo, timestamp: Option<f64>) -> Result<DeltaRecord> {
        let mut metadata = Map::new();
        metadata.insert(
            STRATEGY_KEY.to_string(),
            Value::from(info.strategy.as_str()),
        );
        if info.fell_back {
            metadata.insert("fallback".to_string(), Value::Bool(true));
        }
        metadata.insert("unchanged".to_string(), Value::from(info.unchanged));
        self.build_record(
            info.changes,
            info.removed_keys,
            info.patch,
            metadata,
            timestamp,
        )
    }

    fn build_record(
        &self,
        changes: State,
        removed_keys: Vec<String>,
        patch: Option<BinaryPatch>,
        metadata: Map<String, Value>,
        timestamp: Option<f64>,
    ) -> Result<DeltaRecord> {
        DeltaRecord::check_disjoint(&changes, &removed_keys)?;

        let serialized = content_bytes(&changes, &removed_keys, patch.as_ref())?;
        let compressed = self.codec.compress(&serialized)?;
        let compression_ratio = if serialized.is_empty() {
            1.0
        } else {
            compressed.len() as f64 / serialized.len() as f64
        };

        let strategy = if patch.is_some() {
            DeltaStrategy::Binary
        } else {
            DeltaStrategy::Dict
        };

        let record = DeltaRecord {
            timestamp: timestamp.unwrap_or_else(crate::integrity::timestamp),
            checksum: hash_bytes(&serialized),
            size_bytes: serialized.len() as u64,
            changes,
            removed_keys,
            metadata,
            compression_ratio,
            patch,
        };

        let mut stats = self.stats.lock();
        stats.deltas_created += 1;
        stats.ratio_sum += compression_ratio;
        stats.total_delta_bytes += record.size_bytes;
        *stats
            .strategy_usage
            .entry(strategy.as_str().to_string())
            .or_insert(0) += 1;

        Ok(record)
    }

    /// Fold an ordered list of records into one
    ///
    /// Later writes win; a removal counts as writing "absent". A single record
    /// is returned unchanged and an empty list yields `None`.
    pub fn merge_deltas(&self, deltas: &[DeltaRecord]) -> Result<Option<DeltaRecord>> {
        match deltas {
            [] => return Ok(None),
            [single] => return Ok(Some(single.clone())),
            _ => {}
        }

        if deltas.iter().any(DeltaRecord::is_binary) {
            return Err(PersistError::delta(
                "binary delta records cannot be merged key-wise",
            ));
        }

        let mut changes = State::new();
        let mut removed: BTreeSet<String> = BTreeSet::new();

        for delta in deltas {
            delta.verify_checksum()?;
            for (key, value) in &delta.changes {
                removed.remove(key);
                changes.insert(key.clone(), value.clone());
            }
            for key in &delta.removed_keys {
                changes.remove(key);
                removed.insert(key.clone());
            }
        }

        let last_timestamp = deltas
            .last()
            .map(DeltaRecord::timestamp)
            .unwrap_or_else(timestamp);

        let mut metadata = Map::new();
        metadata.insert(
            STRATEGY_KEY.to_string(),
            Value::from(DeltaStrategy::Dict.as_str()),
        );
        metadata.insert("merged_from".to_string(), Value::from(deltas.len()));

        let merged = self.build_record(
            changes,
            removed.into_iter().collect(),
            None,
            metadata,
            Some(last_timestamp),
        )?;
        self.stats.lock().merges_performed += 1;

        debug!(
            merged = deltas.len(),
            operations = merged.operation_count(),
            "merged delta records"
        );
        Ok(Some(merged))
    }

    /// Encode a record as a framed, gzip-compressed byte string
    pub fn serialize_delta(&self, record: &DeltaRecord) -> Result<Vec<u8>> {
        let body = canonical_bytes(record)?;
        let compressed = self.codec.compress(&body)?;
        let body_len = u32::try_from(compressed.len())
            .map_err(|_| PersistError::delta("serialized delta exceeds 4 GiB"))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + compressed.len());
        buf.put_slice(DELTA_MAGIC);
        buf.put_u8(DELTA_FORMAT_VERSION);
        buf.put_u8(CODEC_GZIP);
        buf.put_u32_le(body_len);
        buf.put_slice(&compressed);
        Ok(buf)
    }

    /// Decode a record written by [`serialize_delta`](Self::serialize_delta)
    /// and verify its checksum
    pub fn deserialize_delta(&self, data: &[u8]) -> Result<DeltaRecord> {
        if data.len() < HEADER_LEN {
            return Err(PersistError::delta("serialized delta is truncated"));
        }

        let mut header = &data[..HEADER_LEN];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if &magic != DELTA_MAGIC {
            return Err(PersistError::delta("serialized delta has a bad magic"));
        }

        let version = header.get_u8();
        if version != DELTA_FORMAT_VERSION {
            return Err(PersistError::delta(format!(
                "unsupported delta format version {version}"
            )));
        }

        let codec = header.get_u8();
        let body_len = header.get_u32_le() as usize;
        let body = &data[HEADER_LEN..];
        if body.len() != body_len {
            return Err(PersistError::delta(format!(
                "serialized delta body is {} bytes, header says {body_len}",
                body.len()
            )));
        }

        let raw = match codec {
            CODEC_GZIP => self
                .codec
                .decompress(body)
                .map_err(|e| PersistError::delta(format!("cannot decompress delta: {e}")))?,
            CODEC_NONE => body.to_vec(),
            other => {
                return Err(PersistError::delta(format!(
                    "unknown delta codec {other}"
                )))
            }
        };

        let record: DeltaRecord = serde_json::from_slice(&raw)
            .map_err(|e| PersistError::delta(format!("cannot decode delta record: {e}")))?;
        record.verify_checksum()?;
        Ok(record)
    }

    /// Snapshot of the running totals
    pub fn get_compression_stats(&self) -> CompressionStats {
        let stats = self.stats.lock();
        CompressionStats {
            deltas_created: stats.deltas_created,
            average_compression_ratio: if stats.deltas_created == 0 {
                0.0
            } else {
                stats.ratio_sum / stats.deltas_created as f64
            },
            strategy_usage: stats.strategy_usage.clone(),
            fallback_count: stats.fallback_count,
            merges_performed: stats.merges_performed,
            deltas_applied: stats.deltas_applied,
            total_delta_bytes: stats.total_delta_bytes,
        }
    }

    /// Zero every counter reported by `get_compression_stats`
    pub fn reset_stats(&self) {
        *self.stats.lock() = StatsInner::default();
    }
}
