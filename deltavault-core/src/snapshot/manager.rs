/*!
Snapshot manager: versioned full and delta snapshots over a storage adapter.

The manager owns the registry. Mutating operations hold the registry write
lock from the first read until the registry file has been rewritten; readers
hold the read lock across the whole chain replay, so a concurrent delete can
never remove a link mid-reconstruction.
*/

use super::export::ExportPackage;
use super::metadata::{validate_version_id, SnapshotMetadata};
use super::payload::{materialized_key, payload_key, StoredPayload, MATERIALIZED_DIR, SNAPSHOT_DIR};
use super::registry::Registry;
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::config::{DependentPolicy, StorageBackend, VaultConfig};
use crate::delta::{CompressionStats, DeltaCompressor};
use crate::integrity::State;
use crate::metrics::{Operation, PersistenceMetrics, PersistenceStats};
use crate::storage::{LocalFileStorage, MemoryStorage, StorageAdapter};
use crate::{PersistError, Result};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Caller-supplied attributes of a new snapshot
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub user_info: Map<String, Value>,
    /// Explicit version id; a UUID v4 is generated when unset
    pub version: Option<String>,
}

impl SnapshotOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_user_info(mut self, user_info: Map<String, Value>) -> Self {
        self.user_info = user_info;
        self
    }

    pub fn with_user_entry<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }

    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Old and new value of a changed key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChange {
    pub old: Value,
    pub new: Value,
}

/// Key-level comparison of two snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotDiff {
    pub from_version: String,
    pub to_version: String,
    /// Keys only in the newer snapshot, with their values
    pub added: State,
    pub changed: BTreeMap<String, ValueChange>,
    /// Keys only in the older snapshot, with their old values
    pub removed: State,
    pub unchanged: usize,
}

impl SnapshotDiff {
    pub fn is_identical(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len()
    }
}

/// Outcome of [`SnapshotManager::verify_all`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationReport {
    pub checked: usize,
    pub valid: Vec<String>,
    /// Version id to error message
    pub failures: BTreeMap<String, String>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Registry-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStats {
    pub snapshot_count: usize,
    pub full_snapshots: usize,
    pub delta_snapshots: usize,
    pub tagged_snapshots: usize,
    pub tags: Vec<String>,
    /// Sum of the canonical full-state sizes
    pub total_state_bytes: u64,
    /// Sum of the stored payload sizes
    pub total_stored_bytes: u64,
    /// `1 - stored / state`, 0 when empty
    pub space_savings: f64,
    pub max_chain_depth: u32,
    pub oldest_created_at: Option<f64>,
    pub newest_created_at: Option<f64>,
    pub persistence: PersistenceStats,
    pub compression: CompressionStats,
}

/// Versioned snapshot store
///
/// # Example
/// ```rust
/// use deltavault_core::{MemoryStorage, SnapshotManager, SnapshotOptions, VaultConfig};
/// use serde_json::json;
///
/// let manager = SnapshotManager::new(MemoryStorage::new(), VaultConfig::memory())?;
///
/// let base = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
/// let v1 = manager.create_snapshot(&base, SnapshotOptions::new().with_tag("stable"))?;
///
/// let next = json!({"a": 1, "b": 3, "c": 4}).as_object().cloned().unwrap();
/// let v2 = manager.create_delta_snapshot(&next, Some(&v1), SnapshotOptions::new())?;
///
/// let (state, metadata) = manager.get_snapshot(&v2)?;
/// assert_eq!(state, next);
/// assert_eq!(metadata.base_version.as_deref(), Some(v1.as_str()));
/// # Ok::<(), deltavault_core::PersistError>(())
/// ```
pub struct SnapshotManager<S: StorageAdapter> {
    storage: S,
    config: VaultConfig,
    codec: Box<dyn CompressionAdapter>,
    delta: Arc<DeltaCompressor>,
    registry: RwLock<Registry>,
    metrics: PersistenceMetrics,
}

impl<S: StorageAdapter> SnapshotManager<S> {
    /// Open a manager over `storage`, loading any existing registry
    pub fn new(storage: S, config: VaultConfig) -> Result<Self> {
        config.validate()?;
        let registry = Registry::load(&storage, &config.registry_file)?;

        let mut delta = DeltaCompressor::new(config.delta.strategy);
        if let Some(level) = config.compression_level {
            delta = delta.with_codec(GzipCompressor::with_level(level));
        }

        info!(
            location = %storage.describe(),
            snapshots = registry.len(),
            strategy = %config.delta.strategy,
            "opened snapshot vault"
        );

        Ok(Self {
            codec: config.compression.build(config.compression_level),
            delta: Arc::new(delta),
            registry: RwLock::new(registry),
            metrics: PersistenceMetrics::new(),
            storage,
            config,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn delta_compressor(&self) -> &Arc<DeltaCompressor> {
        &self.delta
    }

    pub fn metrics(&self) -> &PersistenceMetrics {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    /// Store `data` in full
    #[instrument(skip(self, data, options), fields(version = options.version.as_deref()))]
    pub fn create_snapshot(&self, data: &State, options: SnapshotOptions) -> Result<String> {
        let timer = self.metrics.start(Operation::Save);
        let result = {
            let mut registry = self.registry.write();
            self.create_full_locked(&mut registry, data, options)
        };
        timer
            .observe(result, |(_, bytes)| *bytes)
            .map(|(version, _)| version)
    }

    /// Store `data` as a delta against `base_version`, or the latest snapshot
    ///
    /// Falls back to a full snapshot when the base's chain is already
    /// `max_chain_length` deltas deep.
    #[instrument(skip(self, data, options), fields(version = options.version.as_deref()))]
    pub fn create_delta_snapshot(
        &self,
        data: &State,
        base_version: Option<&str>,
        options: SnapshotOptions,
    ) -> Result<String> {
        let timer = self.metrics.start(Operation::Save);
        let result = {
            let mut registry = self.registry.write();
            self.create_delta_locked(&mut registry, data, base_version, options)
        };
        timer
            .observe(result, |(_, bytes)| *bytes)
            .map(|(version, _)| version)
    }

    /// Reconstructed state and metadata of `version`
    #[instrument(skip(self))]
    pub fn get_snapshot(&self, version: &str) -> Result<(State, SnapshotMetadata)> {
        let timer = self.metrics.start(Operation::Load);
        let result = {
            let registry = self.registry.read();
            self.read_snapshot(&registry, version)
        };
        timer.observe(result, |(_, metadata)| metadata.size_bytes)
    }

    /// Most recently created snapshot, if any
    pub fn get_latest_snapshot(&self) -> Result<Option<(State, SnapshotMetadata)>> {
        let registry = self.registry.read();
        let Some(latest) = registry.latest().map(|m| m.version.clone()) else {
            return Ok(None);
        };
        let timer = self.metrics.start(Operation::Load);
        timer
            .observe(self.read_snapshot(&registry, &latest), |(_, m)| m.size_bytes)
            .map(Some)
    }

    /// Snapshot carrying `tag`: the newest when `latest`, else the oldest
    pub fn get_snapshot_by_tag(&self, tag: &str, latest: bool) -> Result<(State, SnapshotMetadata)> {
        let registry = self.registry.read();
        let tagged = registry.with_tag(tag);
        let chosen = if latest { tagged.last() } else { tagged.first() };
        let version = chosen
            .map(|m| m.version.clone())
            .ok_or_else(|| PersistError::not_found(format!("snapshot tagged '{tag}'")))?;
        let timer = self.metrics.start(Operation::Load);
        timer.observe(self.read_snapshot(&registry, &version), |(_, m)| m.size_bytes)
    }

    pub fn get_metadata(&self, version: &str) -> Result<SnapshotMetadata> {
        self.registry
            .read()
            .get(version)
            .cloned()
            .ok_or_else(|| PersistError::not_found(version.to_string()))
    }

    pub fn latest_version(&self) -> Option<String> {
        self.registry.read().latest().map(|m| m.version.clone())
    }

    /// All snapshot metadata, oldest first
    pub fn list_snapshots(&self) -> Vec<SnapshotMetadata> {
        self.registry.read().ordered().into_iter().cloned().collect()
    }

    /// All version ids, oldest first
    pub fn list_versions(&self) -> Vec<String> {
        self.registry
            .read()
            .ordered()
            .into_iter()
            .map(|m| m.version.clone())
            .collect()
    }

    pub fn list_tags(&self) -> Vec<String> {
        self.registry.read().tags()
    }

    /// Add tags to a snapshot; tags already present are ignored
    pub fn tag_snapshot<I, T>(&self, version: &str, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.iter().any(|t| t.trim().is_empty()) {
            return Err(PersistError::validation("tags cannot be blank"));
        }
        self.update_tags(version, |metadata| {
            tags.iter()
                .fold(false, |changed, tag| metadata.add_tag(tag.as_str()) || changed)
        })
    }

    /// Remove tags from a snapshot; absent tags are ignored
    pub fn untag_snapshot<I, T>(&self, version: &str, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        self.update_tags(version, |metadata| {
            tags.iter()
                .fold(false, |changed, tag| metadata.remove_tag(tag) || changed)
        })
    }

    /// Delete a snapshot under the configured dependent policy
    #[instrument(skip(self))]
    pub fn delete_snapshot(&self, version: &str) -> Result<()> {
        self.delete_snapshot_with(version, self.config.dependent_policy)
    }

    /// Delete a snapshot under an explicit dependent policy
    pub fn delete_snapshot_with(&self, version: &str, policy: DependentPolicy) -> Result<()> {
        let timer = self.metrics.start(Operation::Delete);
        let result = {
            let mut registry = self.registry.write();
            self.delete_locked(&mut registry, version, policy)
        };
        if result.is_ok() {
            info!(version, "deleted snapshot");
        }
        timer.observe(result, |_| 0)
    }

    /// Rewrite a delta snapshot as a full snapshot
    ///
    /// Returns false if it already was one.
    pub fn materialize_snapshot(&self, version: &str) -> Result<bool> {
        let mut registry = self.registry.write();
        let metadata = registry
            .get(version)
            .ok_or_else(|| PersistError::not_found(version.to_string()))?;
        if !metadata.is_delta() {
            return Ok(false);
        }

        let mut next = registry.clone();
        let mut written = Vec::new();
        let mut obsolete = Vec::new();
        let result = self
            .materialize_into(&mut next, version, &mut written, &mut obsolete)
            .and_then(|()| {
                next.refresh_depths();
                next.persist(&self.storage, &self.config.registry_file)
            });
        self.finish_rewrite(&mut registry, next, result, written, obsolete)?;
        info!(version, "materialized delta snapshot");
        Ok(true)
    }

    /// Key-level differences from `from_version` to `to_version`
    pub fn compare_snapshots(&self, from_version: &str, to_version: &str) -> Result<SnapshotDiff> {
        let (old, new) = {
            let registry = self.registry.read();
            (
                self.reconstruct(&registry, from_version)?,
                self.reconstruct(&registry, to_version)?,
            )
        };

        let info = DeltaCompressor::dict_delta(&old, &new, false);
        let mut added = State::new();
        let mut changed = BTreeMap::new();
        for (key, value) in info.changes {
            match old.get(&key) {
                Some(previous) => {
                    changed.insert(
                        key,
                        ValueChange {
                            old: previous.clone(),
                            new: value,
                        },
                    );
                }
                None => {
                    added.insert(key, value);
                }
            }
        }
        let removed = info
            .removed_keys
            .into_iter()
            .filter_map(|key| old.get(&key).cloned().map(|value| (key, value)))
            .collect();

        Ok(SnapshotDiff {
            from_version: from_version.to_string(),
            to_version: to_version.to_string(),
            added,
            changed,
            removed,
            unchanged: info.unchanged,
        })
    }

    /// Write a fully reconstructed, self-contained copy of `version` to `path`
    #[instrument(skip(self, path))]
    pub fn export_snapshot<P: AsRef<Path>>(&self, version: &str, path: P) -> Result<()> {
        let (state, metadata) = self.get_snapshot(version)?;
        let package = ExportPackage::new(&metadata, state)?;
        package.write_to(path.as_ref())?;
        info!(version, path = %path.as_ref().display(), "exported snapshot");
        Ok(())
    }

    /// Register an exported package as a new full snapshot
    ///
    /// The snapshot gets a fresh UUID unless `new_version` is given; tags,
    /// description and user info carry over.
    #[instrument(skip(self, path))]
    pub fn import_snapshot<P: AsRef<Path>>(&self, path: P, new_version: Option<&str>) -> Result<String> {
        let package = ExportPackage::read_from(path.as_ref())?;
        let metadata = package.metadata;
        let options = SnapshotOptions {
            tags: metadata.tags,
            description: metadata.description,
            user_info: metadata.user_info,
            version: new_version.map(str::to_string),
        };
        let version = self.create_snapshot(&package.state, options)?;
        info!(
            version = %version,
            source_version = %metadata.version,
            "imported snapshot"
        );
        Ok(version)
    }

    /// Check every hop of `version`'s chain without returning the state
    pub fn verify_snapshot(&self, version: &str) -> Result<()> {
        let registry = self.registry.read();
        self.reconstruct(&registry, version).map(|_| ())
    }

    /// Verify every snapshot in parallel
    pub fn verify_all(&self) -> VerificationReport {
        let registry = self.registry.read();
        let registry: &Registry = &registry;
        let versions: Vec<&String> = registry.snapshots.keys().collect();

        let results: Vec<(String, Result<()>)> = versions
            .par_iter()
            .map(|version| {
                let outcome = self.reconstruct(registry, version).map(|_| ());
                ((*version).clone(), outcome)
            })
            .collect();

        let mut report = VerificationReport {
            checked: results.len(),
            ..VerificationReport::default()
        };
        for (version, outcome) in results {
            match outcome {
                Ok(()) => report.valid.push(version),
                Err(e) => {
                    warn!(version = %version, error = %e, "snapshot failed verification");
                    report.failures.insert(version, e.to_string());
                }
            }
        }
        report
    }

    pub fn get_statistics(&self) -> ManagerStats {
        let registry = self.registry.read();
        let entries: Vec<&SnapshotMetadata> = registry.ordered();

        let total_state_bytes: u64 = entries.iter().map(|m| m.size_bytes).sum();
        let total_stored_bytes: u64 = entries.iter().map(|m| m.stored_size).sum();
        let delta_snapshots = entries.iter().filter(|m| m.is_delta()).count();

        ManagerStats {
            snapshot_count: entries.len(),
            full_snapshots: entries.len() - delta_snapshots,
            delta_snapshots,
            tagged_snapshots: entries.iter().filter(|m| m.is_tagged()).count(),
            tags: registry.tags(),
            total_state_bytes,
            total_stored_bytes,
            space_savings: if total_state_bytes == 0 {
                0.0
            } else {
                1.0 - total_stored_bytes as f64 / total_state_bytes as f64
            },
            max_chain_depth: entries.iter().map(|m| m.chain_depth).max().unwrap_or(0),
            oldest_created_at: entries.first().map(|m| m.created_at),
            newest_created_at: entries.last().map(|m| m.created_at),
            persistence: self.metrics.snapshot(),
            compression: self.delta.get_compression_stats(),
        }
    }

    /// Flush the registry to storage
    pub fn cleanup(&self) -> Result<()> {
        let registry = self.registry.write();
        registry.persist(&self.storage, &self.config.registry_file)?;
        debug!(snapshots = registry.len(), "snapshot vault flushed");
        Ok(())
    }

    /// Delete every snapshot and reset the registry
    ///
    /// Returns the number of snapshots removed. Irreversible.
    #[instrument(skip(self))]
    pub fn clear_all(&self) -> Result<usize> {
        let timer = self.metrics.start(Operation::Clear);
        let result = {
            let mut registry = self.registry.write();
            self.clear_locked(&mut registry)
        };
        timer.observe(result, |_| 0)
    }

    fn clear_locked(&self, registry: &mut Registry) -> Result<usize> {
        let count = registry.len();
        warn!(
            count,
            location = %self.storage.describe(),
            "clearing all snapshots"
        );

        let mut keys: BTreeSet<String> = registry.locations.values().cloned().collect();
        keys.extend(self.storage.list(&format!("{SNAPSHOT_DIR}/"))?);
        keys.extend(self.storage.list(&format!("{MATERIALIZED_DIR}/"))?);

        let empty = Registry {
            next_sequence: registry.next_sequence,
            ..Registry::default()
        };
        empty.persist(&self.storage, &self.config.registry_file)?;
        *registry = empty;

        let mut failed = Vec::new();
        for key in keys {
            if let Err(e) = self.storage.delete(&key) {
                error!(key = %key, error = %e, "failed to delete snapshot data");
                failed.push(key);
            }
        }
        if !failed.is_empty() {
            return Err(PersistError::storage(format!(
                "registry cleared but {} data file(s) could not be deleted: {}",
                failed.len(),
                failed.join(", ")
            )));
        }
        Ok(count)
    }

    fn create_full_locked(
        &self,
        registry: &mut Registry,
        data: &State,
        options: SnapshotOptions,
    ) -> Result<(String, u64)> {
        let version = self.assign_version(registry, options.version.as_deref())?;
        let metadata = self.new_metadata(registry, &version, options);
        let payload = StoredPayload::Full {
            state: data.clone(),
        };
        let bytes = self.store_new(registry, metadata, data, &payload)?;
        info!(version = %version, stored_bytes = bytes, "created full snapshot");

        self.retain_or_roll_back(registry, &version)?;
        Ok((version, bytes))
    }

    fn create_delta_locked(
        &self,
        registry: &mut Registry,
        data: &State,
        base_version: Option<&str>,
        options: SnapshotOptions,
    ) -> Result<(String, u64)> {
        let base = match base_version {
            Some(version) => registry
                .get(version)
                .ok_or_else(|| PersistError::not_found(format!("base snapshot {version}")))?,
            None => registry
                .latest()
                .ok_or_else(|| PersistError::not_found("base snapshot (vault is empty)"))?,
        };
        let base_id = base.version.clone();
        let depth = base.chain_depth + 1;

        if depth as usize > self.config.delta.max_chain_length {
            info!(
                base = %base_id,
                max_chain_length = self.config.delta.max_chain_length,
                "delta chain limit reached, storing full snapshot"
            );
            return self.create_full_locked(registry, data, options);
        }

        let version = self.assign_version(registry, options.version.as_deref())?;
        let base_state = self.reconstruct(registry, &base_id)?;
        let info = self.delta.calculate_delta(&base_state, data, false)?;
        let operations = info.changes.len() + info.removed_keys.len();
        let record = self.delta.record_from_info(info, None)?;

        let metadata = self
            .new_metadata(registry, &version, options)
            .with_base(base_id.as_str(), depth);
        let payload = StoredPayload::Delta {
            base_version: base_id.clone(),
            delta: record,
        };
        let bytes = self.store_new(registry, metadata, data, &payload)?;
        info!(
            version = %version,
            base = %base_id,
            depth,
            operations,
            stored_bytes = bytes,
            "created delta snapshot"
        );

        self.retain_or_roll_back(registry, &version)?;
        Ok((version, bytes))
    }

    fn assign_version(&self, registry: &Registry, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(version) => {
                validate_version_id(version)?;
                if registry.contains(version) {
                    return Err(PersistError::versioning(format!(
                        "version {version} already exists"
                    )));
                }
                Ok(version.to_string())
            }
            None => Ok(Uuid::new_v4().to_string()),
        }
    }

    fn new_metadata(
        &self,
        registry: &Registry,
        version: &str,
        options: SnapshotOptions,
    ) -> SnapshotMetadata {
        let mut metadata = SnapshotMetadata::new(version, registry.next_sequence)
            .with_tags(options.tags)
            .with_user_info(options.user_info)
            .with_compression_algorithm(self.codec.algorithm_name());
        metadata.description = options.description;
        metadata
    }

    /// Write a new data file, then the registry; undo the data file on failure
    fn store_new(
        &self,
        registry: &mut Registry,
        mut metadata: SnapshotMetadata,
        state: &State,
        payload: &StoredPayload,
    ) -> Result<u64> {
        metadata.update_integrity_info(state)?;
        let bytes = payload.encode(self.codec.as_ref())?;
        metadata.update_payload_info(&bytes);
        metadata.validate()?;

        let key = payload_key(&metadata.version);
        self.storage.save(&bytes, &key).map_err(|e| {
            PersistError::snapshot(format!(
                "Failed to store snapshot {}: {e}",
                metadata.version
            ))
        })?;

        let mut next = registry.clone();
        next.insert(metadata, key.clone());
        if let Err(e) = next.persist(&self.storage, &self.config.registry_file) {
            self.discard(&key);
            return Err(PersistError::snapshot(format!(
                "Failed to persist registry: {e}"
            )));
        }
        *registry = next;
        Ok(bytes.len() as u64)
    }

    fn read_snapshot(&self, registry: &Registry, version: &str) -> Result<(State, SnapshotMetadata)> {
        let metadata = registry
            .get(version)
            .cloned()
            .ok_or_else(|| PersistError::not_found(version.to_string()))?;
        let state = self.reconstruct(registry, version)?;
        Ok((state, metadata))
    }

    /// Replay `version`'s chain from its full base, verifying every hop
    fn reconstruct(&self, registry: &Registry, version: &str) -> Result<State> {
        let chain = registry.chain_to_base(version)?;
        let mut hops = chain.into_iter().rev();
        let base = hops
            .next()
            .ok_or_else(|| PersistError::not_found(version.to_string()))?;

        let mut state = match self.load_payload(registry, base)? {
            StoredPayload::Full { state } => state,
            StoredPayload::Delta { .. } => {
                return Err(PersistError::snapshot(format!(
                    "snapshot {} is registered as full but stores a delta",
                    base.version
                )))
            }
        };
        base.verify_integrity(&state)?;

        for hop in hops {
            match self.load_payload(registry, hop)? {
                StoredPayload::Delta {
                    base_version,
                    delta,
                } if hop.base_version.as_deref() == Some(base_version.as_str()) => {
                    state = self.delta.apply_record(&state, &delta)?;
                }
                _ => {
                    return Err(PersistError::snapshot(format!(
                        "stored payload of snapshot {} does not match its registry entry",
                        hop.version
                    )))
                }
            }
            hop.verify_integrity(&state)?;
        }

        debug!(version, "reconstructed snapshot");
        Ok(state)
    }

    fn load_payload(&self, registry: &Registry, metadata: &SnapshotMetadata) -> Result<StoredPayload> {
        let key = registry.location(&metadata.version).ok_or_else(|| {
            PersistError::snapshot(format!("no location for snapshot {}", metadata.version))
        })?;
        if !self.storage.exists(key) {
            return Err(PersistError::not_found(format!(
                "data file {key} of snapshot {}",
                metadata.version
            )));
        }
        let bytes = self.storage.load(key)?;
        metadata.verify_payload(&bytes)?;
        StoredPayload::decode(&bytes)
    }

    fn update_tags(
        &self,
        version: &str,
        mutate: impl FnOnce(&mut SnapshotMetadata) -> bool,
    ) -> Result<()> {
        let mut registry = self.registry.write();
        let mut next = registry.clone();
        let metadata = next
            .get_mut(version)
            .ok_or_else(|| PersistError::not_found(version.to_string()))?;
        if !mutate(metadata) {
            return Ok(());
        }
        let tags = metadata.tags.clone();
        next.persist(&self.storage, &self.config.registry_file)?;
        *registry = next;
        debug!(version, ?tags, "updated snapshot tags");
        Ok(())
    }

    fn delete_locked(
        &self,
        registry: &mut Registry,
        version: &str,
        policy: DependentPolicy,
    ) -> Result<()> {
        if !registry.contains(version) {
            return Err(PersistError::not_found(version.to_string()));
        }
        let dependents = registry.dependents(version);
        if !dependents.is_empty() && policy == DependentPolicy::Forbid {
            return Err(PersistError::snapshot(format!(
                "snapshot {version} is the base of {} delta snapshot(s): {}",
                dependents.len(),
                dependents.join(", ")
            )));
        }

        let mut next = registry.clone();
        let mut written = Vec::new();
        let mut obsolete = Vec::new();
        let result = self.remove_into(&mut next, version, &dependents, &mut written, &mut obsolete);
        self.finish_rewrite(registry, next, result, written, obsolete)?;
        if !dependents.is_empty() {
            info!(version, dependents = ?dependents, "materialized dependents before deletion");
        }
        Ok(())
    }

    fn remove_into(
        &self,
        next: &mut Registry,
        version: &str,
        dependents: &[String],
        written: &mut Vec<String>,
        obsolete: &mut Vec<String>,
    ) -> Result<()> {
        for dependent in dependents {
            self.materialize_into(next, dependent, written, obsolete)?;
        }
        if let Some((_, key)) = next.remove(version) {
            obsolete.push(key);
        }
        next.refresh_depths();
        next.persist(&self.storage, &self.config.registry_file)
    }

    /// Store `version` in full under a new key and repoint `next` at it
    fn materialize_into(
        &self,
        next: &mut Registry,
        version: &str,
        written: &mut Vec<String>,
        obsolete: &mut Vec<String>,
    ) -> Result<()> {
        let state = self.reconstruct(next, version)?;
        let bytes = StoredPayload::Full { state }.encode(self.codec.as_ref())?;
        let key = materialized_key(version);
        self.storage.save(&bytes, &key)?;
        written.push(key.clone());

        let metadata = next
            .get_mut(version)
            .ok_or_else(|| PersistError::not_found(version.to_string()))?;
        metadata.base_version = None;
        metadata.chain_depth = 0;
        metadata.compression_algorithm = self.codec.algorithm_name().to_string();
        metadata.update_payload_info(&bytes);

        if let Some(old) = next.locations.insert(version.to_string(), key.clone()) {
            if old != key {
                obsolete.push(old);
            }
        }
        Ok(())
    }

    /// Commit `next` or roll back newly written files
    fn finish_rewrite(
        &self,
        registry: &mut Registry,
        next: Registry,
        result: Result<()>,
        written: Vec<String>,
        obsolete: Vec<String>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                *registry = next;
                for key in obsolete {
                    self.discard(&key);
                }
                Ok(())
            }
            Err(e) => {
                for key in written {
                    self.discard(&key);
                }
                Err(e)
            }
        }
    }

    /// Enforce retention after creating `created`, removing it again if the
    /// limit cannot be met
    fn retain_or_roll_back(&self, registry: &mut Registry, created: &str) -> Result<()> {
        let Err(e) = self.enforce_snapshot_limit(registry, created) else {
            return Ok(());
        };
        match self.delete_locked(registry, created, DependentPolicy::Forbid) {
            Ok(()) => warn!(version = created, "rolled back snapshot that could not be retained"),
            Err(rollback) => {
                error!(version = created, error = %rollback, "failed to roll back new snapshot")
            }
        }
        Err(e)
    }

    /// Evict until the retention limit holds; returns the eviction count
    ///
    /// Candidates are tried oldest untagged first, then oldest tagged, never
    /// `created`. A candidate that fails to evict is skipped. Evictions that
    /// succeeded before an error stay in effect.
    fn enforce_snapshot_limit(&self, registry: &mut Registry, created: &str) -> Result<usize> {
        let max = self.config.max_snapshots;
        let mut evicted = 0;
        if max == 0 {
            return Ok(evicted);
        }

        let mut failed: BTreeMap<String, String> = BTreeMap::new();
        while registry.len() > max {
            let victim = eviction_candidates(registry, created)
                .into_iter()
                .find(|version| !failed.contains_key(version));
            let Some(victim) = victim else {
                break;
            };
            match self.delete_locked(registry, &victim, DependentPolicy::Materialize) {
                Ok(()) => {
                    info!(version = %victim, max_snapshots = max, "evicted snapshot over retention limit");
                    evicted += 1;
                    // removing a dependent can unblock its base
                    failed.clear();
                }
                Err(e) => {
                    warn!(version = %victim, error = %e, "retention eviction failed, trying next candidate");
                    failed.insert(victim, e.to_string());
                }
            }
        }

        if registry.len() > max {
            let reasons: Vec<String> = failed
                .iter()
                .map(|(version, reason)| format!("{version}: {reason}"))
                .collect();
            error!(max_snapshots = max, snapshots = registry.len(), "retention limit cannot be met");
            return Err(PersistError::snapshot(format!(
                "retention limit of {max} snapshots cannot be met: {}",
                reasons.join("; ")
            )));
        }
        Ok(evicted)
    }

    fn discard(&self, key: &str) {
        if let Err(e) = self.storage.delete(key) {
            warn!(key, error = %e, "failed to remove snapshot data file");
        }
    }
}

/// Eviction order: untagged oldest first, then tagged oldest first
fn eviction_candidates(registry: &Registry, created: &str) -> Vec<String> {
    let (untagged, tagged): (Vec<_>, Vec<_>) = registry
        .ordered()
        .into_iter()
        .filter(|m| m.version != created)
        .partition(|m| !m.is_tagged());
    untagged
        .into_iter()
        .chain(tagged)
        .map(|m| m.version.clone())
        .collect()
}

/// Build a manager over the storage backend named in `config`
///
/// # Example
/// ```rust
/// use deltavault_core::{open_manager, VaultConfig};
///
/// let manager = open_manager(VaultConfig::memory())?;
/// assert!(manager.is_empty());
/// # Ok::<(), deltavault_core::PersistError>(())
/// ```
pub fn open_manager(config: VaultConfig) -> Result<SnapshotManager<Box<dyn StorageAdapter>>> {
    let storage: Box<dyn StorageAdapter> = match config.backend {
        StorageBackend::Local => Box::new(LocalFileStorage::with_base_dir(config.base_path())),
        StorageBackend::Memory => Box::new(MemoryStorage::new()),
    };
    SnapshotManager::new(storage, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeltaConfig, DEFAULT_REGISTRY_FILE};
    use serde_json::json;

    fn state(value: Value) -> State {
        serde_json::from_value(value).unwrap()
    }

    fn manager() -> SnapshotManager<MemoryStorage> {
        SnapshotManager::new(MemoryStorage::new(), VaultConfig::memory()).unwrap()
    }

    fn manager_with(config: VaultConfig) -> (SnapshotManager<MemoryStorage>, MemoryStorage) {
        let storage = MemoryStorage::new();
        let manager = SnapshotManager::new(storage.clone(), config).unwrap();
        (manager, storage)
    }

    /// Memory storage whose registry writes follow a script of outcomes
    struct ScriptedRegistry {
        inner: MemoryStorage,
        outcomes: parking_lot::Mutex<std::collections::VecDeque<bool>>,
    }

    impl ScriptedRegistry {
        fn new(inner: MemoryStorage) -> Self {
            Self {
                inner,
                outcomes: parking_lot::Mutex::new(Default::default()),
            }
        }

        fn script(&self, outcomes: &[bool]) {
            self.outcomes.lock().extend(outcomes.iter().copied());
        }
    }

    impl StorageAdapter for ScriptedRegistry {
        fn save(&self, data: &[u8], key: &str) -> Result<()> {
            if key == DEFAULT_REGISTRY_FILE && self.outcomes.lock().pop_front() == Some(false) {
                return Err(PersistError::storage("disk full"));
            }
            self.inner.save(data, key)
        }

        fn load(&self, key: &str) -> Result<Vec<u8>> {
            self.inner.load(key)
        }

        fn exists(&self, key: &str) -> bool {
            self.inner.exists(key)
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[test]
    fn test_full_snapshot_roundtrip() {
        let manager = manager();
        let data = state(json!({"a": 1, "b": [true, null]}));
        let version = manager
            .create_snapshot(&data, SnapshotOptions::new().with_description("first"))
            .unwrap();

        let (restored, metadata) = manager.get_snapshot(&version).unwrap();
        assert_eq!(restored, data);
        assert_eq!(metadata.description.as_deref(), Some("first"));
        assert!(!metadata.is_delta());
        assert!(Uuid::parse_str(&version).is_ok());
    }

    #[test]
    fn test_delta_defaults_to_latest_base() {
        let manager = manager();
        let v1 = manager
            .create_snapshot(&state(json!({"a": 1, "b": 2})), SnapshotOptions::new())
            .unwrap();
        let target = state(json!({"a": 1, "b": 3, "c": 4}));
        let v2 = manager
            .create_delta_snapshot(&target, None, SnapshotOptions::new())
            .unwrap();

        let (restored, metadata) = manager.get_snapshot(&v2).unwrap();
        assert_eq!(restored, target);
        assert_eq!(metadata.base_version.as_deref(), Some(v1.as_str()));
        assert_eq!(metadata.chain_depth, 1);
        assert!(metadata.stored_size > 0);
    }

    #[test]
    fn test_delta_requires_base() {
        let manager = manager();
        let err = manager
            .create_delta_snapshot(&state(json!({"a": 1})), None, SnapshotOptions::new())
            .unwrap_err();
        assert!(err.is_not_found());

        let err = manager
            .create_delta_snapshot(&state(json!({"a": 1})), Some("missing"), SnapshotOptions::new())
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_duplicate_and_invalid_versions() {
        let manager = manager();
        let data = state(json!({"a": 1}));
        manager
            .create_snapshot(&data, SnapshotOptions::new().with_version("v1"))
            .unwrap();

        let err = manager
            .create_snapshot(&data, SnapshotOptions::new().with_version("v1"))
            .unwrap_err();
        assert!(matches!(err, PersistError::Versioning(_)));

        let err = manager
            .create_snapshot(&data, SnapshotOptions::new().with_version("a/b"))
            .unwrap_err();
        assert!(matches!(err, PersistError::Versioning(_)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_chain_limit_stores_full_snapshot() {
        let config = VaultConfig::memory().with_delta(DeltaConfig {
            max_chain_length: 2,
            keep_recent: 1,
            ..DeltaConfig::default()
        });
        let (manager, _) = manager_with(config);

        manager
            .create_snapshot(&state(json!({"n": 0})), SnapshotOptions::new())
            .unwrap();
        let mut depths = Vec::new();
        for n in 1..=4 {
            let version = manager
                .create_delta_snapshot(&state(json!({"n": n})), None, SnapshotOptions::new())
                .unwrap();
            depths.push(manager.get_metadata(&version).unwrap().chain_depth);
        }
        assert_eq!(depths, vec![1, 2, 0, 1]);
    }

    #[test]
    fn test_tagging_is_idempotent() {
        let manager = manager();
        let version = manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new())
            .unwrap();

        manager.tag_snapshot(&version, ["stable"]).unwrap();
        manager.tag_snapshot(&version, ["stable"]).unwrap();
        assert_eq!(manager.get_metadata(&version).unwrap().tags, vec!["stable"]);
        assert_eq!(manager.list_tags(), vec!["stable"]);

        manager.untag_snapshot(&version, ["stable", "absent"]).unwrap();
        assert!(manager.list_tags().is_empty());

        assert!(manager.tag_snapshot("missing", ["x"]).unwrap_err().is_not_found());
        assert!(manager.tag_snapshot(&version, [" "]).is_err());
    }

    #[test]
    fn test_get_by_tag_oldest_and_latest() {
        let manager = manager();
        let first = manager
            .create_snapshot(&state(json!({"n": 1})), SnapshotOptions::new().with_tag("stable"))
            .unwrap();
        let second = manager
            .create_snapshot(&state(json!({"n": 2})), SnapshotOptions::new().with_tag("stable"))
            .unwrap();

        assert_eq!(manager.get_snapshot_by_tag("stable", false).unwrap().1.version, first);
        assert_eq!(manager.get_snapshot_by_tag("stable", true).unwrap().1.version, second);
        assert!(manager.get_snapshot_by_tag("nope", true).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_base_forbidden_by_default() {
        let manager = manager();
        let v1 = manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new())
            .unwrap();
        let v2 = manager
            .create_delta_snapshot(&state(json!({"a": 2})), Some(&v1), SnapshotOptions::new())
            .unwrap();

        let err = manager.delete_snapshot(&v1).unwrap_err();
        assert!(matches!(err, PersistError::Snapshot(_)));
        assert_eq!(manager.len(), 2);

        manager.delete_snapshot(&v2).unwrap();
        manager.delete_snapshot(&v1).unwrap();
        assert!(manager.is_empty());
        assert!(manager.delete_snapshot(&v1).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_base_with_materialize_policy() {
        let (manager, storage) = manager_with(
            VaultConfig::memory().with_dependent_policy(DependentPolicy::Materialize),
        );
        let v1 = manager
            .create_snapshot(&state(json!({"a": 1, "b": 2})), SnapshotOptions::new())
            .unwrap();
        let v2 = manager
            .create_delta_snapshot(&state(json!({"a": 2, "b": 2})), Some(&v1), SnapshotOptions::new())
            .unwrap();
        let v3 = manager
            .create_delta_snapshot(&state(json!({"a": 3})), Some(&v2), SnapshotOptions::new())
            .unwrap();

        manager.delete_snapshot(&v1).unwrap();

        let metadata = manager.get_metadata(&v2).unwrap();
        assert!(!metadata.is_delta());
        assert_eq!(manager.get_metadata(&v3).unwrap().chain_depth, 1);
        assert_eq!(manager.get_snapshot(&v3).unwrap().0, state(json!({"a": 3})));
        assert!(!storage.exists(&payload_key(&v1)));
        assert!(!storage.exists(&payload_key(&v2)));
        assert!(storage.exists(&materialized_key(&v2)));
    }

    #[test]
    fn test_materialize_snapshot() {
        let manager = manager();
        let v1 = manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new())
            .unwrap();
        let v2 = manager
            .create_delta_snapshot(&state(json!({"a": 1, "b": 2})), None, SnapshotOptions::new())
            .unwrap();

        assert!(!manager.materialize_snapshot(&v1).unwrap());
        assert!(manager.materialize_snapshot(&v2).unwrap());
        manager.delete_snapshot(&v1).unwrap();
        assert_eq!(manager.get_snapshot(&v2).unwrap().0, state(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_retention_prefers_untagged() {
        let (manager, _) = manager_with(VaultConfig::memory().with_max_snapshots(2));
        let kept = manager
            .create_snapshot(&state(json!({"n": 0})), SnapshotOptions::new().with_tag("keep"))
            .unwrap();
        let dropped = manager
            .create_snapshot(&state(json!({"n": 1})), SnapshotOptions::new())
            .unwrap();
        let newest = manager
            .create_snapshot(&state(json!({"n": 2})), SnapshotOptions::new())
            .unwrap();

        assert_eq!(manager.list_versions(), vec![kept, newest]);
        assert!(manager.get_metadata(&dropped).unwrap_err().is_not_found());
    }

    #[test]
    fn test_retention_materializes_dependents() {
        let (manager, _) = manager_with(VaultConfig::memory().with_max_snapshots(2));
        let base = manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new())
            .unwrap();
        let child = manager
            .create_delta_snapshot(&state(json!({"a": 2})), Some(&base), SnapshotOptions::new())
            .unwrap();
        let grandchild = manager
            .create_delta_snapshot(&state(json!({"a": 3})), Some(&child), SnapshotOptions::new())
            .unwrap();

        assert_eq!(manager.list_versions(), vec![child.clone(), grandchild.clone()]);
        assert!(!manager.get_metadata(&child).unwrap().is_delta());
        assert_eq!(manager.get_snapshot(&grandchild).unwrap().0, state(json!({"a": 3})));
    }

    #[test]
    fn test_retention_never_evicts_new_snapshot() {
        let (manager, _) = manager_with(VaultConfig::memory().with_max_snapshots(2));
        let first = manager
            .create_snapshot(&state(json!({"n": 1})), SnapshotOptions::new().with_tag("keep"))
            .unwrap();
        let second = manager
            .create_snapshot(&state(json!({"n": 2})), SnapshotOptions::new().with_tag("keep"))
            .unwrap();
        let plain = manager
            .create_snapshot(&state(json!({"n": 3})), SnapshotOptions::new())
            .unwrap();

        assert_eq!(manager.get_snapshot(&plain).unwrap().0, state(json!({"n": 3})));
        assert!(manager.get_metadata(&first).unwrap_err().is_not_found());
        assert_eq!(manager.list_versions(), vec![second, plain]);
    }

    #[test]
    fn test_retention_rolls_back_when_nothing_can_be_evicted() {
        let memory = MemoryStorage::new();
        let config = VaultConfig::memory().with_max_snapshots(1);
        let manager = SnapshotManager::new(ScriptedRegistry::new(memory.clone()), config.clone()).unwrap();
        manager
            .create_snapshot(&state(json!({"n": 1})), SnapshotOptions::new().with_version("v1"))
            .unwrap();

        // new snapshot commits, evicting v1 fails, rolling back commits
        manager.storage().script(&[true, false, true]);
        let err = manager
            .create_snapshot(&state(json!({"n": 2})), SnapshotOptions::new().with_version("v2"))
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Snapshot);
        assert!(err.to_string().contains("retention limit"));
        assert_eq!(manager.list_versions(), vec!["v1".to_string()]);
        assert!(!memory.exists(&payload_key("v2")));
        assert!(memory.exists(&payload_key("v1")));

        let reopened = SnapshotManager::new(memory, config).unwrap();
        assert_eq!(reopened.list_versions(), vec!["v1".to_string()]);
        assert_eq!(reopened.get_snapshot("v1").unwrap().0, state(json!({"n": 1})));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let (manager, storage) = manager_with(VaultConfig::memory());
        let version = manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new())
            .unwrap();

        let key = payload_key(&version);
        let mut bytes = storage.load(&key).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        storage.save(&bytes, &key).unwrap();

        let err = manager.get_snapshot(&version).unwrap_err();
        assert!(err.is_integrity_failure());
        assert!(manager.verify_snapshot(&version).is_err());
        assert_eq!(manager.metrics().snapshot().error_count, 1);
    }

    #[test]
    fn test_missing_data_file_is_not_found() {
        let (manager, storage) = manager_with(VaultConfig::memory());
        let v1 = manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new())
            .unwrap();
        let v2 = manager
            .create_delta_snapshot(&state(json!({"a": 2})), None, SnapshotOptions::new())
            .unwrap();

        storage.delete(&payload_key(&v1)).unwrap();
        assert!(manager.get_snapshot(&v2).unwrap_err().is_not_found());
    }

    #[test]
    fn test_compare_snapshots() {
        let manager = manager();
        let v1 = manager
            .create_snapshot(&state(json!({"a": 1, "b": 2, "c": 3})), SnapshotOptions::new())
            .unwrap();
        let v2 = manager
            .create_snapshot(&state(json!({"a": 1, "b": 20, "d": 4})), SnapshotOptions::new())
            .unwrap();

        let diff = manager.compare_snapshots(&v1, &v2).unwrap();
        assert_eq!(diff.added, state(json!({"d": 4})));
        assert_eq!(diff.removed, state(json!({"c": 3})));
        assert_eq!(
            diff.changed.get("b"),
            Some(&ValueChange {
                old: json!(2),
                new: json!(20)
            })
        );
        assert_eq!(diff.unchanged, 1);
        assert_eq!(diff.change_count(), 3);
        assert!(manager.compare_snapshots(&v1, &v1).unwrap().is_identical());
    }

    #[test]
    fn test_verify_all_reports_failures() {
        let (manager, storage) = manager_with(VaultConfig::memory());
        let good = manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new())
            .unwrap();
        let bad = manager
            .create_snapshot(&state(json!({"b": 1})), SnapshotOptions::new())
            .unwrap();
        storage.save(b"garbage", &payload_key(&bad)).unwrap();

        let report = manager.verify_all();
        assert_eq!(report.checked, 2);
        assert_eq!(report.valid, vec![good]);
        assert!(report.failures.contains_key(&bad));
        assert!(!report.is_ok());
    }

    #[test]
    fn test_statistics() {
        let manager = manager();
        manager
            .create_snapshot(&state(json!({"a": "x".repeat(200)})), SnapshotOptions::new().with_tag("t"))
            .unwrap();
        manager
            .create_delta_snapshot(&state(json!({"a": "x".repeat(200), "b": 1})), None, SnapshotOptions::new())
            .unwrap();

        let stats = manager.get_statistics();
        assert_eq!(stats.snapshot_count, 2);
        assert_eq!(stats.full_snapshots, 1);
        assert_eq!(stats.delta_snapshots, 1);
        assert_eq!(stats.tagged_snapshots, 1);
        assert_eq!(stats.max_chain_depth, 1);
        assert!(stats.space_savings > 0.0);
        assert_eq!(stats.persistence.save_count, 2);
        assert_eq!(stats.compression.deltas_created, 1);
    }

    #[test]
    fn test_latest_version_and_shared_compressor() {
        let manager = manager();
        assert_eq!(manager.latest_version(), None);

        manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new())
            .unwrap();
        let tip = manager
            .create_delta_snapshot(&state(json!({"a": 2})), None, SnapshotOptions::new())
            .unwrap();
        assert_eq!(manager.latest_version(), Some(tip));

        let compressor = manager.delta_compressor();
        assert_eq!(compressor.strategy(), manager.config().delta.strategy);
        assert_eq!(compressor.get_compression_stats(), manager.get_statistics().compression);
        assert_eq!(compressor.get_compression_stats().deltas_created, 1);
    }

    #[test]
    fn test_cleanup_rewrites_registry() {
        let (manager, storage) = manager_with(VaultConfig::memory());
        let version = manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new().with_tag("t"))
            .unwrap();

        storage.delete(DEFAULT_REGISTRY_FILE).unwrap();
        assert!(SnapshotManager::new(storage.clone(), VaultConfig::memory())
            .unwrap()
            .is_empty());

        manager.cleanup().unwrap();
        assert!(storage.exists(DEFAULT_REGISTRY_FILE));
        let reopened = SnapshotManager::new(storage, VaultConfig::memory()).unwrap();
        assert_eq!(reopened.list_versions(), vec![version.clone()]);
        assert_eq!(reopened.get_snapshot_by_tag("t", false).unwrap().1.version, version);
    }

    #[test]
    fn test_clear_all() {
        let (manager, storage) = manager_with(VaultConfig::memory());
        manager
            .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new())
            .unwrap();
        manager
            .create_delta_snapshot(&state(json!({"a": 2})), None, SnapshotOptions::new())
            .unwrap();

        assert_eq!(manager.clear_all().unwrap(), 2);
        assert!(manager.is_empty());
        assert!(storage.list("snapshots/").unwrap().is_empty());
        assert!(storage.exists("registry.json"));
    }

    #[test]
    fn test_registry_survives_reopen() {
        let storage = MemoryStorage::new();
        let version = {
            let manager = SnapshotManager::new(storage.clone(), VaultConfig::memory()).unwrap();
            manager
                .create_snapshot(&state(json!({"a": 1})), SnapshotOptions::new().with_tag("s"))
                .unwrap()
        };

        let reopened = SnapshotManager::new(storage, VaultConfig::memory()).unwrap();
        assert_eq!(reopened.list_versions(), vec![version.clone()]);
        assert_eq!(reopened.get_snapshot(&version).unwrap().0, state(json!({"a": 1})));
    }

    #[test]
    fn test_open_manager_memory() {
        let manager = open_manager(VaultConfig::memory()).unwrap();
        let version = manager
            .create_snapshot(&state(json!({"k": "v"})), SnapshotOptions::new())
            .unwrap();
        assert!(manager.storage().exists(&payload_key(&version)));
    }
}
