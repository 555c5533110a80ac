/*!
Persisted version registry.
*/

use super::metadata::{SnapshotMetadata, METADATA_FORMAT_VERSION};
use crate::storage::StorageAdapter;
use crate::{PersistError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Map of version id to metadata and storage location
///
/// The manager keeps one instance in memory and rewrites the registry file
/// after every mutation. Mutations are applied to a clone first so a failed
/// write leaves the live registry untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub format_version: u8,
    /// Sequence number for the next created snapshot
    pub next_sequence: u64,
    pub snapshots: BTreeMap<String, SnapshotMetadata>,
    /// Storage key of each version's data file
    pub locations: BTreeMap<String, String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            next_sequence: 0,
            snapshots: BTreeMap::new(),
            locations: BTreeMap::new(),
        }
    }
}

impl Registry {
    /// Read the registry from storage; a missing file yields an empty registry
    pub fn load<S: StorageAdapter + ?Sized>(storage: &S, key: &str) -> Result<Self> {
        if !storage.exists(key) {
            debug!(key, "no registry found, starting empty");
            return Ok(Self::default());
        }
        let bytes = storage.load(key)?;
        let registry: Registry = serde_json::from_slice(&bytes)
            .map_err(|e| PersistError::snapshot(format!("Malformed registry {key}: {e}")))?;

        if registry.format_version > METADATA_FORMAT_VERSION {
            return Err(PersistError::snapshot(format!(
                "Incompatible registry format version: {} (current: {})",
                registry.format_version, METADATA_FORMAT_VERSION
            )));
        }
        if let Some(version) = registry
            .snapshots
            .keys()
            .find(|v| !registry.locations.contains_key(*v))
        {
            return Err(PersistError::snapshot(format!(
                "Registry has no location for snapshot {version}"
            )));
        }
        Ok(registry)
    }

    /// Write the registry to storage
    pub fn persist<S: StorageAdapter + ?Sized>(&self, storage: &S, key: &str) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        storage.save(&bytes, key)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn contains(&self, version: &str) -> bool {
        self.snapshots.contains_key(version)
    }

    pub fn get(&self, version: &str) -> Option<&SnapshotMetadata> {
        self.snapshots.get(version)
    }

    pub fn get_mut(&mut self, version: &str) -> Option<&mut SnapshotMetadata> {
        self.snapshots.get_mut(version)
    }

    pub fn location(&self, version: &str) -> Option<&str> {
        self.locations.get(version).map(String::as_str)
    }

    /// Register a snapshot stored under `key`
    pub fn insert(&mut self, metadata: SnapshotMetadata, key: String) {
        self.next_sequence = self.next_sequence.max(metadata.sequence + 1);
        self.locations.insert(metadata.version.clone(), key);
        self.snapshots.insert(metadata.version.clone(), metadata);
    }

    /// Unregister a snapshot, returning its metadata and storage key
    pub fn remove(&mut self, version: &str) -> Option<(SnapshotMetadata, String)> {
        let metadata = self.snapshots.remove(version)?;
        let key = self.locations.remove(version).unwrap_or_default();
        Some((metadata, key))
    }

    /// Snapshots ordered by creation time, then sequence
    pub fn ordered(&self) -> Vec<&SnapshotMetadata> {
        let mut entries: Vec<&SnapshotMetadata> = self.snapshots.values().collect();
        entries.sort_by(|a, b| creation_order(a, b));
        entries
    }

    pub fn latest(&self) -> Option<&SnapshotMetadata> {
        self.snapshots.values().max_by(|a, b| creation_order(a, b))
    }

    /// Snapshots carrying `tag`, oldest first
    pub fn with_tag(&self, tag: &str) -> Vec<&SnapshotMetadata> {
        self.ordered()
            .into_iter()
            .filter(|m| m.has_tag(tag))
            .collect()
    }

    /// Every tag in use, sorted
    pub fn tags(&self) -> Vec<String> {
        self.snapshots
            .values()
            .flat_map(|m| m.tags.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Versions stored as deltas against `version`
    pub fn dependents(&self, version: &str) -> Vec<String> {
        self.ordered()
            .into_iter()
            .filter(|m| m.base_version.as_deref() == Some(version))
            .map(|m| m.version.clone())
            .collect()
    }

    /// Versions to load, newest first, to reconstruct `version`
    ///
    /// The last entry is a full snapshot. Fails if a link is missing or the
    /// base references loop.
    pub fn chain_to_base(&self, version: &str) -> Result<Vec<&SnapshotMetadata>> {
        let mut chain = Vec::new();
        let mut current = self
            .get(version)
            .ok_or_else(|| PersistError::not_found(version.to_string()))?;

        loop {
            chain.push(current);
            let Some(base) = current.base_version.as_deref() else {
                return Ok(chain);
            };
            if chain.len() > self.len() {
                return Err(PersistError::snapshot(format!(
                    "Base references of snapshot {version} form a cycle"
                )));
            }
            current = self.get(base).ok_or_else(|| {
                PersistError::not_found(format!(
                    "base snapshot {base} of {}",
                    current.version
                ))
            })?;
        }
    }

    /// Recompute every chain depth from the base references
    pub fn refresh_depths(&mut self) {
        let depths: Vec<(String, u32)> = self
            .snapshots
            .keys()
            .filter_map(|v| {
                self.chain_to_base(v)
                    .ok()
                    .map(|chain| (v.clone(), (chain.len() - 1) as u32))
            })
            .collect();
        for (version, depth) in depths {
            if let Some(metadata) = self.snapshots.get_mut(&version) {
                metadata.chain_depth = depth;
            }
        }
    }
}

fn creation_order(a: &SnapshotMetadata, b: &SnapshotMetadata) -> std::cmp::Ordering {
    a.created_at
        .total_cmp(&b.created_at)
        .then(a.sequence.cmp(&b.sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn entry(version: &str, sequence: u64, created_at: f64) -> SnapshotMetadata {
        let mut metadata = SnapshotMetadata::new(version, sequence);
        metadata.created_at = created_at;
        metadata
    }

    fn sample() -> Registry {
        let mut registry = Registry::default();
        registry.insert(entry("a", 0, 10.0), "snapshots/a.snap".into());
        registry.insert(
            entry("b", 1, 20.0).with_base("a", 1).with_tags(["x"]),
            "snapshots/b.snap".into(),
        );
        registry.insert(
            entry("c", 2, 20.0).with_base("b", 2).with_tags(["x", "y"]),
            "snapshots/c.snap".into(),
        );
        registry
    }

    #[test]
    fn test_ordering_and_latest() {
        let registry = sample();
        let order: Vec<&str> = registry.ordered().iter().map(|m| m.version.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(registry.latest().unwrap().version, "c");
        assert_eq!(registry.next_sequence, 3);
    }

    #[test]
    fn test_tags_and_dependents() {
        let registry = sample();
        assert_eq!(registry.tags(), vec!["x", "y"]);
        assert_eq!(registry.with_tag("x").len(), 2);
        assert_eq!(registry.dependents("a"), vec!["b"]);
        assert!(registry.dependents("c").is_empty());
    }

    #[test]
    fn test_chain_to_base() {
        let registry = sample();
        let chain: Vec<&str> = registry
            .chain_to_base("c")
            .unwrap()
            .iter()
            .map(|m| m.version.as_str())
            .collect();
        assert_eq!(chain, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_chain_missing_link() {
        let mut registry = sample();
        registry.remove("a");
        let err = registry.chain_to_base("c").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_chain_cycle_detected() {
        let mut registry = sample();
        registry.get_mut("a").unwrap().base_version = Some("c".into());
        let err = registry.chain_to_base("c").unwrap_err();
        assert!(matches!(err, PersistError::Snapshot(_)));
    }

    #[test]
    fn test_refresh_depths_after_base_change() {
        let mut registry = sample();
        registry.get_mut("b").unwrap().base_version = None;
        registry.refresh_depths();
        assert_eq!(registry.get("b").unwrap().chain_depth, 0);
        assert_eq!(registry.get("c").unwrap().chain_depth, 1);
    }

    #[test]
    fn test_persist_and_load() {
        let storage = MemoryStorage::new();
        let registry = sample();
        registry.persist(&storage, "registry.json").unwrap();

        let loaded = Registry::load(&storage, "registry.json").unwrap();
        assert_eq!(loaded, registry);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let storage = MemoryStorage::new();
        let registry = Registry::load(&storage, "registry.json").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_rejects_missing_location() {
        let storage = MemoryStorage::new();
        let mut registry = sample();
        registry.locations.remove("b");
        registry.persist(&storage, "registry.json").unwrap();
        assert!(Registry::load(&storage, "registry.json").is_err());
    }
}
