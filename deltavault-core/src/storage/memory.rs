/*!
In-memory storage adapter.
*/

use super::{validate_key, StorageAdapter};
use crate::{PersistError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Process-local blob store
///
/// Clones share the same map, which lets tests hold a handle to the storage
/// a manager writes through.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Total stored bytes
    pub fn total_bytes(&self) -> usize {
        self.data.read().values().map(Vec::len).sum()
    }
}

impl StorageAdapter for MemoryStorage {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        validate_key(key)?;
        self.data.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| PersistError::storage(format!("Blob not found: {key}")))
    }

    fn exists(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_basic_operations() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());

        storage.save(b"one", "snapshots/a.snap").unwrap();
        storage.save(b"two", "snapshots/b.snap").unwrap();
        storage.save(b"{}", "registry.json").unwrap();

        assert_eq!(storage.len(), 3);
        assert_eq!(storage.load("snapshots/a.snap").unwrap(), b"one");
        assert_eq!(
            storage.list("snapshots/").unwrap(),
            vec!["snapshots/a.snap".to_string(), "snapshots/b.snap".to_string()]
        );

        storage.delete("snapshots/a.snap").unwrap();
        assert!(!storage.exists("snapshots/a.snap"));
        assert!(storage.delete("snapshots/a.snap").is_ok());
        assert!(storage.load("snapshots/a.snap").is_err());
    }

    #[test]
    fn test_clones_share_data() {
        let storage = MemoryStorage::new();
        let handle = storage.clone();
        storage.save(b"abc", "k").unwrap();
        assert_eq!(handle.load("k").unwrap(), b"abc");
        assert_eq!(handle.total_bytes(), 3);
    }
}
