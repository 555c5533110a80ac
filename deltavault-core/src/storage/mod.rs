/*!
Storage adapters for snapshot payloads and registries.

This module defines the blob storage port used by the snapshot manager and the
file persistence backend, plus the local filesystem and in-memory adapters.
Keys are relative, `/`-separated names such as `snapshots/v1.snap`.
*/

pub mod local;
pub mod memory;

use crate::{PersistError, Result};
use std::sync::Arc;

pub use local::LocalFileStorage;
pub use memory::MemoryStorage;

/// Storage abstraction for saving and loading opaque blobs by key
///
/// This trait defines the interface that all storage implementations must provide.
/// The snapshot manager and the file persistence backend only see this trait, so
/// a new backend plugs in without touching either of them.
///
/// Implementations must make `save` atomic per key: a concurrent or crashed
/// writer never leaves a partially written blob visible to `load`.
///
/// # Example
/// ```rust
/// use deltavault_core::{MemoryStorage, StorageAdapter};
///
/// let storage = MemoryStorage::new();
/// storage.save(b"payload", "snapshots/v1.snap")?;
/// assert!(storage.exists("snapshots/v1.snap"));
/// assert_eq!(storage.load("snapshots/v1.snap")?, b"payload".to_vec());
/// assert_eq!(storage.list("snapshots/")?, vec!["snapshots/v1.snap".to_string()]);
/// # Ok::<(), deltavault_core::PersistError>(())
/// ```
pub trait StorageAdapter: Send + Sync {
    /// Save data under `key`, replacing any existing blob
    ///
    /// # Arguments
    /// * `data` - The encoded bytes to store
    /// * `key` - Relative, `/`-separated storage key
    ///
    /// # Returns
    /// Result indicating success or failure
    fn save(&self, data: &[u8], key: &str) -> Result<()>;

    /// Load the blob stored under `key`
    ///
    /// # Arguments
    /// * `key` - The storage key to load from
    ///
    /// # Returns
    /// The stored bytes, or an error if the key is missing or unreadable
    fn load(&self, key: &str) -> Result<Vec<u8>>;

    /// Check if a blob exists under `key`
    fn exists(&self, key: &str) -> bool;

    /// Delete the blob under `key`
    ///
    /// # Arguments
    /// * `key` - The storage key to delete
    ///
    /// # Returns
    /// Result indicating success or failure; deleting a missing key succeeds
    fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted
    ///
    /// # Arguments
    /// * `prefix` - Key prefix to match, e.g. `snapshots/`; empty matches all
    ///
    /// # Returns
    /// Every matching key in ascending order
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Human-readable location for log messages
    fn describe(&self) -> String;
}

impl<S: StorageAdapter + ?Sized> StorageAdapter for Box<S> {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        (**self).save(data, key)
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        (**self).load(key)
    }

    fn exists(&self, key: &str) -> bool {
        (**self).exists(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

impl<S: StorageAdapter + ?Sized> StorageAdapter for Arc<S> {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        (**self).save(data, key)
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        (**self).load(key)
    }

    fn exists(&self, key: &str) -> bool {
        (**self).exists(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Reject empty, absolute, or parent-escaping keys
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(PersistError::storage("storage key cannot be empty"));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(PersistError::storage(format!(
            "storage key must be relative: {key}"
        )));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(PersistError::storage(format!(
            "storage key has an invalid path component: {key}"
        )));
    }
    Ok(())
}
