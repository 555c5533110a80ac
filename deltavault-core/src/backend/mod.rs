/*!
Key-value persistence backends.

A [`PersistenceBackend`] holds one working state and makes it durable. Every
call updates the backend's [`PersistenceMetrics`](crate::metrics::PersistenceMetrics):
timing and sizes for `save` and `load`, operation counts for the rest, cache
hits and misses for `get`, and an error count for anything that fails.

`set`, `delete` and `clear` write through: when they return `Ok`, the change
is as durable as a `save`.
*/

pub mod file;
pub mod memory;
pub mod versioned;

use crate::integrity::State;
use crate::metrics::PersistenceStats;
use crate::Result;
use serde_json::Value;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;
pub use versioned::SnapshotPersistence;

/// Storage contract used to checkpoint execution context
pub trait PersistenceBackend: Send + Sync {
    /// Replace the whole state, returning an operation id
    fn save(&self, data: &State) -> Result<String>;

    /// Read the durable state; empty if nothing was saved
    fn load(&self) -> Result<State>;

    /// Value under `key`, or `default` when absent
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove `key`; returns whether it was present
    fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every key
    fn clear(&self) -> Result<()>;

    fn get_metrics(&self) -> PersistenceStats;
}

impl<B: PersistenceBackend + ?Sized> PersistenceBackend for Box<B> {
    fn save(&self, data: &State) -> Result<String> {
        (**self).save(data)
    }

    fn load(&self) -> Result<State> {
        (**self).load()
    }

    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>> {
        (**self).get(key, default)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }

    fn get_metrics(&self) -> PersistenceStats {
        (**self).get_metrics()
    }
}

/// Look up `key`, recording a cache hit or miss
pub(crate) fn lookup(
    state: &State,
    key: &str,
    default: Option<Value>,
    metrics: &crate::metrics::PersistenceMetrics,
) -> Option<Value> {
    match state.get(key) {
        Some(value) => {
            metrics.record_cache_hit();
            Some(value.clone())
        }
        None => {
            metrics.record_cache_miss();
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::snapshot::SnapshotManager;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    /// Behaviour every backend must share
    fn exercise_contract(backend: &dyn PersistenceBackend) {
        assert!(backend.load().unwrap().is_empty());

        let data: State = serde_json::from_value(json!({"step": 1, "name": "run"})).unwrap();
        let op_id = backend.save(&data).unwrap();
        assert!(!op_id.is_empty());
        assert_eq!(backend.load().unwrap(), data);

        assert_eq!(backend.get("step", None).unwrap(), Some(json!(1)));
        assert_eq!(
            backend.get("absent", Some(json!("fallback"))).unwrap(),
            Some(json!("fallback"))
        );
        assert_eq!(backend.get("absent", None).unwrap(), None);

        backend.set("step", json!(2)).unwrap();
        assert_eq!(backend.load().unwrap().get("step"), Some(&json!(2)));

        assert!(backend.delete("name").unwrap());
        assert!(!backend.delete("name").unwrap());
        assert!(!backend.load().unwrap().contains_key("name"));

        backend.clear().unwrap();
        assert!(backend.load().unwrap().is_empty());

        let stats = backend.get_metrics();
        assert!(stats.save_count >= 1);
        assert!(stats.load_count >= 5);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 2);
        assert_eq!(stats.operation_counts.get("get"), Some(&3));
        assert_eq!(stats.operation_counts.get("delete"), Some(&2));
        assert_eq!(stats.operation_counts.get("clear"), Some(&1));
        assert_eq!(stats.error_count, 0);
    }

    #[test]
    fn test_memory_backend_contract() {
        exercise_contract(&MemoryPersistence::new());
    }

    #[test]
    fn test_file_backend_contract() {
        exercise_contract(&FilePersistence::new(MemoryStorage::new()));
    }

    #[test]
    fn test_snapshot_backend_contract() {
        let manager = SnapshotManager::new(MemoryStorage::new(), VaultConfig::memory()).unwrap();
        exercise_contract(&SnapshotPersistence::new(manager));
    }

    #[test]
    fn test_boxed_backend() {
        let backend: Box<dyn PersistenceBackend> = Box::new(MemoryPersistence::new());
        exercise_contract(&backend);
    }
}
