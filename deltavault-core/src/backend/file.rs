/*!
Single-blob persistence backend with a checksummed envelope.
*/

use super::{lookup, PersistenceBackend};
use crate::integrity::{compute_checksum, timestamp, State};
use crate::metrics::{Operation, PersistenceMetrics, PersistenceStats};
use crate::storage::StorageAdapter;
use crate::{PersistError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Default storage key of the state blob
pub const DEFAULT_STATE_KEY: &str = "state.json";

const ENVELOPE_FORMAT_VERSION: u8 = 1;

/// What is written to storage on every save
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: u8,
    op_id: String,
    saved_at: f64,
    checksum: String,
    state: State,
}

/// Persists the whole state as one JSON blob through a storage adapter
///
/// The state is cached after the first read. A checksum mismatch on load is
/// reported as [`PersistError::DataIntegrity`] and never repaired.
pub struct FilePersistence<S: StorageAdapter> {
    storage: S,
    key: String,
    cache: Mutex<Option<State>>,
    metrics: PersistenceMetrics,
}

impl<S: StorageAdapter> FilePersistence<S> {
    pub fn new(storage: S) -> Self {
        Self::with_key(storage, DEFAULT_STATE_KEY)
    }

    pub fn with_key<K: Into<String>>(storage: S, key: K) -> Self {
        Self {
            storage,
            key: key.into(),
            cache: Mutex::new(None),
            metrics: PersistenceMetrics::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn write(&self, state: &State) -> Result<(String, u64)> {
        let envelope = Envelope {
            format_version: ENVELOPE_FORMAT_VERSION,
            op_id: Uuid::new_v4().to_string(),
            saved_at: timestamp(),
            checksum: compute_checksum(state)?,
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        self.storage.save(&bytes, &self.key)?;
        debug!(key = %self.key, bytes = bytes.len(), "state written");
        Ok((envelope.op_id, bytes.len() as u64))
    }

    /// Durable state and its encoded size; empty if never saved
    fn read(&self) -> Result<(State, u64)> {
        if !self.storage.exists(&self.key) {
            return Ok((State::new(), 0));
        }
        let bytes = self.storage.load(&self.key)?;
        let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|e| {
            PersistError::persistence(format!("Malformed state file {}: {e}", self.key))
        })?;
        if envelope.format_version > ENVELOPE_FORMAT_VERSION {
            return Err(PersistError::persistence(format!(
                "Incompatible state format version: {}",
                envelope.format_version
            )));
        }

        let actual = compute_checksum(&envelope.state)?;
        if actual != envelope.checksum {
            return Err(PersistError::integrity(
                self.key.clone(),
                envelope.checksum,
                actual,
            ));
        }
        Ok((envelope.state, bytes.len() as u64))
    }

    /// Apply `mutate` to the cached state and write the result through
    fn modify<T>(&self, mutate: impl FnOnce(&mut State) -> T) -> Result<T> {
        let mut cache = self.cache.lock();
        let mut state = match cache.take() {
            Some(state) => state,
            None => self.read()?.0,
        };
        let original = state.clone();
        let outcome = mutate(&mut state);
        if state != original {
            if let Err(e) = self.write(&state) {
                *cache = Some(original);
                return Err(e);
            }
        }
        *cache = Some(state);
        Ok(outcome)
    }
}

impl<S: StorageAdapter> PersistenceBackend for FilePersistence<S> {
    fn save(&self, data: &State) -> Result<String> {
        let timer = self.metrics.start(Operation::Save);
        let mut cache = self.cache.lock();
        let result = self.write(data);
        if result.is_ok() {
            *cache = Some(data.clone());
        }
        timer
            .observe(result, |(_, bytes)| *bytes)
            .map(|(op_id, _)| op_id)
    }

    fn load(&self) -> Result<State> {
        let timer = self.metrics.start(Operation::Load);
        let mut cache = self.cache.lock();
        let result = self.read();
        if let Ok((state, _)) = &result {
            *cache = Some(state.clone());
        }
        timer
            .observe(result, |(_, bytes)| *bytes)
            .map(|(state, _)| state)
    }

    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>> {
        let timer = self.metrics.start(Operation::Get);
        let result = {
            let mut cache = self.cache.lock();
            match cache.as_ref() {
                Some(state) => Ok(lookup(state, key, default, &self.metrics)),
                None => self.read().map(|(state, _)| {
                    let value = lookup(&state, key, default, &self.metrics);
                    *cache = Some(state);
                    value
                }),
            }
        };
        timer.observe(result, |_| 0)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let timer = self.metrics.start(Operation::Set);
        let result = self.modify(|state| {
            state.insert(key.to_string(), value);
        });
        timer.observe(result, |_| 0)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let timer = self.metrics.start(Operation::Delete);
        let result = self.modify(|state| state.remove(key).is_some());
        timer.observe(result, |_| 0)
    }

    fn clear(&self) -> Result<()> {
        let timer = self.metrics.start(Operation::Clear);
        let mut cache = self.cache.lock();
        let result = self.storage.delete(&self.key);
        if result.is_ok() {
            *cache = Some(State::new());
        }
        timer.observe(result, |_| 0)
    }

    fn get_metrics(&self) -> PersistenceStats {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalFileStorage, MemoryStorage};
    use serde_json::json;
    use tempfile::TempDir;

    fn state(value: Value) -> State {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_survives_new_instance() {
        let dir = TempDir::new().unwrap();
        let data = state(json!({"cursor": 42, "items": ["a", "b"]}));
        {
            let backend = FilePersistence::new(LocalFileStorage::with_base_dir(dir.path()));
            backend.save(&data).unwrap();
            backend.set("cursor", json!(43)).unwrap();
        }

        let backend = FilePersistence::new(LocalFileStorage::with_base_dir(dir.path()));
        let loaded = backend.load().unwrap();
        assert_eq!(loaded.get("cursor"), Some(&json!(43)));
        assert_eq!(loaded.get("items"), data.get("items"));
    }

    #[test]
    fn test_tampered_state_is_integrity_error() {
        let storage = MemoryStorage::new();
        let backend = FilePersistence::new(storage.clone());
        backend.save(&state(json!({"balance": 10}))).unwrap();

        let raw = storage.load(DEFAULT_STATE_KEY).unwrap();
        let tampered = String::from_utf8(raw)
            .unwrap()
            .replace("\"balance\": 10", "\"balance\": 99");
        storage.save(tampered.as_bytes(), DEFAULT_STATE_KEY).unwrap();

        let err = backend.load().unwrap_err();
        assert!(err.is_integrity_failure());
        assert_eq!(backend.get_metrics().error_count, 1);
    }

    #[test]
    fn test_malformed_state_is_persistence_error() {
        let storage = MemoryStorage::new();
        storage.save(b"{not json", DEFAULT_STATE_KEY).unwrap();
        let backend = FilePersistence::new(storage);
        let err = backend.load().unwrap_err();
        assert!(matches!(err, PersistError::Persistence(_)));
    }

    #[test]
    fn test_unchanged_delete_skips_write() {
        let storage = MemoryStorage::new();
        let backend = FilePersistence::with_key(storage.clone(), "ctx/state.json");
        assert!(!backend.delete("missing").unwrap());
        assert!(!storage.exists("ctx/state.json"));
        assert_eq!(backend.key(), "ctx/state.json");
    }
}
