/*!
Process-local persistence backend.
*/

use super::{lookup, PersistenceBackend};
use crate::integrity::State;
use crate::metrics::{Operation, PersistenceMetrics, PersistenceStats};
use crate::Result;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

/// Keeps the state in memory; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: RwLock<State>,
    metrics: PersistenceMetrics,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing state
    pub fn with_state(state: State) -> Self {
        Self {
            state: RwLock::new(state),
            metrics: PersistenceMetrics::new(),
        }
    }
}

fn encoded_len(state: &State) -> Result<u64> {
    Ok(serde_json::to_vec(state)?.len() as u64)
}

impl PersistenceBackend for MemoryPersistence {
    fn save(&self, data: &State) -> Result<String> {
        let timer = self.metrics.start(Operation::Save);
        let result = encoded_len(data).map(|bytes| {
            *self.state.write() = data.clone();
            bytes
        });
        timer
            .observe(result, |bytes| *bytes)
            .map(|_| Uuid::new_v4().to_string())
    }

    fn load(&self) -> Result<State> {
        let timer = self.metrics.start(Operation::Load);
        let state = self.state.read().clone();
        let result = encoded_len(&state).map(|bytes| (state, bytes));
        timer
            .observe(result, |(_, bytes)| *bytes)
            .map(|(state, _)| state)
    }

    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>> {
        let timer = self.metrics.start(Operation::Get);
        let value = lookup(&self.state.read(), key, default, &self.metrics);
        timer.finish(0);
        Ok(value)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let timer = self.metrics.start(Operation::Set);
        self.state.write().insert(key.to_string(), value);
        timer.finish(0);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let timer = self.metrics.start(Operation::Delete);
        let removed = self.state.write().remove(key).is_some();
        timer.finish(0);
        Ok(removed)
    }

    fn clear(&self) -> Result<()> {
        let timer = self.metrics.start(Operation::Clear);
        self.state.write().clear();
        timer.finish(0);
        Ok(())
    }

    fn get_metrics(&self) -> PersistenceStats {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_state() {
        let state: State = serde_json::from_value(json!({"a": 1})).unwrap();
        let backend = MemoryPersistence::with_state(state.clone());
        assert_eq!(backend.load().unwrap(), state);
        assert_eq!(backend.get_metrics().bytes_read, 7);
    }

    #[test]
    fn test_save_records_bytes() {
        let backend = MemoryPersistence::new();
        let state: State = serde_json::from_value(json!({"k": "v"})).unwrap();
        backend.save(&state).unwrap();
        let stats = backend.get_metrics();
        assert_eq!(stats.save_count, 1);
        assert_eq!(stats.bytes_written, br#"{"k":"v"}"#.len() as u64);
    }
}
