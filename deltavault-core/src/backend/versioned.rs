/*!
Persistence backend that records every write as a snapshot.
*/

use super::{lookup, PersistenceBackend};
use crate::integrity::State;
use crate::metrics::{Operation, PersistenceMetrics, PersistenceStats};
use crate::snapshot::{SnapshotManager, SnapshotOptions};
use crate::storage::StorageAdapter;
use crate::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Key-value backend with full history
///
/// The first write stores a full snapshot, later writes store deltas against
/// the latest snapshot (the manager starts a new full snapshot when the chain
/// reaches its limit). `save` returns the new version id, so callers can roll
/// back through [`SnapshotPersistence::manager`].
pub struct SnapshotPersistence<S: StorageAdapter> {
    manager: SnapshotManager<S>,
    working: Mutex<Option<State>>,
    metrics: PersistenceMetrics,
}

impl<S: StorageAdapter> SnapshotPersistence<S> {
    pub fn new(manager: SnapshotManager<S>) -> Self {
        Self {
            manager,
            working: Mutex::new(None),
            metrics: PersistenceMetrics::new(),
        }
    }

    pub fn manager(&self) -> &SnapshotManager<S> {
        &self.manager
    }

    fn record(&self, state: &State) -> Result<(String, u64)> {
        let version = if self.manager.is_empty() {
            self.manager.create_snapshot(state, SnapshotOptions::new())?
        } else {
            self.manager
                .create_delta_snapshot(state, None, SnapshotOptions::new())?
        };
        let stored = self.manager.get_metadata(&version)?.stored_size;
        debug!(version = %version, stored, "state recorded");
        Ok((version, stored))
    }

    fn latest(&self) -> Result<(State, u64)> {
        Ok(match self.manager.get_latest_snapshot()? {
            Some((state, metadata)) => (state, metadata.size_bytes),
            None => (State::new(), 0),
        })
    }

    fn modify<T>(&self, mutate: impl FnOnce(&mut State) -> T) -> Result<T> {
        let mut working = self.working.lock();
        let mut state = match working.take() {
            Some(state) => state,
            None => self.latest()?.0,
        };
        let original = state.clone();
        let outcome = mutate(&mut state);
        if state != original {
            if let Err(e) = self.record(&state) {
                *working = Some(original);
                return Err(e);
            }
        }
        *working = Some(state);
        Ok(outcome)
    }
}

impl<S: StorageAdapter> PersistenceBackend for SnapshotPersistence<S> {
    fn save(&self, data: &State) -> Result<String> {
        let timer = self.metrics.start(Operation::Save);
        let mut working = self.working.lock();
        let result = self.record(data);
        if result.is_ok() {
            *working = Some(data.clone());
        }
        timer
            .observe(result, |(_, bytes)| *bytes)
            .map(|(version, _)| version)
    }

    fn load(&self) -> Result<State> {
        let timer = self.metrics.start(Operation::Load);
        let mut working = self.working.lock();
        let result = self.latest();
        if let Ok((state, _)) = &result {
            *working = Some(state.clone());
        }
        timer
            .observe(result, |(_, bytes)| *bytes)
            .map(|(state, _)| state)
    }

    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>> {
        let timer = self.metrics.start(Operation::Get);
        let result = {
            let mut working = self.working.lock();
            match working.as_ref() {
                Some(state) => Ok(lookup(state, key, default, &self.metrics)),
                None => self.latest().map(|(state, _)| {
                    let value = lookup(&state, key, default, &self.metrics);
                    *working = Some(state);
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

    /// Drops the whole history, not just the current state
    fn clear(&self) -> Result<()> {
        let timer = self.metrics.start(Operation::Clear);
        let mut working = self.working.lock();
        let result = self.manager.clear_all().map(|_| ());
        if result.is_ok() {
            *working = Some(State::new());
        }
        timer.observe(result, |_| 0)
    }

    fn get_metrics(&self) -> PersistenceStats {
        self.metrics.snapshot()
    }
}
