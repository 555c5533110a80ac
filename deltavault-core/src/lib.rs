/*!
# DeltaVault Core Engine

Versioned, delta-compressed persistence for key-value state.

This crate captures whole states (string keys to JSON values), stores them as
full or delta snapshots, and reconstructs any version with checksum
verification at every hop. It provides:

- Structural (dict) and binary delta computation, application and merging
- In-memory delta chains with checkpointing, optimization and rebaseline
- A snapshot manager with a persisted registry, tags, retention, comparison
  and self-contained export/import
- Key-value persistence backends with per-operation metrics
- Pluggable storage and compression adapters

## Architecture

Domain logic (deltas, chains, snapshots) only talks to storage through the
[`StorageAdapter`] port and to codecs through [`CompressionAdapter`], so new
backends plug in without touching the core.

## Usage

```rust
use deltavault_core::{MemoryStorage, SnapshotManager, SnapshotOptions, VaultConfig};
use serde_json::json;

let manager = SnapshotManager::new(MemoryStorage::new(), VaultConfig::memory())?;

let base = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
let v1 = manager.create_snapshot(&base, SnapshotOptions::new().with_tag("stable"))?;

let next = json!({"a": 1, "b": 3, "c": 4}).as_object().cloned().unwrap();
let v2 = manager.create_delta_snapshot(&next, None, SnapshotOptions::new())?;

let (restored, _) = manager.get_snapshot(&v2)?;
assert_eq!(restored, next);
assert_eq!(manager.get_snapshot_by_tag("stable", true)?.0, base);
# Ok::<(), deltavault_core::PersistError>(())
```
*/

pub mod backend;
pub mod compression;
pub mod config;
pub mod delta;
pub mod error;
pub mod integrity;
pub mod metrics;
pub mod observability;
pub mod snapshot;
pub mod storage;
pub mod sync;


pub use backend::{FilePersistence, MemoryPersistence, PersistenceBackend, SnapshotPersistence};
pub use compression::{CompressionAdapter, CompressionKind, GzipCompressor, NoCompression};
pub use config::{DeltaConfig, DependentPolicy, StorageBackend, VaultConfig};
pub use delta::{
    ChainMetrics, ChainState, CompressionStats, DeltaChain, DeltaCompressor, DeltaInfo,
    DeltaRecord, DeltaStrategy, StrategyFallback,
};
pub use error::{ErrorKind, PersistError, Result};
pub use integrity::State;
pub use metrics::{Operation, PersistenceMetrics, PersistenceStats};
pub use snapshot::{
    open_manager, ExportPackage, ManagerStats, SnapshotDiff, SnapshotManager, SnapshotMetadata,
    SnapshotOptions, VerificationReport,
};
pub use storage::{LocalFileStorage, MemoryStorage, StorageAdapter};
pub use sync::{ContextGuard, ThreadSafeContextWrapper};
