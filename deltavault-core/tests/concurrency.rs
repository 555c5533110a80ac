/*!
Concurrent access tests: a shared snapshot manager, a shared delta chain and
a shared persistence backend.
*/

use deltavault_core::{
    DeltaChain, DeltaConfig, FilePersistence, MemoryStorage, PersistenceBackend, SnapshotManager,
    SnapshotOptions, State, ThreadSafeContextWrapper, VaultConfig,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

fn state(value: serde_json::Value) -> State {
    serde_json::from_value(value).unwrap()
}

#[test]
fn test_parallel_writers_and_readers() {
    let manager = Arc::new(SnapshotManager::new(MemoryStorage::new(), VaultConfig::memory()).unwrap());
    let base = manager
        .create_snapshot(&state(json!({"writer": -1, "n": 0})), SnapshotOptions::new())
        .unwrap();

    let writers: Vec<_> = (0..4)
        .map(|writer| {
            let manager = Arc::clone(&manager);
            let base = base.clone();
            thread::spawn(move || {
                (0..10)
                    .map(|n| {
                        let data = state(json!({"writer": writer, "n": n}));
                        let version = if n % 3 == 0 {
                            manager.create_snapshot(&data, SnapshotOptions::new())
                        } else {
                            manager.create_delta_snapshot(&data, Some(&base), SnapshotOptions::new())
                        }
                        .unwrap();
                        (version, data)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for _ in 0..20 {
                    for version in manager.list_versions() {
                        manager.get_snapshot(&version).unwrap();
                    }
                }
            })
        })
        .collect();

    let mut written = Vec::new();
    for handle in writers {
        written.extend(handle.join().unwrap());
    }
    for handle in readers {
        handle.join().unwrap();
    }

    assert_eq!(manager.len(), 41);
    let sequences: BTreeSet<u64> = manager.list_snapshots().iter().map(|m| m.sequence).collect();
    assert_eq!(sequences.len(), 41);
    for (version, data) in written {
        assert_eq!(manager.get_snapshot(&version).unwrap().0, data);
    }
    assert!(manager.verify_all().is_ok());
}

#[test]
fn test_shared_chain_sees_whole_mutations() {
    let config = DeltaConfig {
        max_chain_length: 8,
        keep_recent: 2,
        ..DeltaConfig::default()
    };
    let chain = ThreadSafeContextWrapper::new(DeltaChain::new(State::new(), &config));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let chain = chain.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    chain.with(|chain| {
                        let mut next = chain.get_current_state();
                        next.insert(format!("t{t}"), json!(i));
                        let total = next.get("total").and_then(|v| v.as_u64()).unwrap_or(0);
                        next.insert("total".to_string(), json!(total + 1));
                        chain.add_state(&next, None).unwrap();
                    });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let guard = chain.lock();
    let current = guard.get_current_state();
    assert_eq!(current.get("total"), Some(&json!(100)));
    for t in 0..4 {
        assert_eq!(current.get(&format!("t{t}")), Some(&json!(24)));
    }
    assert!(guard.len() <= 8);
    assert_eq!(guard.replay_from_base().unwrap(), current);
}

#[test]
fn test_shared_backend_counts_every_set() {
    let backend = Arc::new(FilePersistence::new(MemoryStorage::new()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                for i in 0..10 {
                    backend.set(&format!("t{t}-{i}"), json!(i)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(backend.load().unwrap().len(), 40);
    let stats = backend.get_metrics();
    assert_eq!(stats.error_count, 0);
}
