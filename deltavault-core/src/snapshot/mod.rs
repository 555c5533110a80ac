/*!
Versioned snapshots: metadata, stored payloads, the registry and the manager.

A vault is a storage location holding `registry.json` plus one data file per
version. Full snapshots store the whole state; delta snapshots store a
[`DeltaRecord`](crate::delta::DeltaRecord) and the id of their base version,
and are reconstructed by replaying the chain back to a full snapshot.
*/

pub mod export;
pub mod manager;
pub mod metadata;
pub mod payload;
pub mod registry;

pub use export::{ExportPackage, EXPORT_FORMAT_VERSION};
pub use manager::{
    open_manager, ManagerStats, SnapshotDiff, SnapshotManager, SnapshotOptions, ValueChange,
    VerificationReport,
};
pub use metadata::{validate_version_id, SnapshotMetadata, METADATA_FORMAT_VERSION};
pub use payload::StoredPayload;
pub use registry::Registry;
