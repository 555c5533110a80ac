/*!
Self-contained snapshot packages for moving a version between vaults.
*/

use super::metadata::SnapshotMetadata;
use crate::compression::{decompress_auto, CompressionAdapter, GzipCompressor};
use crate::integrity::{compute_checksum, State};
use crate::storage::local::write_atomic;
use crate::{PersistError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Current export package format
pub const EXPORT_FORMAT_VERSION: u8 = 1;

/// A fully reconstructed snapshot with its metadata
///
/// Packages never reference a base version, so importing one needs nothing
/// from the exporting vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportPackage {
    pub format_version: u8,
    pub metadata: SnapshotMetadata,
    pub state: State,
    /// Checksum of `state`, repeated outside the metadata
    pub checksum: String,
}

impl ExportPackage {
    /// Build a package from a reconstructed state
    pub fn new(metadata: &SnapshotMetadata, state: State) -> Result<Self> {
        let checksum = compute_checksum(&state)?;
        let mut metadata = metadata.clone();
        metadata.base_version = None;
        metadata.chain_depth = 0;
        Ok(Self {
            format_version: EXPORT_FORMAT_VERSION,
            metadata,
            state,
            checksum,
        })
    }

    /// Check the state against both recorded checksums
    pub fn verify(&self) -> Result<()> {
        if self.format_version > EXPORT_FORMAT_VERSION {
            return Err(PersistError::snapshot(format!(
                "Incompatible export format version: {} (current: {})",
                self.format_version, EXPORT_FORMAT_VERSION
            )));
        }
        let actual = compute_checksum(&self.state)?;
        let context = format!("exported snapshot {}", self.metadata.version);
        if actual != self.checksum {
            return Err(PersistError::integrity(context, self.checksum.clone(), actual));
        }
        if actual != self.metadata.checksum {
            return Err(PersistError::integrity(
                context,
                self.metadata.checksum.clone(),
                actual,
            ));
        }
        Ok(())
    }

    /// Gzip-compressed JSON encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        GzipCompressor::new().compress(&json)
    }

    /// Decode gzip or plain JSON and verify checksums
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let json = decompress_auto(data)?;
        let package: ExportPackage = serde_json::from_slice(&json)
            .map_err(|e| PersistError::snapshot(format!("Malformed export package: {e}")))?;
        package.verify()?;
        Ok(package)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        write_atomic(path, &bytes).map_err(|e| {
            PersistError::snapshot(format!("Failed to write export {}: {}", path.display(), e))
        })
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            PersistError::snapshot(format!("Failed to read export {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn package() -> ExportPackage {
        let state: State = serde_json::from_value(json!({"a": 1, "b": {"c": true}})).unwrap();
        let mut metadata = SnapshotMetadata::new("v3", 2).with_base("v2", 2);
        metadata.update_integrity_info(&state).unwrap();
        ExportPackage::new(&metadata, state).unwrap()
    }

    #[test]
    fn test_package_is_standalone() {
        let package = package();
        assert!(package.metadata.base_version.is_none());
        assert_eq!(package.metadata.chain_depth, 0);
        assert!(package.verify().is_ok());
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v3.export");
        let original = package();
        original.write_to(&path).unwrap();

        assert!(crate::compression::is_gzip(&fs::read(&path).unwrap()));
        assert_eq!(ExportPackage::read_from(&path).unwrap(), original);
    }

    #[test]
    fn test_plain_json_accepted() {
        let original = package();
        let json = serde_json::to_vec(&original).unwrap();
        assert_eq!(ExportPackage::from_bytes(&json).unwrap(), original);
    }

    #[test]
    fn test_tampered_state_rejected() {
        let mut tampered = package();
        tampered.state.insert("a".to_string(), json!(2));
        let json = serde_json::to_vec(&tampered).unwrap();

        let err = ExportPackage::from_bytes(&json).unwrap_err();
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn test_future_format_rejected() {
        let mut future = package();
        future.format_version = EXPORT_FORMAT_VERSION + 1;
        assert!(future.verify().is_err());
    }
}
