/*!
Local filesystem storage adapter implementation.
*/

use super::{validate_key, StorageAdapter};
use crate::{PersistError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Prefix of in-flight temp files, skipped by `list`
const TEMP_PREFIX: &str = ".tmp-";

/// Local filesystem storage adapter
///
/// Blobs are files under a base directory. Writes go to a temp file in the
/// destination directory which is then renamed over the target, so readers
/// never observe a torn write.
///
/// # Example
/// ```rust
/// use deltavault_core::storage::{LocalFileStorage, StorageAdapter};
///
/// let dir = tempfile::tempdir()?;
/// let storage = LocalFileStorage::with_base_dir(dir.path());
/// storage.save(b"payload", "snapshots/v1.snap")?;
/// assert_eq!(storage.load("snapshots/v1.snap")?, b"payload");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
}

impl LocalFileStorage {
    /// Create a storage adapter rooted at `base_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve the full path for a given storage key
    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key
            .split('/')
            .fold(self.base_dir.clone(), |path, part| path.join(part)))
    }

    /// Ensure the parent directory exists, creating it if necessary
    fn ensure_parent_dir(path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| PersistError::storage(format!("{} has no parent", path.display())))?;
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                PersistError::storage(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    fn collect_keys(dir: &Path, relative: &str, keys: &mut Vec<String>) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| {
            PersistError::storage(format!("Failed to list {}: {}", dir.display(), e))
        })?;

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let key = if relative.is_empty() {
                name
            } else {
                format!("{relative}/{name}")
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                Self::collect_keys(&entry.path(), &key, keys)?;
            } else if file_type.is_file() {
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl StorageAdapter for LocalFileStorage {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        let full_path = self.resolve_path(key)?;
        Self::ensure_parent_dir(&full_path)?;

        write_atomic(&full_path, data).map_err(|e| {
            PersistError::storage(format!(
                "Failed to write blob to {}: {}",
                full_path.display(),
                e
            ))
        })
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(key)?;

        fs::read(&full_path).map_err(|e| {
            PersistError::storage(format!(
                "Failed to read blob from {}: {}",
                full_path.display(),
                e
            ))
        })
    }

    fn exists(&self, key: &str) -> bool {
        self.resolve_path(key)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.resolve_path(key)?;

        if full_path.exists() {
            fs::remove_file(&full_path).map_err(|e| {
                PersistError::storage(format!(
                    "Failed to delete blob {}: {}",
                    full_path.display(),
                    e
                ))
            })?;
        }

        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        Self::collect_keys(&self.base_dir, "", &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        self.base_dir.display().to_string()
    }
}

/// Write `data` to `target` through a synced temp file in the same directory
pub(crate) fn write_atomic(target: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp: NamedTempFile = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map(|_| ()).map_err(|e| e.error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_file_storage_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::with_base_dir(temp_dir.path());

        let test_data = b"test snapshot data";
        let key = "snapshots/v1.snap";

        assert!(storage.save(test_data, key).is_ok());
        assert!(storage.exists(key));
        assert_eq!(storage.load(key).unwrap(), test_data);

        assert!(storage.delete(key).is_ok());
        assert!(!storage.exists(key));
        assert!(storage.delete(key).is_ok());
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::with_base_dir(temp_dir.path());

        storage.save(b"first version, longer", "registry.json").unwrap();
        storage.save(b"second", "registry.json").unwrap();
        assert_eq!(storage.load("registry.json").unwrap(), b"second");
    }

    #[test]
    fn test_list_nested_keys_skips_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::with_base_dir(temp_dir.path());

        storage.save(b"a", "snapshots/a.snap").unwrap();
        storage.save(b"b", "snapshots/b.snap").unwrap();
        storage.save(b"r", "registry.json").unwrap();
        fs::write(temp_dir.path().join("snapshots").join(".tmp-xyz"), b"junk").unwrap();

        assert_eq!(
            storage.list("snapshots/").unwrap(),
            vec!["snapshots/a.snap".to_string(), "snapshots/b.snap".to_string()]
        );
        assert_eq!(storage.list("").unwrap().len(), 3);
    }

    #[test]
    fn test_list_missing_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::with_base_dir(temp_dir.path().join("absent"));
        assert!(storage.list("").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::with_base_dir(temp_dir.path());
        assert!(storage.save(b"x", "../escape").is_err());
        assert!(!storage.exists("../escape"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::with_base_dir(temp_dir.path());

        let result = storage.load("nonexistent.snap");
        assert!(matches!(result, Err(PersistError::Storage(_))));
    }
}
