/*!
Snapshot metadata and version identifier rules.
*/

use crate::integrity::{hash_bytes, state_fingerprint, timestamp, State};
use crate::{PersistError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current metadata format version for compatibility tracking
pub const METADATA_FORMAT_VERSION: u8 = 1;

/// Longest accepted version identifier
pub const MAX_VERSION_LEN: usize = 128;

/// Registry entry describing one stored snapshot
///
/// `checksum` and `size_bytes` describe the canonical encoding of the full
/// reconstructed state; `payload_checksum` and `stored_size` describe the
/// bytes actually written to storage, which for a delta snapshot is only the
/// delta record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMetadata {
    /// Unique identifier within a manager
    pub version: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub user_info: Map<String, Value>,

    /// Seconds since the UNIX epoch
    pub created_at: f64,

    /// SHA-256 of the canonical full state
    pub checksum: String,

    /// Size of the canonical full state in bytes
    pub size_bytes: u64,

    /// SHA-256 of the stored payload bytes
    pub payload_checksum: String,

    /// Size of the stored payload in bytes
    pub stored_size: u64,

    /// Version this snapshot is a delta against; `None` for full snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<String>,

    /// Number of delta hops back to a full snapshot
    #[serde(default)]
    pub chain_depth: u32,

    /// Creation order within the manager, breaks `created_at` ties
    pub sequence: u64,

    pub format_version: u8,

    pub compression_algorithm: String,
}

impl SnapshotMetadata {
    /// Create metadata for a new full snapshot
    ///
    /// Integrity fields stay empty until [`update_integrity_info`] and
    /// [`update_payload_info`] are called.
    ///
    /// [`update_integrity_info`]: SnapshotMetadata::update_integrity_info
    /// [`update_payload_info`]: SnapshotMetadata::update_payload_info
    ///
    /// # Example
    /// ```rust
    /// use deltavault_core::SnapshotMetadata;
    ///
    /// let metadata = SnapshotMetadata::new("v1", 0);
    /// assert_eq!(metadata.version, "v1");
    /// assert!(!metadata.is_delta());
    /// ```
    pub fn new<S: Into<String>>(version: S, sequence: u64) -> Self {
        Self {
            version: version.into(),
            tags: Vec::new(),
            description: None,
            user_info: Map::new(),
            created_at: timestamp(),
            checksum: String::new(),
            size_bytes: 0,
            payload_checksum: String::new(),
            stored_size: 0,
            base_version: None,
            chain_depth: 0,
            sequence,
            format_version: METADATA_FORMAT_VERSION,
            compression_algorithm: "gzip".to_string(),
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add tags, skipping duplicates
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.add_tag(tag);
        }
        self
    }

    pub fn with_user_info(mut self, user_info: Map<String, Value>) -> Self {
        self.user_info = user_info;
        self
    }

    /// Mark this snapshot as a delta against `base_version`
    pub fn with_base<S: Into<String>>(mut self, base_version: S, chain_depth: u32) -> Self {
        self.base_version = Some(base_version.into());
        self.chain_depth = chain_depth;
        self
    }

    pub fn with_compression_algorithm<S: Into<String>>(mut self, algorithm: S) -> Self {
        self.compression_algorithm = algorithm.into();
        self
    }

    /// Record checksum and size of the full state this snapshot reconstructs to
    pub fn update_integrity_info(&mut self, state: &State) -> Result<()> {
        let (checksum, size) = state_fingerprint(state)?;
        self.checksum = checksum;
        self.size_bytes = size;
        Ok(())
    }

    /// Record checksum and size of the bytes written to storage
    pub fn update_payload_info(&mut self, payload: &[u8]) {
        self.payload_checksum = hash_bytes(payload);
        self.stored_size = payload.len() as u64;
    }

    /// Verify a reconstructed state against the stored checksum
    pub fn verify_integrity(&self, state: &State) -> Result<()> {
        let (actual, _) = state_fingerprint(state)?;
        if actual == self.checksum {
            Ok(())
        } else {
            Err(PersistError::integrity(
                format!("snapshot {}", self.version),
                self.checksum.clone(),
                actual,
            ))
        }
    }

    /// Verify stored bytes before decoding them
    pub fn verify_payload(&self, payload: &[u8]) -> Result<()> {
        let actual = hash_bytes(payload);
        if actual == self.payload_checksum {
            Ok(())
        } else {
            Err(PersistError::integrity(
                format!("payload of snapshot {}", self.version),
                self.payload_checksum.clone(),
                actual,
            ))
        }
    }

    pub fn is_delta(&self) -> bool {
        self.base_version.is_some()
    }

    pub fn is_tagged(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Add a tag; returns false if it was already present
    pub fn add_tag<S: Into<String>>(&mut self, tag: S) -> bool {
        let tag = tag.into();
        if self.has_tag(&tag) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    /// Remove a tag; returns false if it was absent
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t != tag);
        self.tags.len() != before
    }

    /// Creation time as a UTC datetime
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        let micros = (self.created_at * 1_000_000.0).round() as i64;
        Utc.timestamp_micros(micros).single()
    }

    /// Validate that all required fields are properly set
    pub fn validate(&self) -> Result<()> {
        validate_version_id(&self.version)?;
        if self.checksum.is_empty() {
            return Err(PersistError::validation("checksum cannot be empty"));
        }
        if self.payload_checksum.is_empty() {
            return Err(PersistError::validation("payload_checksum cannot be empty"));
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(PersistError::validation("tags cannot be blank"));
        }
        match (&self.base_version, self.chain_depth) {
            (None, 0) => {}
            (None, depth) => {
                return Err(PersistError::validation(format!(
                    "full snapshot {} has chain depth {depth}",
                    self.version
                )))
            }
            (Some(_), 0) => {
                return Err(PersistError::validation(format!(
                    "delta snapshot {} has chain depth 0",
                    self.version
                )))
            }
            (Some(base), _) if base == &self.version => {
                return Err(PersistError::validation(format!(
                    "snapshot {} cannot be its own base",
                    self.version
                )))
            }
            _ => {}
        }
        Ok(())
    }

    /// Check if this metadata is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format_version <= METADATA_FORMAT_VERSION
    }
}

/// Check a caller-supplied version identifier
///
/// Identifiers are 1 to 128 characters drawn from ASCII letters, digits,
/// `.`, `_` and `-`, and may not be `.` or `..`. They double as storage key
/// components.
pub fn validate_version_id(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(PersistError::versioning(format!(
            "version id must be 1 to {MAX_VERSION_LEN} characters, got {}",
            version.len()
        )));
    }
    if version == "." || version == ".." {
        return Err(PersistError::versioning(format!(
            "'{version}' is not a valid version id"
        )));
    }
    if let Some(bad) = version
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(PersistError::versioning(format!(
            "version id '{version}' contains invalid character {bad:?}"
        )));
    }
    Ok(())
}
