/*!
Error types for the DeltaVault core engine.
*/

use thiserror::Error;

/// Result type used throughout the DeltaVault core.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Errors that can occur during persistence, delta and snapshot operations.
#[derive(Error, Debug)]
pub enum PersistError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic persistence failure (serialization, backend contract violations)
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Storage adapter errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Checksum mismatch on read. Never silently corrected.
    #[error("Data integrity check failed for {context}: expected {expected}, got {actual}")]
    DataIntegrity {
        context: String,
        expected: String,
        actual: String,
    },

    /// Snapshot-specific failures
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Bad or duplicate version identifiers
    #[error("Versioning error: {0}")]
    Versioning(String),

    /// Requested version, tag or base is not in the registry
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Delta calculation, application or (de)serialization failure
    #[error("Delta compression error: {0}")]
    DeltaCompression(String),

    /// Replay index past the end of a delta chain
    #[error("Chain index {index} out of range (chain length {length})")]
    ChainIndexOutOfRange { index: usize, length: usize },

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Coarse error taxonomy used by callers that dispatch on error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Persistence,
    DataIntegrity,
    Snapshot,
    SnapshotNotFound,
    DeltaCompression,
}

impl PersistError {
    /// Create a new persistence error
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new snapshot error
    pub fn snapshot<S: Into<String>>(msg: S) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Create a new versioning error
    pub fn versioning<S: Into<String>>(msg: S) -> Self {
        Self::Versioning(msg.into())
    }

    /// Create a new not-found error for a version, tag or base
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::SnapshotNotFound(what.into())
    }

    /// Create a new delta compression error
    pub fn delta<S: Into<String>>(msg: S) -> Self {
        Self::DeltaCompression(msg.into())
    }

    /// Create a new integrity error
    pub fn integrity<C, E, A>(context: C, expected: E, actual: A) -> Self
    where
        C: Into<String>,
        E: Into<String>,
        A: Into<String>,
    {
        Self::DataIntegrity {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Map this error onto the coarse taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DataIntegrity { .. } => ErrorKind::DataIntegrity,
            Self::Snapshot(_) | Self::Versioning(_) => ErrorKind::Snapshot,
            Self::SnapshotNotFound(_) => ErrorKind::SnapshotNotFound,
            Self::DeltaCompression(_) | Self::ChainIndexOutOfRange { .. } => {
                ErrorKind::DeltaCompression
            }
            Self::Io(_)
            | Self::Json(_)
            | Self::Persistence(_)
            | Self::Storage(_)
            | Self::Compression(_)
            | Self::Validation(_) => ErrorKind::Persistence,
        }
    }

    /// True for checksum mismatches
    pub fn is_integrity_failure(&self) -> bool {
        self.kind() == ErrorKind::DataIntegrity
    }

    /// True when the requested version, tag or base does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::SnapshotNotFound
    }
}
