//! Configuration for vault storage, delta chains and retention
//!
//! [`VaultConfig`] selects the storage backend (local filesystem or memory),
//! the delta strategy and chain bounds, the payload codec and the snapshot
//! retention limit. It can be built in code, parsed from a URI, deserialized
//! from JSON, or overridden from `DELTAVAULT_*` environment variables.

use crate::compression::CompressionKind;
use crate::delta::DeltaStrategy;
use crate::{PersistError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default directory for local vaults
pub const DEFAULT_LOCAL_PATH: &str = "./vault";

/// Default registry file name inside a vault
pub const DEFAULT_REGISTRY_FILE: &str = "registry.json";

/// Environment variable overriding `max_snapshots`
pub const ENV_MAX_SNAPSHOTS: &str = "DELTAVAULT_MAX_SNAPSHOTS";
/// Environment variable overriding `delta.max_chain_length`
pub const ENV_MAX_CHAIN_LENGTH: &str = "DELTAVAULT_MAX_CHAIN_LENGTH";
/// Environment variable overriding `delta.strategy`
pub const ENV_STRATEGY: &str = "DELTAVAULT_STRATEGY";

/// Enumeration of supported storage backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    /// Local filesystem storage
    Local,
    /// Process memory, lost on drop
    Memory,
}

/// What `delete_snapshot` does when delta snapshots depend on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependentPolicy {
    /// Refuse the deletion
    Forbid,
    /// Rewrite dependents as full snapshots, then delete
    Materialize,
}

/// Delta chain behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    pub strategy: DeltaStrategy,
    /// Longest chain before optimization (or, for snapshots, a new full base)
    pub max_chain_length: usize,
    /// Whether exceeding `max_chain_length` triggers optimization
    pub enable_rebase: bool,
    /// Most recent deltas left untouched by optimization
    pub keep_recent: usize,
    /// Cache a replayed state every this many deltas (0 disables)
    pub checkpoint_interval: usize,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            strategy: DeltaStrategy::Dict,
            max_chain_length: 50,
            enable_rebase: true,
            keep_recent: 10,
            checkpoint_interval: 16,
        }
    }
}

impl DeltaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chain_length == 0 {
            return Err(PersistError::validation(
                "max_chain_length must be at least 1",
            ));
        }
        if self.keep_recent >= self.max_chain_length {
            return Err(PersistError::validation(format!(
                "keep_recent ({}) must be smaller than max_chain_length ({})",
                self.keep_recent, self.max_chain_length
            )));
        }
        Ok(())
    }
}

/// Configuration structure for a snapshot vault
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// The storage backend to use
    pub backend: StorageBackend,
    /// Base path for local storage (defaults to `./vault`)
    pub local_base_path: Option<PathBuf>,
    /// Retention limit; 0 keeps everything
    pub max_snapshots: usize,
    pub delta: DeltaConfig,
    pub compression: CompressionKind,
    /// Gzip level 0-9, codec default when unset
    pub compression_level: Option<u32>,
    pub dependent_policy: DependentPolicy,
    pub registry_file: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self::default_local()
    }
}

impl VaultConfig {
    /// Local filesystem vault under `./vault`
    pub fn default_local() -> Self {
        VaultConfig {
            backend: StorageBackend::Local,
            local_base_path: None,
            max_snapshots: 100,
            delta: DeltaConfig::default(),
            compression: CompressionKind::Gzip,
            compression_level: None,
            dependent_policy: DependentPolicy::Forbid,
            registry_file: DEFAULT_REGISTRY_FILE.to_string(),
        }
    }

    /// In-memory vault
    pub fn memory() -> Self {
        VaultConfig {
            backend: StorageBackend::Memory,
            ..Self::default_local()
        }
    }

    /// Local vault rooted at `path`
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        VaultConfig {
            local_base_path: Some(path.into()),
            ..Self::default_local()
        }
    }

    pub fn with_max_snapshots(mut self, max_snapshots: usize) -> Self {
        self.max_snapshots = max_snapshots;
        self
    }

    pub fn with_delta(mut self, delta: DeltaConfig) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_strategy(mut self, strategy: DeltaStrategy) -> Self {
        self.delta.strategy = strategy;
        self
    }

    pub fn with_compression(mut self, compression: CompressionKind) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_dependent_policy(mut self, policy: DependentPolicy) -> Self {
        self.dependent_policy = policy;
        self
    }

    /// Resolved base directory for local vaults
    pub fn base_path(&self) -> PathBuf {
        self.local_base_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_PATH))
    }

    /// Parse a vault URI
    ///
    /// Supports formats:
    /// - `memory://` for an in-memory vault
    /// - `file:///abs/path`, `/local/path` or `./relative/path` for local storage
    pub fn from_uri(uri: &str) -> Result<VaultConfig> {
        if let Some(rest) = uri.strip_prefix("memory://") {
            if !rest.is_empty() {
                return Err(PersistError::validation(format!(
                    "memory URI takes no path, got '{rest}'"
                )));
            }
            return Ok(Self::memory());
        }

        let path = uri.strip_prefix("file://").unwrap_or(uri);
        if path.is_empty() {
            return Err(PersistError::validation("Invalid vault URI: missing path"));
        }
        if path.contains("://") {
            return Err(PersistError::validation(format!(
                "Unsupported vault URI scheme in '{uri}'"
            )));
        }
        Ok(Self::local(path))
    }

    /// Apply `DELTAVAULT_*` environment overrides
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(ENV_MAX_SNAPSHOTS) {
            self.max_snapshots = value.trim().parse().map_err(|e| {
                PersistError::validation(format!("{ENV_MAX_SNAPSHOTS}='{value}': {e}"))
            })?;
        }
        if let Ok(value) = std::env::var(ENV_MAX_CHAIN_LENGTH) {
            self.delta.max_chain_length = value.trim().parse().map_err(|e| {
                PersistError::validation(format!("{ENV_MAX_CHAIN_LENGTH}='{value}': {e}"))
            })?;
            if self.delta.keep_recent >= self.delta.max_chain_length {
                self.delta.keep_recent = self.delta.max_chain_length / 2;
            }
        }
        if let Ok(value) = std::env::var(ENV_STRATEGY) {
            self.delta.strategy = value.trim().parse()?;
        }
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.delta.validate()?;

        if self.registry_file.is_empty()
            || self.registry_file.contains('/')
            || self.registry_file.contains('\\')
        {
            return Err(PersistError::validation(format!(
                "registry_file must be a plain file name, got '{}'",
                self.registry_file
            )));
        }

        if let Some(level) = self.compression_level {
            if level > 9 {
                return Err(PersistError::validation(format!(
                    "compression_level must be 0-9, got {level}"
                )));
            }
        }

        match self.backend {
            StorageBackend::Local => {
                if let Some(path) = &self.local_base_path {
                    if path.as_os_str().is_empty() {
                        return Err(PersistError::validation(
                            "local_base_path cannot be empty",
                        ));
                    }
                }
            }
            StorageBackend::Memory => {}
        }
        Ok(())
    }
}
