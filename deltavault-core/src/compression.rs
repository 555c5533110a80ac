/*!
Compression codecs for stored payloads and serialized delta records.

Gzip is the default for everything written to storage. The delta compressor
also uses it to estimate compression ratios for new records.
*/

use crate::{PersistError, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Gzip streams start with these two bytes
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression abstraction for stored bytes
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Name recorded in snapshot metadata
    fn algorithm_name(&self) -> &str;
}

impl<C: CompressionAdapter + ?Sized> CompressionAdapter for Box<C> {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        (**self).compress(data)
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        (**self).decompress(compressed_data)
    }

    fn algorithm_name(&self) -> &str {
        (**self).algorithm_name()
    }
}

/// Codec selection as it appears in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Gzip,
    None,
}

impl CompressionKind {
    /// Build the adapter for this codec
    pub fn build(self, level: Option<u32>) -> Box<dyn CompressionAdapter> {
        match self {
            CompressionKind::Gzip => match level {
                Some(level) => Box::new(GzipCompressor::with_level(level)),
                None => Box::new(GzipCompressor::new()),
            },
            CompressionKind::None => Box::new(NoCompression::new()),
        }
    }
}

/// Returns true if `data` looks like a gzip stream
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

/// Decompress gzip data, passing anything else through untouched
pub fn decompress_auto(data: &[u8]) -> Result<Vec<u8>> {
    if is_gzip(data) {
        GzipCompressor::new().decompress(data)
    } else {
        Ok(data.to_vec())
    }
}

/// Gzip compression adapter
///
/// Output is deterministic for a given input and level (the gzip header
/// carries no modification time), which keeps serialized deltas byte-stable.
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a compressor with an explicit level
    ///
    /// # Arguments
    /// * `level` - Compression level from 0 (store) to 9 (smallest); larger values are clamped to 9
    ///
    /// # Returns
    /// A new GzipCompressor instance
    ///
    /// # Example
    /// ```rust
    /// use deltavault_core::{CompressionAdapter, GzipCompressor};
    ///
    /// let compressor = GzipCompressor::with_level(9);
    /// let packed = compressor.compress(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")?;
    /// assert_eq!(compressor.decompress(&packed)?, b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec());
    /// # Ok::<(), deltavault_core::PersistError>(())
    /// ```
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Level 1
    pub fn fast() -> Self {
        Self::with_level(1)
    }

    /// Level 9
    pub fn max() -> Self {
        Self::with_level(9)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            PersistError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| PersistError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| PersistError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Passthrough codec, for tests or already-compressed payloads
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}
