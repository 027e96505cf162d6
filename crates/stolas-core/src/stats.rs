//! Statistics for compression operations.

use crate::types::{Algorithm, CompressionRatio};

/// Statistics from a compression/decompression operation.
#[derive(Debug, Clone, Default)]
pub struct CompressionStats {
    /// Algorithm used.
    pub algorithm: Option<Algorithm>,

    /// Original (uncompressed) size in bytes.
    pub original_size: usize,

    /// Compressed size in bytes.
    pub compressed_size: usize,

    /// Number of blocks processed.
    pub blocks_processed: usize,
}

impl CompressionStats {
    /// Create new empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get compression ratio.
    pub fn ratio(&self) -> CompressionRatio {
        CompressionRatio::new(self.original_size, self.compressed_size)
    }

    /// Get space savings as percentage.
    pub fn savings_percent(&self) -> f64 {
        self.ratio().savings_percent()
    }
}
