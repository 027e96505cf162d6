//! # Stolas Core
//!
//! Core traits, types, and streaming API for the Stolas compression library.
//!
//! Stolas is named after the 36th prince of the Ars Goetia, a keeper of
//! hidden knowledge - fitting for a library whose job is to find the hidden
//! structure in data and write it down in fewer bits.
//!
//! ## Design Philosophy
//!
//! - **Streaming-first**: All operations support incremental processing
//! - **Zero-copy where possible**: Minimize allocations and memory copies
//! - **One error type**: Every codec in the workspace speaks [`Error`]
//!
//! ## Core Traits
//!
//! - [`Compressor`] - One-shot compression operations
//! - [`Decompressor`] - One-shot decompression operations
//! - [`Codec`] - Combined compress/decompress capability
//! - [`StreamingCompressor`] - Incremental compression
//! - [`StreamingDecompressor`] - Incremental decompression
//!
//! ## Example
//!
//! ```ignore
//! use stolas_core::{Codec, CompressionLevel};
//! use stolas_brotli::BrotliCodec;
//!
//! let codec = BrotliCodec::with_level(CompressionLevel::Best);
//! let compressed = codec.compress(data)?;
//! let original = codec.decompress(&compressed)?;
//! ```

pub mod error;
pub mod stats;
pub mod stream;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use stats::CompressionStats;
pub use stream::Flush;
pub use traits::{Codec, Compressor, Decompressor, StreamingCompressor, StreamingDecompressor};
pub use types::{Algorithm, CompressionLevel, CompressionRatio};
