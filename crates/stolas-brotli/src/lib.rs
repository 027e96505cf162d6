//! # Stolas Brotli
//!
//! Native Rust implementation of Brotli compression (RFC 7932), including
//! the "Large Window Brotli" extension.
//!
//! Brotli achieves high compression ratios, especially for text and web
//! content, by combining an LZ77-style match search over a sliding window
//! with context-modeled entropy coding and a built-in static dictionary.
//!
//! ## Features
//!
//! - **Pure Rust**: No C dependencies, fully native implementation
//! - **Quality Levels**: 0-11, from greedy one-pass search to a
//!   two-iteration optimal parse ("Zopfli")
//! - **Streaming**: Incremental compression and decompression with
//!   byte-aligned flush boundaries
//! - **Context Modeling**: Literal and distance context maps with
//!   histogram clustering
//! - **Large Window**: Optional window sizes up to 1 GiB (non-standard;
//!   decoders must opt in)
//!
//! ## Quick Start
//!
//! ```rust
//! use stolas_brotli::BrotliCodec;
//! use stolas_core::{Codec, Compressor, Decompressor, CompressionLevel};
//!
//! let codec = BrotliCodec::with_level(CompressionLevel::Default);
//! let compressed = codec.compress(b"Hello, Brotli!").unwrap();
//! let original = codec.decompress(&compressed).unwrap();
//! assert_eq!(original, b"Hello, Brotli!");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       stolas-brotli                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  encoder.rs             │  decoder.rs                       │
//! │  ├── ring_buffer        │  (state machine over bit_reader,  │
//! │  ├── hash/ (6 variants) │   huffman tables, context maps,   │
//! │  ├── backward_references│   output ring buffer)             │
//! │  ├── zopfli             │                                   │
//! │  ├── metablock          │                                   │
//! │  └── bit_stream         │                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  entropy / bit_cost     │  huffman (two-level tables)       │
//! │  block_splitter/cluster │  context (literal context modes)  │
//! │  prefix / command       │  dictionary/ (words, transforms)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## References
//!
//! - [RFC 7932 - Brotli Compressed Data Format](https://datatracker.ietf.org/doc/html/rfc7932)

mod backward_references;
mod bit_cost;
mod bit_reader;
mod bit_stream;
mod bit_writer;
mod block_splitter;
mod cluster;
mod command;
mod constants;
mod context;
mod decoder;
mod dictionary;
mod encoder;
mod entropy;
mod fast_log;
mod hash;
mod histogram;
mod huffman;
mod literal_cost;
mod metablock;
mod params;
mod prefix;
mod ring_buffer;
mod utf8;
mod zopfli;

pub use decoder::{DecodeFailure, Decoder, DecoderErrorCode, DecoderResult};
pub use encoder::{Encoder, Operation};
pub use params::{EncoderParams, Mode};

use std::io::{Read, Write};
use stolas_core::{
    Algorithm, Codec, CompressionLevel, CompressionStats, Compressor, Decompressor, Error, Flush,
    Result, StreamingCompressor, StreamingDecompressor,
};

/// Default window size (log2) for compression (22 = 4MB window).
const DEFAULT_LG_WIN: u32 = 22;

fn map_quality(level: CompressionLevel) -> i32 {
    match level {
        CompressionLevel::None => 0,
        CompressionLevel::Fast => 1,
        CompressionLevel::Default => 6,
        CompressionLevel::Best => 10,
        CompressionLevel::Ultra => 11,
        CompressionLevel::Custom(l) => l.clamp(0, 11),
    }
}

fn params_for(level: CompressionLevel, size_hint: usize) -> EncoderParams {
    EncoderParams {
        quality: map_quality(level),
        lgwin: DEFAULT_LG_WIN,
        size_hint,
        ..Default::default()
    }
}

fn compress_once(level: CompressionLevel, input: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(params_for(level, input.len()));
    let mut fed = 0usize;
    while fed < input.len() {
        fed += encoder.compress_stream(Operation::Process, &input[fed..])?;
    }
    encoder.compress_stream(Operation::Finish, b"")?;
    Ok(encoder.take_output())
}

fn decompress_once(input: &[u8]) -> Result<Vec<u8>> {
    match decoder::decompress_to_vec(input) {
        Ok(out) => Ok(out),
        Err(DecodeFailure::TruncatedInput) => Err(Error::unexpected_eof(input.len())),
        Err(DecodeFailure::Format(code)) => Err(Error::corrupted(code.name())),
    }
}

/// Brotli compressor.
#[derive(Debug, Clone)]
pub struct BrotliCompressor {
    level: CompressionLevel,
}

impl BrotliCompressor {
    /// Create a new compressor with default settings.
    pub fn new() -> Self {
        BrotliCompressor {
            level: CompressionLevel::Default,
        }
    }

    /// Create with compression level.
    pub fn with_level(level: CompressionLevel) -> Self {
        BrotliCompressor { level }
    }
}

impl Default for BrotliCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for BrotliCompressor {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Brotli
    }

    fn level(&self) -> CompressionLevel {
        self.level
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        compress_once(self.level, input)
    }

    fn compress_to(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let compressed = self.compress(input)?;
        if compressed.len() > output.len() {
            return Err(Error::buffer_too_small(compressed.len(), output.len()));
        }
        output[..compressed.len()].copy_from_slice(&compressed);
        Ok(compressed.len())
    }

    fn max_compressed_size(&self, input_len: usize) -> usize {
        // Worst case: uncompressed meta-blocks plus per-block headers.
        input_len + (input_len >> 2) + 128
    }

    fn stats(&self) -> Option<CompressionStats> {
        None
    }
}

/// Brotli decompressor.
#[derive(Debug, Clone, Default)]
pub struct BrotliDecompressor;

impl BrotliDecompressor {
    /// Create a new decompressor.
    pub fn new() -> Self {
        BrotliDecompressor
    }
}

impl Decompressor for BrotliDecompressor {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Brotli
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        decompress_once(input)
    }

    fn decompress_to(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let decompressed = self.decompress(input)?;
        if decompressed.len() > output.len() {
            return Err(Error::buffer_too_small(decompressed.len(), output.len()));
        }
        output[..decompressed.len()].copy_from_slice(&decompressed);
        Ok(decompressed.len())
    }

    fn stats(&self) -> Option<CompressionStats> {
        None
    }
}

/// Brotli codec combining compression and decompression.
#[derive(Debug, Clone)]
pub struct BrotliCodec {
    level: CompressionLevel,
}

impl BrotliCodec {
    /// Create a new codec with default settings.
    pub fn new() -> Self {
        BrotliCodec {
            level: CompressionLevel::Default,
        }
    }

    /// Create with compression level.
    pub fn with_level(level: CompressionLevel) -> Self {
        BrotliCodec { level }
    }
}

impl Default for BrotliCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for BrotliCodec {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Brotli
    }

    fn level(&self) -> CompressionLevel {
        self.level
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        compress_once(self.level, input)
    }

    fn compress_to(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let compressed = self.compress(input)?;
        if compressed.len() > output.len() {
            return Err(Error::buffer_too_small(compressed.len(), output.len()));
        }
        output[..compressed.len()].copy_from_slice(&compressed);
        Ok(compressed.len())
    }

    fn max_compressed_size(&self, input_len: usize) -> usize {
        input_len + (input_len >> 2) + 128
    }
}

impl Decompressor for BrotliCodec {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Brotli
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        decompress_once(input)
    }

    fn decompress_to(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let decompressed = self.decompress(input)?;
        if decompressed.len() > output.len() {
            return Err(Error::buffer_too_small(decompressed.len(), output.len()));
        }
        output[..decompressed.len()].copy_from_slice(&decompressed);
        Ok(decompressed.len())
    }
}

impl Codec for BrotliCodec {
    fn new() -> Self {
        BrotliCodec::new()
    }

    fn with_level(level: CompressionLevel) -> Self {
        BrotliCodec::with_level(level)
    }
}

/// Incremental compressor implementing the streaming trait.
pub struct BrotliStreamCompressor {
    encoder: Encoder,
    level: CompressionLevel,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl BrotliStreamCompressor {
    pub fn new(level: CompressionLevel) -> Self {
        BrotliStreamCompressor {
            encoder: Encoder::new(params_for(level, 0)),
            level,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn drain_pending(&mut self, output: &mut [u8]) -> usize {
        if self.pending_pos == self.pending.len() {
            self.pending = self.encoder.take_output();
            self.pending_pos = 0;
        }
        let n = (self.pending.len() - self.pending_pos).min(output.len());
        output[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
        self.pending_pos += n;
        n
    }
}

impl StreamingCompressor for BrotliStreamCompressor {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Brotli
    }

    fn compress_chunk(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        flush: Flush,
    ) -> Result<(usize, usize)> {
        let op = match flush {
            Flush::None => Operation::Process,
            Flush::Sync => Operation::Flush,
            Flush::Finish => Operation::Finish,
        };
        let mut read = 0usize;
        while read < input.len() {
            read += self.encoder.compress_stream(Operation::Process, &input[read..])?;
        }
        if op != Operation::Process {
            self.encoder.compress_stream(op, b"")?;
        }
        let written = self.drain_pending(output);
        Ok((read, written))
    }

    fn finish(&mut self, output: &mut [u8]) -> Result<usize> {
        if !self.encoder.is_finished() {
            self.encoder.compress_stream(Operation::Finish, b"")?;
        }
        Ok(self.drain_pending(output))
    }

    fn reset(&mut self) {
        self.encoder = Encoder::new(params_for(self.level, 0));
        self.pending.clear();
        self.pending_pos = 0;
    }
}

/// Incremental decompressor implementing the streaming trait.
pub struct BrotliStreamDecompressor {
    decoder: Decoder,
    finished: bool,
}

impl BrotliStreamDecompressor {
    pub fn new() -> Self {
        BrotliStreamDecompressor {
            decoder: Decoder::new(),
            finished: false,
        }
    }
}

impl Default for BrotliStreamDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingDecompressor for BrotliStreamDecompressor {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Brotli
    }

    fn decompress_chunk(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize, bool)> {
        let mut input_offset = 0usize;
        let mut output_offset = 0usize;
        let result =
            self.decoder
                .decompress_stream(input, &mut input_offset, output, &mut output_offset);
        match result {
            DecoderResult::Success => {
                self.finished = true;
                Ok((input_offset, output_offset, true))
            }
            DecoderResult::NeedsMoreInput | DecoderResult::NeedsMoreOutput => {
                Ok((input_offset, output_offset, false))
            }
            DecoderResult::Error(code) => Err(Error::corrupted(code.name())),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn reset(&mut self) {
        self.decoder.reset();
        self.finished = false;
    }
}

/// `std::io::Write` adapter: bytes written are compressed into the inner
/// writer.
pub struct Writer<W: Write> {
    inner: W,
    encoder: Encoder,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W, level: CompressionLevel) -> Self {
        Writer {
            inner,
            encoder: Encoder::new(params_for(level, 0)),
        }
    }

    pub fn with_params(inner: W, params: EncoderParams) -> Self {
        Writer {
            inner,
            encoder: Encoder::new(params),
        }
    }

    fn push_output(&mut self) -> std::io::Result<()> {
        let out = self.encoder.take_output();
        if !out.is_empty() {
            self.inner.write_all(&out)?;
        }
        Ok(())
    }

    /// Emits the final meta-block and returns the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        self.encoder
            .compress_stream(Operation::Finish, b"")
            .map_err(std::io::Error::other)?;
        self.push_output()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self
            .encoder
            .compress_stream(Operation::Process, buf)
            .map_err(std::io::Error::other)?;
        self.push_output()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder
            .compress_stream(Operation::Flush, b"")
            .map_err(std::io::Error::other)?;
        self.push_output()?;
        self.inner.flush()
    }
}

/// `std::io::Read` adapter: bytes read are decompressed from the inner
/// reader.
pub struct Reader<R: Read> {
    inner: R,
    decoder: Decoder,
    buf: Box<[u8]>,
    buf_start: usize,
    buf_end: usize,
    eof: bool,
}

/// A buffer size that avoids excessive round-trips without wasting much
/// memory; matches the constant used in `io::Copy`.
const READ_BUF_SIZE: usize = 32 * 1024;

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Reader {
            inner,
            decoder: Decoder::new(),
            buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            buf_start: 0,
            buf_end: 0,
            eof: false,
        }
    }
}

impl<R: Read> Read for Reader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.buf_start == self.buf_end && !self.eof && !self.decoder.has_more_output() {
                let n = self.inner.read(&mut self.buf)?;
                self.buf_start = 0;
                self.buf_end = n;
                if n == 0 {
                    self.eof = true;
                }
            }
            let input = &self.buf[self.buf_start..self.buf_end];
            let mut input_offset = 0usize;
            let mut output_offset = 0usize;
            let result =
                self.decoder
                    .decompress_stream(input, &mut input_offset, out, &mut output_offset);
            self.buf_start += input_offset;
            match result {
                DecoderResult::Success => return Ok(output_offset),
                DecoderResult::NeedsMoreOutput => return Ok(output_offset),
                DecoderResult::NeedsMoreInput => {
                    if output_offset > 0 {
                        return Ok(output_offset);
                    }
                    if self.eof {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "truncated brotli stream",
                        ));
                    }
                }
                DecoderResult::Error(code) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("brotli: {}", code.name()),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text() -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..200 {
            data.extend_from_slice(b"The standard library of every language ");
            data.extend_from_slice(format!("carries text like this, line {}.\n", i).as_bytes());
        }
        data
    }

    #[test]
    fn test_roundtrip_all_qualities() {
        let data = sample_text();
        for q in 0..=11 {
            let codec = BrotliCodec::with_level(CompressionLevel::Custom(q));
            let compressed = codec.compress(&data).unwrap();
            let decompressed = codec.decompress(&compressed).unwrap();
            assert_eq!(decompressed, data, "quality {}", q);
        }
    }

    #[test]
    fn test_roundtrip_empty_and_tiny() {
        let codec = BrotliCodec::new();
        for input in [&b""[..], b"a", b"ab", b"abc"] {
            let compressed = codec.compress(input).unwrap();
            assert_eq!(codec.decompress(&compressed).unwrap(), input);
        }
    }

    #[test]
    fn test_roundtrip_random_data() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x5701a5);
        let data: Vec<u8> = (0..100_000).map(|_| rng.gen()).collect();
        let codec = BrotliCodec::with_level(CompressionLevel::Fast);
        let compressed = codec.compress(&data).unwrap();
        let decompressed = codec.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_higher_quality_is_statistically_smaller() {
        let data = sample_text();
        let fast = BrotliCodec::with_level(CompressionLevel::Custom(2))
            .compress(&data)
            .unwrap();
        let best = BrotliCodec::with_level(CompressionLevel::Custom(10))
            .compress(&data)
            .unwrap();
        assert!(
            best.len() <= fast.len(),
            "q10 {} must not exceed q2 {}",
            best.len(),
            fast.len()
        );
    }

    #[test]
    fn test_compresses_text_well() {
        let data = sample_text();
        let codec = BrotliCodec::with_level(CompressionLevel::Best);
        let compressed = codec.compress(&data).unwrap();
        assert!(
            compressed.len() < data.len() / 4,
            "text must compress at least 4x, got {} -> {}",
            data.len(),
            compressed.len()
        );
    }

    #[test]
    fn test_verify_roundtrip_helper() {
        let codec = BrotliCodec::new();
        assert!(codec.verify_roundtrip(&sample_text()).unwrap());
    }

    #[test]
    fn test_io_writer_reader() {
        let data = sample_text();
        let mut writer = Writer::new(Vec::new(), CompressionLevel::Default);
        for chunk in data.chunks(777) {
            writer.write_all(chunk).unwrap();
        }
        let compressed = writer.finish().unwrap();

        let mut reader = Reader::new(&compressed[..]);
        let mut decompressed = Vec::new();
        reader.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_streaming_decompressor_small_outputs() {
        let data = sample_text();
        let compressed = BrotliCodec::new().compress(&data).unwrap();
        let mut dec = BrotliStreamDecompressor::new();
        let mut out = Vec::new();
        let mut chunk = [0u8; 333];
        let mut offset = 0usize;
        loop {
            let (read, written, done) = dec
                .decompress_chunk(&compressed[offset..], &mut chunk)
                .unwrap();
            offset += read;
            out.extend_from_slice(&chunk[..written]);
            if done {
                break;
            }
        }
        assert_eq!(out, data);
        assert!(dec.is_finished());
    }

    #[test]
    fn test_truncated_stream_reports_eof() {
        let compressed = BrotliCodec::new().compress(&sample_text()).unwrap();
        let truncated = &compressed[..compressed.len() / 2];
        let err = BrotliCodec::new().decompress(truncated).unwrap_err();
        assert_eq!(err.category(), "unexpected_eof");
    }

    #[test]
    fn test_corrupt_stream_reports_name() {
        // Craft: wbits '0', ISLAST=0, MNIBBLES=3, reserved bit = 1.
        let mut storage = vec![0u8; 16];
        let mut pos = 0usize;
        crate::bit_writer::write_bits(1, 0, &mut pos, &mut storage);
        crate::bit_writer::write_bits(1, 0, &mut pos, &mut storage);
        crate::bit_writer::write_bits(2, 3, &mut pos, &mut storage);
        crate::bit_writer::write_bits(1, 1, &mut pos, &mut storage);
        crate::bit_writer::jump_to_byte_boundary(&mut pos, &mut storage);
        storage.truncate(pos >> 3);
        let err = BrotliCodec::new().decompress(&storage).unwrap_err();
        assert!(err.to_string().contains("RESERVED"), "{}", err);
    }
}
