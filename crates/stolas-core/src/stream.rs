//! Streaming compression and decompression utilities.

/// Flush modes for streaming compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flush {
    /// No flush - buffer data for optimal compression.
    #[default]
    None,

    /// Sync flush - emit all pending output on a byte boundary,
    /// remain compressible. Use for: periodic checkpoints, network packets.
    Sync,

    /// Finish - complete stream with trailer.
    /// Use for: end of stream.
    Finish,
}
