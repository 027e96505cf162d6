//! Streaming encoder.
//!
//! Input accumulates in the ring buffer; whenever a full input block is
//! buffered (or on flush/finish) the backward-reference search runs over
//! the new bytes and a meta-block is serialised. Between meta-blocks up
//! to seven bits of the last output byte stay in `last_bytes`, so
//! meta-blocks concatenate at the bit level.

use crate::backward_references::create_backward_references;
use crate::bit_stream::{
    store_meta_block, store_meta_block_trivial, store_uncompressed_meta_block,
};
use crate::bit_writer::write_bits;
use crate::command::Command;
use crate::constants::NUM_DISTANCE_SYMBOLS;
use crate::context::ContextMode;
use crate::dictionary::get_encoder_dictionary;
use crate::fast_log::log2_floor_nonzero;
use crate::hash::binary_tree::BinaryTreeHasher;
use crate::hash::{new_hasher, Hasher};
use crate::histogram::HistogramLiteral;
use crate::metablock::{build_meta_block, optimize_histograms, MetaBlockSplit};
use crate::params::*;
use crate::ring_buffer::RingBuffer;
use crate::utf8::{is_mostly_utf8, K_MIN_UTF8_RATIO};
use crate::zopfli::{create_hq_zopfli_backward_references, create_zopfli_backward_references};
use stolas_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Processing,
    FlushRequested,
    Finished,
    MetadataHead,
    MetadataBody,
}

/// Operations the streaming loop can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Process,
    Flush,
    Finish,
    EmitMetadata,
}

/// Either the greedy-family hasher behind the trait, or the binary-tree
/// hasher the optimal parse needs concretely.
enum EncoderHasher {
    General(Box<dyn Hasher>),
    Tree(BinaryTreeHasher),
}

/// The streaming Brotli encoder.
pub struct Encoder {
    params: EncoderParams,
    hasher: Option<EncoderHasher>,
    hasher_prepared: bool,
    input_pos: u64,
    ringbuffer: RingBuffer,
    commands: Vec<Command>,
    num_literals: usize,
    last_insert_len: usize,
    last_flush_pos: u64,
    last_processed_pos: u64,
    dist_cache: [i32; 16],
    saved_dist_cache: [i32; 4],
    last_bytes: u16,
    last_bytes_bits: u8,
    prev_byte: u8,
    prev_byte2: u8,
    storage: Vec<u8>,
    remaining_metadata_bytes: u32,
    stream_state: StreamState,
    is_last_block_emitted: bool,
    is_initialized: bool,
    output: Vec<u8>,
}

/// Encodes the stream header: 1..=7 bits of window descriptor, or the
/// large-window escape plus 6 bits.
fn encode_window_bits(lgwin: u32, large_window: bool) -> (u16, u8) {
    if large_window {
        (((lgwin & 0x3F) << 8 | 0x11) as u16, 14)
    } else if lgwin == 16 {
        (0, 1)
    } else if lgwin == 17 {
        (1, 7)
    } else if lgwin > 17 {
        (((lgwin - 17) << 1 | 0x01) as u16, 4)
    } else {
        (((lgwin - 8) << 4 | 0x01) as u16, 7)
    }
}

/// Sampling check that compression can beat a raw copy at all.
fn should_compress(
    data: &[u8],
    mask: usize,
    last_flush_pos: u64,
    bytes: usize,
    num_literals: usize,
    num_commands: usize,
) -> bool {
    // TODO: find more precise minimal block overhead.
    if bytes <= 2 {
        return false;
    }
    if num_commands < (bytes >> 8) + 2
        && num_literals as f64 > 0.99 * bytes as f64
    {
        let mut literal_histo = HistogramLiteral::new();
        const K_SAMPLE_RATE: u32 = 13;
        const K_MIN_ENTROPY: f64 = 7.92;
        let bit_cost_threshold = bytes as f64 * K_MIN_ENTROPY / f64::from(K_SAMPLE_RATE);
        let t = (bytes + K_SAMPLE_RATE as usize - 1) / K_SAMPLE_RATE as usize;
        let mut pos = last_flush_pos as u32;
        for _ in 0..t {
            literal_histo.add(data[pos as usize & mask] as usize);
            pos = pos.wrapping_add(K_SAMPLE_RATE);
        }
        if crate::bit_cost::bits_entropy(&literal_histo.data, 256) > bit_cost_threshold {
            return false;
        }
    }
    true
}

/// Literal context mode for the next meta-block.
fn choose_context_mode(
    params: &EncoderParams,
    data: &[u8],
    pos: usize,
    mask: usize,
    length: usize,
) -> ContextMode {
    // Non-UTF8 data gets the signed context model only at the highest
    // qualities; the check is not worth the time below that.
    if params.quality >= MIN_QUALITY_FOR_HQ_BLOCK_SPLITTING
        && !is_mostly_utf8(data, pos, mask, length, K_MIN_UTF8_RATIO)
    {
        return ContextMode::Signed;
    }
    ContextMode::Utf8
}

impl Encoder {
    pub fn new(mut params: EncoderParams) -> Encoder {
        params.sanitize();
        Encoder {
            ringbuffer: RingBuffer::new(0, 0),
            params,
            hasher: None,
            hasher_prepared: false,
            input_pos: 0,
            commands: Vec::new(),
            num_literals: 0,
            last_insert_len: 0,
            last_flush_pos: 0,
            last_processed_pos: 0,
            dist_cache: [4, 11, 15, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            saved_dist_cache: [4, 11, 15, 16],
            last_bytes: 0,
            last_bytes_bits: 0,
            prev_byte: 0,
            prev_byte2: 0,
            storage: Vec::new(),
            remaining_metadata_bytes: u32::MAX,
            stream_state: StreamState::Processing,
            is_last_block_emitted: false,
            is_initialized: false,
            output: Vec::new(),
        }
    }

    /// Finish lazy initialization once the first operation arrives.
    fn ensure_initialized(&mut self) {
        if self.is_initialized {
            return;
        }
        self.last_bytes = 0;
        self.last_bytes_bits = 0;
        self.remaining_metadata_bytes = u32::MAX;
        self.params.sanitize();
        self.params.lgblock = self.params.compute_lgblock();
        self.params.choose_distance_params();
        self.params.choose_hasher();
        self.ringbuffer = RingBuffer::new(self.params.compute_rb_bits(), self.params.lgblock);

        // Seed the output with the stream header.
        let (last_bytes, last_bytes_bits) =
            encode_window_bits(self.params.lgwin, self.params.large_window);
        self.last_bytes = last_bytes;
        self.last_bytes_bits = last_bytes_bits;
        self.is_initialized = true;
    }

    fn input_block_size(&self) -> usize {
        1usize << self.params.lgblock
    }

    fn unprocessed_input_size(&self) -> u64 {
        self.input_pos - self.last_processed_pos
    }

    fn remaining_input_block_size(&self) -> usize {
        let delta = self.unprocessed_input_size();
        let block_size = self.input_block_size() as u64;
        if delta >= block_size {
            return 0;
        }
        (block_size - delta) as usize
    }

    /// Takes the compressed bytes produced so far.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Buffers `data`, emitting meta-blocks whenever an input block fills.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut fed = 0usize;
        while fed < data.len() {
            fed += self.compress_stream(Operation::Process, &data[fed..])?;
        }
        Ok(())
    }

    /// Emits a meta-block boundary; pads to a byte boundary with an empty
    /// metadata block if needed, so the output so far is decodable.
    pub fn flush(&mut self) -> Result<()> {
        self.compress_stream(Operation::Flush, b"").map(|_| ())
    }

    /// Emits the final (possibly empty) ISLAST meta-block.
    pub fn finish(&mut self) -> Result<()> {
        self.compress_stream(Operation::Finish, b"").map(|_| ())
    }

    pub fn is_finished(&self) -> bool {
        self.stream_state == StreamState::Finished
    }

    fn get_storage(&mut self, size: usize) -> Vec<u8> {
        let mut storage = std::mem::take(&mut self.storage);
        if storage.len() < size {
            storage.resize(size, 0);
        }
        storage
    }

    fn copy_input_to_ring_buffer(&mut self, input: &[u8]) {
        self.ringbuffer.write(input);
        self.input_pos += input.len() as u64;
        // On the first lap, zero seven bytes after the written prefix so
        // 64-bit hash probes read defined data; later laps carry real
        // history there.
        if self.ringbuffer.pos() <= self.ringbuffer.mask() {
            let pos = self.ringbuffer.pos() as usize;
            for b in self.ringbuffer.buffer_mut()[pos..pos + 7].iter_mut() {
                *b = 0;
            }
        }
    }

    /// Marks all input as processed; true if position wrapping occurred.
    fn update_last_processed_pos(&mut self) -> bool {
        let wrapped_last = wrap_position(self.last_processed_pos);
        let wrapped_input = wrap_position(self.input_pos);
        self.last_processed_pos = self.input_pos;
        wrapped_input < wrapped_last
    }

    fn hasher_reset(&mut self) {
        self.hasher_prepared = false;
    }

    fn init_or_stitch_to_previous_block(&mut self, position: usize, input_size: usize, is_last: bool) {
        if self.hasher.is_none() {
            self.hasher = Some(if self.params.quality >= ZOPFLIFICATION_QUALITY {
                EncoderHasher::Tree(BinaryTreeHasher::new(&self.params))
            } else {
                EncoderHasher::General(new_hasher(&self.params))
            });
            self.hasher_prepared = false;
        }
        let one_shot = position == 0 && is_last;
        let data = self.ringbuffer.buffer();
        let mask = self.ringbuffer.mask() as usize;
        let prepared = self.hasher_prepared;
        match self.hasher.as_mut().unwrap() {
            EncoderHasher::General(h) => {
                if !prepared {
                    h.prepare(one_shot, input_size, data);
                }
                h.stitch_to_previous_block(input_size, position, data, mask);
            }
            EncoderHasher::Tree(h) => {
                if !prepared {
                    h.prepare(one_shot, input_size);
                }
                h.stitch_to_previous_block(input_size, position, data, mask);
            }
        }
        self.hasher_prepared = true;
    }

    /// Extends the last copy command over bytes that continue to match,
    /// so a flush boundary does not truncate a run.
    fn extend_last_command(&mut self, bytes: &mut u32, wrapped_last_processed_pos: &mut u32) {
        let last_command = match self.commands.last_mut() {
            Some(c) => c,
            None => return,
        };
        let data = self.ringbuffer.buffer();
        let mask = u64::from(self.ringbuffer.mask());
        let max_backward_distance = (1u64 << self.params.lgwin) - crate::constants::WINDOW_GAP as u64;
        let last_copy_len = u64::from(last_command.copy_len & 0x01FF_FFFF);
        let last_processed_pos = self.last_processed_pos - last_copy_len;
        let max_distance = last_processed_pos.min(max_backward_distance);
        let cmd_dist = self.dist_cache[0] as u64;
        let distance_code = last_command.restore_distance_code(&self.params.dist);
        if distance_code < crate::constants::NUM_DISTANCE_SHORT_CODES as u32
            || u64::from(distance_code - (crate::constants::NUM_DISTANCE_SHORT_CODES as u32 - 1))
                == cmd_dist
        {
            if cmd_dist <= max_distance {
                while *bytes != 0
                    && data[(*wrapped_last_processed_pos as u64 & mask) as usize]
                        == data[((u64::from(*wrapped_last_processed_pos) - cmd_dist) & mask) as usize]
                {
                    last_command.copy_len += 1;
                    *bytes -= 1;
                    *wrapped_last_processed_pos += 1;
                }
            }
            // The copy length is at most the meta-block size, and thus
            // expressible.
            last_command.cmd_prefix = crate::prefix::get_length_code(
                last_command.insert_len as usize,
                ((last_command.copy_len & 0x01FF_FFFF) + (last_command.copy_len >> 25)) as usize,
                (last_command.dist_prefix & 0x3FF) == 0,
            );
        }
    }

    fn write_output(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
    }

    /// Emits one meta-block for `[last_flush_pos, last_flush_pos+bytes)`.
    #[allow(clippy::too_many_arguments)]
    fn write_meta_block_internal(
        &mut self,
        bytes: usize,
        is_last: bool,
        literal_context_mode: ContextMode,
        storage_ix: &mut usize,
        storage: &mut [u8],
    ) {
        let wrapped_last_flush_pos = wrap_position(self.last_flush_pos) as usize;
        let mask = self.ringbuffer.mask() as usize;

        if bytes == 0 {
            // ISLAST and ISEMPTY.
            write_bits(2, 3, storage_ix, storage);
            *storage_ix = (*storage_ix + 7) & !7;
            return;
        }

        if !should_compress(
            self.ringbuffer.buffer(),
            mask,
            self.last_flush_pos,
            bytes,
            self.num_literals,
            self.commands.len(),
        ) {
            // The distance cache saw updates that are now unused; restore.
            self.dist_cache[..4].copy_from_slice(&self.saved_dist_cache);
            store_uncompressed_meta_block(
                is_last,
                self.ringbuffer.buffer(),
                wrapped_last_flush_pos,
                mask,
                bytes,
                storage_ix,
                storage,
            );
            return;
        }

        debug_assert!(*storage_ix <= 14);
        let last_bytes = u16::from(storage[1]) << 8 | u16::from(storage[0]);
        let last_bytes_bits = *storage_ix as u8;
        if self.params.quality < MIN_QUALITY_FOR_BLOCK_SPLIT {
            store_meta_block_trivial(
                self.ringbuffer.buffer(),
                wrapped_last_flush_pos,
                bytes,
                mask,
                is_last,
                &self.params,
                &self.commands,
                storage_ix,
                storage,
            );
        } else {
            let mut mb = MetaBlockSplit::default();
            build_meta_block(
                self.ringbuffer.buffer(),
                wrapped_last_flush_pos,
                mask,
                &self.params,
                self.prev_byte,
                self.prev_byte2,
                &self.commands,
                literal_context_mode,
                &mut mb,
            );
            if self.params.quality >= MIN_QUALITY_FOR_OPTIMIZE_HISTOGRAMS {
                // The effective distance symbols may be fewer than the
                // alphabet for large-window streams.
                let num_effective_dist_codes =
                    (self.params.dist.alphabet_size as usize).min(NUM_DISTANCE_SYMBOLS);
                optimize_histograms(num_effective_dist_codes, &mut mb);
            }
            store_meta_block(
                self.ringbuffer.buffer(),
                wrapped_last_flush_pos,
                bytes,
                mask,
                self.prev_byte,
                self.prev_byte2,
                is_last,
                &self.params,
                literal_context_mode,
                &self.commands,
                &mb,
                storage_ix,
                storage,
            );
        }

        if bytes + 4 < *storage_ix >> 3 {
            // The compressed form grew over raw; emit uncompressed after
            // all.
            self.dist_cache[..4].copy_from_slice(&self.saved_dist_cache);
            storage[0] = last_bytes as u8;
            storage[1] = (last_bytes >> 8) as u8;
            *storage_ix = last_bytes_bits as usize;
            store_uncompressed_meta_block(
                is_last,
                self.ringbuffer.buffer(),
                wrapped_last_flush_pos,
                mask,
                bytes,
                storage_ix,
                storage,
            );
        }
    }

    /// Processes accumulated input, emitting a meta-block when forced or
    /// when enough has piled up.
    fn encode_data(&mut self, is_last: bool, force_flush: bool) -> Result<()> {
        let delta = self.unprocessed_input_size();
        let mut bytes = delta as u32;
        let mut wrapped_last_processed_pos = wrap_position(self.last_processed_pos);

        if self.is_last_block_emitted {
            return Err(Error::InvalidState {
                expected: "open stream",
                actual: "finished stream",
            });
        }
        if is_last {
            self.is_last_block_emitted = true;
        }
        if delta > self.input_block_size() as u64 {
            return Err(Error::InvalidState {
                expected: "at most one input block",
                actual: "oversized block",
            });
        }

        // Theoretical max number of commands is 1 per 2 bytes.
        self.commands.reserve(bytes as usize / 2 + 1);

        self.init_or_stitch_to_previous_block(
            wrapped_last_processed_pos as usize,
            bytes as usize,
            is_last,
        );

        let literal_context_mode = choose_context_mode(
            &self.params,
            self.ringbuffer.buffer(),
            wrap_position(self.last_flush_pos) as usize,
            self.ringbuffer.mask() as usize,
            (self.input_pos - self.last_flush_pos) as usize,
        );

        if !self.commands.is_empty() && self.last_insert_len == 0 {
            self.extend_last_command(&mut bytes, &mut wrapped_last_processed_pos);
        }

        {
            let data = self.ringbuffer.buffer();
            let mask = self.ringbuffer.mask() as usize;
            let dictionary = get_encoder_dictionary();
            match self.hasher.as_mut().unwrap() {
                EncoderHasher::Tree(h) => {
                    if self.params.quality == ZOPFLIFICATION_QUALITY {
                        create_zopfli_backward_references(
                            bytes as usize,
                            wrapped_last_processed_pos as usize,
                            data,
                            mask,
                            &self.params,
                            dictionary,
                            h,
                            &mut self.dist_cache,
                            &mut self.last_insert_len,
                            &mut self.commands,
                            &mut self.num_literals,
                        );
                    } else {
                        create_hq_zopfli_backward_references(
                            bytes as usize,
                            wrapped_last_processed_pos as usize,
                            data,
                            mask,
                            &self.params,
                            dictionary,
                            h,
                            &mut self.dist_cache,
                            &mut self.last_insert_len,
                            &mut self.commands,
                            &mut self.num_literals,
                        );
                    }
                }
                EncoderHasher::General(h) => {
                    create_backward_references(
                        bytes as usize,
                        wrapped_last_processed_pos as usize,
                        data,
                        mask,
                        &self.params,
                        h.as_mut(),
                        dictionary,
                        &mut self.dist_cache,
                        &mut self.last_insert_len,
                        &mut self.commands,
                        &mut self.num_literals,
                    );
                }
            }
        }

        {
            let max_length = self.params.max_metablock_size();
            let max_literals = max_length / 8;
            let max_commands = max_length / 8;
            let processed_bytes = (self.input_pos - self.last_flush_pos) as usize;
            // If the next full block cannot fit the meta-block, flush now.
            let next_input_fits_metablock =
                processed_bytes + self.input_block_size() <= max_length;
            // Without block splitting, flush once a decent number of
            // symbols has accumulated.
            let should_flush = self.params.quality < MIN_QUALITY_FOR_BLOCK_SPLIT
                && self.num_literals + self.commands.len() >= MAX_NUM_DELAYED_SYMBOLS;
            if !is_last
                && !force_flush
                && !should_flush
                && next_input_fits_metablock
                && self.num_literals < max_literals
                && self.commands.len() < max_commands
            {
                // Merge with the next input block; flushing happens later.
                if self.update_last_processed_pos() {
                    self.hasher_reset();
                }
                return Ok(());
            }
        }

        // The trailing insert-only command.
        if self.last_insert_len > 0 {
            self.commands.push(Command::new_insert(self.last_insert_len));
            self.num_literals += self.last_insert_len;
            self.last_insert_len = 0;
        }

        if !is_last && self.input_pos == self.last_flush_pos {
            // Nothing new; nothing to do.
            return Ok(());
        }
        debug_assert!(self.input_pos >= self.last_flush_pos);
        debug_assert!(self.input_pos > self.last_flush_pos || is_last);
        debug_assert!(self.input_pos - self.last_flush_pos <= 1 << 24);

        let metablock_size = (self.input_pos - self.last_flush_pos) as usize;
        let mut storage = self.get_storage(2 * metablock_size + 503);
        let mut storage_ix = self.last_bytes_bits as usize;
        storage[0] = self.last_bytes as u8;
        storage[1] = (self.last_bytes >> 8) as u8;
        self.write_meta_block_internal(
            metablock_size,
            is_last,
            literal_context_mode,
            &mut storage_ix,
            &mut storage,
        );
        self.last_bytes = u16::from(storage[storage_ix >> 3]);
        self.last_bytes_bits = (storage_ix & 7) as u8;
        self.last_flush_pos = self.input_pos;
        if self.update_last_processed_pos() {
            self.hasher_reset();
        }
        let mask = self.ringbuffer.mask();
        if self.last_flush_pos > 0 {
            self.prev_byte =
                self.ringbuffer.buffer()[((self.last_flush_pos as u32).wrapping_sub(1) & mask) as usize];
        }
        if self.last_flush_pos > 1 {
            self.prev_byte2 =
                self.ringbuffer.buffer()[((self.last_flush_pos as u32).wrapping_sub(2) & mask) as usize];
        }
        self.commands.clear();
        self.num_literals = 0;
        // Remember the distance cache for a possible later uncompressed
        // fallback.
        self.saved_dist_cache.copy_from_slice(&self.dist_cache[..4]);
        let out_bytes = storage_ix >> 3;
        self.output.extend_from_slice(&storage[..out_bytes]);
        self.storage = storage;
        Ok(())
    }

    /// Emits the 6-bit empty-metadata block that seals a flush on a byte
    /// boundary.
    fn inject_byte_padding_block(&mut self) {
        let mut seal = u32::from(self.last_bytes);
        let mut seal_bits = usize::from(self.last_bytes_bits);
        self.last_bytes = 0;
        self.last_bytes_bits = 0;
        // is_last = 0, data_nibbles = 11, reserved = 0, meta_nibbles = 00.
        seal |= 0x6 << seal_bits;
        seal_bits += 6;
        let destination = [
            seal as u8,
            (seal >> 8) as u8,
            (seal >> 16) as u8,
        ];
        let n = (seal_bits + 7) >> 3;
        let out = destination[..n].to_vec();
        self.write_output(&out);
    }

    fn check_flush_complete(&mut self) {
        if self.stream_state == StreamState::FlushRequested {
            self.stream_state = StreamState::Processing;
        }
    }

    /// Dumps remaining output bits plus a metadata-block header.
    fn write_metadata_header(&mut self, block_size: usize) -> Vec<u8> {
        let mut header = vec![0u8; 16];
        let mut storage_ix = usize::from(self.last_bytes_bits);
        header[0] = self.last_bytes as u8;
        header[1] = (self.last_bytes >> 8) as u8;
        self.last_bytes = 0;
        self.last_bytes_bits = 0;

        write_bits(1, 0, &mut storage_ix, &mut header);
        write_bits(2, 3, &mut storage_ix, &mut header);
        write_bits(1, 0, &mut storage_ix, &mut header);
        if block_size == 0 {
            write_bits(2, 0, &mut storage_ix, &mut header);
        } else {
            let nbits: u32 = if block_size == 1 {
                0
            } else {
                log2_floor_nonzero((block_size - 1) as u64) + 1
            };
            let nbytes = (nbits + 7) / 8;
            write_bits(2, u64::from(nbytes), &mut storage_ix, &mut header);
            write_bits(8 * nbytes, (block_size - 1) as u64, &mut storage_ix, &mut header);
        }
        header.truncate((storage_ix + 7) >> 3);
        header
    }

    /// Writes a raw metadata meta-block (skipped by decoders).
    pub fn write_metadata(&mut self, metadata: &[u8]) -> Result<()> {
        self.ensure_initialized();
        if metadata.len() > (1 << 24) {
            return Err(Error::buffer_too_small(1 << 24, metadata.len()));
        }
        let mut consumed = 0usize;
        if self.stream_state == StreamState::Processing {
            self.remaining_metadata_bytes = metadata.len() as u32;
            self.stream_state = StreamState::MetadataHead;
        }
        if self.stream_state != StreamState::MetadataHead
            && self.stream_state != StreamState::MetadataBody
        {
            return Err(Error::InvalidState {
                expected: "metadata workflow",
                actual: "other stream state",
            });
        }
        loop {
            if self.stream_state == StreamState::FlushRequested && self.last_bytes_bits != 0 {
                self.inject_byte_padding_block();
                continue;
            }
            if self.input_pos != self.last_flush_pos {
                self.encode_data(false, true)?;
                continue;
            }
            if self.stream_state == StreamState::MetadataHead {
                let header = self.write_metadata_header(metadata.len());
                self.write_output(&header);
                self.stream_state = StreamState::MetadataBody;
                continue;
            }
            if self.remaining_metadata_bytes == 0 {
                self.remaining_metadata_bytes = u32::MAX;
                self.stream_state = StreamState::Processing;
                return Ok(());
            }
            let c = (self.remaining_metadata_bytes as usize).min(16);
            self.output.extend_from_slice(&metadata[consumed..consumed + c]);
            consumed += c;
            self.remaining_metadata_bytes -= c as u32;
        }
    }

    /// The streaming loop: buffers input and emits meta-blocks.
    pub fn compress_stream(&mut self, op: Operation, input: &[u8]) -> Result<usize> {
        self.ensure_initialized();
        if op == Operation::EmitMetadata {
            return self.write_metadata(input).map(|_| input.len());
        }
        if self.stream_state == StreamState::MetadataHead
            || self.stream_state == StreamState::MetadataBody
        {
            return Err(Error::InvalidState {
                expected: "metadata completion",
                actual: "data operation",
            });
        }
        if self.stream_state != StreamState::Processing && !input.is_empty() {
            return Err(Error::InvalidState {
                expected: "processing stream",
                actual: "finished or flushing stream",
            });
        }
        let mut available_in = input.len();
        let mut next_in = 0usize;
        loop {
            let remaining_block_size = self.remaining_input_block_size();
            if remaining_block_size != 0 && available_in != 0 {
                let copy_input_size = remaining_block_size.min(available_in);
                self.copy_input_to_ring_buffer(&input[next_in..next_in + copy_input_size]);
                next_in += copy_input_size;
                available_in -= copy_input_size;
                continue;
            }
            if self.stream_state == StreamState::FlushRequested && self.last_bytes_bits != 0 {
                self.inject_byte_padding_block();
                continue;
            }
            if self.stream_state == StreamState::Processing
                && (remaining_block_size == 0 || op != Operation::Process)
            {
                let is_last = available_in == 0 && op == Operation::Finish;
                let force_flush = available_in == 0 && op == Operation::Flush;
                self.encode_data(is_last, force_flush)?;
                if force_flush {
                    self.stream_state = StreamState::FlushRequested;
                }
                if is_last {
                    self.stream_state = StreamState::Finished;
                }
                continue;
            }
            break;
        }
        self.check_flush_complete();
        Ok(next_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decompress_to_vec;

    fn encode_all(quality: i32, lgwin: u32, data: &[u8]) -> Vec<u8> {
        let params = EncoderParams {
            quality,
            lgwin,
            ..Default::default()
        };
        let mut enc = Encoder::new(params);
        let mut fed = 0usize;
        while fed < data.len() {
            fed += enc.compress_stream(Operation::Process, &data[fed..]).unwrap();
        }
        enc.compress_stream(Operation::Finish, b"").unwrap();
        assert!(enc.is_finished());
        enc.take_output()
    }

    #[test]
    fn test_empty_input_single_empty_metablock() {
        let out = encode_all(11, 22, b"");
        // Stream header (7 bits for lgwin 22) + ISLAST + ISEMPTY fit two
        // bytes.
        assert!(out.len() <= 2, "empty stream must be tiny, got {}", out.len());
        assert_eq!(decompress_to_vec(&out).unwrap(), b"");
    }

    #[test]
    fn test_window_bits_header() {
        assert_eq!(encode_window_bits(16, false), (0u16, 1u8));
        assert_eq!(encode_window_bits(17, false), (1u16, 7u8));
        assert_eq!(encode_window_bits(22, false), (0x0Bu16, 4u8));
        assert_eq!(encode_window_bits(10, false), (0x21u16, 7u8));
        let (bits, n) = encode_window_bits(30, true);
        assert_eq!(n, 14);
        assert_eq!(bits & 0xFF, 0x11);
        assert_eq!(bits >> 8, 30);
    }

    #[test]
    fn test_zeros_roundtrip_quality_6() {
        let data = vec![0u8; 1 << 20];
        let out = encode_all(6, 22, &data);
        assert!(out.len() < 1024, "1MiB of zeros must compress below 1KiB, got {}", out.len());
        assert_eq!(decompress_to_vec(&out).unwrap(), data);
    }

    #[test]
    fn test_pattern_roundtrip_quality_5() {
        let mut data = Vec::new();
        while data.len() < 2048 {
            data.extend_from_slice(b"aaabbbcccaaabbbccc");
        }
        let out = encode_all(5, 18, &data);
        assert!(out.len() < data.len());
        assert_eq!(decompress_to_vec(&out).unwrap(), data);
    }

    #[test]
    fn test_flush_produces_decodable_prefix() {
        let params = EncoderParams {
            quality: 5,
            lgwin: 18,
            ..Default::default()
        };
        let mut enc = Encoder::new(params);
        let first = b"first chunk of data, first chunk of data";
        enc.compress_stream(Operation::Process, first).unwrap();
        enc.compress_stream(Operation::Flush, b"").unwrap();
        let prefix = enc.take_output();

        // A flushed prefix is byte-aligned and decodes to everything
        // written so far.
        let mut decoder = crate::decoder::Decoder::new();
        let mut out = vec![0u8; 4096];
        let mut in_off = 0usize;
        let mut out_off = 0usize;
        let result = decoder.decompress_stream(&prefix, &mut in_off, &mut out, &mut out_off);
        assert_eq!(result, crate::decoder::DecoderResult::NeedsMoreInput);
        assert_eq!(&out[..out_off], first.as_slice());

        // The stream continues after the flush.
        enc.compress_stream(Operation::Process, b" and a second chunk").unwrap();
        enc.compress_stream(Operation::Finish, b"").unwrap();
        let rest = enc.take_output();
        let mut full = prefix.clone();
        full.extend_from_slice(&rest);
        assert_eq!(
            decompress_to_vec(&full).unwrap(),
            b"first chunk of data, first chunk of data and a second chunk"
        );
    }

    #[test]
    fn test_metadata_block_roundtrip() {
        let params = EncoderParams {
            quality: 5,
            lgwin: 18,
            ..Default::default()
        };
        let mut enc = Encoder::new(params);
        enc.compress_stream(Operation::Process, b"payload before metadata").unwrap();
        enc.compress_stream(Operation::EmitMetadata, b"ignore me").unwrap();
        enc.compress_stream(Operation::Process, b" and payload after").unwrap();
        enc.compress_stream(Operation::Finish, b"").unwrap();
        let out = enc.take_output();
        assert_eq!(
            decompress_to_vec(&out).unwrap(),
            b"payload before metadata and payload after"
        );
    }
}
