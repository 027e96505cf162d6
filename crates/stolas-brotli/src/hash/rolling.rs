//! Rolling-polynomial hasher for long-range matches over large windows.
//!
//! One position per bucket, bucket key computed over a 32-byte window,
//! advanced `jump` bytes at a time. Used only as the second member of a
//! composite hasher; it never probes the static dictionary.

use super::{backward_reference_score, find_match_length_with_limit, Hasher, HasherCommon, SearchResult};
use crate::dictionary::EncoderDictionary;

const K_ROLLING_HASH_MUL_32: u32 = 69069;
const K_INVALID_POS: u32 = 0xFFFF_FFFF;
const WINDOW: usize = 32;
const TABLE_SIZE: usize = 1 << 24;

pub struct RollingHasher {
    common: HasherCommon,
    jump: usize,
    state: u32,
    table: Vec<u32>,
    next_ix: usize,
    factor: u32,
    factor_remove: u32,
}

impl RollingHasher {
    pub fn new(jump: usize) -> Self {
        let factor = K_ROLLING_HASH_MUL_32;
        // factor**(window/jump) mod 2^32; the multiplications rely on
        // wrapping arithmetic.
        let mut factor_remove: u32 = 1;
        let mut i = 0;
        while i < WINDOW {
            factor_remove = factor_remove.wrapping_mul(factor);
            i += jump;
        }
        RollingHasher {
            common: HasherCommon::default(),
            jump,
            state: 0,
            table: vec![K_INVALID_POS; TABLE_SIZE],
            next_ix: 0,
            factor,
            factor_remove,
        }
    }

    /// A lookup table of 256 values could be used, but adding 1 works
    /// about as well.
    #[inline]
    fn hash_byte(b: u8) -> u32 {
        u32::from(b) + 1
    }

    #[inline]
    fn roll_initial(&self, state: u32, add: u8) -> u32 {
        self.factor
            .wrapping_mul(state)
            .wrapping_add(Self::hash_byte(add))
    }

    #[inline]
    fn roll(&self, state: u32, add: u8, rem: u8) -> u32 {
        self.factor
            .wrapping_mul(state)
            .wrapping_add(Self::hash_byte(add))
            .wrapping_sub(self.factor_remove.wrapping_mul(Self::hash_byte(rem)))
    }
}

impl Hasher for RollingHasher {
    fn common(&self) -> &HasherCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut HasherCommon {
        &mut self.common
    }

    /// A longer forward length would hurt the main hasher of the
    /// composite; the rolling hasher tests forward itself.
    fn hash_type_length(&self) -> usize {
        4
    }

    fn store_lookahead(&self) -> usize {
        4
    }

    fn prepare(&mut self, _one_shot: bool, input_size: usize, data: &[u8]) {
        // Too small to roll a full window.
        if input_size < WINDOW {
            return;
        }
        self.state = 0;
        let mut i = 0;
        while i < WINDOW {
            self.state = self.roll_initial(self.state, data[i]);
            i += self.jump;
        }
    }

    fn store(&mut self, _data: &[u8], _mask: usize, _ix: usize) {}

    fn store_range(&mut self, _data: &[u8], _mask: usize, _ix_start: usize, _ix_end: usize) {}

    fn stitch_to_previous_block(
        &mut self,
        num_bytes: usize,
        mut position: usize,
        ringbuffer: &[u8],
        ringbuffer_mask: usize,
    ) {
        // Re-initialize the hasher from scratch at the current position.
        let mut available = num_bytes;
        if position & (self.jump - 1) != 0 {
            let diff = self.jump - (position & (self.jump - 1));
            available = if diff > available { 0 } else { available - diff };
            position += diff;
        }
        let position_masked = position & ringbuffer_mask;
        // Wrapping around the ring buffer is not handled here.
        if available > ringbuffer_mask - position_masked {
            available = ringbuffer_mask - position_masked;
        }
        self.prepare(false, available, &ringbuffer[position & ringbuffer_mask..]);
        self.next_ix = position;
    }

    fn prepare_distance_cache(&self, _distance_cache: &mut [i32]) {}

    fn find_longest_match(
        &mut self,
        _dictionary: &EncoderDictionary,
        data: &[u8],
        ring_buffer_mask: usize,
        _distance_cache: &[i32],
        cur_ix: usize,
        max_length: usize,
        max_backward: usize,
        _gap: usize,
        _max_distance: usize,
        out: &mut SearchResult,
    ) {
        let cur_ix_masked = cur_ix & ring_buffer_mask;
        if cur_ix & (self.jump - 1) != 0 {
            return;
        }
        // Not enough lookahead.
        if max_length < WINDOW {
            return;
        }

        let mut pos = self.next_ix;
        while pos <= cur_ix {
            let code = self.state & ((TABLE_SIZE as u32 * 64) - 1);
            let rem = data[pos & ring_buffer_mask];
            let add = data[(pos + WINDOW) & ring_buffer_mask];

            self.state = self.roll(self.state, add, rem);

            if (code as usize) < TABLE_SIZE {
                let found_ix = self.table[code as usize];
                self.table[code as usize] = pos as u32;
                if pos == cur_ix && found_ix != K_INVALID_POS {
                    // The 32-bit cast keeps backward distances meaningful
                    // even past 4GB of input.
                    let backward = (cur_ix as u32).wrapping_sub(found_ix) as usize;
                    if backward <= max_backward {
                        let found_ix_masked = found_ix as usize & ring_buffer_mask;
                        let limit = find_match_length_with_limit(
                            &data[found_ix_masked..],
                            &data[cur_ix_masked..],
                            max_length,
                        );
                        if limit >= 4 && limit > out.len {
                            let score = backward_reference_score(limit, backward);
                            if score > out.score {
                                out.len = limit;
                                out.distance = backward;
                                out.score = score;
                                out.len_code_delta = 0;
                            }
                        }
                    }
                }
            }
            pos += self.jump;
        }

        self.next_ix = cur_ix + self.jump;
    }
}
