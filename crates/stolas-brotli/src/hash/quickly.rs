//! Single-probe open-addressing hasher (fastest qualities).

use super::{
    backward_reference_score, backward_reference_score_using_last_distance,
    find_match_length_with_limit, search_in_static_dictionary, Hasher, HasherCommon, SearchResult,
    K_HASH_MUL_64,
};
use crate::dictionary::EncoderDictionary;

pub struct QuicklyHasher {
    common: HasherCommon,
    bucket_bits: u32,
    bucket_sweep: usize,
    hash_len: u32,
    use_dictionary: bool,
    buckets: Vec<u32>,
}

impl QuicklyHasher {
    pub fn new(bucket_bits: u32, bucket_sweep: usize, hash_len: u32, use_dictionary: bool) -> Self {
        QuicklyHasher {
            common: HasherCommon::default(),
            bucket_bits,
            bucket_sweep,
            hash_len,
            use_dictionary,
            buckets: vec![0; (1usize << bucket_bits) + bucket_sweep],
        }
    }

    #[inline]
    fn hash_bytes(&self, data: &[u8]) -> u32 {
        let word = u64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]);
        let h = (word << (64 - 8 * self.hash_len)).wrapping_mul(K_HASH_MUL_64);
        (h >> (64 - self.bucket_bits)) as u32
    }
}

impl Hasher for QuicklyHasher {
    fn common(&self) -> &HasherCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut HasherCommon {
        &mut self.common
    }

    fn hash_type_length(&self) -> usize {
        8
    }

    fn store_lookahead(&self) -> usize {
        8
    }

    fn prepare(&mut self, one_shot: bool, input_size: usize, data: &[u8]) {
        let partial_prepare_threshold = (4usize << self.bucket_bits) >> 7;
        if one_shot && input_size <= partial_prepare_threshold {
            for i in 0..input_size {
                let key = self.hash_bytes(&data[i..]) as usize;
                for j in 0..self.bucket_sweep {
                    self.buckets[key + j] = 0;
                }
            }
        } else {
            // Leaving the table dirty would make compression stochastic
            // (still correct): stale entries may turn into accidental
            // matches.
            self.buckets.fill(0);
        }
    }

    fn store(&mut self, data: &[u8], mask: usize, ix: usize) {
        let key = self.hash_bytes(&data[ix & mask..]) as usize;
        // Wiggle the slot within the sweep range.
        let off = (ix >> 3) % self.bucket_sweep;
        self.buckets[key + off] = ix as u32;
    }

    fn stitch_to_previous_block(
        &mut self,
        num_bytes: usize,
        position: usize,
        ringbuffer: &[u8],
        ringbuffer_mask: usize,
    ) {
        if num_bytes >= self.hash_type_length() - 1 && position >= 3 {
            self.store(ringbuffer, ringbuffer_mask, position - 3);
            self.store(ringbuffer, ringbuffer_mask, position - 2);
            self.store(ringbuffer, ringbuffer_mask, position - 1);
        }
    }

    fn prepare_distance_cache(&self, _distance_cache: &mut [i32]) {}

    fn find_longest_match(
        &mut self,
        dictionary: &EncoderDictionary,
        data: &[u8],
        ring_buffer_mask: usize,
        distance_cache: &[i32],
        cur_ix: usize,
        max_length: usize,
        max_backward: usize,
        gap: usize,
        max_distance: usize,
        out: &mut SearchResult,
    ) {
        let best_len_in = out.len;
        let cur_ix_masked = cur_ix & ring_buffer_mask;
        let key = self.hash_bytes(&data[cur_ix_masked..]) as usize;
        let min_score = out.score;
        let mut best_score = out.score;
        let mut best_len = best_len_in;
        let mut compare_char = data[cur_ix_masked + best_len] as i32;
        out.len_code_delta = 0;

        // Last distance first.
        let cached_backward = distance_cache[0] as usize;
        let prev_ix = cur_ix.wrapping_sub(cached_backward);
        if prev_ix < cur_ix {
            let prev_ix = prev_ix & ring_buffer_mask;
            if compare_char == data[prev_ix + best_len] as i32 {
                let limit = find_match_length_with_limit(
                    &data[prev_ix..],
                    &data[cur_ix_masked..],
                    max_length,
                );
                if limit >= 4 {
                    let score = backward_reference_score_using_last_distance(limit);
                    if best_score < score {
                        best_score = score;
                        best_len = limit;
                        out.len = limit;
                        out.distance = cached_backward;
                        out.score = best_score;
                        compare_char = data[cur_ix_masked + best_len] as i32;
                        if self.bucket_sweep == 1 {
                            self.buckets[key] = cur_ix as u32;
                            return;
                        }
                    }
                }
            }
        }

        if self.bucket_sweep == 1 {
            // Only one candidate; no loop needed.
            let prev_ix = self.buckets[key] as usize;
            self.buckets[key] = cur_ix as u32;
            let backward = cur_ix.wrapping_sub(prev_ix);
            let prev_ix = prev_ix & ring_buffer_mask;
            if compare_char != data[prev_ix + best_len_in] as i32 {
                return;
            }
            if backward == 0 || backward > max_backward {
                return;
            }
            let len = find_match_length_with_limit(
                &data[prev_ix..],
                &data[cur_ix_masked..],
                max_length,
            );
            if len >= 4 {
                let score = backward_reference_score(len, backward);
                if best_score < score {
                    out.len = len;
                    out.distance = backward;
                    out.score = score;
                    return;
                }
            }
        } else {
            for i in 0..self.bucket_sweep {
                let prev_ix = self.buckets[key + i] as usize;
                let backward = cur_ix.wrapping_sub(prev_ix);
                let prev_ix = prev_ix & ring_buffer_mask;
                if compare_char != data[prev_ix + best_len] as i32 {
                    continue;
                }
                if backward == 0 || backward > max_backward {
                    continue;
                }
                let len = find_match_length_with_limit(
                    &data[prev_ix..],
                    &data[cur_ix_masked..],
                    max_length,
                );
                if len >= 4 {
                    let score = backward_reference_score(len, backward);
                    if best_score < score {
                        best_score = score;
                        best_len = len;
                        out.len = len;
                        out.distance = backward;
                        out.score = score;
                        compare_char = data[cur_ix_masked + best_len] as i32;
                    }
                }
            }
        }

        if self.use_dictionary && min_score == out.score {
            search_in_static_dictionary(
                dictionary,
                &mut self.common,
                &data[cur_ix_masked..],
                max_length,
                max_backward + gap,
                max_distance,
                out,
                true,
            );
        }

        self.buckets[key + ((cur_ix >> 3) % self.bucket_sweep)] = cur_ix as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::get_encoder_dictionary;
    use crate::hash::K_MIN_SCORE;

    #[test]
    fn test_single_sweep_finds_repeat() {
        let mut h = QuicklyHasher::new(16, 1, 5, true);
        let mut data = Vec::new();
        data.extend_from_slice(b"abcdefgh12345678");
        data.extend_from_slice(b"abcdefgh12345678");
        data.extend_from_slice(&[0u8; 16]);
        let mask = usize::MAX >> 1;
        h.prepare(true, data.len(), &data);
        for i in 0..16 {
            h.store(&data, mask, i);
        }
        let dist_cache = [4i32, 11, 15, 16];
        let mut sr = SearchResult {
            score: K_MIN_SCORE,
            ..Default::default()
        };
        h.find_longest_match(
            get_encoder_dictionary(),
            &data,
            mask,
            &dist_cache,
            16,
            16,
            16,
            0,
            1 << 18,
            &mut sr,
        );
        assert!(sr.score > K_MIN_SCORE);
        assert_eq!(sr.distance, 16);
        assert_eq!(sr.len, 16);
    }
}
