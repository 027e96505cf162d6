//! Bucketed-chain hasher (mid-to-high qualities).
//!
//! A hash map of fixed size (`1 << bucket_bits`) to a ring buffer of fixed
//! size (`1 << block_bits`) holding the last block-size positions of each
//! key, scanned newest-first.

use super::{
    backward_reference_penalty_using_last_distance, backward_reference_score,
    backward_reference_score_using_last_distance, find_match_length_with_limit,
    prepare_distance_cache, search_in_static_dictionary, Hasher, HasherCommon, SearchResult,
    K_HASH_MUL_32,
};
use crate::dictionary::EncoderDictionary;
use crate::params::EncoderParams;

/// The higher bits carry more mixture from the multiplication, so the
/// bucket is taken from there.
#[inline]
fn hash_bytes(data: &[u8], shift: i32) -> u32 {
    let h = u32::from_le_bytes([data[0], data[1], data[2], data[3]]).wrapping_mul(K_HASH_MUL_32);
    h >> shift
}

pub struct ChainHasher {
    common: HasherCommon,
    bucket_size: usize,
    block_size: usize,
    hash_shift: i32,
    block_mask: u32,
    /// Number of entries ever stored per bucket (mod 2^16).
    num: Vec<u16>,
    buckets: Vec<u32>,
}

impl ChainHasher {
    pub fn new(params: &EncoderParams) -> Self {
        let bucket_bits = params.hasher.bucket_bits;
        let block_bits = params.hasher.block_bits;
        let bucket_size = 1usize << bucket_bits;
        let block_size = 1usize << block_bits;
        ChainHasher {
            common: HasherCommon {
                params: params.hasher,
                ..Default::default()
            },
            bucket_size,
            block_size,
            hash_shift: 32 - bucket_bits,
            block_mask: (block_size - 1) as u32,
            num: vec![0; bucket_size],
            buckets: vec![0; block_size * bucket_size],
        }
    }
}

impl Hasher for ChainHasher {
    fn common(&self) -> &HasherCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut HasherCommon {
        &mut self.common
    }

    fn hash_type_length(&self) -> usize {
        4
    }

    fn store_lookahead(&self) -> usize {
        4
    }

    fn prepare(&mut self, one_shot: bool, input_size: usize, data: &[u8]) {
        // Partial preparation is 100 times slower (per socket).
        let partial_prepare_threshold = self.bucket_size >> 6;
        if one_shot && input_size <= partial_prepare_threshold {
            for i in 0..input_size {
                let key = hash_bytes(&data[i..], self.hash_shift);
                self.num[key as usize] = 0;
            }
        } else {
            self.num.fill(0);
        }
    }

    fn store(&mut self, data: &[u8], mask: usize, ix: usize) {
        let key = hash_bytes(&data[ix & mask..], self.hash_shift);
        let minor_ix = (self.num[key as usize] as u32 & self.block_mask) as usize;
        let offset = minor_ix + ((key as usize) << self.common.params.block_bits);
        self.buckets[offset] = ix as u32;
        self.num[key as usize] = self.num[key as usize].wrapping_add(1);
    }

    fn stitch_to_previous_block(
        &mut self,
        num_bytes: usize,
        position: usize,
        ringbuffer: &[u8],
        ringbuffer_mask: usize,
    ) {
        if num_bytes >= self.hash_type_length() - 1 && position >= 3 {
            // The three last bytes of the previous write needed knowledge of
            // both blocks.
            self.store(ringbuffer, ringbuffer_mask, position - 3);
            self.store(ringbuffer, ringbuffer_mask, position - 2);
            self.store(ringbuffer, ringbuffer_mask, position - 1);
        }
    }

    fn prepare_distance_cache(&self, distance_cache: &mut [i32]) {
        prepare_distance_cache(distance_cache, self.common.params.num_last_distances_to_check);
    }

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
        let cur_ix_masked = cur_ix & ring_buffer_mask;
        let min_score = out.score;
        let mut best_score = out.score;
        let mut best_len = out.len;
        out.len = 0;
        out.len_code_delta = 0;

        // Try the recent distances first.
        for i in 0..self.common.params.num_last_distances_to_check as usize {
            let backward = distance_cache[i] as usize;
            let prev_ix = cur_ix.wrapping_sub(backward);
            if prev_ix >= cur_ix || backward > max_backward {
                continue;
            }
            let prev_ix = prev_ix & ring_buffer_mask;
            if cur_ix_masked + best_len > ring_buffer_mask
                || prev_ix + best_len > ring_buffer_mask
                || data[cur_ix_masked + best_len] != data[prev_ix + best_len]
            {
                continue;
            }
            let limit = find_match_length_with_limit(
                &data[prev_ix..],
                &data[cur_ix_masked..],
                max_length,
            );
            if limit >= 3 || (limit == 2 && i < 2) {
                let mut score = backward_reference_score_using_last_distance(limit);
                if best_score < score {
                    if i != 0 {
                        score -= backward_reference_penalty_using_last_distance(i);
                    }
                    if best_score < score {
                        best_score = score;
                        best_len = limit;
                        out.len = best_len;
                        out.distance = backward;
                        out.score = best_score;
                    }
                }
            }
        }

        // Walk the chain, newest entries first.
        {
            let key = hash_bytes(&data[cur_ix_masked..], self.hash_shift);
            let bucket_start = (key as usize) << self.common.params.block_bits;
            let head = self.num[key as usize] as usize;
            let down = head.saturating_sub(self.block_size);
            let mut i = head;
            while i > down {
                i -= 1;
                let prev_ix =
                    self.buckets[bucket_start + (i as u32 & self.block_mask) as usize] as usize;
                let backward = cur_ix.wrapping_sub(prev_ix);
                if backward > max_backward {
                    break;
                }
                let prev_ix = prev_ix & ring_buffer_mask;
                if cur_ix_masked + best_len > ring_buffer_mask
                    || prev_ix + best_len > ring_buffer_mask
                    || data[cur_ix_masked + best_len] != data[prev_ix + best_len]
                {
                    continue;
                }
                let limit = find_match_length_with_limit(
                    &data[prev_ix..],
                    &data[cur_ix_masked..],
                    max_length,
                );
                if limit >= 4 {
                    let score = backward_reference_score(limit, backward);
                    if best_score < score {
                        best_score = score;
                        best_len = limit;
                        out.len = best_len;
                        out.distance = backward;
                        out.score = best_score;
                    }
                }
            }
            self.buckets[bucket_start + (head as u32 & self.block_mask) as usize] = cur_ix as u32;
            self.num[key as usize] = self.num[key as usize].wrapping_add(1);
        }

        if min_score == out.score {
            search_in_static_dictionary(
                dictionary,
                &mut self.common,
                &data[cur_ix_masked..],
                max_length,
                max_backward + gap,
                max_distance,
                out,
                false,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::get_encoder_dictionary;
    use crate::hash::K_MIN_SCORE;
    use crate::params::EncoderParams;

    fn chain_params() -> EncoderParams {
        let mut p = EncoderParams {
            quality: 5,
            ..Default::default()
        };
        p.sanitize();
        p.choose_hasher();
        p
    }

    #[test]
    fn test_finds_recent_copy() {
        let params = chain_params();
        let mut h = ChainHasher::new(&params);
        let data = b"the quick brown fox and the quick brown dog lorem ipsum dolor";
        let mask = usize::MAX >> 1;
        h.prepare(true, data.len(), data);
        for i in 0..24 {
            h.store(data, mask, i);
        }
        let dist_cache = [4i32, 11, 15, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut sr = SearchResult {
            score: K_MIN_SCORE,
            ..Default::default()
        };
        // Position 24 begins the second "the quick brown".
        h.find_longest_match(
            get_encoder_dictionary(),
            data,
            mask,
            &dist_cache,
            24,
            data.len() - 24,
            24,
            0,
            1 << 18,
            &mut sr,
        );
        assert!(sr.score > K_MIN_SCORE, "match must be found");
        assert_eq!(sr.distance, 24);
        assert!(sr.len >= 16, "expected the full phrase, got {}", sr.len);
    }

    #[test]
    fn test_no_match_in_random_prefix() {
        let params = chain_params();
        let mut h = ChainHasher::new(&params);
        let data: Vec<u8> = (0..64u8).collect();
        let mask = usize::MAX >> 1;
        h.prepare(true, data.len(), &data);
        for i in 0..20 {
            h.store(&data, mask, i);
        }
        let dist_cache = [4i32, 11, 15, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut sr = SearchResult {
            score: K_MIN_SCORE,
            ..Default::default()
        };
        h.find_longest_match(
            get_encoder_dictionary(),
            &data,
            mask,
            &dist_cache,
            24,
            24,
            24,
            0,
            1 << 18,
            &mut sr,
        );
        assert_eq!(sr.score, K_MIN_SCORE, "no duplicate content to match");
    }
}
