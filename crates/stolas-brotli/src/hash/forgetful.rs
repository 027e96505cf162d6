//! Forgetful-chain hasher (qualities 2-4).
//!
//! Chains are bucketed into groups sharing a storage "bank"; when more
//! than bank-size nodes are added the oldest silently die, so several
//! chains may share a tail and no per-key eviction is ever needed. A
//! 65536-entry single-byte "tiny hash" filters most false positives on
//! distance-0 probes.

use super::{
    backward_reference_penalty_using_last_distance, backward_reference_score,
    backward_reference_score_using_last_distance, find_match_length_with_limit,
    prepare_distance_cache, search_in_static_dictionary, Hasher, HasherCommon, SearchResult,
    K_HASH_MUL_32,
};
use crate::dictionary::EncoderDictionary;
use crate::params::EncoderParams;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    delta: u16,
    next: u16,
}

pub struct ForgetfulChainHasher {
    common: HasherCommon,
    bucket_bits: u32,
    num_banks: usize,
    bank_bits: u32,
    num_last_distances_to_check: i32,
    addr: Vec<u32>,
    head: Vec<u16>,
    tiny_hash: Box<[u8; 65536]>,
    banks: Vec<Vec<Slot>>,
    free_slot_idx: Vec<u16>,
    max_hops: usize,
}

impl ForgetfulChainHasher {
    pub fn new(
        params: &EncoderParams,
        bucket_bits: u32,
        num_banks: usize,
        bank_bits: u32,
        num_last_distances_to_check: i32,
    ) -> Self {
        let q: usize = if params.quality > 6 { 7 } else { 8 };
        let max_hops = q << params.quality.clamp(4, 9).saturating_sub(4);
        let bank_size = 1usize << bank_bits;
        let bucket_size = 1usize << bucket_bits;
        ForgetfulChainHasher {
            common: HasherCommon {
                params: params.hasher,
                ..Default::default()
            },
            bucket_bits,
            num_banks,
            bank_bits,
            num_last_distances_to_check,
            addr: vec![0; bucket_size],
            head: vec![0; bucket_size],
            tiny_hash: Box::new([0u8; 65536]),
            banks: vec![vec![Slot::default(); bank_size]; num_banks],
            free_slot_idx: vec![0; num_banks],
            max_hops,
        }
    }

    #[inline]
    fn hash_bytes(&self, data: &[u8]) -> usize {
        let h = u32::from_le_bytes([data[0], data[1], data[2], data[3]]).wrapping_mul(K_HASH_MUL_32);
        (h >> (32 - self.bucket_bits)) as usize
    }
}

impl Hasher for ForgetfulChainHasher {
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
        let partial_prepare_threshold = (1usize << self.bucket_bits) >> 6;
        if one_shot && input_size <= partial_prepare_threshold {
            for i in 0..input_size {
                let bucket = self.hash_bytes(&data[i..]);
                // See the full-prepare comment.
                self.addr[bucket] = 0xCCCC_CCCC;
                self.head[bucket] = 0xCCCC;
            }
        } else {
            // Positions processed by the hasher never reach 3GB + 64M due
            // to position wrapping, so the 0xCCCCCCCC sentinel makes every
            // new chain terminate after its first node.
            self.addr.fill(0xCCCC_CCCC);
            self.head.fill(0);
        }
        self.tiny_hash.fill(0);
        self.free_slot_idx.fill(0);
    }

    fn store(&mut self, data: &[u8], mask: usize, ix: usize) {
        let key = self.hash_bytes(&data[ix & mask..]);
        let bank = key & (self.num_banks - 1);
        let idx = (self.free_slot_idx[bank] as usize) & ((1 << self.bank_bits) - 1);
        self.free_slot_idx[bank] = self.free_slot_idx[bank].wrapping_add(1);
        let delta = ix.wrapping_sub(self.addr[key] as usize).min(0xFFFF);
        self.tiny_hash[ix as u16 as usize] = key as u8;
        self.banks[bank][idx].delta = delta as u16;
        self.banks[bank][idx].next = self.head[key];
        self.addr[key] = ix as u32;
        self.head[key] = idx as u16;
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

    fn prepare_distance_cache(&self, distance_cache: &mut [i32]) {
        prepare_distance_cache(distance_cache, self.num_last_distances_to_check);
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
        let key = self.hash_bytes(&data[cur_ix_masked..]);
        let tiny_hash = key as u8;
        out.len = 0;
        out.len_code_delta = 0;

        // Try the recent distances first; distance 0 also considers
        // 2-byte matches.
        for i in 0..self.num_last_distances_to_check as usize {
            let backward = distance_cache[i] as usize;
            let prev_ix = cur_ix.wrapping_sub(backward);
            if i > 0 && self.tiny_hash[prev_ix as u16 as usize] != tiny_hash {
                continue;
            }
            if prev_ix >= cur_ix || backward > max_backward {
                continue;
            }
            let prev_ix = prev_ix & ring_buffer_mask;
            let limit = find_match_length_with_limit(
                &data[prev_ix..],
                &data[cur_ix_masked..],
                max_length,
            );
            if limit >= 2 {
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

        {
            let bank = key & (self.num_banks - 1);
            let mut backward = 0usize;
            let mut hops = self.max_hops;
            let mut delta = cur_ix.wrapping_sub(self.addr[key] as usize);
            let mut slot = self.head[key] as usize;
            loop {
                if hops == 0 {
                    break;
                }
                hops -= 1;
                let last = slot;
                backward = backward.wrapping_add(delta);
                if backward > max_backward {
                    break;
                }
                let prev_ix = cur_ix.wrapping_sub(backward) & ring_buffer_mask;
                slot = self.banks[bank][last].next as usize;
                delta = self.banks[bank][last].delta as usize;
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
            self.store(data, ring_buffer_mask, cur_ix);
        }

        if out.score == min_score {
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

    #[test]
    fn test_finds_match_through_bank_chain() {
        let params = EncoderParams {
            quality: 3,
            ..Default::default()
        };
        let mut h = ForgetfulChainHasher::new(&params, 15, 1, 16, 10);
        let mut data = Vec::new();
        for _ in 0..4 {
            data.extend_from_slice(b"some repeated payload / ");
        }
        data.extend_from_slice(&[0u8; 8]);
        let mask = usize::MAX >> 1;
        h.prepare(true, data.len(), &data);
        for i in 0..24 {
            h.store(&data, mask, i);
        }
        let mut dist_cache = [0i32; 16];
        dist_cache[..4].copy_from_slice(&[4, 11, 15, 16]);
        prepare_distance_cache(&mut dist_cache, 10);
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
            48,
            24,
            0,
            1 << 18,
            &mut sr,
        );
        assert!(sr.score > K_MIN_SCORE);
        assert_eq!(sr.distance, 24);
        assert!(sr.len >= 24);
    }
}
