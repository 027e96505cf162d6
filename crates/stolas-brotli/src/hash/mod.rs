//! Match-finding hashers.
//!
//! Every hasher maintains some index over positions already committed to
//! the ring buffer and answers longest-match queries against it. The
//! variants trade indexing cost against match quality; which one runs is
//! decided once per stream from the quality/window parameters:
//!
//! - [`quickly`]: one or a few candidates per probe, qualities 0-1
//! - [`forgetful`]: banked chains whose oldest nodes silently die, 2-4
//! - [`chain`]: bucketed chains scanned newest-first, 5-9
//! - [`binary_tree`]: enumerates all matches, feeding the optimal parse
//! - [`rolling`]: long-range rolling hash, composed on top for big windows

pub mod binary_tree;
pub mod chain;
pub mod composite;
pub mod forgetful;
pub mod quickly;
pub mod rolling;

use crate::constants::{MAX_DICTIONARY_WORD_LENGTH, MIN_DICTIONARY_WORD_LENGTH};
use crate::dictionary::EncoderDictionary;
use crate::fast_log::log2_floor_nonzero;
use crate::params::{EncoderParams, HasherParams};

pub const K_HASH_MUL_32: u32 = 0x1E35_A7BD;
pub const K_HASH_MUL_64: u64 = 0x1E35_A7BD_1E35_A7BD;

pub const LITERAL_BYTE_SCORE: usize = 135;
pub const DISTANCE_BIT_PENALTY: usize = 30;
/// Score must stay positive after the maximal distance penalty.
pub const SCORE_BASE: usize = DISTANCE_BIT_PENALTY * 8 * 8;

/// Minimum score for a backward reference to be worth a command.
pub const K_MIN_SCORE: usize = SCORE_BASE + 100;

/// Result slot of a longest-match query; `score` is only improved.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchResult {
    pub len: usize,
    pub distance: usize,
    pub score: usize,
    pub len_code_delta: i32,
}

/// Length plus a distance penalty: short-and-near beats long-and-far only
/// when the bit savings argue for it.
#[inline]
pub fn backward_reference_score(copy_length: usize, backward_reference_offset: usize) -> usize {
    SCORE_BASE + LITERAL_BYTE_SCORE * copy_length
        - DISTANCE_BIT_PENALTY * log2_floor_nonzero(backward_reference_offset as u64) as usize
}

#[inline]
pub fn backward_reference_score_using_last_distance(copy_length: usize) -> usize {
    LITERAL_BYTE_SCORE * copy_length + SCORE_BASE + 15
}

#[inline]
pub fn backward_reference_penalty_using_last_distance(distance_short_code: usize) -> usize {
    39 + ((0x1CA10 >> (distance_short_code & 0xE)) & 0xE)
}

/// Length of the common prefix of `s1` and `s2`, up to `limit`.
#[inline]
pub fn find_match_length_with_limit(s1: &[u8], s2: &[u8], limit: usize) -> usize {
    let mut matched = 0usize;
    while matched < limit && s1[matched] == s2[matched] {
        matched += 1;
    }
    matched
}

/// Extends the 4-entry distance cache with the +-1..3 neighborhood probes
/// used by the deeper-searching hashers.
pub fn prepare_distance_cache(distance_cache: &mut [i32], num_distances: i32) {
    if num_distances > 4 {
        let last_distance = distance_cache[0];
        distance_cache[4] = last_distance - 1;
        distance_cache[5] = last_distance + 1;
        distance_cache[6] = last_distance - 2;
        distance_cache[7] = last_distance + 2;
        distance_cache[8] = last_distance - 3;
        distance_cache[9] = last_distance + 3;
        if num_distances > 10 {
            let next_last_distance = distance_cache[1];
            distance_cache[10] = next_last_distance - 1;
            distance_cache[11] = next_last_distance + 1;
            distance_cache[12] = next_last_distance - 2;
            distance_cache[13] = next_last_distance + 2;
            distance_cache[14] = next_last_distance - 3;
            distance_cache[15] = next_last_distance + 3;
        }
    }
}

/// State shared by all hasher variants.
#[derive(Debug, Clone, Default)]
pub struct HasherCommon {
    pub params: HasherParams,
    pub is_prepared: bool,
    pub dict_num_lookups: usize,
    pub dict_num_matches: usize,
}

/// The capability set every hasher implements.
pub trait Hasher {
    fn common(&self) -> &HasherCommon;
    fn common_mut(&mut self) -> &mut HasherCommon;

    /// Bytes the hash key is computed from.
    fn hash_type_length(&self) -> usize;

    /// How far behind the current position `store` may still be useful.
    fn store_lookahead(&self) -> usize;

    /// One-time (per stream) table preparation.
    fn prepare(&mut self, one_shot: bool, input_size: usize, data: &[u8]);

    /// Index position `ix`.
    fn store(&mut self, data: &[u8], mask: usize, ix: usize);

    fn store_range(&mut self, data: &[u8], mask: usize, ix_start: usize, ix_end: usize) {
        for i in ix_start..ix_end {
            self.store(data, mask, i);
        }
    }

    /// Index the tail positions of the previous block, which could not be
    /// hashed before both blocks were present.
    fn stitch_to_previous_block(
        &mut self,
        num_bytes: usize,
        position: usize,
        ringbuffer: &[u8],
        ringbuffer_mask: usize,
    );

    fn prepare_distance_cache(&self, distance_cache: &mut [i32]);

    /// Finds the best match at `cur_ix`, writing into `out` only on a
    /// strictly better score.
    #[allow(clippy::too_many_arguments)]
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
    );
}

/// Probes the static dictionary for a match at `data`; used as a fallback
/// when the window yielded nothing. The lookup rate is throttled once the
/// hit rate drops below 1/128.
pub fn search_in_static_dictionary(
    dictionary: &EncoderDictionary,
    common: &mut HasherCommon,
    data: &[u8],
    max_length: usize,
    max_backward: usize,
    max_distance: usize,
    out: &mut SearchResult,
    shallow: bool,
) {
    if common.dict_num_matches < common.dict_num_lookups >> 7 {
        return;
    }
    if data.len() < 4 || max_length < MIN_DICTIONARY_WORD_LENGTH {
        return;
    }
    let mut key = (dictionary.hash(data) << 1) as usize;
    let probes = if shallow { 1 } else { 2 };
    for _ in 0..probes {
        common.dict_num_lookups += 1;
        let item = dictionary.hash_table[key] as usize;
        if item != 0 {
            let len = item & 0x1F;
            let word_idx = item >> 5;
            if len <= max_length && len <= MAX_DICTIONARY_WORD_LENGTH {
                let offset =
                    dictionary.words.offsets_by_length[len] as usize + len * word_idx;
                let word = &dictionary.words.data[offset..offset + len];
                let matchlen = find_match_length_with_limit(data, word, len);
                if matchlen + dictionary.cutoff_transforms_count as usize > len && matchlen > 0 {
                    let cut = len - matchlen;
                    let transform_id = (cut << 2)
                        + ((dictionary.cutoff_transforms >> (cut * 6)) & 0x3F) as usize;
                    let backward = max_backward
                        + 1
                        + word_idx
                        + (transform_id << dictionary.words.size_bits_by_length[len]);
                    if backward <= max_distance {
                        let score = backward_reference_score(matchlen, backward);
                        if score >= out.score {
                            common.dict_num_matches += 1;
                            out.len = matchlen;
                            out.len_code_delta = len as i32 - matchlen as i32;
                            out.distance = backward;
                            out.score = score;
                        }
                    }
                }
            }
        }
        key += 1;
    }
}

/// Builds the hasher selected by `params.hasher`.
pub fn new_hasher(params: &EncoderParams) -> Box<dyn Hasher> {
    let h = params.hasher;
    match h.hasher_type {
        2 => Box::new(quickly::QuicklyHasher::new(16, 1, 5, true)),
        4 => Box::new(quickly::QuicklyHasher::new(16, 4, 5, true)),
        40 | 41 | 42 => {
            let (num_banks, bank_bits) = if h.hasher_type == 42 { (512, 9) } else { (1, 16) };
            Box::new(forgetful::ForgetfulChainHasher::new(
                params,
                15,
                num_banks,
                bank_bits,
                h.num_last_distances_to_check,
            ))
        }
        5 => Box::new(chain::ChainHasher::new(params)),
        55 => Box::new(composite::CompositeHasher::new(
            Box::new(quickly::QuicklyHasher::new(20, 4, 7, false)),
            Box::new(rolling::RollingHasher::new(4)),
        )),
        65 => Box::new(composite::CompositeHasher::new(
            Box::new(chain::ChainHasher::new(params)),
            Box::new(rolling::RollingHasher::new(1)),
        )),
        _ => Box::new(chain::ChainHasher::new(params)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_match_length() {
        assert_eq!(find_match_length_with_limit(b"abcdef", b"abcxef", 6), 3);
        assert_eq!(find_match_length_with_limit(b"abc", b"abc", 3), 3);
        assert_eq!(find_match_length_with_limit(b"xbc", b"abc", 3), 0);
    }

    #[test]
    fn test_score_prefers_near_matches() {
        let near = backward_reference_score(8, 16);
        let far = backward_reference_score(8, 1 << 20);
        assert!(near > far);
        // One extra matched byte outweighs a doubling of the distance.
        assert!(backward_reference_score(9, 32) > backward_reference_score(8, 16));
    }

    #[test]
    fn test_last_distance_score_bonus() {
        assert!(
            backward_reference_score_using_last_distance(4) > backward_reference_score(4, 1),
            "a repeat distance is cheaper than any explicit one"
        );
    }

    #[test]
    fn test_prepare_distance_cache_neighborhood() {
        let mut cache = [100i32, 50, 7, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        prepare_distance_cache(&mut cache, 16);
        assert_eq!(&cache[4..10], &[99, 101, 98, 102, 97, 103]);
        assert_eq!(&cache[10..16], &[49, 51, 48, 52, 47, 53]);
    }
}
