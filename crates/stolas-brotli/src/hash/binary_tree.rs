//! Binary-tree hasher: enumerates *all* matches at a position.
//!
//! Each bucket holds the root of a binary tree over the positions sharing
//! a 4-byte hash, ordered by the bytes following the match prefix. A
//! lookup descends at most 64 levels, re-rooting the tree at the current
//! position when a full-depth comparison window is available. Only the
//! optimal parse uses this hasher; greedy search wants a single best
//! match, the optimal parse wants every length worth considering.

use super::find_match_length_with_limit;
use crate::constants::{MAX_DICTIONARY_WORD_LENGTH, MIN_DICTIONARY_WORD_LENGTH, WINDOW_GAP};
use crate::dictionary::{find_all_static_dictionary_matches, EncoderDictionary, K_INVALID_MATCH};
use crate::hash::K_HASH_MUL_32;
use crate::params::{EncoderParams, HQ_ZOPFLIFICATION_QUALITY};

pub const MAX_TREE_SEARCH_DEPTH: usize = 64;
pub const MAX_TREE_COMP_LENGTH: usize = 128;
/// Worst-case matches a single query can produce.
pub const MAX_NUM_MATCHES: usize = 64 + MAX_TREE_SEARCH_DEPTH;

const BUCKET_BITS: u32 = 17;
const BUCKET_SIZE: usize = 1 << BUCKET_BITS;

/// One enumerated match; dictionary matches carry a separate length code.
#[derive(Debug, Clone, Copy)]
pub struct BackwardMatch {
    pub distance: u32,
    length_and_code: u32,
}

impl BackwardMatch {
    #[inline]
    pub fn new(distance: usize, length: usize) -> Self {
        BackwardMatch {
            distance: distance as u32,
            length_and_code: (length as u32) << 5,
        }
    }

    #[inline]
    pub fn new_dictionary(distance: usize, length: usize, length_code: usize) -> Self {
        BackwardMatch {
            distance: distance as u32,
            length_and_code: ((length as u32) << 5)
                | (if length == length_code { 0 } else { length_code as u32 }),
        }
    }

    #[inline]
    pub fn length(&self) -> usize {
        (self.length_and_code >> 5) as usize
    }

    #[inline]
    pub fn length_code(&self) -> usize {
        let code = (self.length_and_code & 31) as usize;
        if code != 0 {
            code
        } else {
            self.length()
        }
    }
}

pub struct BinaryTreeHasher {
    window_mask: usize,
    buckets: Vec<u32>,
    invalid_pos: u32,
    /// Left/right child links, two per window slot.
    forest: Vec<u32>,
}

impl BinaryTreeHasher {
    pub fn new(params: &EncoderParams) -> Self {
        let window_mask = (1usize << params.lgwin) - 1;
        let invalid_pos = 0u32.wrapping_sub(window_mask as u32);
        BinaryTreeHasher {
            window_mask,
            buckets: vec![invalid_pos; BUCKET_SIZE],
            invalid_pos,
            forest: Vec::new(),
        }
    }

    pub fn hash_type_length(&self) -> usize {
        4
    }

    pub fn store_lookahead(&self) -> usize {
        MAX_TREE_COMP_LENGTH
    }

    pub fn prepare(&mut self, one_shot: bool, input_size: usize) {
        let invalid_pos = self.invalid_pos;
        self.buckets.fill(invalid_pos);
        let num_nodes = if one_shot && input_size < self.window_mask + 1 {
            input_size
        } else {
            self.window_mask + 1
        };
        self.forest.clear();
        self.forest.resize(2 * num_nodes.max(1), 0);
    }

    #[inline]
    fn hash_bytes(data: &[u8]) -> usize {
        let h = u32::from_le_bytes([data[0], data[1], data[2], data[3]]).wrapping_mul(K_HASH_MUL_32);
        (h >> (32 - BUCKET_BITS)) as usize
    }

    #[inline]
    fn left_child_index(&self, pos: usize) -> usize {
        2 * (pos & self.window_mask)
    }

    #[inline]
    fn right_child_index(&self, pos: usize) -> usize {
        2 * (pos & self.window_mask) + 1
    }

    /// Descends the tree at `cur_ix`'s bucket, collecting every match
    /// longer than `best_len` into `matches` and (when a full comparison
    /// window is available) re-rooting the tree at `cur_ix`.
    #[allow(clippy::too_many_arguments)]
    fn store_and_find_matches(
        &mut self,
        data: &[u8],
        cur_ix: usize,
        ring_buffer_mask: usize,
        max_length: usize,
        max_backward: usize,
        best_len: &mut usize,
        mut matches: Option<&mut Vec<BackwardMatch>>,
    ) {
        let cur_ix_masked = cur_ix & ring_buffer_mask;
        let max_comp_len = max_length.min(MAX_TREE_COMP_LENGTH);
        let should_reroot_tree = max_length >= MAX_TREE_COMP_LENGTH;
        let key = Self::hash_bytes(&data[cur_ix_masked..]);
        let mut prev_ix = self.buckets[key] as usize;
        let mut node_left = self.left_child_index(cur_ix);
        let mut node_right = self.right_child_index(cur_ix);
        let mut best_len_left = 0usize;
        let mut best_len_right = 0usize;

        if should_reroot_tree {
            self.buckets[key] = cur_ix as u32;
        }
        let mut depth_remaining = MAX_TREE_SEARCH_DEPTH;
        loop {
            let backward = cur_ix.wrapping_sub(prev_ix);
            let prev_ix_masked = prev_ix & ring_buffer_mask;
            if backward == 0 || backward > max_backward || depth_remaining == 0 {
                if should_reroot_tree {
                    self.forest[node_left] = self.invalid_pos;
                    self.forest[node_right] = self.invalid_pos;
                }
                break;
            }
            let cur_len = best_len_left.min(best_len_right);
            let len = cur_len
                + find_match_length_with_limit(
                    &data[cur_ix_masked + cur_len..],
                    &data[prev_ix_masked + cur_len..],
                    max_length - cur_len,
                );
            if let Some(ms) = matches.as_deref_mut() {
                if len > *best_len {
                    *best_len = len;
                    ms.push(BackwardMatch::new(backward, len));
                }
            }
            if len >= max_comp_len {
                if should_reroot_tree {
                    self.forest[node_left] = self.forest[self.left_child_index(prev_ix)];
                    self.forest[node_right] = self.forest[self.right_child_index(prev_ix)];
                }
                break;
            }
            if data[cur_ix_masked + len] > data[prev_ix_masked + len] {
                best_len_left = len;
                if should_reroot_tree {
                    self.forest[node_left] = prev_ix as u32;
                }
                node_left = self.right_child_index(prev_ix);
                prev_ix = self.forest[node_left] as usize;
            } else {
                best_len_right = len;
                if should_reroot_tree {
                    self.forest[node_right] = prev_ix as u32;
                }
                node_right = self.left_child_index(prev_ix);
                prev_ix = self.forest[node_right] as usize;
            }
            depth_remaining -= 1;
        }
    }

    pub fn store(&mut self, data: &[u8], mask: usize, ix: usize) {
        let max_backward = self.window_mask - WINDOW_GAP + 1;
        let mut dummy = 0usize;
        self.store_and_find_matches(
            data,
            ix,
            mask,
            MAX_TREE_COMP_LENGTH,
            max_backward,
            &mut dummy,
            None,
        );
    }

    pub fn store_range(&mut self, data: &[u8], mask: usize, ix_start: usize, ix_end: usize) {
        for i in ix_start..ix_end {
            self.store(data, mask, i);
        }
    }

    pub fn stitch_to_previous_block(
        &mut self,
        num_bytes: usize,
        position: usize,
        ringbuffer: &[u8],
        ringbuffer_mask: usize,
    ) {
        if num_bytes >= self.hash_type_length() - 1 && position >= MAX_TREE_COMP_LENGTH {
            // Store the last `MAX_TREE_COMP_LENGTH - 1` positions of the
            // previous block with a reduced backward reach; they could not
            // be stored before the comparison window was complete.
            let i_start = position - MAX_TREE_COMP_LENGTH + 1;
            let i_end = position.min(i_start + num_bytes);
            for i in i_start..i_end {
                let max_backward = self.window_mask - (WINDOW_GAP - 1).max(position - i);
                let mut dummy = 0usize;
                self.store_and_find_matches(
                    ringbuffer,
                    i,
                    ringbuffer_mask,
                    MAX_TREE_COMP_LENGTH,
                    max_backward,
                    &mut dummy,
                    None,
                );
            }
        }
    }

    /// Enumerates matches at `cur_ix`, in ascending length order: short
    /// nearby matches first, then tree matches, then static-dictionary
    /// matches. Returns the number of matches appended.
    #[allow(clippy::too_many_arguments)]
    pub fn find_all_matches(
        &mut self,
        dictionary: &EncoderDictionary,
        data: &[u8],
        ring_buffer_mask: usize,
        cur_ix: usize,
        max_length: usize,
        max_backward: usize,
        gap: usize,
        params: &EncoderParams,
        matches: &mut Vec<BackwardMatch>,
    ) -> usize {
        let orig_len = matches.len();
        let cur_ix_masked = cur_ix & ring_buffer_mask;
        let mut best_len = 1usize;
        let short_match_max_backward = if params.quality != HQ_ZOPFLIFICATION_QUALITY {
            16
        } else {
            64
        };
        let stop = cur_ix.saturating_sub(short_match_max_backward);

        let mut i = cur_ix;
        while i > stop + 1 && best_len <= 2 {
            i -= 1;
            let mut prev_ix = i;
            let backward = cur_ix - prev_ix;
            if backward > max_backward {
                break;
            }
            prev_ix &= ring_buffer_mask;
            if data[cur_ix_masked] != data[prev_ix] || data[cur_ix_masked + 1] != data[prev_ix + 1]
            {
                continue;
            }
            let len =
                find_match_length_with_limit(&data[prev_ix..], &data[cur_ix_masked..], max_length);
            if len > best_len {
                best_len = len;
                matches.push(BackwardMatch::new(backward, len));
            }
        }

        if best_len < max_length {
            self.store_and_find_matches(
                data,
                cur_ix,
                ring_buffer_mask,
                max_length,
                max_backward,
                &mut best_len,
                Some(matches),
            );
        }

        let mut dict_matches = [K_INVALID_MATCH; MAX_DICTIONARY_WORD_LENGTH + 14];
        let min_length = MIN_DICTIONARY_WORD_LENGTH.max(best_len + 1);
        if find_all_static_dictionary_matches(
            dictionary,
            &data[cur_ix_masked..],
            min_length,
            max_length,
            &mut dict_matches,
        ) {
            let max_len = (dict_matches.len() - 1).min(max_length);
            for l in min_length..=max_len {
                let dict_id = dict_matches[l];
                if dict_id < K_INVALID_MATCH {
                    let distance = max_backward + gap + (dict_id >> 5) as usize + 1;
                    if distance <= params.dist.max_distance {
                        matches.push(BackwardMatch::new_dictionary(
                            distance,
                            l,
                            (dict_id & 31) as usize,
                        ));
                    }
                }
            }
        }
        matches.len() - orig_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::get_encoder_dictionary;
    use crate::params::EncoderParams;

    fn tree_params() -> EncoderParams {
        let mut p = EncoderParams {
            quality: 11,
            lgwin: 16,
            ..Default::default()
        };
        p.sanitize();
        p.choose_distance_params();
        p
    }

    #[test]
    fn test_enumerates_multiple_lengths() {
        let params = tree_params();
        let mut h = BinaryTreeHasher::new(&params);
        // "abcabcabcabc..." has matches of many lengths at every position.
        let mut data: Vec<u8> = Vec::new();
        for _ in 0..100 {
            data.extend_from_slice(b"abc");
        }
        data.extend_from_slice(&[0u8; 160]);
        h.prepare(true, data.len());
        let mask = usize::MAX >> 1;
        for i in 0..60 {
            h.store(&data, mask, i);
        }
        let mut matches = Vec::new();
        let n = h.find_all_matches(
            get_encoder_dictionary(),
            &data,
            mask,
            60,
            120,
            60,
            0,
            &params,
            &mut matches,
        );
        assert!(n >= 1);
        // Ascending lengths, and at least one long match at distance 3.
        for w in matches.windows(2) {
            assert!(w[0].length() <= w[1].length());
        }
        assert!(matches.iter().any(|m| m.distance == 3 && m.length() >= 100));
    }

    #[test]
    fn test_stitch_does_not_index_future() {
        let params = tree_params();
        let mut h = BinaryTreeHasher::new(&params);
        let data = vec![7u8; 1 << 12];
        h.prepare(false, data.len());
        h.stitch_to_previous_block(256, 400, &data, (1 << 12) - 1);
        // No assertion beyond "does not panic": the stitch touches only
        // positions before 400.
    }
}
