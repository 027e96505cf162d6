//! Greedy backward-reference search with one-step lazy matching.

use crate::command::Command;
use crate::constants::NUM_DISTANCE_SHORT_CODES;
use crate::dictionary::EncoderDictionary;
use crate::hash::{Hasher, SearchResult, K_MIN_SCORE};
use crate::params::{EncoderParams, MIN_QUALITY_FOR_EXTENSIVE_REFERENCE_SEARCH};

/// Maps a real distance to its intermediate code: a recent-distance ring
/// slot, a near-miss of one, or the distance itself offset past the short
/// codes.
pub fn compute_distance_code(distance: usize, max_distance: usize, dist_cache: &[i32]) -> usize {
    if distance <= max_distance {
        let distance_plus_3 = distance + 3;
        let offset0 = distance_plus_3.wrapping_sub(dist_cache[0] as usize);
        let offset1 = distance_plus_3.wrapping_sub(dist_cache[1] as usize);
        if distance == dist_cache[0] as usize {
            return 0;
        } else if distance == dist_cache[1] as usize {
            return 1;
        } else if offset0 < 7 {
            return (0x0975_0468 >> (4 * offset0)) & 0xF;
        } else if offset1 < 7 {
            return (0x0FDB_1ACE >> (4 * offset1)) & 0xF;
        } else if distance == dist_cache[2] as usize {
            return 2;
        } else if distance == dist_cache[3] as usize {
            return 3;
        }
    }
    distance + NUM_DISTANCE_SHORT_CODES - 1
}

/// The lazy-match bound: a delayed match must beat the immediate one by
/// this much to be worth an extra literal.
const COST_DIFF_LAZY: usize = 175;

/// Produces commands for `ringbuffer[position..position + num_bytes]`.
///
/// `last_insert_len` carries literals left over from the previous call;
/// on return it holds the trailing uncommitted literals.
#[allow(clippy::too_many_arguments)]
pub fn create_backward_references(
    num_bytes: usize,
    mut position: usize,
    ringbuffer: &[u8],
    ringbuffer_mask: usize,
    params: &EncoderParams,
    hasher: &mut dyn Hasher,
    dictionary: &EncoderDictionary,
    dist_cache: &mut [i32],
    last_insert_len: &mut usize,
    commands: &mut Vec<Command>,
    num_literals: &mut usize,
) {
    let max_backward_limit = params.max_backward_limit();
    let mut insert_length = *last_insert_len;
    let pos_end = position + num_bytes;
    let store_end = if num_bytes >= hasher.store_lookahead() {
        position + num_bytes - hasher.store_lookahead() + 1
    } else {
        position
    };
    let random_heuristics_window_size = params.literal_spree_length_for_sparse_search();
    let mut apply_random_heuristics = position + random_heuristics_window_size;
    let gap = 0usize;

    hasher.prepare_distance_cache(dist_cache);

    while position + hasher.hash_type_length() < pos_end {
        let mut max_length = pos_end - position;
        let mut max_distance = position.min(max_backward_limit);
        let mut sr = SearchResult {
            score: K_MIN_SCORE,
            ..Default::default()
        };
        hasher.find_longest_match(
            dictionary,
            ringbuffer,
            ringbuffer_mask,
            dist_cache,
            position,
            max_length,
            max_distance,
            gap,
            params.dist.max_distance,
            &mut sr,
        );
        if sr.score > K_MIN_SCORE {
            // Found a match; look for something even better one byte ahead.
            let mut delayed_backward_references_in_row = 0;
            max_length -= 1;
            loop {
                let mut sr2 = SearchResult {
                    len: if params.quality < MIN_QUALITY_FOR_EXTENSIVE_REFERENCE_SEARCH {
                        (sr.len - 1).min(max_length)
                    } else {
                        0
                    },
                    score: K_MIN_SCORE,
                    ..Default::default()
                };
                max_distance = (position + 1).min(max_backward_limit);
                hasher.find_longest_match(
                    dictionary,
                    ringbuffer,
                    ringbuffer_mask,
                    dist_cache,
                    position + 1,
                    max_length,
                    max_distance,
                    gap,
                    params.dist.max_distance,
                    &mut sr2,
                );
                if sr2.score >= sr.score + COST_DIFF_LAZY {
                    // Emit one literal and restart the match from the next
                    // byte.
                    position += 1;
                    insert_length += 1;
                    sr = sr2;
                    delayed_backward_references_in_row += 1;
                    if delayed_backward_references_in_row < 4
                        && position + hasher.hash_type_length() < pos_end
                    {
                        max_length -= 1;
                        continue;
                    }
                }
                break;
            }

            apply_random_heuristics = position + 2 * sr.len + random_heuristics_window_size;
            max_distance = position.min(max_backward_limit);
            {
                let distance_code = compute_distance_code(sr.distance, max_distance + gap, dist_cache);
                if sr.distance <= max_distance + gap && distance_code > 0 {
                    dist_cache[3] = dist_cache[2];
                    dist_cache[2] = dist_cache[1];
                    dist_cache[1] = dist_cache[0];
                    dist_cache[0] = sr.distance as i32;
                    hasher.prepare_distance_cache(dist_cache);
                }
                commands.push(Command::new(
                    &params.dist,
                    insert_length,
                    sr.len,
                    sr.len_code_delta,
                    distance_code,
                ));
            }
            *num_literals += insert_length;
            insert_length = 0;

            // Put the hash keys into the table; when the copy overlaps its
            // own source (distance < len/4) start later, so RLE-ish data
            // does not flood the table.
            {
                let mut range_start = position + 2;
                let range_end = (position + sr.len).min(store_end);
                if sr.distance < sr.len >> 2 {
                    range_start = range_end.min(range_start.max(
                        (position + sr.len).saturating_sub(sr.distance << 2),
                    ));
                }
                hasher.store_range(ringbuffer, ringbuffer_mask, range_start, range_end);
            }
            position += sr.len;
        } else {
            insert_length += 1;
            position += 1;

            // After a long spree without matches, assume the data is not
            // compressible and hash it sparsely.
            if position > apply_random_heuristics {
                if position > apply_random_heuristics + 4 * random_heuristics_window_size {
                    let k_margin = (hasher.store_lookahead() - 1).max(4);
                    let pos_jump = (position + 16).min(pos_end - k_margin);
                    while position < pos_jump {
                        hasher.store(ringbuffer, ringbuffer_mask, position);
                        insert_length += 4;
                        position += 4;
                    }
                } else {
                    let k_margin = (hasher.store_lookahead() - 1).max(2);
                    let pos_jump = (position + 8).min(pos_end - k_margin);
                    while position < pos_jump {
                        hasher.store(ringbuffer, ringbuffer_mask, position);
                        insert_length += 2;
                        position += 2;
                    }
                }
            }
        }
    }

    insert_length += pos_end - position;
    *last_insert_len = insert_length;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::get_encoder_dictionary;
    use crate::hash::new_hasher;

    #[test]
    fn test_distance_code_short_codes() {
        let cache = [11i32, 4, 25, 80];
        assert_eq!(compute_distance_code(11, 1 << 20, &cache), 0);
        assert_eq!(compute_distance_code(4, 1 << 20, &cache), 1);
        assert_eq!(compute_distance_code(25, 1 << 20, &cache), 2);
        assert_eq!(compute_distance_code(80, 1 << 20, &cache), 3);
        // last distance - 1 is a short code (code 4), +1 is code 5.
        assert_eq!(compute_distance_code(10, 1 << 20, &cache), 4);
        assert_eq!(compute_distance_code(12, 1 << 20, &cache), 5);
        // Unrelated distances get the offset form.
        assert_eq!(compute_distance_code(1000, 1 << 20, &cache), 1000 + 15);
        // Distances beyond the window never use short codes.
        assert_eq!(compute_distance_code(11, 10, &cache), 11 + 15);
    }

    #[test]
    fn test_repetitive_input_yields_copies() {
        let mut params = EncoderParams {
            quality: 5,
            lgwin: 16,
            ..Default::default()
        };
        params.sanitize();
        params.lgblock = params.compute_lgblock();
        params.choose_distance_params();
        params.choose_hasher();

        let mut data = Vec::new();
        for _ in 0..64 {
            data.extend_from_slice(b"request/response cycle ");
        }
        data.extend_from_slice(&[0u8; 16]);
        let payload_len = data.len() - 16;

        let mut hasher = new_hasher(&params);
        hasher.prepare(true, payload_len, &data);
        let mut dist_cache = [4i32, 11, 15, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut last_insert_len = 0usize;
        let mut commands = Vec::new();
        let mut num_literals = 0usize;
        create_backward_references(
            payload_len,
            0,
            &data,
            usize::MAX >> 1,
            &params,
            hasher.as_mut(),
            get_encoder_dictionary(),
            &mut dist_cache,
            &mut last_insert_len,
            &mut commands,
            &mut num_literals,
        );
        assert!(!commands.is_empty(), "repetitive data must produce copies");
        // Total coverage: literals + copies + trailing insert = input.
        let covered: usize = commands
            .iter()
            .map(|c| c.insert_len as usize + c.copy_len() as usize)
            .sum::<usize>()
            + last_insert_len;
        assert_eq!(covered, payload_len);
        // The dominant distance is the period of the pattern.
        assert!(commands.iter().any(|c| c.copy_len() >= 23));
    }
}
