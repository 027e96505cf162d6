//! Composite hasher: two hashers in sequence; each result only improves
//! the outgoing search result.

use super::{Hasher, HasherCommon, SearchResult};
use crate::dictionary::EncoderDictionary;

pub struct CompositeHasher {
    common: HasherCommon,
    ha: Box<dyn Hasher>,
    hb: Box<dyn Hasher>,
}

impl CompositeHasher {
    pub fn new(ha: Box<dyn Hasher>, hb: Box<dyn Hasher>) -> Self {
        CompositeHasher {
            common: HasherCommon::default(),
            ha,
            hb,
        }
    }
}

impl Hasher for CompositeHasher {
    fn common(&self) -> &HasherCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut HasherCommon {
        &mut self.common
    }

    fn hash_type_length(&self) -> usize {
        self.ha.hash_type_length().max(self.hb.hash_type_length())
    }

    fn store_lookahead(&self) -> usize {
        self.ha.store_lookahead().max(self.hb.store_lookahead())
    }

    fn prepare(&mut self, one_shot: bool, input_size: usize, data: &[u8]) {
        self.ha.prepare(one_shot, input_size, data);
        self.hb.prepare(one_shot, input_size, data);
    }

    fn store(&mut self, data: &[u8], mask: usize, ix: usize) {
        self.ha.store(data, mask, ix);
        self.hb.store(data, mask, ix);
    }

    fn store_range(&mut self, data: &[u8], mask: usize, ix_start: usize, ix_end: usize) {
        self.ha.store_range(data, mask, ix_start, ix_end);
        self.hb.store_range(data, mask, ix_start, ix_end);
    }

    fn stitch_to_previous_block(
        &mut self,
        num_bytes: usize,
        position: usize,
        ringbuffer: &[u8],
        ringbuffer_mask: usize,
    ) {
        self.ha
            .stitch_to_previous_block(num_bytes, position, ringbuffer, ringbuffer_mask);
        self.hb
            .stitch_to_previous_block(num_bytes, position, ringbuffer, ringbuffer_mask);
    }

    fn prepare_distance_cache(&self, distance_cache: &mut [i32]) {
        self.ha.prepare_distance_cache(distance_cache);
        self.hb.prepare_distance_cache(distance_cache);
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
        self.ha.find_longest_match(
            dictionary,
            data,
            ring_buffer_mask,
            distance_cache,
            cur_ix,
            max_length,
            max_backward,
            gap,
            max_distance,
            out,
        );
        self.hb.find_longest_match(
            dictionary,
            data,
            ring_buffer_mask,
            distance_cache,
            cur_ix,
            max_length,
            max_backward,
            gap,
            max_distance,
            out,
        );
    }
}
