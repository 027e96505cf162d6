//! Symbol histograms over the three coded alphabets.

use crate::block_splitter::BlockSplit;
use crate::command::Command;
use crate::constants::{
    LITERAL_CONTEXT_BITS, NUM_COMMAND_SYMBOLS, NUM_DISTANCE_SYMBOLS, NUM_LITERAL_SYMBOLS,
};
use crate::context::{get_context, get_context_lut, ContextMode};

/// A symbol-count histogram with a cached population bit cost.
#[derive(Debug, Clone)]
pub struct Histogram<const N: usize> {
    pub data: [u32; N],
    pub total_count: usize,
    pub bit_cost: f64,
}

pub type HistogramLiteral = Histogram<NUM_LITERAL_SYMBOLS>;
pub type HistogramCommand = Histogram<NUM_COMMAND_SYMBOLS>;
pub type HistogramDistance = Histogram<NUM_DISTANCE_SYMBOLS>;

impl<const N: usize> Default for Histogram<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Histogram<N> {
    pub fn new() -> Self {
        Histogram {
            data: [0u32; N],
            total_count: 0,
            bit_cost: f64::MAX,
        }
    }

    pub fn clear(&mut self) {
        self.data = [0u32; N];
        self.total_count = 0;
        self.bit_cost = f64::MAX;
    }

    #[inline]
    pub fn add(&mut self, val: usize) {
        self.data[val] += 1;
        self.total_count += 1;
    }

    pub fn add_vector<T: Copy + Into<usize>>(&mut self, p: &[T]) {
        self.total_count += p.len();
        for &v in p {
            self.data[v.into()] += 1;
        }
    }

    pub fn add_histogram(&mut self, other: &Histogram<N>) {
        self.total_count += other.total_count;
        for i in 0..N {
            self.data[i] += other.data[i];
        }
    }

    pub const fn data_size() -> usize {
        N
    }
}

/// Walks a block split one symbol at a time.
pub struct BlockSplitIterator<'a> {
    split: &'a BlockSplit,
    idx: usize,
    pub block_type: usize,
    length: usize,
}

impl<'a> BlockSplitIterator<'a> {
    pub fn new(split: &'a BlockSplit) -> Self {
        BlockSplitIterator {
            split,
            idx: 0,
            block_type: 0,
            length: split.lengths.first().copied().unwrap_or(0) as usize,
        }
    }

    pub fn next(&mut self) {
        if self.length == 0 {
            self.idx += 1;
            self.block_type = self.split.types[self.idx] as usize;
            self.length = self.split.lengths[self.idx] as usize;
        }
        self.length -= 1;
    }
}

/// Builds the per-block-type (and, for literals and distances,
/// per-context) histograms implied by a command stream and its splits.
#[allow(clippy::too_many_arguments)]
pub fn build_histograms_with_context(
    cmds: &[Command],
    literal_split: &BlockSplit,
    insert_and_copy_split: &BlockSplit,
    dist_split: &BlockSplit,
    ringbuffer: &[u8],
    start_pos: usize,
    mask: usize,
    mut prev_byte: u8,
    mut prev_byte2: u8,
    context_modes: Option<&[ContextMode]>,
    literal_histograms: &mut [HistogramLiteral],
    insert_and_copy_histograms: &mut [HistogramCommand],
    copy_dist_histograms: &mut [HistogramDistance],
) {
    let mut pos = start_pos;
    let mut literal_it = BlockSplitIterator::new(literal_split);
    let mut insert_and_copy_it = BlockSplitIterator::new(insert_and_copy_split);
    let mut dist_it = BlockSplitIterator::new(dist_split);

    for cmd in cmds {
        insert_and_copy_it.next();
        insert_and_copy_histograms[insert_and_copy_it.block_type].add(cmd.cmd_prefix as usize);

        for _ in 0..cmd.insert_len {
            literal_it.next();
            let mut context = literal_it.block_type;
            if let Some(modes) = context_modes {
                let lut = get_context_lut(modes[context]);
                context = (context << LITERAL_CONTEXT_BITS)
                    + get_context(prev_byte, prev_byte2, lut) as usize;
            }
            literal_histograms[context].add(ringbuffer[pos & mask] as usize);
            prev_byte2 = prev_byte;
            prev_byte = ringbuffer[pos & mask];
            pos += 1;
        }

        pos += cmd.copy_len() as usize;
        if cmd.copy_len() != 0 {
            prev_byte2 = ringbuffer[(pos - 2) & mask];
            prev_byte = ringbuffer[(pos - 1) & mask];
            if cmd.has_distance() {
                dist_it.next();
                let context = (dist_it.block_type << crate::constants::DISTANCE_CONTEXT_BITS)
                    + cmd.distance_context() as usize;
                copy_dist_histograms[context].add((cmd.dist_prefix & 0x3FF) as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_merge() {
        let mut a: Histogram<16> = Histogram::new();
        a.add(3);
        a.add(3);
        a.add(7);
        assert_eq!(a.total_count, 3);
        assert_eq!(a.data[3], 2);

        let mut b: Histogram<16> = Histogram::new();
        b.add_vector(&[1u8, 1, 3]);
        a.add_histogram(&b);
        assert_eq!(a.total_count, 6);
        assert_eq!(a.data[1], 2);
        assert_eq!(a.data[3], 3);
    }

    #[test]
    fn test_block_split_iterator() {
        let split = BlockSplit {
            num_types: 2,
            num_blocks: 3,
            types: vec![0, 1, 0],
            lengths: vec![2, 1, 2],
        };
        let mut it = BlockSplitIterator::new(&split);
        let mut seen = Vec::new();
        for _ in 0..5 {
            it.next();
            seen.push(it.block_type);
        }
        assert_eq!(seen, vec![0, 0, 1, 0, 0]);
    }
}
