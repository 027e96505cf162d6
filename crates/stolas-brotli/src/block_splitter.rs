//! Block split point selection.
//!
//! Each of the three symbol streams (literals, insert-and-copy codes,
//! distance codes) is partitioned into typed blocks so that each type can
//! carry its own entropy code. Splitting seeds a set of candidate
//! histograms from sampled stride windows, assigns a histogram to every
//! position with a forward cost DP whose per-histogram cost is capped at a
//! block-switch cost, traces the switch points back, and repeats with
//! re-estimated histograms.

use crate::cluster::cluster_blocks;
use crate::command::Command;
use crate::fast_log::fast_log2;
use crate::histogram::Histogram;
use crate::params::{EncoderParams, HQ_ZOPFLIFICATION_QUALITY};

/// A finished split: per-block type bytes and lengths.
#[derive(Debug, Default, Clone)]
pub struct BlockSplit {
    pub num_types: usize,
    pub num_blocks: usize,
    pub types: Vec<u8>,
    pub lengths: Vec<u32>,
}

pub const K_MAX_LITERAL_HISTOGRAMS: usize = 100;
pub const K_MAX_COMMAND_HISTOGRAMS: usize = 50;
pub const K_LITERAL_BLOCK_SWITCH_COST: f64 = 28.1;
pub const K_COMMAND_BLOCK_SWITCH_COST: f64 = 13.5;
pub const K_DISTANCE_BLOCK_SWITCH_COST: f64 = 14.6;
pub const K_LITERAL_STRIDE_LENGTH: usize = 70;
pub const K_COMMAND_STRIDE_LENGTH: usize = 40;
pub const K_SYMBOLS_PER_LITERAL_HISTOGRAM: usize = 544;
pub const K_SYMBOLS_PER_COMMAND_HISTOGRAM: usize = 530;
pub const K_SYMBOLS_PER_DISTANCE_HISTOGRAM: usize = 544;
pub const K_MIN_LENGTH_FOR_BLOCK_SPLITTING: usize = 128;
pub const K_ITER_MUL_FOR_REFINING: usize = 2;
pub const K_MIN_ITERS_FOR_REFINING: usize = 100;

pub const HISTOGRAMS_PER_BATCH: usize = 64;
pub const CLUSTERS_PER_BATCH: usize = 16;

/// Multiplicative LCG; initial seed must be 7, giving a (1 << 29) loop.
#[inline]
pub fn my_rand(seed: &mut u32) -> u32 {
    *seed = seed.wrapping_mul(16807);
    *seed
}

#[inline]
fn bit_cost(count: usize) -> f64 {
    if count == 0 {
        -2.0
    } else {
        fast_log2(count as u64)
    }
}

fn count_literals(cmds: &[Command]) -> usize {
    cmds.iter().map(|c| c.insert_len as usize).sum()
}

fn copy_literals_to_byte_array(
    cmds: &[Command],
    data: &[u8],
    offset: usize,
    mask: usize,
    literals: &mut [u8],
) {
    let mut pos = 0usize;
    let mut from_pos = offset & mask;
    for cmd in cmds {
        let mut insert_len = cmd.insert_len as usize;
        if from_pos + insert_len > mask {
            let head_size = mask + 1 - from_pos;
            literals[pos..pos + head_size].copy_from_slice(&data[from_pos..from_pos + head_size]);
            from_pos = 0;
            pos += head_size;
            insert_len -= head_size;
        }
        if insert_len > 0 {
            literals[pos..pos + insert_len].copy_from_slice(&data[from_pos..from_pos + insert_len]);
            pos += insert_len;
        }
        from_pos = (from_pos + insert_len + cmd.copy_len() as usize) & mask;
    }
}

fn initial_entropy_codes<const N: usize, T: Copy + Into<usize>>(
    data: &[T],
    stride: usize,
    num_histograms: usize,
    histograms: &mut [Histogram<N>],
) {
    let length = data.len();
    let mut seed: u32 = 7;
    let block_length = length / num_histograms;
    for (i, histogram) in histograms.iter_mut().enumerate().take(num_histograms) {
        let mut pos = length * i / num_histograms;
        if i != 0 {
            pos += (my_rand(&mut seed) % block_length as u32) as usize;
        }
        if pos + stride >= length {
            pos = length - stride - 1;
        }
        histogram.add_vector(&data[pos..pos + stride]);
    }
}

fn random_sample<const N: usize, T: Copy + Into<usize>>(
    seed: &mut u32,
    data: &[T],
    mut stride: usize,
    sample: &mut Histogram<N>,
) {
    let length = data.len();
    let mut pos = 0usize;
    if stride >= length {
        stride = length;
    } else {
        pos = (my_rand(seed) % (length - stride + 1) as u32) as usize;
    }
    sample.add_vector(&data[pos..pos + stride]);
}

fn refine_entropy_codes<const N: usize, T: Copy + Into<usize>>(
    data: &[T],
    stride: usize,
    num_histograms: usize,
    histograms: &mut [Histogram<N>],
) {
    let mut iters =
        K_ITER_MUL_FOR_REFINING * data.len() / stride + K_MIN_ITERS_FOR_REFINING;
    let mut seed: u32 = 7;
    iters = ((iters + num_histograms - 1) / num_histograms) * num_histograms;
    for iter in 0..iters {
        let mut sample = Histogram::<N>::new();
        random_sample(&mut seed, data, stride, &mut sample);
        histograms[iter % num_histograms].add_histogram(&sample);
    }
}

/// Assigns a block id in `[0, num_histograms)` to each element and returns
/// the number of blocks (one plus the number of switches).
fn find_blocks<const N: usize, T: Copy + Into<usize>>(
    data: &[T],
    block_switch_bitcost: f64,
    num_histograms: usize,
    histograms: &[Histogram<N>],
    insert_cost: &mut [f64],
    cost: &mut [f64],
    switch_signal: &mut [u8],
    block_id: &mut [u8],
) -> usize {
    let data_size = N;
    let bitmaplen = (num_histograms + 7) >> 3;
    let length = data.len();
    let mut num_blocks = 1usize;
    debug_assert!(num_histograms <= 256);
    if num_histograms <= 1 {
        for b in block_id.iter_mut().take(length) {
            *b = 0;
        }
        return 1;
    }

    for c in insert_cost[..data_size * num_histograms].iter_mut() {
        *c = 0.0;
    }
    for (j, histogram) in histograms.iter().enumerate().take(num_histograms) {
        insert_cost[j] = fast_log2(histogram.total_count as u64);
    }
    for i in (0..data_size).rev() {
        for j in 0..num_histograms {
            insert_cost[i * num_histograms + j] =
                insert_cost[j] - bit_cost(histograms[j].data[i] as usize);
        }
    }

    for c in cost[..num_histograms].iter_mut() {
        *c = 0.0;
    }
    for s in switch_signal[..length * bitmaplen].iter_mut() {
        *s = 0;
    }

    // cost[k] tracks the difference between the cheapest path ending in
    // code k and the cheapest path overall, saturated at the block switch
    // cost; saturation marks a switch point for the back-trace.
    for (byte_ix, &symbol) in data.iter().enumerate() {
        let ix = byte_ix * bitmaplen;
        let insert_cost_ix = symbol.into() * num_histograms;
        let mut min_cost = 1e99f64;
        let mut block_switch_cost = block_switch_bitcost;
        for k in 0..num_histograms {
            cost[k] += insert_cost[insert_cost_ix + k];
            if cost[k] < min_cost {
                min_cost = cost[k];
                block_id[byte_ix] = k as u8;
            }
        }
        // More blocks for the beginning.
        if byte_ix < 2000 {
            block_switch_cost *= 0.77 + 0.07 * byte_ix as f64 / 2000.0;
        }
        for k in 0..num_histograms {
            cost[k] -= min_cost;
            if cost[k] >= block_switch_cost {
                cost[k] = block_switch_cost;
                switch_signal[ix + (k >> 3)] |= 1 << (k & 7);
            }
        }
    }

    // Trace back from the last position and switch at the marked places.
    {
        let mut byte_ix = length - 1;
        let mut ix = byte_ix * bitmaplen;
        let mut cur_id = block_id[byte_ix];
        while byte_ix > 0 {
            let mask = 1u8 << (cur_id & 7);
            byte_ix -= 1;
            ix -= bitmaplen;
            if switch_signal[ix + (cur_id >> 3) as usize] & mask != 0 && cur_id != block_id[byte_ix]
            {
                cur_id = block_id[byte_ix];
                num_blocks += 1;
            }
            block_id[byte_ix] = cur_id;
        }
    }
    num_blocks
}

const K_INVALID_ID: u16 = 256;

fn remap_block_ids(block_ids: &mut [u8], new_id: &mut [u16], num_histograms: usize) -> usize {
    let mut next_id: u16 = 0;
    for id in new_id.iter_mut().take(num_histograms) {
        *id = K_INVALID_ID;
    }
    for &b in block_ids.iter() {
        debug_assert!((b as usize) < num_histograms);
        if new_id[b as usize] == K_INVALID_ID {
            new_id[b as usize] = next_id;
            next_id += 1;
        }
    }
    for b in block_ids.iter_mut() {
        *b = new_id[*b as usize] as u8;
    }
    next_id as usize
}

fn build_block_histograms<const N: usize, T: Copy + Into<usize>>(
    data: &[T],
    block_ids: &[u8],
    histograms: &mut [Histogram<N>],
) {
    for h in histograms.iter_mut() {
        h.clear();
    }
    for (i, &symbol) in data.iter().enumerate() {
        histograms[block_ids[i] as usize].add(symbol.into());
    }
}

/// Splits one symbol stream into typed blocks.
pub fn split_byte_vector<const N: usize, T: Copy + Into<usize>>(
    data: &[T],
    symbols_per_histogram: usize,
    max_histograms: usize,
    sampling_stride_length: usize,
    block_switch_cost: f64,
    params: &EncoderParams,
    split: &mut BlockSplit,
) {
    let length = data.len();
    let mut num_histograms = length / symbols_per_histogram + 1;
    if num_histograms > max_histograms {
        num_histograms = max_histograms;
    }

    if length == 0 {
        split.num_types = 1;
        return;
    }
    if length < K_MIN_LENGTH_FOR_BLOCK_SPLITTING {
        split.num_types = 1;
        split.types.push(0);
        split.lengths.push(length as u32);
        split.num_blocks += 1;
        return;
    }

    let mut histograms = vec![Histogram::<N>::new(); num_histograms];
    initial_entropy_codes(data, sampling_stride_length, num_histograms, &mut histograms);
    refine_entropy_codes(data, sampling_stride_length, num_histograms, &mut histograms);

    let mut block_ids = vec![0u8; length];
    let mut num_blocks = 0usize;
    let bitmaplen = (num_histograms + 7) >> 3;
    let mut insert_cost = vec![0f64; N * num_histograms];
    let mut cost = vec![0f64; num_histograms];
    let mut switch_signal = vec![0u8; length * bitmaplen];
    let mut new_id = vec![0u16; num_histograms];
    let iters = if params.quality < HQ_ZOPFLIFICATION_QUALITY {
        3
    } else {
        10
    };
    for _ in 0..iters {
        num_blocks = find_blocks(
            data,
            block_switch_cost,
            num_histograms,
            &histograms,
            &mut insert_cost,
            &mut cost,
            &mut switch_signal,
            &mut block_ids,
        );
        num_histograms = remap_block_ids(&mut block_ids, &mut new_id, num_histograms);
        build_block_histograms(data, &block_ids, &mut histograms[..num_histograms]);
    }
    cluster_blocks::<N, T>(data, num_blocks, &block_ids, split);
}

/// Splits all three streams of a meta-block.
pub fn split_block(
    cmds: &[Command],
    data: &[u8],
    pos: usize,
    mask: usize,
    params: &EncoderParams,
    literal_split: &mut BlockSplit,
    insert_and_copy_split: &mut BlockSplit,
    dist_split: &mut BlockSplit,
) {
    {
        let literals_count = count_literals(cmds);
        let mut literals = vec![0u8; literals_count];
        copy_literals_to_byte_array(cmds, data, pos, mask, &mut literals);
        split_byte_vector::<{ crate::constants::NUM_LITERAL_SYMBOLS }, u8>(
            &literals,
            K_SYMBOLS_PER_LITERAL_HISTOGRAM,
            K_MAX_LITERAL_HISTOGRAMS,
            K_LITERAL_STRIDE_LENGTH,
            K_LITERAL_BLOCK_SWITCH_COST,
            params,
            literal_split,
        );
    }
    {
        let insert_and_copy_codes: Vec<u16> = cmds.iter().map(|c| c.cmd_prefix).collect();
        split_byte_vector::<{ crate::constants::NUM_COMMAND_SYMBOLS }, u16>(
            &insert_and_copy_codes,
            K_SYMBOLS_PER_COMMAND_HISTOGRAM,
            K_MAX_COMMAND_HISTOGRAMS,
            K_COMMAND_STRIDE_LENGTH,
            K_COMMAND_BLOCK_SWITCH_COST,
            params,
            insert_and_copy_split,
        );
    }
    {
        let distance_prefixes: Vec<u16> = cmds
            .iter()
            .filter(|c| c.copy_len() != 0 && c.has_distance())
            .map(|c| c.dist_prefix & 0x3FF)
            .collect();
        split_byte_vector::<{ crate::constants::NUM_DISTANCE_SYMBOLS }, u16>(
            &distance_prefixes,
            K_SYMBOLS_PER_DISTANCE_HISTOGRAM,
            K_MAX_COMMAND_HISTOGRAMS,
            K_COMMAND_STRIDE_LENGTH,
            K_DISTANCE_BLOCK_SWITCH_COST,
            params,
            dist_split,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::EncoderParams;

    fn params() -> EncoderParams {
        EncoderParams {
            quality: 9,
            ..Default::default()
        }
    }

    #[test]
    fn test_short_stream_single_block() {
        let data: Vec<u8> = (0..64u8).collect();
        let mut split = BlockSplit::default();
        split_byte_vector::<256, u8>(&data, 544, 100, 70, 28.1, &params(), &mut split);
        assert_eq!(split.num_types, 1);
        assert_eq!(split.num_blocks, 1);
        assert_eq!(split.lengths, vec![64]);
    }

    #[test]
    fn test_lengths_sum_to_stream_length() {
        // Two clearly different phases should still produce a split whose
        // lengths cover every symbol exactly once.
        let mut data = vec![b'a'; 4000];
        for (i, b) in data.iter_mut().enumerate().skip(2000) {
            *b = b'0' + (i % 10) as u8;
        }
        let mut split = BlockSplit::default();
        split_byte_vector::<256, u8>(&data, 544, 100, 70, 28.1, &params(), &mut split);
        let total: u64 = split.lengths.iter().map(|&l| u64::from(l)).sum();
        assert_eq!(total, 4000);
        assert!(split.num_blocks >= 1);
        assert!(split.num_types >= 1 && split.num_types <= 256);
        for &t in &split.types {
            assert!((t as usize) < split.num_types);
        }
    }

    #[test]
    fn test_empty_stream() {
        let data: Vec<u16> = Vec::new();
        let mut split = BlockSplit::default();
        split_byte_vector::<704, u16>(&data, 530, 50, 40, 13.5, &params(), &mut split);
        assert_eq!(split.num_types, 1);
        assert_eq!(split.num_blocks, 0);
    }
}
