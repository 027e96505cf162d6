//! Clustering of similar histograms.
//!
//! Pair-merging with a bounded priority queue: the pair with the largest
//! bit-cost reduction sits at the front, merges happen greedily until no
//! pair saves bits or the cluster budget is reached.

use crate::bit_cost::population_cost;
use crate::block_splitter::{BlockSplit, HISTOGRAMS_PER_BATCH};
use crate::constants::MAX_NUMBER_OF_BLOCK_TYPES;
use crate::fast_log::fast_log2;
use crate::histogram::Histogram;

#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramPair {
    pub idx1: u32,
    pub idx2: u32,
    pub cost_combo: f64,
    pub cost_diff: f64,
}

fn histogram_pair_is_less(p1: &HistogramPair, p2: &HistogramPair) -> bool {
    if p1.cost_diff != p2.cost_diff {
        return p1.cost_diff > p2.cost_diff;
    }
    (p1.idx2 - p1.idx1) > (p2.idx2 - p2.idx1)
}

/// Entropy reduction of the context map when two clusters are combined.
fn cluster_cost_diff(size_a: usize, size_b: usize) -> f64 {
    let size_c = size_a + size_b;
    size_a as f64 * fast_log2(size_a as u64) + size_b as f64 * fast_log2(size_b as u64)
        - size_c as f64 * fast_log2(size_c as u64)
}

/// Computes the bit-cost reduction of combining `out[idx1]` and
/// `out[idx2]`; if worthwhile, pushes the pair into the bounded queue.
fn compare_and_push_to_queue<const N: usize>(
    out: &[Histogram<N>],
    cluster_size: &[u32],
    mut idx1: u32,
    mut idx2: u32,
    max_num_pairs: usize,
    pairs: &mut [HistogramPair],
    num_pairs: &mut usize,
) {
    if idx1 == idx2 {
        return;
    }
    if idx2 < idx1 {
        std::mem::swap(&mut idx1, &mut idx2);
    }
    let mut p = HistogramPair {
        idx1,
        idx2,
        cost_combo: 0.0,
        cost_diff: 0.5
            * cluster_cost_diff(
                cluster_size[idx1 as usize] as usize,
                cluster_size[idx2 as usize] as usize,
            ),
    };
    p.cost_diff -= out[idx1 as usize].bit_cost;
    p.cost_diff -= out[idx2 as usize].bit_cost;

    let is_good_pair;
    if out[idx1 as usize].total_count == 0 {
        p.cost_combo = out[idx2 as usize].bit_cost;
        is_good_pair = true;
    } else if out[idx2 as usize].total_count == 0 {
        p.cost_combo = out[idx1 as usize].bit_cost;
        is_good_pair = true;
    } else {
        let threshold = if *num_pairs == 0 {
            1e99
        } else {
            pairs[0].cost_diff.max(0.0)
        };
        let mut combo = out[idx1 as usize].clone();
        combo.add_histogram(&out[idx2 as usize]);
        let cost_combo = population_cost(&combo);
        if cost_combo < threshold - p.cost_diff {
            p.cost_combo = cost_combo;
            is_good_pair = true;
        } else {
            is_good_pair = false;
        }
    }

    if is_good_pair {
        p.cost_diff += p.cost_combo;
        if *num_pairs > 0 && histogram_pair_is_less(&pairs[0], &p) {
            // Replace the front of the queue if needed.
            if *num_pairs < max_num_pairs {
                pairs[*num_pairs] = pairs[0];
                *num_pairs += 1;
            }
            pairs[0] = p;
        } else if *num_pairs < max_num_pairs {
            pairs[*num_pairs] = p;
            *num_pairs += 1;
        }
    }
}

/// Greedily merges clusters until nothing saves bits or `max_clusters`
/// remain. Returns the remaining cluster count.
#[allow(clippy::too_many_arguments)]
pub fn histogram_combine<const N: usize>(
    out: &mut [Histogram<N>],
    cluster_size: &mut [u32],
    symbols: &mut [u32],
    clusters: &mut Vec<u32>,
    pairs: &mut [HistogramPair],
    mut num_clusters: usize,
    symbols_size: usize,
    max_clusters: usize,
    max_num_pairs: usize,
) -> usize {
    let mut cost_diff_threshold = 0.0f64;
    let mut min_cluster_size = 1usize;
    let mut num_pairs = 0usize;

    for idx1 in 0..num_clusters {
        for idx2 in idx1 + 1..num_clusters {
            compare_and_push_to_queue(
                out,
                cluster_size,
                clusters[idx1],
                clusters[idx2],
                max_num_pairs,
                pairs,
                &mut num_pairs,
            );
        }
    }

    while num_clusters > min_cluster_size {
        if pairs[0].cost_diff >= cost_diff_threshold {
            cost_diff_threshold = 1e99;
            min_cluster_size = max_clusters;
            continue;
        }

        // Take the best pair from the front of the queue.
        let best_idx1 = pairs[0].idx1;
        let best_idx2 = pairs[0].idx2;
        let (merged, merged_cost) = {
            let mut h = out[best_idx1 as usize].clone();
            h.add_histogram(&out[best_idx2 as usize]);
            (h, pairs[0].cost_combo)
        };
        out[best_idx1 as usize] = merged;
        out[best_idx1 as usize].bit_cost = merged_cost;
        cluster_size[best_idx1 as usize] += cluster_size[best_idx2 as usize];
        for s in symbols[..symbols_size].iter_mut() {
            if *s == best_idx2 {
                *s = best_idx1;
            }
        }
        if let Some(pos) = clusters[..num_clusters].iter().position(|&c| c == best_idx2) {
            clusters.remove(pos);
        }
        num_clusters -= 1;

        // Drop pairs intersecting the merged pair, keeping the best first.
        let mut copy_to_idx = 0usize;
        for i in 0..num_pairs {
            let p = pairs[i];
            if p.idx1 == best_idx1 || p.idx2 == best_idx1 || p.idx1 == best_idx2 || p.idx2 == best_idx2
            {
                continue;
            }
            if histogram_pair_is_less(&pairs[0], &p) {
                let front = pairs[0];
                pairs[0] = p;
                pairs[copy_to_idx] = front;
            } else {
                pairs[copy_to_idx] = p;
            }
            copy_to_idx += 1;
        }
        num_pairs = copy_to_idx;

        // Push new pairs formed with the combined histogram.
        for i in 0..num_clusters {
            compare_and_push_to_queue(
                out,
                cluster_size,
                best_idx1,
                clusters[i],
                max_num_pairs,
                pairs,
                &mut num_pairs,
            );
        }
    }
    num_clusters
}

/// Bit cost of moving `histogram` into `candidate`'s cluster.
pub fn histogram_bit_cost_distance<const N: usize>(
    histogram: &Histogram<N>,
    candidate: &Histogram<N>,
) -> f64 {
    if histogram.total_count == 0 {
        return 0.0;
    }
    let mut tmp = histogram.clone();
    tmp.add_histogram(candidate);
    population_cost(&tmp) - candidate.bit_cost
}

/// Finds the best output cluster for each input histogram, then rebuilds
/// the outputs from their assigned inputs.
fn histogram_remap<const N: usize>(
    input: &[Histogram<N>],
    clusters: &[u32],
    out: &mut [Histogram<N>],
    symbols: &mut [u32],
) {
    for (i, histogram) in input.iter().enumerate() {
        let mut best_out = if i == 0 { symbols[0] } else { symbols[i - 1] };
        let mut best_bits = histogram_bit_cost_distance(histogram, &out[best_out as usize]);
        for &cluster in clusters {
            let cur_bits = histogram_bit_cost_distance(histogram, &out[cluster as usize]);
            if cur_bits < best_bits {
                best_bits = cur_bits;
                best_out = cluster;
            }
        }
        symbols[i] = best_out;
    }

    for &cluster in clusters {
        out[cluster as usize].clear();
    }
    for (i, histogram) in input.iter().enumerate() {
        out[symbols[i] as usize].add_histogram(histogram);
    }
}

const K_INVALID_INDEX: u32 = u32::MAX;

/// Canonicalizes cluster ids to first-occurrence order; compacts `out`.
/// Returns the number of unique clusters.
fn histogram_reindex<const N: usize>(out: &mut Vec<Histogram<N>>, symbols: &mut [u32]) -> usize {
    let length = symbols.len();
    let mut new_index = vec![K_INVALID_INDEX; length];
    let mut next_index: u32 = 0;
    for &s in symbols.iter() {
        if new_index[s as usize] == K_INVALID_INDEX {
            new_index[s as usize] = next_index;
            next_index += 1;
        }
    }
    let mut tmp: Vec<Histogram<N>> = Vec::with_capacity(next_index as usize);
    let mut next: u32 = 0;
    for i in 0..length {
        if new_index[symbols[i] as usize] == next {
            tmp.push(out[symbols[i] as usize].clone());
            next += 1;
        }
        symbols[i] = new_index[symbols[i] as usize];
    }
    *out = tmp;
    next as usize
}

/// Clusters `input` histograms down to at most `max_histograms`, filling
/// `out` with the cluster histograms and `histogram_symbols` with the
/// per-input cluster ids in canonical order. Returns the cluster count.
pub fn cluster_histograms<const N: usize>(
    input: &[Histogram<N>],
    max_histograms: usize,
    out: &mut Vec<Histogram<N>>,
    histogram_symbols: &mut Vec<u32>,
) -> usize {
    let in_size = input.len();
    let mut cluster_size = vec![1u32; in_size];
    let mut clusters: Vec<u32> = Vec::with_capacity(in_size);
    let mut num_clusters = 0usize;
    let max_input_histograms = 64usize;
    let mut pairs_capacity = max_input_histograms * max_input_histograms / 2;
    let mut pairs = vec![HistogramPair::default(); pairs_capacity + 1];

    out.clear();
    histogram_symbols.clear();
    for (i, histogram) in input.iter().enumerate() {
        let mut h = histogram.clone();
        h.bit_cost = population_cost(histogram);
        out.push(h);
        histogram_symbols.push(i as u32);
    }

    let mut i = 0usize;
    while i < in_size {
        let num_to_combine = (in_size - i).min(max_input_histograms);
        let mut batch_clusters: Vec<u32> = (i as u32..(i + num_to_combine) as u32).collect();
        let num_new_clusters = histogram_combine(
            out,
            &mut cluster_size,
            &mut histogram_symbols[i..i + num_to_combine],
            &mut batch_clusters,
            &mut pairs,
            num_to_combine,
            num_to_combine,
            max_histograms,
            pairs_capacity,
        );
        clusters.extend_from_slice(&batch_clusters[..num_new_clusters]);
        num_clusters += num_new_clusters;
        i += max_input_histograms;
    }

    {
        // Second pass with a bounded total number of pairs.
        let max_num_pairs = (64 * num_clusters).min((num_clusters / 2) * num_clusters);
        if pairs_capacity < max_num_pairs + 1 {
            pairs_capacity = max_num_pairs + 1;
            pairs.resize(pairs_capacity, HistogramPair::default());
        }
        num_clusters = histogram_combine(
            out,
            &mut cluster_size,
            histogram_symbols,
            &mut clusters,
            &mut pairs,
            num_clusters,
            in_size,
            max_histograms,
            max_num_pairs,
        );
    }

    histogram_remap(input, &clusters[..num_clusters], out, histogram_symbols);
    histogram_reindex(out, histogram_symbols)
}

/// Clusters the blocks of one stream (identified by `block_ids`) and
/// writes the canonical block-type schedule into `split`.
pub fn cluster_blocks<const N: usize, T: Copy + Into<usize>>(
    data: &[T],
    num_blocks: usize,
    block_ids: &[u8],
    split: &mut BlockSplit,
) {
    let length = data.len();
    let mut block_lengths = vec![0u32; num_blocks];
    {
        let mut block_idx = 0usize;
        for i in 0..length {
            debug_assert!(block_idx < num_blocks);
            block_lengths[block_idx] += 1;
            if i + 1 == length || block_ids[i] != block_ids[i + 1] {
                block_idx += 1;
            }
        }
        debug_assert!(block_idx == num_blocks);
    }

    let expected_num_clusters =
        crate::block_splitter::CLUSTERS_PER_BATCH * (num_blocks + HISTOGRAMS_PER_BATCH - 1) / HISTOGRAMS_PER_BATCH;
    let mut all_histograms: Vec<Histogram<N>> = Vec::with_capacity(expected_num_clusters);
    let mut cluster_size: Vec<u32> = Vec::with_capacity(expected_num_clusters);
    let mut num_clusters = 0usize;
    let mut histograms = vec![Histogram::<N>::new(); num_blocks.min(HISTOGRAMS_PER_BATCH)];
    let max_num_pairs_batch = HISTOGRAMS_PER_BATCH * HISTOGRAMS_PER_BATCH / 2;
    let mut pairs = vec![HistogramPair::default(); max_num_pairs_batch + 1];
    let mut histogram_symbols = vec![0u32; num_blocks];
    let mut pos = 0usize;

    let mut i = 0usize;
    while i < num_blocks {
        let num_to_combine = (num_blocks - i).min(HISTOGRAMS_PER_BATCH);
        let mut sizes = [0u32; HISTOGRAMS_PER_BATCH];
        let mut new_clusters_vec: Vec<u32> = Vec::with_capacity(num_to_combine);
        let mut symbols = [0u32; HISTOGRAMS_PER_BATCH];
        let mut remap = [0u32; HISTOGRAMS_PER_BATCH];

        for j in 0..num_to_combine {
            histograms[j].clear();
            for _ in 0..block_lengths[i + j] {
                histograms[j].add(data[pos].into());
                pos += 1;
            }
            histograms[j].bit_cost = population_cost(&histograms[j]);
            new_clusters_vec.push(j as u32);
            symbols[j] = j as u32;
            sizes[j] = 1;
        }

        let num_new_clusters = histogram_combine(
            &mut histograms,
            &mut sizes,
            &mut symbols,
            &mut new_clusters_vec,
            &mut pairs,
            num_to_combine,
            num_to_combine,
            HISTOGRAMS_PER_BATCH,
            max_num_pairs_batch,
        );

        for j in 0..num_new_clusters {
            all_histograms.push(histograms[new_clusters_vec[j] as usize].clone());
            cluster_size.push(sizes[new_clusters_vec[j] as usize]);
            remap[new_clusters_vec[j] as usize] = j as u32;
        }
        for j in 0..num_to_combine {
            histogram_symbols[i + j] = num_clusters as u32 + remap[symbols[j] as usize];
        }
        num_clusters += num_new_clusters;
        debug_assert!(num_clusters == cluster_size.len());
        debug_assert!(num_clusters == all_histograms.len());
        i += HISTOGRAMS_PER_BATCH;
    }

    let max_num_pairs = (64 * num_clusters).min((num_clusters / 2) * num_clusters);
    if pairs.len() < max_num_pairs + 1 {
        pairs.resize(max_num_pairs + 1, HistogramPair::default());
    }
    let mut clusters: Vec<u32> = (0..num_clusters as u32).collect();
    let num_final_clusters = histogram_combine(
        &mut all_histograms,
        &mut cluster_size,
        &mut histogram_symbols,
        &mut clusters,
        &mut pairs,
        num_clusters,
        num_blocks,
        MAX_NUMBER_OF_BLOCK_TYPES,
        max_num_pairs,
    );

    // Reassign each block to its best final cluster.
    let mut new_index = vec![K_INVALID_INDEX; num_clusters];
    {
        let mut next_index: u32 = 0;
        let mut pos = 0usize;
        for i in 0..num_blocks {
            let mut histo = Histogram::<N>::new();
            for _ in 0..block_lengths[i] {
                histo.add(data[pos].into());
                pos += 1;
            }
            let mut best_out = if i == 0 {
                histogram_symbols[0]
            } else {
                histogram_symbols[i - 1]
            };
            let mut best_bits = histogram_bit_cost_distance(&histo, &all_histograms[best_out as usize]);
            for &cluster in clusters[..num_final_clusters].iter() {
                let cur_bits = histogram_bit_cost_distance(&histo, &all_histograms[cluster as usize]);
                if cur_bits < best_bits {
                    best_bits = cur_bits;
                    best_out = cluster;
                }
            }
            histogram_symbols[i] = best_out;
            if new_index[best_out as usize] == K_INVALID_INDEX {
                new_index[best_out as usize] = next_index;
                next_index += 1;
            }
        }
    }

    // Emit the canonical block-type schedule.
    {
        let mut cur_length = 0u32;
        let mut max_type = 0u8;
        for i in 0..num_blocks {
            cur_length += block_lengths[i];
            if i + 1 == num_blocks || histogram_symbols[i] != histogram_symbols[i + 1] {
                let id = new_index[histogram_symbols[i] as usize] as u8;
                split.types.push(id);
                split.lengths.push(cur_length);
                max_type = max_type.max(id);
                cur_length = 0;
            }
        }
        split.num_blocks = split.types.len();
        split.num_types = max_type as usize + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Histogram;

    fn histo_of(symbols: &[usize]) -> Histogram<64> {
        let mut h = Histogram::new();
        for &s in symbols {
            h.add(s);
        }
        h
    }

    #[test]
    fn test_identical_histograms_merge() {
        let input = vec![
            histo_of(&[1, 1, 2, 3]),
            histo_of(&[1, 1, 2, 3]),
            histo_of(&[1, 2, 1, 3]),
            histo_of(&[40, 41, 42, 43, 40, 41]),
        ];
        let mut out = Vec::new();
        let mut symbols = Vec::new();
        let n = cluster_histograms(&input, 64, &mut out, &mut symbols);
        assert!(n <= 2, "similar histograms should merge, got {}", n);
        assert_eq!(symbols[0], symbols[1]);
        assert_eq!(symbols[1], symbols[2]);
        assert_ne!(symbols[0], symbols[3]);
        // Canonical: ids appear in first-occurrence order.
        assert_eq!(symbols[0], 0);
    }

    #[test]
    fn test_cluster_respects_budget() {
        let input: Vec<Histogram<64>> = (0..10)
            .map(|i| histo_of(&[i, i, i + 1, (i * 7) % 64]))
            .collect();
        let mut out = Vec::new();
        let mut symbols = Vec::new();
        let n = cluster_histograms(&input, 3, &mut out, &mut symbols);
        assert!(n <= 3);
        assert_eq!(out.len(), n);
        for &s in &symbols {
            assert!((s as usize) < n);
        }
    }

    #[test]
    fn test_cluster_blocks_canonical_schedule() {
        // Stream: 200 of symbol 5, 200 of symbol 50, 200 of symbol 5.
        let mut data = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..200 {
            data.push(5u8);
            ids.push(0u8);
        }
        for _ in 0..200 {
            data.push(50u8);
            ids.push(1u8);
        }
        for _ in 0..200 {
            data.push(5u8);
            ids.push(0u8);
        }
        let mut split = BlockSplit::default();
        cluster_blocks::<64, u8>(&data, 3, &ids, &mut split);
        let total: u64 = split.lengths.iter().map(|&l| u64::from(l)).sum();
        assert_eq!(total, 600);
        assert_eq!(split.types[0], 0, "first block type is canonical zero");
        assert_eq!(split.num_blocks, split.types.len());
    }
}
