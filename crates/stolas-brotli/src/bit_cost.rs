//! Entropy and population-cost estimates for histograms.
//!
//! `population_cost` approximates the number of bits it takes to encode a
//! histogram's symbols with a prefix code built for them, including the
//! cost of describing the code itself. It drives block splitting and
//! histogram clustering, so it has shortcuts for the tiny cases that
//! dominate there.

use crate::constants::{CODE_LENGTH_CODES, REPEAT_ZERO_CODE_LENGTH};
use crate::fast_log::fast_log2;
use crate::histogram::Histogram;

/// Shannon entropy of `population` in bits; also returns the total count.
pub fn shannon_entropy(population: &[u32], size: usize) -> (f64, usize) {
    let mut sum: usize = 0;
    let mut retval = 0f64;
    for &p in &population[..size] {
        sum += p as usize;
        retval -= f64::from(p) * fast_log2(u64::from(p));
    }
    if sum != 0 {
        retval += sum as f64 * fast_log2(sum as u64);
    }
    (retval, sum)
}

/// Entropy bounded below by one bit per symbol occurrence.
pub fn bits_entropy(population: &[u32], size: usize) -> f64 {
    let (mut retval, sum) = shannon_entropy(population, size);
    if retval < sum as f64 {
        retval = sum as f64;
    }
    retval
}

const K_ONE_SYMBOL_HISTOGRAM_COST: f64 = 12.0;
const K_TWO_SYMBOL_HISTOGRAM_COST: f64 = 20.0;
const K_THREE_SYMBOL_HISTOGRAM_COST: f64 = 28.0;
const K_FOUR_SYMBOL_HISTOGRAM_COST: f64 = 37.0;

/// Estimated stored size of a prefix code for `histogram`, plus the coded
/// symbols themselves.
pub fn population_cost<const N: usize>(histogram: &Histogram<N>) -> f64 {
    if histogram.total_count == 0 {
        return K_ONE_SYMBOL_HISTOGRAM_COST;
    }

    let mut count = 0;
    let mut s = [0usize; 5];
    for (i, &v) in histogram.data.iter().enumerate() {
        if v > 0 {
            if count < 4 {
                s[count] = i;
            }
            count += 1;
            if count > 4 {
                break;
            }
        }
    }

    match count {
        1 => return K_ONE_SYMBOL_HISTOGRAM_COST,
        2 => return K_TWO_SYMBOL_HISTOGRAM_COST + histogram.total_count as f64,
        3 => {
            let h0 = histogram.data[s[0]];
            let h1 = histogram.data[s[1]];
            let h2 = histogram.data[s[2]];
            let histomax = h0.max(h1).max(h2);
            return K_THREE_SYMBOL_HISTOGRAM_COST
                + 2.0 * (f64::from(h0) + f64::from(h1) + f64::from(h2))
                - f64::from(histomax);
        }
        4 => {
            let mut histo = [0u32; 4];
            for i in 0..4 {
                histo[i] = histogram.data[s[i]];
            }
            histo.sort_unstable_by(|a, b| b.cmp(a));
            let h23 = histo[2] + histo[3];
            let histomax = h23.max(histo[0]);
            return K_FOUR_SYMBOL_HISTOGRAM_COST
                + 3.0 * f64::from(h23)
                + 2.0 * (f64::from(histo[0]) + f64::from(histo[1]))
                - f64::from(histomax);
        }
        _ => {}
    }

    // General case: sum of per-symbol Shannon costs, plus an estimate of
    // the RLE-coded depth vector.
    let mut bits = 0f64;
    let mut max_depth: usize = 1;
    let mut depth_histo = [0u32; CODE_LENGTH_CODES];
    let log2total = fast_log2(histogram.total_count as u64);
    let mut i = 0;
    while i < N {
        if histogram.data[i] > 0 {
            let log2p = log2total - fast_log2(u64::from(histogram.data[i]));
            let mut depth = (log2p + 0.5) as usize;
            bits += f64::from(histogram.data[i]) * log2p;
            if depth > 15 {
                depth = 15;
            }
            if depth > max_depth {
                max_depth = depth;
            }
            depth_histo[depth] += 1;
            i += 1;
        } else {
            // Run of zeros: account for the repeat-zero code-length codes.
            let mut reps: u32 = 1;
            let mut k = i + 1;
            while k < N && histogram.data[k] == 0 {
                reps += 1;
                k += 1;
            }
            i += reps as usize;
            if i == N {
                // No cost for the last zero run.
                break;
            }
            if reps < 3 {
                depth_histo[0] += reps;
            } else {
                reps -= 2;
                while reps > 0 {
                    depth_histo[REPEAT_ZERO_CODE_LENGTH] += 1;
                    bits += 3.0;
                    reps >>= 3;
                }
            }
        }
    }

    // Estimated encoding cost of the code-length code histogram.
    bits += (18 + 2 * max_depth) as f64;
    bits += bits_entropy(&depth_histo, CODE_LENGTH_CODES);
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entropy_uniform() {
        let histo = [16u32; 4];
        let (e, sum) = shannon_entropy(&histo, 4);
        assert_eq!(sum, 64);
        assert!((e - 128.0).abs() < 1e-9, "uniform 4-symbol entropy is 2 bits/symbol");
    }

    #[test]
    fn test_bits_entropy_floor() {
        // A degenerate distribution still pays at least a bit per symbol...
        let histo = [100u32, 1];
        assert!(bits_entropy(&histo, 2) >= 101.0 - 1e-9);
    }

    #[test]
    fn test_population_cost_small_counts() {
        let mut h: Histogram<256> = Histogram::new();
        assert_eq!(population_cost(&h), K_ONE_SYMBOL_HISTOGRAM_COST);
        for _ in 0..10 {
            h.add(42);
        }
        assert_eq!(population_cost(&h), K_ONE_SYMBOL_HISTOGRAM_COST);
        for _ in 0..10 {
            h.add(17);
        }
        assert_eq!(population_cost(&h), K_TWO_SYMBOL_HISTOGRAM_COST + 20.0);
    }

    #[test]
    fn test_population_cost_grows_with_spread() {
        let mut concentrated: Histogram<256> = Histogram::new();
        let mut spread: Histogram<256> = Histogram::new();
        for i in 0..240 {
            concentrated.add(i % 6);
            spread.add(i % 240);
        }
        assert!(population_cost(&concentrated) < population_cost(&spread));
    }
}
