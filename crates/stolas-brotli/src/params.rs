//! Encoder parameters and the quality-derived tuning constants.

use crate::constants::*;

/// Input type hint; steers context modeling and distance parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// No assumptions about the input.
    #[default]
    Generic = 0,
    /// UTF-8 text.
    Text = 1,
    /// WOFF 2.0 font data.
    Font = 2,
}

/// Distance code parameters of one stream.
#[derive(Debug, Clone, Copy)]
pub struct DistanceParams {
    pub distance_postfix_bits: u32,
    pub num_direct_distance_codes: u32,
    pub alphabet_size: u32,
    pub max_distance: usize,
}

impl DistanceParams {
    pub fn new(npostfix: u32, ndirect: u32, large_window: bool) -> DistanceParams {
        let alphabet_size;
        let max_distance;
        if large_window {
            alphabet_size =
                distance_alphabet_size(npostfix, ndirect, LARGE_MAX_DISTANCE_BITS) as u32;
            // The maximum distance is set so that no distance symbol used can
            // encode a distance larger than MAX_ALLOWED_DISTANCE with all
            // extra bits set.
            const BOUND: [u32; 4] = [0, 4, 12, 36];
            let postfix = 1u32 << npostfix;
            max_distance = if ndirect < BOUND[npostfix as usize] {
                MAX_ALLOWED_DISTANCE - (BOUND[npostfix as usize] - ndirect) as usize
            } else if ndirect >= BOUND[npostfix as usize] + postfix {
                (3usize << 29) - 4 + (ndirect - BOUND[npostfix as usize]) as usize
            } else {
                MAX_ALLOWED_DISTANCE
            };
        } else {
            alphabet_size = distance_alphabet_size(npostfix, ndirect, MAX_DISTANCE_BITS) as u32;
            max_distance = ndirect as usize + (1usize << (MAX_DISTANCE_BITS + npostfix + 2))
                - (1usize << (npostfix + 2));
        }
        DistanceParams {
            distance_postfix_bits: npostfix,
            num_direct_distance_codes: ndirect,
            alphabet_size,
            max_distance,
        }
    }
}

/// Hasher tuning chosen once per stream from (quality, lgwin, size hint).
#[derive(Debug, Clone, Copy, Default)]
pub struct HasherParams {
    pub hasher_type: i32,
    pub bucket_bits: i32,
    pub block_bits: i32,
    pub hash_len: i32,
    pub num_last_distances_to_check: i32,
}

/// Full parameter block of one encoder stream. Immutable once the first
/// byte has been processed.
#[derive(Debug, Clone)]
pub struct EncoderParams {
    pub mode: Mode,
    pub quality: i32,
    pub lgwin: u32,
    pub lgblock: u32,
    pub size_hint: usize,
    pub disable_literal_context_modeling: bool,
    pub large_window: bool,
    pub hasher: HasherParams,
    pub dist: DistanceParams,
}

impl Default for EncoderParams {
    fn default() -> Self {
        EncoderParams {
            mode: Mode::Generic,
            quality: DEFAULT_QUALITY,
            lgwin: DEFAULT_WINDOW,
            lgblock: 0,
            size_hint: 0,
            disable_literal_context_modeling: false,
            large_window: false,
            hasher: HasherParams::default(),
            dist: DistanceParams::new(0, 0, false),
        }
    }
}

pub const DEFAULT_QUALITY: i32 = 11;
pub const DEFAULT_WINDOW: u32 = 22;

pub const FAST_ONE_PASS_COMPRESSION_QUALITY: i32 = 0;
pub const FAST_TWO_PASS_COMPRESSION_QUALITY: i32 = 1;
pub const ZOPFLIFICATION_QUALITY: i32 = 10;
pub const HQ_ZOPFLIFICATION_QUALITY: i32 = 11;

pub const MAX_QUALITY_FOR_STATIC_ENTROPY_CODES: i32 = 2;
pub const MIN_QUALITY_FOR_BLOCK_SPLIT: i32 = 4;
pub const MIN_QUALITY_FOR_NONZERO_DISTANCE_PARAMS: i32 = 4;
pub const MIN_QUALITY_FOR_OPTIMIZE_HISTOGRAMS: i32 = 4;
pub const MIN_QUALITY_FOR_EXTENSIVE_REFERENCE_SEARCH: i32 = 5;
pub const MIN_QUALITY_FOR_CONTEXT_MODELING: i32 = 5;
pub const MIN_QUALITY_FOR_HQ_CONTEXT_MODELING: i32 = 7;
pub const MIN_QUALITY_FOR_HQ_BLOCK_SPLITTING: i32 = 10;

/// If block splitting is off, flush as soon as this many symbols pile up.
pub const MAX_NUM_DELAYED_SYMBOLS: usize = 0x2FFF;

impl EncoderParams {
    /// Clamp quality/lgwin into their legal ranges.
    pub fn sanitize(&mut self) {
        self.quality = self.quality.clamp(MIN_QUALITY, MAX_QUALITY);
        if self.lgwin < MIN_WINDOW_BITS {
            self.lgwin = MIN_WINDOW_BITS;
        }
        let max = if self.large_window {
            LARGE_MAX_WINDOW_BITS
        } else {
            MAX_WINDOW_BITS
        };
        if self.lgwin > max {
            self.lgwin = max;
        }
    }

    /// Returns the log2 of the input block size for these parameters.
    pub fn compute_lgblock(&self) -> u32 {
        let mut lgblock = self.lgblock;
        if self.quality == FAST_ONE_PASS_COMPRESSION_QUALITY
            || self.quality == FAST_TWO_PASS_COMPRESSION_QUALITY
        {
            lgblock = self.lgwin;
        } else if lgblock == 0 {
            lgblock = 16;
            if self.quality >= 9 && self.lgwin > lgblock {
                lgblock = self.lgwin.min(18);
            }
        } else {
            lgblock = lgblock.clamp(MIN_INPUT_BLOCK_BITS, MAX_INPUT_BLOCK_BITS);
        }
        lgblock
    }

    /// Log2 of the encoder ring-buffer size: input block size plus the
    /// window, with room so distant matches stay addressable.
    pub fn compute_rb_bits(&self) -> u32 {
        1 + self.lgwin.max(self.lgblock)
    }

    pub fn max_metablock_size(&self) -> usize {
        1 << self.compute_rb_bits().min(24)
    }

    /// Largest backward reference the window permits.
    pub fn max_backward_limit(&self) -> usize {
        (1usize << self.lgwin) - WINDOW_GAP
    }

    /// How many literals without a match before the sparse-search
    /// heuristics kick in.
    pub fn literal_spree_length_for_sparse_search(&self) -> usize {
        if self.quality < 9 {
            64
        } else {
            512
        }
    }

    /// Copies longer than this are not re-evaluated during optimal parse.
    pub fn max_zopfli_len(&self) -> usize {
        if self.quality <= 10 {
            150
        } else {
            325
        }
    }

    /// Start-position candidates inspected per optimal-parse step.
    pub fn max_zopfli_candidates(&self) -> usize {
        if self.quality <= 10 {
            1
        } else {
            5
        }
    }

    /// Derive the distance parameters for this quality and mode.
    pub fn choose_distance_params(&mut self) {
        let mut npostfix = 0u32;
        let mut ndirect = 0u32;
        if self.quality >= MIN_QUALITY_FOR_NONZERO_DISTANCE_PARAMS {
            if self.mode == Mode::Font {
                npostfix = 1;
                ndirect = 12;
            } else {
                npostfix = self.dist.distance_postfix_bits;
                ndirect = self.dist.num_direct_distance_codes;
            }
            let ndirect_msb = (ndirect >> npostfix) & 0x0F;
            if npostfix > MAX_NPOSTFIX
                || ndirect > MAX_NDIRECT
                || (ndirect_msb << npostfix) != ndirect
            {
                npostfix = 0;
                ndirect = 0;
            }
        }
        self.dist = DistanceParams::new(npostfix, ndirect, self.large_window);
    }

    /// Pick the hasher variant: quickly hashers for the fast qualities,
    /// forgetful chains in the middle, bucketed chains above, and the
    /// binary tree for the optimal parse. Large windows add a rolling
    /// hasher on top.
    pub fn choose_hasher(&mut self) {
        let h = &mut self.hasher;
        if self.quality >= ZOPFLIFICATION_QUALITY {
            h.hasher_type = 10;
        } else if self.quality <= 1 {
            h.hasher_type = if self.quality == 0 { 2 } else { 4 };
            h.bucket_bits = 16;
            h.hash_len = 5;
        } else if self.quality < 5 {
            h.hasher_type = 40 + (self.quality - 2).min(2);
            h.bucket_bits = 15;
            h.num_last_distances_to_check = match self.quality {
                2 => 4,
                3 => 10,
                _ => 16,
            };
        } else {
            h.hasher_type = 5;
            h.block_bits = self.quality - 1;
            h.bucket_bits = if self.quality < 7 { 14 } else { 15 };
            h.num_last_distances_to_check = if self.quality < 7 {
                4
            } else if self.quality < 9 {
                10
            } else {
                16
            };
        }
        if self.lgwin > 24 && h.hasher_type != 10 {
            // Long-range matching over a large window: composite with a
            // rolling hasher.
            h.hasher_type = match h.hasher_type {
                2 | 4 => 55,
                _ => 65,
            };
            if h.hasher_type == 65 {
                h.block_bits = (self.quality - 1).clamp(1, 10);
                h.bucket_bits = 15;
                h.num_last_distances_to_check = if self.quality < 7 {
                    4
                } else if self.quality < 9 {
                    10
                } else {
                    16
                };
            }
        }
    }
}

/// Wraps a 64-bit stream position to the 32-bit ring-buffer domain while
/// preserving the "not a first lap" feature in bit 30+.
pub fn wrap_position(position: u64) -> u32 {
    let mut result = position as u32;
    let gb = position >> 30;
    if gb > 2 {
        // Wrap every 2GiB; the first 3GB are continuous.
        result = (result & ((1 << 30) - 1)) | ((((gb - 1) & 1) as u32 + 1) << 30);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_distance_params() {
        let d = DistanceParams::new(0, 0, false);
        assert_eq!(d.alphabet_size, 64);
        assert_eq!(d.max_distance, (1 << 26) - 4);
    }

    #[test]
    fn test_font_mode_distance_params() {
        let mut p = EncoderParams {
            quality: 10,
            mode: Mode::Font,
            ..Default::default()
        };
        p.choose_distance_params();
        assert_eq!(p.dist.distance_postfix_bits, 1);
        assert_eq!(p.dist.num_direct_distance_codes, 12);
    }

    #[test]
    fn test_invalid_ndirect_resets() {
        let mut p = EncoderParams {
            quality: 10,
            ..Default::default()
        };
        p.dist.distance_postfix_bits = 2;
        p.dist.num_direct_distance_codes = 7; // not a multiple of 1 << npostfix
        p.choose_distance_params();
        assert_eq!(p.dist.distance_postfix_bits, 0);
        assert_eq!(p.dist.num_direct_distance_codes, 0);
    }

    #[test]
    fn test_lgblock_defaults() {
        let mut p = EncoderParams {
            quality: 11,
            lgwin: 22,
            ..Default::default()
        };
        p.sanitize();
        assert_eq!(p.compute_lgblock(), 18);
        p.quality = 5;
        assert_eq!(p.compute_lgblock(), 16);
        p.quality = 0;
        assert_eq!(p.compute_lgblock(), 22);
    }

    #[test]
    fn test_wrap_position_preserves_low_bits() {
        assert_eq!(wrap_position(100), 100);
        assert_eq!(wrap_position(3 << 30) & ((1 << 30) - 1), 0);
        let p = (5u64 << 30) + 1234;
        assert_eq!(wrap_position(p) & ((1 << 30) - 1), 1234);
        assert!(wrap_position(p) >> 30 != 0);
    }

    #[test]
    fn test_hasher_choice_follows_quality() {
        let qualities_and_types = [(0, 2), (1, 4), (2, 40), (3, 41), (4, 42), (5, 5), (9, 5), (10, 10), (11, 10)];
        for (q, t) in qualities_and_types {
            let mut p = EncoderParams {
                quality: q,
                ..Default::default()
            };
            p.sanitize();
            p.choose_hasher();
            assert_eq!(p.hasher.hasher_type, t, "quality {}", q);
        }
    }
}
