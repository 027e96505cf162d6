//! Length and distance prefix-code tables.
//!
//! Insert lengths, copy lengths and block lengths are encoded as a prefix
//! code symbol plus extra bits; the tables here define the symbol ranges
//! and both directions of the mapping. The 704-entry command LUT used by
//! the decoder is derived from the same tables at compile time, so the two
//! halves of the codec can never disagree about the alphabet.

use crate::constants::NUM_DISTANCE_SHORT_CODES;
use crate::fast_log::log2_floor_nonzero;

/// First insert length of each insert-length code.
pub const K_INS_BASE: [u32; 24] = [
    0, 1, 2, 3, 4, 5, 6, 8, 10, 14, 18, 26, 34, 50, 66, 98, 130, 194, 322, 578, 1090, 2114, 6210,
    22594,
];

/// Extra bits of each insert-length code.
pub const K_INS_EXTRA: [u32; 24] = [
    0, 0, 0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 7, 8, 9, 10, 12, 14, 24,
];

/// First copy length of each copy-length code.
pub const K_COPY_BASE: [u32; 24] = [
    2, 3, 4, 5, 6, 7, 8, 9, 10, 12, 14, 18, 22, 30, 38, 54, 70, 102, 134, 198, 326, 582, 1094,
    2118,
];

/// Extra bits of each copy-length code.
pub const K_COPY_EXTRA: [u32; 24] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 7, 8, 9, 10, 24,
];

/// Block-count prefix code: (first count, extra bits) per symbol.
pub const K_BLOCK_LENGTH_PREFIX_CODE: [(u32, u32); 26] = [
    (1, 2),
    (5, 2),
    (9, 2),
    (13, 2),
    (17, 3),
    (25, 3),
    (33, 3),
    (41, 3),
    (49, 4),
    (65, 4),
    (81, 4),
    (97, 4),
    (113, 5),
    (145, 5),
    (177, 5),
    (209, 5),
    (241, 6),
    (305, 6),
    (369, 7),
    (497, 8),
    (753, 9),
    (1265, 10),
    (2289, 11),
    (4337, 12),
    (8433, 13),
    (16625, 24),
];

/// Symbol of the block-count prefix code covering `len`.
pub fn block_length_prefix_code(len: u32) -> usize {
    let mut code: usize = if len >= 177 {
        if len >= 753 {
            20
        } else {
            14
        }
    } else if len >= 41 {
        7
    } else {
        0
    };
    while code < 25 && len >= K_BLOCK_LENGTH_PREFIX_CODE[code + 1].0 {
        code += 1;
    }
    code
}

/// Insert-length code for `insertlen`.
pub fn get_insert_length_code(insertlen: usize) -> u16 {
    if insertlen < 6 {
        insertlen as u16
    } else if insertlen < 130 {
        let nbits = log2_floor_nonzero(insertlen as u64 - 2) - 1;
        ((nbits << 1) as usize + ((insertlen - 2) >> nbits) + 2) as u16
    } else if insertlen < 2114 {
        (log2_floor_nonzero(insertlen as u64 - 66) + 10) as u16
    } else if insertlen < 6210 {
        21
    } else if insertlen < 22594 {
        22
    } else {
        23
    }
}

/// Copy-length code for `copylen >= 2`.
pub fn get_copy_length_code(copylen: usize) -> u16 {
    if copylen < 10 {
        (copylen - 2) as u16
    } else if copylen < 134 {
        let nbits = log2_floor_nonzero(copylen as u64 - 6) - 1;
        ((nbits << 1) as usize + ((copylen - 6) >> nbits) + 4) as u16
    } else if copylen < 2118 {
        (log2_floor_nonzero(copylen as u64 - 70) + 12) as u16
    } else {
        23
    }
}

/// Joins an insert code and a copy code into a command prefix symbol.
pub fn combine_length_codes(inscode: u16, copycode: u16, use_last_distance: bool) -> u16 {
    let bits64 = (copycode & 0x7) | ((inscode & 0x7) << 3);
    if use_last_distance && inscode < 8 && copycode < 16 {
        if copycode < 8 {
            bits64
        } else {
            bits64 | 64
        }
    } else {
        // Cell bases are K * 64 with K in [2, 3, 6, 4, 5, 8, 7, 9, 10];
        // D = K - index - 1 fits two bits, packed into the magic constant.
        let offset = 2 * ((copycode as u32 >> 3) + 3 * (inscode as u32 >> 3));
        let offset = (offset << 5) + 0x40 + ((0x0052_0D40 >> offset) & 0xC0);
        (offset as u16) | bits64
    }
}

/// Command prefix symbol for an (insert length, copy length) pair.
pub fn get_length_code(insertlen: usize, copylen: usize, use_last_distance: bool) -> u16 {
    let inscode = get_insert_length_code(insertlen);
    let copycode = get_copy_length_code(copylen);
    combine_length_codes(inscode, copycode, use_last_distance)
}

/// Encodes an intermediate distance code (short codes and direct codes
/// pass through; larger distances become a bucketed prefix symbol plus
/// extra bits). The returned symbol carries the extra-bit count in its
/// upper 6 bits.
pub fn prefix_encode_copy_distance(
    distance_code: usize,
    num_direct_codes: usize,
    postfix_bits: u32,
) -> (u16, u32) {
    if distance_code < NUM_DISTANCE_SHORT_CODES + num_direct_codes {
        return (distance_code as u16, 0);
    }
    let dist =
        (1usize << (postfix_bits + 2)) + (distance_code - NUM_DISTANCE_SHORT_CODES - num_direct_codes);
    let bucket = (log2_floor_nonzero(dist as u64) - 1) as usize;
    let postfix_mask = (1usize << postfix_bits) - 1;
    let postfix = dist & postfix_mask;
    let prefix = (dist >> bucket) & 1;
    let offset = (2 + prefix) << bucket;
    let nbits = bucket - postfix_bits as usize;
    let code = (nbits << 10)
        | (NUM_DISTANCE_SHORT_CODES
            + num_direct_codes
            + ((2 * (nbits - 1) + prefix) << postfix_bits)
            + postfix);
    ((code as u16), ((dist - offset) >> postfix_bits) as u32)
}

/// One decoded command-symbol description.
#[derive(Debug, Clone, Copy)]
pub struct CmdLutElement {
    pub insert_len_extra_bits: u8,
    pub copy_len_extra_bits: u8,
    /// 0: implicit last distance; -1: distance follows in the stream.
    pub distance_code: i8,
    /// Distance context derived from the copy length.
    pub context: u8,
    pub insert_len_offset: u16,
    pub copy_len_offset: u16,
}

/// Splits a command prefix symbol back into (insert code, copy code,
/// implicit-distance flag). Inverse of `combine_length_codes`.
const fn split_command_symbol(cmd: u16) -> (usize, usize, bool) {
    if cmd < 128 {
        let ins = ((cmd >> 3) & 7) as usize;
        let copy = ((cmd & 7) | ((cmd >> 6) << 3)) as usize;
        (ins, copy, true)
    } else {
        // Inverse permutation of the K table in combine_length_codes.
        let cell = (cmd >> 6) as usize;
        let idx = match cell {
            2 => 0,
            3 => 1,
            4 => 3,
            5 => 4,
            6 => 2,
            7 => 6,
            8 => 5,
            9 => 7,
            _ => 8,
        };
        let ins_hi = idx / 3;
        let copy_hi = idx % 3;
        let ins = (ins_hi << 3) | ((cmd >> 3) & 7) as usize;
        let copy = (copy_hi << 3) | (cmd & 7) as usize;
        (ins, copy, false)
    }
}

const fn build_cmd_lut() -> [CmdLutElement; 704] {
    let mut lut = [CmdLutElement {
        insert_len_extra_bits: 0,
        copy_len_extra_bits: 0,
        distance_code: 0,
        context: 0,
        insert_len_offset: 0,
        copy_len_offset: 0,
    }; 704];
    let mut cmd = 0usize;
    while cmd < 704 {
        let (ins, copy, implicit) = split_command_symbol(cmd as u16);
        let context = if copy > 2 { 3 } else { copy as u8 };
        lut[cmd] = CmdLutElement {
            insert_len_extra_bits: K_INS_EXTRA[ins] as u8,
            copy_len_extra_bits: K_COPY_EXTRA[copy] as u8,
            distance_code: if implicit { 0 } else { -1 },
            context,
            insert_len_offset: K_INS_BASE[ins] as u16,
            copy_len_offset: K_COPY_BASE[copy] as u16,
        };
        cmd += 1;
    }
    lut
}

/// Decoder-side command alphabet description.
pub static CMD_LUT: [CmdLutElement; 704] = build_cmd_lut();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_code_ranges_cover_bases() {
        for (code, &base) in K_INS_BASE.iter().enumerate() {
            assert_eq!(get_insert_length_code(base as usize) as usize, code);
            let top = base + (1 << K_INS_EXTRA[code]) - 1;
            assert_eq!(get_insert_length_code(top as usize) as usize, code);
        }
    }

    #[test]
    fn test_copy_code_ranges_cover_bases() {
        for (code, &base) in K_COPY_BASE.iter().enumerate() {
            assert_eq!(get_copy_length_code(base as usize) as usize, code);
            let top = base.saturating_add((1 << K_COPY_EXTRA[code]) - 1).min(1 << 24);
            assert_eq!(get_copy_length_code(top as usize) as usize, code);
        }
    }

    #[test]
    fn test_combine_round_trips_through_lut() {
        for ins in 0u16..24 {
            for copy in 0u16..24 {
                for &last in &[false, true] {
                    let cmd = combine_length_codes(ins, copy, last);
                    assert!((cmd as usize) < 704);
                    let v = CMD_LUT[cmd as usize];
                    assert_eq!(v.insert_len_offset as u32, K_INS_BASE[ins as usize]);
                    assert_eq!(v.copy_len_offset as u32, K_COPY_BASE[copy as usize]);
                    assert_eq!(v.insert_len_extra_bits as u32, K_INS_EXTRA[ins as usize]);
                    assert_eq!(v.copy_len_extra_bits as u32, K_COPY_EXTRA[copy as usize]);
                    if last && ins < 8 && copy < 16 {
                        assert_eq!(v.distance_code, 0);
                    } else {
                        assert_eq!(v.distance_code, -1);
                    }
                }
            }
        }
    }

    #[test]
    fn test_block_length_prefix_code() {
        assert_eq!(block_length_prefix_code(1), 0);
        assert_eq!(block_length_prefix_code(4), 0);
        assert_eq!(block_length_prefix_code(5), 1);
        assert_eq!(block_length_prefix_code(16624), 24);
        assert_eq!(block_length_prefix_code(16625), 25);
        // Table is contiguous.
        for code in 0..25 {
            let (base, nbits) = K_BLOCK_LENGTH_PREFIX_CODE[code];
            assert_eq!(base + (1 << nbits), K_BLOCK_LENGTH_PREFIX_CODE[code + 1].0);
        }
    }

    #[test]
    fn test_prefix_encode_short_and_direct() {
        let (code, extra) = prefix_encode_copy_distance(3, 0, 0);
        assert_eq!((code, extra), (3, 0));
        let (code, extra) = prefix_encode_copy_distance(17, 4, 0);
        assert_eq!((code, extra), (17, 0));
    }

    #[test]
    fn test_prefix_encode_bucketed() {
        // distance_code 16 (= distance 1) with no direct codes, no postfix:
        // dist = 4 + 0, bucket = 1, prefix = 0, nbits = 1, symbol = 16.
        let (code, extra) = prefix_encode_copy_distance(16, 0, 0);
        assert_eq!(code & 0x3FF, 16);
        assert_eq!(code >> 10, 1);
        assert_eq!(extra, 0);
    }
}
