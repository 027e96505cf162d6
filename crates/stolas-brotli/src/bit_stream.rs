//! Meta-block serialisation.
//!
//! Everything here mirrors a decoder state: every field width, ordering
//! and escape matches what `decoder.rs` consumes. The layout of one
//! compressed meta-block is
//!
//! ```text
//! ISLAST [ISEMPTY] MNIBBLES MLEN [ISUNCOMPRESSED]
//! NBLTYPES{L,I,D} (+ block type/length trees, first lengths)
//! NPOSTFIX NDIRECT  context modes  literal & distance context maps
//! literal / command / distance tree groups
//! interleaved commands, literals, extra bits, distances
//! ```

use crate::bit_writer::{jump_to_byte_boundary, write_bits, write_bits_prepare_storage};
use crate::command::Command;
use crate::constants::*;
use crate::context::{get_context, get_context_lut, ContextMode};
use crate::entropy::{
    convert_bit_depths_to_symbols, create_huffman_tree, write_huffman_tree, HuffmanTree,
};
use crate::fast_log::log2_floor_nonzero;
use crate::histogram::{HistogramCommand, HistogramDistance, HistogramLiteral};
use crate::metablock::MetaBlockSplit;
use crate::params::EncoderParams;
use crate::prefix::{
    block_length_prefix_code, get_copy_length_code, get_insert_length_code,
    K_BLOCK_LENGTH_PREFIX_CODE, K_COPY_BASE, K_COPY_EXTRA, K_INS_BASE, K_INS_EXTRA,
};

/// Stores 0..=255 in 1..=11 bits: a zero bit, or a one bit plus a 3-bit
/// exponent and its mantissa.
pub fn store_var_len_uint8(n: usize, pos: &mut usize, storage: &mut [u8]) {
    if n == 0 {
        write_bits(1, 0, pos, storage);
    } else {
        write_bits(1, 1, pos, storage);
        let nbits = log2_floor_nonzero(n as u64);
        write_bits(3, u64::from(nbits), pos, storage);
        write_bits(nbits, (n as u64) - (1u64 << nbits), pos, storage);
    }
}

/// ISLAST, MNIBBLES and MLEN of a compressed meta-block.
pub fn store_compressed_meta_block_header(
    is_last: bool,
    length: usize,
    pos: &mut usize,
    storage: &mut [u8],
) {
    let lenbits = if length == 1 {
        1
    } else {
        log2_floor_nonzero((length - 1) as u64) as usize + 1
    };
    let nibbles = ((lenbits + 3) / 4).max(4);
    debug_assert!(nibbles <= 6);

    write_bits(1, u64::from(is_last), pos, storage);
    if is_last {
        // ISEMPTY
        write_bits(1, 0, pos, storage);
    }
    write_bits(2, (nibbles - 4) as u64, pos, storage);
    write_bits(4 * nibbles as u32, (length - 1) as u64, pos, storage);
    if !is_last {
        // ISUNCOMPRESSED
        write_bits(1, 0, pos, storage);
    }
}

fn store_uncompressed_meta_block_header(length: usize, pos: &mut usize, storage: &mut [u8]) {
    let lenbits = if length == 1 {
        1
    } else {
        log2_floor_nonzero((length - 1) as u64) as usize + 1
    };
    let nibbles = ((lenbits + 3) / 4).max(4);
    write_bits(1, 0, pos, storage); // ISLAST
    write_bits(2, (nibbles - 4) as u64, pos, storage);
    write_bits(4 * nibbles as u32, (length - 1) as u64, pos, storage);
    write_bits(1, 1, pos, storage); // ISUNCOMPRESSED
}

/// The fixed prefix code for the code-length code lengths: value 0 ->
/// '00', 1 -> '0111', 2 -> '011', 3 -> '10', 4 -> '01', 5 -> '1111'.
const K_CODE_LENGTH_SYMBOLS: [u8; 6] = [0, 7, 3, 2, 1, 15];
const K_CODE_LENGTH_BITS: [u8; 6] = [2, 4, 3, 2, 2, 4];

/// Storage order of the code-length code lengths.
pub const K_CODE_LENGTH_ORDER: [usize; 18] =
    [1, 2, 3, 4, 0, 5, 17, 6, 16, 7, 8, 9, 10, 11, 12, 13, 14, 15];

fn store_huffman_tree_of_huffman_tree(
    num_codes: usize,
    code_length_bitdepth: &[u8],
    pos: &mut usize,
    storage: &mut [u8],
) {
    let mut codes_to_store = CODE_LENGTH_CODES;
    if num_codes > 1 {
        while codes_to_store > 0 {
            if code_length_bitdepth[K_CODE_LENGTH_ORDER[codes_to_store - 1]] != 0 {
                break;
            }
            codes_to_store -= 1;
        }
    }
    let mut skip_some = 0usize;
    if code_length_bitdepth[K_CODE_LENGTH_ORDER[0]] == 0
        && code_length_bitdepth[K_CODE_LENGTH_ORDER[1]] == 0
    {
        skip_some = 2;
        if code_length_bitdepth[K_CODE_LENGTH_ORDER[2]] == 0 {
            skip_some = 3;
        }
    }
    write_bits(2, skip_some as u64, pos, storage);
    for i in skip_some..codes_to_store {
        let l = code_length_bitdepth[K_CODE_LENGTH_ORDER[i]] as usize;
        write_bits(
            u32::from(K_CODE_LENGTH_BITS[l]),
            u64::from(K_CODE_LENGTH_SYMBOLS[l]),
            pos,
            storage,
        );
    }
}

fn store_huffman_tree_to_bit_mask(
    huffman_tree: &[u8],
    huffman_tree_extra_bits: &[u8],
    code_length_bitdepth: &[u8],
    code_length_bitdepth_symbols: &[u16],
    pos: &mut usize,
    storage: &mut [u8],
) {
    for (i, &ix) in huffman_tree.iter().enumerate() {
        let ix = ix as usize;
        write_bits(
            u32::from(code_length_bitdepth[ix]),
            u64::from(code_length_bitdepth_symbols[ix]),
            pos,
            storage,
        );
        // Extra bits
        match ix {
            REPEAT_PREVIOUS_CODE_LENGTH => {
                write_bits(2, u64::from(huffman_tree_extra_bits[i]), pos, storage);
            }
            REPEAT_ZERO_CODE_LENGTH => {
                write_bits(3, u64::from(huffman_tree_extra_bits[i]), pos, storage);
            }
            _ => {}
        }
    }
}

fn store_simple_huffman_tree(
    depths: &[u8],
    symbols: &mut [usize],
    num_symbols: usize,
    max_bits: u32,
    pos: &mut usize,
    storage: &mut [u8],
) {
    // A value of 1 marks a simple prefix code.
    write_bits(2, 1, pos, storage);
    write_bits(2, (num_symbols - 1) as u64, pos, storage);
    for i in 0..num_symbols {
        for j in i + 1..num_symbols {
            if depths[symbols[j]] < depths[symbols[i]] {
                symbols.swap(i, j);
            }
        }
    }
    match num_symbols {
        2 => {
            write_bits(max_bits, symbols[0] as u64, pos, storage);
            write_bits(max_bits, symbols[1] as u64, pos, storage);
        }
        3 => {
            write_bits(max_bits, symbols[0] as u64, pos, storage);
            write_bits(max_bits, symbols[1] as u64, pos, storage);
            write_bits(max_bits, symbols[2] as u64, pos, storage);
        }
        _ => {
            write_bits(max_bits, symbols[0] as u64, pos, storage);
            write_bits(max_bits, symbols[1] as u64, pos, storage);
            write_bits(max_bits, symbols[2] as u64, pos, storage);
            write_bits(max_bits, symbols[3] as u64, pos, storage);
            // tree-select: deep shape iff the first symbol has depth 1.
            write_bits(1, u64::from(depths[symbols[0]] == 1), pos, storage);
        }
    }
}

/// Stores a complex tree: the depth vector RLE-coded, itself coded with
/// the code-length code.
pub fn store_huffman_tree(depths: &[u8], num: usize, tree: &mut Vec<HuffmanTree>, pos: &mut usize, storage: &mut [u8]) {
    debug_assert!(num <= NUM_COMMAND_SYMBOLS);
    let mut huffman_tree = vec![0u8; num];
    let mut huffman_tree_extra_bits = vec![0u8; num];
    let mut huffman_tree_size = 0usize;
    write_huffman_tree(
        depths,
        num,
        &mut huffman_tree_size,
        &mut huffman_tree,
        &mut huffman_tree_extra_bits,
    );

    let mut huffman_tree_histogram = [0u32; CODE_LENGTH_CODES];
    for &v in &huffman_tree[..huffman_tree_size] {
        huffman_tree_histogram[v as usize] += 1;
    }
    let mut num_codes = 0usize;
    let mut code = 0usize;
    for (i, &h) in huffman_tree_histogram.iter().enumerate() {
        if h != 0 {
            if num_codes == 0 {
                code = i;
                num_codes = 1;
            } else {
                num_codes = 2;
                break;
            }
        }
    }

    let mut code_length_bitdepth = [0u8; CODE_LENGTH_CODES];
    let mut code_length_bitdepth_symbols = [0u16; CODE_LENGTH_CODES];
    create_huffman_tree(
        &huffman_tree_histogram,
        CODE_LENGTH_CODES,
        5,
        tree,
        &mut code_length_bitdepth,
    );
    convert_bit_depths_to_symbols(
        &code_length_bitdepth,
        CODE_LENGTH_CODES,
        &mut code_length_bitdepth_symbols,
    );
    store_huffman_tree_of_huffman_tree(num_codes, &code_length_bitdepth, pos, storage);
    if num_codes == 1 {
        code_length_bitdepth[code] = 0;
    }
    store_huffman_tree_to_bit_mask(
        &huffman_tree[..huffman_tree_size],
        &huffman_tree_extra_bits[..huffman_tree_size],
        &code_length_bitdepth,
        &code_length_bitdepth_symbols,
        pos,
        storage,
    );
}

/// Builds a code for `histogram` and stores its description; fills
/// `depth`/`bits` for the data pass.
pub fn build_and_store_huffman_tree(
    histogram: &[u32],
    histogram_length: usize,
    alphabet_size: usize,
    tree: &mut Vec<HuffmanTree>,
    depth: &mut [u8],
    bits: &mut [u16],
    pos: &mut usize,
    storage: &mut [u8],
) {
    let mut count = 0usize;
    let mut s4 = [0usize; 4];
    for (i, &h) in histogram[..histogram_length].iter().enumerate() {
        if h != 0 {
            if count < 4 {
                s4[count] = i;
            } else if count > 4 {
                break;
            }
            count += 1;
        }
    }
    let max_bits = {
        let mut max_bits_counter = alphabet_size - 1;
        let mut max_bits = 0u32;
        while max_bits_counter != 0 {
            max_bits_counter >>= 1;
            max_bits += 1;
        }
        max_bits
    };

    if count <= 1 {
        // A single symbol: a simple code with one symbol.
        write_bits(4, 1, pos, storage);
        write_bits(max_bits, s4[0] as u64, pos, storage);
        depth[s4[0]] = 0;
        bits[s4[0]] = 0;
        return;
    }

    for d in depth[..histogram_length].iter_mut() {
        *d = 0;
    }
    create_huffman_tree(histogram, histogram_length, 15, tree, depth);
    convert_bit_depths_to_symbols(depth, histogram_length, bits);

    if count <= 4 {
        store_simple_huffman_tree(depth, &mut s4, count, max_bits, pos, storage);
    } else {
        store_huffman_tree(depth, histogram_length, tree, pos, storage);
    }
}

/// Block-type codes use a two-slot MRU: 0 means "second to last", 1 means
/// "last plus one", otherwise the type plus two.
#[derive(Debug, Clone, Copy)]
struct BlockTypeCodeCalculator {
    last_type: usize,
    second_last_type: usize,
}

impl BlockTypeCodeCalculator {
    fn new() -> Self {
        BlockTypeCodeCalculator {
            last_type: 1,
            second_last_type: 0,
        }
    }

    fn next_code(&mut self, block_type: u8) -> usize {
        let t = block_type as usize;
        let type_code = if t == self.last_type + 1 {
            1
        } else if t == self.second_last_type {
            0
        } else {
            t + 2
        };
        self.second_last_type = self.last_type;
        self.last_type = t;
        type_code
    }
}

/// The stored prefix codes for one category's block switches.
struct BlockSplitCode {
    type_code_calculator: BlockTypeCodeCalculator,
    type_depths: [u8; MAX_NUMBER_OF_BLOCK_TYPES + 2],
    type_bits: [u16; MAX_NUMBER_OF_BLOCK_TYPES + 2],
    length_depths: [u8; NUM_BLOCK_LEN_SYMBOLS],
    length_bits: [u16; NUM_BLOCK_LEN_SYMBOLS],
}

impl BlockSplitCode {
    fn new() -> Self {
        BlockSplitCode {
            type_code_calculator: BlockTypeCodeCalculator::new(),
            type_depths: [0; MAX_NUMBER_OF_BLOCK_TYPES + 2],
            type_bits: [0; MAX_NUMBER_OF_BLOCK_TYPES + 2],
            length_depths: [0; NUM_BLOCK_LEN_SYMBOLS],
            length_bits: [0; NUM_BLOCK_LEN_SYMBOLS],
        }
    }
}

/// Stores one block switch: the type code (skipped for the first block)
/// and the length code plus extra bits.
fn store_block_switch(
    code: &mut BlockSplitCode,
    block_len: u32,
    block_type: u8,
    is_first_block: bool,
    pos: &mut usize,
    storage: &mut [u8],
) {
    let typecode = code.type_code_calculator.next_code(block_type);
    if !is_first_block {
        write_bits(
            u32::from(code.type_depths[typecode]),
            u64::from(code.type_bits[typecode]),
            pos,
            storage,
        );
    }
    let lencode = block_length_prefix_code(block_len);
    let (len_offset, len_nextra) = K_BLOCK_LENGTH_PREFIX_CODE[lencode];
    write_bits(
        u32::from(code.length_depths[lencode]),
        u64::from(code.length_bits[lencode]),
        pos,
        storage,
    );
    write_bits(len_nextra, u64::from(block_len - len_offset), pos, storage);
}

/// Stores NBLTYPES and, for multi-type categories, the type/length trees
/// and the first block length.
fn build_and_store_block_split_code(
    types: &[u8],
    lengths: &[u32],
    num_types: usize,
    tree: &mut Vec<HuffmanTree>,
    code: &mut BlockSplitCode,
    pos: &mut usize,
    storage: &mut [u8],
) {
    let num_blocks = types.len();
    let mut type_histo = [0u32; MAX_NUMBER_OF_BLOCK_TYPES + 2];
    let mut length_histo = [0u32; NUM_BLOCK_LEN_SYMBOLS];
    let mut type_code_calculator = BlockTypeCodeCalculator::new();
    for i in 0..num_blocks {
        let type_code = type_code_calculator.next_code(types[i]);
        if i != 0 {
            type_histo[type_code] += 1;
        }
        length_histo[block_length_prefix_code(lengths[i])] += 1;
    }
    store_var_len_uint8(num_types - 1, pos, storage);
    if num_types > 1 {
        build_and_store_huffman_tree(
            &type_histo,
            num_types + 2,
            num_types + 2,
            tree,
            &mut code.type_depths,
            &mut code.type_bits,
            pos,
            storage,
        );
        build_and_store_huffman_tree(
            &length_histo,
            NUM_BLOCK_LEN_SYMBOLS,
            NUM_BLOCK_LEN_SYMBOLS,
            tree,
            &mut code.length_depths,
            &mut code.length_bits,
            pos,
            storage,
        );
        store_block_switch(code, lengths[0], types[0], true, pos, storage);
    }
}

fn move_to_front_transform(v_in: &[u32], v_out: &mut [u32]) {
    let mut mtf = [0u8; 256];
    let max_value = v_in.iter().copied().max().unwrap_or(0);
    debug_assert!(max_value < 256);
    for (i, m) in mtf.iter_mut().enumerate().take(max_value as usize + 1) {
        *m = i as u8;
    }
    for (i, &val) in v_in.iter().enumerate() {
        let mut index = 0usize;
        while mtf[index] as u32 != val {
            index += 1;
        }
        v_out[i] = index as u32;
        let value = mtf[index];
        while index != 0 {
            mtf[index] = mtf[index - 1];
            index -= 1;
        }
        mtf[0] = value;
    }
}

const SYMBOL_BITS: u32 = 9;

/// Run-length encodes zero runs: symbol `p` in 1..=max_prefix means a run
/// of `(1 << p) + extra` zeros; nonzero values are shifted up by
/// `max_prefix`.
fn run_length_code_zeros(
    v: &mut Vec<u32>,
    max_run_length_prefix: &mut u32,
) {
    let in_size = v.len();
    let mut max_reps = 0u32;
    let mut i = 0usize;
    while i < in_size {
        while i < in_size && v[i] != 0 {
            i += 1;
        }
        let mut reps = 0u32;
        while i < in_size && v[i] == 0 {
            reps += 1;
            i += 1;
        }
        max_reps = max_reps.max(reps);
    }
    let mut max_prefix = if max_reps > 0 {
        log2_floor_nonzero(u64::from(max_reps))
    } else {
        0
    };
    max_prefix = max_prefix.min(*max_run_length_prefix);
    *max_run_length_prefix = max_prefix;

    let mut out: Vec<u32> = Vec::with_capacity(in_size);
    let mut i = 0usize;
    while i < in_size {
        if v[i] != 0 {
            out.push(v[i] + *max_run_length_prefix);
            i += 1;
        } else {
            let mut reps = 1u32;
            let mut k = i + 1;
            while k < in_size && v[k] == 0 {
                reps += 1;
                k += 1;
            }
            i += reps as usize;
            while reps != 0 {
                if reps < 2u32 << max_prefix {
                    let run_length_prefix = log2_floor_nonzero(u64::from(reps));
                    let extra_bits = reps - (1 << run_length_prefix);
                    out.push(run_length_prefix + (extra_bits << SYMBOL_BITS));
                    break;
                } else {
                    let extra_bits = (1 << max_prefix) - 1;
                    out.push(max_prefix + (extra_bits << SYMBOL_BITS));
                    reps -= (2 << max_prefix) - 1;
                }
            }
        }
    }
    *v = out;
}

/// Stores a context map: NTREES, the RLE escape, the symbol tree, the
/// MTF+RLE-coded map, and the IMTF bit.
pub fn encode_context_map(
    context_map: &[u32],
    num_clusters: usize,
    tree: &mut Vec<HuffmanTree>,
    pos: &mut usize,
    storage: &mut [u8],
) {
    store_var_len_uint8(num_clusters - 1, pos, storage);
    if num_clusters == 1 {
        return;
    }

    let mut rle_symbols = vec![0u32; context_map.len()];
    move_to_front_transform(context_map, &mut rle_symbols);
    let mut max_run_length_prefix = 6u32;
    run_length_code_zeros(&mut rle_symbols, &mut max_run_length_prefix);

    let mut histogram = vec![0u32; MAX_NUMBER_OF_BLOCK_TYPES + 6];
    for &s in &rle_symbols {
        histogram[(s & ((1 << SYMBOL_BITS) - 1)) as usize] += 1;
    }
    let use_rle = max_run_length_prefix > 0;
    write_bits(1, u64::from(use_rle), pos, storage);
    if use_rle {
        write_bits(4, u64::from(max_run_length_prefix - 1), pos, storage);
    }
    let alphabet = num_clusters + max_run_length_prefix as usize;
    let mut depths = vec![0u8; alphabet];
    let mut bits = vec![0u16; alphabet];
    build_and_store_huffman_tree(&histogram, alphabet, alphabet, tree, &mut depths, &mut bits, pos, storage);
    for &s in &rle_symbols {
        let rle_symbol = (s & ((1 << SYMBOL_BITS) - 1)) as usize;
        let extra_bits_val = s >> SYMBOL_BITS;
        write_bits(u32::from(depths[rle_symbol]), u64::from(bits[rle_symbol]), pos, storage);
        if rle_symbol > 0 && rle_symbol <= max_run_length_prefix as usize {
            write_bits(rle_symbol as u32, u64::from(extra_bits_val), pos, storage);
        }
    }
    // IMTF bit: the map was MTF-coded.
    write_bits(1, 1, pos, storage);
}

/// Writes symbols of one category, switching blocks as lengths expire.
struct BlockEncoder<'a> {
    histogram_length: usize,
    num_block_types: usize,
    block_types: &'a [u8],
    block_lengths: &'a [u32],
    block_split_code: BlockSplitCode,
    block_ix: usize,
    block_len: usize,
    entropy_ix: usize,
    depths: Vec<u8>,
    bits: Vec<u16>,
}

impl<'a> BlockEncoder<'a> {
    fn new(histogram_length: usize, num_block_types: usize, block_types: &'a [u8], block_lengths: &'a [u32]) -> Self {
        BlockEncoder {
            histogram_length,
            num_block_types,
            block_types,
            block_lengths,
            block_split_code: BlockSplitCode::new(),
            block_ix: 0,
            block_len: if block_lengths.is_empty() {
                0
            } else {
                block_lengths[0] as usize
            },
            entropy_ix: 0,
            depths: Vec::new(),
            bits: Vec::new(),
        }
    }

    fn build_and_store_block_switch_entropy_codes(
        &mut self,
        tree: &mut Vec<HuffmanTree>,
        pos: &mut usize,
        storage: &mut [u8],
    ) {
        build_and_store_block_split_code(
            self.block_types,
            self.block_lengths,
            self.num_block_types,
            tree,
            &mut self.block_split_code,
            pos,
            storage,
        );
    }

    /// Stores the next symbol with the entropy code of the current block
    /// type; performs block switches as necessary.
    fn store_symbol(&mut self, symbol: usize, pos: &mut usize, storage: &mut [u8]) {
        if self.block_len == 0 {
            self.block_ix += 1;
            let block_len = self.block_lengths[self.block_ix];
            let block_type = self.block_types[self.block_ix];
            self.block_len = block_len as usize;
            self.entropy_ix = block_type as usize * self.histogram_length;
            store_block_switch(&mut self.block_split_code, block_len, block_type, false, pos, storage);
        }
        self.block_len -= 1;
        let ix = self.entropy_ix + symbol;
        write_bits(u32::from(self.depths[ix]), u64::from(self.bits[ix]), pos, storage);
    }

    /// Same, but the entropy code is looked up through a context map.
    #[allow(clippy::too_many_arguments)]
    fn store_symbol_with_context(
        &mut self,
        symbol: usize,
        context: usize,
        context_map: &[u32],
        pos: &mut usize,
        storage: &mut [u8],
        context_bits: usize,
    ) {
        if self.block_len == 0 {
            self.block_ix += 1;
            let block_len = self.block_lengths[self.block_ix];
            let block_type = self.block_types[self.block_ix];
            self.block_len = block_len as usize;
            self.entropy_ix = (block_type as usize) << context_bits;
            store_block_switch(&mut self.block_split_code, block_len, block_type, false, pos, storage);
        }
        self.block_len -= 1;
        let histo_ix = context_map[self.entropy_ix + context] as usize;
        let ix = histo_ix * self.histogram_length + symbol;
        write_bits(u32::from(self.depths[ix]), u64::from(self.bits[ix]), pos, storage);
    }

    fn build_and_store_entropy_codes<const N: usize>(
        &mut self,
        histograms: &[crate::histogram::Histogram<N>],
        alphabet_size: usize,
        tree: &mut Vec<HuffmanTree>,
        pos: &mut usize,
        storage: &mut [u8],
    ) {
        let table_size = histograms.len() * self.histogram_length;
        self.depths = vec![0u8; table_size];
        self.bits = vec![0u16; table_size];
        for (i, histogram) in histograms.iter().enumerate() {
            let ix = i * self.histogram_length;
            build_and_store_huffman_tree(
                &histogram.data,
                self.histogram_length,
                alphabet_size,
                tree,
                &mut self.depths[ix..ix + self.histogram_length],
                &mut self.bits[ix..ix + self.histogram_length],
                pos,
                storage,
            );
        }
    }
}

fn store_command_extra(cmd: &Command, pos: &mut usize, storage: &mut [u8]) {
    let copylen_code = cmd.copy_len_code() as usize;
    let inscode = get_insert_length_code(cmd.insert_len as usize) as usize;
    let copycode = get_copy_length_code(copylen_code) as usize;
    let insnumextra = K_INS_EXTRA[inscode];
    let insextraval = cmd.insert_len as u64 - u64::from(K_INS_BASE[inscode]);
    let copyextraval = copylen_code as u64 - u64::from(K_COPY_BASE[copycode]);
    let bits = (copyextraval << insnumextra) | insextraval;
    write_bits(insnumextra + K_COPY_EXTRA[copycode], bits, pos, storage);
}

/// Stores the interleaved command/literal/distance symbol stream.
#[allow(clippy::too_many_arguments)]
fn store_data_with_huffman_codes(
    input: &[u8],
    start_pos: usize,
    mask: usize,
    mut prev_byte: u8,
    mut prev_byte2: u8,
    commands: &[Command],
    mb: &MetaBlockSplit,
    literal_context_lut: &[u8; 512],
    literal_enc: &mut BlockEncoder,
    command_enc: &mut BlockEncoder,
    distance_enc: &mut BlockEncoder,
    pos_out: &mut usize,
    storage: &mut [u8],
) {
    let mut pos = start_pos;
    for cmd in commands {
        let cmd_code = cmd.cmd_prefix as usize;
        command_enc.store_symbol(cmd_code, pos_out, storage);
        store_command_extra(cmd, pos_out, storage);
        for _ in 0..cmd.insert_len {
            let context = get_context(prev_byte, prev_byte2, literal_context_lut) as usize;
            let literal = input[pos & mask];
            literal_enc.store_symbol_with_context(
                literal as usize,
                context,
                &mb.literal_context_map,
                pos_out,
                storage,
                LITERAL_CONTEXT_BITS,
            );
            prev_byte2 = prev_byte;
            prev_byte = literal;
            pos += 1;
        }
        pos += cmd.copy_len() as usize;
        if cmd.copy_len() != 0 {
            prev_byte2 = input[(pos - 2) & mask];
            prev_byte = input[(pos - 1) & mask];
            if cmd.has_distance() {
                let dist_code = (cmd.dist_prefix & 0x3FF) as usize;
                let distnumextra = u32::from(cmd.dist_prefix) >> 10;
                let distextra = u64::from(cmd.dist_extra);
                let context = cmd.distance_context() as usize;
                distance_enc.store_symbol_with_context(
                    dist_code,
                    context,
                    &mb.distance_context_map,
                    pos_out,
                    storage,
                    DISTANCE_CONTEXT_BITS,
                );
                write_bits(distnumextra, distextra, pos_out, storage);
            }
        }
    }
}

/// Stores a complete compressed meta-block with block splitting, context
/// maps and clustered entropy codes.
#[allow(clippy::too_many_arguments)]
pub fn store_meta_block(
    input: &[u8],
    start_pos: usize,
    length: usize,
    mask: usize,
    prev_byte: u8,
    prev_byte2: u8,
    is_last: bool,
    params: &EncoderParams,
    literal_context_mode: ContextMode,
    commands: &[Command],
    mb: &MetaBlockSplit,
    pos: &mut usize,
    storage: &mut [u8],
) {
    let num_distance_symbols = params.dist.alphabet_size as usize;
    // The effective distance symbols fit the histogram size even in
    // large-window mode; the stored alphabet keeps the full size.
    let num_effective_distance_symbols = num_distance_symbols.min(NUM_DISTANCE_SYMBOLS);
    let mut tree: Vec<HuffmanTree> = Vec::new();
    let literal_context_lut = get_context_lut(literal_context_mode);

    store_compressed_meta_block_header(is_last, length, pos, storage);

    let mut literal_enc = BlockEncoder::new(
        NUM_LITERAL_SYMBOLS,
        mb.literal_split.num_types,
        &mb.literal_split.types,
        &mb.literal_split.lengths,
    );
    let mut command_enc = BlockEncoder::new(
        NUM_COMMAND_SYMBOLS,
        mb.command_split.num_types,
        &mb.command_split.types,
        &mb.command_split.lengths,
    );
    let mut distance_enc = BlockEncoder::new(
        num_effective_distance_symbols,
        mb.distance_split.num_types,
        &mb.distance_split.types,
        &mb.distance_split.lengths,
    );

    literal_enc.build_and_store_block_switch_entropy_codes(&mut tree, pos, storage);
    command_enc.build_and_store_block_switch_entropy_codes(&mut tree, pos, storage);
    distance_enc.build_and_store_block_switch_entropy_codes(&mut tree, pos, storage);

    write_bits(2, u64::from(params.dist.distance_postfix_bits), pos, storage);
    write_bits(
        4,
        u64::from(params.dist.num_direct_distance_codes >> params.dist.distance_postfix_bits),
        pos,
        storage,
    );
    for _ in 0..mb.literal_split.num_types {
        write_bits(2, literal_context_mode as u64, pos, storage);
    }

    encode_context_map(&mb.literal_context_map, mb.literal_histograms.len(), &mut tree, pos, storage);
    encode_context_map(&mb.distance_context_map, mb.distance_histograms.len(), &mut tree, pos, storage);

    literal_enc.build_and_store_entropy_codes(&mb.literal_histograms, NUM_LITERAL_SYMBOLS, &mut tree, pos, storage);
    command_enc.build_and_store_entropy_codes(&mb.command_histograms, NUM_COMMAND_SYMBOLS, &mut tree, pos, storage);
    distance_enc.build_and_store_entropy_codes(&mb.distance_histograms, num_distance_symbols, &mut tree, pos, storage);

    store_data_with_huffman_codes(
        input,
        start_pos,
        mask,
        prev_byte,
        prev_byte2,
        commands,
        mb,
        literal_context_lut,
        &mut literal_enc,
        &mut command_enc,
        &mut distance_enc,
        pos,
        storage,
    );

    if is_last {
        jump_to_byte_boundary(pos, storage);
    }
}

fn build_plain_histograms(
    input: &[u8],
    start_pos: usize,
    mask: usize,
    commands: &[Command],
) -> (HistogramLiteral, HistogramCommand, HistogramDistance) {
    let mut lit = HistogramLiteral::new();
    let mut cmd = HistogramCommand::new();
    let mut dist = HistogramDistance::new();
    let mut pos = start_pos;
    for c in commands {
        cmd.add(c.cmd_prefix as usize);
        for _ in 0..c.insert_len {
            lit.add(input[pos & mask] as usize);
            pos += 1;
        }
        pos += c.copy_len() as usize;
        if c.copy_len() != 0 && c.has_distance() {
            dist.add((c.dist_prefix & 0x3FF) as usize);
        }
    }
    (lit, cmd, dist)
}

/// Stores a meta-block with a single block type per category, one literal
/// tree, one command tree and one distance tree.
#[allow(clippy::too_many_arguments)]
pub fn store_meta_block_trivial(
    input: &[u8],
    start_pos: usize,
    length: usize,
    mask: usize,
    is_last: bool,
    params: &EncoderParams,
    commands: &[Command],
    pos: &mut usize,
    storage: &mut [u8],
) {
    let (lit_histo, cmd_histo, dist_histo) = build_plain_histograms(input, start_pos, mask, commands);
    let num_distance_symbols = params.dist.alphabet_size as usize;
    let mut tree: Vec<HuffmanTree> = Vec::new();

    store_compressed_meta_block_header(is_last, length, pos, storage);

    // NBLTYPESL = NBLTYPESI = NBLTYPESD = 1, NPOSTFIX = 0, NDIRECT = 0,
    // one LSB6 context mode, both context maps trivial.
    write_bits(13, 0, pos, storage);

    let mut lit_depth = [0u8; NUM_LITERAL_SYMBOLS];
    let mut lit_bits = [0u16; NUM_LITERAL_SYMBOLS];
    let mut cmd_depth = vec![0u8; NUM_COMMAND_SYMBOLS];
    let mut cmd_bits = vec![0u16; NUM_COMMAND_SYMBOLS];
    let mut dist_depth = vec![0u8; num_distance_symbols];
    let mut dist_bits = vec![0u16; num_distance_symbols];

    build_and_store_huffman_tree(
        &lit_histo.data,
        NUM_LITERAL_SYMBOLS,
        NUM_LITERAL_SYMBOLS,
        &mut tree,
        &mut lit_depth,
        &mut lit_bits,
        pos,
        storage,
    );
    build_and_store_huffman_tree(
        &cmd_histo.data,
        NUM_COMMAND_SYMBOLS,
        NUM_COMMAND_SYMBOLS,
        &mut tree,
        &mut cmd_depth,
        &mut cmd_bits,
        pos,
        storage,
    );
    build_and_store_huffman_tree(
        &dist_histo.data[..num_distance_symbols.min(NUM_DISTANCE_SYMBOLS)],
        num_distance_symbols.min(NUM_DISTANCE_SYMBOLS),
        num_distance_symbols,
        &mut tree,
        &mut dist_depth,
        &mut dist_bits,
        pos,
        storage,
    );

    // Data.
    let mut p = start_pos;
    for cmd in commands {
        let code = cmd.cmd_prefix as usize;
        write_bits(u32::from(cmd_depth[code]), u64::from(cmd_bits[code]), pos, storage);
        store_command_extra(cmd, pos, storage);
        for _ in 0..cmd.insert_len {
            let literal = input[p & mask] as usize;
            write_bits(u32::from(lit_depth[literal]), u64::from(lit_bits[literal]), pos, storage);
            p += 1;
        }
        p += cmd.copy_len() as usize;
        if cmd.copy_len() != 0 && cmd.has_distance() {
            let dist_code = (cmd.dist_prefix & 0x3FF) as usize;
            let distnumextra = u32::from(cmd.dist_prefix) >> 10;
            write_bits(u32::from(dist_depth[dist_code]), u64::from(dist_bits[dist_code]), pos, storage);
            write_bits(distnumextra, u64::from(cmd.dist_extra), pos, storage);
        }
    }

    if is_last {
        jump_to_byte_boundary(pos, storage);
    }
}

/// Stores a meta-block as raw bytes.
pub fn store_uncompressed_meta_block(
    is_final_block: bool,
    input: &[u8],
    position: usize,
    mask: usize,
    mut len: usize,
    pos: &mut usize,
    storage: &mut [u8],
) {
    let mut masked_pos = position & mask;
    store_uncompressed_meta_block_header(len, pos, storage);
    jump_to_byte_boundary(pos, storage);

    if masked_pos + len > mask + 1 {
        let len1 = mask + 1 - masked_pos;
        storage[*pos >> 3..(*pos >> 3) + len1].copy_from_slice(&input[masked_pos..masked_pos + len1]);
        *pos += len1 << 3;
        len -= len1;
        masked_pos = 0;
    }
    storage[*pos >> 3..(*pos >> 3) + len].copy_from_slice(&input[masked_pos..masked_pos + len]);
    *pos += len << 3;

    // Prepare the byte so following bit writes OR into clean storage.
    write_bits_prepare_storage(*pos, storage);

    // An empty final meta-block closes the stream after raw bytes.
    if is_final_block {
        write_bits(1, 1, pos, storage); // ISLAST
        write_bits(1, 1, pos, storage); // ISEMPTY
        jump_to_byte_boundary(pos, storage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_reader::BitReader;

    #[test]
    fn test_var_len_uint8_widths() {
        // Matches the decoder's 1/4/(4+n) bit consumption.
        for (n, expected_bits) in [(0usize, 1usize), (1, 4), (2, 5), (3, 5), (128, 11), (255, 11)] {
            let mut storage = vec![0u8; 16];
            let mut pos = 0usize;
            store_var_len_uint8(n, &mut pos, &mut storage);
            assert_eq!(pos, expected_bits, "value {}", n);
        }
    }

    #[test]
    fn test_var_len_uint8_roundtrip() {
        for n in 0usize..=255 {
            let mut storage = vec![0u8; 16];
            let mut pos = 0usize;
            store_var_len_uint8(n, &mut pos, &mut storage);
            // Decode as the decoder does.
            let input = &storage[..8];
            let mut br = BitReader::new();
            br.warmup(input);
            let mut bit = 0u32;
            br.safe_read_bits(input, 1, &mut bit);
            let decoded = if bit == 0 {
                0
            } else {
                let mut nbits = 0u32;
                br.safe_read_bits(input, 3, &mut nbits);
                if nbits == 0 {
                    1
                } else {
                    let mut rest = 0u32;
                    br.safe_read_bits(input, nbits, &mut rest);
                    (1usize << nbits) + rest as usize
                }
            };
            assert_eq!(decoded, n);
        }
    }

    #[test]
    fn test_meta_block_header_nibbles() {
        // 65536 bytes fit in 4 nibbles, 65537 needs 5.
        let mut storage = vec![0u8; 32];
        let mut pos = 0usize;
        store_compressed_meta_block_header(false, 1 << 16, &mut pos, &mut storage);
        assert_eq!(pos, 1 + 2 + 16 + 1);

        let mut pos2 = 0usize;
        let mut storage2 = vec![0u8; 32];
        store_compressed_meta_block_header(false, (1 << 16) + 1, &mut pos2, &mut storage2);
        assert_eq!(pos2, 1 + 2 + 20 + 1);
    }

    #[test]
    fn test_run_length_code_zeros() {
        let mut v = vec![0u32, 0, 0, 0, 0, 0, 0, 0, 2, 1, 0];
        let mut max_prefix = 6u32;
        run_length_code_zeros(&mut v, &mut max_prefix);
        assert_eq!(max_prefix, 3);
        // First entry encodes an 8-run: prefix 3, extra 0.
        assert_eq!(v[0] & 0x1FF, 3);
        assert_eq!(v[0] >> 9, 0);
        // Nonzero symbols shifted up by the prefix count.
        assert_eq!(v[1], 2 + 3);
        assert_eq!(v[2], 1 + 3);
        // Trailing single zero: prefix 0.
        assert_eq!(v[3] & 0x1FF, 0);
    }

    #[test]
    fn test_mtf_transform() {
        let v_in = [1u32, 1, 0, 2, 2, 0];
        let mut v_out = [0u32; 6];
        move_to_front_transform(&v_in, &mut v_out);
        assert_eq!(v_out, [1, 0, 1, 2, 0, 1]);
    }
}
