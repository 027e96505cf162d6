//! Streaming decoder.
//!
//! One explicit state machine drives a bit reader against an output ring
//! buffer. Every state either completes synchronously, returns
//! `NeedsMoreInput` (the caller refills and re-enters at the same state),
//! or returns `NeedsMoreOutput` (the caller drains the ring buffer and
//! re-enters). All mid-state counters are persisted fields, so suspension
//! can happen at any input boundary. A terminal error is latched: every
//! subsequent call returns the same code without advancing.

use crate::bit_reader::{bit_mask, BitReader};
use crate::constants::*;
use crate::context::get_context_lut;
use crate::dictionary::{
    get_dictionary, transform_dictionary_word, Dictionary, NUM_TRANSFORMS,
};
use crate::huffman::{
    build_code_lengths_huffman_table, build_huffman_table, build_simple_huffman_table,
    read_symbol, safe_read_symbol, HuffmanCode, SymbolList, HUFFMAN_MAX_SIZE_258,
    HUFFMAN_MAX_SIZE_26, HUFFMAN_MAX_SIZE_272, K_MAX_HUFFMAN_TABLE_SIZE,
};
use crate::prefix::{CmdLutElement, CMD_LUT, K_BLOCK_LENGTH_PREFIX_CODE};

/// Result of one decompression call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderResult {
    Success,
    NeedsMoreInput,
    NeedsMoreOutput,
    Error(DecoderErrorCode),
}

/// Terminal decoder errors, by stable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderErrorCode {
    FormatExuberantNibble,
    FormatReserved,
    FormatExuberantMetaNibble,
    FormatSimpleHuffmanAlphabet,
    FormatSimpleHuffmanSame,
    FormatClSpace,
    FormatHuffmanSpace,
    FormatContextMapRepeat,
    FormatBlockLength1,
    FormatBlockLength2,
    FormatTransform,
    FormatDictionary,
    FormatWindowBits,
    FormatPadding1,
    FormatPadding2,
    FormatDistance,
    DictionaryNotSet,
    InvalidArguments,
    AllocContextModes,
    AllocTreeGroups,
    AllocContextMap,
    AllocRingBuffer1,
    AllocRingBuffer2,
    AllocBlockTypeTrees,
    Unreachable,
}

impl DecoderErrorCode {
    /// Stable error-code name.
    pub fn name(self) -> &'static str {
        match self {
            DecoderErrorCode::FormatExuberantNibble => "EXUBERANT_NIBBLE",
            DecoderErrorCode::FormatReserved => "RESERVED",
            DecoderErrorCode::FormatExuberantMetaNibble => "EXUBERANT_META_NIBBLE",
            DecoderErrorCode::FormatSimpleHuffmanAlphabet => "SIMPLE_HUFFMAN_ALPHABET",
            DecoderErrorCode::FormatSimpleHuffmanSame => "SIMPLE_HUFFMAN_SAME",
            DecoderErrorCode::FormatClSpace => "CL_SPACE",
            DecoderErrorCode::FormatHuffmanSpace => "HUFFMAN_SPACE",
            DecoderErrorCode::FormatContextMapRepeat => "CONTEXT_MAP_REPEAT",
            DecoderErrorCode::FormatBlockLength1 => "BLOCK_LENGTH_1",
            DecoderErrorCode::FormatBlockLength2 => "BLOCK_LENGTH_2",
            DecoderErrorCode::FormatTransform => "TRANSFORM",
            DecoderErrorCode::FormatDictionary => "DICTIONARY",
            DecoderErrorCode::FormatWindowBits => "WINDOW_BITS",
            DecoderErrorCode::FormatPadding1 => "PADDING_1",
            DecoderErrorCode::FormatPadding2 => "PADDING_2",
            DecoderErrorCode::FormatDistance => "DISTANCE",
            DecoderErrorCode::DictionaryNotSet => "DICTIONARY_NOT_SET",
            DecoderErrorCode::InvalidArguments => "INVALID_ARGUMENTS",
            DecoderErrorCode::AllocContextModes => "CONTEXT_MODES",
            DecoderErrorCode::AllocTreeGroups => "TREE_GROUPS",
            DecoderErrorCode::AllocContextMap => "CONTEXT_MAP",
            DecoderErrorCode::AllocRingBuffer1 => "RING_BUFFER_1",
            DecoderErrorCode::AllocRingBuffer2 => "RING_BUFFER_2",
            DecoderErrorCode::AllocBlockTypeTrees => "BLOCK_TYPE_TREES",
            DecoderErrorCode::Unreachable => "UNREACHABLE",
        }
    }
}

/// Internal status threaded between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Success,
    NeedsMoreInput,
    NeedsMoreOutput,
    Err(DecoderErrorCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninited,
    LargeWindowBits,
    Initialize,
    MetablockBegin,
    MetablockHeader,
    MetablockHeader2,
    ContextModes,
    CommandBegin,
    CommandInner,
    CommandPostDecodeLiterals,
    CommandPostWrapCopy,
    Uncompressed,
    Metadata,
    CommandInnerWrite,
    MetablockDone,
    CommandPostWrite1,
    CommandPostWrite2,
    HuffmanCode0,
    HuffmanCode1,
    HuffmanCode2,
    HuffmanCode3,
    ContextMap1,
    ContextMap2,
    TreeGroup,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstateMetablockHeader {
    None,
    Empty,
    Nibbles,
    Size,
    Uncompressed,
    Reserved,
    Bytes,
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstateTreeGroup {
    None,
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstateContextMap {
    None,
    ReadPrefix,
    Huffman,
    Decode,
    Transform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstateUncompressed {
    None,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstateHuffman {
    None,
    SimpleSize,
    SimpleRead,
    SimpleBuild,
    Complex,
    LengthSymbols,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstateDecodeUint8 {
    None,
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstateReadBlockLength {
    None,
    Suffix,
}

/// Slack past the ring buffer: two 16-byte block copies plus an inserted
/// transformed dictionary word (5 prefix + 24 base + 8 suffix).
const K_RING_BUFFER_WRITE_AHEAD_SLACK: usize = 42;

/// Static prefix code for the code-length code lengths.
const K_CODE_LENGTH_PREFIX_LENGTH: [u8; 16] = [2, 2, 2, 3, 2, 2, 2, 4, 2, 2, 2, 3, 2, 2, 2, 4];
const K_CODE_LENGTH_PREFIX_VALUE: [u8; 16] = [0, 4, 3, 2, 0, 4, 3, 1, 0, 4, 3, 2, 0, 4, 3, 5];

const SHORT_FILL_BIT_WINDOW_READ: usize = 4;

/// Maximum number of distance symbols that can encode distances not
/// exceeding the allowed maximum (large-window piecewise rule).
fn max_distance_symbol(ndirect: u32, npostfix: u32) -> u32 {
    const BOUND: [u32; 4] = [0, 4, 12, 28];
    const DIFF: [u32; 4] = [73, 126, 228, 424];
    let postfix = 1u32 << npostfix;
    if ndirect < BOUND[npostfix as usize] {
        ndirect + DIFF[npostfix as usize] + postfix
    } else if ndirect > BOUND[npostfix as usize] + postfix {
        ndirect + DIFF[npostfix as usize]
    } else {
        BOUND[npostfix as usize] + DIFF[npostfix as usize] + postfix
    }
}

/// A tree group: all lookup tables of one category, contiguous, with one
/// offset per tree.
#[derive(Debug, Default)]
struct HuffmanTreeGroup {
    alphabet_size: u16,
    max_symbol: u16,
    num_htrees: u16,
    codes: Vec<HuffmanCode>,
    htrees: Vec<u32>,
}

impl HuffmanTreeGroup {
    fn init(&mut self, alphabet_size: u32, max_symbol: u32, ntrees: u32) {
        let max_table_size = K_MAX_HUFFMAN_TABLE_SIZE[((alphabet_size + 31) >> 5) as usize] as usize;
        self.alphabet_size = alphabet_size as u16;
        self.max_symbol = max_symbol as u16;
        self.num_htrees = ntrees as u16;
        self.htrees = vec![0; ntrees as usize];
        self.codes = vec![HuffmanCode::default(); ntrees as usize * max_table_size];
    }
}

/// The scratch used while reading one prefix code.
struct HuffmanReadState {
    substate: SubstateHuffman,
    sub_loop_counter: u32,
    symbol: u32,
    repeat: u32,
    space: u32,
    prev_code_len: u32,
    repeat_code_len: u32,
    table: [HuffmanCode; 32],
    symbol_lists: SymbolList,
    code_length_code_lengths: [u8; CODE_LENGTH_CODES],
    code_length_histo: [u16; 16],
    next_symbol: [i32; 32],
    simple_symbols: [u16; 4],
}

impl HuffmanReadState {
    fn new() -> Self {
        HuffmanReadState {
            substate: SubstateHuffman::None,
            sub_loop_counter: 0,
            symbol: 0,
            repeat: 0,
            space: 0,
            prev_code_len: 0,
            repeat_code_len: 0,
            table: [HuffmanCode::default(); 32],
            symbol_lists: SymbolList::new(),
            code_length_code_lengths: [0; CODE_LENGTH_CODES],
            code_length_histo: [0; 16],
            next_symbol: [0; 32],
            simple_symbols: [0; 4],
        }
    }
}

/// Reads (huff.symbol + 1) symbols, 1..=4 in total, rejecting duplicates.
fn read_simple_huffman_symbols(
    huff: &mut HuffmanReadState,
    br: &mut BitReader,
    input: &[u8],
    alphabet_size: u32,
    max_symbol: u32,
) -> Status {
    let max_bits = 32 - (alphabet_size - 1).leading_zeros();
    let mut i = huff.sub_loop_counter;
    let num_symbols = huff.symbol;
    while i <= num_symbols {
        let mut v = 0u32;
        if !br.safe_read_bits(input, max_bits, &mut v) {
            huff.sub_loop_counter = i;
            huff.substate = SubstateHuffman::SimpleRead;
            return Status::NeedsMoreInput;
        }
        if v >= max_symbol {
            return Status::Err(DecoderErrorCode::FormatSimpleHuffmanAlphabet);
        }
        huff.simple_symbols[i as usize] = v as u16;
        i += 1;
    }
    for i in 0..num_symbols {
        for k in i + 1..=num_symbols {
            if huff.simple_symbols[i as usize] == huff.simple_symbols[k as usize] {
                return Status::Err(DecoderErrorCode::FormatSimpleHuffmanSame);
            }
        }
    }
    Status::Success
}

/// Process a single decoded code length: remember it, thread the symbol
/// chain, and reduce the remaining Huffman space.
fn process_single_code_length(code_len: u32, huff: &mut HuffmanReadState) {
    huff.repeat = 0;
    if code_len != 0 {
        // code_len is in 1..=15.
        huff.symbol_lists
            .put(huff.next_symbol[code_len as usize], huff.symbol as u16);
        huff.next_symbol[code_len as usize] = huff.symbol as i32;
        huff.prev_code_len = code_len;
        huff.space -= 32768 >> code_len;
        huff.code_length_histo[code_len as usize] += 1;
    }
    huff.symbol += 1;
}

/// Process a repeat code: extend or restart the repeat run, check it fits
/// the alphabet, and apply it to the chains.
fn process_repeated_code_length(
    code_len: u32,
    repeat_delta: u32,
    alphabet_size: u32,
    huff: &mut HuffmanReadState,
) {
    let (new_len, extra_bits) = if code_len == REPEAT_PREVIOUS_CODE_LENGTH as u32 {
        (huff.prev_code_len, 2)
    } else {
        (0, 3)
    };
    if huff.repeat_code_len != new_len {
        huff.repeat = 0;
        huff.repeat_code_len = new_len;
    }
    let old_repeat = huff.repeat;
    if huff.repeat > 0 {
        huff.repeat -= 2;
        huff.repeat <<= extra_bits;
    }
    huff.repeat += repeat_delta + 3;
    let repeat_delta = huff.repeat - old_repeat;
    if huff.symbol + repeat_delta > alphabet_size {
        huff.symbol = alphabet_size;
        huff.space = 0xFFFFF;
        return;
    }
    if huff.repeat_code_len != 0 {
        let last = huff.symbol + repeat_delta;
        let mut next = huff.next_symbol[huff.repeat_code_len as usize];
        loop {
            huff.symbol_lists.put(next, huff.symbol as u16);
            next = huff.symbol as i32;
            huff.symbol += 1;
            if huff.symbol == last {
                break;
            }
        }
        huff.next_symbol[huff.repeat_code_len as usize] = next;
        huff.space -= repeat_delta << (15 - huff.repeat_code_len);
        huff.code_length_histo[huff.repeat_code_len as usize] += repeat_delta as u16;
    } else {
        huff.symbol += repeat_delta;
    }
}

/// Reads and decodes symbol code lengths (fast path; requires buffered
/// input).
fn read_symbol_code_lengths(
    huff: &mut HuffmanReadState,
    br: &mut BitReader,
    input: &[u8],
    alphabet_size: u32,
) -> Status {
    if !br.warmup(input) {
        return Status::NeedsMoreInput;
    }
    while huff.symbol < alphabet_size && huff.space > 0 {
        if !br.check_input_amount(input, SHORT_FILL_BIT_WINDOW_READ) {
            return Status::NeedsMoreInput;
        }
        br.fill_bit_window(input);
        let p = huff.table
            [(br.bits_unmasked() & u64::from(bit_mask(HUFFMAN_MAX_CODE_LENGTH_CODE_LENGTH as u32))) as usize];
        br.drop_bits(u32::from(p.bits)); // Use 1..5 bits.
        let code_len = u32::from(p.value); // code_len == 0..17
        if code_len < REPEAT_PREVIOUS_CODE_LENGTH as u32 {
            process_single_code_length(code_len, huff);
        } else {
            let extra_bits = if code_len == REPEAT_PREVIOUS_CODE_LENGTH as u32 { 2 } else { 3 };
            let repeat_delta = (br.bits_unmasked() as u32) & bit_mask(extra_bits);
            br.drop_bits(extra_bits);
            process_repeated_code_length(code_len, repeat_delta, alphabet_size, huff);
        }
    }
    Status::Success
}

/// Same as above, but byte-by-byte for input boundaries.
fn safe_read_symbol_code_lengths(
    huff: &mut HuffmanReadState,
    br: &mut BitReader,
    input: &[u8],
    alphabet_size: u32,
) -> Status {
    let mut get_byte = false;
    while huff.symbol < alphabet_size && huff.space > 0 {
        if get_byte && !br.pull_byte(input) {
            return Status::NeedsMoreInput;
        }
        get_byte = false;
        let available_bits = br.available_bits();
        let bits = if available_bits != 0 {
            br.bits_unmasked() as u32
        } else {
            0
        };
        let p = huff.table[(bits & bit_mask(HUFFMAN_MAX_CODE_LENGTH_CODE_LENGTH as u32)) as usize];
        if u32::from(p.bits) > available_bits {
            get_byte = true;
            continue;
        }
        let code_len = u32::from(p.value);
        if code_len < REPEAT_PREVIOUS_CODE_LENGTH as u32 {
            br.drop_bits(u32::from(p.bits));
            process_single_code_length(code_len, huff);
        } else {
            let extra_bits = code_len - 14;
            let repeat_delta = (bits >> p.bits) & bit_mask(extra_bits);
            if available_bits < u32::from(p.bits) + extra_bits {
                get_byte = true;
                continue;
            }
            br.drop_bits(u32::from(p.bits) + extra_bits);
            process_repeated_code_length(code_len, repeat_delta, alphabet_size, huff);
        }
    }
    Status::Success
}

/// Reads the 15..18 code-length code lengths with the static 2..4-bit
/// prefix code.
fn read_code_length_code_lengths(
    huff: &mut HuffmanReadState,
    br: &mut BitReader,
    input: &[u8],
) -> Status {
    let mut num_codes = huff.repeat;
    let mut space = huff.space;
    let mut i = huff.sub_loop_counter;
    while i < CODE_LENGTH_CODES as u32 {
        let code_len_idx = crate::bit_stream::K_CODE_LENGTH_ORDER[i as usize];
        let mut ix = 0u32;
        if !br.safe_get_bits(input, 4, &mut ix) {
            let available_bits = br.available_bits();
            ix = if available_bits != 0 {
                (br.bits_unmasked() as u32) & 0xF
            } else {
                0
            };
            if u32::from(K_CODE_LENGTH_PREFIX_LENGTH[ix as usize]) > available_bits {
                huff.sub_loop_counter = i;
                huff.repeat = num_codes;
                huff.space = space;
                huff.substate = SubstateHuffman::Complex;
                return Status::NeedsMoreInput;
            }
        }
        let v = u32::from(K_CODE_LENGTH_PREFIX_VALUE[ix as usize]);
        br.drop_bits(u32::from(K_CODE_LENGTH_PREFIX_LENGTH[ix as usize]));
        huff.code_length_code_lengths[code_len_idx] = v as u8;
        if v != 0 {
            space = space.wrapping_sub(32 >> v);
            num_codes += 1;
            huff.code_length_histo[v as usize] += 1;
            if space.wrapping_sub(1) >= 32 {
                // space is 0 or wrapped around.
                break;
            }
        }
        i += 1;
    }
    if num_codes != 1 && space != 0 {
        return Status::Err(DecoderErrorCode::FormatClSpace);
    }
    huff.repeat = num_codes;
    huff.space = space;
    Status::Success
}

/// Reads a prefix-code description and builds the lookup table at
/// `table`. Returns the table size through `opt_table_size`.
fn read_huffman_code(
    huff: &mut HuffmanReadState,
    br: &mut BitReader,
    input: &[u8],
    mut alphabet_size: u32,
    max_symbol: u32,
    table: &mut [HuffmanCode],
    mut opt_table_size: Option<&mut u32>,
) -> Status {
    alphabet_size &= 0x7FF;
    loop {
        match huff.substate {
            SubstateHuffman::None => {
                if !br.safe_read_bits(input, 2, &mut huff.sub_loop_counter) {
                    return Status::NeedsMoreInput;
                }
                // Value 1 is a simple code; otherwise the value is how many
                // code lengths are skipped.
                if huff.sub_loop_counter != 1 {
                    huff.space = 32;
                    huff.repeat = 0; // num_codes
                    huff.code_length_histo = [0; 16];
                    huff.code_length_code_lengths = [0; CODE_LENGTH_CODES];
                    huff.substate = SubstateHuffman::Complex;
                    continue;
                }
                huff.substate = SubstateHuffman::SimpleSize;
            }
            SubstateHuffman::SimpleSize => {
                if !br.safe_read_bits(input, 2, &mut huff.symbol) {
                    huff.substate = SubstateHuffman::SimpleSize;
                    return Status::NeedsMoreInput;
                }
                huff.sub_loop_counter = 0;
                huff.substate = SubstateHuffman::SimpleRead;
            }
            SubstateHuffman::SimpleRead => {
                match read_simple_huffman_symbols(huff, br, input, alphabet_size, max_symbol) {
                    Status::Success => {}
                    status => return status,
                }
                huff.substate = SubstateHuffman::SimpleBuild;
            }
            SubstateHuffman::SimpleBuild => {
                if huff.symbol == 3 {
                    let mut bits = 0u32;
                    if !br.safe_read_bits(input, 1, &mut bits) {
                        huff.substate = SubstateHuffman::SimpleBuild;
                        return Status::NeedsMoreInput;
                    }
                    huff.symbol += bits;
                }
                let table_size = build_simple_huffman_table(
                    table,
                    crate::huffman::HUFFMAN_TABLE_BITS,
                    &mut huff.simple_symbols,
                    huff.symbol,
                );
                if let Some(out) = opt_table_size.as_deref_mut() {
                    *out = table_size;
                }
                huff.substate = SubstateHuffman::None;
                return Status::Success;
            }
            SubstateHuffman::Complex => {
                match read_code_length_code_lengths(huff, br, input) {
                    Status::Success => {}
                    status => return status,
                }
                build_code_lengths_huffman_table(
                    &mut huff.table,
                    &huff.code_length_code_lengths,
                    &huff.code_length_histo,
                );
                huff.code_length_histo = [0; 16];
                for i in 0..=HUFFMAN_MAX_CODE_LENGTH {
                    huff.next_symbol[i] = i as i32 - (HUFFMAN_MAX_CODE_LENGTH as i32 + 1);
                    huff.symbol_lists.put(huff.next_symbol[i], 0xFFFF);
                }
                huff.symbol = 0;
                huff.prev_code_len = INITIAL_REPEATED_CODE_LENGTH;
                huff.repeat = 0;
                huff.repeat_code_len = 0;
                huff.space = 32768;
                huff.substate = SubstateHuffman::LengthSymbols;
            }
            SubstateHuffman::LengthSymbols => {
                let mut status = read_symbol_code_lengths(huff, br, input, max_symbol);
                if status == Status::NeedsMoreInput {
                    status = safe_read_symbol_code_lengths(huff, br, input, max_symbol);
                }
                match status {
                    Status::Success => {}
                    status => return status,
                }
                if huff.space != 0 {
                    return Status::Err(DecoderErrorCode::FormatHuffmanSpace);
                }
                let table_size = build_huffman_table(
                    table,
                    crate::huffman::HUFFMAN_TABLE_BITS,
                    &huff.symbol_lists,
                    &mut huff.code_length_histo,
                );
                if let Some(out) = opt_table_size.as_deref_mut() {
                    *out = table_size;
                }
                huff.substate = SubstateHuffman::None;
                return Status::Success;
            }
        }
    }
}

/// Reads a variable-length 0..=255 value (1..=11 bits).
fn decode_var_len_uint8(
    substate: &mut SubstateDecodeUint8,
    br: &mut BitReader,
    input: &[u8],
    value: &mut u32,
) -> Status {
    let mut bits = 0u32;
    loop {
        match *substate {
            SubstateDecodeUint8::None => {
                if !br.safe_read_bits(input, 1, &mut bits) {
                    return Status::NeedsMoreInput;
                }
                if bits == 0 {
                    *value = 0;
                    return Status::Success;
                }
                *substate = SubstateDecodeUint8::Short;
            }
            SubstateDecodeUint8::Short => {
                if !br.safe_read_bits(input, 3, &mut bits) {
                    return Status::NeedsMoreInput;
                }
                if bits == 0 {
                    *value = 1;
                    *substate = SubstateDecodeUint8::None;
                    return Status::Success;
                }
                // The output value doubles as persistent storage.
                *value = bits;
                *substate = SubstateDecodeUint8::Long;
            }
            SubstateDecodeUint8::Long => {
                if !br.safe_read_bits(input, *value, &mut bits) {
                    return Status::NeedsMoreInput;
                }
                *value = (1 << *value) + bits;
                *substate = SubstateDecodeUint8::None;
                return Status::Success;
            }
        }
    }
}

/// The streaming decoder.
pub struct Decoder {
    state: State,
    loop_counter: i32,
    br: BitReader,
    buffer: [u8; 8],
    buffer_length: u32,
    pos: usize,
    max_backward_distance: usize,
    max_distance: usize,
    ringbuffer_size: usize,
    ringbuffer_mask: usize,
    new_ringbuffer_size: usize,
    rb_roundtrips: usize,
    partial_pos_out: usize,
    dist_rb: [i32; 4],
    dist_rb_idx: i32,
    latched_error: Option<DecoderErrorCode>,
    ringbuffer: Vec<u8>,

    htree_command_offset: u32,
    context_lookup: &'static [u8; 512],
    context_map_slice_offset: usize,
    dist_context_map_slice_offset: usize,
    literal_hgroup: HuffmanTreeGroup,
    insert_copy_hgroup: HuffmanTreeGroup,
    distance_hgroup: HuffmanTreeGroup,
    block_type_trees: Vec<HuffmanCode>,
    block_len_trees: Vec<HuffmanCode>,
    trivial_literal_context: bool,
    /// Distance context of the current command.
    distance_context: i32,
    meta_block_remaining_len: i32,
    block_length_index: u32,
    block_length: [u32; 3],
    num_block_types: [u32; 3],
    block_type_rb: [u32; 6],
    distance_postfix_bits: u32,
    num_direct_distance_codes: u32,
    distance_postfix_mask: i32,
    num_dist_htrees: u32,
    dist_context_map: Vec<u8>,
    literal_htree_offset: u32,
    dist_htree_index: u8,
    copy_length: i32,
    distance_code: i32,

    huff: HuffmanReadState,
    htree_index: usize,
    htree_next_offset: u32,

    context_index: u32,
    max_run_length_prefix: u32,
    code: u32,
    context_map_table: Vec<HuffmanCode>,

    substate_metablock_header: SubstateMetablockHeader,
    substate_tree_group: SubstateTreeGroup,
    substate_context_map: SubstateContextMap,
    substate_uncompressed: SubstateUncompressed,
    substate_decode_uint8: SubstateDecodeUint8,
    substate_read_block_length: SubstateReadBlockLength,

    is_last_metablock: bool,
    is_uncompressed: bool,
    is_metadata: bool,
    should_wrap_ringbuffer: bool,
    canny_ringbuffer_allocation: bool,
    /// Whether the caller enabled the non-standard large-window mode.
    large_window_enabled: bool,
    large_window: bool,
    size_nibbles: u32,
    window_bits: u32,
    num_literal_htrees: u32,
    context_map: Vec<u8>,
    context_modes: Vec<u8>,
    dictionary: &'static Dictionary,
    trivial_literal_contexts: [u32; 8],
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            state: State::Uninited,
            loop_counter: 0,
            br: BitReader::new(),
            buffer: [0; 8],
            buffer_length: 0,
            pos: 0,
            max_backward_distance: 0,
            max_distance: 0,
            ringbuffer_size: 0,
            ringbuffer_mask: 0,
            new_ringbuffer_size: 0,
            rb_roundtrips: 0,
            partial_pos_out: 0,
            dist_rb: [16, 15, 11, 4],
            dist_rb_idx: 0,
            latched_error: None,
            ringbuffer: Vec::new(),
            htree_command_offset: 0,
            context_lookup: get_context_lut(crate::context::ContextMode::Lsb6),
            context_map_slice_offset: 0,
            dist_context_map_slice_offset: 0,
            literal_hgroup: HuffmanTreeGroup::default(),
            insert_copy_hgroup: HuffmanTreeGroup::default(),
            distance_hgroup: HuffmanTreeGroup::default(),
            block_type_trees: Vec::new(),
            block_len_trees: Vec::new(),
            trivial_literal_context: false,
            distance_context: 0,
            meta_block_remaining_len: 0,
            block_length_index: 0,
            block_length: [0; 3],
            num_block_types: [0; 3],
            block_type_rb: [0; 6],
            distance_postfix_bits: 0,
            num_direct_distance_codes: 0,
            distance_postfix_mask: 0,
            num_dist_htrees: 0,
            dist_context_map: Vec::new(),
            literal_htree_offset: 0,
            dist_htree_index: 0,
            copy_length: 0,
            distance_code: 0,
            huff: HuffmanReadState::new(),
            htree_index: 0,
            htree_next_offset: 0,
            context_index: 0,
            max_run_length_prefix: 0,
            code: 0,
            context_map_table: vec![HuffmanCode::default(); HUFFMAN_MAX_SIZE_272],
            substate_metablock_header: SubstateMetablockHeader::None,
            substate_tree_group: SubstateTreeGroup::None,
            substate_context_map: SubstateContextMap::None,
            substate_uncompressed: SubstateUncompressed::None,
            substate_decode_uint8: SubstateDecodeUint8::None,
            substate_read_block_length: SubstateReadBlockLength::None,
            is_last_metablock: false,
            is_uncompressed: false,
            is_metadata: false,
            should_wrap_ringbuffer: false,
            canny_ringbuffer_allocation: true,
            large_window_enabled: false,
            large_window: false,
            size_nibbles: 0,
            window_bits: 0,
            num_literal_htrees: 0,
            context_map: Vec::new(),
            context_modes: Vec::new(),
            dictionary: get_dictionary(),
            trivial_literal_contexts: [0; 8],
        }
    }

    /// Creates a decoder accepting the large-window extension.
    pub fn new_large_window() -> Self {
        let mut d = Self::new();
        d.large_window_enabled = true;
        d
    }

    /// Resets the decoder for a fresh stream.
    pub fn reset(&mut self) {
        let large = self.large_window_enabled;
        *self = Self::new();
        self.large_window_enabled = large;
    }

    /// The latched error, if the decoder failed.
    pub fn error_code(&self) -> Option<DecoderErrorCode> {
        self.latched_error
    }

    /// Whether undelivered output remains in the ring buffer.
    pub fn has_more_output(&self) -> bool {
        if self.latched_error.is_some() {
            return false;
        }
        !self.ringbuffer.is_empty() && self.unwritten_bytes(false) != 0
    }

    /// Whether the stream reached its final state.
    pub fn is_finished(&self) -> bool {
        self.state == State::Done && !self.has_more_output()
    }

    fn metablock_begin(&mut self) {
        self.meta_block_remaining_len = 0;
        self.block_length = [1 << 24, 1 << 24, 1 << 24];
        self.num_block_types = [1, 1, 1];
        self.block_type_rb = [1, 0, 1, 0, 1, 0];
        self.context_map = Vec::new();
        self.context_modes = Vec::new();
        self.dist_context_map = Vec::new();
        self.context_map_slice_offset = 0;
        self.dist_context_map_slice_offset = 0;
        self.literal_htree_offset = 0;
        self.dist_htree_index = 0;
    }

    fn unwritten_bytes(&self, wrap: bool) -> usize {
        let pos = if wrap && self.pos > self.ringbuffer_size {
            self.ringbuffer_size
        } else {
            self.pos
        };
        let partial_pos_rb = self.rb_roundtrips * self.ringbuffer_size + pos;
        partial_pos_rb - self.partial_pos_out
    }

    /// Copies decoded bytes out to the caller; `force` reports
    /// NeedsMoreOutput even for a partially filled ring buffer.
    fn write_ring_buffer(
        &mut self,
        output: &mut [u8],
        output_offset: &mut usize,
        force: bool,
    ) -> Status {
        if self.meta_block_remaining_len < 0 {
            return Status::Err(DecoderErrorCode::FormatBlockLength1);
        }
        let to_write = self.unwritten_bytes(true);
        let available = output.len() - *output_offset;
        let num_written = available.min(to_write);
        let start = self.partial_pos_out & self.ringbuffer_mask;
        output[*output_offset..*output_offset + num_written]
            .copy_from_slice(&self.ringbuffer[start..start + num_written]);
        *output_offset += num_written;
        self.partial_pos_out += num_written;

        if num_written < to_write {
            if self.ringbuffer_size == 1 << self.window_bits || force {
                return Status::NeedsMoreOutput;
            } else {
                return Status::Success;
            }
        }

        // Wrap only when the ring buffer is at its full window size.
        if self.ringbuffer_size == 1 << self.window_bits && self.pos >= self.ringbuffer_size {
            self.pos -= self.ringbuffer_size;
            self.rb_roundtrips += 1;
            self.should_wrap_ringbuffer = self.pos != 0;
        }
        Status::Success
    }

    fn wrap_ring_buffer(&mut self) {
        if self.should_wrap_ringbuffer {
            let (head, tail) = self.ringbuffer.split_at_mut(self.ringbuffer_size);
            head[..self.pos].copy_from_slice(&tail[..self.pos]);
            self.should_wrap_ringbuffer = false;
        }
    }

    /// (Re)allocates the ring buffer to `new_ringbuffer_size`; the last
    /// two bytes are zeroed so context reads are uniform at the start.
    fn ensure_ring_buffer(&mut self) -> bool {
        if self.ringbuffer_size == self.new_ringbuffer_size {
            return true;
        }
        let space_needed = self.new_ringbuffer_size + K_RING_BUFFER_WRITE_AHEAD_SLACK;
        if self.ringbuffer.len() < space_needed {
            let mut new_ringbuffer = vec![0u8; space_needed];
            new_ringbuffer[..self.pos.min(self.ringbuffer.len())]
                .copy_from_slice(&self.ringbuffer[..self.pos.min(self.ringbuffer.len())]);
            self.ringbuffer = new_ringbuffer;
        }
        self.ringbuffer[self.new_ringbuffer_size - 2] = 0;
        self.ringbuffer[self.new_ringbuffer_size - 1] = 0;
        self.ringbuffer_size = self.new_ringbuffer_size;
        self.ringbuffer_mask = self.new_ringbuffer_size - 1;
        true
    }

    /// Picks the smallest feasible ring buffer for this meta-block.
    fn calculate_ring_buffer_size(&mut self) {
        let window_size = 1usize << self.window_bits;
        let mut new_ringbuffer_size = window_size;
        // At least two bytes are needed for the context of the next byte.
        let mut min_size = if self.ringbuffer_size != 0 {
            self.ringbuffer_size
        } else {
            1024
        };

        if self.ringbuffer_size == window_size {
            return;
        }
        // Metadata blocks do not touch the ring buffer.
        if self.is_metadata {
            return;
        }

        let output_size = if self.ringbuffer.is_empty() { 0 } else { self.pos };
        let output_size = output_size + self.meta_block_remaining_len as usize;
        min_size = min_size.max(output_size);

        if self.canny_ringbuffer_allocation {
            // Shrink the allocation when the stream promises little data.
            while new_ringbuffer_size >> 1 >= min_size {
                new_ringbuffer_size >>= 1;
            }
        }
        self.new_ringbuffer_size = new_ringbuffer_size;
    }

    /// Reads WBITS: 1..=7 bits, or the 0x11 large-window escape.
    /// Precondition: the accumulator holds at least 8 bits.
    fn decode_window_bits(&mut self) -> Status {
        let large_window = self.large_window_enabled;
        self.large_window = false;
        let mut n = self.br.take_bits(1);
        if n == 0 {
            self.window_bits = 16;
            return Status::Success;
        }
        n = self.br.take_bits(3);
        if n != 0 {
            self.window_bits = 17 + n;
            return Status::Success;
        }
        n = self.br.take_bits(3);
        if n == 1 {
            if large_window {
                let b = self.br.take_bits(1);
                if b == 1 {
                    return Status::Err(DecoderErrorCode::FormatWindowBits);
                }
                self.large_window = true;
                return Status::Success;
            }
            return Status::Err(DecoderErrorCode::FormatWindowBits);
        }
        if n != 0 {
            self.window_bits = 8 + n;
            return Status::Success;
        }
        self.window_bits = 17;
        Status::Success
    }

    /// Reads the meta-block length and flags (2..=31 bits).
    fn decode_meta_block_length(&mut self, input: &[u8]) -> Status {
        let mut bits = 0u32;
        loop {
            match self.substate_metablock_header {
                SubstateMetablockHeader::None => {
                    if !self.br.safe_read_bits(input, 1, &mut bits) {
                        return Status::NeedsMoreInput;
                    }
                    self.is_last_metablock = bits != 0;
                    self.meta_block_remaining_len = 0;
                    self.is_uncompressed = false;
                    self.is_metadata = false;
                    if !self.is_last_metablock {
                        self.substate_metablock_header = SubstateMetablockHeader::Nibbles;
                        continue;
                    }
                    self.substate_metablock_header = SubstateMetablockHeader::Empty;
                }
                SubstateMetablockHeader::Empty => {
                    if !self.br.safe_read_bits(input, 1, &mut bits) {
                        return Status::NeedsMoreInput;
                    }
                    if bits != 0 {
                        self.substate_metablock_header = SubstateMetablockHeader::None;
                        return Status::Success;
                    }
                    self.substate_metablock_header = SubstateMetablockHeader::Nibbles;
                }
                SubstateMetablockHeader::Nibbles => {
                    if !self.br.safe_read_bits(input, 2, &mut bits) {
                        return Status::NeedsMoreInput;
                    }
                    self.size_nibbles = bits + 4;
                    self.loop_counter = 0;
                    if bits == 3 {
                        self.is_metadata = true;
                        self.substate_metablock_header = SubstateMetablockHeader::Reserved;
                        continue;
                    }
                    self.substate_metablock_header = SubstateMetablockHeader::Size;
                }
                SubstateMetablockHeader::Size => {
                    let mut i = self.loop_counter as u32;
                    while i < self.size_nibbles {
                        if !self.br.safe_read_bits(input, 4, &mut bits) {
                            self.loop_counter = i as i32;
                            return Status::NeedsMoreInput;
                        }
                        if i + 1 == self.size_nibbles && self.size_nibbles > 4 && bits == 0 {
                            return Status::Err(DecoderErrorCode::FormatExuberantNibble);
                        }
                        self.meta_block_remaining_len |= (bits << (i * 4)) as i32;
                        i += 1;
                    }
                    self.substate_metablock_header = SubstateMetablockHeader::Uncompressed;
                }
                SubstateMetablockHeader::Uncompressed => {
                    if !self.is_last_metablock {
                        if !self.br.safe_read_bits(input, 1, &mut bits) {
                            return Status::NeedsMoreInput;
                        }
                        self.is_uncompressed = bits != 0;
                    }
                    self.meta_block_remaining_len += 1;
                    self.substate_metablock_header = SubstateMetablockHeader::None;
                    return Status::Success;
                }
                SubstateMetablockHeader::Reserved => {
                    if !self.br.safe_read_bits(input, 1, &mut bits) {
                        return Status::NeedsMoreInput;
                    }
                    if bits != 0 {
                        return Status::Err(DecoderErrorCode::FormatReserved);
                    }
                    self.substate_metablock_header = SubstateMetablockHeader::Bytes;
                }
                SubstateMetablockHeader::Bytes => {
                    if !self.br.safe_read_bits(input, 2, &mut bits) {
                        return Status::NeedsMoreInput;
                    }
                    if bits == 0 {
                        self.substate_metablock_header = SubstateMetablockHeader::None;
                        return Status::Success;
                    }
                    self.size_nibbles = bits;
                    self.substate_metablock_header = SubstateMetablockHeader::Metadata;
                }
                SubstateMetablockHeader::Metadata => {
                    let mut i = self.loop_counter as u32;
                    while i < self.size_nibbles {
                        if !self.br.safe_read_bits(input, 8, &mut bits) {
                            self.loop_counter = i as i32;
                            return Status::NeedsMoreInput;
                        }
                        if i + 1 == self.size_nibbles && self.size_nibbles > 1 && bits == 0 {
                            return Status::Err(DecoderErrorCode::FormatExuberantMetaNibble);
                        }
                        self.meta_block_remaining_len |= (bits << (i * 8)) as i32;
                        i += 1;
                    }
                    self.meta_block_remaining_len += 1;
                    self.substate_metablock_header = SubstateMetablockHeader::None;
                    return Status::Success;
                }
            }
        }
    }

    /// Reads a block length (3..=39 bits), assuming buffered input.
    fn read_block_length(&mut self, input: &[u8], tree_offset: usize) -> u32 {
        let code = read_symbol(&self.block_len_trees[tree_offset..], &mut self.br, input) as usize;
        let (offset, nbits) = K_BLOCK_LENGTH_PREFIX_CODE[code];
        offset + self.br.read_bits(input, nbits)
    }

    /// Safe variant; cannot be resumed with `read_block_length` once it
    /// suspends.
    fn safe_read_block_length(
        &mut self,
        input: &[u8],
        tree_offset: usize,
        which: usize,
    ) -> bool {
        let index;
        if self.substate_read_block_length == SubstateReadBlockLength::None {
            let mut idx = 0u32;
            if !safe_read_symbol(
                &self.block_len_trees[tree_offset..],
                &mut self.br,
                input,
                &mut idx,
            ) {
                return false;
            }
            index = idx;
        } else {
            index = self.block_length_index;
        }
        let (offset, nbits) = K_BLOCK_LENGTH_PREFIX_CODE[index as usize];
        let mut bits = 0u32;
        if !self.br.safe_read_bits_maybe_zero(input, nbits, &mut bits) {
            self.block_length_index = index;
            self.substate_read_block_length = SubstateReadBlockLength::Suffix;
            return false;
        }
        self.block_length[which] = offset + bits;
        self.substate_read_block_length = SubstateReadBlockLength::None;
        true
    }

    /// Decodes a block switch for `tree_type` and updates the type MRU.
    /// Reads 3..=54 bits.
    fn decode_block_type_and_length(&mut self, safe: bool, input: &[u8], tree_type: usize) -> bool {
        let max_block_type = self.num_block_types[tree_type];
        if max_block_type <= 1 {
            return false;
        }
        let type_tree_offset = tree_type * HUFFMAN_MAX_SIZE_258;
        let len_tree_offset = tree_type * HUFFMAN_MAX_SIZE_26;
        let mut block_type;
        if !safe {
            block_type = read_symbol(&self.block_type_trees[type_tree_offset..], &mut self.br, input);
            self.block_length[tree_type] = self.read_block_length(input, len_tree_offset);
        } else {
            let memento = self.br;
            let mut bt = 0u32;
            if !safe_read_symbol(
                &self.block_type_trees[type_tree_offset..],
                &mut self.br,
                input,
                &mut bt,
            ) {
                return false;
            }
            if !self.safe_read_block_length(input, len_tree_offset, tree_type) {
                self.substate_read_block_length = SubstateReadBlockLength::None;
                self.br = memento;
                return false;
            }
            block_type = bt;
        }

        let rb_base = tree_type * 2;
        if block_type == 1 {
            block_type = self.block_type_rb[rb_base + 1] + 1;
        } else if block_type == 0 {
            block_type = self.block_type_rb[rb_base];
        } else {
            block_type -= 2;
        }
        if block_type >= max_block_type {
            block_type -= max_block_type;
        }
        self.block_type_rb[rb_base] = self.block_type_rb[rb_base + 1];
        self.block_type_rb[rb_base + 1] = block_type;
        true
    }

    /// Marks literal block types whose context map rows are constant; the
    /// command loop has a faster path for those.
    fn detect_trivial_literal_block_types(&mut self) {
        self.trivial_literal_contexts = [0; 8];
        for i in 0..self.num_block_types[0] as usize {
            let offset = i << LITERAL_CONTEXT_BITS;
            let sample = self.context_map[offset];
            let mut err = 0usize;
            for j in 0..(1 << LITERAL_CONTEXT_BITS) {
                err |= (self.context_map[offset + j] ^ sample) as usize;
            }
            if err == 0 {
                self.trivial_literal_contexts[i >> 5] |= 1 << (i & 31);
            }
        }
    }

    fn prepare_literal_decoding(&mut self) {
        let block_type = self.block_type_rb[1] as usize;
        let context_offset = block_type << LITERAL_CONTEXT_BITS;
        self.context_map_slice_offset = context_offset;
        let trivial = self.trivial_literal_contexts[block_type >> 5];
        self.trivial_literal_context = (trivial >> (block_type & 31)) & 1 != 0;
        self.literal_htree_offset =
            self.literal_hgroup.htrees[self.context_map[context_offset] as usize];
        let context_mode = self.context_modes[block_type] & 3;
        self.context_lookup = get_context_lut(crate::context::ContextMode::from_bits(u32::from(context_mode)));
    }

    fn decode_literal_block_switch(&mut self, safe: bool, input: &[u8]) -> bool {
        if !self.decode_block_type_and_length(safe, input, 0) {
            return false;
        }
        self.prepare_literal_decoding();
        true
    }

    fn decode_command_block_switch(&mut self, safe: bool, input: &[u8]) -> bool {
        if !self.decode_block_type_and_length(safe, input, 1) {
            return false;
        }
        self.htree_command_offset =
            self.insert_copy_hgroup.htrees[self.block_type_rb[3] as usize];
        true
    }

    fn decode_distance_block_switch(&mut self, safe: bool, input: &[u8]) -> bool {
        if !self.decode_block_type_and_length(safe, input, 2) {
            return false;
        }
        self.dist_context_map_slice_offset =
            (self.block_type_rb[5] as usize) << DISTANCE_CONTEXT_BITS;
        self.dist_htree_index = self.dist_context_map
            [self.dist_context_map_slice_offset + self.distance_context as usize];
        true
    }

    /// Reads 1..=256 context modes, 2 bits each.
    fn read_context_modes(&mut self, input: &[u8]) -> Status {
        let mut i = self.loop_counter;
        while (i as u32) < self.num_block_types[0] {
            let mut bits = 0u32;
            if !self.br.safe_read_bits(input, 2, &mut bits) {
                self.loop_counter = i;
                return Status::NeedsMoreInput;
            }
            self.context_modes[i as usize] = bits as u8;
            i += 1;
        }
        Status::Success
    }

    /// Resolves a distance short code against the recent-distance ring.
    fn take_distance_from_ring_buffer(&mut self) {
        if self.distance_code == 0 {
            self.dist_rb_idx -= 1;
            self.distance_code = self.dist_rb[(self.dist_rb_idx & 3) as usize];
            // Compensate the double ring roll for dictionary items.
            self.distance_context = 1;
        } else {
            let distance_code = self.distance_code << 1;
            // Packed per short code, 2 bits each: which ring slot, and
            // which +-delta to apply.
            const K_INDEX_OFFSET: u32 = 0xAAAF_FF1B;
            const K_VALUE_OFFSET: u32 = 0xFA5F_A500;
            let v = ((self.dist_rb_idx + (K_INDEX_OFFSET >> distance_code) as i32) & 0x3) as usize;
            self.distance_code = self.dist_rb[v];
            let v = ((K_VALUE_OFFSET >> distance_code) & 0x3) as i32;
            if distance_code & 0x3 != 0 {
                self.distance_code += v;
            } else {
                self.distance_code -= v;
                if self.distance_code <= 0 {
                    // A huge distance will cause a failure later on; this
                    // is a little faster than failing here.
                    self.distance_code = 0x7FFF_FFFF;
                }
            }
        }
    }

    /// Precondition: `distance_code < 0`.
    fn read_distance_internal(&mut self, safe: bool, input: &[u8]) -> bool {
        let memento = self.br;
        let distance_tree_offset =
            self.distance_hgroup.htrees[self.dist_htree_index as usize] as usize;
        if !safe {
            self.distance_code =
                read_symbol(&self.distance_hgroup.codes[distance_tree_offset..], &mut self.br, input)
                    as i32;
        } else {
            let mut code = 0u32;
            if !safe_read_symbol(
                &self.distance_hgroup.codes[distance_tree_offset..],
                &mut self.br,
                input,
                &mut code,
            ) {
                return false;
            }
            self.distance_code = code as i32;
        }

        // Convert the distance code to an actual distance, consulting the
        // recent-distance ring for the short codes.
        self.distance_context = 0;
        if self.distance_code & !0xF == 0 {
            self.take_distance_from_ring_buffer();
            self.block_length[2] -= 1;
            return true;
        }
        let mut distval = self.distance_code - self.num_direct_distance_codes as i32;
        if distval >= 0 {
            let nbits;
            let offset;
            if !safe && self.distance_postfix_bits == 0 {
                nbits = (distval as u32 >> 1) + 1;
                offset = ((2 + (distval & 1)) << nbits) - 4;
                self.distance_code =
                    self.num_direct_distance_codes as i32 + offset + self.br.read_bits(input, nbits) as i32;
            } else {
                let postfix = distval & self.distance_postfix_mask;
                distval >>= self.distance_postfix_bits;
                nbits = (distval as u32 >> 1) + 1;
                let mut bits = 0u32;
                if safe {
                    if !self.br.safe_read_bits_maybe_zero(input, nbits, &mut bits) {
                        self.distance_code = -1; // Restore precondition.
                        self.br = memento;
                        return false;
                    }
                } else {
                    bits = self.br.read_bits(input, nbits);
                }
                offset = ((2 + (distval & 1)) << nbits) - 4;
                self.distance_code = self.num_direct_distance_codes as i32
                    + ((offset + bits as i32) << self.distance_postfix_bits)
                    + postfix;
            }
        }
        self.distance_code -= NUM_DISTANCE_SHORT_CODES as i32 - 1;
        self.block_length[2] -= 1;
        true
    }

    /// Reads the insert/copy part of a command.
    fn read_command_internal(&mut self, safe: bool, input: &[u8], insert_length: &mut i32) -> bool {
        let memento = self.br;
        let cmd_code;
        if !safe {
            cmd_code = read_symbol(
                &self.insert_copy_hgroup.codes[self.htree_command_offset as usize..],
                &mut self.br,
                input,
            );
        } else {
            let mut code = 0u32;
            if !safe_read_symbol(
                &self.insert_copy_hgroup.codes[self.htree_command_offset as usize..],
                &mut self.br,
                input,
                &mut code,
            ) {
                return false;
            }
            cmd_code = code;
        }
        let v: CmdLutElement = CMD_LUT[cmd_code as usize];
        self.distance_code = i32::from(v.distance_code);
        self.distance_context = i32::from(v.context);
        self.dist_htree_index = self.dist_context_map
            [self.dist_context_map_slice_offset + self.distance_context as usize];
        *insert_length = i32::from(v.insert_len_offset);
        let mut insert_len_extra = 0u32;
        let mut copy_length = 0u32;
        if !safe {
            if v.insert_len_extra_bits != 0 {
                insert_len_extra = self.br.read_bits(input, u32::from(v.insert_len_extra_bits));
            }
            copy_length = self.br.read_bits(input, u32::from(v.copy_len_extra_bits));
        } else if !self
            .br
            .safe_read_bits_maybe_zero(input, u32::from(v.insert_len_extra_bits), &mut insert_len_extra)
            || !self
                .br
                .safe_read_bits_maybe_zero(input, u32::from(v.copy_len_extra_bits), &mut copy_length)
        {
            self.br = memento;
            return false;
        }
        self.copy_length = copy_length as i32 + i32::from(v.copy_len_offset);
        self.block_length[1] -= 1;
        *insert_length += insert_len_extra as i32;
        true
    }

    fn check_input_amount_maybe_safe(&self, safe: bool, input: &[u8], num: usize) -> bool {
        if safe {
            return true;
        }
        self.br.check_input_amount(input, num)
    }

    /// The command loop. `rb` is the output ring buffer, taken out of
    /// `self` for the duration of the call.
    fn process_commands_internal(&mut self, safe: bool, input: &[u8], rb: &mut [u8]) -> Status {
        let mut pos = self.pos;
        let mut i = self.loop_counter;
        let mut result = Status::Success;

        if !self.check_input_amount_maybe_safe(safe, input, 28) {
            self.pos = pos;
            self.loop_counter = i;
            return Status::NeedsMoreInput;
        }
        if !safe {
            self.br.warmup(input);
        }

        enum Label {
            Begin,
            Inner,
            PostDecodeLiterals,
            PostWrapCopy,
        }
        let mut label = match self.state {
            State::CommandBegin => Label::Begin,
            State::CommandInner => Label::Inner,
            State::CommandPostDecodeLiterals => Label::PostDecodeLiterals,
            State::CommandPostWrapCopy => Label::PostWrapCopy,
            _ => return Status::Err(DecoderErrorCode::Unreachable),
        };

        'outer: loop {
            match label {
                Label::Begin => {
                    if safe {
                        self.state = State::CommandBegin;
                    }
                    if !self.check_input_amount_maybe_safe(safe, input, 28) {
                        self.state = State::CommandBegin;
                        result = Status::NeedsMoreInput;
                        break 'outer;
                    }
                    if self.block_length[1] == 0 {
                        if !self.decode_command_block_switch(safe, input) {
                            if safe {
                                result = Status::NeedsMoreInput;
                                break 'outer;
                            }
                        }
                        label = Label::Begin;
                        continue 'outer;
                    }
                    // Read the insert/copy length of the command.
                    let mut insert_length = 0i32;
                    if !self.read_command_internal(safe, input, &mut insert_length) {
                        result = Status::NeedsMoreInput;
                        break 'outer;
                    }
                    i = insert_length;
                    if i == 0 {
                        label = Label::PostDecodeLiterals;
                        continue 'outer;
                    }
                    self.meta_block_remaining_len -= i;
                    label = Label::Inner;
                }
                Label::Inner => {
                    if safe {
                        self.state = State::CommandInner;
                    }
                    // Read the literals of the command.
                    if self.trivial_literal_context {
                        loop {
                            if !self.check_input_amount_maybe_safe(safe, input, 28) {
                                self.state = State::CommandInner;
                                result = Status::NeedsMoreInput;
                                break 'outer;
                            }
                            if self.block_length[0] == 0 {
                                if !self.decode_literal_block_switch(safe, input) {
                                    if safe {
                                        result = Status::NeedsMoreInput;
                                        break 'outer;
                                    }
                                }
                                if !self.trivial_literal_context {
                                    label = Label::Inner;
                                    continue 'outer;
                                }
                            }
                            let table =
                                &self.literal_hgroup.codes[self.literal_htree_offset as usize..];
                            if !safe {
                                rb[pos] = read_symbol(table, &mut self.br, input) as u8;
                            } else {
                                let mut literal = 0u32;
                                if !safe_read_symbol(table, &mut self.br, input, &mut literal) {
                                    result = Status::NeedsMoreInput;
                                    break 'outer;
                                }
                                rb[pos] = literal as u8;
                            }
                            self.block_length[0] -= 1;
                            pos += 1;
                            if pos == self.ringbuffer_size {
                                self.state = State::CommandInnerWrite;
                                i -= 1;
                                break 'outer;
                            }
                            i -= 1;
                            if i == 0 {
                                break;
                            }
                        }
                    } else {
                        let mut p1 = rb[(pos.wrapping_sub(1)) & self.ringbuffer_mask];
                        let mut p2 = rb[(pos.wrapping_sub(2)) & self.ringbuffer_mask];
                        loop {
                            if !self.check_input_amount_maybe_safe(safe, input, 28) {
                                self.state = State::CommandInner;
                                result = Status::NeedsMoreInput;
                                break 'outer;
                            }
                            if self.block_length[0] == 0 {
                                if !self.decode_literal_block_switch(safe, input) {
                                    if safe {
                                        result = Status::NeedsMoreInput;
                                        break 'outer;
                                    }
                                }
                                if self.trivial_literal_context {
                                    label = Label::Inner;
                                    continue 'outer;
                                }
                            }
                            let context =
                                crate::context::get_context(p1, p2, self.context_lookup) as usize;
                            let tree_offset = self.literal_hgroup.htrees
                                [self.context_map[self.context_map_slice_offset + context] as usize]
                                as usize;
                            let table = &self.literal_hgroup.codes[tree_offset..];
                            p2 = p1;
                            if !safe {
                                p1 = read_symbol(table, &mut self.br, input) as u8;
                            } else {
                                let mut literal = 0u32;
                                if !safe_read_symbol(table, &mut self.br, input, &mut literal) {
                                    result = Status::NeedsMoreInput;
                                    break 'outer;
                                }
                                p1 = literal as u8;
                            }
                            rb[pos] = p1;
                            self.block_length[0] -= 1;
                            pos += 1;
                            if pos == self.ringbuffer_size {
                                self.state = State::CommandInnerWrite;
                                i -= 1;
                                break 'outer;
                            }
                            i -= 1;
                            if i == 0 {
                                break;
                            }
                        }
                    }
                    if self.meta_block_remaining_len <= 0 {
                        self.state = State::MetablockDone;
                        break 'outer;
                    }
                    label = Label::PostDecodeLiterals;
                }
                Label::PostDecodeLiterals => {
                    if safe {
                        self.state = State::CommandPostDecodeLiterals;
                    }
                    if self.distance_code >= 0 {
                        // Implicit zero distance code: rewind the ring.
                        self.distance_context = if self.distance_code != 0 { 0 } else { 1 };
                        self.dist_rb_idx -= 1;
                        self.distance_code = self.dist_rb[(self.dist_rb_idx & 3) as usize];
                    } else {
                        if self.block_length[2] == 0 && !self.decode_distance_block_switch(safe, input) && safe {
                            result = Status::NeedsMoreInput;
                            break 'outer;
                        }
                        if !self.read_distance_internal(safe, input) {
                            result = Status::NeedsMoreInput;
                            break 'outer;
                        }
                    }

                    if self.max_distance != self.max_backward_distance {
                        self.max_distance = pos.min(self.max_backward_distance);
                    }

                    i = self.copy_length;

                    // An LZ77 copy, or a static dictionary reference when
                    // the distance exceeds the window.
                    if self.distance_code as usize > self.max_distance {
                        if self.distance_code as usize > MAX_ALLOWED_DISTANCE {
                            self.pos = pos;
                            self.loop_counter = i;
                            return Status::Err(DecoderErrorCode::FormatDistance);
                        }
                        if i >= MIN_DICTIONARY_WORD_LENGTH as i32
                            && i <= MAX_DICTIONARY_WORD_LENGTH as i32
                        {
                            let address = self.distance_code as usize - self.max_distance - 1;
                            let words = self.dictionary;
                            let len = i as usize;
                            let shift = words.size_bits_by_length[len] as usize;
                            let mask = bit_mask(shift as u32) as usize;
                            let word_idx = address & mask;
                            let transform_idx = address >> shift;
                            // Compensate the double ring-buffer roll.
                            self.dist_rb_idx += self.distance_context;
                            if words.data.is_empty() {
                                self.pos = pos;
                                self.loop_counter = i;
                                return Status::Err(DecoderErrorCode::DictionaryNotSet);
                            }
                            if transform_idx < NUM_TRANSFORMS {
                                let offset = words.offsets_by_length[len] as usize + word_idx * len;
                                let word = &words.data[offset..offset + len];
                                let written = if transform_idx == 0 {
                                    rb[pos..pos + len].copy_from_slice(word);
                                    len
                                } else {
                                    transform_dictionary_word(&mut rb[pos..], word, len, transform_idx)
                                };
                                pos += written;
                                self.meta_block_remaining_len -= written as i32;
                                if pos >= self.ringbuffer_size {
                                    self.state = State::CommandPostWrite1;
                                    break 'outer;
                                }
                            } else {
                                self.pos = pos;
                                self.loop_counter = i;
                                return Status::Err(DecoderErrorCode::FormatTransform);
                            }
                        } else {
                            self.pos = pos;
                            self.loop_counter = i;
                            return Status::Err(DecoderErrorCode::FormatDictionary);
                        }
                    } else {
                        let src_start = (pos.wrapping_sub(self.distance_code as usize))
                            & self.ringbuffer_mask;
                        let dst_end = pos + i as usize;
                        let src_end = src_start + i as usize;

                        // Update the recent distances cache.
                        self.dist_rb[(self.dist_rb_idx & 3) as usize] = self.distance_code;
                        self.dist_rb_idx += 1;
                        self.meta_block_remaining_len -= i;

                        if src_end > pos && dst_end > src_start {
                            // Regions intersect.
                            label = Label::PostWrapCopy;
                            continue 'outer;
                        }
                        if dst_end >= self.ringbuffer_size || src_end >= self.ringbuffer_size {
                            // At least one region wraps.
                            label = Label::PostWrapCopy;
                            continue 'outer;
                        }
                        rb.copy_within(src_start..src_end, pos);
                        pos += i as usize;
                    }
                    if self.meta_block_remaining_len <= 0 {
                        // Next meta-block, if any.
                        self.state = State::MetablockDone;
                        break 'outer;
                    }
                    label = Label::Begin;
                }
                Label::PostWrapCopy => {
                    let mut wrap_guard = self.ringbuffer_size - pos;
                    loop {
                        i -= 1;
                        if i < 0 {
                            break;
                        }
                        rb[pos] = rb
                            [(pos.wrapping_sub(self.distance_code as usize)) & self.ringbuffer_mask];
                        pos += 1;
                        wrap_guard -= 1;
                        if wrap_guard == 0 {
                            self.state = State::CommandPostWrite2;
                            break 'outer;
                        }
                    }
                    if self.meta_block_remaining_len <= 0 {
                        self.state = State::MetablockDone;
                        break 'outer;
                    }
                    label = Label::Begin;
                }
            }
        }

        self.pos = pos;
        self.loop_counter = i;
        result
    }

    fn process_commands(&mut self, safe: bool, input: &[u8]) -> Status {
        let mut rb = std::mem::take(&mut self.ringbuffer);
        let result = self.process_commands_internal(safe, input, &mut rb);
        self.ringbuffer = rb;
        result
    }

    /// Copies raw meta-block bytes to the ring buffer and drains them.
    fn copy_uncompressed_block_to_output(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        output_offset: &mut usize,
    ) -> Status {
        if !self.ensure_ring_buffer() {
            return Status::Err(DecoderErrorCode::AllocRingBuffer1);
        }
        loop {
            match self.substate_uncompressed {
                SubstateUncompressed::None => {
                    let mut nbytes = self.br.remaining_bytes(input).min(
                        self.meta_block_remaining_len as usize,
                    );
                    if self.pos + nbytes > self.ringbuffer_size {
                        nbytes = self.ringbuffer_size - self.pos;
                    }
                    // Copy out of the accumulator first, then straight from
                    // the input window.
                    self.br
                        .copy_bytes(&mut self.ringbuffer[self.pos..self.pos + nbytes], input, nbytes);
                    self.pos += nbytes;
                    self.meta_block_remaining_len -= nbytes as i32;
                    if self.pos < 1 << self.window_bits {
                        if self.meta_block_remaining_len == 0 {
                            return Status::Success;
                        }
                        return Status::NeedsMoreInput;
                    }
                    self.substate_uncompressed = SubstateUncompressed::Write;
                }
                SubstateUncompressed::Write => {
                    match self.write_ring_buffer(output, output_offset, false) {
                        Status::Success => {}
                        result => return result,
                    }
                    if self.ringbuffer_size == 1 << self.window_bits {
                        self.max_distance = self.max_backward_distance;
                    }
                    self.substate_uncompressed = SubstateUncompressed::None;
                }
            }
        }
    }

    /// Decodes a context map (RLE of zeros plus inverse move-to-front).
    fn decode_context_map(
        &mut self,
        input: &[u8],
        context_map_size: usize,
        is_dist_map: bool,
    ) -> Status {
        loop {
            match self.substate_context_map {
                SubstateContextMap::None => {
                    let result = decode_var_len_uint8(
                        &mut self.substate_decode_uint8,
                        &mut self.br,
                        input,
                        &mut self.code,
                    );
                    if result != Status::Success {
                        return result;
                    }
                    let num_htrees = self.code + 1;
                    self.context_index = 0;
                    let map = vec![0u8; context_map_size];
                    if is_dist_map {
                        self.num_dist_htrees = num_htrees;
                        self.dist_context_map = map;
                    } else {
                        self.num_literal_htrees = num_htrees;
                        self.context_map = map;
                    }
                    if num_htrees <= 1 {
                        return Status::Success;
                    }
                    self.substate_context_map = SubstateContextMap::ReadPrefix;
                }
                SubstateContextMap::ReadPrefix => {
                    let mut bits = 0u32;
                    // The next stage reads at least 4 bits, so peeking 5
                    // bits ahead is safe.
                    if !self.br.safe_get_bits(input, 5, &mut bits) {
                        return Status::NeedsMoreInput;
                    }
                    if bits & 1 != 0 {
                        // Zeros are run-length encoded.
                        self.max_run_length_prefix = (bits >> 1) + 1;
                        self.br.drop_bits(5);
                    } else {
                        self.max_run_length_prefix = 0;
                        self.br.drop_bits(1);
                    }
                    self.substate_context_map = SubstateContextMap::Huffman;
                }
                SubstateContextMap::Huffman => {
                    let num_htrees = if is_dist_map {
                        self.num_dist_htrees
                    } else {
                        self.num_literal_htrees
                    };
                    let alphabet_size = num_htrees + self.max_run_length_prefix;
                    let mut table = std::mem::take(&mut self.context_map_table);
                    let result = read_huffman_code(
                        &mut self.huff,
                        &mut self.br,
                        input,
                        alphabet_size,
                        alphabet_size,
                        &mut table,
                        None,
                    );
                    self.context_map_table = table;
                    if result != Status::Success {
                        return result;
                    }
                    self.code = 0xFFFF;
                    self.substate_context_map = SubstateContextMap::Decode;
                }
                SubstateContextMap::Decode => {
                    let mut context_index = self.context_index as usize;
                    let max_run_length_prefix = self.max_run_length_prefix;
                    let mut code = self.code;
                    let mut skip_preamble = code != 0xFFFF;
                    while context_index < context_map_size || skip_preamble {
                        if !skip_preamble {
                            if !safe_read_symbol(&self.context_map_table, &mut self.br, input, &mut code)
                            {
                                self.code = 0xFFFF;
                                self.context_index = context_index as u32;
                                return Status::NeedsMoreInput;
                            }
                            if code == 0 {
                                if is_dist_map {
                                    self.dist_context_map[context_index] = 0;
                                } else {
                                    self.context_map[context_index] = 0;
                                }
                                context_index += 1;
                                continue;
                            }
                            if code > max_run_length_prefix {
                                let value = (code - max_run_length_prefix) as u8;
                                if is_dist_map {
                                    self.dist_context_map[context_index] = value;
                                } else {
                                    self.context_map[context_index] = value;
                                }
                                context_index += 1;
                                continue;
                            }
                        } else {
                            skip_preamble = false;
                        }
                        // RLE sub-stage.
                        let mut reps = 0u32;
                        if !self.br.safe_read_bits(input, code, &mut reps) {
                            self.code = code;
                            self.context_index = context_index as u32;
                            return Status::NeedsMoreInput;
                        }
                        let reps = reps + (1 << code);
                        if context_index + reps as usize > context_map_size {
                            return Status::Err(DecoderErrorCode::FormatContextMapRepeat);
                        }
                        for _ in 0..reps {
                            if is_dist_map {
                                self.dist_context_map[context_index] = 0;
                            } else {
                                self.context_map[context_index] = 0;
                            }
                            context_index += 1;
                        }
                    }
                    self.substate_context_map = SubstateContextMap::Transform;
                }
                SubstateContextMap::Transform => {
                    let mut bits = 0u32;
                    if !self.br.safe_read_bits(input, 1, &mut bits) {
                        return Status::NeedsMoreInput;
                    }
                    if bits != 0 {
                        let map = if is_dist_map {
                            &mut self.dist_context_map
                        } else {
                            &mut self.context_map
                        };
                        inverse_move_to_front_transform(map);
                    }
                    self.substate_context_map = SubstateContextMap::None;
                    return Status::Success;
                }
            }
        }
    }

    /// Decodes the trees of one tree group.
    fn huffman_tree_group_decode(&mut self, input: &[u8], which: usize) -> Status {
        if self.substate_tree_group != SubstateTreeGroup::Loop {
            self.htree_next_offset = 0;
            self.htree_index = 0;
            self.substate_tree_group = SubstateTreeGroup::Loop;
        }
        loop {
            let (group, huff, br) = match which {
                0 => (&mut self.literal_hgroup, &mut self.huff, &mut self.br),
                1 => (&mut self.insert_copy_hgroup, &mut self.huff, &mut self.br),
                _ => (&mut self.distance_hgroup, &mut self.huff, &mut self.br),
            };
            if self.htree_index >= group.num_htrees as usize {
                break;
            }
            let mut table_size = 0u32;
            let offset = self.htree_next_offset as usize;
            let result = read_huffman_code(
                huff,
                br,
                input,
                u32::from(group.alphabet_size),
                u32::from(group.max_symbol),
                &mut group.codes[offset..],
                Some(&mut table_size),
            );
            if result != Status::Success {
                return result;
            }
            group.htrees[self.htree_index] = offset as u32;
            self.htree_next_offset += table_size;
            self.htree_index += 1;
        }
        self.substate_tree_group = SubstateTreeGroup::None;
        Status::Success
    }

    /// Runs the state machine against one input window.
    ///
    /// `input` is consumed from `input_offset`; decoded bytes are written
    /// at `output_offset`. Both cursors advance.
    pub fn decompress_stream(
        &mut self,
        input: &[u8],
        input_offset: &mut usize,
        output: &mut [u8],
        output_offset: &mut usize,
    ) -> DecoderResult {
        // A terminal error is latched for good.
        if let Some(code) = self.latched_error {
            return DecoderResult::Error(code);
        }

        let mut result = Status::Success;
        // The window the bit reader sees: either the caller's input or the
        // internal spill buffer.
        let mut using_buffer = self.buffer_length != 0;
        if !using_buffer {
            self.br.reset_input();
        } else {
            // At least one more byte is needed to finish the pending read;
            // pulling happens in the main loop.
            result = Status::NeedsMoreInput;
            self.br.reset_input();
        }

        loop {
            let local_buf = self.buffer;
            let window: &[u8] = if using_buffer {
                &local_buf[..self.buffer_length as usize]
            } else {
                &input[*input_offset..]
            };

            if result != Status::Success {
                // Error or needs more input/output.
                if result == Status::NeedsMoreInput {
                    if !self.ringbuffer.is_empty() {
                        // Pro-actively push output.
                        let intermediate =
                            self.write_ring_buffer(output, output_offset, true);
                        if let Status::Err(code) = intermediate {
                            result = Status::Err(code);
                            break;
                        }
                    }
                    if using_buffer {
                        if self.br.byte_pos() == self.buffer_length as usize {
                            // The internal buffer is drained; switch back
                            // to the input stream.
                            self.buffer_length = 0;
                            using_buffer = false;
                            self.br.reset_input();
                            result = Status::Success;
                            continue;
                        } else if *input_offset != input.len() {
                            // Take one more byte from the stream into the
                            // buffer and retry.
                            self.buffer[self.buffer_length as usize] = input[*input_offset];
                            self.buffer_length += 1;
                            *input_offset += 1;
                            result = Status::Success;
                            continue;
                        }
                        // No more input to feed the pending read.
                        break;
                    } else {
                        // Stash the unconsumed tail in the spill buffer.
                        let consumed = self.br.byte_pos();
                        *input_offset += consumed;
                        let tail = input.len() - *input_offset;
                        debug_assert!(tail < 8);
                        self.buffer[..tail].copy_from_slice(&input[*input_offset..]);
                        self.buffer_length = tail as u32;
                        *input_offset = input.len();
                        break;
                    }
                }
                // Fail or needs more output.
                if using_buffer {
                    self.buffer_length = 0;
                } else {
                    self.br.unload();
                    *input_offset += self.br.byte_pos();
                    self.br.reset_input();
                }
                break;
            }

            match self.state {
                State::Uninited => {
                    if !self.br.warmup(window) {
                        result = Status::NeedsMoreInput;
                        continue;
                    }
                    result = self.decode_window_bits(); // Reads 1..8 bits.
                    if result != Status::Success {
                        continue;
                    }
                    if self.large_window {
                        self.state = State::LargeWindowBits;
                        continue;
                    }
                    self.state = State::Initialize;
                }
                State::LargeWindowBits => {
                    if !self.br.safe_read_bits(window, 6, &mut self.window_bits) {
                        result = Status::NeedsMoreInput;
                        continue;
                    }
                    if self.window_bits < LARGE_MIN_WINDOW_BITS
                        || self.window_bits > LARGE_MAX_WINDOW_BITS
                    {
                        result = Status::Err(DecoderErrorCode::FormatWindowBits);
                        continue;
                    }
                    self.state = State::Initialize;
                }
                State::Initialize => {
                    // Maximum distance, see RFC 7932 section 9.1.
                    self.max_backward_distance = (1usize << self.window_bits) - WINDOW_GAP;
                    self.block_type_trees =
                        vec![HuffmanCode::default(); 3 * HUFFMAN_MAX_SIZE_258];
                    self.block_len_trees =
                        vec![HuffmanCode::default(); 3 * HUFFMAN_MAX_SIZE_26];
                    self.state = State::MetablockBegin;
                }
                State::MetablockBegin => {
                    self.metablock_begin();
                    self.state = State::MetablockHeader;
                }
                State::MetablockHeader => {
                    result = self.decode_meta_block_length(window); // Reads 2..31 bits.
                    if result != Status::Success {
                        continue;
                    }
                    if self.is_metadata || self.is_uncompressed {
                        if !self.br.jump_to_byte_boundary() {
                            result = Status::Err(DecoderErrorCode::FormatPadding1);
                            continue;
                        }
                    }
                    if self.is_metadata {
                        self.state = State::Metadata;
                        continue;
                    }
                    if self.meta_block_remaining_len == 0 {
                        self.state = State::MetablockDone;
                        continue;
                    }
                    self.calculate_ring_buffer_size();
                    if self.is_uncompressed {
                        self.state = State::Uncompressed;
                        continue;
                    }
                    self.loop_counter = 0;
                    self.state = State::HuffmanCode0;
                }
                State::Uncompressed => {
                    result = self.copy_uncompressed_block_to_output(window, output, output_offset);
                    // Advance the input cursor over bytes taken directly.
                    if result == Status::Success {
                        self.state = State::MetablockDone;
                    }
                }
                State::Metadata => {
                    while self.meta_block_remaining_len > 0 {
                        let mut bits = 0u32;
                        // Read one byte and ignore it.
                        if !self.br.safe_read_bits(window, 8, &mut bits) {
                            result = Status::NeedsMoreInput;
                            break;
                        }
                        self.meta_block_remaining_len -= 1;
                    }
                    if result == Status::Success {
                        self.state = State::MetablockDone;
                    }
                }
                State::HuffmanCode0 => {
                    if self.loop_counter >= 3 {
                        self.state = State::MetablockHeader2;
                        continue;
                    }
                    // Reads 1..11 bits.
                    let i = self.loop_counter as usize;
                    result = decode_var_len_uint8(
                        &mut self.substate_decode_uint8,
                        &mut self.br,
                        window,
                        &mut self.num_block_types[i],
                    );
                    if result != Status::Success {
                        continue;
                    }
                    self.num_block_types[i] += 1;
                    if self.num_block_types[i] < 2 {
                        self.loop_counter += 1;
                        continue;
                    }
                    self.state = State::HuffmanCode1;
                }
                State::HuffmanCode1 => {
                    let alphabet_size = self.num_block_types[self.loop_counter as usize] + 2;
                    let tree_offset = self.loop_counter as usize * HUFFMAN_MAX_SIZE_258;
                    let mut trees = std::mem::take(&mut self.block_type_trees);
                    result = read_huffman_code(
                        &mut self.huff,
                        &mut self.br,
                        window,
                        alphabet_size,
                        alphabet_size,
                        &mut trees[tree_offset..],
                        None,
                    );
                    self.block_type_trees = trees;
                    if result != Status::Success {
                        continue;
                    }
                    self.state = State::HuffmanCode2;
                }
                State::HuffmanCode2 => {
                    let alphabet_size = NUM_BLOCK_LEN_SYMBOLS as u32;
                    let tree_offset = self.loop_counter as usize * HUFFMAN_MAX_SIZE_26;
                    let mut trees = std::mem::take(&mut self.block_len_trees);
                    result = read_huffman_code(
                        &mut self.huff,
                        &mut self.br,
                        window,
                        alphabet_size,
                        alphabet_size,
                        &mut trees[tree_offset..],
                        None,
                    );
                    self.block_len_trees = trees;
                    if result != Status::Success {
                        continue;
                    }
                    self.state = State::HuffmanCode3;
                }
                State::HuffmanCode3 => {
                    let tree_offset = self.loop_counter as usize * HUFFMAN_MAX_SIZE_26;
                    if !self.safe_read_block_length(window, tree_offset, self.loop_counter as usize)
                    {
                        result = Status::NeedsMoreInput;
                        continue;
                    }
                    self.loop_counter += 1;
                    self.state = State::HuffmanCode0;
                }
                State::MetablockHeader2 => {
                    let mut bits = 0u32;
                    if !self.br.safe_read_bits(window, 6, &mut bits) {
                        result = Status::NeedsMoreInput;
                        continue;
                    }
                    self.distance_postfix_bits = bits & bit_mask(2);
                    let bits = bits >> 2;
                    self.num_direct_distance_codes =
                        NUM_DISTANCE_SHORT_CODES as u32 + (bits << self.distance_postfix_bits);
                    self.distance_postfix_mask = bit_mask(self.distance_postfix_bits) as i32;
                    self.context_modes = vec![0u8; self.num_block_types[0] as usize];
                    self.loop_counter = 0;
                    self.state = State::ContextModes;
                }
                State::ContextModes => {
                    result = self.read_context_modes(window);
                    if result != Status::Success {
                        continue;
                    }
                    self.state = State::ContextMap1;
                }
                State::ContextMap1 => {
                    let size = (self.num_block_types[0] as usize) << LITERAL_CONTEXT_BITS;
                    result = self.decode_context_map(window, size, false);
                    if result != Status::Success {
                        continue;
                    }
                    self.detect_trivial_literal_block_types();
                    self.state = State::ContextMap2;
                }
                State::ContextMap2 => {
                    let num_direct_codes =
                        self.num_direct_distance_codes - NUM_DISTANCE_SHORT_CODES as u32;
                    let (num_distance_codes, max_distance_symbol_v) = if self.large_window {
                        (
                            distance_alphabet_size(
                                self.distance_postfix_bits,
                                num_direct_codes,
                                LARGE_MAX_DISTANCE_BITS,
                            ) as u32,
                            max_distance_symbol(num_direct_codes, self.distance_postfix_bits),
                        )
                    } else {
                        let n = distance_alphabet_size(
                            self.distance_postfix_bits,
                            num_direct_codes,
                            MAX_DISTANCE_BITS,
                        ) as u32;
                        (n, n)
                    };
                    let size = (self.num_block_types[2] as usize) << DISTANCE_CONTEXT_BITS;
                    result = self.decode_context_map(window, size, true);
                    if result != Status::Success {
                        continue;
                    }
                    self.literal_hgroup.init(
                        NUM_LITERAL_SYMBOLS as u32,
                        NUM_LITERAL_SYMBOLS as u32,
                        self.num_literal_htrees,
                    );
                    self.insert_copy_hgroup.init(
                        NUM_COMMAND_SYMBOLS as u32,
                        NUM_COMMAND_SYMBOLS as u32,
                        self.num_block_types[1],
                    );
                    self.distance_hgroup.init(
                        num_distance_codes,
                        max_distance_symbol_v,
                        self.num_dist_htrees,
                    );
                    self.loop_counter = 0;
                    self.state = State::TreeGroup;
                }
                State::TreeGroup => {
                    result = self.huffman_tree_group_decode(window, self.loop_counter as usize);
                    if result != Status::Success {
                        continue;
                    }
                    self.loop_counter += 1;
                    if self.loop_counter >= 3 {
                        self.prepare_literal_decoding();
                        self.dist_context_map_slice_offset = 0;
                        self.htree_command_offset = self.insert_copy_hgroup.htrees[0];
                        if !self.ensure_ring_buffer() {
                            result = Status::Err(DecoderErrorCode::AllocRingBuffer2);
                            continue;
                        }
                        self.state = State::CommandBegin;
                    }
                }
                State::CommandBegin
                | State::CommandInner
                | State::CommandPostDecodeLiterals
                | State::CommandPostWrapCopy => {
                    result = self.process_commands(false, window);
                    if result == Status::NeedsMoreInput {
                        result = self.process_commands(true, window);
                    }
                }
                State::CommandInnerWrite | State::CommandPostWrite1 | State::CommandPostWrite2 => {
                    result = self.write_ring_buffer(output, output_offset, false);
                    if result != Status::Success {
                        continue;
                    }
                    self.wrap_ring_buffer();
                    if self.ringbuffer_size == 1 << self.window_bits {
                        self.max_distance = self.max_backward_distance;
                    }
                    match self.state {
                        State::CommandPostWrite1 => {
                            if self.meta_block_remaining_len == 0 {
                                self.state = State::MetablockDone;
                            } else {
                                self.state = State::CommandBegin;
                            }
                        }
                        State::CommandPostWrite2 => {
                            self.state = State::CommandPostWrapCopy;
                        }
                        _ => {
                            if self.loop_counter == 0 {
                                if self.meta_block_remaining_len == 0 {
                                    self.state = State::MetablockDone;
                                } else {
                                    self.state = State::CommandPostDecodeLiterals;
                                }
                            } else {
                                self.state = State::CommandInner;
                            }
                        }
                    }
                }
                State::MetablockDone => {
                    if self.meta_block_remaining_len < 0 {
                        result = Status::Err(DecoderErrorCode::FormatBlockLength2);
                        continue;
                    }
                    if !self.is_last_metablock {
                        self.state = State::MetablockBegin;
                        continue;
                    }
                    if !self.br.jump_to_byte_boundary() {
                        result = Status::Err(DecoderErrorCode::FormatPadding2);
                        continue;
                    }
                    if self.buffer_length == 0 {
                        self.br.unload();
                        *input_offset += self.br.byte_pos();
                        self.br.reset_input();
                    }
                    self.state = State::Done;
                }
                State::Done => {
                    if !self.ringbuffer.is_empty() {
                        result = self.write_ring_buffer(output, output_offset, true);
                        if result != Status::Success {
                            continue;
                        }
                    }
                    return self.save_result(result);
                }
            }
        }
        self.save_result(result)
    }

    fn save_result(&mut self, status: Status) -> DecoderResult {
        match status {
            Status::Success => DecoderResult::Success,
            Status::NeedsMoreInput => DecoderResult::NeedsMoreInput,
            Status::NeedsMoreOutput => DecoderResult::NeedsMoreOutput,
            Status::Err(code) => {
                self.latched_error = Some(code);
                DecoderResult::Error(code)
            }
        }
    }
}

/// Inverse move-to-front over the decoded map values.
fn inverse_move_to_front_transform(v: &mut [u8]) {
    let mut mtf = [0u8; 256];
    for (i, m) in mtf.iter_mut().enumerate() {
        *m = i as u8;
    }
    for b in v.iter_mut() {
        let mut index = *b as usize;
        let value = mtf[index];
        *b = value;
        while index >= 1 {
            mtf[index] = mtf[index - 1];
            index -= 1;
        }
        mtf[0] = value;
    }
}

/// Why a one-shot decode failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFailure {
    /// The stream violates the format; carries the latched code.
    Format(DecoderErrorCode),
    /// The input ended before the stream did.
    TruncatedInput,
}

/// One-shot decompression helper used by the byte-oriented wrappers.
pub fn decompress_to_vec(input: &[u8]) -> Result<Vec<u8>, DecodeFailure> {
    let mut decoder = Decoder::new();
    let mut out = Vec::new();
    let mut buf = vec![0u8; 1 << 16];
    let mut input_offset = 0usize;
    loop {
        let mut output_offset = 0usize;
        let result = decoder.decompress_stream(input, &mut input_offset, &mut buf, &mut output_offset);
        out.extend_from_slice(&buf[..output_offset]);
        match result {
            DecoderResult::Success => return Ok(out),
            DecoderResult::NeedsMoreOutput => continue,
            DecoderResult::NeedsMoreInput => return Err(DecodeFailure::TruncatedInput),
            DecoderResult::Error(code) => return Err(DecodeFailure::Format(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_writer::{jump_to_byte_boundary, write_bits};

    /// Hand-craft a stream header plus meta-block header bits.
    fn craft(bits: &[(u32, u64)]) -> Vec<u8> {
        let mut storage = vec![0u8; 64];
        let mut pos = 0usize;
        for &(n, v) in bits {
            write_bits(n, v, &mut pos, &mut storage);
        }
        jump_to_byte_boundary(&mut pos, &mut storage);
        storage.truncate(pos >> 3);
        storage
    }

    #[test]
    fn test_empty_last_metablock() {
        // WBITS=16 ('0'), ISLAST=1, ISEMPTY=1.
        let input = craft(&[(1, 0), (1, 1), (1, 1)]);
        let out = decompress_to_vec(&input).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_exuberant_nibble_is_rejected() {
        // WBITS=16, ISLAST=0, MNIBBLES=2 (6 nibbles), MLEN with a zero
        // top nibble.
        let mut bits = vec![(1u32, 0u64), (1, 0), (2, 2)];
        for _ in 0..5 {
            bits.push((4, 5));
        }
        bits.push((4, 0)); // exuberant top nibble
        let input = craft(&bits);
        assert_eq!(
            decompress_to_vec(&input),
            Err(DecodeFailure::Format(DecoderErrorCode::FormatExuberantNibble))
        );
    }

    #[test]
    fn test_reserved_bit_is_rejected() {
        // WBITS=16, ISLAST=0, MNIBBLES=3 (metadata), reserved bit = 1.
        let input = craft(&[(1, 0), (1, 0), (2, 3), (1, 1)]);
        assert_eq!(
            decompress_to_vec(&input),
            Err(DecodeFailure::Format(DecoderErrorCode::FormatReserved))
        );
    }

    #[test]
    fn test_metadata_block_is_skipped() {
        // WBITS=16, ISLAST=0; metadata block with 1 length byte of value
        // 2, two payload bytes, then an empty last meta-block.
        let mut storage = vec![0u8; 64];
        let mut pos = 0usize;
        write_bits(1, 0, &mut pos, &mut storage); // wbits '0' => 16
        write_bits(1, 0, &mut pos, &mut storage); // ISLAST=0
        write_bits(2, 3, &mut pos, &mut storage); // MNIBBLES=3 -> metadata
        write_bits(1, 0, &mut pos, &mut storage); // reserved
        write_bits(2, 1, &mut pos, &mut storage); // MSKIPBYTES=1
        write_bits(8, 1, &mut pos, &mut storage); // MSKIPLEN-1 = 1 -> skip 2
        jump_to_byte_boundary(&mut pos, &mut storage);
        write_bits(8, 0xAA, &mut pos, &mut storage); // metadata payload
        write_bits(8, 0xBB, &mut pos, &mut storage);
        write_bits(1, 1, &mut pos, &mut storage); // ISLAST
        write_bits(1, 1, &mut pos, &mut storage); // ISEMPTY
        jump_to_byte_boundary(&mut pos, &mut storage);
        storage.truncate(pos >> 3);
        let out = decompress_to_vec(&storage).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_uncompressed_metablock_roundtrip() {
        let payload = b"raw bytes pass through unscathed";
        let mut storage = vec![0u8; 128];
        let mut pos = 0usize;
        write_bits(1, 0, &mut pos, &mut storage); // wbits 16
        crate::bit_stream::store_uncompressed_meta_block(
            true,
            payload,
            0,
            usize::MAX >> 1,
            payload.len(),
            &mut pos,
            &mut storage,
        );
        storage.truncate((pos + 7) >> 3);
        let out = decompress_to_vec(&storage).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_padding_error_on_nonzero_pad() {
        // Uncompressed block whose pre-payload padding carries a stray bit.
        let mut storage = vec![0u8; 64];
        let mut pos = 0usize;
        write_bits(1, 0, &mut pos, &mut storage); // wbits 16
        write_bits(1, 0, &mut pos, &mut storage); // ISLAST=0
        write_bits(2, 0, &mut pos, &mut storage); // MNIBBLES=0 -> 4 nibbles
        write_bits(16, 7, &mut pos, &mut storage); // MLEN-1 = 7
        write_bits(1, 1, &mut pos, &mut storage); // ISUNCOMPRESSED
        write_bits(1, 1, &mut pos, &mut storage); // stray padding bit
        jump_to_byte_boundary(&mut pos, &mut storage);
        for _ in 0..8 {
            write_bits(8, 0x55, &mut pos, &mut storage);
        }
        write_bits(1, 1, &mut pos, &mut storage);
        write_bits(1, 1, &mut pos, &mut storage);
        jump_to_byte_boundary(&mut pos, &mut storage);
        storage.truncate(pos >> 3);
        assert_eq!(
            decompress_to_vec(&storage),
            Err(DecodeFailure::Format(DecoderErrorCode::FormatPadding1))
        );
    }

    #[test]
    fn test_huffman_space_error() {
        // A complex literal code whose length weights sum below 2^15.
        let mut storage = vec![0u8; 64];
        let mut pos = 0usize;
        let mut w = |n: u32, v: u64, storage: &mut Vec<u8>, pos: &mut usize| {
            write_bits(n, v, pos, storage);
        };
        w(1, 0, &mut storage, &mut pos); // WBITS = 16
        w(1, 1, &mut storage, &mut pos); // ISLAST
        w(1, 0, &mut storage, &mut pos); // ISEMPTY = 0
        w(2, 0, &mut storage, &mut pos); // MNIBBLES -> 4
        w(16, 0, &mut storage, &mut pos); // MLEN - 1 = 0
        w(3, 0, &mut storage, &mut pos); // three NBLTYPES = 1
        w(6, 0, &mut storage, &mut pos); // NPOSTFIX, NDIRECT
        w(2, 0, &mut storage, &mut pos); // context mode
        w(1, 0, &mut storage, &mut pos); // literal map: NTREES = 1
        w(1, 0, &mut storage, &mut pos); // distance map: NTREES = 1
        // Literal tree: complex code, skip_some = 0.
        w(2, 0, &mut storage, &mut pos);
        // Code-length code lengths, storage order 1,2,3,4,0,5,17:
        w(2, 0, &mut storage, &mut pos); // cl 1 -> 0
        w(4, 7, &mut storage, &mut pos); // cl 2 -> depth 1
        w(2, 0, &mut storage, &mut pos); // cl 3 -> 0
        w(2, 0, &mut storage, &mut pos); // cl 4 -> 0
        w(2, 0, &mut storage, &mut pos); // cl 0 -> 0
        w(2, 0, &mut storage, &mut pos); // cl 5 -> 0
        w(4, 7, &mut storage, &mut pos); // cl 17 -> depth 1; space exhausted
        // Symbol lengths: one symbol of length 2, then repeat-zero runs
        // that overflow the alphabet, leaving the space underfull.
        w(1, 0, &mut storage, &mut pos); // cl 2: symbol 0 has length 2
        for _ in 0..3 {
            w(1, 1, &mut storage, &mut pos); // cl 17
            w(3, 7, &mut storage, &mut pos); // max extra
        }
        jump_to_byte_boundary(&mut pos, &mut storage);
        storage.truncate((pos >> 3) + 4);
        assert_eq!(
            decompress_to_vec(&storage),
            Err(DecodeFailure::Format(DecoderErrorCode::FormatHuffmanSpace))
        );
    }

    #[test]
    fn test_dictionary_length_out_of_range() {
        // A copy of length 25 whose distance points past the window must
        // be rejected: dictionary words cover lengths 4..=24 only.
        use crate::bit_stream::store_meta_block_trivial;
        use crate::command::Command;
        use crate::params::{DistanceParams, EncoderParams};

        let params = EncoderParams::default();
        let dist = DistanceParams::new(0, 0, false);
        let commands = [Command::new(&dist, 0, 25, 0, 2000 + 15)];
        let data = [0x41u8; 32];
        let mut storage = vec![0u8; 256];
        let mut pos = 0usize;
        write_bits(1, 0, &mut pos, &mut storage); // WBITS = 16
        store_meta_block_trivial(
            &data,
            0,
            25,
            usize::MAX >> 1,
            true,
            &params,
            &commands,
            &mut pos,
            &mut storage,
        );
        storage.truncate(((pos + 7) >> 3) + 4);
        assert_eq!(
            decompress_to_vec(&storage),
            Err(DecodeFailure::Format(DecoderErrorCode::FormatDictionary))
        );
    }

    #[test]
    fn test_error_is_latched() {
        let input = craft(&[(1, 0), (1, 0), (2, 3), (1, 1)]);
        let mut decoder = Decoder::new();
        let mut out = vec![0u8; 64];
        let mut in_off = 0usize;
        let mut out_off = 0usize;
        let first = decoder.decompress_stream(&input, &mut in_off, &mut out, &mut out_off);
        assert!(matches!(first, DecoderResult::Error(_)));
        // Subsequent calls keep returning the same terminal code.
        let mut in_off2 = 0usize;
        let second = decoder.decompress_stream(&input, &mut in_off2, &mut out, &mut out_off);
        assert_eq!(first, second);
        assert_eq!(
            decoder.error_code(),
            Some(DecoderErrorCode::FormatReserved)
        );
    }
}
