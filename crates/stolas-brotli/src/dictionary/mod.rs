//! The static dictionary: word bank, transforms, and the encoder-side
//! match index.
//!
//! The word bank and transform table are process-wide read-only data. The
//! encoder's hash/bucket tables are derived from the bank once at first
//! use; decoder lookups address the bank directly.

pub mod static_dict;
pub mod transforms;
pub mod words;

use std::sync::OnceLock;

use crate::constants::{MAX_DICTIONARY_WORD_LENGTH, MIN_DICTIONARY_WORD_LENGTH};
use transforms::{K_CUTOFF_TRANSFORMS, K_CUTOFF_TRANSFORMS_COUNT, TRANSFORM_UPPERCASE_ALL, TRANSFORM_UPPERCASE_FIRST};

pub use static_dict::{find_all_static_dictionary_matches, K_INVALID_MATCH};
pub use transforms::{transform_dictionary_word, NUM_TRANSFORMS};

/// Bits of the word-bank hash.
pub const K_DICT_NUM_BITS: u32 = 15;
const K_DICT_HASH_MUL_32: u32 = 0x1E35_A7BD;

/// The word bank: concatenated words, indexed by (length, word index).
pub struct Dictionary {
    /// Log2 of the word count for each length; lengths without words have
    /// zero and a zero offset delta.
    pub size_bits_by_length: [u8; 32],
    pub offsets_by_length: [u32; 32],
    pub data: Vec<u8>,
}

impl Dictionary {
    pub fn word(&self, len: usize, word_idx: usize) -> &[u8] {
        let offset = self.offsets_by_length[len] as usize + len * word_idx;
        &self.data[offset..offset + len]
    }

    /// Number of words of the given length.
    pub fn num_words(&self, len: usize) -> usize {
        1usize << self.size_bits_by_length[len]
    }
}

/// 4-byte probe hash over word data.
pub fn dict_hash(data: &[u8]) -> u32 {
    let h = u32::from_le_bytes([data[0], data[1], data[2], data[3]]).wrapping_mul(K_DICT_HASH_MUL_32);
    h >> (32 - K_DICT_NUM_BITS)
}

/// One entry of the encoder's bucket chains. Bit 7 of `len` marks the
/// last entry of its bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct DictWord {
    pub len: u8,
    pub transform: u8,
    pub idx: u16,
}

/// Dictionary data plus the derived encoder-side indexes.
pub struct EncoderDictionary {
    pub words: &'static Dictionary,
    pub cutoff_transforms_count: u32,
    pub cutoff_transforms: u64,
    /// Shallow probe table: `(word_idx << 5) | len`, 0 = empty.
    pub hash_table: Vec<u16>,
    /// Bucket heads: offsets into `dict_words`, 0 = empty.
    pub buckets: Vec<u16>,
    pub dict_words: Vec<DictWord>,
}

impl EncoderDictionary {
    #[inline]
    pub fn hash(&self, data: &[u8]) -> u32 {
        dict_hash(data)
    }
}

fn build_dictionary() -> Dictionary {
    let mut size_bits_by_length = [0u8; 32];
    let mut offsets_by_length = [0u32; 32];
    let mut data = Vec::new();
    for len in MIN_DICTIONARY_WORD_LENGTH..=MAX_DICTIONARY_WORD_LENGTH {
        let bank = words::WORDS_BY_LENGTH[len];
        assert!(bank.len().is_power_of_two(), "bank {} not a power of two", len);
        offsets_by_length[len] = data.len() as u32;
        size_bits_by_length[len] = bank.len().trailing_zeros() as u8;
        for word in bank {
            assert_eq!(word.len(), len, "word {:?} has wrong length", word);
            data.extend_from_slice(word.as_bytes());
        }
    }
    offsets_by_length[MAX_DICTIONARY_WORD_LENGTH + 1] = data.len() as u32;
    Dictionary {
        size_bits_by_length,
        offsets_by_length,
        data,
    }
}

fn uppercase_probe(word: &[u8], all: bool) -> [u8; 4] {
    let mut probe = [word[0], word[1], word[2], word[3]];
    let limit = if all { 4 } else { 1 };
    for b in probe.iter_mut().take(limit) {
        if b.is_ascii_lowercase() {
            *b ^= 32;
        }
    }
    probe
}

fn build_encoder_dictionary(words: &'static Dictionary) -> EncoderDictionary {
    // Chain words per bucket; identity plus the two case transforms the
    // matcher probes inline.
    let mut chains: Vec<Vec<DictWord>> = vec![Vec::new(); 1 << K_DICT_NUM_BITS];
    for len in MIN_DICTIONARY_WORD_LENGTH..=MAX_DICTIONARY_WORD_LENGTH {
        for idx in 0..words.num_words(len) {
            let word = words.word(len, idx);
            chains[dict_hash(word) as usize].push(DictWord {
                len: len as u8,
                transform: 0,
                idx: idx as u16,
            });
            if word[0].is_ascii_lowercase() {
                let first = uppercase_probe(word, false);
                chains[dict_hash(&first) as usize].push(DictWord {
                    len: len as u8,
                    transform: TRANSFORM_UPPERCASE_FIRST,
                    idx: idx as u16,
                });
                let all = uppercase_probe(word, true);
                if all != first {
                    chains[dict_hash(&all) as usize].push(DictWord {
                        len: len as u8,
                        transform: TRANSFORM_UPPERCASE_ALL,
                        idx: idx as u16,
                    });
                }
            }
        }
    }

    let mut buckets = vec![0u16; 1 << K_DICT_NUM_BITS];
    // Offset 0 is the "empty bucket" sentinel.
    let mut dict_words = vec![DictWord::default()];
    for (bucket, chain) in chains.into_iter().enumerate() {
        if chain.is_empty() {
            continue;
        }
        buckets[bucket] = dict_words.len() as u16;
        let last = chain.len() - 1;
        for (i, mut w) in chain.into_iter().enumerate() {
            if i == last {
                w.len |= 0x80;
            }
            dict_words.push(w);
        }
    }

    // Shallow two-slot probe table keyed by the same hash.
    let mut hash_table = vec![0u16; 1 << (K_DICT_NUM_BITS + 1)];
    for len in MIN_DICTIONARY_WORD_LENGTH..=MAX_DICTIONARY_WORD_LENGTH {
        for idx in 0..words.num_words(len) {
            let word = words.word(len, idx);
            let key = (dict_hash(word) << 1) as usize;
            let item = ((idx as u16) << 5) | len as u16;
            if hash_table[key] == 0 {
                hash_table[key] = item;
            } else if hash_table[key + 1] == 0 {
                hash_table[key + 1] = item;
            }
        }
    }

    EncoderDictionary {
        words,
        cutoff_transforms_count: K_CUTOFF_TRANSFORMS_COUNT,
        cutoff_transforms: K_CUTOFF_TRANSFORMS,
        hash_table,
        buckets,
        dict_words,
    }
}

static DICTIONARY: OnceLock<Dictionary> = OnceLock::new();
static ENCODER_DICTIONARY: OnceLock<EncoderDictionary> = OnceLock::new();

pub fn get_dictionary() -> &'static Dictionary {
    DICTIONARY.get_or_init(build_dictionary)
}

pub fn get_encoder_dictionary() -> &'static EncoderDictionary {
    ENCODER_DICTIONARY.get_or_init(|| build_encoder_dictionary(get_dictionary()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bank_layout() {
        let d = get_dictionary();
        for len in MIN_DICTIONARY_WORD_LENGTH..=MAX_DICTIONARY_WORD_LENGTH {
            assert!(d.num_words(len) >= 2, "length {} missing words", len);
            for idx in 0..d.num_words(len) {
                assert_eq!(d.word(len, idx).len(), len);
            }
        }
    }

    #[test]
    fn test_bucket_chains_terminate() {
        let ed = get_encoder_dictionary();
        for &start in ed.buckets.iter() {
            if start == 0 {
                continue;
            }
            let mut offset = start as usize;
            let mut steps = 0;
            loop {
                let w = ed.dict_words[offset];
                steps += 1;
                assert!(steps < 10_000);
                if w.len & 0x80 != 0 {
                    break;
                }
                offset += 1;
            }
        }
    }

    #[test]
    fn test_probe_table_addresses_valid_words() {
        let ed = get_encoder_dictionary();
        for &item in ed.hash_table.iter() {
            if item == 0 {
                continue;
            }
            let len = (item & 0x1F) as usize;
            let idx = (item >> 5) as usize;
            assert!((MIN_DICTIONARY_WORD_LENGTH..=MAX_DICTIONARY_WORD_LENGTH).contains(&len));
            assert!(idx < ed.words.num_words(len));
        }
    }
}
