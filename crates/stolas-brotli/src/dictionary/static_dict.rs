//! Encoder-side static dictionary matcher.
//!
//! Probes the bucket of the first four bytes, walks the chain, and tries
//! every applicable transform inline: omit-last cuts against partial
//! matches, suffix transforms against the bytes following the match, and
//! a handful of prefix transforms via re-probes at small offsets.

use super::{dict_hash, transforms::TRANSFORM_UPPERCASE_FIRST, EncoderDictionary};
use crate::hash::find_match_length_with_limit;

pub const K_INVALID_MATCH: u32 = 0xFFF_FFFF;

/// Longest output a transformed dictionary word can produce.
pub const MAX_STATIC_DICTIONARY_MATCH_LEN: usize = 37;

#[inline]
fn add_match(distance: usize, len: usize, len_code: usize, matches: &mut [u32]) {
    if len < matches.len() {
        let match_ = ((distance << 5) + len_code) as u32;
        matches[len] = matches[len].min(match_);
    }
}

#[inline]
fn dict_match_length(
    dict: &EncoderDictionary,
    data: &[u8],
    id: usize,
    len: usize,
    maxlen: usize,
) -> usize {
    let word = dict.words.word(len, id);
    find_match_length_with_limit(word, data, len.min(maxlen).min(data.len()))
}

/// Whether the (possibly case-transformed) dictionary word matches `data`
/// in full.
fn is_match(dict: &EncoderDictionary, len: usize, idx: usize, transform: u8, data: &[u8]) -> bool {
    if len > data.len() {
        return false;
    }
    let word = dict.words.word(len, idx);
    if transform == 0 {
        return find_match_length_with_limit(word, data, len) == len;
    }
    if transform == TRANSFORM_UPPERCASE_FIRST {
        // Only ASCII words carry case variants in the index.
        return word[0].is_ascii_lowercase()
            && (word[0] ^ 32) == data[0]
            && find_match_length_with_limit(&word[1..], &data[1..], len - 1) == len - 1;
    }
    for i in 0..len {
        if word[i].is_ascii_lowercase() {
            if word[i] ^ 32 != data[i] {
                return false;
            }
        } else if word[i] != data[i] {
            return false;
        }
    }
    true
}

#[inline]
fn tail(data: &[u8], from: usize) -> &[u8] {
    if from < data.len() {
        &data[from..]
    } else {
        &[]
    }
}

#[inline]
fn starts(s: &[u8], pat: &[u8]) -> bool {
    s.len() >= pat.len() && &s[..pat.len()] == pat
}

/// Finds all transformed dictionary matches at `data`, recording the
/// cheapest `(distance << 5) | len_code` per output length in `matches`.
pub fn find_all_static_dictionary_matches(
    dict: &EncoderDictionary,
    data: &[u8],
    min_length: usize,
    max_length: usize,
    matches: &mut [u32],
) -> bool {
    if data.len() < 4 {
        return false;
    }
    let mut has_found_match = false;

    {
        let mut offset = dict.buckets[dict_hash(data) as usize] as usize;
        let mut end = offset == 0;
        while !end {
            let w = dict.dict_words[offset];
            offset += 1;
            let l = (w.len & 0x1F) as usize;
            let n = 1usize << dict.words.size_bits_by_length[l];
            let id = w.idx as usize;
            end = w.len & 0x80 != 0;
            if w.transform == 0 {
                let matchlen = dict_match_length(dict, data, id, l, max_length);

                // Transform "" + identity + "".
                if matchlen == l {
                    add_match(id, l, l, matches);
                    has_found_match = true;
                }

                // Omit-last-1, and omit-last-1 + "ing ".
                if matchlen >= l.saturating_sub(1) && l >= 1 {
                    add_match(id + 12 * n, l - 1, l, matches);
                    if l + 2 < max_length && starts(tail(data, l - 1), b"ing ") {
                        add_match(id + 49 * n, l + 3, l, matches);
                    }
                    has_found_match = true;
                }

                // Omit-last-N for N = 2..=9.
                let mut minlen = min_length;
                if l > 9 {
                    minlen = minlen.max(l - 9);
                }
                let maxlen = matchlen.min(l.saturating_sub(2));
                for len in minlen..=maxlen {
                    let cut = l - len;
                    let transform_id =
                        (cut << 2) + ((dict.cutoff_transforms >> (cut * 6)) & 0x3F) as usize;
                    add_match(id + transform_id * n, len, l, matches);
                    has_found_match = true;
                }

                if matchlen < l || l + 6 >= max_length {
                    continue;
                }

                // "" + identity + <suffix>.
                let s = tail(data, l);
                if starts(s, b" ") {
                    add_match(id + n, l + 1, l, matches);
                    if starts(s, b" a ") {
                        add_match(id + 28 * n, l + 3, l, matches);
                    } else if starts(s, b" as ") {
                        add_match(id + 46 * n, l + 4, l, matches);
                    } else if starts(s, b" at ") {
                        add_match(id + 60 * n, l + 4, l, matches);
                    } else if starts(s, b" and ") {
                        add_match(id + 10 * n, l + 5, l, matches);
                    } else if starts(s, b" by ") {
                        add_match(id + 38 * n, l + 4, l, matches);
                    } else if starts(s, b" in ") {
                        add_match(id + 16 * n, l + 4, l, matches);
                    } else if starts(s, b" is ") {
                        add_match(id + 47 * n, l + 4, l, matches);
                    } else if starts(s, b" for ") {
                        add_match(id + 25 * n, l + 5, l, matches);
                    } else if starts(s, b" from ") {
                        add_match(id + 37 * n, l + 6, l, matches);
                    } else if starts(s, b" of ") {
                        add_match(id + 8 * n, l + 4, l, matches);
                    } else if starts(s, b" on ") {
                        add_match(id + 45 * n, l + 4, l, matches);
                    } else if starts(s, b" not ") {
                        add_match(id + 80 * n, l + 5, l, matches);
                    } else if starts(s, b" the ") {
                        add_match(id + 5 * n, l + 5, l, matches);
                    } else if starts(s, b" that ") {
                        add_match(id + 29 * n, l + 6, l, matches);
                    } else if starts(s, b" to ") {
                        add_match(id + 17 * n, l + 4, l, matches);
                    } else if starts(s, b" with ") {
                        add_match(id + 35 * n, l + 6, l, matches);
                    }
                } else if starts(s, b"\"") {
                    add_match(id + 19 * n, l + 1, l, matches);
                    if starts(s, b"\">") {
                        add_match(id + 21 * n, l + 2, l, matches);
                    }
                } else if starts(s, b".") {
                    add_match(id + 20 * n, l + 1, l, matches);
                    if starts(s, b". ") {
                        add_match(id + 31 * n, l + 2, l, matches);
                        if starts(s, b". The ") {
                            add_match(id + 43 * n, l + 6, l, matches);
                        } else if starts(s, b". This ") {
                            add_match(id + 75 * n, l + 7, l, matches);
                        }
                    }
                } else if starts(s, b",") {
                    add_match(id + 76 * n, l + 1, l, matches);
                    if starts(s, b", ") {
                        add_match(id + 14 * n, l + 2, l, matches);
                    }
                } else if starts(s, b"\n") {
                    add_match(id + 22 * n, l + 1, l, matches);
                    if starts(s, b"\n\t") {
                        add_match(id + 50 * n, l + 2, l, matches);
                    }
                } else if starts(s, b"]") {
                    add_match(id + 24 * n, l + 1, l, matches);
                } else if starts(s, b"'") {
                    add_match(id + 36 * n, l + 1, l, matches);
                } else if starts(s, b":") {
                    add_match(id + 51 * n, l + 1, l, matches);
                } else if starts(s, b"(") {
                    add_match(id + 57 * n, l + 1, l, matches);
                } else if starts(s, b"=") {
                    if starts(s, b"=\"") {
                        add_match(id + 70 * n, l + 2, l, matches);
                    } else if starts(s, b"='") {
                        add_match(id + 86 * n, l + 2, l, matches);
                    }
                } else if starts(s, b"al ") {
                    add_match(id + 84 * n, l + 3, l, matches);
                } else if starts(s, b"ed ") {
                    add_match(id + 53 * n, l + 3, l, matches);
                } else if starts(s, b"er ") {
                    add_match(id + 82 * n, l + 3, l, matches);
                } else if starts(s, b"est ") {
                    add_match(id + 95 * n, l + 4, l, matches);
                } else if starts(s, b"ful ") {
                    add_match(id + 90 * n, l + 4, l, matches);
                } else if starts(s, b"ive ") {
                    add_match(id + 92 * n, l + 4, l, matches);
                } else if starts(s, b"ize ") {
                    add_match(id + 100 * n, l + 4, l, matches);
                } else if starts(s, b"less ") {
                    add_match(id + 93 * n, l + 5, l, matches);
                } else if starts(s, b"ly ") {
                    add_match(id + 61 * n, l + 3, l, matches);
                } else if starts(s, b"ous ") {
                    add_match(id + 106 * n, l + 4, l, matches);
                }
            } else {
                // Upper-case-first / upper-case-all base and suffix forms.
                let is_all_caps = w.transform != TRANSFORM_UPPERCASE_FIRST;
                if !is_match(dict, l, id, w.transform, data) {
                    continue;
                }
                add_match(id + if is_all_caps { 44 } else { 9 } * n, l, l, matches);
                has_found_match = true;
                if l + 1 >= max_length {
                    continue;
                }
                let s = tail(data, l);
                if starts(s, b" ") {
                    add_match(id + if is_all_caps { 68 } else { 4 } * n, l + 1, l, matches);
                } else if starts(s, b"\"") {
                    add_match(id + if is_all_caps { 87 } else { 66 } * n, l + 1, l, matches);
                    if starts(s, b"\">") {
                        add_match(id + if is_all_caps { 97 } else { 69 } * n, l + 2, l, matches);
                    }
                } else if starts(s, b".") {
                    add_match(id + if is_all_caps { 101 } else { 79 } * n, l + 1, l, matches);
                    if starts(s, b". ") {
                        add_match(id + if is_all_caps { 114 } else { 88 } * n, l + 2, l, matches);
                    }
                } else if starts(s, b",") {
                    add_match(id + if is_all_caps { 112 } else { 99 } * n, l + 1, l, matches);
                    if starts(s, b", ") {
                        add_match(id + if is_all_caps { 107 } else { 58 } * n, l + 2, l, matches);
                    }
                } else if starts(s, b"'") {
                    add_match(id + if is_all_caps { 94 } else { 74 } * n, l + 1, l, matches);
                } else if starts(s, b"(") {
                    add_match(id + if is_all_caps { 113 } else { 78 } * n, l + 1, l, matches);
                } else if starts(s, b"=") {
                    if starts(s, b"=\"") {
                        add_match(id + if is_all_caps { 105 } else { 104 } * n, l + 2, l, matches);
                    } else if starts(s, b"='") {
                        add_match(id + if is_all_caps { 116 } else { 108 } * n, l + 2, l, matches);
                    }
                }
            }
        }
    }

    // Transforms with prefixes " " and ".".
    if max_length >= 5 && (data[0] == b' ' || data[0] == b'.') {
        let is_space = data[0] == b' ';
        let mut offset = dict.buckets[dict_hash(&data[1..]) as usize] as usize;
        let mut end = offset == 0;
        while !end {
            let w = dict.dict_words[offset];
            offset += 1;
            let l = (w.len & 0x1F) as usize;
            let n = 1usize << dict.words.size_bits_by_length[l];
            let id = w.idx as usize;
            end = w.len & 0x80 != 0;
            if w.transform == 0 {
                if !is_match(dict, l, id, 0, &data[1..]) {
                    continue;
                }
                add_match(id + if is_space { 6 } else { 32 } * n, l + 1, l, matches);
                has_found_match = true;
                if l + 2 >= max_length {
                    continue;
                }
                let s = tail(data, l + 1);
                if starts(s, b" ") {
                    add_match(id + if is_space { 2 } else { 77 } * n, l + 2, l, matches);
                } else if starts(s, b"(") {
                    add_match(id + if is_space { 89 } else { 67 } * n, l + 2, l, matches);
                } else if is_space {
                    if starts(s, b",") {
                        add_match(id + 103 * n, l + 2, l, matches);
                        if starts(s, b", ") {
                            add_match(id + 33 * n, l + 3, l, matches);
                        }
                    } else if starts(s, b".") {
                        add_match(id + 71 * n, l + 2, l, matches);
                        if starts(s, b". ") {
                            add_match(id + 52 * n, l + 3, l, matches);
                        }
                    } else if starts(s, b"=") {
                        if starts(s, b"=\"") {
                            add_match(id + 81 * n, l + 3, l, matches);
                        } else if starts(s, b"='") {
                            add_match(id + 98 * n, l + 3, l, matches);
                        }
                    }
                }
            } else if is_space {
                let is_all_caps = w.transform != TRANSFORM_UPPERCASE_FIRST;
                if !is_match(dict, l, id, w.transform, &data[1..]) {
                    continue;
                }
                add_match(id + if is_all_caps { 85 } else { 30 } * n, l + 1, l, matches);
                has_found_match = true;
                if l + 2 >= max_length {
                    continue;
                }
                let s = tail(data, l + 1);
                if starts(s, b" ") {
                    add_match(id + if is_all_caps { 83 } else { 15 } * n, l + 2, l, matches);
                } else if starts(s, b",") {
                    if !is_all_caps {
                        add_match(id + 109 * n, l + 2, l, matches);
                    }
                    if starts(s, b", ") {
                        add_match(id + if is_all_caps { 111 } else { 65 } * n, l + 3, l, matches);
                    }
                } else if starts(s, b".") {
                    add_match(id + if is_all_caps { 115 } else { 96 } * n, l + 2, l, matches);
                    if starts(s, b". ") {
                        add_match(id + if is_all_caps { 117 } else { 91 } * n, l + 3, l, matches);
                    }
                } else if starts(s, b"=") {
                    if starts(s, b"=\"") {
                        add_match(id + if is_all_caps { 110 } else { 118 } * n, l + 3, l, matches);
                    } else if starts(s, b"='") {
                        add_match(id + if is_all_caps { 119 } else { 120 } * n, l + 3, l, matches);
                    }
                }
            }
        }
    }

    // Transforms with prefixes "e ", "s ", ", " and "\xC2\xA0".
    if max_length >= 6 && data.len() >= 6 {
        if (data[1] == b' ' && (data[0] == b'e' || data[0] == b's' || data[0] == b','))
            || (data[0] == 0xC2 && data[1] == 0xA0)
        {
            let mut offset = dict.buckets[dict_hash(&data[2..]) as usize] as usize;
            let mut end = offset == 0;
            while !end {
                let w = dict.dict_words[offset];
                offset += 1;
                let l = (w.len & 0x1F) as usize;
                let n = 1usize << dict.words.size_bits_by_length[l];
                let id = w.idx as usize;
                end = w.len & 0x80 != 0;
                if w.transform == 0 && is_match(dict, l, id, 0, &data[2..]) {
                    if data[0] == 0xC2 {
                        add_match(id + 102 * n, l + 2, l, matches);
                        has_found_match = true;
                    } else if l + 2 < max_length && tail(data, l + 2).first() == Some(&b' ') {
                        let t = match data[0] {
                            b'e' => 18,
                            b's' => 7,
                            _ => 13,
                        };
                        add_match(id + t * n, l + 3, l, matches);
                        has_found_match = true;
                    }
                }
            }
        }
    }

    // Transforms with prefixes " the " and ".com/".
    if max_length >= 9 && data.len() >= 9 && (starts(data, b" the ") || starts(data, b".com/")) {
        let mut offset = dict.buckets[dict_hash(&data[5..]) as usize] as usize;
        let mut end = offset == 0;
        while !end {
            let w = dict.dict_words[offset];
            offset += 1;
            let l = (w.len & 0x1F) as usize;
            let n = 1usize << dict.words.size_bits_by_length[l];
            let id = w.idx as usize;
            end = w.len & 0x80 != 0;
            if w.transform == 0 && is_match(dict, l, id, 0, &data[5..]) {
                add_match(
                    id + if data[0] == b' ' { 41 } else { 72 } * n,
                    l + 5,
                    l,
                    matches,
                );
                has_found_match = true;
                if l + 5 < max_length && data[0] == b' ' {
                    let s = tail(data, l + 5);
                    if l + 8 < max_length && starts(s, b" of ") {
                        add_match(id + 62 * n, l + 9, l, matches);
                        if l + 12 < max_length && starts(s, b" of the ") {
                            add_match(id + 73 * n, l + 13, l, matches);
                        }
                    }
                }
            }
        }
    }

    has_found_match
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::get_encoder_dictionary;

    fn matches_for(data: &[u8]) -> [u32; MAX_STATIC_DICTIONARY_MATCH_LEN + 1] {
        let mut matches = [K_INVALID_MATCH; MAX_STATIC_DICTIONARY_MATCH_LEN + 1];
        find_all_static_dictionary_matches(get_encoder_dictionary(), data, 4, 37, &mut matches);
        matches
    }

    #[test]
    fn test_identity_word_match() {
        let m = matches_for(b"information overload");
        // "information" has length 11; the identity match must be present.
        assert_ne!(m[11], K_INVALID_MATCH);
        assert_eq!((m[11] & 31) as usize, 11);
    }

    #[test]
    fn test_uppercase_first_match() {
        let m = matches_for(b"Information overload");
        assert_ne!(m[11], K_INVALID_MATCH);
    }

    #[test]
    fn test_suffix_space_transform() {
        // "information " should be matched via the identity + " " form.
        let m = matches_for(b"information  x y z padding");
        assert_ne!(m[12], K_INVALID_MATCH);
    }

    #[test]
    fn test_no_match_on_garbage() {
        let m = matches_for(b"qzxjvkwpqzxjvkwp");
        assert!(m.iter().all(|&v| v == K_INVALID_MATCH));
    }

    #[test]
    fn test_roundtrip_through_transform() {
        // Every reported match must reproduce the input when the decoder
        // applies the transform to the referenced word.
        let datas: [&[u8]; 4] = [
            b"information overload",
            b"Information, please report",
            b" the system of the day",
            b"people, not machines....",
        ];
        let dict = get_encoder_dictionary();
        for data in datas {
            let mut matches = [K_INVALID_MATCH; MAX_STATIC_DICTIONARY_MATCH_LEN + 1];
            find_all_static_dictionary_matches(dict, data, 4, data.len(), &mut matches);
            for (len, &m) in matches.iter().enumerate() {
                if m == K_INVALID_MATCH || len > data.len() {
                    continue;
                }
                let word_len = (m & 31) as usize;
                let address = (m >> 5) as usize;
                let size_bits = dict.words.size_bits_by_length[word_len];
                let word_idx = address & ((1 << size_bits) - 1);
                let transform_idx = address >> size_bits;
                let word = dict.words.word(word_len, word_idx);
                let mut out = vec![0u8; word_len + 32];
                let n = crate::dictionary::transform_dictionary_word(
                    &mut out,
                    word,
                    word_len,
                    transform_idx,
                );
                assert_eq!(
                    &out[..n],
                    &data[..len],
                    "transform {} of {:?} for len {}",
                    transform_idx,
                    String::from_utf8_lossy(word),
                    len
                );
                assert_eq!(n, len);
            }
        }
    }
}
