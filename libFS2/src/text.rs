//! Transcript to symbol-id conversion.
//!
//! Plain text is mapped character by character; precomposed Hangul syllables are first split into
//! their conjoining jamo. Phone sequences can be given in curly braces, e.g. `"{HH AH0 L OW1}"`,
//! and are looked up with an `@` prefix so they never collide with characters.

use std::collections::HashMap;
use std::sync::OnceLock;

const PAD: &str = "_";
const EOS: &str = "~";
const PUNCTUATION: &str = "!'(),-.:;? ";

const HANGUL_BASE: u32 = 0xAC00;
const HANGUL_LAST: u32 = 0xD7A3;
const JAMO_LEAD_BASE: u32 = 0x1100;
const JAMO_VOWEL_BASE: u32 = 0x1161;
const JAMO_TAIL_BASE: u32 = 0x11A7; // tail index 0 means "no trailing consonant"
const N_LEAD: u32 = 19;
const N_VOWEL: u32 = 21;
const N_TAIL: u32 = 28;

const ARPABET: [&str; 84] = [
    "AA", "AA0", "AA1", "AA2", "AE", "AE0", "AE1", "AE2", "AH", "AH0", "AH1", "AH2", "AO", "AO0",
    "AO1", "AO2", "AW", "AW0", "AW1", "AW2", "AY", "AY0", "AY1", "AY2", "B", "CH", "D", "DH", "EH",
    "EH0", "EH1", "EH2", "ER", "ER0", "ER1", "ER2", "EY", "EY0", "EY1", "EY2", "F", "G", "HH", "IH",
    "IH0", "IH1", "IH2", "IY", "IY0", "IY1", "IY2", "JH", "K", "L", "M", "N", "NG", "OW", "OW0",
    "OW1", "OW2", "OY", "OY0", "OY1", "OY2", "P", "R", "S", "SH", "T", "TH", "UH", "UH0", "UH1",
    "UH2", "UW", "UW0", "UW1", "UW2", "V", "W", "Y", "Z", "ZH",
];

struct SymbolTable {
    symbols: Vec<String>,
    ids: HashMap<String, i64>,
}

fn table() -> &'static SymbolTable {
    static TABLE: OnceLock<SymbolTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut symbols = vec![PAD.to_string(), EOS.to_string()];
        symbols.extend(PUNCTUATION.chars().map(String::from));
        let jamo = |base: u32, n: u32| {
            (base..base + n).filter_map(char::from_u32).map(String::from).collect::<Vec<_>>()
        };
        symbols.extend(jamo(JAMO_LEAD_BASE, N_LEAD));
        symbols.extend(jamo(JAMO_VOWEL_BASE, N_VOWEL));
        symbols.extend(jamo(JAMO_TAIL_BASE + 1, N_TAIL - 1));
        symbols.extend(ARPABET.iter().map(|p| format!("@{p}")));
        let ids = symbols.iter().enumerate().map(|(i, s)| (s.clone(), i as i64)).collect();
        SymbolTable { symbols, ids }
    })
}

/// All symbols in id order. Id 0 is the padding symbol.
pub fn symbols() -> &'static [String] {
    &table().symbols
}

pub fn symbol_to_id(symbol: &str) -> Option<i64> {
    table().ids.get(symbol).copied()
}

fn decompose_hangul(c: char, out: &mut Vec<char>) {
    let code = c as u32;
    if !(HANGUL_BASE..=HANGUL_LAST).contains(&code) {
        out.push(c);
        return;
    }
    let s = code - HANGUL_BASE;
    let lead = s / (N_VOWEL * N_TAIL);
    let vowel = (s % (N_VOWEL * N_TAIL)) / N_TAIL;
    let tail = s % N_TAIL;
    out.extend(char::from_u32(JAMO_LEAD_BASE + lead));
    out.extend(char::from_u32(JAMO_VOWEL_BASE + vowel));
    if tail > 0 {
        out.extend(char::from_u32(JAMO_TAIL_BASE + tail));
    }
}

// Pad and eos are reserved and never produced from text.
fn keep(symbol: &str) -> Option<i64> {
    if symbol == PAD || symbol == EOS {
        return None;
    }
    symbol_to_id(symbol)
}

fn chars_to_ids(text: &str, out: &mut Vec<i64>) {
    let mut chars = Vec::with_capacity(text.len());
    for c in text.chars() {
        decompose_hangul(c, &mut chars);
    }
    let mut buf = [0u8; 4];
    out.extend(chars.into_iter().filter_map(|c| keep(c.encode_utf8(&mut buf))));
}

/// Converts a transcript into symbol ids. Unknown characters are dropped.
pub fn text_to_sequence(text: &str) -> Vec<i64> {
    let mut seq = Vec::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        chars_to_ids(&rest[..open], &mut seq);
        for phone in rest[open + 1..close].split_whitespace() {
            seq.extend(keep(&format!("@{phone}")));
        }
        rest = &rest[close + 1..];
    }
    chars_to_ids(rest, &mut seq);
    seq
}

/// Inverse of [`text_to_sequence`], used for diagnostics. Phones are wrapped in curly braces
/// again; jamo are not recomposed.
pub fn sequence_to_text(seq: &[i64]) -> String {
    let symbols = symbols();
    let mut out = String::new();
    for &id in seq {
        let Some(s) = usize::try_from(id).ok().and_then(|i| symbols.get(i)) else {
            continue;
        };
        match s.strip_prefix('@') {
            Some(phone) => {
                out.push('{');
                out.push_str(phone);
                out.push('}');
            }
            None => out.push_str(s),
        }
    }
    out.replace("}{", " ")
}
