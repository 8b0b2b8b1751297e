//! Byte-level tokenizer with a handful of reserved specials.
//!
//! Ids `0..4` are `<pad>`, `<bos>`, `<eos>`, `<unk>`; id `4 + b` is byte `b`.
//! Decoding renders valid UTF-8 runs as text, specials as their markers and
//! stray bytes as `<0xNN>`; encoding parses those markers back, so any id
//! sequence survives a decode/encode round trip.

use crate::{Error, Result};

const SPECIALS: [&str; 4] = ["<pad>", "<bos>", "<eos>", "<unk>"];
const BYTE_OFFSET: u32 = SPECIALS.len() as u32;

/// Deterministic 260-entry byte vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const PAD: u32 = 0;
    pub const BOS: u32 = 1;
    pub const EOS: u32 = 2;
    pub const UNK: u32 = 3;
    pub const VOCAB_SIZE: usize = SPECIALS.len() + 256;

    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Append text, escaping `<` so no byte run can be read back as a marker.
    fn push_text(out: &mut String, text: &str) {
        for part in text.split_inclusive('<') {
            match part.strip_suffix('<') {
                Some(head) => {
                    out.push_str(head);
                    out.push_str("<0x3C>");
                }
                None => out.push_str(part),
            }
        }
    }

    fn push_bytes(out: &mut String, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    Self::push_text(out, s);
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // The prefix was just validated.
                    Self::push_text(out, std::str::from_utf8(&rest[..valid]).unwrap_or_default());
                    let bad = e.error_len().unwrap_or(rest.len() - valid);
                    for b in &rest[valid..valid + bad] {
                        out.push_str(&format!("<0x{b:02X}>"));
                    }
                    rest = &rest[valid + bad..];
                }
            }
        }
    }

    fn parse_byte_marker(s: &str) -> Option<u8> {
        let hex = s.strip_prefix("<0x")?.get(..3)?;
        let (digits, close) = hex.split_at(2);
        if close != ">" || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u8::from_str_radix(digits, 16).ok()
    }
}

impl super::Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_bos {
            ids.push(Self::BOS);
        }
        let mut rest = text;
        'outer: while let Some(c) = rest.chars().next() {
            if c == '<' {
                if let Some(b) = Self::parse_byte_marker(rest) {
                    ids.push(BYTE_OFFSET + u32::from(b));
                    rest = &rest[6..];
                    continue;
                }
                for (id, marker) in (0u32..).zip(SPECIALS) {
                    if let Some(tail) = rest.strip_prefix(marker) {
                        ids.push(id);
                        rest = tail;
                        continue 'outer;
                    }
                }
            }
            let mut buf = [0u8; 4];
            ids.extend(
                c.encode_utf8(&mut buf)
                    .bytes()
                    .map(|b| BYTE_OFFSET + u32::from(b)),
            );
            rest = &rest[c.len_utf8()..];
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut out = String::with_capacity(ids.len());
        let mut run = Vec::new();
        for &id in ids {
            if id >= BYTE_OFFSET {
                let b = u8::try_from(id - BYTE_OFFSET).map_err(|_| {
                    Error::Tokenizer(format!(
                        "id {id} outside byte vocabulary of {}",
                        Self::VOCAB_SIZE
                    ))
                })?;
                run.push(b);
            } else {
                Self::push_bytes(&mut out, &run);
                run.clear();
                out.push_str(SPECIALS[id as usize]);
            }
        }
        Self::push_bytes(&mut out, &run);
        Ok(out)
    }

    fn eos_token_id(&self) -> u32 {
        Self::EOS
    }

    fn pad_token_id(&self) -> u32 {
        Self::PAD
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tokenizer;

    #[test]
    fn test_ascii_round_trip() {
        let t = ByteTokenizer::new();
        let ids = t.encode("hi!", true).unwrap();
        assert_eq!(ids, vec![1, 4 + 104, 4 + 105, 4 + 33]);
        assert_eq!(t.decode(&ids).unwrap(), "<bos>hi!");
    }

    #[test]
    fn test_utf8_text() {
        let t = ByteTokenizer::new();
        let ids = t.encode("é€", false).unwrap();
        assert_eq!(ids.len(), 5);
        assert_eq!(t.decode(&ids).unwrap(), "é€");
    }

    #[test]
    fn test_invalid_bytes_round_trip() {
        let t = ByteTokenizer::new();
        // 0xFF is never valid; 0xE2 0x82 is a truncated sequence before eos.
        let ids = vec![4 + 0x41, 4 + 0xFF, 4 + 0xE2, 4 + 0x82, 2, 0, 4 + 0x42];
        let text = t.decode(&ids).unwrap();
        assert_eq!(text, "A<0xFF><0xE2><0x82><eos><pad>B");
        assert_eq!(t.encode(&text, false).unwrap(), ids);
    }

    #[test]
    fn test_out_of_range_id() {
        let t = ByteTokenizer::new();
        assert!(t.decode(&[260]).is_err());
    }

    #[test]
    fn test_lone_angle_bracket_is_a_byte() {
        let t = ByteTokenizer::new();
        assert_eq!(t.encode("<x", false).unwrap(), vec![4 + 60, 4 + 120]);
    }

    #[test]
    fn test_literal_marker_text_round_trips() {
        let t = ByteTokenizer::new();
        // The bytes of "<eos>" must not come back as the eos token.
        let ids = t.encode("a<0x3C>eos>", false).unwrap();
        assert_eq!(ids, vec![4 + 97, 4 + 60, 4 + 101, 4 + 111, 4 + 115, 4 + 62]);
        let text = t.decode(&ids).unwrap();
        assert_eq!(text, "a<0x3C>eos>");
        assert_eq!(t.encode(&text, false).unwrap(), ids);
    }
}
