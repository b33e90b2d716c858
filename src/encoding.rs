//! Text encoding decisions for outgoing SMS.
//!
//! A message goes out either in the narrow 7-bit alphabet or as UCS2. The
//! classifier treats plain ASCII as narrow and anything else as wide, which is
//! stricter than the full GSM 03.38 table.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsEncoding {
    Gsm7,
    Ucs2,
}

impl SmsEncoding {
    /// Characters (septets or UTF-16 units) per segment: (single message, part of a concatenated one).
    pub fn segment_limits(self) -> (usize, usize) {
        match self {
            SmsEncoding::Gsm7 => (160, 153),
            SmsEncoding::Ucs2 => (70, 67),
        }
    }

    /// Data coding scheme byte used with `AT+CSMP`.
    pub fn dcs(self) -> u8 {
        match self {
            SmsEncoding::Gsm7 => 0,
            SmsEncoding::Ucs2 => 8,
        }
    }
}

/// Whether `text` needs wide (UCS2) encoding.
pub fn needs_wide_encoding(text: &str) -> bool {
    !text.is_ascii()
}

/// Explicit hint wins; otherwise the classifier decides.
pub fn select_encoding(unicode_hint: Option<bool>, text: &str) -> SmsEncoding {
    let wide = unicode_hint.unwrap_or_else(|| needs_wide_encoding(text));
    if wide {
        SmsEncoding::Ucs2
    } else {
        SmsEncoding::Gsm7
    }
}

// ASCII characters that live in the GSM 7-bit extension table and cost two septets.
fn gsm7_cost(ch: char) -> usize {
    match ch {
        '^' | '{' | '}' | '\\' | '[' | ']' | '~' | '|' => 2,
        _ => 1,
    }
}

/// Split `text` into the segments a modem will transmit, never cutting a
/// surrogate pair or an escaped GSM-7 character.
pub fn split_segments(text: &str, encoding: SmsEncoding) -> Vec<String> {
    let cost = |ch: char| match encoding {
        SmsEncoding::Gsm7 => gsm7_cost(ch),
        SmsEncoding::Ucs2 => ch.len_utf16(),
    };
    let (single, multi) = encoding.segment_limits();
    let total: usize = text.chars().map(cost).sum();
    if total <= single {
        return vec![text.to_string()];
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut used = 0usize;
    for ch in text.chars() {
        let c = cost(ch);
        if used + c > multi {
            parts.push(std::mem::take(&mut current));
            used = 0;
        }
        current.push(ch);
        used += c;
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Hex-encode text as big-endian UTF-16, the form modems expect with `AT+CSCS="UCS2"`.
pub fn ucs2_hex_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 4);
    for unit in text.encode_utf16() {
        let _ = write!(out, "{:04X}", unit);
    }
    out
}

/// Decode a UCS2 hex string. Returns `None` when the input is not a whole
/// number of hex-encoded UTF-16 units.
pub fn ucs2_hex_decode(hex: &str) -> Option<String> {
    let hex = hex.trim();
    if hex.len() % 4 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let units: Vec<u16> = (0..hex.len())
        .step_by(4)
        .map(|i| u16::from_str_radix(&hex[i..i + 4], 16))
        .collect::<Result<_, _>>()
        .ok()?;
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_text_stays_narrow() {
        assert!(!needs_wide_encoding("Hello World"));
        assert!(!needs_wide_encoding(""));
    }

    #[test]
    fn czech_text_needs_wide() {
        assert!(needs_wide_encoding("Příliš žluťoučký kůň"));
    }

    #[test]
    fn hint_overrides_classifier() {
        assert_eq!(select_encoding(Some(true), "plain"), SmsEncoding::Ucs2);
        assert_eq!(select_encoding(Some(false), "kůň"), SmsEncoding::Gsm7);
        assert_eq!(select_encoding(None, "kůň"), SmsEncoding::Ucs2);
    }

    #[test]
    fn short_text_is_single_segment() {
        assert_eq!(split_segments("hi", SmsEncoding::Gsm7), vec!["hi".to_string()]);
        let exactly = "a".repeat(160);
        assert_eq!(split_segments(&exactly, SmsEncoding::Gsm7).len(), 1);
    }

    #[test]
    fn long_gsm7_text_splits_at_153() {
        let text = "a".repeat(161);
        let parts = split_segments(&text, SmsEncoding::Gsm7);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 153);
        assert_eq!(parts[1].len(), 8);
    }

    #[test]
    fn extension_chars_count_double() {
        // 80 braces cost 160 septets: still one message
        let text = "{".repeat(80);
        assert_eq!(split_segments(&text, SmsEncoding::Gsm7).len(), 1);
        let text = "{".repeat(81);
        assert_eq!(split_segments(&text, SmsEncoding::Gsm7).len(), 2);
    }

    #[test]
    fn ucs2_split_keeps_surrogate_pairs_whole() {
        let text = "🙂".repeat(40); // 80 UTF-16 units
        let parts = split_segments(&text, SmsEncoding::Ucs2);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.encode_utf16().count() <= 67));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn ucs2_hex_codec() {
        assert_eq!(ucs2_hex_encode("A+ž"), "0041002B017E");
        assert_eq!(ucs2_hex_decode("0041002B017E").as_deref(), Some("A+ž"));
        assert_eq!(ucs2_hex_decode("004"), None);
        assert_eq!(ucs2_hex_decode("+420"), None);
    }
}
