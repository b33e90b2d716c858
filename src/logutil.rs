//! Logging helpers so SMS content and numbers stay on one line and out of plain sight.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates long SMS bodies (over `MAX_PREVIEW` chars) with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 160;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Ctrl-Z terminates a CMGS body; make it visible in traces
            '\u{1a}' => out.push_str("<SUB>"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Keep the country/prefix and the last three digits of a phone number.
pub fn mask_number(number: &str) -> String {
    let chars: Vec<char> = number.chars().collect();
    if chars.len() <= 6 {
        return number.to_string();
    }
    let head = if chars[0] == '+' { 4 } else { 3 };
    let tail = 3;
    let hidden = chars.len().saturating_sub(head + tail);
    let mut out: String = chars[..head].iter().collect();
    out.extend(std::iter::repeat('*').take(hidden));
    out.extend(&chars[chars.len() - tail..]);
    out
}

#[cfg(test)]
mod tests {
    use super::{escape_log, mask_number};

    #[test]
    fn escapes_newlines_and_ctrl_z() {
        let s = "Line1\nLine2\r\tEnd\u{1a}";
        assert_eq!(escape_log(s), "Line1\\nLine2\\r\\tEnd<SUB>");
    }

    #[test]
    fn masks_middle_digits() {
        assert_eq!(mask_number("+420777123456"), "+420******456");
        assert_eq!(mask_number("5550100"), "555*100");
        assert_eq!(mask_number("112"), "112");
    }
}
