//! Response post-processing: make bare URLs tappable by surrounding them
//! with whitespace. Chat clients often fail to linkify a URL glued to CJK or
//! punctuation characters.

use once_cell::sync::Lazy;
use regex::Regex;

// The word boundary must be ASCII-only ((?-u:\b)): with the Unicode-aware
// default, CJK characters count as word characters and a host-only URL glued
// to CJK text would not match at all.
static LINK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://(www\.)?[-a-zA-Z0-9@:%._\+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}(?-u:\b)([-a-zA-Z0-9()@:%_\+.~#?&/=]*)")
        .expect("link regex")
});

fn is_space(b: u8) -> bool {
    b == b' ' || b == b'\t' || b == b'\n' || b == b'\r'
}

/// Ensure exactly one space separates each URL from adjacent non-whitespace
/// text. Whitespace that is already present is left untouched, so the
/// function is idempotent.
pub fn format_links(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut result = String::with_capacity(text.len());
    let mut last_idx = 0;
    for m in LINK_REGEX.find_iter(text) {
        let (start, end) = (m.start(), m.end());
        result.push_str(&text[last_idx..start]);
        if start > 0 && !is_space(bytes[start - 1]) {
            result.push(' ');
        }
        result.push_str(m.as_str());
        if end < bytes.len() && !is_space(bytes[end]) {
            result.push(' ');
        }
        last_idx = end;
    }
    result.push_str(&text[last_idx..]);
    result
}
