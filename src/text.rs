//! Text normalization and the short deterministic hash used for message ids.

use unicode_normalization::UnicodeNormalization;

/// Unicode-normalize (NFC) and trim surrounding whitespace, using the
/// whitespace set browsers use for `String.prototype.trim`.
pub fn normalize_text(text: &str) -> String {
    text.nfc()
        .collect::<String>()
        .trim_matches(is_page_whitespace)
        .to_string()
}

/// ECMAScript WhiteSpace and LineTerminator: Unicode White_Space minus NEL,
/// plus the byte order mark.
fn is_page_whitespace(c: char) -> bool {
    match c {
        '\u{FEFF}' => true,
        '\u{0085}' => false,
        c => c.is_whitespace(),
    }
}

/// 32-bit rolling `h * 31 + unit` over UTF-16 code units, folded to the
/// absolute value in lowercase hex. Stable across platforms and Rust versions.
pub fn hash_string(s: &str) -> String {
    let mut hash: i32 = 0;
    for unit in s.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    format!("{:x}", hash.unsigned_abs())
}

/// First `max_chars` characters of `text`.
pub fn summarize(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_whitespace() {
        assert_eq!(normalize_text("  Hi \n"), "Hi");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn normalize_trims_like_the_page_does() {
        assert_eq!(normalize_text("\u{FEFF}Hi\u{FEFF}"), "Hi");
        assert_eq!(normalize_text("\u{A0}\u{3000}Hi\u{2028}"), "Hi");
        assert_eq!(normalize_text("\u{85}Hi"), "\u{85}Hi");
        assert_eq!(hash_string(&normalize_text("\u{FEFF}Hi ")), "921");
    }

    #[test]
    fn normalize_composes_combining_marks() {
        // "e" + COMBINING ACUTE ACCENT -> "é"
        assert_eq!(normalize_text("caf\u{0065}\u{0301}"), "caf\u{00e9}");
    }

    #[test]
    fn hash_known_values() {
        assert_eq!(hash_string(""), "0");
        assert_eq!(hash_string("a"), "61");
        assert_eq!(hash_string("Hi"), "921");
    }

    #[test]
    fn hash_is_deterministic_for_non_ascii() {
        let a = hash_string("你好，世界 🌍");
        let b = hash_string("你好，世界 🌍");
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_wraps_instead_of_overflowing() {
        let long = "x".repeat(10_000);
        assert!(!hash_string(&long).is_empty());
    }

    #[test]
    fn summarize_counts_characters_not_bytes() {
        assert_eq!(summarize("héllo wörld", 5), "héllo");
        assert_eq!(summarize("短文本", 20), "短文本");
    }
}
