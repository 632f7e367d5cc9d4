//! Utility functions for text normalization and logging.
//!
//! - Whitespace normalization for text pulled out of article markup
//! - String truncation for log previews
//! - JSON error detection for handling truncated model responses

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Collapse a fragment of markup text onto one line.
///
/// Non-breaking spaces become plain spaces, whitespace runs collapse to a
/// single space, and the result is trimmed.
pub fn normalize_single_line(s: &str) -> String {
    let s = s.replace('\u{00A0}', " ");
    WHITESPACE_RUN.replace_all(&s, " ").trim().to_string()
}

/// Normalize multi-line text: trim each line and drop the empty ones.
pub fn normalize_multiline(s: &str) -> String {
    s.replace('\u{00A0}', " ")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncate a string for logging purposes.
///
/// Long strings are cut at the last char boundary at or before `max` bytes
/// with an ellipsis and byte count appended.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Detect if a serde_json error indicates truncated/incomplete JSON.
///
/// A model response cut off by its token limit fails with an EOF error;
/// callers use this to re-ask once instead of failing the record.
pub fn looks_truncated(e: &serde_json::Error) -> bool {
    use serde_json::error::Category;
    matches!(e.classify(), Category::Eof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_single_line() {
        assert_eq!(normalize_single_line("  a\u{00A0}\u{00A0}b \n\t c  "), "a b c");
        assert_eq!(normalize_single_line(""), "");
    }

    #[test]
    fn test_normalize_multiline() {
        let raw = "  first line  \n\n\u{00A0}\n second\u{00A0}line \r\n";
        assert_eq!(normalize_multiline(raw), "first line\nsecond line");
    }

    #[test]
    fn test_truncate_for_log_short_string() {
        assert_eq!(truncate_for_log("Hello, world!", 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_for_log_multibyte() {
        // each Hangul syllable is 3 bytes; cutting at 4 must back off to 3
        let result = truncate_for_log("가나다", 4);
        assert_eq!(result, "가…(+6 bytes)");
    }

    #[test]
    fn test_looks_truncated() {
        let json_eof = r#"{"field": "value"#;
        let err = serde_json::from_str::<serde_json::Value>(json_eof).unwrap_err();
        assert!(looks_truncated(&err));

        let json_bad = r#"{"field": value}"#;
        let err = serde_json::from_str::<serde_json::Value>(json_bad).unwrap_err();
        assert!(!looks_truncated(&err));
    }
}
