//! Pure text sanitation helpers.
//!
//! Functions here must remain side-effect free so they can be composed from
//! handlers and extractors without introducing hidden IO.

use unicode_normalization::UnicodeNormalization;

use crate::constants::TRUNCATION_MARKER;

/// Normalize extracted text: NFC, lossy-decode artifacts kept as U+FFFD,
/// control characters below U+0020 stripped except TAB and LF. CRLF collapses
/// to LF before the control sweep so Windows line endings survive as newlines.
pub fn normalize_extracted(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");
    unified
        .nfc()
        .filter(|&c| c == '\n' || c == '\t' || c >= '\u{20}')
        .collect()
}

/// Outcome of applying the extraction text cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CappedText {
    pub text: String,
    pub truncated: bool,
}

/// Truncate `input` to at most `cap` bytes on a char boundary, appending the
/// truncation marker when anything was dropped.
pub fn cap_text(input: String, cap: usize) -> CappedText {
    if input.len() <= cap {
        return CappedText {
            text: input,
            truncated: false,
        };
    }

    let mut cut = cap;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut text = input[..cut].to_string();
    text.push_str(TRUNCATION_MARKER);
    CappedText {
        text,
        truncated: true,
    }
}

/// Validate a user-supplied string field: reject NUL outright, strip other
/// disallowed control characters. Returns `None` when the input contains NUL.
pub fn sanitize_field(input: &str) -> Option<String> {
    if input.contains('\0') {
        return None;
    }
    Some(
        input
            .chars()
            .filter(|&c| c == '\n' || c == '\t' || c >= '\u{20}')
            .collect(),
    )
}

/// Strip path separators and control characters from a client filename.
/// Falls back to `upload.bin` when nothing survives.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "upload.bin".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Rough heuristic for code-heavy content: fenced blocks, or punctuation
/// density above one character in ten.
pub fn looks_like_code(input: &str) -> bool {
    if input.contains("```") {
        return true;
    }
    let total = input.chars().count();
    if total == 0 {
        return false;
    }
    let punct = input
        .chars()
        .filter(|c| c.is_ascii_punctuation())
        .count();
    punct * 10 > total
}
