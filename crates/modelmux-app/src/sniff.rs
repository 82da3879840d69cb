//! Magic-number MIME detection over the leading bytes of an upload.
//!
//! Detection ignores the client-declared type; a mismatch is recorded on the
//! file record but is not itself an error.

const SNIFF_WINDOW: usize = 512;

/// Detect a MIME type from content. Falls back to a text/binary heuristic
/// and finally to `application/octet-stream`.
pub fn detect_mime(bytes: &[u8], declared_name: &str) -> &'static str {
    let head = &bytes[..bytes.len().min(SNIFF_WINDOW)];

    if head.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if head.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return "image/png";
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if head.starts_with(b"BM") {
        return "image/bmp";
    }
    if head.starts_with(b"RIFF") && head.len() >= 12 {
        return match &head[8..12] {
            b"WEBP" => "image/webp",
            b"WAVE" => "audio/wav",
            _ => "application/octet-stream",
        };
    }
    if head.starts_with(b"OggS") {
        return "audio/ogg";
    }
    if head.starts_with(b"ID3") || head.starts_with(&[0xFF, 0xFB]) || head.starts_with(&[0xFF, 0xF3])
    {
        return "audio/mpeg";
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return "audio/mp4";
    }
    if head.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
        // ZIP container: distinguish OOXML documents by their content-type
        // part name, which lands in the first local file header.
        if contains(bytes, b"word/") {
            return "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
        }
        if contains(bytes, b"xl/") {
            return "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
        }
        return "application/zip";
    }

    if looks_textual(head) {
        return textual_mime(head, declared_name);
    }

    "application/octet-stream"
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// A sniff window with no NUL bytes and mostly printable content is text.
fn looks_textual(head: &[u8]) -> bool {
    if head.is_empty() {
        return false;
    }
    if head.contains(&0) {
        return false;
    }
    let printable = head
        .iter()
        .filter(|&&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..0x7F).contains(&b) || b >= 0x80)
        .count();
    printable * 100 >= head.len() * 95
}

fn textual_mime(head: &[u8], declared_name: &str) -> &'static str {
    let trimmed = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &head[i..])
        .unwrap_or(head);
    if trimmed.starts_with(b"{") || trimmed.starts_with(b"[") {
        return "application/json";
    }

    let extension = declared_name
        .rsplit('.')
        .next()
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("csv") => "text/csv",
        Some("md") | Some("markdown") => "text/markdown",
        _ => "text/plain",
    }
}
