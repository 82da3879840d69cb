//! Best-effort PDF extractor.
//!
//! Pulls text from literal string operands in uncompressed content streams
//! and counts page objects. Compressed object streams are reported via a
//! warning instead of being inflated; full-fidelity PDF parsing stays behind
//! the extractor contract so it can be swapped without touching the pipeline.

use async_trait::async_trait;
use serde_json::json;

use super::{ExtractError, ExtractInput, ExtractionKind, Extractor, RawExtraction};

const PDF_MAGIC: &[u8] = b"%PDF-";

pub struct PdfExtractor;

#[async_trait]
impl Extractor for PdfExtractor {
    fn id(&self) -> &'static str {
        "pdf-text"
    }

    fn version(&self) -> &'static str {
        "1"
    }

    fn handles(&self, mime: &str) -> bool {
        mime == "application/pdf"
    }

    async fn extract(&self, input: ExtractInput<'_>) -> Result<RawExtraction, ExtractError> {
        if !input.bytes.starts_with(PDF_MAGIC) {
            return Err(ExtractError::Malformed("missing %PDF header".to_string()));
        }
        if contains(input.bytes, b"/Encrypt") {
            return Err(ExtractError::Encrypted);
        }

        let page_count = count_pages(input.bytes);
        let text = extract_literal_strings(input.bytes, input.text_cap);

        let mut raw = RawExtraction::new(ExtractionKind::Text, text).with_metadata(json!({
            "page_count": page_count,
            "bytes": input.size_hint,
        }));
        if contains(input.bytes, b"FlateDecode") {
            raw = raw.with_warning("compressed streams skipped");
        }
        Ok(raw)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Count `/Type /Page` dictionary entries, tolerating optional whitespace and
/// excluding the `/Pages` tree node.
fn count_pages(bytes: &[u8]) -> usize {
    let mut count = 0;
    let needle = b"/Type";
    let mut i = 0;
    while i + needle.len() <= bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            let mut j = i + needle.len();
            while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\r' || bytes[j] == b'\n') {
                j += 1;
            }
            if bytes[j..].starts_with(b"/Page") && !bytes[j..].starts_with(b"/Pages") {
                count += 1;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    count
}

/// Collect literal string operands `(...)` used by text-showing operators.
/// Handles backslash escapes and balanced nested parentheses.
fn extract_literal_strings(bytes: &[u8], cap: usize) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < bytes.len() && out.len() < cap {
        if bytes[i] != b'(' {
            i += 1;
            continue;
        }

        let mut depth = 1;
        let mut literal = Vec::new();
        i += 1;
        while i < bytes.len() && depth > 0 {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => {
                    let escaped = bytes[i + 1];
                    match escaped {
                        b'n' => literal.push(b'\n'),
                        b't' => literal.push(b'\t'),
                        b'(' | b')' | b'\\' => literal.push(escaped),
                        _ => {}
                    }
                    i += 2;
                }
                b'(' => {
                    depth += 1;
                    literal.push(b'(');
                    i += 1;
                }
                b')' => {
                    depth -= 1;
                    if depth > 0 {
                        literal.push(b')');
                    }
                    i += 1;
                }
                other => {
                    literal.push(other);
                    i += 1;
                }
            }
        }

        // Only keep operands actually fed to a text operator.
        let rest = &bytes[i..];
        let is_text_op = trimmed_starts_with(rest, b"Tj")
            || trimmed_starts_with(rest, b"TJ")
            || trimmed_starts_with(rest, b"'")
            || rest.first() == Some(&b']');
        if is_text_op && !literal.is_empty() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&String::from_utf8_lossy(&literal));
        }
    }
    out
}

fn trimmed_starts_with(bytes: &[u8], prefix: &[u8]) -> bool {
    let mut i = 0;
    while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\r' || bytes[i] == b'\n') {
        i += 1;
    }
    bytes[i..].starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mini_pdf(body: &str) -> Vec<u8> {
        let mut bytes = b"%PDF-1.4\n".to_vec();
        bytes.extend_from_slice(body.as_bytes());
        bytes.extend_from_slice(b"\n%%EOF");
        bytes
    }

    #[tokio::test]
    async fn extracts_text_operands_and_pages() {
        let pdf = mini_pdf(
            "1 0 obj << /Type /Page >> endobj\n\
             2 0 obj << /Type /Page >> endobj\n\
             3 0 obj << /Type /Pages /Count 2 >> endobj\n\
             BT (Hello) Tj (world) Tj ET",
        );
        let raw = PdfExtractor
            .extract(ExtractInput {
                bytes: &pdf,
                mime: "application/pdf",
                size_hint: pdf.len() as u64,
                text_cap: 4096,
            })
            .await
            .unwrap();
        assert_eq!(raw.metadata["page_count"], 2);
        assert!(raw.text.contains("Hello"));
        assert!(raw.text.contains("world"));
    }

    #[tokio::test]
    async fn non_pdf_bytes_are_malformed() {
        let err = PdfExtractor
            .extract(ExtractInput {
                bytes: b"plain text",
                mime: "application/pdf",
                size_hint: 10,
                text_cap: 4096,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Malformed(_)));
    }

    #[tokio::test]
    async fn encrypted_documents_are_typed() {
        let pdf = mini_pdf("<< /Encrypt 5 0 R >>");
        let err = PdfExtractor
            .extract(ExtractInput {
                bytes: &pdf,
                mime: "application/pdf",
                size_hint: pdf.len() as u64,
                text_cap: 4096,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Encrypted));
    }

    #[tokio::test]
    async fn compressed_streams_produce_warning() {
        let pdf = mini_pdf("<< /Filter /FlateDecode >> stream\nxxxx\nendstream");
        let raw = PdfExtractor
            .extract(ExtractInput {
                bytes: &pdf,
                mime: "application/pdf",
                size_hint: pdf.len() as u64,
                text_cap: 4096,
            })
            .await
            .unwrap();
        assert_eq!(raw.warnings.len(), 1);
    }

    #[test]
    fn escaped_parentheses_are_unescaped() {
        let text = extract_literal_strings(br"(a \(nested\) b) Tj", 1024);
        assert_eq!(text, "a (nested) b");
    }
}
