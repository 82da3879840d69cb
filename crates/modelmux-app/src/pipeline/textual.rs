//! Extractors for text-shaped formats: plain text/markdown, CSV, JSON.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ExtractError, ExtractInput, ExtractionKind, Extractor, RawExtraction};

/// Plain text and markdown. Bytes are decoded lossily; invalid sequences
/// surface as U+FFFD and are cleaned up by the normalization pass.
pub struct PlainTextExtractor;

#[async_trait]
impl Extractor for PlainTextExtractor {
    fn id(&self) -> &'static str {
        "text-plain"
    }

    fn version(&self) -> &'static str {
        "1"
    }

    fn handles(&self, mime: &str) -> bool {
        matches!(mime, "text/plain" | "text/markdown")
    }

    async fn extract(&self, input: ExtractInput<'_>) -> Result<RawExtraction, ExtractError> {
        let text = String::from_utf8_lossy(input.bytes).into_owned();
        let line_count = text.lines().count();
        let text_length = text.chars().count();
        Ok(RawExtraction::new(ExtractionKind::Text, text).with_metadata(json!({
            "line_count": line_count,
            "text_length": text_length,
        })))
    }
}

/// CSV: the text representation is the file itself; metadata carries the
/// shape. A quoted-field parser is deliberately out of scope; header and
/// column counts come from the first line split.
pub struct CsvExtractor;

#[async_trait]
impl Extractor for CsvExtractor {
    fn id(&self) -> &'static str {
        "text-csv"
    }

    fn version(&self) -> &'static str {
        "1"
    }

    fn handles(&self, mime: &str) -> bool {
        mime == "text/csv"
    }

    async fn extract(&self, input: ExtractInput<'_>) -> Result<RawExtraction, ExtractError> {
        let text = String::from_utf8_lossy(input.bytes).into_owned();
        let mut rows = 0usize;
        let mut headers: Vec<String> = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            rows += 1;
            if index == 0 {
                headers = line.split(',').map(|h| h.trim().to_string()).collect();
            }
        }

        Ok(
            RawExtraction::new(ExtractionKind::Table, text).with_metadata(json!({
                "row_count": rows,
                "column_count": headers.len(),
                "headers": headers,
            })),
        )
    }
}

/// JSON files are re-serialized pretty-printed so downstream prompts get a
/// stable rendering, with a structural summary in the metadata.
pub struct JsonExtractor;

#[async_trait]
impl Extractor for JsonExtractor {
    fn id(&self) -> &'static str {
        "structured-json"
    }

    fn version(&self) -> &'static str {
        "1"
    }

    fn handles(&self, mime: &str) -> bool {
        mime == "application/json"
    }

    async fn extract(&self, input: ExtractInput<'_>) -> Result<RawExtraction, ExtractError> {
        let value: Value = serde_json::from_slice(input.bytes)
            .map_err(|err| ExtractError::Malformed(format!("invalid JSON: {err}")))?;
        let text = serde_json::to_string_pretty(&value)
            .map_err(|err| ExtractError::Malformed(err.to_string()))?;

        Ok(RawExtraction::new(ExtractionKind::StructuredJson, text)
            .with_metadata(structure_summary(&value)))
    }
}

fn structure_summary(value: &Value) -> Value {
    match value {
        Value::Object(map) => json!({
            "type": "object",
            "key_count": map.len(),
            "keys": map.keys().take(32).collect::<Vec<_>>(),
        }),
        Value::Array(items) => json!({
            "type": "array",
            "length": items.len(),
        }),
        Value::String(_) => json!({ "type": "string" }),
        Value::Number(_) => json!({ "type": "number" }),
        Value::Bool(_) => json!({ "type": "boolean" }),
        Value::Null => json!({ "type": "null" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(bytes: &'a [u8], mime: &'a str) -> ExtractInput<'a> {
        ExtractInput {
            bytes,
            mime,
            size_hint: bytes.len() as u64,
            text_cap: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn plain_text_counts_lines() {
        let raw = PlainTextExtractor
            .extract(input(b"one\ntwo\nthree", "text/plain"))
            .await
            .unwrap();
        assert_eq!(raw.kind, ExtractionKind::Text);
        assert_eq!(raw.metadata["line_count"], 3);
    }

    #[tokio::test]
    async fn invalid_utf8_degrades_to_replacement_chars() {
        let raw = PlainTextExtractor
            .extract(input(&[0x66, 0xFF, 0x6F], "text/plain"))
            .await
            .unwrap();
        assert!(raw.text.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn csv_reports_shape() {
        let raw = CsvExtractor
            .extract(input(b"name,age\nalice,30\nbob,41\n", "text/csv"))
            .await
            .unwrap();
        assert_eq!(raw.kind, ExtractionKind::Table);
        assert_eq!(raw.metadata["row_count"], 3);
        assert_eq!(raw.metadata["column_count"], 2);
        assert_eq!(raw.metadata["headers"][0], "name");
    }

    #[tokio::test]
    async fn json_is_pretty_printed() {
        let raw = JsonExtractor
            .extract(input(br#"{"b":1,"a":[1,2]}"#, "application/json"))
            .await
            .unwrap();
        assert_eq!(raw.kind, ExtractionKind::StructuredJson);
        assert!(raw.text.contains('\n'));
        assert_eq!(raw.metadata["type"], "object");
        assert_eq!(raw.metadata["key_count"], 2);
    }

    #[tokio::test]
    async fn malformed_json_is_typed() {
        let err = JsonExtractor
            .extract(input(b"{not json", "application/json"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Malformed(_)));
    }
}
