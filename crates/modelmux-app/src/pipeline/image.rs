//! Image extractor: probes dimensions and produces a short caption.
//!
//! OCR proper is a pluggable concern; what the gateway guarantees is a
//! textual stand-in (the caption) plus dimension metadata tagged so the
//! router can require the vision capability.

use async_trait::async_trait;
use image::ImageReader;
use serde_json::json;
use std::io::Cursor;

use super::{ExtractError, ExtractInput, ExtractionKind, Extractor, RawExtraction};

pub struct ImageExtractor;

#[async_trait]
impl Extractor for ImageExtractor {
    fn id(&self) -> &'static str {
        "image-caption"
    }

    fn version(&self) -> &'static str {
        "1"
    }

    fn handles(&self, mime: &str) -> bool {
        matches!(
            mime,
            "image/jpeg" | "image/png" | "image/gif" | "image/webp" | "image/bmp"
        )
    }

    async fn extract(&self, input: ExtractInput<'_>) -> Result<RawExtraction, ExtractError> {
        let reader = ImageReader::new(Cursor::new(input.bytes))
            .with_guessed_format()
            .map_err(|err| ExtractError::Malformed(format!("unreadable image: {err}")))?;

        let format = reader
            .format()
            .ok_or_else(|| ExtractError::Malformed("unknown image format".to_string()))?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|err| ExtractError::Malformed(format!("undecodable image: {err}")))?;

        let format_name = format!("{format:?}").to_uppercase();
        let caption = format!("{format_name} image, {width}x{height} pixels");

        Ok(
            RawExtraction::new(ExtractionKind::ImageCaption, caption).with_metadata(json!({
                "width": width,
                "height": height,
                "format": format_name,
                "bytes": input.size_hint,
                "mode": "caption",
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Smallest valid 1x1 PNG (black pixel).
    const ONE_PX_PNG: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
        0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00,
        0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
        0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ];

    #[tokio::test]
    async fn png_yields_caption_with_dimensions() {
        let raw = ImageExtractor
            .extract(ExtractInput {
                bytes: ONE_PX_PNG,
                mime: "image/png",
                size_hint: ONE_PX_PNG.len() as u64,
                text_cap: 1024,
            })
            .await
            .unwrap();
        assert_eq!(raw.kind, ExtractionKind::ImageCaption);
        assert!(raw.text.contains("1x1"));
        assert_eq!(raw.metadata["width"], 1);
        assert_eq!(raw.metadata["height"], 1);
    }

    #[tokio::test]
    async fn garbage_bytes_are_malformed() {
        let err = ImageExtractor
            .extract(ExtractInput {
                bytes: b"definitely not an image",
                mime: "image/png",
                size_hint: 23,
                text_cap: 1024,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Malformed(_)));
    }
}
