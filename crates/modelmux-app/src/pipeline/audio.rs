//! Audio extractor: delegates to an external transcription service.
//!
//! The service speaks the whisper-style HTTP contract: multipart POST of the
//! audio bytes, JSON response with `text`, optional `language`, `duration`
//! and `segments`. Transient failures are retried with exponential backoff;
//! a response with no segments is a ready-but-empty transcript, not an error.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{ExtractError, ExtractInput, ExtractionKind, Extractor, RawExtraction};

const MAX_RETRIES: usize = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);
const USER_AGENT: &str = concat!("modelmux/", env!("CARGO_PKG_VERSION"));

pub struct AudioExtractor {
    endpoint: Url,
    http: reqwest::Client,
    backoff: ExponentialBuilder,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionSegment {
    #[serde(default)]
    text: String,
}

impl AudioExtractor {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, ExtractError> {
        let endpoint = base_url
            .join("v1/audio/transcriptions")
            .map_err(|err| ExtractError::Downstream {
                code: "bad-endpoint".to_string(),
                message: err.to_string(),
            })?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| ExtractError::Downstream {
                code: "client-build".to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            endpoint,
            http,
            backoff: ExponentialBuilder::default()
                .with_min_delay(RETRY_BASE)
                .with_max_times(MAX_RETRIES)
                .with_jitter(),
        })
    }

    async fn transcribe(
        &self,
        bytes: Vec<u8>,
        mime: String,
    ) -> Result<TranscriptionResponse, ExtractError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("audio")
            .mime_str(&mime)
            .map_err(|err| ExtractError::Downstream {
                code: "bad-mime".to_string(),
                message: err.to_string(),
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|err| ExtractError::Downstream {
                code: "transport".to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Downstream {
                code: status.as_u16().to_string(),
                message: "transcription service returned an error".to_string(),
            });
        }

        response
            .json()
            .await
            .map_err(|err| ExtractError::Downstream {
                code: "decode".to_string(),
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl Extractor for AudioExtractor {
    fn id(&self) -> &'static str {
        "audio-transcript"
    }

    fn version(&self) -> &'static str {
        "1"
    }

    fn handles(&self, mime: &str) -> bool {
        matches!(
            mime,
            "audio/mpeg" | "audio/wav" | "audio/x-wav" | "audio/mp4" | "audio/ogg"
        )
    }

    async fn extract(&self, input: ExtractInput<'_>) -> Result<RawExtraction, ExtractError> {
        let bytes = input.bytes.to_vec();
        let mime = input.mime.to_string();

        let transcription = (|| {
            let bytes = bytes.clone();
            let mime = mime.clone();
            async move { self.transcribe(bytes, mime).await }
        })
        .retry(self.backoff)
        .when(is_retryable)
        .notify(|err: &ExtractError, after: Duration| {
            tracing::warn!(%err, ?after, "transcription attempt failed; retrying");
        })
        .await?;

        let text = if transcription.text.trim().is_empty() {
            transcription
                .segments
                .iter()
                .map(|s| s.text.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            transcription.text.trim().to_string()
        };

        let mut raw = RawExtraction::new(ExtractionKind::Transcript, text).with_metadata(json!({
            "language": transcription.language,
            "duration_seconds": transcription.duration,
            "segment_count": transcription.segments.len(),
        }));
        if transcription.segments.is_empty() {
            raw = raw.with_warning("transcription returned no segments");
        }
        Ok(raw)
    }
}

fn is_retryable(err: &ExtractError) -> bool {
    match err {
        ExtractError::Downstream { code, .. } => {
            code == "transport" || code == "502" || code == "503" || code == "504"
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> AudioExtractor {
        AudioExtractor::new(
            "http://localhost:9/".parse().unwrap(),
            Duration::from_millis(100),
        )
        .unwrap()
    }

    #[test]
    fn handles_only_audio_mimes() {
        let extractor = extractor();
        assert!(extractor.handles("audio/mpeg"));
        assert!(extractor.handles("audio/wav"));
        assert!(!extractor.handles("text/plain"));
        assert!(!extractor.handles("image/png"));
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable(&ExtractError::Downstream {
            code: "503".to_string(),
            message: String::new(),
        }));
        assert!(is_retryable(&ExtractError::Downstream {
            code: "transport".to_string(),
            message: String::new(),
        }));
        assert!(!is_retryable(&ExtractError::Downstream {
            code: "400".to_string(),
            message: String::new(),
        }));
        assert!(!is_retryable(&ExtractError::Malformed(String::new())));
    }

    #[test]
    fn empty_segments_decode() {
        let raw = r#"{"text": "", "segments": []}"#;
        let parsed: TranscriptionResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.text.is_empty());
        assert!(parsed.segments.is_empty());
    }
}
