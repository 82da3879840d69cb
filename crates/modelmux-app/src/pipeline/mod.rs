//! Content extraction pipeline: extractor contract, registry, and the
//! single-flight dispatcher that memoizes results by content hash.

pub mod audio;
pub mod image;
pub mod pdf;
pub mod textual;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::ExtractionConfig;
use crate::paths::AppPaths;
use crate::services::cache::TieredCache;
use crate::text::{cap_text, normalize_extracted};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionKind {
    Text,
    Table,
    ImageCaption,
    Transcript,
    StructuredJson,
}

impl ExtractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionKind::Text => "text",
            ExtractionKind::Table => "table",
            ExtractionKind::ImageCaption => "image-caption",
            ExtractionKind::Transcript => "transcript",
            ExtractionKind::StructuredJson => "structured-json",
        }
    }
}

/// Canonical extraction record. One successful record exists per
/// (content hash, extractor id, extractor version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub file_id: String,
    pub kind: ExtractionKind,
    pub text: String,
    pub truncated: bool,
    pub metadata: Value,
    pub extractor_id: String,
    pub extractor_version: String,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Typed extractor failures.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("input is encrypted")]
    Encrypted,
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("input exceeds extractor byte budget")]
    TooLarge,
    #[error("extractor timed out")]
    Timeout,
    #[error("downstream service error ({code}): {message}")]
    Downstream { code: String, message: String },
}

/// Input handed to an extractor: the full blob plus context. Extractors must
/// not retain references to the bytes after returning.
pub struct ExtractInput<'a> {
    pub bytes: &'a [u8],
    pub mime: &'a str,
    pub size_hint: u64,
    pub text_cap: usize,
}

/// Raw output before normalization and capping.
#[derive(Debug, Clone)]
pub struct RawExtraction {
    pub kind: ExtractionKind,
    pub text: String,
    pub metadata: Value,
    pub warnings: Vec<String>,
}

impl RawExtraction {
    pub fn new(kind: ExtractionKind, text: String) -> Self {
        Self {
            kind,
            text,
            metadata: Value::Null,
            warnings: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Contract every format extractor implements. Same bytes and version must
/// always yield the same extraction.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn id(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn handles(&self, mime: &str) -> bool;
    async fn extract(&self, input: ExtractInput<'_>) -> Result<RawExtraction, ExtractError>;
}

/// Registry of format extractors; first match on detected MIME wins.
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn standard(config: &ExtractionConfig) -> Self {
        let mut extractors: Vec<Arc<dyn Extractor>> = vec![
            Arc::new(textual::PlainTextExtractor),
            Arc::new(textual::CsvExtractor),
            Arc::new(textual::JsonExtractor),
            Arc::new(image::ImageExtractor),
            Arc::new(pdf::PdfExtractor),
        ];
        if let Some(url) = &config.transcription_url {
            match audio::AudioExtractor::new(
                url.clone(),
                Duration::from_secs(config.transcription_timeout_secs),
            ) {
                Ok(extractor) => extractors.push(Arc::new(extractor)),
                Err(error) => {
                    tracing::warn!(%error, "transcription client unavailable; audio uploads will be unsupported");
                }
            }
        }
        Self { extractors }
    }

    pub fn with_extractors(extractors: Vec<Arc<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    pub fn find(&self, mime: &str) -> Option<Arc<dyn Extractor>> {
        self.extractors.iter().find(|e| e.handles(mime)).cloned()
    }
}

/// What the dispatcher produced, distinguishing the synthetic unsupported
/// record from real extractions.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    Ready(Extraction),
    Unsupported(Extraction),
}

impl ExtractOutcome {
    pub fn into_extraction(self) -> Extraction {
        match self {
            ExtractOutcome::Ready(e) | ExtractOutcome::Unsupported(e) => e,
        }
    }
}

/// Single-flight extraction dispatcher with two layers of memoization: the
/// tiered cache and the on-disk extraction store.
pub struct ExtractionPipeline {
    registry: ExtractorRegistry,
    cache: Arc<TieredCache>,
    paths: AppPaths,
    text_cap: usize,
    timeout: Duration,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    // File ids already re-run once this process; a crashed extraction is not
    // retried beyond that.
    attempted: DashMap<String, ()>,
}

impl ExtractionPipeline {
    pub fn new(registry: ExtractorRegistry, cache: Arc<TieredCache>, paths: AppPaths, config: &ExtractionConfig) -> Self {
        Self {
            registry,
            cache,
            paths,
            text_cap: config.text_cap,
            timeout: Duration::from_secs(config.extractor_timeout_secs),
            in_flight: DashMap::new(),
            attempted: DashMap::new(),
        }
    }

    /// Run (or reuse) the extraction for one file. Concurrent calls for the
    /// same file id coalesce onto a single run.
    pub async fn run(
        &self,
        file_id: &str,
        sha256: &str,
        detected_mime: &str,
        blob_path: &std::path::Path,
        size: u64,
    ) -> Result<ExtractOutcome, ExtractError> {
        let Some(extractor) = self.registry.find(detected_mime) else {
            return Ok(ExtractOutcome::Unsupported(synthetic_unsupported(
                file_id,
                detected_mime,
            )));
        };

        let cache_key = extraction_cache_key(sha256, extractor.id(), extractor.version());
        if let Some(hit) = self.lookup(&cache_key, file_id).await {
            return Ok(ExtractOutcome::Ready(hit));
        }

        let lock = self
            .in_flight
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A concurrent caller may have completed while we waited.
        if let Some(hit) = self.lookup(&cache_key, file_id).await {
            self.in_flight.remove(file_id);
            return Ok(ExtractOutcome::Ready(hit));
        }

        // Cold cache after a restart: the on-disk record is authoritative.
        if let Some(mut persisted) = self.load_persisted(sha256, extractor.id()).await {
            persisted.file_id = file_id.to_string();
            self.cache.put_json(&cache_key, &persisted, None).await;
            self.in_flight.remove(file_id);
            return Ok(ExtractOutcome::Ready(persisted));
        }

        let started = Instant::now();
        self.attempted.insert(file_id.to_string(), ());

        let bytes = match tokio::fs::read(blob_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.in_flight.remove(file_id);
                return Err(ExtractError::Malformed(format!("blob unreadable: {err}")));
            }
        };

        let raw = match tokio::time::timeout(
            self.timeout,
            extractor.extract(ExtractInput {
                bytes: &bytes,
                mime: detected_mime,
                size_hint: size,
                text_cap: self.text_cap,
            }),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                self.in_flight.remove(file_id);
                return Err(err);
            }
            Err(_) => {
                self.in_flight.remove(file_id);
                return Err(ExtractError::Timeout);
            }
        };

        let extraction = finalize(
            file_id,
            raw,
            extractor.id(),
            extractor.version(),
            self.text_cap,
            started.elapsed(),
        );

        self.persist(sha256, &extraction).await;
        self.cache
            .put_json(&cache_key, &extraction, None)
            .await;
        self.in_flight.remove(file_id);

        Ok(ExtractOutcome::Ready(extraction))
    }

    /// Non-blocking read of a memoized extraction.
    pub async fn lookup(&self, cache_key: &str, file_id: &str) -> Option<Extraction> {
        if let Some(mut cached) = self.cache.get_json::<Extraction>(cache_key).await {
            cached.file_id = file_id.to_string();
            return Some(cached);
        }
        None
    }

    /// Cache key for a file's extraction under a specific extractor, shared
    /// with the read path in the service layer.
    pub fn cache_key_for(&self, sha256: &str, detected_mime: &str) -> Option<String> {
        let extractor = self.registry.find(detected_mime)?;
        Some(extraction_cache_key(sha256, extractor.id(), extractor.version()))
    }

    pub fn supports(&self, mime: &str) -> bool {
        self.registry.find(mime).is_some()
    }

    /// Whether this process already ran extraction for the file id; restart
    /// recovery re-runs at most once per process lifetime.
    pub fn already_attempted(&self, file_id: &str) -> bool {
        self.attempted.contains_key(file_id)
    }

    async fn load_persisted(&self, sha256: &str, extractor_id: &str) -> Option<Extraction> {
        let path = self.paths.extraction_path(sha256, extractor_id).ok()?;
        let raw = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn persist(&self, sha256: &str, extraction: &Extraction) {
        let path = match self
            .paths
            .extraction_path(sha256, &extraction.extractor_id)
        {
            Ok(path) => path,
            Err(error) => {
                tracing::warn!(%error, "cannot resolve extraction path");
                return;
            }
        };
        match serde_json::to_vec_pretty(extraction) {
            Ok(encoded) => {
                if let Err(error) = tokio::fs::write(&path, encoded).await {
                    tracing::warn!(%error, path = %path.display(), "failed to persist extraction");
                }
            }
            Err(error) => tracing::warn!(%error, "failed to encode extraction"),
        }
    }
}

fn extraction_cache_key(sha256: &str, extractor_id: &str, extractor_version: &str) -> String {
    format!("extraction:{sha256}:{extractor_id}:{extractor_version}")
}

fn finalize(
    file_id: &str,
    raw: RawExtraction,
    extractor_id: &str,
    extractor_version: &str,
    text_cap: usize,
    elapsed: Duration,
) -> Extraction {
    let normalized = normalize_extracted(&raw.text);
    let capped = cap_text(normalized, text_cap);
    Extraction {
        file_id: file_id.to_string(),
        kind: raw.kind,
        text: capped.text,
        truncated: capped.truncated,
        metadata: raw.metadata,
        extractor_id: extractor_id.to_string(),
        extractor_version: extractor_version.to_string(),
        elapsed_ms: elapsed.as_millis() as u64,
        warnings: raw.warnings,
    }
}

fn synthetic_unsupported(file_id: &str, mime: &str) -> Extraction {
    Extraction {
        file_id: file_id.to_string(),
        kind: ExtractionKind::Text,
        text: String::new(),
        truncated: false,
        metadata: serde_json::json!({ "mime": mime }),
        extractor_id: "unsupported".to_string(),
        extractor_version: "0".to_string(),
        elapsed_ms: 0,
        warnings: vec![format!("no extractor registered for {mime}")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingExtractor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Extractor for CountingExtractor {
        fn id(&self) -> &'static str {
            "counting"
        }

        fn version(&self) -> &'static str {
            "1"
        }

        fn handles(&self, mime: &str) -> bool {
            mime == "text/plain"
        }

        async fn extract(&self, input: ExtractInput<'_>) -> Result<RawExtraction, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent callers really overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(RawExtraction::new(
                ExtractionKind::Text,
                String::from_utf8_lossy(input.bytes).to_string(),
            ))
        }
    }

    async fn pipeline_with(
        dir: &TempDir,
        calls: Arc<AtomicUsize>,
    ) -> ExtractionPipeline {
        let registry =
            ExtractorRegistry::with_extractors(vec![Arc::new(CountingExtractor { calls })]);
        let cache = Arc::new(TieredCache::new(&CacheConfig::default()).await);
        let paths = AppPaths::new(dir.path()).unwrap();
        ExtractionPipeline::new(registry, cache, paths, &ExtractionConfig::default())
    }

    #[tokio::test]
    async fn concurrent_runs_coalesce() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(pipeline_with(&dir, calls.clone()).await);

        let blob = dir.path().join("blob.txt");
        tokio::fs::write(&blob, b"hello extraction").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pipeline = pipeline.clone();
            let blob = blob.clone();
            handles.push(tokio::spawn(async move {
                pipeline
                    .run("f1", "cafebabe", "text/plain", &blob, 16)
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().into_extraction());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1, "producer ran exactly once");
        for result in &results {
            assert_eq!(result.text, results[0].text);
            assert_eq!(result.extractor_id, "counting");
        }
    }

    #[tokio::test]
    async fn repeated_runs_return_equal_extractions() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline_with(&dir, calls.clone()).await;

        let blob = dir.path().join("blob.txt");
        tokio::fs::write(&blob, b"same bytes").await.unwrap();

        let first = pipeline
            .run("f2", "hash2", "text/plain", &blob, 10)
            .await
            .unwrap()
            .into_extraction();
        let second = pipeline
            .run("f2", "hash2", "text/plain", &blob, 10)
            .await
            .unwrap()
            .into_extraction();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.text, second.text);
        assert_eq!(first.kind, second.kind);
        assert_eq!(first.extractor_version, second.extractor_version);
    }

    #[tokio::test]
    async fn unknown_mime_yields_synthetic_unsupported() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline_with(&dir, Arc::new(AtomicUsize::new(0))).await;
        let blob = dir.path().join("blob.bin");
        tokio::fs::write(&blob, b"\x00\x01").await.unwrap();

        let outcome = pipeline
            .run("f3", "hash3", "application/x-weird", &blob, 2)
            .await
            .unwrap();
        match outcome {
            ExtractOutcome::Unsupported(extraction) => {
                assert_eq!(extraction.kind, ExtractionKind::Text);
                assert!(extraction.text.is_empty());
                assert!(!extraction.warnings.is_empty());
            }
            other => panic!("expected unsupported outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn extraction_is_persisted_to_disk() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline_with(&dir, Arc::new(AtomicUsize::new(0))).await;
        let blob = dir.path().join("blob.txt");
        tokio::fs::write(&blob, b"persist me").await.unwrap();

        pipeline
            .run("f4", "feedface", "text/plain", &blob, 10)
            .await
            .unwrap();

        let persisted = dir
            .path()
            .join("extractions")
            .join("feedface")
            .join("counting.json");
        let raw = tokio::fs::read(&persisted).await.unwrap();
        let parsed: Extraction = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed.text, "persist me");
    }
}
