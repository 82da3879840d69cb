//! The gateway engine: implements the HTTP layer's service trait over the
//! blob store, extraction pipeline, router, dispatcher, cache, and
//! observability components.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use modelmux_server::wire::{
    AnalysisView, ChatMessage, ChatRequest, ChatResponse, Choice, ChoiceMessage, ComplexityView,
    ExtractionView, FileRecordView, HealthSnapshotView, ModelCard, ProviderHealthView, Role,
    RouteView, StreamChunk,
};
use modelmux_server::{
    ChunkStream, GatewayError, GatewayService, RateLimitState, RequestScope, Upload,
};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::observe::{HealthMonitor, Metrics, RequestEvent, spawn_prober};
use crate::paths::AppPaths;
use crate::pipeline::{
    ExtractError, ExtractOutcome, Extraction, ExtractionKind, ExtractionPipeline,
    ExtractorRegistry,
};
use crate::router::{
    AvailabilityView, Catalog, ComplexityScore, FileSignal, Route, ScoreInput, ScoredMessage,
    score as compute_score,
};
use crate::services::{
    ExtractionStatus, FileRecord, FileRegistry, FsBlobStore, TieredCache, spawn_reaper,
};
use crate::sniff::detect_mime;
use crate::text::{sanitize_field, sanitize_filename};
use crate::upstream::{DispatchError, Dispatcher, ImageAttachment, UpstreamChunk, UpstreamRequest};

const SNIFF_BYTES: usize = 512;
const REAPER_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

pub struct Gateway {
    config: AppConfig,
    blobs: FsBlobStore,
    files: Arc<FileRegistry>,
    pipeline: Arc<ExtractionPipeline>,
    catalog: Catalog,
    dispatcher: Dispatcher,
    cache: Arc<TieredCache>,
    metrics: Metrics,
    health: Arc<HealthMonitor>,
    limits: Arc<RateLimitState>,
}

impl Gateway {
    /// Wire up every component and start the background tasks.
    pub async fn bootstrap(config: AppConfig) -> Result<Arc<Self>, AppError> {
        let paths = match &config.storage.data_dir {
            Some(dir) => AppPaths::new(dir)?,
            None => AppPaths::from_project_dirs()?,
        };

        let blobs = FsBlobStore::new(paths.clone(), config.storage.max_file_bytes);
        let files = Arc::new(FileRegistry::load(paths.clone()).await?);
        let cache = Arc::new(TieredCache::new(&config.cache).await);

        let providers = if config.providers.is_empty() {
            None
        } else {
            Some(config.providers.clone())
        };
        let catalog = match &providers {
            Some(providers) => Catalog::from_providers(providers),
            None => Catalog::builtin(),
        };
        let provider_configs = providers.unwrap_or_else(crate::router::catalog::builtin_providers);

        let registry = ExtractorRegistry::standard(&config.extraction);
        let pipeline = Arc::new(ExtractionPipeline::new(
            registry,
            cache.clone(),
            paths.clone(),
            &config.extraction,
        ));

        let dispatcher = Dispatcher::new(&provider_configs);
        let metrics = Metrics::new()?;
        let health = Arc::new(HealthMonitor::new(&provider_configs));
        let limits = RateLimitState::new(&config.server.rate_limit);

        spawn_reaper(files.clone(), blobs.clone(), REAPER_INTERVAL);
        spawn_prober(health.clone(), provider_configs);

        Ok(Arc::new(Self {
            config,
            blobs,
            files,
            pipeline,
            catalog,
            dispatcher,
            cache,
            metrics,
            health,
            limits,
        }))
    }

    /// Rate-limit state shared with the HTTP layer.
    pub fn rate_limits(&self) -> Arc<RateLimitState> {
        self.limits.clone()
    }

    pub fn server_config(&self) -> modelmux_server::ServerConfig {
        self.config.server.clone()
    }

    fn record_view(record: &FileRecord) -> FileRecordView {
        FileRecordView {
            id: record.id.clone(),
            original_filename: record.original_filename.clone(),
            filename: record.filename.clone(),
            size: record.size,
            declared_mime: record.declared_mime.clone(),
            detected_mime: record.detected_mime.clone(),
            sha256: record.sha256.clone(),
            uploaded_at: record.uploaded_at,
            expires_at: record.expires_at,
            extraction_status: record.extraction_status.as_str().to_string(),
        }
    }

    fn extraction_view(extraction: &Extraction) -> ExtractionView {
        ExtractionView {
            file_id: extraction.file_id.clone(),
            kind: extraction.kind.as_str().to_string(),
            text: extraction.text.clone(),
            truncated: extraction.truncated,
            metadata: extraction.metadata.clone(),
            extractor_id: extraction.extractor_id.clone(),
            extractor_version: extraction.extractor_version.clone(),
            elapsed_ms: extraction.elapsed_ms,
            warnings: extraction.warnings.clone(),
        }
    }

    fn owned_record(&self, scope: &RequestScope, file_id: &str) -> Result<FileRecord, GatewayError> {
        let record = self
            .files
            .get(file_id)
            .ok_or_else(|| GatewayError::not_found(format!("unknown file id `{file_id}`")))?;
        if record.owner != scope.identity.key() {
            return Err(GatewayError::forbidden("file belongs to another identity"));
        }
        Ok(record)
    }

    /// Run (or reuse) extraction for a record, keeping its status current.
    /// A previously failed run is not retried within this process.
    async fn ensure_extraction(
        &self,
        record: &FileRecord,
    ) -> Result<Extraction, GatewayError> {
        if record.extraction_status == ExtractionStatus::Failed
            && self.pipeline.already_attempted(&record.id)
        {
            return Err(GatewayError::validation("extraction previously failed"));
        }
        if !self.pipeline.supports(&record.detected_mime) {
            let _ = self
                .files
                .update_status(&record.id, ExtractionStatus::Unsupported)
                .await;
        } else if record.extraction_status != ExtractionStatus::Ready {
            let _ = self
                .files
                .update_status(&record.id, ExtractionStatus::InProgress)
                .await;
        }

        let blob_path = self
            .blobs
            .blob_path(&record.id, &record.extension)
            .map_err(map_blob_path)?;

        let outcome = self
            .pipeline
            .run(
                &record.id,
                &record.sha256,
                &record.detected_mime,
                &blob_path,
                record.size,
            )
            .await;

        match outcome {
            Ok(ExtractOutcome::Ready(extraction)) => {
                let _ = self
                    .files
                    .update_status(&record.id, ExtractionStatus::Ready)
                    .await;
                Ok(extraction)
            }
            Ok(ExtractOutcome::Unsupported(extraction)) => {
                let _ = self
                    .files
                    .update_status(&record.id, ExtractionStatus::Unsupported)
                    .await;
                Ok(extraction)
            }
            Err(err) => {
                let _ = self
                    .files
                    .update_status(&record.id, ExtractionStatus::Failed)
                    .await;
                Err(map_extract_error(err))
            }
        }
    }

    /// Validate the request, resolve referenced files, score, and route.
    async fn prepare(
        &self,
        scope: &RequestScope,
        request: &ChatRequest,
    ) -> Result<Prepared, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::validation("messages may not be empty"));
        }
        let total_bytes: usize = request.messages.iter().map(|m| m.content.len()).sum();
        if total_bytes > self.config.extraction.message_bytes_cap {
            return Err(GatewayError::payload_too_large(format!(
                "message payload exceeds {} bytes",
                self.config.extraction.message_bytes_cap
            )));
        }
        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            let content = sanitize_field(&message.content)
                .ok_or_else(|| GatewayError::validation("message content contains NUL"))?;
            messages.push(ChatMessage {
                role: message.role,
                content,
            });
        }

        // Resolve referenced files; a failed extraction becomes a prompt
        // placeholder instead of failing the chat request.
        let mut resolved = Vec::new();
        for file_id in &request.file_ids {
            let record = self.owned_record(scope, file_id)?;
            match self.ensure_extraction(&record).await {
                Ok(extraction) => resolved.push(ResolvedFile {
                    record,
                    extraction: Ok(extraction),
                }),
                Err(err) => resolved.push(ResolvedFile {
                    record,
                    extraction: Err(err.message),
                }),
            }
        }

        let signals: Vec<FileSignal> = resolved
            .iter()
            .map(|file| match &file.extraction {
                Ok(extraction) => FileSignal {
                    bytes: file.record.size,
                    kind: extraction.kind,
                    text_len: extraction.text.len(),
                },
                Err(_) => FileSignal {
                    bytes: file.record.size,
                    kind: ExtractionKind::Text,
                    text_len: 0,
                },
            })
            .collect();

        let complexity = compute_score(&ScoreInput {
            messages: messages
                .iter()
                .map(|m| ScoredMessage {
                    is_user: matches!(m.role, Role::User),
                    content: m.content.clone(),
                })
                .collect(),
            files: signals,
            max_tokens_hint: request.max_tokens,
            fast_context_floor: self.catalog.fast_context_floor(),
        });

        let unavailable = self.dispatcher.breaker().unavailable();
        let availability = AvailabilityView::new(unavailable.clone());

        // Routing is pure, so the decision memoizes on its inputs; the
        // unavailable set is part of the key to keep breaker transitions
        // visible. Generation output is never cached.
        let route_key = route_cache_key(&complexity, &request.model, &self.config.router, &unavailable);
        let route = match self.cache.get_json::<Route>(&route_key).await {
            Some(route) => route,
            None => {
                let route = crate::router::route(
                    &complexity,
                    &request.model,
                    &self.config.router,
                    &self.catalog,
                    &availability,
                )
                .map_err(|err| GatewayError::server_busy(err.to_string()))?;
                self.cache.put_json(&route_key, &route, None).await;
                route
            }
        };

        Ok(Prepared {
            messages,
            resolved,
            complexity,
            route,
        })
    }

    /// Weave resolved extractions into the message list and collect image
    /// attachments for vision-capable candidates.
    fn weave(&self, prepared: &Prepared) -> (Vec<ChatMessage>, u32) {
        let mut woven = Vec::with_capacity(prepared.messages.len() + prepared.resolved.len());
        let mut processed = 0u32;

        for file in &prepared.resolved {
            let name = &file.record.filename;
            match &file.extraction {
                Ok(extraction) if extraction.kind == ExtractionKind::ImageCaption => {
                    processed += 1;
                    woven.push(ChatMessage::system(format!(
                        "The attached file `{name}` is an image: {}",
                        extraction.text
                    )));
                }
                Ok(extraction) if !extraction.text.is_empty() => {
                    processed += 1;
                    woven.push(ChatMessage::system(format!(
                        "You are analyzing the attached file `{name}` ({}).\n\nFile content:\n{}",
                        extraction.kind.as_str(),
                        extraction.text
                    )));
                }
                Ok(_) => {
                    processed += 1;
                    woven.push(ChatMessage::system(format!(
                        "[file {name}: no textual content was extracted]"
                    )));
                }
                Err(reason) => {
                    woven.push(ChatMessage::system(format!(
                        "[file {name}: extraction failed: {reason}]"
                    )));
                }
            }
        }

        woven.extend(prepared.messages.iter().cloned());
        (woven, processed)
    }

    async fn image_attachments(&self, prepared: &Prepared) -> Vec<ImageAttachment> {
        let mut images = Vec::new();
        for file in &prepared.resolved {
            let Ok(extraction) = &file.extraction else {
                continue;
            };
            if extraction.kind != ExtractionKind::ImageCaption {
                continue;
            }
            match self.blobs.read(&file.record.id, &file.record.extension).await {
                Ok(bytes) => images.push(ImageAttachment {
                    mime: file.record.detected_mime.clone(),
                    data_base64: BASE64_STANDARD.encode(bytes),
                }),
                Err(error) => {
                    tracing::warn!(%error, id = %file.record.id, "image blob unreadable; caption only");
                }
            }
        }
        images
    }

    fn candidates(&self, route: &Route) -> Vec<crate::router::ModelDescriptor> {
        std::iter::once(&route.selected)
            .chain(route.fallbacks.iter())
            .filter_map(|selected| self.catalog.get(&selected.model_id).cloned())
            .collect()
    }

    fn upstream_request(
        &self,
        messages: Vec<ChatMessage>,
        request: &ChatRequest,
        images: Vec<ImageAttachment>,
    ) -> UpstreamRequest {
        UpstreamRequest {
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stop: request.stop.clone(),
            images,
        }
    }

    fn emit_event(
        &self,
        scope: &RequestScope,
        route_name: &str,
        status: u16,
        started: Instant,
        prepared: Option<&Prepared>,
        extra: EventExtra,
    ) {
        let event = RequestEvent {
            request_id: scope.request_id.clone(),
            identity: scope.identity.key(),
            route: route_name.to_string(),
            status,
            latency_ms: started.elapsed().as_millis() as u64,
            bytes_in: extra.bytes_in,
            bytes_out: extra.bytes_out,
            selected_model: extra
                .selected_model
                .or_else(|| prepared.map(|p| p.route.selected.model_id.clone())),
            complexity_score: prepared.map(|p| p.complexity.score),
            rationale: prepared
                .map(|p| {
                    let mut tags = p.complexity.rationale.clone();
                    tags.extend(p.route.reasons.clone());
                    tags.extend(extra.rationale.clone());
                    tags
                })
                .unwrap_or(extra.rationale),
            cache_hit: extra.cache_hit,
            upstream_latency_ms: extra.upstream_latency_ms,
            fallback_count: extra.fallback_count,
            error_code: extra.error_code,
        };
        event.emit();
        self.metrics
            .record_request(status, started.elapsed().as_secs_f64());
    }
}

#[derive(Default)]
struct EventExtra {
    bytes_in: u64,
    bytes_out: u64,
    selected_model: Option<String>,
    rationale: Vec<String>,
    cache_hit: bool,
    upstream_latency_ms: Option<u64>,
    fallback_count: u32,
    error_code: Option<String>,
}

struct ResolvedFile {
    record: FileRecord,
    extraction: Result<Extraction, String>,
}

struct Prepared {
    messages: Vec<ChatMessage>,
    resolved: Vec<ResolvedFile>,
    complexity: ComplexityScore,
    route: Route,
}

#[async_trait]
impl GatewayService for Gateway {
    async fn list_models(&self) -> Result<Vec<ModelCard>, GatewayError> {
        let breaker = self.dispatcher.breaker();
        let mut cards: Vec<ModelCard> = self
            .catalog
            .models()
            .iter()
            .map(|model| ModelCard {
                id: model.id.clone(),
                provider: model.provider_id.clone(),
                capabilities: model
                    .capabilities
                    .iter()
                    .map(|c| c.as_ref().to_string())
                    .collect(),
                context_window: model.context_window,
                max_output_tokens: model.max_output_tokens,
                cost_per_1k_input: model.cost_per_1k_input,
                cost_per_1k_output: model.cost_per_1k_output,
                speed_tier: model.speed_tier.as_ref().to_string(),
                pricing_tier: model.pricing_tier.as_ref().to_string(),
                available: self.catalog.provider_has_key(&model.provider_id)
                    && !breaker.is_open(&model.provider_id, &model.id),
            })
            .collect();
        cards.sort_by(|a, b| {
            b.available
                .cmp(&a.available)
                .then(a.cost_per_1k_input.total_cmp(&b.cost_per_1k_input))
        });
        Ok(cards)
    }

    async fn upload(
        &self,
        scope: &RequestScope,
        upload: Upload,
    ) -> Result<FileRecordView, GatewayError> {
        let started = Instant::now();
        let filename = sanitize_filename(&upload.declared_name);
        let extension = extension_of(&filename);
        let file_id = Uuid::new_v4().simple().to_string();

        let data = Box::pin(upload.data.map(|chunk| {
            chunk.map_err(|err| crate::services::blob_store::BlobError::Stream(err.to_string()))
        }));
        let stored = self
            .blobs
            .put(&file_id, &extension, data)
            .await
            .map_err(map_blob_error)?;

        let head = self
            .blobs
            .read(&file_id, &extension)
            .await
            .map(|bytes| bytes[..bytes.len().min(SNIFF_BYTES)].to_vec())
            .unwrap_or_default();
        let detected = detect_mime(&head, &filename);

        if !self
            .config
            .storage
            .allowed_mime_types
            .iter()
            .any(|allowed| allowed == detected)
        {
            let _ = self.blobs.delete(&file_id, &extension).await;
            self.emit_event(
                scope,
                "POST /api/v1/upload",
                415,
                started,
                None,
                EventExtra {
                    bytes_in: stored.size_bytes,
                    error_code: Some("unsupported-type".to_string()),
                    ..EventExtra::default()
                },
            );
            return Err(GatewayError::unsupported_type(format!(
                "detected type `{detected}` is not accepted"
            )));
        }

        let mismatch = upload.declared_mime != detected;
        if mismatch {
            tracing::debug!(
                declared = %upload.declared_mime,
                %detected,
                id = %file_id,
                "declared MIME disagrees with sniffed type"
            );
        }

        let now = Utc::now();
        let record = FileRecord {
            id: file_id.clone(),
            original_filename: upload.declared_name.clone(),
            filename,
            extension,
            declared_mime: upload.declared_mime.clone(),
            detected_mime: detected.to_string(),
            size: stored.size_bytes,
            sha256: stored.sha256,
            uploaded_at: now,
            expires_at: now
                + ChronoDuration::seconds(self.config.extraction.retention_secs as i64),
            owner: scope.identity.key(),
            extraction_status: if self.pipeline.supports(detected) {
                ExtractionStatus::Pending
            } else {
                ExtractionStatus::Unsupported
            },
            mime_mismatch: mismatch,
        };

        self.files
            .insert(record.clone())
            .await
            .map_err(|err| GatewayError::internal(err.to_string()))?;

        self.emit_event(
            scope,
            "POST /api/v1/upload",
            200,
            started,
            None,
            EventExtra {
                bytes_in: record.size,
                ..EventExtra::default()
            },
        );
        Ok(Self::record_view(&record))
    }

    async fn list_files(
        &self,
        scope: &RequestScope,
    ) -> Result<Vec<FileRecordView>, GatewayError> {
        Ok(self
            .files
            .list_for_owner(&scope.identity.key())
            .iter()
            .map(Self::record_view)
            .collect())
    }

    async fn file_record(
        &self,
        scope: &RequestScope,
        file_id: &str,
    ) -> Result<FileRecordView, GatewayError> {
        let record = self.owned_record(scope, file_id)?;
        Ok(Self::record_view(&record))
    }

    async fn delete_file(
        &self,
        scope: &RequestScope,
        file_id: &str,
    ) -> Result<(), GatewayError> {
        let record = self.owned_record(scope, file_id)?;
        let _ = self
            .blobs
            .delete(&record.id, &record.extension)
            .await
            .map_err(map_blob_error)?;
        self.files.remove(&record.id).await;
        Ok(())
    }

    async fn extract(
        &self,
        scope: &RequestScope,
        file_id: &str,
    ) -> Result<ExtractionView, GatewayError> {
        let started = Instant::now();
        let record = self.owned_record(scope, file_id)?;
        let result = self.ensure_extraction(&record).await;
        let (status, error_code) = match &result {
            Ok(_) => (200, None),
            Err(err) => (err.status(), Some(err.code().to_string())),
        };
        self.emit_event(
            scope,
            "POST /api/v1/files/{id}/extract",
            status,
            started,
            None,
            EventExtra {
                error_code,
                ..EventExtra::default()
            },
        );
        result.map(|extraction| Self::extraction_view(&extraction))
    }

    async fn chat(
        &self,
        scope: &RequestScope,
        request: ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        let started = Instant::now();
        let bytes_in: u64 = request.messages.iter().map(|m| m.content.len() as u64).sum();
        let prepared = self.prepare(scope, &request).await?;
        let (messages, files_processed) = self.weave(&prepared);
        let images = self.image_attachments(&prepared).await;
        let upstream = self.upstream_request(messages, &request, images);
        let candidates = self.candidates(&prepared.route);

        let dispatched = self
            .dispatcher
            .dispatch_buffered(&candidates, &upstream, &scope.cancel)
            .await;

        match dispatched {
            Ok(result) => {
                self.metrics.record_upstream(
                    &result.outcome.provider_id,
                    result.upstream_latency_ms as f64 / 1000.0,
                );
                self.metrics
                    .record_dispatch(&result.outcome.model_id, result.outcome.fallback_count);
                if let Some(model) = self.catalog.get(&result.outcome.model_id) {
                    let usage = &result.output.usage;
                    let estimated_cost = usage.prompt_tokens as f64 / 1000.0
                        * model.cost_per_1k_input
                        + usage.completion_tokens as f64 / 1000.0 * model.cost_per_1k_output;
                    self.metrics.record_usage(
                        &model.id,
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        estimated_cost,
                    );
                }

                let response = ChatResponse {
                    id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
                    object: "chat.completion".to_string(),
                    created: Utc::now().timestamp(),
                    model: result.outcome.model_id.clone(),
                    choices: vec![Choice {
                        index: 0,
                        message: ChoiceMessage {
                            role: Role::Assistant,
                            content: result.output.content,
                        },
                        finish_reason: Some(result.output.finish_reason),
                    }],
                    usage: result.output.usage,
                    files_processed: if request.file_ids.is_empty() {
                        None
                    } else {
                        Some(files_processed)
                    },
                };

                self.emit_event(
                    scope,
                    "POST /api/v1/chat/completions",
                    200,
                    started,
                    Some(&prepared),
                    EventExtra {
                        bytes_in,
                        bytes_out: response.choices[0].message.content.len() as u64,
                        selected_model: Some(result.outcome.model_id.clone()),
                        rationale: result.outcome.rationale.clone(),
                        upstream_latency_ms: Some(result.upstream_latency_ms),
                        fallback_count: result.outcome.fallback_count,
                        ..EventExtra::default()
                    },
                );
                Ok(response)
            }
            Err(err) => {
                let mapped = map_dispatch_error(err);
                self.emit_event(
                    scope,
                    "POST /api/v1/chat/completions",
                    mapped.status(),
                    started,
                    Some(&prepared),
                    EventExtra {
                        bytes_in,
                        error_code: Some(mapped.code().to_string()),
                        ..EventExtra::default()
                    },
                );
                Err(mapped)
            }
        }
    }

    async fn chat_stream(
        &self,
        scope: &RequestScope,
        request: ChatRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let started = Instant::now();
        let prepared = self.prepare(scope, &request).await?;
        let (messages, _) = self.weave(&prepared);
        let images = self.image_attachments(&prepared).await;
        let upstream = self.upstream_request(messages, &request, images);
        let candidates = self.candidates(&prepared.route);

        let dispatched = self
            .dispatcher
            .dispatch_stream(&candidates, &upstream, &scope.cancel)
            .await
            .map_err(map_dispatch_error)?;

        self.metrics
            .record_dispatch(&dispatched.outcome.model_id, dispatched.outcome.fallback_count);
        self.emit_event(
            scope,
            "POST /api/v1/chat/completions",
            200,
            started,
            Some(&prepared),
            EventExtra {
                selected_model: Some(dispatched.outcome.model_id.clone()),
                rationale: dispatched.outcome.rationale.clone(),
                fallback_count: dispatched.outcome.fallback_count,
                ..EventExtra::default()
            },
        );

        let chunk_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
        let model_id = dispatched.outcome.model_id.clone();
        let created = Utc::now().timestamp();
        let mut inner = dispatched.stream;

        let stream = async_stream::stream! {
            let mut finished = false;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(UpstreamChunk::Delta(content)) => {
                        yield Ok(StreamChunk::content(&chunk_id, &model_id, created, content));
                    }
                    Ok(UpstreamChunk::Finish { reason }) => {
                        finished = true;
                        yield Ok(StreamChunk::finish(&chunk_id, &model_id, created, &reason));
                    }
                    Ok(UpstreamChunk::Error { message }) => {
                        yield Err(GatewayError::upstream(message));
                        return;
                    }
                    Ok(UpstreamChunk::Keepalive) | Ok(UpstreamChunk::ToolCallDelta(_)) => {}
                    Err(err) => {
                        yield Err(map_dispatch_error(err));
                        return;
                    }
                }
            }
            if !finished {
                yield Ok(StreamChunk::finish(&chunk_id, &model_id, created, "stop"));
            }
        };
        Ok(Box::pin(stream))
    }

    async fn analyze(
        &self,
        scope: &RequestScope,
        request: ChatRequest,
    ) -> Result<AnalysisView, GatewayError> {
        let started = Instant::now();
        let prepared = self.prepare(scope, &request).await?;
        let selected = self
            .catalog
            .get(&prepared.route.selected.model_id)
            .ok_or_else(|| GatewayError::internal("route selected an unknown model"))?;

        let view = AnalysisView {
            complexity: ComplexityView {
                score: prepared.complexity.score,
                required_capabilities: prepared
                    .complexity
                    .required
                    .iter()
                    .map(|c| c.as_ref().to_string())
                    .collect(),
                estimated_input_tokens: prepared.complexity.estimated_input_tokens,
                estimated_output_ceiling: prepared.complexity.estimated_output_ceiling,
                rationale: prepared.complexity.rationale.clone(),
            },
            route: RouteView {
                model: selected.id.clone(),
                provider: selected.provider_id.clone(),
                reasons: prepared.route.reasons.clone(),
                fallbacks: prepared
                    .route
                    .fallbacks
                    .iter()
                    .map(|f| f.model_id.clone())
                    .collect(),
            },
        };
        self.emit_event(
            scope,
            "POST /api/v1/analyze-complexity",
            200,
            started,
            Some(&prepared),
            EventExtra::default(),
        );
        Ok(view)
    }

    async fn health_snapshot(&self) -> Result<HealthSnapshotView, GatewayError> {
        let snapshot = self.health.snapshot();
        Ok(HealthSnapshotView {
            uptime_secs: snapshot.uptime_secs,
            cpu_percent: snapshot.cpu_percent,
            memory_percent: snapshot.memory_percent,
            disk_percent: snapshot.disk_percent,
            providers: snapshot
                .providers
                .into_iter()
                .map(|(provider, probe)| ProviderHealthView {
                    provider,
                    reachable: probe.map(|p| p.reachable).unwrap_or(false),
                    last_probe_age_secs: probe.map(|p| p.at.elapsed().as_secs()),
                })
                .collect(),
        })
    }

    async fn metrics_text(&self) -> Result<String, GatewayError> {
        let stats = self.cache.stats();
        let breaker = self.dispatcher.breaker();
        self.metrics
            .export(&stats, &breaker, self.limits.rejections())
            .map_err(|err| GatewayError::internal(err.to_string()))
    }
}

fn route_cache_key(
    complexity: &ComplexityScore,
    explicit_model: &str,
    preferences: &crate::config::RouterPreferences,
    unavailable: &std::collections::HashSet<(String, String)>,
) -> String {
    let caps: Vec<&str> = complexity.required.iter().map(|c| c.as_ref()).collect();
    let mut down: Vec<String> = unavailable
        .iter()
        .map(|(provider, model)| format!("{provider}/{model}"))
        .collect();
    down.sort();
    format!(
        "route:{}:{}:{}:{}:{}:{}:{:?}:{}",
        complexity.score,
        caps.join("+"),
        explicit_model,
        preferences.prefer_fast,
        preferences.prefer_cheap,
        preferences.max_cost_per_1k_tokens,
        preferences.pricing_tier,
        down.join(",")
    )
}

fn extension_of(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 8
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}

fn map_blob_error(err: crate::services::blob_store::BlobError) -> GatewayError {
    use crate::services::blob_store::BlobError;
    match err {
        BlobError::TooLarge { limit } => {
            GatewayError::payload_too_large(format!("upload exceeds {limit} bytes"))
        }
        BlobError::NotFound => GatewayError::not_found("file bytes are gone"),
        other => GatewayError::internal(other.to_string()),
    }
}

fn map_blob_path(err: crate::paths::PathError) -> GatewayError {
    GatewayError::internal(err.to_string())
}

fn map_extract_error(err: ExtractError) -> GatewayError {
    match err {
        ExtractError::Malformed(reason) => GatewayError::validation(reason),
        ExtractError::Encrypted => GatewayError::unsupported_type("file is encrypted"),
        ExtractError::UnsupportedFeature(reason) => GatewayError::unsupported_type(reason),
        ExtractError::TooLarge => GatewayError::payload_too_large("file exceeds extractor budget"),
        ExtractError::Timeout => GatewayError::internal("extraction timed out"),
        ExtractError::Downstream { code, message } => {
            GatewayError::upstream(format!("transcription failed ({code}): {message}"))
        }
    }
}

fn map_dispatch_error(err: DispatchError) -> GatewayError {
    match err {
        DispatchError::Timeout => GatewayError::upstream_timeout("upstream deadline exceeded"),
        DispatchError::BreakerOpen { provider, model } => GatewayError::server_busy(format!(
            "provider {provider} is cooling down for {model}"
        )),
        DispatchError::Cancelled => GatewayError::internal("request cancelled"),
        DispatchError::Exhausted { attempts, last } => {
            if last.contains("breaker") {
                GatewayError::server_busy(format!(
                    "no upstream available after {attempts} attempts"
                ))
            } else {
                GatewayError::upstream(format!(
                    "upstream failed after {attempts} attempts: {last}"
                ))
            }
        }
        other => GatewayError::upstream(other.to_string()),
    }
}
