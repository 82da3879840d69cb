//! HTTP surface tests against a stub gateway service: routing, middleware
//! headers, rate limiting, auth, and SSE framing.

use std::net::SocketAddr;
use std::num::{NonZeroU32, NonZeroU64};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use modelmux_server::wire::{
    AnalysisView, ChatRequest, ChatResponse, Choice, ChoiceMessage, ComplexityView, ExtractionView,
    FileRecordView, HealthSnapshotView, ModelCard, Role, RouteView, StreamChunk, Usage,
};
use modelmux_server::{
    ChunkStream, GatewayError, GatewayService, IdentityMode, RateLimitConfig, RateLimitState,
    RateRule, RequestScope, ServerConfig, Upload, build_router,
};

use serde_json::{Value, json};
use tower::ServiceExt;

struct StubService;

#[async_trait]
impl GatewayService for StubService {
    async fn list_models(&self) -> Result<Vec<ModelCard>, GatewayError> {
        Ok(vec![ModelCard {
            id: "llama3.2-local".to_string(),
            provider: "ollama".to_string(),
            capabilities: vec!["text".to_string()],
            context_window: 2048,
            max_output_tokens: 2048,
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            speed_tier: "fast".to_string(),
            pricing_tier: "local".to_string(),
            available: true,
        }])
    }

    async fn upload(
        &self,
        _scope: &RequestScope,
        upload: Upload,
    ) -> Result<FileRecordView, GatewayError> {
        use futures_util::StreamExt;
        let mut data = upload.data;
        let mut size = 0u64;
        while let Some(chunk) = data.next().await {
            size += chunk?.len() as u64;
        }
        Ok(FileRecordView {
            id: "f1".to_string(),
            original_filename: upload.declared_name.clone(),
            filename: upload.declared_name,
            size,
            declared_mime: upload.declared_mime,
            detected_mime: "text/plain".to_string(),
            sha256: "0".repeat(64),
            uploaded_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now(),
            extraction_status: "pending".to_string(),
        })
    }

    async fn list_files(
        &self,
        _scope: &RequestScope,
    ) -> Result<Vec<FileRecordView>, GatewayError> {
        Ok(vec![])
    }

    async fn file_record(
        &self,
        _scope: &RequestScope,
        file_id: &str,
    ) -> Result<FileRecordView, GatewayError> {
        Err(GatewayError::not_found(format!("unknown file id `{file_id}`")))
    }

    async fn delete_file(
        &self,
        _scope: &RequestScope,
        _file_id: &str,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn extract(
        &self,
        _scope: &RequestScope,
        file_id: &str,
    ) -> Result<ExtractionView, GatewayError> {
        Ok(ExtractionView {
            file_id: file_id.to_string(),
            kind: "text".to_string(),
            text: "stub".to_string(),
            truncated: false,
            metadata: Value::Null,
            extractor_id: "text-plain".to_string(),
            extractor_version: "1".to_string(),
            elapsed_ms: 1,
            warnings: vec![],
        })
    }

    async fn chat(
        &self,
        _scope: &RequestScope,
        request: ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::validation("messages may not be empty"));
        }
        Ok(ChatResponse {
            id: "chatcmpl-stub".to_string(),
            object: "chat.completion".to_string(),
            created: 1_700_000_000,
            model: "llama3.2-local".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: Role::Assistant,
                    content: "4".to_string(),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage {
                prompt_tokens: 3,
                completion_tokens: 1,
                total_tokens: 4,
            },
            files_processed: None,
        })
    }

    async fn chat_stream(
        &self,
        _scope: &RequestScope,
        _request: ChatRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let chunks = vec![
            Ok(StreamChunk::content("chatcmpl-stub", "llama3.2-local", 1, "fo".into())),
            Ok(StreamChunk::content("chatcmpl-stub", "llama3.2-local", 1, "ur".into())),
            Ok(StreamChunk::finish("chatcmpl-stub", "llama3.2-local", 1, "stop")),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn analyze(
        &self,
        _scope: &RequestScope,
        _request: ChatRequest,
    ) -> Result<AnalysisView, GatewayError> {
        Ok(AnalysisView {
            complexity: ComplexityView {
                score: 3,
                required_capabilities: vec!["text".to_string()],
                estimated_input_tokens: 2,
                estimated_output_ceiling: 4096,
                rationale: vec![],
            },
            route: RouteView {
                model: "llama3.2-local".to_string(),
                provider: "ollama".to_string(),
                reasons: vec!["auto-selected".to_string()],
                fallbacks: vec![],
            },
        })
    }

    async fn health_snapshot(&self) -> Result<HealthSnapshotView, GatewayError> {
        Ok(HealthSnapshotView {
            uptime_secs: 1,
            cpu_percent: 1.0,
            memory_percent: 2.0,
            disk_percent: 3.0,
            providers: vec![],
        })
    }

    async fn metrics_text(&self) -> Result<String, GatewayError> {
        Ok("modelmux_requests_total 0\n".to_string())
    }
}

fn router_with(config: ServerConfig) -> axum::Router {
    let limits = RateLimitState::new(&config.rate_limit);
    build_router(Arc::new(StubService), config, limits)
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let mut request = builder.body(body).expect("request builds");
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
    request
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_returns_service_identity() {
    let app = router_with(ServerConfig::default());
    let response = app.oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["status"], "healthy");
    assert_eq!(value["service"], "modelmux-gateway");
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let app = router_with(ServerConfig::default());
    let response = app
        .oneshot(request("GET", "/api/v1/models", None))
        .await
        .unwrap();
    let headers = response.headers();
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(headers.get("referrer-policy").unwrap(), "no-referrer");
    assert!(headers.contains_key("content-security-policy"));
}

#[tokio::test]
async fn models_endpoint_lists_catalog() {
    let app = router_with(ServerConfig::default());
    let response = app
        .oneshot(request("GET", "/api/v1/models", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["object"], "list");
    assert_eq!(value["data"][0]["id"], "llama3.2-local");
}

#[tokio::test]
async fn chat_round_trip_is_openai_shaped() {
    let app = router_with(ServerConfig::default());
    let body = json!({ "messages": [{"role": "user", "content": "2+2?"}] });
    let response = app
        .oneshot(request("POST", "/api/v1/chat/completions", Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["object"], "chat.completion");
    assert_eq!(value["choices"][0]["message"]["content"], "4");
    assert_eq!(value["usage"]["total_tokens"], 4);
}

#[tokio::test]
async fn empty_message_list_is_a_validation_error() {
    let app = router_with(ServerConfig::default());
    let body = json!({ "messages": [] });
    let response = app
        .oneshot(request("POST", "/api/v1/chat/completions", Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "validation-error");
    assert_eq!(value["status_code"], 400);
}

#[tokio::test]
async fn unknown_file_id_maps_to_not_found_body() {
    let app = router_with(ServerConfig::default());
    let response = app
        .oneshot(request("GET", "/api/v1/files/nope", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "not-found");
}

#[tokio::test]
async fn streaming_chat_emits_sse_frames_and_done() {
    let app = router_with(ServerConfig::default());
    let body = json!({
        "messages": [{"role": "user", "content": "2+2?"}],
        "stream": true,
    });
    let response = app
        .oneshot(request("POST", "/api/v1/chat/completions", Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let raw = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(raw.to_vec()).unwrap();

    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|f| f.starts_with("data:"))
        .collect();
    assert!(frames.len() >= 4, "expected deltas + finish + [DONE]: {text}");
    assert!(frames.last().unwrap().contains("[DONE]"));

    // The concatenated deltas equal the buffered content for this response.
    let mut assembled = String::new();
    for frame in &frames {
        let payload = frame.trim_start_matches("data:").trim();
        if payload == "[DONE]" {
            continue;
        }
        let value: Value = serde_json::from_str(payload).unwrap();
        if let Some(content) = value["choices"][0]["delta"]["content"].as_str() {
            assembled.push_str(content);
        }
    }
    assert_eq!(assembled, "four");
}

#[tokio::test]
async fn rate_limit_exhaustion_returns_429_with_headers() {
    let config = ServerConfig {
        rate_limit: RateLimitConfig {
            enabled: true,
            rules: vec![RateRule {
                route_glob: "/api/*".to_string(),
                capacity: NonZeroU32::new(2).unwrap(),
                window_secs: NonZeroU64::new(60).unwrap(),
                identity: IdentityMode::Ip,
            }],
            trusted_proxies: vec![],
        },
        ..ServerConfig::default()
    };
    let limits = RateLimitState::new(&config.rate_limit);
    let app = build_router(Arc::new(StubService), config, limits.clone());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request("GET", "/api/v1/models", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
    }

    let rejected = app
        .clone()
        .oneshot(request("GET", "/api/v1/models", None))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        rejected.headers().get("x-ratelimit-remaining").unwrap(),
        "0"
    );
    assert!(rejected.headers().contains_key("x-ratelimit-reset"));
    assert!(rejected.headers().contains_key("retry-after"));
    assert_eq!(limits.rejections(), 1);

    let value = body_json(rejected).await;
    assert_eq!(value["error"]["code"], "rate-limited");

    // Health stays unmetered.
    let health = app.oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_key_is_enforced_when_configured() {
    let config = ServerConfig {
        api_key: Some("sekret".to_string()),
        ..ServerConfig::default()
    };
    let app = router_with(config);

    let denied = app
        .clone()
        .oneshot(request("GET", "/api/v1/models", None))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let mut authed = request("GET", "/api/v1/models", None);
    authed
        .headers_mut()
        .insert("x-api-key", "sekret".parse().unwrap());
    let allowed = app.clone().oneshot(authed).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    // Health never requires the key.
    let health = app.oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_inspection_reports_rules() {
    let app = router_with(ServerConfig::default());
    let warmup = app
        .clone()
        .oneshot(request("GET", "/api/v1/models", None))
        .await
        .unwrap();
    assert_eq!(warmup.status(), StatusCode::OK);

    let response = app
        .oneshot(request("GET", "/api/v1/monitoring/rate-limit", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["rules"][0]["capacity"], 100);
    assert_eq!(value["rules"][0]["window_secs"], 60);
}

#[tokio::test]
async fn request_id_is_echoed_when_present() {
    let app = router_with(ServerConfig::default());
    let mut req = request("GET", "/api/v1/models", None);
    req.headers_mut()
        .insert("x-request-id", "req-abc123".parse().unwrap());
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-abc123");
}
