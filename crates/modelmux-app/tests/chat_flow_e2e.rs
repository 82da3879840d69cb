//! Chat dispatch tests against an in-process mock provider: buffered
//! completions, streaming parity, and pre-first-byte fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use futures_util::StreamExt;
use modelmux_app::Gateway;
use modelmux_app::config::AppConfig;
use modelmux_server::wire::ChatRequest;
use modelmux_server::{GatewayService, Identity, RequestScope};
use serde_json::{Value, json};
use tempfile::TempDir;

#[derive(Default)]
struct MockState {
    requests: AtomicUsize,
}

async fn mock_chat(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let model = body["model"].as_str().unwrap_or_default().to_string();

    if model == "always-503" {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    if body["stream"].as_bool() == Some(true) {
        let frames = [
            json!({"choices": [{"index": 0, "delta": {"content": "fo"}, "finish_reason": null}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "ur"}, "finish_reason": null}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        ];
        let mut payload = String::new();
        for frame in frames {
            payload.push_str(&format!("data: {frame}\n\n"));
        }
        payload.push_str("data: [DONE]\n\n");
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from(payload))
            .unwrap();
    }

    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "four"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
    }))
    .into_response()
}

/// Bind the mock provider on an ephemeral port and return its base URL.
async fn spawn_mock() -> (String, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/v1/chat/completions", post(mock_chat))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/v1"), state)
}

fn model_entry(id: &str, upstream: &str, cost: f64) -> Value {
    json!({
        "id": id,
        "upstream_id": upstream,
        "capabilities": ["text", "long-context"],
        "context_window": 128_000,
        "max_output_tokens": 4_096,
        "cost_per_1k_input": cost,
        "cost_per_1k_output": cost,
        "speed_tier": "fast",
        "pricing_tier": "standard",
    })
}

async fn gateway_with_provider(dir: &TempDir, base_url: &str, models: Vec<Value>) -> Arc<Gateway> {
    let mut config: AppConfig = serde_json::from_value(json!({
        "providers": [{
            "id": "mock",
            "base_url": base_url,
            "adapter": "custom",
            "models": models,
        }],
    }))
    .unwrap();
    config.storage.data_dir = Some(dir.path().to_path_buf());
    Gateway::bootstrap(config).await.unwrap()
}

fn chat_request(content: &str, stream: bool) -> ChatRequest {
    serde_json::from_value(json!({
        "messages": [{"role": "user", "content": content}],
        "stream": stream,
    }))
    .unwrap()
}

fn scope() -> RequestScope {
    RequestScope::new("req-chat", Identity::ApiKey("tester".to_string()))
}

#[tokio::test]
async fn buffered_chat_round_trips_through_the_mock_provider() {
    let dir = TempDir::new().unwrap();
    let (base_url, state) = spawn_mock().await;
    let gateway =
        gateway_with_provider(&dir, &base_url, vec![model_entry("mock-small", "mock-small", 0.01)])
            .await;

    let response = gateway.chat(&scope(), chat_request("2+2?", false)).await.unwrap();
    assert_eq!(response.object, "chat.completion");
    assert_eq!(response.model, "mock-small");
    assert_eq!(response.choices[0].message.content, "four");
    assert_eq!(response.usage.total_tokens, 4);
    assert_eq!(state.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn streaming_deltas_concatenate_to_the_buffered_content() {
    let dir = TempDir::new().unwrap();
    let (base_url, _state) = spawn_mock().await;
    let gateway =
        gateway_with_provider(&dir, &base_url, vec![model_entry("mock-small", "mock-small", 0.01)])
            .await;

    let buffered = gateway.chat(&scope(), chat_request("2+2?", false)).await.unwrap();

    let mut stream = gateway
        .chat_stream(&scope(), chat_request("2+2?", true))
        .await
        .unwrap();

    let mut assembled = String::new();
    let mut saw_finish = false;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        assert_eq!(chunk.object, "chat.completion.chunk");
        let choice = &chunk.choices[0];
        if let Some(content) = &choice.delta.content {
            assembled.push_str(content);
        }
        if choice.finish_reason.is_some() {
            saw_finish = true;
        }
    }

    assert!(saw_finish, "stream must end with a finish chunk");
    assert_eq!(assembled, buffered.choices[0].message.content);
}

#[tokio::test]
async fn failing_primary_falls_back_before_first_byte() {
    let dir = TempDir::new().unwrap();
    let (base_url, state) = spawn_mock().await;
    // The flaky candidate sorts first on cost; the steady one backs it up.
    let gateway = gateway_with_provider(
        &dir,
        &base_url,
        vec![
            model_entry("flaky", "always-503", 0.01),
            model_entry("steady", "steady", 0.02),
        ],
    )
    .await;

    let response = gateway.chat(&scope(), chat_request("2+2?", false)).await.unwrap();
    assert_eq!(response.model, "steady", "fallback candidate served the request");
    assert_eq!(response.choices[0].message.content, "four");
    assert_eq!(state.requests.load(Ordering::SeqCst), 2, "one failed, one served");
}

#[tokio::test]
async fn exhausted_candidates_surface_upstream_error() {
    let dir = TempDir::new().unwrap();
    let (base_url, _state) = spawn_mock().await;
    let gateway = gateway_with_provider(
        &dir,
        &base_url,
        vec![model_entry("flaky", "always-503", 0.01)],
    )
    .await;

    let err = gateway.chat(&scope(), chat_request("2+2?", false)).await.unwrap_err();
    assert_eq!(err.code(), "upstream-error");
    assert_eq!(err.status(), 502);
}

#[tokio::test]
async fn explicit_model_is_honored_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (base_url, _state) = spawn_mock().await;
    let gateway = gateway_with_provider(
        &dir,
        &base_url,
        vec![
            model_entry("mock-small", "mock-small", 0.01),
            model_entry("mock-large", "mock-large", 0.5),
        ],
    )
    .await;

    let request: ChatRequest = serde_json::from_value(json!({
        "messages": [{"role": "user", "content": "2+2?"}],
        "model": "mock-large",
    }))
    .unwrap();
    let response = gateway.chat(&scope(), request).await.unwrap();
    assert_eq!(response.model, "mock-large");
}
