//! Axum router, middleware stack, and request handlers.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header::RETRY_AFTER},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::StreamExt;
use moka::future::Cache;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::gateway::{
    ChunkStream, GatewayError, GatewayErrorKind, GatewayService, Identity, RequestScope, Upload,
};
use crate::limit::{RateDecision, RateLimitState};
use crate::wire::{ChatRequest, ErrorBody, ErrorDetail, FileListView, ModelCard, ModelListView};

const HEALTH_PATH: &str = "/health";
const REQUEST_ID_HEADER: &str = "x-request-id";
const MODELS_CACHE_TTL: Duration = Duration::from_secs(30);
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);
const CSP_VALUE: &str = "default-src 'none'; frame-ancestors 'none'";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
struct ApiState {
    service: Arc<dyn GatewayService>,
    limits: Arc<RateLimitState>,
    models_cache: Cache<u8, Arc<Vec<ModelCard>>>,
    config: Arc<ServerConfig>,
}

/// Build the full API router for the given service and configuration. The
/// rate-limit state is supplied by the caller so rejection counts stay
/// visible to the metrics exporter.
pub fn build_router(
    service: Arc<dyn GatewayService>,
    config: ServerConfig,
    limits: Arc<RateLimitState>,
) -> Router {
    debug_assert!(config.max_upload_bytes >= config.max_body_bytes);
    let state = ApiState {
        service,
        limits,
        models_cache: Cache::builder()
            .max_capacity(4)
            .time_to_live(MODELS_CACHE_TTL)
            .build(),
        config: Arc::new(config.clone()),
    };

    let upload_routes = Router::new()
        .route("/api/v1/upload", post(handle_upload))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes as usize));

    let api_routes = Router::new()
        .route("/api/v1/models", get(handle_models))
        .route("/api/v1/files", get(handle_list_files))
        .route(
            "/api/v1/files/{id}",
            get(handle_file_record).delete(handle_delete_file),
        )
        .route("/api/v1/files/{id}/extract", post(handle_extract))
        .route("/api/v1/chat/completions", post(handle_chat))
        .route("/api/v1/chat/multimodal", post(handle_multimodal))
        .route("/api/v1/analyze-complexity", post(handle_analyze))
        .route("/api/v1/monitoring/health", get(handle_monitoring_health))
        .route("/api/v1/monitoring/rate-limit", get(handle_rate_limit_status))
        .route("/api/v1/performance/metrics", get(handle_metrics))
        .layer(DefaultBodyLimit::max(config.max_body_bytes as usize));

    Router::new()
        .route(HEALTH_PATH, get(handle_health))
        .merge(api_routes)
        .merge(upload_routes)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(REQUEST_ID_HEADER)))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static(REQUEST_ID_HEADER),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until Ctrl-C or SIGTERM.
pub async fn serve(
    service: Arc<dyn GatewayService>,
    config: ServerConfig,
    limits: Arc<RateLimitState>,
) -> Result<(), ServerError> {
    let addr = parse_listen_addr(&config.listen_addr)?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| ServerError::Serve { source })?;
    tracing::info!(%local_addr, "modelmux gateway listening");

    let app =
        build_router(service, config, limits).into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|source| ServerError::Serve { source })?;

    tracing::info!("gateway shutdown complete");
    Ok(())
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }
    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => term.recv().await,
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                None
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    body: ErrorBody,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: ErrorDetail {
                    code: code.to_string(),
                    message: message.into(),
                    details: None,
                },
                status_code: status.as_u16(),
            },
            retry_after_secs: None,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after_secs = match err.kind {
            GatewayErrorKind::RateLimited { retry_after_ms } => {
                Some(retry_after_ms.map_or(1, |ms| ms.div_ceil(1000).max(1)))
            }
            _ => None,
        };
        Self {
            status,
            body: ErrorBody {
                error: ErrorDetail {
                    code: err.code().to_string(),
                    message: err.message,
                    details: err.details,
                },
                status_code: status.as_u16(),
            },
            retry_after_secs,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Unwind boundary: a panicking handler becomes a plain internal error and
/// the process keeps serving. The payload is logged, never echoed.
fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string());
    tracing::error!(%detail, "request handler panicked");
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal-error",
        "internal error; see server logs",
    )
    .into_response()
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn security_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static(CSP_VALUE),
    );
    response
}

async fn auth_middleware(
    State(state): State<ApiState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(req).await;
    };
    if req.uri().path() == HEALTH_PATH {
        return next.run(req).await;
    }

    let presented = header_str(req.headers(), &state.config.api_key_header);
    match presented {
        Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => next.run(req).await,
        Some(_) => ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid API key")
            .into_response(),
        None => ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            format!("missing {} header", state.config.api_key_header),
        )
        .into_response(),
    }
}

async fn rate_limit_middleware(
    State(state): State<ApiState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if path == HEALTH_PATH {
        return next.run(req).await;
    }

    let api_key = header_str(req.headers(), &state.config.api_key_header).map(str::to_string);
    let identity = resolve_identity(&req, &state, api_key.as_deref());

    match state.limits.check(&path, &identity, api_key.as_deref()) {
        None => next.run(req).await,
        Some(decision) if decision.allowed => {
            let mut response = next.run(req).await;
            apply_rate_headers(response.headers_mut(), &decision);
            response
        }
        Some(decision) => {
            tracing::info!(%identity, %path, "rate limit exceeded");
            let mut error = ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate-limited",
                "rate limit exceeded",
            );
            error.retry_after_secs = Some(decision.reset_secs);
            let mut response = error.into_response();
            apply_rate_headers(response.headers_mut(), &decision);
            response
        }
    }
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_secs.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Compare without early exit so timing does not leak the matching prefix.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn resolve_identity(req: &Request<Body>, state: &ApiState, api_key: Option<&str>) -> Identity {
    if let Some(key) = api_key {
        return Identity::ApiKey(key.to_string());
    }
    client_ip(req, state).map_or(Identity::Anonymous, Identity::Ip)
}

fn client_ip(req: &Request<Body>, state: &ApiState) -> Option<IpAddr> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())?;

    // Forwarded headers are only honored from configured proxies.
    if state.limits.trusted_proxies().contains(&peer) {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(str::trim)
            .and_then(|ip| ip.parse::<IpAddr>().ok());
        return forwarded.or(Some(peer));
    }
    Some(peer)
}

fn scope_from(headers: &HeaderMap, req_identity: Identity) -> RequestScope {
    let request_id = header_str(headers, REQUEST_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| uuid_fallback());
    RequestScope::new(request_id, req_identity)
}

fn uuid_fallback() -> String {
    // SetRequestIdLayer normally populates the header; this covers direct
    // router invocations in tests.
    format!("req-{:x}", rand_suffix())
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "modelmux-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<ApiState>) -> Result<Json<ModelListView>, ApiError> {
    let service = state.service.clone();
    let cards = state
        .models_cache
        .try_get_with(0u8, async move { service.list_models().await.map(Arc::new) })
        .await
        .map_err(|err: Arc<GatewayError>| ApiError::from((*err).clone()))?;

    Ok(Json(ModelListView {
        object: "list".to_string(),
        data: cards.as_ref().clone(),
    }))
}

async fn handle_upload(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let identity = identity_from_parts(&state, &headers, addr);
    let scope = scope_from(&headers, identity);

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| GatewayError::validation(format!("malformed multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let declared_name = field.file_name().unwrap_or("upload.bin").to_string();
        let declared_mime = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        // Drain the field into ordered chunks; the engine re-streams them
        // through its cap-aware hashing sink.
        let mut chunks: Vec<bytes::Bytes> = Vec::new();
        let mut total: u64 = 0;
        let mut field = field;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| GatewayError::validation(format!("upload read failed: {err}")))?
        {
            total += chunk.len() as u64;
            if total > state.config.max_upload_bytes {
                return Err(GatewayError::payload_too_large(format!(
                    "upload exceeds {} bytes",
                    state.config.max_upload_bytes
                ))
                .into());
            }
            chunks.push(chunk);
        }

        let data = Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));
        let record = state
            .service
            .upload(
                &scope,
                Upload {
                    declared_name,
                    declared_mime,
                    data,
                },
            )
            .await?;
        return Ok((StatusCode::OK, Json(record)).into_response());
    }

    Err(GatewayError::validation("multipart field `file` is required").into())
}

async fn handle_list_files(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<FileListView>, ApiError> {
    let identity = identity_from_parts(&state, &headers, addr);
    let scope = scope_from(&headers, identity);
    let files = state.service.list_files(&scope).await?;
    let count = files.len();
    Ok(Json(FileListView { files, count }))
}

async fn handle_file_record(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = identity_from_parts(&state, &headers, addr);
    let scope = scope_from(&headers, identity);
    let record = state.service.file_record(&scope, &id).await?;
    Ok(Json(record).into_response())
}

async fn handle_delete_file(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = identity_from_parts(&state, &headers, addr);
    let scope = scope_from(&headers, identity);
    state.service.delete_file(&scope, &id).await?;
    Ok((StatusCode::OK, Json(json!({ "deleted": id }))).into_response())
}

async fn handle_extract(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = identity_from_parts(&state, &headers, addr);
    let scope = scope_from(&headers, identity);
    let extraction = state.service.extract(&scope, &id).await?;
    Ok(Json(extraction).into_response())
}

async fn handle_chat(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    chat_response(state, headers, addr, request).await
}

async fn handle_multimodal(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    chat_response(state, headers, addr, request).await
}

async fn chat_response(
    state: ApiState,
    headers: HeaderMap,
    addr: SocketAddr,
    request: ChatRequest,
) -> Result<Response, ApiError> {
    let identity = identity_from_parts(&state, &headers, addr);
    let scope = scope_from(&headers, identity);

    if request.stream {
        let cancel = scope.cancel.clone();
        let stream = state.service.chat_stream(&scope, request).await?;
        let sse = Sse::new(sse_frames(stream, cancel))
            .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE));
        return Ok(sse.into_response());
    }

    let response = state.service.chat(&scope, request).await?;
    Ok(Json(response).into_response())
}

async fn handle_analyze(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let identity = identity_from_parts(&state, &headers, addr);
    let scope = scope_from(&headers, identity);
    let analysis = state.service.analyze(&scope, request).await?;
    Ok(Json(analysis).into_response())
}

async fn handle_monitoring_health(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let snapshot = state.service.health_snapshot().await?;
    Ok(Json(snapshot).into_response())
}

async fn handle_rate_limit_status(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let api_key = header_str(&headers, &state.config.api_key_header).map(str::to_string);
    let identity = identity_from_parts(&state, &headers, addr);
    let rules = state.limits.inspect(&identity, api_key.as_deref());
    Ok(Json(json!({ "identity": identity.key(), "rules": rules })).into_response())
}

async fn handle_metrics(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let text = state.service.metrics_text().await?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

fn identity_from_parts(state: &ApiState, headers: &HeaderMap, addr: SocketAddr) -> Identity {
    match header_str(headers, &state.config.api_key_header) {
        Some(key) => Identity::ApiKey(key.to_string()),
        None => Identity::Ip(addr.ip()),
    }
}

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

/// Cancels the request token when dropped armed. The SSE stream holds one of
/// these so a client disconnect (stream drop) propagates upstream; a normal
/// end of stream disarms it first.
struct CancelOnDrop {
    token: CancellationToken,
    armed: bool,
}

impl CancelOnDrop {
    fn armed(token: CancellationToken) -> Self {
        Self { token, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel();
        }
    }
}

/// Adapt a chunk stream into SSE frames: one `data:` frame per chunk, an
/// error frame on failure, and a terminal `[DONE]` sentinel. Each frame is
/// flushed as it is produced; chunks are never coalesced here.
fn sse_frames(
    stream: ChunkStream,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut guard = CancelOnDrop::armed(cancel);
        let mut stream = stream;
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    match Event::default().json_data(&chunk) {
                        Ok(event) => yield Ok(event),
                        Err(error) => {
                            tracing::warn!(%error, "failed to encode SSE chunk");
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    let body = json!({
                        "error": { "code": err.code(), "message": err.message }
                    });
                    yield Ok(Event::default().data(body.to_string()));
                    break;
                }
                None => break,
            }
        }
        guard.disarm();
        yield Ok(Event::default().data("[DONE]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secrex"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn listen_addr_parsing() {
        assert!(parse_listen_addr("127.0.0.1:8100").is_ok());
        assert!(matches!(parse_listen_addr(""), Err(ServerError::EmptyListenAddr)));
        assert!(matches!(
            parse_listen_addr("not-an-addr"),
            Err(ServerError::InvalidListenAddr { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_on_drop_fires_when_armed() {
        let token = CancellationToken::new();
        {
            let _guard = CancelOnDrop::armed(token.clone());
        }
        assert!(token.is_cancelled());

        let token = CancellationToken::new();
        {
            let mut guard = CancelOnDrop::armed(token.clone());
            guard.disarm();
        }
        assert!(!token.is_cancelled());
    }
}
