//! Service seam between the HTTP layer and the gateway engine.
//!
//! The router only ever talks to a [`GatewayService`]; the engine crate
//! implements it. Errors cross the seam as [`GatewayError`] values carrying a
//! stable code, a display-safe message, and optional structured details.

use std::fmt;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::wire::{
    AnalysisView, ChatRequest, ChatResponse, ExtractionView, FileRecordView, HealthSnapshotView,
    ModelCard, StreamChunk,
};

/// Who is making the request, for rate limiting and file visibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    ApiKey(String),
    Ip(IpAddr),
    Anonymous,
}

impl Identity {
    /// Stable key used for rate buckets and per-identity file listings.
    pub fn key(&self) -> String {
        match self {
            Identity::ApiKey(k) => format!("key:{k}"),
            Identity::Ip(ip) => format!("ip:{ip}"),
            Identity::Anonymous => "anonymous".to_string(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Per-request context handed to every service call. Carries the request id,
/// the caller identity, the effective deadline and the cancellation signal;
/// observability and upstream dispatch take it explicitly instead of reading
/// ambient globals.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub request_id: String,
    pub identity: Identity,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl RequestScope {
    pub fn new(request_id: impl Into<String>, identity: Identity) -> Self {
        Self {
            request_id: request_id.into(),
            identity,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Byte stream handed to `upload`; chunks arrive in order.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send + 'static>>;

/// Finite stream of chat chunks produced by a streaming dispatch. Not
/// restartable; dropping it cancels the upstream request.
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send + 'static>>;

/// An inbound upload before it has been persisted.
pub struct Upload {
    pub declared_name: String,
    pub declared_mime: String,
    pub data: ByteStream,
}

#[derive(Debug, Clone)]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayErrorKind {
    Validation,
    Unauthorized,
    Forbidden,
    NotFound,
    PayloadTooLarge,
    UnsupportedType,
    RateLimited { retry_after_ms: Option<u64> },
    ServerBusy,
    UpstreamError,
    UpstreamTimeout,
    Internal,
}

impl GatewayError {
    fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Validation, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::NotFound, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::PayloadTooLarge, message)
    }

    pub fn unsupported_type(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::UnsupportedType, message)
    }

    pub fn server_busy(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::ServerBusy, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::UpstreamError, message)
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::UpstreamTimeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Internal, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Stable error code exposed on the wire.
    pub fn code(&self) -> &'static str {
        match self.kind {
            GatewayErrorKind::Validation => "validation-error",
            GatewayErrorKind::Unauthorized => "unauthorized",
            GatewayErrorKind::Forbidden => "forbidden",
            GatewayErrorKind::NotFound => "not-found",
            GatewayErrorKind::PayloadTooLarge => "payload-too-large",
            GatewayErrorKind::UnsupportedType => "unsupported-type",
            GatewayErrorKind::RateLimited { .. } => "rate-limited",
            GatewayErrorKind::ServerBusy => "server-busy",
            GatewayErrorKind::UpstreamError => "upstream-error",
            GatewayErrorKind::UpstreamTimeout => "upstream-timeout",
            GatewayErrorKind::Internal => "internal-error",
        }
    }

    pub fn status(&self) -> u16 {
        match self.kind {
            GatewayErrorKind::Validation => 400,
            GatewayErrorKind::Unauthorized => 401,
            GatewayErrorKind::Forbidden => 403,
            GatewayErrorKind::NotFound => 404,
            GatewayErrorKind::PayloadTooLarge => 413,
            GatewayErrorKind::UnsupportedType => 415,
            GatewayErrorKind::RateLimited { .. } => 429,
            GatewayErrorKind::ServerBusy => 503,
            GatewayErrorKind::UpstreamError => 502,
            GatewayErrorKind::UpstreamTimeout => 504,
            GatewayErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

impl std::error::Error for GatewayError {}

/// Everything the HTTP layer needs from the engine.
#[async_trait]
pub trait GatewayService: Send + Sync + 'static {
    /// Catalog visible under the current pricing tier.
    async fn list_models(&self) -> Result<Vec<ModelCard>, GatewayError>;

    /// Consume the upload stream, persist it and return the record.
    async fn upload(
        &self,
        scope: &RequestScope,
        upload: Upload,
    ) -> Result<FileRecordView, GatewayError>;

    async fn list_files(&self, scope: &RequestScope)
        -> Result<Vec<FileRecordView>, GatewayError>;

    async fn file_record(
        &self,
        scope: &RequestScope,
        file_id: &str,
    ) -> Result<FileRecordView, GatewayError>;

    async fn delete_file(&self, scope: &RequestScope, file_id: &str)
        -> Result<(), GatewayError>;

    /// Force extraction; idempotent and single-flight per file id.
    async fn extract(
        &self,
        scope: &RequestScope,
        file_id: &str,
    ) -> Result<ExtractionView, GatewayError>;

    /// Buffered chat completion.
    async fn chat(
        &self,
        scope: &RequestScope,
        request: ChatRequest,
    ) -> Result<ChatResponse, GatewayError>;

    /// Streaming chat completion; the returned stream ends with a finish
    /// chunk. Dropping the stream cancels the upstream request.
    async fn chat_stream(
        &self,
        scope: &RequestScope,
        request: ChatRequest,
    ) -> Result<ChunkStream, GatewayError>;

    /// Score + route preview without dispatching upstream.
    async fn analyze(
        &self,
        scope: &RequestScope,
        request: ChatRequest,
    ) -> Result<AnalysisView, GatewayError>;

    async fn health_snapshot(&self) -> Result<HealthSnapshotView, GatewayError>;

    /// Prometheus text exposition.
    async fn metrics_text(&self) -> Result<String, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_statuses() {
        let cases = [
            (GatewayError::validation("x"), 400, "validation-error"),
            (GatewayError::unauthorized("x"), 401, "unauthorized"),
            (GatewayError::forbidden("x"), 403, "forbidden"),
            (GatewayError::not_found("x"), 404, "not-found"),
            (GatewayError::payload_too_large("x"), 413, "payload-too-large"),
            (GatewayError::unsupported_type("x"), 415, "unsupported-type"),
            (GatewayError::server_busy("x"), 503, "server-busy"),
            (GatewayError::upstream("x"), 502, "upstream-error"),
            (GatewayError::upstream_timeout("x"), 504, "upstream-timeout"),
            (GatewayError::internal("x"), 500, "internal-error"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn identity_keys_are_disjoint() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_ne!(Identity::Ip(ip).key(), Identity::ApiKey("10.0.0.1".into()).key());
        assert_eq!(Identity::Anonymous.key(), "anonymous");
    }
}
