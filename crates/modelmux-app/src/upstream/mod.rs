//! Upstream dispatch: pooled per-provider clients, retry with fallback
//! before first byte, circuit breaking, and chunked streaming.

pub mod adapter;
pub mod breaker;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use futures_util::StreamExt;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ProviderConfig;
use crate::router::catalog::ModelDescriptor;
use adapter::{AdapterError, AdapterKind, BufferedOutput};
use breaker::CircuitBreaker;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const FULL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(600);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 32;
const USER_AGENT: &str = concat!("modelmux/", env!("CARGO_PKG_VERSION"));
/// Primary plus at most two fallback candidates.
const MAX_ATTEMPTS: usize = 3;
const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_JITTER: f64 = 0.3;

/// One unit of upstream output.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamChunk {
    Delta(String),
    ToolCallDelta(Value),
    Finish { reason: String },
    Error { message: String },
    Keepalive,
}

/// Normalized request handed to the adapters.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub messages: Vec<modelmux_server::wire::ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
    /// Base64 image payloads for vision-capable models.
    pub images: Vec<ImageAttachment>,
}

#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub mime: String,
    pub data_base64: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("model `{0}` belongs to an unconfigured provider")]
    UnknownProvider(String),
    #[error("circuit breaker open for {provider}/{model}")]
    BreakerOpen { provider: String, model: String },
    #[error("upstream transport failure: {0}")]
    Transport(String),
    #[error("upstream returned status {status}")]
    Status { status: u16 },
    #[error("upstream deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("request cancelled by client")]
    Cancelled,
    #[error("all {attempts} upstream attempts failed; last: {last}")]
    Exhausted { attempts: usize, last: String },
}

impl DispatchError {
    /// Whether trying the next fallback candidate is permitted.
    fn retryable(&self) -> bool {
        match self {
            DispatchError::Transport(_) | DispatchError::Timeout => true,
            DispatchError::Status { status } => matches!(status, 502 | 503 | 504 | 429),
            DispatchError::BreakerOpen { .. } => true,
            _ => false,
        }
    }

    fn tag_code(&self) -> String {
        match self {
            DispatchError::Status { status } => status.to_string(),
            DispatchError::Timeout => "timeout".to_string(),
            DispatchError::Transport(_) => "transport".to_string(),
            DispatchError::BreakerOpen { .. } => "breaker-open".to_string(),
            DispatchError::Cancelled => "cancelled".to_string(),
            _ => "error".to_string(),
        }
    }
}

/// How the winning candidate was reached.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub model_id: String,
    pub provider_id: String,
    pub fallback_count: u32,
    pub rationale: Vec<String>,
}

pub struct BufferedDispatch {
    pub outcome: DispatchOutcome,
    pub output: BufferedOutput,
    pub upstream_latency_ms: u64,
}

pub type UpstreamStream =
    Pin<Box<dyn Stream<Item = Result<UpstreamChunk, DispatchError>> + Send + 'static>>;

pub struct StreamingDispatch {
    pub outcome: DispatchOutcome,
    pub stream: UpstreamStream,
}

struct ProviderEndpoint {
    base_url: Url,
    api_key: Option<String>,
    adapter: AdapterKind,
    client: reqwest::Client,
}

/// Owns one pooled HTTP client per provider and the circuit breaker.
pub struct Dispatcher {
    endpoints: HashMap<String, ProviderEndpoint>,
    breaker: Arc<CircuitBreaker>,
}

impl Dispatcher {
    pub fn new(providers: &[ProviderConfig]) -> Self {
        let mut endpoints = HashMap::new();
        for provider in providers {
            let client = reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .read_timeout(READ_TIMEOUT)
                .timeout(FULL_RESPONSE_TIMEOUT)
                .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
                .user_agent(USER_AGENT)
                .build();
            let client = match client {
                Ok(client) => client,
                Err(error) => {
                    tracing::error!(%error, provider = %provider.id, "failed to build upstream client");
                    continue;
                }
            };
            let api_key = provider
                .api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok());
            endpoints.insert(
                provider.id.clone(),
                ProviderEndpoint {
                    base_url: provider.base_url.clone(),
                    api_key,
                    adapter: provider.adapter,
                    client,
                },
            );
        }
        Self {
            endpoints,
            breaker: Arc::new(CircuitBreaker::new()),
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    /// Buffered dispatch across the candidate chain. Fallback moves to the
    /// next candidate only on retryable failures.
    pub async fn dispatch_buffered(
        &self,
        candidates: &[ModelDescriptor],
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<BufferedDispatch, DispatchError> {
        let mut rationale = Vec::new();
        let mut last_error: Option<DispatchError> = None;
        let mut attempts = 0usize;

        for (index, model) in candidates.iter().take(MAX_ATTEMPTS).enumerate() {
            if index > 0 {
                tokio::time::sleep(backoff_delay(index as u32 - 1)).await;
            }
            attempts += 1;

            match self.attempt_buffered(model, request, cancel).await {
                Ok((output, latency_ms)) => {
                    self.breaker.record_success(&model.provider_id, &model.id);
                    return Ok(BufferedDispatch {
                        outcome: DispatchOutcome {
                            model_id: model.id.clone(),
                            provider_id: model.provider_id.clone(),
                            fallback_count: index as u32,
                            rationale,
                        },
                        output,
                        upstream_latency_ms: latency_ms,
                    });
                }
                Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(err) => {
                    if !matches!(err, DispatchError::BreakerOpen { .. }) {
                        self.breaker.record_failure(&model.provider_id, &model.id);
                    }
                    rationale.push(attempt_tag(index, &err));
                    let fatal = !err.retryable();
                    last_error = Some(err);
                    if fatal {
                        break;
                    }
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no candidates".to_string());
        Err(DispatchError::Exhausted { attempts, last })
    }

    /// Streaming dispatch: fallback applies only until the upstream response
    /// is accepted; after that the stream is committed.
    pub async fn dispatch_stream(
        &self,
        candidates: &[ModelDescriptor],
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<StreamingDispatch, DispatchError> {
        let mut rationale = Vec::new();
        let mut last_error: Option<DispatchError> = None;
        let mut attempts = 0usize;

        for (index, model) in candidates.iter().take(MAX_ATTEMPTS).enumerate() {
            if index > 0 {
                tokio::time::sleep(backoff_delay(index as u32 - 1)).await;
            }
            attempts += 1;

            match self.open_stream(model, request, cancel).await {
                Ok(response) => {
                    let stream = chunk_stream(
                        response,
                        self.endpoint(model)?.adapter,
                        self.breaker.clone(),
                        model.provider_id.clone(),
                        model.id.clone(),
                        cancel.clone(),
                    );
                    return Ok(StreamingDispatch {
                        outcome: DispatchOutcome {
                            model_id: model.id.clone(),
                            provider_id: model.provider_id.clone(),
                            fallback_count: index as u32,
                            rationale,
                        },
                        stream,
                    });
                }
                Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(err) => {
                    if !matches!(err, DispatchError::BreakerOpen { .. }) {
                        self.breaker.record_failure(&model.provider_id, &model.id);
                    }
                    rationale.push(attempt_tag(index, &err));
                    let fatal = !err.retryable();
                    last_error = Some(err);
                    if fatal {
                        break;
                    }
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no candidates".to_string());
        Err(DispatchError::Exhausted { attempts, last })
    }

    fn endpoint(&self, model: &ModelDescriptor) -> Result<&ProviderEndpoint, DispatchError> {
        self.endpoints
            .get(&model.provider_id)
            .ok_or_else(|| DispatchError::UnknownProvider(model.id.clone()))
    }

    async fn attempt_buffered(
        &self,
        model: &ModelDescriptor,
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<(BufferedOutput, u64), DispatchError> {
        let started = Instant::now();
        let response = self.open_response(model, request, false, cancel).await?;
        let endpoint = self.endpoint(model)?;

        let body: Value = tokio::select! {
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            body = response.json() => body.map_err(|err| DispatchError::Transport(err.to_string()))?,
        };

        let output = endpoint.adapter.parse_buffered(&body)?;
        Ok((output, started.elapsed().as_millis() as u64))
    }

    async fn open_stream(
        &self,
        model: &ModelDescriptor,
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, DispatchError> {
        self.open_response(model, request, true, cancel).await
    }

    async fn open_response(
        &self,
        model: &ModelDescriptor,
        request: &UpstreamRequest,
        stream: bool,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, DispatchError> {
        if self.breaker.is_open(&model.provider_id, &model.id) {
            return Err(DispatchError::BreakerOpen {
                provider: model.provider_id.clone(),
                model: model.id.clone(),
            });
        }

        let endpoint = self.endpoint(model)?;
        let adapted = endpoint.adapter.build_request(
            &endpoint.base_url,
            endpoint.api_key.as_deref(),
            model,
            request,
            stream,
        )?;

        let mut builder = endpoint.client.post(adapted.url).json(&adapted.body);
        for (name, value) in &adapted.headers {
            builder = builder.header(*name, value);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            sent = builder.send() => sent.map_err(classify_reqwest_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Transport(err.to_string())
    }
}

fn attempt_tag(index: usize, err: &DispatchError) -> String {
    let position = if index == 0 {
        "primary".to_string()
    } else {
        format!("fallback{index}")
    };
    format!("{position}-{}", err.tag_code())
}

/// ±30 % jittered exponential backoff, 250 ms base.
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE.as_millis() as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::thread_rng().gen_range(-RETRY_JITTER..=RETRY_JITTER);
    Duration::from_millis((base * (1.0 + jitter)).max(1.0) as u64)
}

/// Adapt the upstream byte stream into parsed chunks. Cancellation drops the
/// response, which aborts the request and returns the connection to the
/// pool. Backpressure is inherited: the next upstream chunk is only read
/// after the previous one has been yielded downstream.
fn chunk_stream(
    response: reqwest::Response,
    adapter: AdapterKind,
    breaker: Arc<CircuitBreaker>,
    provider_id: String,
    model_id: String,
    cancel: CancellationToken,
) -> UpstreamStream {
    Box::pin(async_stream::stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut clean_finish = false;

        'outer: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'outer;
                }
                next = bytes.next() => {
                    match next {
                        Some(Ok(chunk)) => {
                            buffer.extend_from_slice(&chunk);
                            while let Some(line) = take_line(&mut buffer) {
                                let outcome = adapter.parse_line(&line);
                                for parsed in outcome.chunks {
                                    yield Ok(parsed);
                                }
                                if outcome.terminal {
                                    clean_finish = true;
                                    break 'outer;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            breaker.record_failure(&provider_id, &model_id);
                            yield Err(DispatchError::Transport(err.to_string()));
                            break 'outer;
                        }
                        None => {
                            clean_finish = true;
                            break 'outer;
                        }
                    }
                }
            }
        }

        if clean_finish {
            breaker.record_success(&provider_id, &model_id);
        }
    })
}

/// Pop one `\n`-terminated line from the buffer, trimming a trailing `\r`.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let position = buffer.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=position).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_line_splits_and_trims() {
        let mut buffer = b"first\r\nsecond\npartial".to_vec();
        assert_eq!(take_line(&mut buffer).as_deref(), Some("first"));
        assert_eq!(take_line(&mut buffer).as_deref(), Some("second"));
        assert_eq!(take_line(&mut buffer), None);
        assert_eq!(buffer, b"partial");
    }

    #[test]
    fn backoff_grows_with_attempts_within_jitter() {
        for attempt in 0..3 {
            let delay = backoff_delay(attempt);
            let base = 250u64 * 2u64.pow(attempt);
            let low = (base as f64 * 0.69) as u64;
            let high = (base as f64 * 1.31) as u64;
            assert!(
                (low..=high).contains(&(delay.as_millis() as u64)),
                "attempt {attempt}: {delay:?} outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(DispatchError::Status { status: 503 }.retryable());
        assert!(DispatchError::Status { status: 502 }.retryable());
        assert!(DispatchError::Timeout.retryable());
        assert!(DispatchError::Transport("refused".into()).retryable());
        assert!(!DispatchError::Status { status: 400 }.retryable());
        assert!(!DispatchError::Status { status: 401 }.retryable());
    }

    #[test]
    fn attempt_tags_name_the_failing_hop() {
        assert_eq!(
            attempt_tag(0, &DispatchError::Status { status: 503 }),
            "primary-503"
        );
        assert_eq!(
            attempt_tag(1, &DispatchError::Timeout),
            "fallback1-timeout"
        );
    }
}
