//! Observability: structured request events, metrics, health.

pub mod health;
pub mod metrics;

pub use health::{HealthMonitor, HealthSnapshot, spawn_prober};
pub use metrics::Metrics;

/// One structured completion event per request; every field is explicit so
/// nothing is read from ambient globals.
#[derive(Debug, Clone, Default)]
pub struct RequestEvent {
    pub request_id: String,
    pub identity: String,
    pub route: String,
    pub status: u16,
    pub latency_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub selected_model: Option<String>,
    pub complexity_score: Option<u8>,
    pub rationale: Vec<String>,
    pub cache_hit: bool,
    pub upstream_latency_ms: Option<u64>,
    pub fallback_count: u32,
    pub error_code: Option<String>,
}

impl RequestEvent {
    pub fn emit(&self) {
        tracing::info!(
            target: "modelmux::request",
            request_id = %self.request_id,
            identity = %self.identity,
            route = %self.route,
            status = self.status,
            latency_ms = self.latency_ms,
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            selected_model = self.selected_model.as_deref().unwrap_or("-"),
            complexity_score = self.complexity_score.map(i64::from).unwrap_or(-1),
            rationale = %self.rationale.join(","),
            cache_hit = self.cache_hit,
            upstream_latency_ms = self.upstream_latency_ms.map(|v| v as i64).unwrap_or(-1),
            fallback_count = self.fallback_count,
            error_code = self.error_code.as_deref().unwrap_or("-"),
            "request completed"
        );
    }
}
