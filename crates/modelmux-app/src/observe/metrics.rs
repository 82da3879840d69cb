//! Prometheus metrics for the gateway.

use prometheus::{
    CounterVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::services::cache::CacheStats;
use crate::upstream::breaker::CircuitBreaker;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: Histogram,
    upstream_latency: HistogramVec,
    fallbacks_total: IntCounter,
    model_requests: IntCounterVec,
    model_cost: CounterVec,
    model_tokens: IntCounterVec,
    cache_hits: IntGauge,
    cache_misses: IntGauge,
    cache_remote_errors: IntGauge,
    rate_limit_rejections: IntGauge,
    breaker_open: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("modelmux_requests_total", "HTTP requests by status class"),
            &["class"],
        )?;
        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "modelmux_request_duration_seconds",
                "End-to-end request duration in seconds",
            )
            .buckets(vec![0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0]),
        )?;
        let upstream_latency = HistogramVec::new(
            HistogramOpts::new(
                "modelmux_upstream_latency_seconds",
                "Upstream dispatch latency in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0, 300.0]),
            &["provider"],
        )?;
        let fallbacks_total = IntCounter::with_opts(Opts::new(
            "modelmux_upstream_fallbacks_total",
            "Requests served by a fallback candidate",
        ))?;
        let model_requests = IntCounterVec::new(
            Opts::new("modelmux_model_requests_total", "Requests per selected model"),
            &["model"],
        )?;
        let model_cost = CounterVec::new(
            Opts::new(
                "modelmux_model_cost_dollars_total",
                "Estimated spend per model, in dollars",
            ),
            &["model"],
        )?;
        let model_tokens = IntCounterVec::new(
            Opts::new(
                "modelmux_model_tokens_total",
                "Token throughput per model and direction",
            ),
            &["model", "direction"],
        )?;
        let cache_hits = IntGauge::with_opts(Opts::new(
            "modelmux_cache_hits",
            "Cache hits since process start",
        ))?;
        let cache_misses = IntGauge::with_opts(Opts::new(
            "modelmux_cache_misses",
            "Cache misses since process start",
        ))?;
        let cache_remote_errors = IntGauge::with_opts(Opts::new(
            "modelmux_cache_remote_errors",
            "Remote cache tier failures since process start",
        ))?;
        let rate_limit_rejections = IntGauge::with_opts(Opts::new(
            "modelmux_rate_limit_rejections",
            "Requests rejected by the rate limiter",
        ))?;
        let breaker_open = IntGaugeVec::new(
            Opts::new(
                "modelmux_circuit_breaker_open",
                "1 when the circuit breaker for a provider/model is open",
            ),
            &["provider", "model"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(fallbacks_total.clone()))?;
        registry.register(Box::new(model_requests.clone()))?;
        registry.register(Box::new(model_cost.clone()))?;
        registry.register(Box::new(model_tokens.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_remote_errors.clone()))?;
        registry.register(Box::new(rate_limit_rejections.clone()))?;
        registry.register(Box::new(breaker_open.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            upstream_latency,
            fallbacks_total,
            model_requests,
            model_cost,
            model_tokens,
            cache_hits,
            cache_misses,
            cache_remote_errors,
            rate_limit_rejections,
            breaker_open,
        })
    }

    pub fn record_request(&self, status: u16, latency_secs: f64) {
        let class = match status {
            100..=199 => "1xx",
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.requests_total.with_label_values(&[class]).inc();
        self.request_duration.observe(latency_secs);
    }

    pub fn record_upstream(&self, provider: &str, latency_secs: f64) {
        self.upstream_latency
            .with_label_values(&[provider])
            .observe(latency_secs);
    }

    pub fn record_dispatch(&self, model: &str, fallback_count: u32) {
        self.model_requests.with_label_values(&[model]).inc();
        if fallback_count > 0 {
            self.fallbacks_total.inc_by(u64::from(fallback_count));
        }
    }

    /// Usage accounting per model: token throughput and the estimated spend
    /// derived from the catalog prices.
    pub fn record_usage(
        &self,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        estimated_cost: f64,
    ) {
        self.model_tokens
            .with_label_values(&[model, "input"])
            .inc_by(prompt_tokens);
        self.model_tokens
            .with_label_values(&[model, "output"])
            .inc_by(completion_tokens);
        if estimated_cost > 0.0 {
            self.model_cost
                .with_label_values(&[model])
                .inc_by(estimated_cost);
        }
    }

    /// Export the registry, refreshing the gauges that mirror state owned by
    /// other components.
    pub fn export(
        &self,
        cache: &CacheStats,
        breaker: &CircuitBreaker,
        rate_limit_rejections: u64,
    ) -> Result<String, prometheus::Error> {
        use std::sync::atomic::Ordering;

        self.cache_hits.set(cache.hits.load(Ordering::Relaxed) as i64);
        self.cache_misses
            .set(cache.misses.load(Ordering::Relaxed) as i64);
        self.cache_remote_errors
            .set(cache.remote_errors.load(Ordering::Relaxed) as i64);
        self.rate_limit_rejections.set(rate_limit_rejections as i64);
        for (provider, model, open) in breaker.snapshot() {
            self.breaker_open
                .with_label_values(&[&provider, &model])
                .set(i64::from(open));
        }

        let encoder = TextEncoder::new();
        encoder.encode_to_string(&self.registry.gather())
    }
}
