//! Keyed token-bucket rate limiting.
//!
//! Each configured [`RateRule`] owns a keyed governor limiter; the key is the
//! caller identity (source IP, or API key where the rule asks for it). The
//! state-information middleware lets us surface remaining capacity in the
//! `X-RateLimit-*` headers and the inspection endpoint.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::Serialize;

use crate::config::{IdentityMode, RateLimitConfig, RateRule};
use crate::gateway::Identity;

type KeyedLimiter =
    RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock, StateInformationMiddleware>;

/// Outcome of one rate-limit check, shaped for response headers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

struct RuleLimiter {
    rule: RateRule,
    limiter: KeyedLimiter,
}

pub struct RateLimitState {
    enabled: bool,
    rules: Vec<RuleLimiter>,
    trusted: HashSet<IpAddr>,
    // Last decision per (rule, identity); backs the inspection endpoint.
    last_seen: DashMap<String, RateDecision>,
    rejections: AtomicU64,
}

impl RateLimitState {
    pub fn new(config: &RateLimitConfig) -> Arc<Self> {
        debug_assert!(config.rules.iter().all(|r| r.capacity.get() > 0));
        let rules = config
            .rules
            .iter()
            .map(|rule| RuleLimiter {
                rule: rule.clone(),
                limiter: build_keyed_limiter(rule),
            })
            .collect();

        Arc::new(Self {
            enabled: config.enabled,
            rules,
            trusted: config.trusted_proxies.iter().copied().collect(),
            last_seen: DashMap::new(),
            rejections: AtomicU64::new(0),
        })
    }

    /// Total requests rejected since process start.
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub fn trusted_proxies(&self) -> &HashSet<IpAddr> {
        &self.trusted
    }

    /// Check the first rule matching `path` against the caller. `None` means
    /// no rule applies (or limiting is disabled) and the request passes
    /// unmetered.
    pub fn check(&self, path: &str, identity: &Identity, api_key: Option<&str>) -> Option<RateDecision> {
        if !self.enabled {
            return None;
        }

        let entry = self
            .rules
            .iter()
            .find(|r| route_glob_matches(&r.rule.route_glob, path))?;

        let bucket_key = bucket_identity(&entry.rule, identity, api_key);
        let key = format!("{}|{}", entry.rule.route_glob, bucket_key);
        let capacity = entry.rule.capacity.get();
        let window = entry.rule.window_secs.get();

        let decision = match entry.limiter.check_key(&key) {
            Ok(snapshot) => RateDecision {
                allowed: true,
                limit: capacity,
                remaining: snapshot.remaining_burst_capacity(),
                reset_secs: window,
                retry_after_ms: None,
            },
            Err(negative) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                let now = DefaultClock::default().now();
                let wait = negative.wait_time_from(now);
                RateDecision {
                    allowed: false,
                    limit: capacity,
                    remaining: 0,
                    reset_secs: wait.as_secs().max(1),
                    retry_after_ms: Some(wait.as_millis() as u64),
                }
            }
        };

        self.last_seen.insert(key, decision);
        Some(decision)
    }

    /// Snapshot for the inspection endpoint: every rule, plus the caller's
    /// last observed bucket state where one exists.
    pub fn inspect(&self, identity: &Identity, api_key: Option<&str>) -> Vec<RuleStatus> {
        self.rules
            .iter()
            .map(|entry| {
                let bucket_key = bucket_identity(&entry.rule, identity, api_key);
                let key = format!("{}|{}", entry.rule.route_glob, bucket_key);
                let last = self.last_seen.get(&key).map(|d| *d);
                RuleStatus {
                    route_glob: entry.rule.route_glob.clone(),
                    capacity: entry.rule.capacity.get(),
                    window_secs: entry.rule.window_secs.get(),
                    remaining: last.map(|d| d.remaining),
                    reset_secs: last.map(|d| d.reset_secs),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub route_glob: String,
    pub capacity: u32,
    pub window_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_secs: Option<u64>,
}

fn bucket_identity(rule: &RateRule, identity: &Identity, api_key: Option<&str>) -> String {
    match rule.identity {
        IdentityMode::ApiKey => match api_key {
            Some(key) => format!("key:{key}"),
            None => identity.key(),
        },
        IdentityMode::Ip => identity.key(),
    }
}

fn build_keyed_limiter(rule: &RateRule) -> KeyedLimiter {
    // Model "capacity per window" by replenishing capacity cells per window
    // with a burst of the full capacity, so an idle bucket admits exactly
    // `capacity` requests before the first rejection.
    let period = std::time::Duration::from_secs(rule.window_secs.get());
    #[allow(deprecated)]
    let quota = Quota::new(rule.capacity, period)
        .expect("window_secs is non-zero")
        .allow_burst(rule.capacity);
    RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>()
}

/// Route glob: exact match, or a `*`-terminated prefix.
pub fn route_glob_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::{NonZeroU32, NonZeroU64};

    fn rule(glob: &str, capacity: u32, window: u64) -> RateRule {
        RateRule {
            route_glob: glob.to_string(),
            capacity: NonZeroU32::new(capacity).unwrap(),
            window_secs: NonZeroU64::new(window).unwrap(),
            identity: IdentityMode::Ip,
        }
    }

    fn state(rules: Vec<RateRule>) -> Arc<RateLimitState> {
        RateLimitState::new(&RateLimitConfig {
            enabled: true,
            rules,
            trusted_proxies: Vec::new(),
        })
    }

    fn ip(last: u8) -> Identity {
        Identity::Ip(IpAddr::from([127, 0, 0, last]))
    }

    #[test]
    fn glob_matching() {
        assert!(route_glob_matches("/api/*", "/api/v1/upload"));
        assert!(route_glob_matches("/api/v1/upload", "/api/v1/upload"));
        assert!(!route_glob_matches("/api/v1/upload", "/api/v1/files"));
        assert!(!route_glob_matches("/api/*", "/health"));
        assert!(route_glob_matches("*", "/anything"));
    }

    #[test]
    fn bucket_admits_capacity_then_rejects() {
        let state = state(vec![rule("/api/*", 3, 60)]);
        let caller = ip(1);
        for i in 0..3 {
            let d = state.check("/api/v1/models", &caller, None).unwrap();
            assert!(d.allowed, "request {i} within capacity must pass");
        }
        let rejected = state.check("/api/v1/models", &caller, None).unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after_ms.is_some());
    }

    #[test]
    fn remaining_counts_down() {
        let state = state(vec![rule("/api/*", 5, 60)]);
        let caller = ip(2);
        let first = state.check("/api/v1/models", &caller, None).unwrap();
        let second = state.check("/api/v1/models", &caller, None).unwrap();
        assert_eq!(first.limit, 5);
        assert!(second.remaining < first.remaining);
    }

    #[test]
    fn buckets_are_per_identity() {
        let state = state(vec![rule("/api/*", 1, 60)]);
        assert!(state.check("/api/v1/models", &ip(3), None).unwrap().allowed);
        assert!(!state.check("/api/v1/models", &ip(3), None).unwrap().allowed);
        // Different caller, fresh bucket.
        assert!(state.check("/api/v1/models", &ip(4), None).unwrap().allowed);
    }

    #[test]
    fn first_matching_rule_wins() {
        let state = state(vec![rule("/api/v1/upload", 1, 60), rule("/api/*", 100, 60)]);
        let caller = ip(5);
        assert!(state.check("/api/v1/upload", &caller, None).unwrap().allowed);
        assert!(!state.check("/api/v1/upload", &caller, None).unwrap().allowed);
        // The broad rule still has capacity for other routes.
        assert!(state.check("/api/v1/models", &caller, None).unwrap().allowed);
    }

    #[test]
    fn unmatched_paths_pass_unmetered() {
        let state = state(vec![rule("/api/*", 1, 60)]);
        assert!(state.check("/health", &ip(6), None).is_none());
    }
}
