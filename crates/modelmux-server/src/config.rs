//! Server-side configuration: listener, auth, body limits, rate-limit rules.

use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU64};

use serde::Deserialize;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8100";
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
const DEFAULT_MAX_BODY_BYTES: u64 = 2 * 1024 * 1024;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024 + 64 * 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// When set, every `/api/` route requires this key in the API-key header.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// JSON body cap for non-upload routes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
    /// Multipart cap for the upload route; slightly above the file cap so the
    /// engine can reject oversize files with the typed 413 instead of a
    /// framework-level abort.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_key: None,
            api_key_header: default_api_key_header(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_api_key_header() -> String {
    DEFAULT_API_KEY_HEADER.to_string()
}

fn default_max_body_bytes() -> u64 {
    DEFAULT_MAX_BODY_BYTES
}

fn default_max_upload_bytes() -> u64 {
    DEFAULT_MAX_UPLOAD_BYTES
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "RateLimitConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "RateLimitConfig::default_rules")]
    pub rules: Vec<RateRule>,
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl RateLimitConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_rules() -> Vec<RateRule> {
        vec![RateRule::default_rule()]
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            rules: Self::default_rules(),
            trusted_proxies: Vec::new(),
        }
    }
}

/// One token-bucket rule. `route_glob` is either an exact path or a prefix
/// ending in `*`.
#[derive(Debug, Deserialize, Clone)]
pub struct RateRule {
    pub route_glob: String,
    pub capacity: NonZeroU32,
    pub window_secs: NonZeroU64,
    #[serde(default)]
    pub identity: IdentityMode,
}

impl RateRule {
    /// The baseline rule: 100 requests per 60 seconds per source IP.
    pub fn default_rule() -> Self {
        Self {
            route_glob: "/api/*".to_string(),
            capacity: NonZeroU32::new(100).expect("nonzero capacity"),
            window_secs: NonZeroU64::new(60).expect("nonzero window"),
            identity: IdentityMode::Ip,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityMode {
    #[default]
    Ip,
    ApiKey,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_origins: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.api_key_header, DEFAULT_API_KEY_HEADER);
        assert!(cfg.rate_limit.enabled);
        assert_eq!(cfg.rate_limit.rules.len(), 1);
        let rule = &cfg.rate_limit.rules[0];
        assert_eq!(rule.capacity.get(), 100);
        assert_eq!(rule.window_secs.get(), 60);
        assert_eq!(rule.identity, IdentityMode::Ip);
    }

    #[test]
    fn rules_deserialize_from_toml_shapes() {
        let raw = r#"
            {
                "enabled": true,
                "rules": [
                    {"route_glob": "/api/v1/upload", "capacity": 10, "window_secs": 60, "identity": "api-key"}
                ]
            }
        "#;
        let cfg: RateLimitConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.rules[0].identity, IdentityMode::ApiKey);
        assert_eq!(cfg.rules[0].capacity.get(), 10);
    }
}
