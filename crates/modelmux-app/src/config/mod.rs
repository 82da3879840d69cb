//! Configuration loading: layered TOML file plus `MODELMUX_*` environment
//! overrides, with defaults that bring up a working gateway against the
//! built-in catalog.

use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::constants::{
    DEFAULT_CACHE_LOCAL_BYTES, DEFAULT_CACHE_TTL, DEFAULT_EXTRACTION_TEXT_CAP,
    DEFAULT_MAX_FILE_BYTES, DEFAULT_MESSAGE_BYTES_CAP, DEFAULT_RETENTION,
};
use crate::router::catalog::PricingTier;
use crate::upstream::adapter::AdapterKind;

const CONFIG_OVERRIDE_ENV: &str = "MODELMUX_CONFIG_FILE";
const ENV_PREFIX: &str = "MODELMUX";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("invalid provider `{provider}`: {reason}")]
    InvalidProvider { provider: String, reason: String },
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: modelmux_server::ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub router: RouterPreferences,
    /// Provider catalog; empty means the built-in default catalog.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Data root; `$XDG_DATA_HOME/modelmux` when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "StorageConfig::default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "StorageConfig::default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

impl StorageConfig {
    fn default_max_file_bytes() -> u64 {
        DEFAULT_MAX_FILE_BYTES
    }

    fn default_allowed_mime_types() -> Vec<String> {
        [
            "application/pdf",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "application/json",
            "text/plain",
            "text/csv",
            "text/markdown",
            "image/jpeg",
            "image/png",
            "image/gif",
            "image/webp",
            "image/bmp",
            "audio/mpeg",
            "audio/wav",
            "audio/mp4",
            "audio/ogg",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_file_bytes: Self::default_max_file_bytes(),
            allowed_mime_types: Self::default_allowed_mime_types(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "ExtractionConfig::default_text_cap")]
    pub text_cap: usize,
    #[serde(default = "ExtractionConfig::default_retention_secs")]
    pub retention_secs: u64,
    /// Base URL of the external transcription service; audio uploads resolve
    /// to empty `unsupported` extractions when unset.
    #[serde(default)]
    pub transcription_url: Option<Url>,
    #[serde(default = "ExtractionConfig::default_transcription_timeout_secs")]
    pub transcription_timeout_secs: u64,
    /// Wall-clock budget for a single extractor run.
    #[serde(default = "ExtractionConfig::default_extractor_timeout_secs")]
    pub extractor_timeout_secs: u64,
    #[serde(default = "ExtractionConfig::default_message_bytes_cap")]
    pub message_bytes_cap: usize,
}

impl ExtractionConfig {
    fn default_text_cap() -> usize {
        DEFAULT_EXTRACTION_TEXT_CAP
    }

    fn default_retention_secs() -> u64 {
        DEFAULT_RETENTION.as_secs()
    }

    fn default_transcription_timeout_secs() -> u64 {
        30
    }

    fn default_extractor_timeout_secs() -> u64 {
        60
    }

    fn default_message_bytes_cap() -> usize {
        DEFAULT_MESSAGE_BYTES_CAP
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            text_cap: Self::default_text_cap(),
            retention_secs: Self::default_retention_secs(),
            transcription_url: None,
            transcription_timeout_secs: Self::default_transcription_timeout_secs(),
            extractor_timeout_secs: Self::default_extractor_timeout_secs(),
            message_bytes_cap: Self::default_message_bytes_cap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_local_bytes")]
    pub local_bytes: u64,
    #[serde(default = "CacheConfig::default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Remote KV tier (redis); absent means local-only.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "CacheConfig::default_shards")]
    pub shards: usize,
}

impl CacheConfig {
    fn default_local_bytes() -> u64 {
        DEFAULT_CACHE_LOCAL_BYTES
    }

    fn default_ttl_secs() -> u64 {
        DEFAULT_CACHE_TTL.as_secs()
    }

    fn default_shards() -> usize {
        16
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_bytes: Self::default_local_bytes(),
            default_ttl_secs: Self::default_ttl_secs(),
            remote_url: None,
            shards: Self::default_shards(),
        }
    }
}

/// Router preferences recognized by the selection procedure.
#[derive(Debug, Deserialize, Clone)]
pub struct RouterPreferences {
    #[serde(default)]
    pub prefer_fast: bool,
    #[serde(default)]
    pub prefer_cheap: bool,
    #[serde(default = "RouterPreferences::default_max_cost")]
    pub max_cost_per_1k_tokens: f64,
    #[serde(default = "RouterPreferences::default_pricing_tier")]
    pub pricing_tier: TierFilter,
}

impl RouterPreferences {
    fn default_max_cost() -> f64 {
        10.0
    }

    fn default_pricing_tier() -> TierFilter {
        TierFilter::Auto
    }
}

impl Default for RouterPreferences {
    fn default() -> Self {
        Self {
            prefer_fast: false,
            prefer_cheap: false,
            max_cost_per_1k_tokens: Self::default_max_cost(),
            pricing_tier: Self::default_pricing_tier(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TierFilter {
    Auto,
    Standard,
    Enterprise,
    Local,
}

impl TierFilter {
    pub fn admits(self, tier: PricingTier) -> bool {
        match self {
            TierFilter::Auto => true,
            TierFilter::Standard => tier == PricingTier::Standard,
            TierFilter::Enterprise => tier == PricingTier::Enterprise,
            TierFilter::Local => tier == PricingTier::Local,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: Url,
    /// Environment variable holding the provider API key. A provider whose
    /// key variable is unset is marked unavailable rather than dropped.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub adapter: AdapterKind,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelEntry {
    /// Catalog id clients address the model by.
    pub id: String,
    /// Wire id sent upstream when it differs from the catalog id.
    #[serde(default)]
    pub upstream_id: Option<String>,
    pub capabilities: Vec<String>,
    pub context_window: u64,
    pub max_output_tokens: u64,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub speed_tier: String,
    #[serde(default)]
    pub pricing_tier: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObservabilityConfig {
    #[serde(default = "ObservabilityConfig::default_log_format")]
    pub log_format: LogFormat,
    #[serde(default = "ObservabilityConfig::default_log_level")]
    pub log_level: String,
}

impl ObservabilityConfig {
    fn default_log_format() -> LogFormat {
        LogFormat::Text
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: Self::default_log_format(),
            log_level: Self::default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Load configuration: optional TOML file (explicit override path, else the
/// XDG config dir), then environment overrides.
pub fn load() -> Result<AppConfig, AppConfigError> {
    let mut builder = Config::builder();

    if let Ok(path) = std::env::var(CONFIG_OVERRIDE_ENV) {
        builder = builder.add_source(File::new(&path, FileFormat::Toml).required(true));
    } else if let Some(dirs) = ProjectDirs::from("dev", "modelmux", "modelmux") {
        let candidate = dirs.config_dir().join("settings.toml");
        builder = builder.add_source(
            File::from(candidate).format(FileFormat::Toml).required(false),
        );
    }

    let settings = builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?;

    let config: AppConfig = settings.try_deserialize()?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<(), AppConfigError> {
    for provider in &config.providers {
        if provider.models.is_empty() {
            return Err(AppConfigError::InvalidProvider {
                provider: provider.id.clone(),
                reason: "provider declares no models".to_string(),
            });
        }
        for model in &provider.models {
            if model.cost_per_1k_input < 0.0 || model.cost_per_1k_output < 0.0 {
                return Err(AppConfigError::InvalidProvider {
                    provider: provider.id.clone(),
                    reason: format!("model `{}` has negative cost", model.id),
                });
            }
        }
    }
    Ok(())
}
