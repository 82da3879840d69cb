//! Model catalog: static capability and cost descriptors per provider model.
//!
//! Descriptors are immutable for the lifetime of a catalog instance; only the
//! availability view (fed by the circuit breaker) changes between requests.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};

use crate::config::{ModelEntry, ProviderConfig};
use crate::constants::LOCAL_FALLBACK_MODEL;
use crate::upstream::adapter::AdapterKind;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumString,
    AsRefStr, EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Capability {
    Text,
    Vision,
    AudioUnderstanding,
    LongContext,
    FunctionCalling,
}

pub type CapabilitySet = BTreeSet<Capability>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SpeedTier {
    Fast,
    Balanced,
    Powerful,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PricingTier {
    Standard,
    Enterprise,
    Local,
}

/// Static description of one upstream model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    /// Identifier sent on the wire; differs from `id` for aggregators.
    pub upstream_id: String,
    pub provider_id: String,
    pub adapter: AdapterKind,
    pub capabilities: CapabilitySet,
    pub context_window: u64,
    pub max_output_tokens: u64,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub speed_tier: SpeedTier,
    pub pricing_tier: PricingTier,
}

/// Immutable catalog plus the provider key material resolved at build time.
#[derive(Debug, Clone)]
pub struct Catalog {
    models: Vec<ModelDescriptor>,
    /// Providers whose API key environment variable was present (or who need
    /// no key at all, like local runtimes).
    keyed_providers: HashSet<String>,
}

impl Catalog {
    pub fn from_providers(providers: &[ProviderConfig]) -> Self {
        let mut models = Vec::new();
        let mut keyed_providers = HashSet::new();

        for provider in providers {
            let has_key = match &provider.api_key_env {
                Some(var) => std::env::var(var).is_ok(),
                None => true,
            };
            if has_key {
                keyed_providers.insert(provider.id.clone());
            }
            for entry in &provider.models {
                if let Some(descriptor) = descriptor_from_entry(provider, entry) {
                    models.push(descriptor);
                } else {
                    tracing::warn!(
                        provider = %provider.id,
                        model = %entry.id,
                        "skipping model with unparseable capability or tier"
                    );
                }
            }
        }

        // Deterministic order regardless of config file ordering.
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            models,
            keyed_providers,
        }
    }

    /// The built-in catalog used when no providers are configured.
    pub fn builtin() -> Self {
        Self::from_providers(&builtin_providers())
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == model_id)
    }

    pub fn provider_has_key(&self, provider_id: &str) -> bool {
        self.keyed_providers.contains(provider_id)
    }

    /// Smallest context window among fast-tier models; the long-context
    /// capability threshold is derived from it.
    pub fn fast_context_floor(&self) -> u64 {
        self.models
            .iter()
            .filter(|m| m.speed_tier == SpeedTier::Fast)
            .map(|m| m.context_window)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Map legacy client model names onto current catalog ids.
    pub fn resolve_alias<'a>(&self, requested: &'a str) -> &'a str {
        match requested {
            "gpt-4" | "gpt-4-turbo" => "gpt-4o",
            "claude-3-sonnet" => "claude-3.5-sonnet",
            other => other,
        }
    }

    /// Catalog with every provider treated as keyed; lets tests avoid
    /// depending on ambient environment variables.
    pub(crate) fn for_tests(models: Vec<ModelDescriptor>) -> Self {
        let keyed_providers = models.iter().map(|m| m.provider_id.clone()).collect();
        Self {
            models,
            keyed_providers,
        }
    }

    pub fn local_fallback(&self) -> Option<&ModelDescriptor> {
        self.models
            .iter()
            .find(|m| m.pricing_tier == PricingTier::Local)
            .or_else(|| self.get(LOCAL_FALLBACK_MODEL))
    }
}

fn descriptor_from_entry(provider: &ProviderConfig, entry: &ModelEntry) -> Option<ModelDescriptor> {
    let mut capabilities = CapabilitySet::new();
    for raw in &entry.capabilities {
        capabilities.insert(raw.parse().ok()?);
    }
    let speed_tier: SpeedTier = entry.speed_tier.parse().ok()?;
    let pricing_tier = match &entry.pricing_tier {
        Some(raw) => raw.parse().ok()?,
        None => match provider.adapter {
            AdapterKind::Ollama => PricingTier::Local,
            _ => PricingTier::Standard,
        },
    };

    Some(ModelDescriptor {
        id: entry.id.clone(),
        upstream_id: entry.upstream_id.clone().unwrap_or_else(|| entry.id.clone()),
        provider_id: provider.id.clone(),
        adapter: provider.adapter,
        capabilities,
        context_window: entry.context_window,
        max_output_tokens: entry.max_output_tokens,
        cost_per_1k_input: entry.cost_per_1k_input,
        cost_per_1k_output: entry.cost_per_1k_output,
        speed_tier,
        pricing_tier,
    })
}

/// Provider set backing [`Catalog::builtin`]; also used to build the
/// dispatcher and health prober when no providers are configured.
pub fn builtin_providers() -> Vec<ProviderConfig> {
    let openrouter = |id: &str, upstream: &str, caps: &[&str], window: u64, max_out: u64,
                      cost_in: f64, cost_out: f64, speed: &str| ModelEntry {
        id: id.to_string(),
        upstream_id: Some(upstream.to_string()),
        capabilities: caps.iter().map(|c| c.to_string()).collect(),
        context_window: window,
        max_output_tokens: max_out,
        cost_per_1k_input: cost_in,
        cost_per_1k_output: cost_out,
        speed_tier: speed.to_string(),
        pricing_tier: Some("standard".to_string()),
    };

    vec![
        ProviderConfig {
            id: "openrouter".to_string(),
            base_url: "https://openrouter.ai/api/v1"
                .parse()
                .expect("static url parses"),
            api_key_env: Some("OPENROUTER_API_KEY".to_string()),
            adapter: AdapterKind::Openrouter,
            models: vec![
                openrouter(
                    "gpt-4o",
                    "openai/gpt-4o",
                    &["text", "vision", "function-calling", "long-context"],
                    128_000,
                    4_096,
                    5.0,
                    15.0,
                    "powerful",
                ),
                openrouter(
                    "gpt-4o-mini",
                    "openai/gpt-4o-mini",
                    &["text", "vision", "function-calling", "long-context"],
                    128_000,
                    16_384,
                    0.15,
                    0.6,
                    "balanced",
                ),
                openrouter(
                    "gpt-3.5-turbo",
                    "openai/gpt-3.5-turbo",
                    &["text", "function-calling"],
                    16_385,
                    4_096,
                    0.5,
                    1.5,
                    "fast",
                ),
                openrouter(
                    "claude-3.5-sonnet",
                    "anthropic/claude-3.5-sonnet",
                    &["text", "vision", "function-calling", "long-context"],
                    200_000,
                    8_192,
                    3.0,
                    15.0,
                    "powerful",
                ),
                openrouter(
                    "claude-3-haiku",
                    "anthropic/claude-3-haiku",
                    &["text", "vision"],
                    200_000,
                    4_096,
                    0.25,
                    1.25,
                    "fast",
                ),
                openrouter(
                    "llama-3.1-70b",
                    "meta-llama/llama-3.1-70b-instruct",
                    &["text", "function-calling"],
                    32_768,
                    4_096,
                    0.59,
                    0.79,
                    "balanced",
                ),
                openrouter(
                    "llama-3.1-8b",
                    "meta-llama/llama-3.1-8b-instruct",
                    &["text", "function-calling"],
                    32_768,
                    4_096,
                    0.055,
                    0.055,
                    "fast",
                ),
            ],
        },
        ProviderConfig {
            id: "ollama".to_string(),
            base_url: "http://localhost:11434".parse().expect("static url parses"),
            api_key_env: None,
            adapter: AdapterKind::Ollama,
            models: vec![ModelEntry {
                id: LOCAL_FALLBACK_MODEL.to_string(),
                upstream_id: Some("llama3.2:1b".to_string()),
                capabilities: vec!["text".to_string()],
                context_window: 2_048,
                max_output_tokens: 2_048,
                cost_per_1k_input: 0.0,
                cost_per_1k_output: 0.0,
                speed_tier: "fast".to_string(),
                pricing_tier: Some("local".to_string()),
            }],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_contains_local_sentinel() {
        let catalog = Catalog::builtin();
        let local = catalog.local_fallback().expect("local model exists");
        assert_eq!(local.id, LOCAL_FALLBACK_MODEL);
        assert_eq!(local.pricing_tier, PricingTier::Local);
        assert_eq!(local.cost_per_1k_input, 0.0);
    }

    #[test]
    fn builtin_catalog_is_sorted_and_deduplicated() {
        let catalog = Catalog::builtin();
        let ids: Vec<&str> = catalog.models().iter().map(|m| m.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn fast_floor_is_smallest_fast_window() {
        let catalog = Catalog::builtin();
        // llama3.2-local has the smallest fast-tier window in the builtin set.
        assert_eq!(catalog.fast_context_floor(), 2_048);
    }

    #[test]
    fn legacy_aliases_resolve() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.resolve_alias("gpt-4"), "gpt-4o");
        assert_eq!(catalog.resolve_alias("claude-3-sonnet"), "claude-3.5-sonnet");
        assert_eq!(catalog.resolve_alias("gpt-4o-mini"), "gpt-4o-mini");
    }

    #[test]
    fn capability_names_round_trip() {
        for cap in [
            Capability::Text,
            Capability::Vision,
            Capability::AudioUnderstanding,
            Capability::LongContext,
            Capability::FunctionCalling,
        ] {
            let name = cap.as_ref().to_string();
            let parsed: Capability = name.parse().unwrap();
            assert_eq!(parsed, cap);
        }
        assert_eq!(Capability::AudioUnderstanding.as_ref(), "audio-understanding");
    }
}
