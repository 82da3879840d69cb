//! Route selection: a pure function from (score, preferences, catalog
//! snapshot) to a model choice with an ordered fallback chain.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::RouterPreferences;
use crate::router::catalog::{Catalog, ModelDescriptor, SpeedTier};
use crate::router::score::ComplexityScore;

const MAX_FALLBACKS: usize = 3;

/// Availability snapshot supplied by the dispatcher; the router itself never
/// performs IO. Keys are `(provider_id, model_id)` pairs currently tripped by
/// the circuit breaker.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityView {
    unavailable: HashSet<(String, String)>,
}

impl AvailabilityView {
    pub fn new(unavailable: HashSet<(String, String)>) -> Self {
        Self { unavailable }
    }

    pub fn is_available(&self, model: &ModelDescriptor) -> bool {
        !self
            .unavailable
            .contains(&(model.provider_id.clone(), model.id.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub selected: SelectedModel,
    pub reasons: Vec<String>,
    pub fallbacks: Vec<SelectedModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedModel {
    pub model_id: String,
    pub provider_id: String,
}

impl SelectedModel {
    fn from_descriptor(descriptor: &ModelDescriptor) -> Self {
        Self {
            model_id: descriptor.id.clone(),
            provider_id: descriptor.provider_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    NoModelAvailable,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::NoModelAvailable => f.write_str("no model satisfies the request"),
        }
    }
}

impl std::error::Error for RouteError {}

/// Minimum speed tier implied by the complexity score.
pub fn minimum_tier(score: u8) -> SpeedTier {
    match score {
        0..=30 => SpeedTier::Fast,
        31..=70 => SpeedTier::Balanced,
        _ => SpeedTier::Powerful,
    }
}

fn tier_rank(tier: SpeedTier) -> u8 {
    match tier {
        SpeedTier::Fast => 0,
        SpeedTier::Balanced => 1,
        SpeedTier::Powerful => 2,
    }
}

fn relax(tier: SpeedTier) -> SpeedTier {
    match tier {
        SpeedTier::Powerful => SpeedTier::Balanced,
        _ => SpeedTier::Fast,
    }
}

pub fn route(
    complexity: &ComplexityScore,
    explicit_model: &str,
    preferences: &RouterPreferences,
    catalog: &Catalog,
    availability: &AvailabilityView,
) -> Result<Route, RouteError> {
    let mut reasons = Vec::new();

    // Capability/cost/tier/availability filter over the whole catalog.
    let mut candidates: Vec<&ModelDescriptor> = catalog
        .models()
        .iter()
        .filter(|m| complexity.required.is_subset(&m.capabilities))
        .filter(|m| m.cost_per_1k_input <= preferences.max_cost_per_1k_tokens)
        .filter(|m| preferences.pricing_tier.admits(m.pricing_tier))
        .filter(|m| catalog.provider_has_key(&m.provider_id))
        .filter(|m| availability.is_available(m))
        .collect();

    candidates.sort_by(|a, b| sort_key(a, preferences).partial_cmp(&sort_key(b, preferences))
        .unwrap_or(std::cmp::Ordering::Equal));

    // Explicit model requests short-circuit the tier mapping when the model
    // exists and satisfies the required capabilities.
    let requested = catalog.resolve_alias(explicit_model);
    if requested != "auto" {
        if let Some(model) = catalog.get(requested) {
            let usable = complexity.required.is_subset(&model.capabilities)
                && catalog.provider_has_key(&model.provider_id)
                && availability.is_available(model);
            if usable {
                reasons.push("explicit-model".to_string());
                let fallbacks = candidates
                    .iter()
                    .filter(|m| m.id != model.id)
                    .take(MAX_FALLBACKS)
                    .map(|m| SelectedModel::from_descriptor(m))
                    .collect();
                return Ok(Route {
                    selected: SelectedModel::from_descriptor(model),
                    reasons,
                    fallbacks,
                });
            }
        }
        reasons.push("explicit-model-unusable".to_string());
    }

    // Tier floor from the score, relaxed one step when it empties the pool.
    let floor = minimum_tier(complexity.score);
    let mut tiered: Vec<&ModelDescriptor> = candidates
        .iter()
        .copied()
        .filter(|m| tier_rank(m.speed_tier) >= tier_rank(floor))
        .collect();
    if tiered.is_empty() && !candidates.is_empty() {
        let relaxed = relax(floor);
        reasons.push("tier-relaxed".to_string());
        tiered = candidates
            .iter()
            .copied()
            .filter(|m| tier_rank(m.speed_tier) >= tier_rank(relaxed))
            .collect();
        if tiered.is_empty() {
            tiered = candidates.clone();
        }
    }

    if let Some(first) = tiered.first() {
        reasons.push("auto-selected".to_string());
        let fallbacks = tiered
            .iter()
            .skip(1)
            .take(MAX_FALLBACKS)
            .map(|m| SelectedModel::from_descriptor(m))
            .collect();
        return Ok(Route {
            selected: SelectedModel::from_descriptor(first),
            reasons,
            fallbacks,
        });
    }

    // Nothing matched: the local sentinel, if present, takes the request even
    // when it cannot honor every capability.
    if let Some(local) = catalog.local_fallback() {
        reasons.push("local-fallback".to_string());
        if !complexity.required.is_subset(&local.capabilities) {
            reasons.push("capability-relaxed".to_string());
        }
        return Ok(Route {
            selected: SelectedModel::from_descriptor(local),
            reasons,
            fallbacks: Vec::new(),
        });
    }

    Err(RouteError::NoModelAvailable)
}

/// Ascending sort key: fewest surplus capabilities first (specialist over
/// generalist), then bias-adjusted cost, then speed-tier preference match,
/// then model id for a total order.
fn sort_key(model: &ModelDescriptor, preferences: &RouterPreferences) -> (usize, f64, i8, String) {
    let excess = model.capabilities.len();
    let bias = if preferences.prefer_cheap { 0.5 } else { 1.0 };
    let cost = model.cost_per_1k_input * bias;
    let speed_match = if preferences.prefer_fast && model.speed_tier == SpeedTier::Fast {
        -1
    } else {
        0
    };
    (excess, cost, speed_match, model.id.clone())
}
