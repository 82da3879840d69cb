//! Complexity scoring and model routing.
//!
//! Everything in this module is pure: the dispatcher owns availability
//! tracking and feeds the router an immutable snapshot.

pub mod catalog;
pub mod route;
pub mod score;

pub use catalog::{Capability, CapabilitySet, Catalog, ModelDescriptor, PricingTier, SpeedTier};
pub use route::{AvailabilityView, Route, RouteError, SelectedModel, minimum_tier, route};
pub use score::{ComplexityScore, FileSignal, ScoreInput, ScoredMessage, score};
