//! HTTP surface of the modelmux gateway.
//!
//! This crate owns the wire contract (OpenAI-compatible DTOs), the axum
//! router with its middleware stack, and the [`gateway::GatewayService`]
//! trait the engine implements. It performs no routing, extraction or
//! upstream I/O of its own.

pub mod config;
pub mod gateway;
pub mod limit;
pub mod server;
pub mod wire;

pub use config::{IdentityMode, RateLimitConfig, RateRule, ServerConfig};
pub use gateway::{
    ByteStream, ChunkStream, GatewayError, GatewayErrorKind, GatewayService, Identity,
    RequestScope, Upload,
};
pub use limit::{RateDecision, RateLimitState, route_glob_matches};
pub use server::{ServerError, build_router, serve};
