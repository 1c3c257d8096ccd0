//! Policy Rate Limit
//!
//! Distributed, policy-based rate limiting for API gateways. Each policy
//! combines a token bucket for bursts with a time quota charged by how long
//! requests take, keyed by attributes of the request. All counters live in a
//! shared store (Redis in production) so every gateway instance sees the
//! same limits.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod key;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod rate;
pub mod redis;
pub mod request;
pub mod server;
pub mod store;
pub mod utils;

// Re-export main types
pub use aggregator::RateAggregator;
pub use config::Settings;
pub use error::{ErrorHandler, RateLimitError, Result};
pub use key::KeyBuilder;
pub use limiter::Limiter;
pub use policy::{MatchRule, MatchType, Policy, PolicyStore};
pub use rate::{Decision, Rate};
pub use request::{Request, Route, RouteTable};
pub use store::{InMemoryStore, RateLimitStore};
