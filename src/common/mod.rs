//! Resilience helpers shared by exchange gateways
//!
//! - Circuit breaker that stops hammering a failing exchange
//! - Token-bucket rate limiter

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::RateLimiter;
