//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call from a client or transport binder:
//!     → circuit_breaker.rs (reject fast while Open, count transport failures)
//!     → rate_limit.rs (withdraw a token or reject / wait)
//!     → timeouts.rs (tighten the call deadline)
//!     → endpoint
//!
//! Client side, across instances:
//!     → retries.rs (fresh balancer pick per attempt, backoff.rs between)
//! ```
//!
//! # Design Decisions
//! - Every policy is a same-signature middleware; order is chosen by the caller
//! - Only transport-domain errors count against breaker health
//! - Breakers are keyed per operation so siblings fail independently

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerMiddleware, BreakerRegistry, BreakerSettings, BreakerState, CircuitBreaker, TripPolicy};
pub use rate_limit::{LimitMode, RateLimiter, TokenBucket};
pub use retries::Retry;
pub use timeouts::TimeoutMiddleware;
