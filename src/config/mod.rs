//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ClientConfig (validated, immutable)
//!     → stack.rs builds middlewares, retry and discovery from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a rebuild of the stack
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CircuitBreakerConfig, ClientConfig, DiscoveryConfig, LayerKind, LogFormat, MiddlewareConfig,
    ObservabilityConfig, RateLimitConfig, RetryConfig, TripPolicyKind,
};
pub use validation::{validate_config, ValidationError};
