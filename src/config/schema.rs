//! Configuration schema definitions.
//!
//! This module defines the configuration structure for a client or server
//! endpoint stack. All types derive Serde traits for deserialization from
//! config files, and every section falls back to defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::circuit_breaker::{BreakerSettings, TripPolicy};
use crate::resilience::rate_limit::LimitMode;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Token bucket admission control.
    pub rate_limit: RateLimitConfig,

    /// Per-operation circuit breakers.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry budget for balanced client calls.
    pub retry: RetryConfig,

    /// Service discovery query.
    pub discovery: DiscoveryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Middleware stacking order.
    pub middleware: MiddlewareConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Maximum burst size.
    pub capacity: u32,

    /// Tokens added per second.
    pub refill_per_sec: f64,

    /// Reject immediately or wait for a token.
    pub mode: LimitMode,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100,
            refill_per_sec: 100.0,
            mode: LimitMode::Erroring,
        }
    }
}

/// How the breaker decides to trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TripPolicyKind {
    #[default]
    Consecutive,
    Ratio,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    pub policy: TripPolicyKind,

    /// Consecutive failures that trip the breaker (`consecutive` policy).
    pub failure_threshold: u32,

    /// Failure fraction within the window that trips it (`ratio` policy).
    pub failure_ratio: f64,

    /// Number of recent calls tracked (`ratio` policy).
    pub window: usize,

    /// Calls required in the window before the ratio is considered.
    pub min_calls: usize,

    /// Time spent Open before a probe is admitted.
    pub open_timeout_ms: u64,

    /// Count rate-limit rejections as failures.
    pub trip_on_rate_limit: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: TripPolicyKind::Consecutive,
            failure_threshold: 5,
            failure_ratio: 0.5,
            window: 20,
            min_calls: 10,
            open_timeout_ms: 60_000,
            trip_on_rate_limit: false,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn settings(&self) -> BreakerSettings {
        let policy = match self.policy {
            TripPolicyKind::Consecutive => TripPolicy::Consecutive {
                threshold: self.failure_threshold,
            },
            TripPolicyKind::Ratio => TripPolicy::Ratio {
                ratio: self.failure_ratio,
                window: self.window,
                min_calls: self.min_calls,
            },
        };
        BreakerSettings {
            policy,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            trip_on_rate_limit: self.trip_on_rate_limit,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per logical call, including the first.
    pub max_attempts: u32,

    /// Wall-clock budget across all attempts.
    pub deadline_ms: u64,

    /// Base delay between attempts; 0 disables backoff.
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            deadline_ms: 500,
            base_delay_ms: 0,
            max_delay_ms: 2000,
        }
    }
}

impl RetryConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn backoff(&self) -> Option<(Duration, Duration)> {
        (self.base_delay_ms > 0).then(|| {
            (
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
        })
    }
}

/// Service discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Logical service name in the registry.
    pub service: String,

    /// Every tag listed must be present on an instance.
    pub tags: Vec<String>,

    /// Only instances whose health check passes.
    pub passing_only: bool,

    /// Drop cached endpoints after the registry has failed this long.
    pub invalidate_on_error_ms: Option<u64>,
}

impl DiscoveryConfig {
    pub fn invalidate_on_error(&self) -> Option<Duration> {
        self.invalidate_on_error_ms.map(Duration::from_millis)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// One layer of a built middleware stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Tracing,
    Logging,
    Metrics,
    CircuitBreaker,
    RateLimit,
}

/// Middleware ordering, outermost first.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub order: Vec<LayerKind>,

    /// Optional per-call timeout applied innermost.
    pub timeout_ms: Option<u64>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            order: vec![
                LayerKind::Tracing,
                LayerKind::Logging,
                LayerKind::Metrics,
                LayerKind::CircuitBreaker,
                LayerKind::RateLimit,
            ],
            timeout_ms: None,
        }
    }
}
