//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacities, ratios, timeouts)
//! - Detect a middleware order that names a layer twice
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ClientConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use crate::config::schema::{ClientConfig, TripPolicyKind};

/// One rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let rl = &config.rate_limit;
    if rl.enabled && rl.capacity == 0 {
        errors.push(ValidationError::new("rate_limit.capacity", "must be at least 1"));
    }
    if !rl.refill_per_sec.is_finite() || rl.refill_per_sec < 0.0 {
        errors.push(ValidationError::new("rate_limit.refill_per_sec", "must be a non-negative number"));
    }

    let cb = &config.circuit_breaker;
    if cb.enabled {
        match cb.policy {
            TripPolicyKind::Consecutive if cb.failure_threshold == 0 => {
                errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be at least 1"));
            }
            TripPolicyKind::Ratio => {
                if !(cb.failure_ratio > 0.0 && cb.failure_ratio <= 1.0) {
                    errors.push(ValidationError::new("circuit_breaker.failure_ratio", "must be in (0, 1]"));
                }
                if cb.window == 0 {
                    errors.push(ValidationError::new("circuit_breaker.window", "must be at least 1"));
                }
                if cb.min_calls > cb.window {
                    errors.push(ValidationError::new(
                        "circuit_breaker.min_calls",
                        format!("{} exceeds window {}", cb.min_calls, cb.window),
                    ));
                }
            }
            _ => {}
        }
        if cb.open_timeout_ms == 0 {
            errors.push(ValidationError::new("circuit_breaker.open_timeout_ms", "must be positive"));
        }
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        errors.push(ValidationError::new("retry.max_attempts", "must be at least 1"));
    }
    if retry.deadline_ms == 0 {
        errors.push(ValidationError::new("retry.deadline_ms", "must be positive"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        errors.push(ValidationError::new("retry.base_delay_ms", "exceeds max_delay_ms"));
    }

    if config.discovery.invalidate_on_error_ms == Some(0) {
        errors.push(ValidationError::new("discovery.invalidate_on_error_ms", "must be positive when set"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", config.observability.metrics_address),
        ));
    }

    let mut seen = HashSet::new();
    for layer in &config.middleware.order {
        if !seen.insert(layer) {
            errors.push(ValidationError::new("middleware.order", format!("{layer:?} listed twice")));
        }
    }
    if config.middleware.timeout_ms == Some(0) {
        errors.push(ValidationError::new("middleware.timeout_ms", "must be positive when set"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LayerKind;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ClientConfig::default()).is_ok());
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = ClientConfig::default();
        config.rate_limit.capacity = 0;
        config.retry.max_attempts = 0;
        config.middleware.order.push(LayerKind::Logging);

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["rate_limit.capacity", "retry.max_attempts", "middleware.order"]);
    }

    #[test]
    fn test_ratio_bounds() {
        let mut config = ClientConfig::default();
        config.circuit_breaker.policy = TripPolicyKind::Ratio;
        config.circuit_breaker.failure_ratio = 1.5;
        config.circuit_breaker.min_calls = 30;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
