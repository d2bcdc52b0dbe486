//! Error taxonomy for endpoint calls.
//!
//! # Responsibilities
//! - Carry every failure an endpoint call can produce in one type
//! - Tag each failure with an [`ErrorKind`] so middlewares and binders can
//!   branch on the cause without inspecting error text
//!
//! # Design Decisions
//! - Business failures never appear here; they travel inside
//!   [`Reply::Failed`](crate::endpoint::Reply) on the success path
//! - Caller cancellation and callee slowness are separate variants
//! - Errors are `Clone` so retry can hold on to the last one

use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of an endpoint call at the transport layer or in a middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Network or remote failure while talking to a dependency.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not complete before its deadline.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The caller cancelled the call.
    #[error("call cancelled by caller")]
    Cancelled,

    /// Admission denied by a rate limiter.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Short-circuited by an open circuit breaker.
    #[error("circuit breaker '{0}' is open")]
    BreakerOpen(String),

    /// The discovery pool is empty.
    #[error("no endpoints available")]
    NoEndpoints,

    /// Malformed wire input.
    #[error("decode error: {0}")]
    Decode(String),

    /// A value could not be written to the wire.
    #[error("encode error: {0}")]
    Encode(String),

    /// The registry could not be queried.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// An endpoint could not be built for an instance.
    #[error("endpoint factory failed for '{instance}': {reason}")]
    Factory { instance: String, reason: String },
}

/// Cause tag of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    DeadlineExceeded,
    Cancelled,
    RateLimited,
    BreakerOpen,
    NoEndpoints,
    Decode,
    Encode,
    Discovery,
    Factory,
}

impl Error {
    /// Build a transport error from anything displayable.
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Error::Transport(e.to_string())
    }

    /// Build a decode error from anything displayable.
    pub fn decode(e: impl std::fmt::Display) -> Self {
        Error::Decode(e.to_string())
    }

    /// Build an encode error from anything displayable.
    pub fn encode(e: impl std::fmt::Display) -> Self {
        Error::Encode(e.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::RateLimited => ErrorKind::RateLimited,
            Error::BreakerOpen(_) => ErrorKind::BreakerOpen,
            Error::NoEndpoints => ErrorKind::NoEndpoints,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Encode(_) => ErrorKind::Encode,
            Error::Discovery(_) => ErrorKind::Discovery,
            Error::Factory { .. } => ErrorKind::Factory,
        }
    }
}

impl ErrorKind {
    /// Whether a circuit breaker charges this outcome against its dependency.
    ///
    /// Rate limiting is excluded here; breakers opt into counting it.
    pub fn counts_as_failure(self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::DeadlineExceeded)
    }

    /// Whether the balancer retry may start another attempt after this error.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transport
                | ErrorKind::DeadlineExceeded
                | ErrorKind::BreakerOpen
                | ErrorKind::RateLimited
        )
    }

    /// User-visible status for this cause. Every rejection kind maps to its
    /// own status so throttling, breaker rejections and timeouts stay
    /// distinguishable to callers.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Decode => 400,
            ErrorKind::RateLimited => 429,
            ErrorKind::Cancelled => 499,
            ErrorKind::Encode | ErrorKind::Factory | ErrorKind::Discovery => 500,
            ErrorKind::Transport => 502,
            ErrorKind::BreakerOpen | ErrorKind::NoEndpoints => 503,
            ErrorKind::DeadlineExceeded => 504,
        }
    }

    /// Short label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::BreakerOpen => "breaker_open",
            ErrorKind::NoEndpoints => "no_endpoints",
            ErrorKind::Decode => "decode",
            ErrorKind::Encode => "encode",
            ErrorKind::Discovery => "discovery",
            ErrorKind::Factory => "factory",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
