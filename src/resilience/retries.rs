//! Retry-with-balancer.
//!
//! # Responsibilities
//! - Pick a fresh endpoint from the balancer for every attempt
//! - Retry retryable errors until the attempt budget or deadline runs out
//! - Optionally sleep a jittered exponential backoff between attempts
//!
//! # Design Decisions
//! - The deadline bounds all attempts together; an attempt already in
//!   flight is allowed to finish, but none starts after the deadline
//! - Balancer errors (an empty pool) end the call immediately
//! - Exhaustion returns the last observed error, never a list

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::endpoint::{Context, Endpoint};
use crate::error::{Error, Result};
use crate::load_balancer::Balancer;
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;

type RetryCallback = dyn Fn(u32, &Error) -> bool + Send + Sync;

/// Retries calls across a balanced endpoint pool.
pub struct Retry<Req, Resp> {
    name: String,
    balancer: Balancer<Req, Resp>,
    max_attempts: u32,
    deadline: Duration,
    backoff: Option<(Duration, Duration)>,
    callback: Option<Arc<RetryCallback>>,
}

impl<Req, Resp> Clone for Retry<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            balancer: self.balancer.clone(),
            max_attempts: self.max_attempts,
            deadline: self.deadline,
            backoff: self.backoff,
            callback: self.callback.clone(),
        }
    }
}

impl<Req, Resp> Retry<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    /// `max_attempts` counts the first try; values below one are raised to one.
    pub fn new(
        name: impl Into<String>,
        balancer: Balancer<Req, Resp>,
        max_attempts: u32,
        deadline: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            balancer,
            max_attempts: max_attempts.max(1),
            deadline,
            backoff: None,
            callback: None,
        }
    }

    /// Sleep `calculate_backoff(attempt, base, max)` between attempts.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Some((base, max));
        self
    }

    /// Consulted after every failed attempt with the 1-based attempt number;
    /// returning `false` stops retrying.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &Error) -> bool + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run one logical call.
    pub async fn call(&self, ctx: Context, req: Req) -> Result<Resp> {
        // A deadline too far out to represent is no deadline.
        let stop_at = Instant::now().checked_add(self.deadline);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let endpoint = self.balancer.endpoint()?;

            let err = match endpoint.call(ctx.clone(), req.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };

            if !self.should_retry(attempt, &err, stop_at) {
                tracing::debug!(
                    retry = %self.name,
                    attempt,
                    error = %err,
                    "Giving up"
                );
                return Err(err);
            }

            metrics::record_retry(&self.name, err.kind());
            tracing::debug!(
                retry = %self.name,
                attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "Retrying call"
            );

            if let Some((base, max)) = self.backoff {
                let delay = calculate_backoff(attempt, base, max);
                let wake = match (Instant::now().checked_add(delay), stop_at) {
                    (Some(wake), Some(stop)) => Some(wake.min(stop)),
                    (wake, stop) => wake.or(stop),
                };
                let sleep = async {
                    match wake {
                        Some(wake) => tokio::time::sleep_until(wake).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = ctx.cancelled() => return Err(Error::Cancelled),
                    _ = sleep => {}
                }
                if stop_at.is_some_and(|stop| Instant::now() >= stop) {
                    return Err(err);
                }
            }
        }
    }

    fn should_retry(&self, attempt: u32, err: &Error, stop_at: Option<Instant>) -> bool {
        if attempt >= self.max_attempts || !err.kind().is_retryable() {
            return false;
        }
        if stop_at.is_some_and(|stop| Instant::now() >= stop) {
            return false;
        }
        match &self.callback {
            Some(cb) => cb(attempt, err),
            None => true,
        }
    }

    /// Expose the retrying call as an endpoint.
    pub fn into_endpoint(self) -> Endpoint<Req, Resp> {
        let retry = Arc::new(self);
        Endpoint::new(move |ctx, req| {
            let retry = retry.clone();
            async move { retry.call(ctx, req).await }
        })
    }
}

impl<Req, Resp> std::fmt::Debug for Retry<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
