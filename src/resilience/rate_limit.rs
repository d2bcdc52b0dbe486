//! Token-bucket admission control.
//!
//! # Responsibilities
//! - Withdraw one token per call, refilled continuously from elapsed time
//! - Erroring mode: reject immediately with [`Error::RateLimited`]
//! - Blocking mode: wait for a token, the call's cancellation or deadline
//!
//! # Design Decisions
//! - Refill is computed lazily on each check; no background timer
//! - Check-and-decrement happens under one lock, so the token count stays
//!   within `[0, capacity]` under concurrent callers
//! - One bucket is shared by every call through one middleware instance

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::endpoint::{Context, Endpoint, Middleware};
use crate::error::{Error, Result};
use crate::observability::metrics;

/// A token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens, refilled at
    /// `refill_per_sec` tokens per second.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Time until one token is available, `None` if the bucket never refills.
    pub fn time_to_next_token(&self) -> Option<Duration> {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_per_sec <= 0.0 || self.capacity < 1.0 {
            return None;
        }
        Some(Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec))
    }

    /// Wait for a token, honouring the context's cancellation and deadline.
    pub async fn acquire(&self, ctx: &Context) -> Result<()> {
        ctx.run(async {
            loop {
                if self.try_acquire() {
                    return Ok(());
                }
                match self.time_to_next_token() {
                    Some(wait) => tokio::time::sleep(wait.max(Duration::from_millis(1))).await,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_update = now;
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What to do when the bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMode {
    /// Fail fast with [`Error::RateLimited`].
    #[default]
    Erroring,
    /// Suspend the caller until a token is available.
    Blocking,
}

/// Middleware admitting calls through a shared [`TokenBucket`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    name: String,
    bucket: Arc<TokenBucket>,
    mode: LimitMode,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, bucket: Arc<TokenBucket>, mode: LimitMode) -> Self {
        Self {
            name: name.into(),
            bucket,
            mode,
        }
    }

    pub fn erroring(name: impl Into<String>, bucket: Arc<TokenBucket>) -> Self {
        Self::new(name, bucket, LimitMode::Erroring)
    }

    pub fn blocking(name: impl Into<String>, bucket: Arc<TokenBucket>) -> Self {
        Self::new(name, bucket, LimitMode::Blocking)
    }

    async fn admit(&self, ctx: &Context) -> Result<()> {
        match self.mode {
            LimitMode::Erroring => {
                if self.bucket.try_acquire() {
                    Ok(())
                } else {
                    tracing::warn!(limiter = %self.name, request_id = %ctx.request_id(), "Rate limit exceeded");
                    metrics::record_rate_limited(&self.name);
                    Err(Error::RateLimited)
                }
            }
            LimitMode::Blocking => self.bucket.acquire(ctx).await,
        }
    }
}

impl<Req, Resp> Middleware<Req, Resp> for RateLimiter
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        let limiter = self.clone();
        Endpoint::new(move |ctx, req| {
            let limiter = limiter.clone();
            let next = next.clone();
            async move {
                limiter.admit(&ctx).await?;
                next.call(ctx, req).await
            }
        })
    }
}
