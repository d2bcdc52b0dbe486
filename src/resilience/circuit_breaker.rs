//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: testing if the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: trip policy exceeded (consecutive failures or failure ratio)
//! Open → Half-Open: after open timeout
//! Half-Open → Closed: probe call succeeds
//! Half-Open → Open: probe call fails
//! ```
//!
//! # Design Decisions
//! - Per-operation circuit breaker (not global), see [`BreakerRegistry`]
//! - Fail fast in Open state (no call to the wrapped endpoint)
//! - Single probe in Half-Open (prevents hammering a recovering dependency)
//! - Only transport-domain errors count; business failures, caller
//!   cancellation and malformed input never do
//! - Outcomes from calls admitted before a transition are discarded

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::endpoint::{Endpoint, Middleware};
use crate::error::{Error, ErrorKind, Result};
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// When a closed breaker trips open.
#[derive(Debug, Clone, PartialEq)]
pub enum TripPolicy {
    /// Trip on the `threshold`-th consecutive failure.
    Consecutive { threshold: u32 },
    /// Trip when at least `min_calls` outcomes are tracked in the last
    /// `window` calls and the failure ratio reaches `ratio`.
    Ratio {
        ratio: f64,
        window: usize,
        min_calls: usize,
    },
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub policy: TripPolicy,
    /// Time spent Open before a probe is allowed.
    pub open_timeout: Duration,
    /// Count rate-limit rejections from inner layers as failures.
    pub trip_on_rate_limit: bool,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            policy: TripPolicy::Consecutive { threshold: 5 },
            open_timeout: Duration::from_secs(60),
            trip_on_rate_limit: false,
        }
    }
}

/// How a finished call is charged to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Neither success nor failure (cancelled, malformed input, ...).
    Ignored,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    /// Recent outcomes, `true` = failure. Only used by the ratio policy.
    window: VecDeque<bool>,
    transitioned_at: Instant,
    probe_in_flight: bool,
    generation: u64,
}

/// A single breaker guarding one logical operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window: VecDeque::new(),
                transitioned_at: Instant::now(),
                probe_in_flight: false,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Current state, applying a pending Open → Half-Open timeout.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.expire_open(&mut inner, Instant::now());
        inner.state
    }

    /// Ask to let one call through.
    pub fn admit(self: &Arc<Self>) -> Result<Admission> {
        let mut inner = self.lock();
        self.expire_open(&mut inner, Instant::now());

        let probe = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => return Err(Error::BreakerOpen(self.name.clone())),
            BreakerState::HalfOpen if inner.probe_in_flight => {
                return Err(Error::BreakerOpen(self.name.clone()))
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                true
            }
        };

        Ok(Admission {
            breaker: self.clone(),
            generation: inner.generation,
            probe,
            finished: false,
        })
    }

    /// Decide how a call result is charged.
    pub fn classify<T>(&self, result: &Result<T>) -> Outcome {
        match result {
            Ok(_) => Outcome::Success,
            Err(e) => {
                let kind = e.kind();
                if kind.counts_as_failure()
                    || (self.settings.trip_on_rate_limit && kind == ErrorKind::RateLimited)
                {
                    Outcome::Failure
                } else {
                    Outcome::Ignored
                }
            }
        }
    }

    fn record(&self, generation: u64, probe: bool, outcome: Outcome) {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        match inner.state {
            BreakerState::Closed => match outcome {
                Outcome::Success => {
                    inner.consecutive_failures = 0;
                    self.push_outcome(&mut inner, false);
                }
                Outcome::Failure => {
                    inner.consecutive_failures += 1;
                    self.push_outcome(&mut inner, true);
                    if self.should_trip(&inner) {
                        self.transition(&mut inner, BreakerState::Open, now);
                    }
                }
                Outcome::Ignored => {}
            },
            BreakerState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                match outcome {
                    Outcome::Success => self.transition(&mut inner, BreakerState::Closed, now),
                    Outcome::Failure => self.transition(&mut inner, BreakerState::Open, now),
                    Outcome::Ignored => {}
                }
            }
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    fn expire_open(&self, inner: &mut Inner, now: Instant) {
        if inner.state == BreakerState::Open
            && now.saturating_duration_since(inner.transitioned_at) >= self.settings.open_timeout
        {
            self.transition(inner, BreakerState::HalfOpen, now);
        }
    }

    fn push_outcome(&self, inner: &mut Inner, failed: bool) {
        if let TripPolicy::Ratio { window, .. } = self.settings.policy {
            inner.window.push_back(failed);
            while inner.window.len() > window.max(1) {
                inner.window.pop_front();
            }
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        match self.settings.policy {
            TripPolicy::Consecutive { threshold } => inner.consecutive_failures >= threshold.max(1),
            TripPolicy::Ratio { ratio, min_calls, .. } => {
                let total = inner.window.len();
                if total == 0 || total < min_calls {
                    return false;
                }
                let failures = inner.window.iter().filter(|f| **f).count();
                failures as f64 / total as f64 >= ratio
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.transitioned_at = now;
        inner.generation += 1;
        inner.probe_in_flight = false;
        inner.consecutive_failures = 0;
        inner.window.clear();

        match to {
            BreakerState::Open => tracing::warn!(
                breaker = %self.name,
                from = from.as_str(),
                open_timeout = ?self.settings.open_timeout,
                "Circuit breaker opened"
            ),
            _ => tracing::info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state change"
            ),
        }
        metrics::record_breaker_state(&self.name, to);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Permission for one call. Dropping it without [`Admission::finish`]
/// (e.g. the call future was dropped) releases a half-open probe slot
/// without charging anything.
#[derive(Debug)]
pub struct Admission {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    finished: bool,
}

impl Admission {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn finish(mut self, outcome: Outcome) {
        self.finished = true;
        self.breaker.record(self.generation, self.probe, outcome);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.record(self.generation, self.probe, Outcome::Ignored);
        }
    }
}

/// Middleware guarding an endpoint with a breaker.
#[derive(Debug, Clone)]
pub struct BreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
}

impl BreakerMiddleware {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl<Req, Resp> Middleware<Req, Resp> for BreakerMiddleware
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        let breaker = self.breaker.clone();
        Endpoint::new(move |ctx, req| {
            let breaker = breaker.clone();
            let next = next.clone();
            async move {
                let admission = breaker.admit()?;
                let res = next.call(ctx, req).await;
                admission.finish(breaker.classify(&res));
                res
            }
        })
    }
}

/// One breaker per logical operation name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// The breaker for `operation`, created on first use.
    pub fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, self.settings.clone())))
            .clone()
    }

    pub fn middleware(&self, operation: &str) -> BreakerMiddleware {
        BreakerMiddleware::new(self.get(operation))
    }

    /// Forget the breaker for an operation that no longer exists.
    pub fn remove(&self, operation: &str) {
        self.breakers.remove(operation);
    }

    /// Snapshot of every breaker's state.
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{BusinessError, Context, Reply};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn settings(threshold: u32, timeout_secs: u64) -> BreakerSettings {
        BreakerSettings {
            policy: TripPolicy::Consecutive { threshold },
            open_timeout: Duration::from_secs(timeout_secs),
            trip_on_rate_limit: false,
        }
    }

    /// Endpoint that fails while `failing` is set and counts invocations.
    fn flaky(failing: Arc<AtomicBool>, calls: Arc<AtomicU32>) -> Endpoint<(), ()> {
        Endpoint::new(move |_ctx, _req| {
            let failing = failing.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if failing.load(Ordering::SeqCst) {
                    Err(Error::transport("connection refused"))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_on_threshold_and_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::new("sum", settings(3, 30)));
        let failing = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicU32::new(0));
        let ep = BreakerMiddleware::new(breaker.clone()).wrap(flaky(failing, calls.clone()));

        for i in 1..=3 {
            let err = ep.call(Context::background(), ()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Transport);
            let expected = if i < 3 { BreakerState::Closed } else { BreakerState::Open };
            assert_eq!(breaker.state(), expected, "after failure {i}");
        }

        let err = ep.call(Context::background(), ()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BreakerOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "open breaker must not call through");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_probe_then_closes() {
        let breaker = Arc::new(CircuitBreaker::new("concat", settings(1, 10)));
        let failing = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicU32::new(0));
        let ep = BreakerMiddleware::new(breaker.clone()).wrap(flaky(failing.clone(), calls.clone()));

        ep.call(Context::background(), ()).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Hold the probe in flight and check a second caller is rejected.
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let slow = BreakerMiddleware::new(breaker.clone()).wrap(Endpoint::new(move |_ctx, _req: ()| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(())
            }
        }));
        let probe = tokio::spawn({
            let slow = slow.clone();
            async move { slow.call(Context::background(), ()).await }
        });
        tokio::task::yield_now().await;

        let err = ep.call(Context::background(), ()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BreakerOpen);

        release.notify_one();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);

        failing.store(false, Ordering::SeqCst);
        ep.call(Context::background(), ()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_restarts_timer() {
        let breaker = Arc::new(CircuitBreaker::new("fetch-routes", settings(1, 10)));
        let failing = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicU32::new(0));
        let ep = BreakerMiddleware::new(breaker.clone()).wrap(flaky(failing, calls.clone()));

        ep.call(Context::background(), ()).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;

        let err = ep.call(Context::background(), ()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport, "probe reaches the endpoint");
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), BreakerState::Open, "timer restarted on failed probe");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_business_failures_and_cancellation_do_not_trip() {
        let breaker = Arc::new(CircuitBreaker::new("uppercase", settings(1, 10)));
        let business: Endpoint<(), Reply<()>> = BreakerMiddleware::new(breaker.clone()).wrap(
            Endpoint::business(|_ctx, _req| async { Err(BusinessError::new("empty", "empty string")) }),
        );
        for _ in 0..5 {
            let reply = business.call(Context::background(), ()).await.unwrap();
            assert!(!reply.is_ok());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        let cancelled: Endpoint<(), ()> = BreakerMiddleware::new(breaker.clone())
            .wrap(Endpoint::new(|_ctx, _req| async { Err(Error::Cancelled) }));
        cancelled.call(Context::background(), ()).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_remote_call_does_not_trip() {
        use crate::transport::{Client, RoundTrip};
        use futures_util::future::BoxFuture;
        use futures_util::FutureExt;

        struct Stalled;
        impl RoundTrip<String, String> for Stalled {
            fn round_trip(&self, _ctx: &Context, _wire: String) -> BoxFuture<'static, Result<String>> {
                std::future::pending().boxed()
            }
        }

        let breaker = Arc::new(CircuitBreaker::new("concat", settings(1, 10)));
        let transport: Arc<dyn RoundTrip<String, String>> = Arc::new(Stalled);
        let client: Client<String, String, String, String> =
            Client::new(transport, |_ctx, s: String| Ok(s), |_ctx, wire: String| Ok(wire));
        let ep = BreakerMiddleware::new(breaker.clone()).wrap(client.endpoint());

        let ctx = Context::background();
        let canceller = ctx.clone();
        let pending = tokio::spawn(async move { ep.call(ctx, "ab".to_string()).await });
        tokio::task::yield_now().await;
        canceller.cancel();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let breaker = Arc::new(CircuitBreaker::new("count", settings(1, 1)));
        breaker.admit().unwrap().finish(Outcome::Failure);
        tokio::time::advance(Duration::from_secs(1)).await;

        let probe = breaker.admit().unwrap();
        assert!(probe.is_probe());
        assert!(breaker.admit().is_err());
        drop(probe);

        let again = breaker.admit().unwrap();
        assert!(again.is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_policy() {
        let breaker = Arc::new(CircuitBreaker::new(
            "profile",
            BreakerSettings {
                policy: TripPolicy::Ratio { ratio: 0.5, window: 4, min_calls: 4 },
                ..BreakerSettings::default()
            },
        ));
        breaker.admit().unwrap().finish(Outcome::Failure);
        breaker.admit().unwrap().finish(Outcome::Success);
        breaker.admit().unwrap().finish(Outcome::Failure);
        assert_eq!(breaker.state(), BreakerState::Closed, "below min_calls");
        breaker.admit().unwrap().finish(Outcome::Success);
        assert_eq!(breaker.state(), BreakerState::Closed, "success does not trip");
        breaker.admit().unwrap().finish(Outcome::Failure);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_registry_isolates_operations() {
        let registry = BreakerRegistry::new(settings(1, 60));
        registry.get("sum").admit().unwrap().finish(Outcome::Failure);

        assert_eq!(registry.get("sum").state(), BreakerState::Open);
        assert_eq!(registry.get("concat").state(), BreakerState::Closed);
        assert!(Arc::ptr_eq(&registry.get("sum"), &registry.get("sum")));
        assert_eq!(registry.states().len(), 2);
    }

    #[test]
    fn test_rate_limit_counting_is_opt_in() {
        let lenient = CircuitBreaker::new("a", BreakerSettings::default());
        let strict = CircuitBreaker::new(
            "b",
            BreakerSettings {
                trip_on_rate_limit: true,
                ..BreakerSettings::default()
            },
        );
        let limited: Result<()> = Err(Error::RateLimited);
        assert_eq!(lenient.classify(&limited), Outcome::Ignored);
        assert_eq!(strict.classify(&limited), Outcome::Failure);
    }
}
