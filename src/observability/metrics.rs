//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define endpoint metrics (calls, latency, throttling, breaker state)
//! - Expose a Prometheus-compatible scrape endpoint
//! - Record every call passing an [`InstrumentingMiddleware`]
//!
//! # Metrics
//! - `endpoint_calls_total` (counter): calls by method, outcome
//! - `endpoint_call_duration_seconds` (histogram): latency distribution
//! - `endpoint_rate_limited_total` (counter): rejected admissions by limiter
//! - `endpoint_breaker_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `endpoint_retries_total` (counter): retried attempts by error kind
//! - `discovery_instances` (gauge): live instances per service
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Outcome label is `ok` or the error kind, never error text

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::Instant;

use crate::endpoint::{Endpoint, Middleware};
use crate::error::ErrorKind;
use crate::resilience::circuit_breaker::BreakerState;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => tracing::info!(%addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(%addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record one completed call.
pub fn record_call(method: &str, outcome: &str, duration: Duration) {
    metrics::counter!(
        "endpoint_calls_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!("endpoint_call_duration_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_rate_limited(limiter: &str) {
    metrics::counter!("endpoint_rate_limited_total", "limiter" => limiter.to_string()).increment(1);
}

pub fn record_breaker_state(breaker: &str, state: BreakerState) {
    let value = match state {
        BreakerState::Closed => 0.0,
        BreakerState::HalfOpen => 1.0,
        BreakerState::Open => 2.0,
    };
    metrics::gauge!("endpoint_breaker_state", "breaker" => breaker.to_string()).set(value);
}

pub fn record_retry(name: &str, kind: ErrorKind) {
    metrics::counter!(
        "endpoint_retries_total",
        "retry" => name.to_string(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

pub fn record_instances(service: &str, count: usize) {
    metrics::gauge!("discovery_instances", "service" => service.to_string()).set(count as f64);
}

/// Records call count and latency for one method.
#[derive(Debug, Clone)]
pub struct InstrumentingMiddleware {
    method: String,
}

impl InstrumentingMiddleware {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into() }
    }
}

impl<Req, Resp> Middleware<Req, Resp> for InstrumentingMiddleware
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        let method = self.method.clone();
        Endpoint::new(move |ctx, req| {
            let next = next.clone();
            let method = method.clone();
            async move {
                let start = Instant::now();
                let res = next.call(ctx, req).await;
                let outcome = match &res {
                    Ok(_) => "ok",
                    Err(e) => e.kind().as_str(),
                };
                record_call(&method, outcome, start.elapsed());
                res
            }
        })
    }
}
