//! Per-call tracing spans.
//!
//! # Responsibilities
//! - Open a span for every endpoint call
//! - Carry the request id so log lines from inner layers correlate
//!
//! # Design Decisions
//! - The span instruments the whole inner future, including retries and
//!   breaker rejections placed inside it

use tracing::Instrument;

use crate::endpoint::{Endpoint, Middleware};

/// Wraps each call in an `endpoint` span.
#[derive(Debug, Clone)]
pub struct TracingMiddleware {
    method: String,
}

impl TracingMiddleware {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into() }
    }
}

impl<Req, Resp> Middleware<Req, Resp> for TracingMiddleware
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        let method = self.method.clone();
        Endpoint::new(move |ctx, req| {
            let span = tracing::info_span!(
                "endpoint",
                method = %method,
                request_id = %ctx.request_id()
            );
            next.call(ctx, req).instrument(span)
        })
    }
}
