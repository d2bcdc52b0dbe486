//! Per-call timeout enforcement.
//!
//! # Design Decisions
//! - The timeout tightens the context deadline, so inner layers and the
//!   wrapped endpoint see the same budget
//! - Timed-out calls fail with [`crate::Error::DeadlineExceeded`], which
//!   breakers count as a dependency failure

use std::time::Duration;

use crate::endpoint::{Endpoint, Middleware};

/// Bounds each call to at most the configured duration.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<Req, Resp> Middleware<Req, Resp> for TimeoutMiddleware
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        let timeout = self.timeout;
        Endpoint::new(move |ctx, req| {
            let next = next.clone();
            let ctx = ctx.with_timeout(timeout);
            async move { ctx.run(next.call(ctx.clone(), req)).await }
        })
    }
}
