//! Endpoint subsystem.
//!
//! # Data Flow
//! ```text
//! Business function (ctx, req) -> Result<Resp>
//!     → Endpoint::new (type-erased, cheaply cloneable)
//!     → middleware.rs (Chain wraps it, outermost first)
//!     → transport binder or balancer invokes Endpoint::call
//! ```
//!
//! # Design Decisions
//! - An endpoint is a shared closure; two endpoints with the same contract
//!   are interchangeable
//! - Transport failures are the `Err` side; business failures ride inside
//!   the response as [`Reply::Failed`]
//! - Endpoints are also `tower::Service`s so tower layers compose with them

pub mod context;
pub mod middleware;
pub mod reply;

pub use context::{Context, X_REQUEST_ID};
pub use middleware::{Chain, Middleware, MiddlewareLayer};
pub use reply::{BusinessError, Reply};

use std::future::Future;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_util::future::{BoxFuture, FutureExt};
use tower::{Service, ServiceExt};

use crate::error::{Error, Result};

type CallFn<Req, Resp> = dyn Fn(Context, Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync;

/// A single remote-callable operation.
pub struct Endpoint<Req, Resp> {
    inner: Arc<CallFn<Req, Resp>>,
}

impl<Req, Resp> Clone for Endpoint<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Resp> std::fmt::Debug for Endpoint<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").finish_non_exhaustive()
    }
}

impl<Req, Resp> Endpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Wrap an async function as an endpoint.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |ctx, req| f(ctx, req).boxed()),
        }
    }

    /// Invoke the endpoint.
    pub fn call(&self, ctx: Context, req: Req) -> BoxFuture<'static, Result<Resp>> {
        (self.inner)(ctx, req)
    }

    /// Adapt any tower service taking `(Context, Req)`.
    pub fn from_service<S>(service: S) -> Self
    where
        S: Service<(Context, Req), Response = Resp, Error = Error> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        Self::new(move |ctx, req| service.clone().oneshot((ctx, req)))
    }
}

impl<Req, T> Endpoint<Req, Reply<T>>
where
    Req: Send + 'static,
    T: Send + 'static,
{
    /// Wrap a business function whose errors are domain failures. Those
    /// failures become [`Reply::Failed`] on the success path, so breakers
    /// and retries never see them.
    pub fn business<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, BusinessError>> + Send + 'static,
    {
        Self::new(move |ctx, req| f(ctx, req).map(|res| Ok(Reply::from(res))))
    }
}

impl<Req, Resp> Service<(Context, Req)> for Endpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Resp>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, (ctx, req): (Context, Req)) -> Self::Future {
        (self.inner)(ctx, req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_business_failure_is_not_an_error() {
        let ep: Endpoint<String, Reply<String>> = Endpoint::business(|_ctx, s: String| async move {
            if s.is_empty() {
                Err(BusinessError::new("empty", "empty string"))
            } else {
                Ok(s.to_uppercase())
            }
        });

        let ok = ep.call(Context::background(), "abc".into()).await.unwrap();
        assert_eq!(ok, Reply::Ok("ABC".to_string()));

        let failed = ep.call(Context::background(), String::new()).await.unwrap();
        assert_eq!(failed.failure().map(|e| e.code.as_str()), Some("empty"));
    }

    #[tokio::test]
    async fn test_tower_round_trip() {
        let ep: Endpoint<u32, u32> = Endpoint::new(|_ctx, n| async move { Ok(n * 2) });
        let via_tower = ep.clone().oneshot((Context::background(), 21)).await.unwrap();
        assert_eq!(via_tower, 42);

        let back = Endpoint::from_service(ep);
        assert_eq!(back.call(Context::background(), 5).await.unwrap(), 10);
    }
}
