//! Transport binders.
//!
//! # Data Flow
//! ```text
//! Server side:
//!     wire request
//!         → before hooks (copy wire metadata into the Context)
//!         → decode (failure answered here; endpoint never runs)
//!         → Endpoint::call
//!         → encode, or error encoder on failure
//!         → after hooks → wire response
//!
//! Client side:
//!     domain request → encode → before hooks
//!         → RoundTrip (http.rs, bus.rs) bounded by the Context
//!         → decode → domain response
//! ```
//!
//! # Design Decisions
//! - Binders know nothing about specific wire formats; http.rs and bus.rs
//!   supply the codecs
//! - The same endpoint can sit behind any number of bindings at once
//! - Malformed input is a decode error, never charged to a breaker

pub mod bus;
pub mod http;

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::endpoint::{Context, Endpoint};
use crate::error::{Error, Result};

type DecodeFn<W, T> = dyn Fn(&Context, W) -> Result<T> + Send + Sync;
type EncodeFn<T, W> = dyn Fn(&Context, T) -> Result<W> + Send + Sync;
type ErrorEncodeFn<W> = dyn Fn(&Context, &Error) -> W + Send + Sync;
type ServerBeforeFn<W> = dyn Fn(Context, &W) -> Context + Send + Sync;
type ServerAfterFn<W> = dyn Fn(&Context, &mut W) + Send + Sync;
type ClientBeforeFn<W> = dyn Fn(&Context, &mut W) + Send + Sync;

/// Serves one endpoint over one wire format.
pub struct Server<WIn, WOut, Req, Resp> {
    endpoint: Endpoint<Req, Resp>,
    decode: Arc<DecodeFn<WIn, Req>>,
    encode: Arc<EncodeFn<Resp, WOut>>,
    error_encoder: Arc<ErrorEncodeFn<WOut>>,
    before: Vec<Arc<ServerBeforeFn<WIn>>>,
    after: Vec<Arc<ServerAfterFn<WOut>>>,
}

impl<WIn, WOut, Req, Resp> Clone for Server<WIn, WOut, Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            decode: self.decode.clone(),
            encode: self.encode.clone(),
            error_encoder: self.error_encoder.clone(),
            before: self.before.clone(),
            after: self.after.clone(),
        }
    }
}

impl<WIn, WOut, Req, Resp> Server<WIn, WOut, Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<D, E, X>(endpoint: Endpoint<Req, Resp>, decode: D, encode: E, error_encoder: X) -> Self
    where
        D: Fn(&Context, WIn) -> Result<Req> + Send + Sync + 'static,
        E: Fn(&Context, Resp) -> Result<WOut> + Send + Sync + 'static,
        X: Fn(&Context, &Error) -> WOut + Send + Sync + 'static,
    {
        Self {
            endpoint,
            decode: Arc::new(decode),
            encode: Arc::new(encode),
            error_encoder: Arc::new(error_encoder),
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Run before decoding; may derive a new context from the wire request.
    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(Context, &WIn) -> Context + Send + Sync + 'static,
    {
        self.before.push(Arc::new(hook));
        self
    }

    /// Run on every wire response, successful or not.
    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, &mut WOut) + Send + Sync + 'static,
    {
        self.after.push(Arc::new(hook));
        self
    }

    /// Handle one wire request.
    pub async fn serve(&self, ctx: Context, wire: WIn) -> WOut {
        let ctx = self.before.iter().fold(ctx, |ctx, hook| hook(ctx, &wire));

        let mut out = match (self.decode)(&ctx, wire) {
            Ok(req) => match self.endpoint.call(ctx.clone(), req).await {
                Ok(resp) => match (self.encode)(&ctx, resp) {
                    Ok(out) => out,
                    Err(e) => self.encode_error(&ctx, &e),
                },
                Err(e) => self.encode_error(&ctx, &e),
            },
            Err(e) => {
                tracing::debug!(request_id = %ctx.request_id(), error = %e, "Rejected malformed request");
                self.encode_error(&ctx, &e)
            }
        };

        for hook in &self.after {
            hook(&ctx, &mut out);
        }
        out
    }

    /// Wire response for a failure that happened outside `serve`.
    pub fn encode_error(&self, ctx: &Context, err: &Error) -> WOut {
        (self.error_encoder)(ctx, err)
    }
}

/// Moves one wire request to a remote peer and returns its response.
pub trait RoundTrip<WReq, WResp>: Send + Sync {
    fn round_trip(&self, ctx: &Context, wire: WReq) -> BoxFuture<'static, Result<WResp>>;
}

/// Calls a remote endpoint over one transport.
pub struct Client<Req, Resp, WReq, WResp> {
    transport: Arc<dyn RoundTrip<WReq, WResp>>,
    encode: Arc<EncodeFn<Req, WReq>>,
    decode: Arc<DecodeFn<WResp, Resp>>,
    before: Vec<Arc<ClientBeforeFn<WReq>>>,
}

impl<Req, Resp, WReq, WResp> Clone for Client<Req, Resp, WReq, WResp> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            encode: self.encode.clone(),
            decode: self.decode.clone(),
            before: self.before.clone(),
        }
    }
}

impl<Req, Resp, WReq, WResp> Client<Req, Resp, WReq, WResp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    WReq: Send + 'static,
    WResp: Send + 'static,
{
    pub fn new<E, D>(transport: Arc<dyn RoundTrip<WReq, WResp>>, encode: E, decode: D) -> Self
    where
        E: Fn(&Context, Req) -> Result<WReq> + Send + Sync + 'static,
        D: Fn(&Context, WResp) -> Result<Resp> + Send + Sync + 'static,
    {
        Self {
            transport,
            encode: Arc::new(encode),
            decode: Arc::new(decode),
            before: Vec::new(),
        }
    }

    /// Run on the encoded request before it is sent.
    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, &mut WReq) + Send + Sync + 'static,
    {
        self.before.push(Arc::new(hook));
        self
    }

    pub async fn call(&self, ctx: Context, req: Req) -> Result<Resp> {
        let mut wire = (self.encode)(&ctx, req)?;
        for hook in &self.before {
            hook(&ctx, &mut wire);
        }
        let resp = ctx.run(self.transport.round_trip(&ctx, wire)).await?;
        (self.decode)(&ctx, resp)
    }

    /// The client as an endpoint, ready for middlewares or an endpointer.
    pub fn endpoint(self) -> Endpoint<Req, Resp> {
        let client = Arc::new(self);
        Endpoint::new(move |ctx, req| {
            let client = client.clone();
            async move { client.call(ctx, req).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::resilience::circuit_breaker::{BreakerMiddleware, BreakerState, CircuitBreaker};
    use crate::endpoint::Middleware;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn parse_server(calls: Arc<AtomicU32>) -> Server<String, String, i64, i64> {
        let ep = Endpoint::new(move |_ctx, n: i64| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n * 2) }
        });
        Server::new(
            ep,
            |_ctx, wire: String| wire.trim().parse::<i64>().map_err(Error::decode),
            |_ctx, n: i64| Ok(n.to_string()),
            |_ctx, err: &Error| format!("error:{}", err.kind()),
        )
    }

    #[tokio::test]
    async fn test_decode_failure_never_invokes_endpoint() {
        let calls = Arc::new(AtomicU32::new(0));
        let server = parse_server(calls.clone());

        assert_eq!(server.serve(Context::background(), "21".into()).await, "42");
        assert_eq!(server.serve(Context::background(), "twenty".into()).await, "error:decode");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_leaves_breaker_closed() {
        let breaker = Arc::new(CircuitBreaker::new(
            "double",
            crate::resilience::BreakerSettings {
                policy: crate::resilience::TripPolicy::Consecutive { threshold: 1 },
                ..Default::default()
            },
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let ep = BreakerMiddleware::new(breaker.clone()).wrap(Endpoint::new(move |_ctx, n: i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n) }
        }));
        let server = Server::new(
            ep,
            |_ctx, wire: String| wire.parse::<i64>().map_err(Error::decode),
            |_ctx, n: i64| Ok(n.to_string()),
            |_ctx, err: &Error| err.kind().to_string(),
        );

        for _ in 0..5 {
            server.serve(Context::background(), "{oops".into()).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hooks_see_context() {
        let server = parse_server(Arc::new(AtomicU32::new(0)))
            .before(|ctx, _wire: &String| ctx.with_request_id("req-7"))
            .after(|ctx, out: &mut String| out.push_str(&format!(" ({})", ctx.request_id())));

        assert_eq!(server.serve(Context::background(), "1".into()).await, "2 (req-7)");
        assert_eq!(server.serve(Context::background(), "x".into()).await, "error:decode (req-7)");
    }

    struct Loopback(Server<String, String, i64, i64>);

    impl RoundTrip<String, String> for Loopback {
        fn round_trip(&self, ctx: &Context, wire: String) -> BoxFuture<'static, Result<String>> {
            let server = self.0.clone();
            let ctx = ctx.clone();
            async move { Ok(server.serve(ctx, wire).await) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let transport: Arc<dyn RoundTrip<String, String>> = Arc::new(Loopback(parse_server(Arc::new(AtomicU32::new(0)))));
        let client: Client<i64, i64, String, String> = Client::new(
            transport,
            |_ctx, n: i64| Ok(n.to_string()),
            |_ctx, wire: String| match wire.strip_prefix("error:") {
                Some(kind) => Err(Error::Transport(kind.to_string())),
                None => wire.parse().map_err(Error::decode),
            },
        );
        let ep = client.endpoint();
        assert_eq!(ep.call(Context::background(), 8).await.unwrap(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_honours_deadline() {
        struct Hang;
        impl RoundTrip<String, String> for Hang {
            fn round_trip(&self, _ctx: &Context, _wire: String) -> BoxFuture<'static, Result<String>> {
                std::future::pending().boxed()
            }
        }
        let transport: Arc<dyn RoundTrip<String, String>> = Arc::new(Hang);
        let client: Client<i64, i64, String, String> = Client::new(
            transport,
            |_ctx, n: i64| Ok(n.to_string()),
            |_ctx, wire: String| wire.parse().map_err(Error::decode),
        );

        let ctx = Context::background().with_timeout(std::time::Duration::from_millis(50));
        let err = client.call(ctx, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }
}
