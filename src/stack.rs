//! Endpoint stacks built from configuration.
//!
//! # Data Flow
//! ```text
//! Server side:
//!     ClientConfig.middleware.order → Chain (outermost first) → Endpoint
//!
//! Client side:
//!     Instancer
//!         → Endpointer (factory output wrapped with breaker / limiter,
//!           one breaker per method and instance)
//!         → Balancer (round robin)
//!         → Retry (attempt budget + deadline)
//!         → tracing / logging / metrics layers around the whole call
//! ```
//!
//! # Design Decisions
//! - Layer order comes from config; the default is tracing, logging,
//!   metrics, breaker, limiter, so throttled calls are still measured and
//!   the breaker never sees limiter rejections
//! - On the client side breakers guard single instances, so an open
//!   breaker sends the next attempt elsewhere
//! - Limiter buckets and breakers are shared per method across every
//!   endpoint built from one [`Stack`]

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::schema::{ClientConfig, LayerKind};
use crate::discovery::endpointer::{Closer, Endpointer, EndpointerOptions, Factory};
use crate::discovery::instancer::{Instancer, RegistryInstancer};
use crate::discovery::registry::{Query, Registry};
use crate::endpoint::{Chain, Context, Endpoint, Middleware};
use crate::error::Result;
use crate::lifecycle::Shutdown;
use crate::load_balancer::{Balancer, EndpointSource};
use crate::observability::{init_logging, init_metrics, InstrumentingMiddleware, LoggingMiddleware, TracingMiddleware};
use crate::resilience::circuit_breaker::BreakerRegistry;
use crate::resilience::rate_limit::{RateLimiter, TokenBucket};
use crate::resilience::retries::Retry;
use crate::resilience::timeouts::TimeoutMiddleware;

/// Shared resilience state for one configuration.
#[derive(Debug)]
pub struct Stack {
    config: ClientConfig,
    breakers: Arc<BreakerRegistry>,
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl Stack {
    pub fn new(config: ClientConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config.circuit_breaker.settings()));
        Self {
            config,
            breakers,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Install logging and, when enabled, the metrics exporter.
    pub fn init_observability(&self) {
        let obs = &self.config.observability;
        init_logging(obs);
        if obs.metrics_enabled {
            match obs.metrics_address.parse() {
                Ok(addr) => init_metrics(addr),
                Err(_) => tracing::error!(
                    metrics_address = %obs.metrics_address,
                    "Failed to parse metrics address"
                ),
            }
        }
    }

    /// The rate limiter shared by every endpoint for `method`.
    pub fn limiter(&self, method: &str) -> RateLimiter {
        let rl = &self.config.rate_limit;
        let bucket = self
            .buckets
            .entry(method.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(rl.capacity, rl.refill_per_sec)))
            .clone();
        RateLimiter::new(method, bucket, rl.mode)
    }

    fn layer<Req, Resp>(&self, kind: LayerKind, method: &str, breaker: &str) -> Option<Arc<dyn Middleware<Req, Resp>>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let layer: Arc<dyn Middleware<Req, Resp>> = match kind {
            LayerKind::Tracing => Arc::new(TracingMiddleware::new(method)),
            LayerKind::Logging => Arc::new(LoggingMiddleware::new(method)),
            LayerKind::Metrics => Arc::new(InstrumentingMiddleware::new(method)),
            LayerKind::CircuitBreaker if self.config.circuit_breaker.enabled => {
                Arc::new(self.breakers.middleware(breaker))
            }
            LayerKind::RateLimit if self.config.rate_limit.enabled => Arc::new(self.limiter(method)),
            LayerKind::CircuitBreaker | LayerKind::RateLimit => return None,
        };
        Some(layer)
    }

    fn timeout(&self) -> Option<TimeoutMiddleware> {
        self.config
            .middleware
            .timeout_ms
            .map(|ms| TimeoutMiddleware::new(Duration::from_millis(ms)))
    }

    fn build_chain<Req, Resp>(&self, method: &str, breaker: &str, kinds: impl Fn(LayerKind) -> bool) -> Chain<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.config
            .middleware
            .order
            .iter()
            .copied()
            .filter(|k| kinds(*k))
            .filter_map(|k| self.layer(k, method, breaker))
            .fold(Chain::new(), Chain::push_shared)
    }

    /// Every configured layer for `method`, outermost first, with the
    /// optional timeout innermost.
    pub fn chain<Req, Resp>(&self, method: &str) -> Chain<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let chain = self.build_chain(method, method, |_| true);
        match self.timeout() {
            Some(t) => chain.push(t),
            None => chain,
        }
    }

    /// Wrap a local endpoint with the configured chain.
    pub fn server<Req, Resp>(&self, method: &str, endpoint: Endpoint<Req, Resp>) -> Endpoint<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.chain(method).apply(endpoint)
    }

    /// Follow the configured discovery query in `registry`.
    pub async fn instancer(&self, registry: Arc<dyn Registry>, shutdown: &Shutdown) -> RegistryInstancer {
        let d = &self.config.discovery;
        let query = Query::new(d.service.clone())
            .with_tags(d.tags.iter().cloned())
            .passing_only(d.passing_only);
        RegistryInstancer::spawn(registry, query, shutdown).await
    }

    /// A resilient client endpoint for `method`, spread over the instances
    /// published by `instancer`.
    pub fn client<Req, Resp>(
        &self,
        method: &str,
        instancer: &dyn Instancer,
        factory: Factory<Req, Resp>,
    ) -> DiscoveredEndpoint<Req, Resp>
    where
        Req: Clone + Send + 'static,
        Resp: Send + 'static,
    {
        let per_instance = self.instance_factory(method, factory);
        let options = EndpointerOptions {
            invalidate_on_error: self.config.discovery.invalidate_on_error(),
        };
        let endpointer = Arc::new(Endpointer::new(instancer, per_instance, options));
        let source: Arc<dyn EndpointSource<Req, Resp>> = endpointer.clone();

        let retry_config = &self.config.retry;
        let mut retry = Retry::new(
            method,
            Balancer::round_robin(source),
            retry_config.max_attempts,
            retry_config.deadline(),
        );
        if let Some((base, max)) = retry_config.backoff() {
            retry = retry.with_backoff(base, max);
        }

        let outer = self.build_chain(method, method, |k| {
            !matches!(k, LayerKind::CircuitBreaker | LayerKind::RateLimit)
        });
        DiscoveredEndpoint {
            endpoint: outer.apply(retry.into_endpoint()),
            endpointer,
        }
    }

    /// Wrap `factory` so each instance endpoint gets the breaker, limiter
    /// and timeout layers. The instance breaker is dropped with the instance.
    fn instance_factory<Req, Resp>(&self, method: &str, factory: Factory<Req, Resp>) -> Factory<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let breakers = self.breakers.clone();
        let breakers_enabled = self.config.circuit_breaker.enabled;
        let limiter = self.config.rate_limit.enabled.then(|| self.limiter(method));
        let order: Vec<LayerKind> = self.config.middleware.order.clone();
        let timeout = self.timeout();
        let method = method.to_string();

        Arc::new(move |addr: &str| -> Result<(Endpoint<Req, Resp>, Option<Box<dyn Closer>>)> {
            let (endpoint, closer) = factory(addr)?;
            let breaker_name = format!("{method}@{addr}");

            let mut chain = Chain::new();
            for kind in &order {
                match kind {
                    LayerKind::CircuitBreaker if breakers_enabled => {
                        chain = chain.push(breakers.middleware(&breaker_name));
                    }
                    LayerKind::RateLimit => {
                        if let Some(limiter) = &limiter {
                            chain = chain.push(limiter.clone());
                        }
                    }
                    _ => {}
                }
            }
            if let Some(t) = timeout {
                chain = chain.push(t);
            }

            let breakers = breakers.clone();
            let closer: Box<dyn Closer> = Box::new(move || {
                breakers.remove(&breaker_name);
                if let Some(inner) = closer {
                    inner.close();
                }
            });
            Ok((chain.apply(endpoint), Some(closer)))
        })
    }
}

/// A client endpoint together with the endpointer feeding it.
pub struct DiscoveredEndpoint<Req, Resp> {
    endpoint: Endpoint<Req, Resp>,
    endpointer: Arc<Endpointer<Req, Resp>>,
}

impl<Req, Resp> DiscoveredEndpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn endpoint(&self) -> Endpoint<Req, Resp> {
        self.endpoint.clone()
    }

    pub fn endpointer(&self) -> &Endpointer<Req, Resp> {
        &self.endpointer
    }

    pub async fn call(&self, ctx: Context, req: Req) -> Result<Resp> {
        self.endpoint.call(ctx, req).await
    }
}

impl<Req, Resp> std::fmt::Debug for DiscoveredEndpoint<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredEndpoint")
            .field("endpointer", &self.endpointer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use crate::resilience::circuit_breaker::BreakerState;

    #[tokio::test]
    async fn test_default_chain_keeps_limiter_rejections_from_breaker() {
        let mut config = ClientConfig::default();
        config.rate_limit.capacity = 1;
        config.rate_limit.refill_per_sec = 0.0;
        config.circuit_breaker.failure_threshold = 1;
        let stack = Stack::new(config);

        let ep = stack.server("uppercase", Endpoint::new(|_ctx, s: String| async move { Ok(s.to_uppercase()) }));
        assert_eq!(ep.call(Context::background(), "a".into()).await.unwrap(), "A");
        for _ in 0..3 {
            let err = ep.call(Context::background(), "a".into()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::RateLimited);
        }
        assert_eq!(stack.breakers().get("uppercase").state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_counts_throttling_when_configured() {
        let mut config = ClientConfig::default();
        config.rate_limit.capacity = 1;
        config.rate_limit.refill_per_sec = 0.0;
        config.circuit_breaker.failure_threshold = 2;
        config.circuit_breaker.trip_on_rate_limit = true;
        let stack = Stack::new(config);

        let ep = stack.server("count", Endpoint::new(|_ctx, s: String| async move { Ok(s.len()) }));
        ep.call(Context::background(), "a".into()).await.unwrap();
        ep.call(Context::background(), "a".into()).await.unwrap_err();
        ep.call(Context::background(), "a".into()).await.unwrap_err();
        let err = ep.call(Context::background(), "a".into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BreakerOpen);
    }

    #[tokio::test]
    async fn test_disabled_layers_are_skipped() {
        let mut config = ClientConfig::default();
        config.rate_limit.enabled = false;
        config.circuit_breaker.enabled = false;
        let stack = Stack::new(config);

        let chain: Chain<(), ()> = stack.chain("noop");
        assert_eq!(chain.len(), 3);

        let ep = stack.server("noop", Endpoint::new(|_ctx, _: ()| async { Err::<(), _>(Error::transport("down")) }));
        for _ in 0..10 {
            assert_eq!(ep.call(Context::background(), ()).await.unwrap_err().kind(), ErrorKind::Transport);
        }
    }
}
