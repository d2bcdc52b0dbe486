//! Middleware composition.
//!
//! # Responsibilities
//! - Define the same-signature wrapper contract
//! - Compose wrappers as an explicit ordered list
//! - Bridge middlewares into `tower::Layer`
//!
//! # Design Decisions
//! - The first entry of a [`Chain`] is the outermost wrapper: its "before"
//!   logic runs first and its "after" logic runs last
//! - A chain is itself a middleware, so chains nest associatively

use std::sync::Arc;

use tower::Layer;

use crate::endpoint::Endpoint;

/// Wraps an endpoint with another endpoint of the same type.
pub trait Middleware<Req, Resp>: Send + Sync {
    fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp>;
}

impl<Req, Resp, F> Middleware<Req, Resp> for F
where
    F: Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp> + Send + Sync,
{
    fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        self(next)
    }
}

/// An ordered stack of middlewares, outermost first.
pub struct Chain<Req, Resp> {
    layers: Vec<Arc<dyn Middleware<Req, Resp>>>,
}

impl<Req, Resp> Clone for Chain<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            layers: self.layers.clone(),
        }
    }
}

impl<Req, Resp> Default for Chain<Req, Resp> {
    fn default() -> Self {
        Self { layers: Vec::new() }
    }
}

impl<Req, Resp> Chain<Req, Resp> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware inside every middleware already in the chain.
    pub fn push<M>(mut self, middleware: M) -> Self
    where
        M: Middleware<Req, Resp> + 'static,
    {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Append an already shared middleware.
    pub fn push_shared(mut self, middleware: Arc<dyn Middleware<Req, Resp>>) -> Self {
        self.layers.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wrap `endpoint` with every middleware in the chain.
    pub fn apply(&self, endpoint: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        self.layers
            .iter()
            .rev()
            .fold(endpoint, |inner, layer| layer.wrap(inner))
    }
}

impl<Req, Resp> Middleware<Req, Resp> for Chain<Req, Resp> {
    fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        self.apply(next)
    }
}

/// Uses a [`Middleware`] as a `tower::Layer` over endpoints.
#[derive(Debug, Clone)]
pub struct MiddlewareLayer<M>(pub M);

impl<M, Req, Resp> Layer<Endpoint<Req, Resp>> for MiddlewareLayer<M>
where
    M: Middleware<Req, Resp>,
{
    type Service = Endpoint<Req, Resp>;

    fn layer(&self, inner: Endpoint<Req, Resp>) -> Self::Service {
        self.0.wrap(inner)
    }
}
