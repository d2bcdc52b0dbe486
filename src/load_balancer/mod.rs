//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Call enters the balanced endpoint
//!     → EndpointSource::endpoints (stable snapshot from the Endpointer)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through endpoints)
//!         - random.rs (uniform pick)
//!     → Return one endpoint or NoEndpoints
//! ```
//!
//! # Design Decisions
//! - Algorithms only pick an index; the endpoint list is owned elsewhere
//! - An empty pool fails immediately with [`Error::NoEndpoints`]
//! - A fresh selection is made per attempt so retries can move on

pub mod random;
pub mod round_robin;

pub use random::Random;
pub use round_robin::RoundRobin;

use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Picks one position out of `len` candidates.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// `None` when there is nothing to pick from.
    fn next_index(&self, len: usize) -> Option<usize>;
}

/// Anything that can hand out the current endpoint list.
pub trait EndpointSource<Req, Resp>: Send + Sync {
    fn endpoints(&self) -> Result<Arc<Vec<Endpoint<Req, Resp>>>>;
}

/// A constant endpoint list.
pub struct FixedEndpoints<Req, Resp>(Arc<Vec<Endpoint<Req, Resp>>>);

impl<Req, Resp> FixedEndpoints<Req, Resp> {
    pub fn new(endpoints: Vec<Endpoint<Req, Resp>>) -> Self {
        Self(Arc::new(endpoints))
    }
}

impl<Req, Resp> EndpointSource<Req, Resp> for FixedEndpoints<Req, Resp> {
    fn endpoints(&self) -> Result<Arc<Vec<Endpoint<Req, Resp>>>> {
        Ok(self.0.clone())
    }
}

/// Selects one endpoint from a source per call.
pub struct Balancer<Req, Resp> {
    source: Arc<dyn EndpointSource<Req, Resp>>,
    strategy: Arc<dyn LoadBalancer>,
}

impl<Req, Resp> Clone for Balancer<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            strategy: self.strategy.clone(),
        }
    }
}

impl<Req, Resp> Balancer<Req, Resp> {
    pub fn new(source: Arc<dyn EndpointSource<Req, Resp>>, strategy: Arc<dyn LoadBalancer>) -> Self {
        Self { source, strategy }
    }

    pub fn round_robin(source: Arc<dyn EndpointSource<Req, Resp>>) -> Self {
        Self::new(source, Arc::new(RoundRobin::new()))
    }

    pub fn random(source: Arc<dyn EndpointSource<Req, Resp>>) -> Self {
        Self::new(source, Arc::new(Random::new()))
    }

    /// Pick the endpoint for one attempt.
    pub fn endpoint(&self) -> Result<Endpoint<Req, Resp>> {
        let endpoints = self.source.endpoints()?;
        self.strategy
            .next_index(endpoints.len())
            .and_then(|i| endpoints.get(i))
            .cloned()
            .ok_or(Error::NoEndpoints)
    }
}

impl<Req, Resp> std::fmt::Debug for Balancer<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
