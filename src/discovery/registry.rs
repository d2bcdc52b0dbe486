//! Registry abstraction.
//!
//! The discovery layer only needs an instance lister with change
//! notifications; concrete catalogs implement [`Registry`].

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::discovery::instance::Instance;
use crate::error::Result;

/// Which instances of a service a subscriber is interested in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub service: String,
    /// Every tag listed must be present on the instance.
    pub tags: Vec<String>,
    /// Drop instances whose health check is not passing.
    pub passing_only: bool,
}

impl Query {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            tags: Vec::new(),
            passing_only: false,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn passing_only(mut self, passing_only: bool) -> Self {
        self.passing_only = passing_only;
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        instance.service == self.service
            && self.tags.iter().all(|t| instance.has_tag(t))
            && (!self.passing_only || instance.is_passing())
    }
}

/// An external service catalog.
pub trait Registry: Send + Sync {
    /// Current instances matching `query`.
    fn list<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Vec<Instance>>>;

    /// A change index for `service`; every registry change that may affect
    /// the service bumps the value. Closing the channel means the watch was
    /// lost and must be re-established.
    fn watch(&self, service: &str) -> Result<watch::Receiver<u64>>;
}
