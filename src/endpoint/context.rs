//! Call context threaded through every middleware layer.
//!
//! # Responsibilities
//! - Carry caller cancellation and an optional deadline
//! - Carry a request ID and string metadata copied from the wire
//! - Race in-flight work against cancellation and the deadline
//!
//! # Design Decisions
//! - Cancellation uses a token tree: cancelling a parent cancels children,
//!   never the other way round
//! - Deadlines only ever shrink when deriving a child context
//! - Clock reads go through `tokio::time::Instant` so paused-time tests work

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Request ID header propagated across bindings.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Per-call context.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    request_id: Arc<str>,
    metadata: Arc<HashMap<String, String>>,
}

impl Context {
    /// A fresh root context with no deadline and a generated request ID.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            request_id: uuid::Uuid::new_v4().to_string().into(),
            metadata: Arc::new(HashMap::new()),
        }
    }

    /// Derive a child that is cancelled when `self` is, but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            request_id: self.request_id.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Derive a child whose deadline is at most `timeout` from now. A
    /// timeout too large to represent leaves the parent's deadline as is.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Derive a child whose deadline is at most `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        child
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into().into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.metadata).insert(key.into(), value.into());
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Drive `fut` to completion unless the context is cancelled
    /// ([`Error::Cancelled`]) or its deadline passes
    /// ([`Error::DeadlineExceeded`]) first. Dropping `fut` aborts whatever
    /// network operation it was performing.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let started = Instant::now();
        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = expiry => {
                let budget = deadline
                    .map(|d| d.saturating_duration_since(started))
                    .unwrap_or_default();
                Err(Error::DeadlineExceeded(budget))
            }
            res = fut => res,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_propagates_to_children_only() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_deadline_never_extends() {
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let child = ctx.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), ctx.deadline());
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_keeps_parent_deadline() {
        let unbounded = Context::background().with_timeout(Duration::MAX);
        assert_eq!(unbounded.deadline(), None);
        let res: Result<u32> = unbounded.run(async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);

        let bounded = Context::background().with_timeout(Duration::from_secs(1));
        let child = bounded.with_timeout(Duration::MAX);
        assert_eq!(child.deadline(), bounded.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_hits_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let res: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(Error::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let res: Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[test]
    fn test_metadata_is_copy_on_write() {
        let a = Context::background().with_metadata("tenant", "blue");
        let b = a.clone().with_metadata("tenant", "green");
        assert_eq!(a.metadata("tenant"), Some("blue"));
        assert_eq!(b.metadata("tenant"), Some("green"));
        assert_eq!(a.request_id(), b.request_id());
    }
}
