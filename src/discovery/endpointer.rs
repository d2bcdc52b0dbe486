//! Endpointer: one endpoint per live instance.
//!
//! # Responsibilities
//! - Build an endpoint for each new instance through a factory
//! - Close the resources of instances that disappear, exactly once
//! - Publish a consistent endpoint list to the balancer
//!
//! # Data Flow
//! ```text
//! Instancer event
//!     → diff against cache (BTreeMap address → entry)
//!     → factory(address) for new addresses, close() for removed ones
//!     → ArcSwap snapshot replaced in one store
//! ```
//!
//! # Design Decisions
//! - Only the background task mutates the cache; readers load a snapshot
//!   and see either the old or the new list, never a partial one
//! - Registry errors keep the cache (stale-but-available) unless
//!   `invalidate_on_error` is set and the error outlasts it
//! - A factory failure skips that instance only

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::discovery::instance::InstanceSet;
use crate::discovery::instancer::{Event, Instancer, Subscription};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::load_balancer::EndpointSource;

/// Releases whatever an endpoint held (connections, clients).
pub trait Closer: Send {
    fn close(self: Box<Self>);
}

impl<F> Closer for F
where
    F: FnOnce() + Send,
{
    fn close(self: Box<Self>) {
        (*self)()
    }
}

/// Builds the endpoint for one instance address.
pub type Factory<Req, Resp> =
    Arc<dyn Fn(&str) -> Result<(Endpoint<Req, Resp>, Option<Box<dyn Closer>>)> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointerOptions {
    /// Drop every cached endpoint once the registry has been failing
    /// for this long. `None` keeps stale endpoints indefinitely.
    pub invalidate_on_error: Option<Duration>,
}

struct Entry<Req, Resp> {
    endpoint: Endpoint<Req, Resp>,
    closer: Option<Box<dyn Closer>>,
}

impl<Req, Resp> Entry<Req, Resp> {
    fn close(self) {
        if let Some(closer) = self.closer {
            closer.close();
        }
    }
}

struct Snapshot<Req, Resp> {
    endpoints: Arc<Vec<Endpoint<Req, Resp>>>,
    addresses: Vec<String>,
    invalidated: Option<Error>,
}

impl<Req, Resp> Snapshot<Req, Resp> {
    fn empty() -> Self {
        Self {
            endpoints: Arc::new(Vec::new()),
            addresses: Vec::new(),
            invalidated: None,
        }
    }
}

struct Cache<Req, Resp> {
    entries: BTreeMap<String, Entry<Req, Resp>>,
    closed: bool,
}

struct Shared<Req, Resp> {
    factory: Factory<Req, Resp>,
    snapshot: ArcSwap<Snapshot<Req, Resp>>,
    cache: Mutex<Cache<Req, Resp>>,
}

impl<Req, Resp> Shared<Req, Resp> {
    fn lock(&self) -> MutexGuard<'_, Cache<Req, Resp>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reconcile(&self, set: &InstanceSet) {
        let mut removed = Vec::new();
        {
            let mut cache = self.lock();
            if cache.closed {
                return;
            }

            let stale: Vec<String> = cache
                .entries
                .keys()
                .filter(|addr| !set.contains(addr))
                .cloned()
                .collect();
            for addr in stale {
                if let Some(entry) = cache.entries.remove(&addr) {
                    removed.push((addr, entry));
                }
            }

            for addr in set.iter() {
                if cache.entries.contains_key(addr) {
                    continue;
                }
                match (self.factory)(addr) {
                    Ok((endpoint, closer)) => {
                        tracing::debug!(instance = %addr, "Endpoint created");
                        cache.entries.insert(addr.to_string(), Entry { endpoint, closer });
                    }
                    Err(e) => {
                        tracing::warn!(instance = %addr, error = %e, "Endpoint factory failed, skipping instance");
                    }
                }
            }

            self.publish(&cache, None);
        }

        for (addr, entry) in removed {
            tracing::debug!(instance = %addr, "Endpoint closed");
            entry.close();
        }
    }

    /// Close and drop everything; `reason` is reported to callers.
    fn clear(&self, reason: Option<Error>, close_for_good: bool) {
        let drained: Vec<Entry<Req, Resp>> = {
            let mut cache = self.lock();
            if cache.closed {
                return;
            }
            cache.closed = close_for_good;
            let drained = std::mem::take(&mut cache.entries).into_values().collect();
            self.publish(&cache, reason);
            drained
        };
        for entry in drained {
            entry.close();
        }
    }

    fn publish(&self, cache: &Cache<Req, Resp>, invalidated: Option<Error>) {
        let snapshot = Snapshot {
            endpoints: Arc::new(cache.entries.values().map(|e| e.endpoint.clone()).collect()),
            addresses: cache.entries.keys().cloned().collect(),
            invalidated,
        };
        self.snapshot.store(Arc::new(snapshot));
    }
}

/// A live endpoint list kept in sync with an [`Instancer`].
pub struct Endpointer<Req, Resp> {
    shared: Arc<Shared<Req, Resp>>,
    task: JoinHandle<()>,
}

impl<Req, Resp> Endpointer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Subscribe to `instancer`, build endpoints for its current set and
    /// follow later events in a background task.
    pub fn new(instancer: &dyn Instancer, factory: Factory<Req, Resp>, options: EndpointerOptions) -> Self {
        let shared = Arc::new(Shared {
            factory,
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
            cache: Mutex::new(Cache {
                entries: BTreeMap::new(),
                closed: false,
            }),
        });

        let subscription = instancer.subscribe();
        let mut failing_since = None;
        apply(shared.as_ref(), &subscription.current(), &mut failing_since);

        let task = tokio::spawn(follow(shared.clone(), subscription, options, failing_since));
        Self { shared, task }
    }
}

impl<Req, Resp> Endpointer<Req, Resp> {
    /// Addresses currently backed by an endpoint, in sorted order.
    pub fn addresses(&self) -> Vec<String> {
        self.shared.snapshot.load().addresses.clone()
    }

    /// Stop following the instancer and close every endpoint.
    pub fn close(&self) {
        self.task.abort();
        self.shared.clear(Some(Error::Discovery("endpointer closed".into())), true);
    }
}

impl<Req, Resp> EndpointSource<Req, Resp> for Endpointer<Req, Resp> {
    fn endpoints(&self) -> Result<Arc<Vec<Endpoint<Req, Resp>>>> {
        let snapshot = self.shared.snapshot.load();
        match &snapshot.invalidated {
            Some(err) => Err(err.clone()),
            None => Ok(snapshot.endpoints.clone()),
        }
    }
}

impl<Req, Resp> Drop for Endpointer<Req, Resp> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<Req, Resp> std::fmt::Debug for Endpointer<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpointer")
            .field("addresses", &self.addresses())
            .finish_non_exhaustive()
    }
}

fn apply<Req, Resp>(shared: &Shared<Req, Resp>, event: &Event, failing_since: &mut Option<Instant>) {
    match &event.error {
        None => {
            *failing_since = None;
            shared.reconcile(&event.instances);
        }
        Some(e) => {
            tracing::warn!(error = %e, "Instancer reported an error, keeping cached endpoints");
            failing_since.get_or_insert_with(Instant::now);
        }
    }
}

async fn follow<Req, Resp>(
    shared: Arc<Shared<Req, Resp>>,
    mut subscription: Subscription,
    options: EndpointerOptions,
    mut failing_since: Option<Instant>,
) {
    let mut invalidated = false;
    loop {
        let invalidate_at = match (failing_since, options.invalidate_on_error, invalidated) {
            (Some(since), Some(after), false) => since.checked_add(after),
            _ => None,
        };
        let expiry = async move {
            match invalidate_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            event = subscription.changed() => match event {
                Some(event) => {
                    apply(shared.as_ref(), &event, &mut failing_since);
                    if failing_since.is_none() {
                        invalidated = false;
                    }
                }
                None => return,
            },
            _ = expiry => {
                tracing::warn!("Registry error persisted, invalidating cached endpoints");
                shared.clear(Some(Error::Discovery("endpoints invalidated after registry error".into())), false);
                invalidated = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::instancer::Broadcaster;
    use crate::endpoint::Context;
    use std::collections::HashMap;

    struct TestInstancer(Broadcaster);

    impl Instancer for TestInstancer {
        fn subscribe(&self) -> Subscription {
            self.0.subscribe()
        }
    }

    fn closing_factory(closed: Arc<Mutex<HashMap<String, u32>>>) -> Factory<(), String> {
        Arc::new(move |addr: &str| -> Result<(Endpoint<(), String>, Option<Box<dyn Closer>>)> {
            let owned = addr.to_string();
            let endpoint = Endpoint::new(move |_ctx, _req| {
                let owned = owned.clone();
                async move { Ok(owned) }
            });
            let closed = closed.clone();
            let addr = addr.to_string();
            let closer: Box<dyn Closer> = Box::new(move || {
                *closed.lock().unwrap().entry(addr).or_insert(0) += 1;
            });
            Ok((endpoint, Some(closer)))
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_reconciles_and_closes_removed_once() {
        let instancer = TestInstancer(Broadcaster::new());
        let closed = Arc::new(Mutex::new(HashMap::new()));
        let endpointer = Endpointer::new(&instancer, closing_factory(closed.clone()), EndpointerOptions::default());
        assert!(endpointer.addresses().is_empty());
        assert!(endpointer.endpoints().unwrap().is_empty());

        instancer.0.update(InstanceSet::new(["a", "b"]));
        settle().await;
        assert_eq!(endpointer.addresses(), vec!["a", "b"]);
        assert!(closed.lock().unwrap().is_empty());

        instancer.0.update(InstanceSet::new(["a", "c"]));
        settle().await;
        assert_eq!(endpointer.addresses(), vec!["a", "c"]);
        assert_eq!(closed.lock().unwrap().get("b"), Some(&1));
        assert_eq!(closed.lock().unwrap().len(), 1);

        let endpoints = endpointer.endpoints().unwrap();
        let mut got = Vec::new();
        for ep in endpoints.iter() {
            got.push(ep.call(Context::background(), ()).await.unwrap());
        }
        assert_eq!(got, vec!["a", "c"]);

        drop(endpointer);
        let closed = closed.lock().unwrap();
        assert_eq!(closed.get("a"), Some(&1));
        assert_eq!(closed.get("b"), Some(&1));
        assert_eq!(closed.get("c"), Some(&1));
    }

    #[tokio::test]
    async fn test_factory_failure_skips_instance() {
        let instancer = TestInstancer(Broadcaster::new());
        instancer.0.update(InstanceSet::new(["good", "bad"]));
        let factory: Factory<(), ()> = Arc::new(|addr: &str| -> Result<(Endpoint<(), ()>, Option<Box<dyn Closer>>)> {
            if addr == "bad" {
                return Err(Error::Factory {
                    instance: addr.to_string(),
                    reason: "invalid address".into(),
                });
            }
            Ok((Endpoint::new(|_ctx, _req| async { Ok(()) }), None))
        });

        let endpointer = Endpointer::new(&instancer, factory, EndpointerOptions::default());
        assert_eq!(endpointer.addresses(), vec!["good"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_error_keeps_then_invalidates() {
        let instancer = TestInstancer(Broadcaster::new());
        instancer.0.update(InstanceSet::new(["a"]));
        let closed = Arc::new(Mutex::new(HashMap::new()));
        let endpointer = Endpointer::new(
            &instancer,
            closing_factory(closed.clone()),
            EndpointerOptions {
                invalidate_on_error: Some(Duration::from_secs(5)),
            },
        );

        instancer.0.report_error(Error::Discovery("catalog down".into()));
        settle().await;
        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(endpointer.endpoints().unwrap().len(), 1, "stale but available");

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(matches!(endpointer.endpoints(), Err(Error::Discovery(_))));
        assert_eq!(closed.lock().unwrap().get("a"), Some(&1));

        instancer.0.update(InstanceSet::new(["a"]));
        settle().await;
        assert_eq!(endpointer.endpoints().unwrap().len(), 1, "a good update repopulates");
    }
}
