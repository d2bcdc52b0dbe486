//! Instancers publish the live instance set of one service.
//!
//! # Responsibilities
//! - Push the full current [`InstanceSet`] to every subscriber on change
//! - Report registry errors without discarding the last good set
//! - Keep a registry watch alive, reconnecting with backoff
//!
//! # Design Decisions
//! - Replace-the-set semantics; subscribers never see incremental diffs
//! - Subscribers that fall behind observe only the most recent event
//! - The registry watch task stops on [`Shutdown`] or when dropped

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::discovery::instance::InstanceSet;
use crate::discovery::registry::{Query, Registry};
use crate::error::Error;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;

const RECONNECT_BASE: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

/// State published to subscribers.
#[derive(Debug, Clone, Default)]
pub struct Event {
    /// The last known-good instance set.
    pub instances: InstanceSet,
    /// Set while the registry is failing; `instances` is then stale.
    pub error: Option<Error>,
}

/// Anything that publishes instance events.
pub trait Instancer: Send + Sync {
    fn subscribe(&self) -> Subscription;
}

/// A subscriber's view of an instancer.
#[derive(Debug, Clone)]
pub struct Subscription {
    rx: watch::Receiver<Event>,
}

impl Subscription {
    /// The most recent event.
    pub fn current(&self) -> Event {
        self.rx.borrow().clone()
    }

    /// Wait for the next event. `None` once the instancer is gone.
    pub async fn changed(&mut self) -> Option<Event> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Fan-out point shared by instancer implementations.
#[derive(Debug)]
pub struct Broadcaster {
    tx: watch::Sender<Event>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Event::default());
        Self { tx }
    }

    /// Publish a fresh set. Clears any error; an unchanged set with no
    /// pending error notifies nobody.
    pub fn update(&self, instances: InstanceSet) {
        self.tx.send_if_modified(|event| {
            if event.error.is_none() && event.instances == instances {
                return false;
            }
            event.instances = instances;
            event.error = None;
            true
        });
    }

    /// Publish a registry failure, keeping the previous set.
    pub fn report_error(&self, error: Error) {
        self.tx.send_modify(|event| event.error = Some(error));
    }

    pub fn current(&self) -> Event {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// Publishes a constant instance set.
#[derive(Debug)]
pub struct FixedInstancer {
    broadcaster: Broadcaster,
}

impl FixedInstancer {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broadcaster = Broadcaster::new();
        broadcaster.update(InstanceSet::new(addresses));
        Self { broadcaster }
    }
}

impl Instancer for FixedInstancer {
    fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }
}

/// Tracks one registry query in a background task.
#[derive(Debug)]
pub struct RegistryInstancer {
    broadcaster: Arc<Broadcaster>,
    task: JoinHandle<()>,
}

impl RegistryInstancer {
    /// List once, publish the result, then follow the registry's change
    /// notifications until `shutdown` fires or the instancer is dropped.
    pub async fn spawn(registry: Arc<dyn Registry>, query: Query, shutdown: &Shutdown) -> Self {
        let broadcaster = Arc::new(Broadcaster::new());
        refresh(registry.as_ref(), &query, &broadcaster).await;

        let task = tokio::spawn(watch_loop(registry, query, broadcaster.clone(), shutdown.signalled()));
        Self { broadcaster, task }
    }

    pub fn current(&self) -> Event {
        self.broadcaster.current()
    }

    /// Stop following the registry. Subscribers keep the last event.
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Instancer for RegistryInstancer {
    fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }
}

impl Drop for RegistryInstancer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn refresh(registry: &dyn Registry, query: &Query, broadcaster: &Broadcaster) {
    match registry.list(query).await {
        Ok(instances) => {
            let set: InstanceSet = instances.into_iter().map(|i| i.address).collect();
            metrics::record_instances(&query.service, set.len());
            tracing::debug!(service = %query.service, instances = set.len(), "Registry listed");
            broadcaster.update(set);
        }
        Err(e) => {
            tracing::warn!(service = %query.service, error = %e, "Registry list failed, keeping last instances");
            broadcaster.report_error(e);
        }
    }
}

async fn watch_loop(
    registry: Arc<dyn Registry>,
    query: Query,
    broadcaster: Arc<Broadcaster>,
    stopped: impl Future<Output = ()>,
) {
    tokio::pin!(stopped);

    let mut failures = 0u32;
    loop {
        match registry.watch(&query.service) {
            Ok(mut changes) => {
                failures = 0;
                // Catch anything that changed while we were not watching.
                refresh(registry.as_ref(), &query, &broadcaster).await;
                loop {
                    tokio::select! {
                        _ = &mut stopped => {
                            tracing::info!(service = %query.service, "Instancer stopped");
                            return;
                        }
                        changed = changes.changed() => match changed {
                            Ok(()) => refresh(registry.as_ref(), &query, &broadcaster).await,
                            Err(_) => {
                                broadcaster.report_error(Error::Discovery("registry watch closed".into()));
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(service = %query.service, error = %e, "Registry watch failed");
                broadcaster.report_error(e);
            }
        }

        failures += 1;
        let delay = calculate_backoff(failures, RECONNECT_BASE, RECONNECT_MAX);
        tokio::select! {
            _ = &mut stopped => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
