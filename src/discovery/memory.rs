//! In-process registry.
//!
//! Backs static deployments and tests; every mutation bumps the change
//! index so watching instancers re-list.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::watch;

use crate::discovery::instance::{Health, Instance};
use crate::discovery::registry::{Query, Registry};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct State {
    instances: Vec<Instance>,
    failure: Option<String>,
}

/// A registry held entirely in memory.
#[derive(Debug)]
pub struct MemoryRegistry {
    state: Mutex<State>,
    index: watch::Sender<u64>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (index, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            index,
        }
    }

    /// Add an instance, replacing any with the same service and address.
    pub fn register(&self, instance: Instance) {
        self.mutate(|state| {
            state
                .instances
                .retain(|i| !(i.service == instance.service && i.address == instance.address));
            state.instances.push(instance);
        });
    }

    pub fn deregister(&self, service: &str, address: &str) {
        self.mutate(|state| {
            state
                .instances
                .retain(|i| !(i.service == service && i.address == address));
        });
    }

    pub fn set_health(&self, service: &str, address: &str, health: Health) {
        self.mutate(|state| {
            for i in state.instances.iter_mut() {
                if i.service == service && i.address == address {
                    i.health = health;
                }
            }
        });
    }

    /// Replace every instance of `service` at once.
    pub fn replace(&self, service: &str, instances: Vec<Instance>) {
        self.mutate(|state| {
            state.instances.retain(|i| i.service != service);
            state
                .instances
                .extend(instances.into_iter().filter(|i| i.service == service));
        });
    }

    /// Make `list` fail with `reason` until cleared with `None`.
    pub fn set_failure(&self, reason: Option<String>) {
        self.mutate(|state| state.failure = reason);
    }

    fn mutate(&self, f: impl FnOnce(&mut State)) {
        f(&mut self.lock());
        self.index.send_modify(|i| *i += 1);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Registry for MemoryRegistry {
    fn list<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Vec<Instance>>> {
        let res = {
            let state = self.lock();
            match &state.failure {
                Some(reason) => Err(Error::Discovery(reason.clone())),
                None => Ok(state
                    .instances
                    .iter()
                    .filter(|i| query.matches(i))
                    .cloned()
                    .collect()),
            }
        };
        futures_util::future::ready(res).boxed()
    }

    fn watch(&self, _service: &str) -> Result<watch::Receiver<u64>> {
        Ok(self.index.subscribe())
    }
}
