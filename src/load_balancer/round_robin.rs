//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use crate::load_balancer::LoadBalancer;

/// Round-robin selector.
/// Stores a monotonic counter to rotate through endpoints.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(count % len)
    }
}
