//! Uniform random load balancing strategy.

use crate::load_balancer::LoadBalancer;

/// Picks a uniformly random endpoint per call.
#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for Random {
    fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(fastrand::usize(..len))
    }
}
