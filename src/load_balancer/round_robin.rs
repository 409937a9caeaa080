//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::backend::BackendState;
use crate::load_balancer::PolicyError;

/// Round-robin selector.
///
/// Rotates through a ring in registration order. The atomic cursor plays the
/// part of popping the front and re-appending it, so selection is O(1) and
/// needs only `&self`.
#[derive(Debug, Default)]
pub struct RoundRobin {
    ring: Vec<Arc<BackendState>>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend to the ring.
    pub fn add(&mut self, backend: Arc<BackendState>) {
        self.ring.push(backend);
    }

    /// Ring length, counting repeated entries.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Ring contents in rotation order.
    pub fn members(&self) -> &[Arc<BackendState>] {
        &self.ring
    }

    /// Next eligible backend in rotation.
    pub fn pick(
        &self,
        eligible: impl Fn(&BackendState) -> bool,
    ) -> Result<Arc<BackendState>, PolicyError> {
        if self.ring.is_empty() {
            return Err(PolicyError::NoServers);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let len = self.ring.len();

        for i in 0..len {
            let backend = &self.ring[(start + i) % len];
            if eligible(backend) {
                return Ok(backend.clone());
            }
        }
        Err(PolicyError::NoLiveServers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::endpoint::Endpoint;
    use std::collections::HashSet;
    use std::time::Duration;

    fn backend(port: u16) -> Arc<BackendState> {
        Arc::new(BackendState::new(Endpoint::new("127.0.0.1", port), Duration::from_secs(60)))
    }

    #[test]
    fn test_round_robin() {
        let mut lb = RoundRobin::new();
        let (a, b, c) = (backend(8080), backend(8081), backend(8082));
        lb.add(a.clone());
        lb.add(b.clone());
        lb.add(c.clone());

        let picks: Vec<_> = (0..4).map(|_| lb.pick(|b| b.is_live()).unwrap()).collect();
        let first_three: HashSet<_> = picks[..3].iter().map(|b| b.endpoint().clone()).collect();
        assert_eq!(first_three.len(), 3);
        assert_eq!(picks[0].endpoint(), a.endpoint());
        assert_eq!(picks[3].endpoint(), picks[0].endpoint());
    }

    #[test]
    fn skips_failed_backends() {
        let mut lb = RoundRobin::new();
        let (a, b) = (backend(8080), backend(8081));
        lb.add(a.clone());
        lb.add(b.clone());
        a.mark_failed();

        for _ in 0..3 {
            assert_eq!(lb.pick(|b| b.is_live()).unwrap().endpoint(), b.endpoint());
        }
        b.mark_failed();
        assert_eq!(lb.pick(|b| b.is_live()).unwrap_err(), PolicyError::NoLiveServers);
    }

    #[test]
    fn empty_ring_has_no_servers() {
        let lb = RoundRobin::new();
        assert_eq!(lb.pick(|_| true).unwrap_err(), PolicyError::NoServers);
    }
}
