//! Weighted round-robin strategy.
//!
//! A backend with weight `w` occupies `w` consecutive slots of the underlying
//! round-robin ring. Selection stays O(1); memory is O(sum of weights).

use std::sync::Arc;

use crate::load_balancer::backend::BackendState;
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::PolicyError;

/// Largest accepted weight. Bounds the ring at `MAX_WEIGHT` slots per server.
pub const MAX_WEIGHT: u32 = 1000;

#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    inner: RoundRobin,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `backend` into the ring `weight` times.
    pub fn add(&mut self, backend: Arc<BackendState>, weight: u32) -> Result<(), PolicyError> {
        if weight == 0 || weight > MAX_WEIGHT {
            return Err(PolicyError::InvalidWeight {
                endpoint: backend.endpoint().clone(),
            });
        }
        for _ in 0..weight {
            self.inner.add(backend.clone());
        }
        Ok(())
    }

    /// Ring length (sum of weights).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn members(&self) -> &[Arc<BackendState>] {
        self.inner.members()
    }

    pub fn pick(
        &self,
        eligible: impl Fn(&BackendState) -> bool,
    ) -> Result<Arc<BackendState>, PolicyError> {
        self.inner.pick(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::endpoint::Endpoint;
    use std::time::Duration;

    fn backend(port: u16) -> Arc<BackendState> {
        Arc::new(BackendState::new(Endpoint::new("127.0.0.1", port), Duration::from_secs(60)))
    }

    #[test]
    fn weight_three_to_one() {
        let mut lb = WeightedRoundRobin::new();
        let (a, b) = (backend(9000), backend(9001));
        lb.add(a.clone(), 3).unwrap();
        lb.add(b.clone(), 1).unwrap();
        assert_eq!(lb.len(), 4);

        let picks: Vec<_> = (0..8)
            .map(|_| lb.pick(|_| true).unwrap().endpoint().port())
            .collect();
        assert_eq!(picks, vec![9000, 9000, 9000, 9001, 9000, 9000, 9000, 9001]);
    }

    #[test]
    fn zero_weight_rejected() {
        let mut lb = WeightedRoundRobin::new();
        assert!(matches!(
            lb.add(backend(9000), 0),
            Err(PolicyError::InvalidWeight { .. })
        ));
        assert!(lb.is_empty());
    }

    #[test]
    fn oversized_weight_rejected() {
        let mut lb = WeightedRoundRobin::new();
        assert!(lb.add(backend(9000), MAX_WEIGHT).is_ok());
        assert!(matches!(
            lb.add(backend(9001), u32::MAX),
            Err(PolicyError::InvalidWeight { .. })
        ));
        assert_eq!(lb.len(), MAX_WEIGHT as usize);
    }
}
