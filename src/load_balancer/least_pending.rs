//! Least-pending load balancing strategy.
//!
//! Snapshots every backend's in-flight request count, sorts, and returns the
//! smallest. The sort is stable, so ties go to the earliest registered
//! backend. O(n log n) per call.

use std::sync::Arc;

use crate::load_balancer::backend::BackendState;
use crate::load_balancer::PolicyError;

#[derive(Debug, Default)]
pub struct LeastPending {
    servers: Vec<Arc<BackendState>>,
}

impl LeastPending {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, backend: Arc<BackendState>) {
        self.servers.push(backend);
    }

    pub fn servers(&self) -> &[Arc<BackendState>] {
        &self.servers
    }

    pub fn pick(
        &self,
        eligible: impl Fn(&BackendState) -> bool,
    ) -> Result<Arc<BackendState>, PolicyError> {
        if self.servers.is_empty() {
            return Err(PolicyError::NoServers);
        }

        let mut snapshot: Vec<(usize, &Arc<BackendState>)> = self
            .servers
            .iter()
            .filter(|b| eligible(b))
            .map(|b| (b.pending(), b))
            .collect();
        snapshot.sort_by_key(|(pending, _)| *pending);

        snapshot
            .first()
            .map(|(_, backend)| Arc::clone(backend))
            .ok_or(PolicyError::NoLiveServers)
    }
}
