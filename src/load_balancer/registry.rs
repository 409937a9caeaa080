//! Backend registry.
//!
//! # Responsibilities
//! - Guarantee one [`BackendState`] per distinct endpoint, across every pool,
//!   route and configuration generation
//! - Prune backends no longer referenced after a reload
//!
//! # Design Decisions
//! - Sharded concurrent map; lookups never take a global lock
//! - Pruning only drops the registry's reference: sessions still holding the
//!   `Arc` keep their backend's counters and gate alive until they close

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::load_balancer::backend::BackendState;
use crate::load_balancer::endpoint::Endpoint;

#[derive(Debug)]
pub struct BackendRegistry {
    backends: DashMap<Endpoint, Arc<BackendState>>,
    cooldown_ms: AtomicU64,
}

impl BackendRegistry {
    /// `cooldown` is applied to every backend created by this registry.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            backends: DashMap::new(),
            cooldown_ms: AtomicU64::new(cooldown.as_millis() as u64),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms.load(Ordering::Relaxed))
    }

    /// Change the passive cooldown of every current and future backend.
    pub fn set_cooldown(&self, cooldown: Duration) {
        self.cooldown_ms
            .store(cooldown.as_millis() as u64, Ordering::Relaxed);
        for entry in self.backends.iter() {
            entry.value().set_cooldown(cooldown);
        }
    }

    /// Return the shared state for `endpoint`, creating it on first use.
    pub fn get_or_insert(&self, endpoint: &Endpoint) -> Arc<BackendState> {
        if let Some(existing) = self.backends.get(endpoint) {
            return existing.clone();
        }
        self.backends
            .entry(endpoint.clone())
            .or_insert_with(|| {
                tracing::debug!(endpoint = %endpoint, "Backend registered");
                Arc::new(BackendState::new(endpoint.clone(), self.cooldown()))
            })
            .clone()
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<BackendState>> {
        self.backends.get(endpoint).map(|b| b.clone())
    }

    /// Drop every backend whose endpoint is not in `live`.
    pub fn retain(&self, live: &HashSet<Endpoint>) {
        self.backends.retain(|endpoint, _| {
            let keep = live.contains(endpoint);
            if !keep {
                tracing::debug!(endpoint = %endpoint, "Backend unregistered");
            }
            keep
        });
    }

    /// Snapshot of all registered backends.
    pub fn all(&self) -> Vec<Arc<BackendState>> {
        self.backends.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
