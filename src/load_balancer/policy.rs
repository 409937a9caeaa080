//! The closed set of routing policies behind one interface.

use std::sync::Arc;

use crate::config::{PolicyConfig, ServerConfig};
use crate::load_balancer::backend::BackendState;
use crate::load_balancer::context::RequestContext;
use crate::load_balancer::endpoint::Endpoint;
use crate::load_balancer::ip_hash::IpHash;
use crate::load_balancer::least_pending::LeastPending;
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::weighted::WeightedRoundRobin;

/// Selection failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The policy has no registered servers. Fatal for the route until the
    /// configuration is repaired.
    #[error("no servers added")]
    NoServers,
    /// Servers exist but every one is failed or excluded.
    #[error("no live servers")]
    NoLiveServers,
    #[error("weight for {endpoint} must be between 1 and {}", crate::load_balancer::weighted::MAX_WEIGHT)]
    InvalidWeight { endpoint: Endpoint },
}

/// Per-server registration metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerMeta {
    pub weight: u32,
}

impl Default for ServerMeta {
    fn default() -> Self {
        Self { weight: 1 }
    }
}

impl From<&ServerConfig> for ServerMeta {
    fn from(config: &ServerConfig) -> Self {
        Self {
            weight: config.weight,
        }
    }
}

/// Routing policy.
///
/// Registration (`add_server`) takes `&mut self` and only happens while a
/// pool is being built; selection takes `&self` and is safe to call from any
/// number of sessions at once.
#[derive(Debug)]
pub enum RoutingPolicy {
    RoundRobin(RoundRobin),
    WeightedRoundRobin(WeightedRoundRobin),
    IpHash(IpHash),
    LeastPending(LeastPending),
}

impl RoutingPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        match config {
            PolicyConfig::RoundRobin => RoutingPolicy::RoundRobin(RoundRobin::new()),
            PolicyConfig::WeightedRoundRobin => {
                RoutingPolicy::WeightedRoundRobin(WeightedRoundRobin::new())
            }
            PolicyConfig::IpHash { key } => RoutingPolicy::IpHash(IpHash::new(*key)),
            PolicyConfig::LeastPending => RoutingPolicy::LeastPending(LeastPending::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RoutingPolicy::RoundRobin(_) => "round_robin",
            RoutingPolicy::WeightedRoundRobin(_) => "weighted_round_robin",
            RoutingPolicy::IpHash(_) => "ip_hash",
            RoutingPolicy::LeastPending(_) => "least_pending",
        }
    }

    /// Register a server. Weight only matters to the weighted policy, which
    /// rejects zero.
    pub fn add_server(
        &mut self,
        backend: Arc<BackendState>,
        meta: &ServerMeta,
    ) -> Result<(), PolicyError> {
        match self {
            RoutingPolicy::RoundRobin(p) => p.add(backend),
            RoutingPolicy::WeightedRoundRobin(p) => p.add(backend, meta.weight)?,
            RoutingPolicy::IpHash(p) => p.add(backend),
            RoutingPolicy::LeastPending(p) => p.add(backend),
        }
        Ok(())
    }

    /// Pick the backend for the next request among live servers.
    pub fn next(&self, ctx: &RequestContext) -> Result<Arc<BackendState>, PolicyError> {
        self.pick(ctx, |b| b.is_live())
    }

    /// Like [`next`](Self::next) but never returns an endpoint in `tried`.
    pub fn next_excluding(
        &self,
        ctx: &RequestContext,
        tried: &[Endpoint],
    ) -> Result<Arc<BackendState>, PolicyError> {
        self.pick(ctx, |b| b.is_live() && !tried.contains(b.endpoint()))
    }

    fn pick(
        &self,
        ctx: &RequestContext,
        eligible: impl Fn(&BackendState) -> bool,
    ) -> Result<Arc<BackendState>, PolicyError> {
        match self {
            RoutingPolicy::RoundRobin(p) => p.pick(eligible),
            RoutingPolicy::WeightedRoundRobin(p) => p.pick(eligible),
            RoutingPolicy::IpHash(p) => p.pick(ctx, eligible),
            RoutingPolicy::LeastPending(p) => p.pick(eligible),
        }
    }

    /// Take `endpoint` out of rotation. Health is per backend, so this
    /// affects every pool sharing it.
    pub fn mark_failed(&self, endpoint: &Endpoint) {
        if let Some(backend) = self.find(endpoint) {
            backend.mark_failed();
        }
    }

    /// Return `endpoint` to rotation.
    pub fn mark_live(&self, endpoint: &Endpoint) {
        if let Some(backend) = self.find(endpoint) {
            backend.mark_live();
        }
    }

    fn find(&self, endpoint: &Endpoint) -> Option<&Arc<BackendState>> {
        match self {
            RoutingPolicy::RoundRobin(p) => p.members().iter().find(|b| b.endpoint() == endpoint),
            RoutingPolicy::WeightedRoundRobin(p) => {
                p.members().iter().find(|b| b.endpoint() == endpoint)
            }
            RoutingPolicy::IpHash(p) => p.servers().iter().find(|b| b.endpoint() == endpoint),
            RoutingPolicy::LeastPending(p) => {
                p.servers().iter().find(|b| b.endpoint() == endpoint)
            }
        }
    }
}
