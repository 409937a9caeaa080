//! Backend pools.
//!
//! A pool is a named set of backends behind one routing policy. Pools are
//! rebuilt on every configuration generation, but the backends inside them
//! come from the shared registry, so counters, health and throttle state
//! carry over between generations.

use std::sync::Arc;

use crate::config::validation::{join_errors, validate_pool, ValidationError};
use crate::config::PoolConfig;
use crate::load_balancer::backend::BackendState;
use crate::load_balancer::context::RequestContext;
use crate::load_balancer::endpoint::Endpoint;
use crate::load_balancer::policy::{PolicyError, RoutingPolicy, ServerMeta};
use crate::load_balancer::registry::BackendRegistry;

/// Error building a pool from configuration.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{}", join_errors(.0))]
    Invalid(Vec<ValidationError>),
    #[error("pool `{pool}`: {source}")]
    Policy {
        pool: String,
        #[source]
        source: PolicyError,
    },
}

#[derive(Debug)]
pub struct Pool {
    name: String,
    policy: RoutingPolicy,
    /// Distinct members in registration order.
    servers: Vec<Arc<BackendState>>,
}

impl Pool {
    /// Build a pool, registering its servers in `registry`.
    pub fn build(config: &PoolConfig, registry: &BackendRegistry) -> Result<Self, PoolError> {
        let errors = validate_pool(config);
        if !errors.is_empty() {
            return Err(PoolError::Invalid(errors));
        }

        let mut policy = RoutingPolicy::from_config(&config.policy);
        let mut servers: Vec<Arc<BackendState>> = Vec::with_capacity(config.servers.len());

        for server in &config.servers {
            // validate_pool already parsed every server string
            let Ok(endpoint) = Endpoint::parse(&server.server) else {
                continue;
            };
            let backend = registry.get_or_insert(&endpoint);
            policy
                .add_server(backend.clone(), &ServerMeta::from(server))
                .map_err(|source| PoolError::Policy {
                    pool: config.name.clone(),
                    source,
                })?;
            if !servers.iter().any(|b| Arc::ptr_eq(b, &backend)) {
                servers.push(backend);
            }
        }

        if servers.is_empty() {
            tracing::warn!(pool = %config.name, "Pool has no servers; routes using it will fail");
        }

        tracing::debug!(
            pool = %config.name,
            policy = policy.name(),
            servers = servers.len(),
            "Pool built"
        );

        Ok(Self {
            name: config.name.clone(),
            policy,
            servers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    pub fn servers(&self) -> &[Arc<BackendState>] {
        &self.servers
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.servers.iter().map(|b| b.endpoint())
    }

    /// Select the backend for a request.
    pub fn select(&self, ctx: &RequestContext) -> Result<Arc<BackendState>, PolicyError> {
        self.policy.next(ctx)
    }

    /// Select a backend not yet tried by this request (failover).
    pub fn select_excluding(
        &self,
        ctx: &RequestContext,
        tried: &[Endpoint],
    ) -> Result<Arc<BackendState>, PolicyError> {
        self.policy.next_excluding(ctx, tried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyConfig, ServerConfig};

    fn config(name: &str, policy: PolicyConfig, servers: &[(&str, u32)]) -> PoolConfig {
        PoolConfig {
            name: name.into(),
            policy,
            servers: servers
                .iter()
                .map(|(s, w)| ServerConfig { server: s.to_string(), weight: *w })
                .collect(),
        }
    }

    #[test]
    fn pools_share_backend_state() {
        let registry = BackendRegistry::default();
        let a = Pool::build(
            &config("a", PolicyConfig::RoundRobin, &[("http://127.0.0.1:3000", 1)]),
            &registry,
        )
        .unwrap();
        let b = Pool::build(
            &config("b", PolicyConfig::LeastPending, &[("127.0.0.1:3000", 1), ("127.0.0.1:3001", 1)]),
            &registry,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&a.servers()[0], &b.servers()[0]));
    }

    #[test]
    fn weighted_members_listed_once() {
        let registry = BackendRegistry::default();
        let pool = Pool::build(
            &config("w", PolicyConfig::WeightedRoundRobin, &[("127.0.0.1:1", 3), ("127.0.0.1:2", 1)]),
            &registry,
        )
        .unwrap();
        assert_eq!(pool.servers().len(), 2);
        assert_eq!(pool.endpoints().count(), 2);
    }

    #[test]
    fn invalid_pool_rejected() {
        let registry = BackendRegistry::default();
        let err = Pool::build(
            &config("bad", PolicyConfig::RoundRobin, &[("https://secure:443", 1)]),
            &registry,
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::Invalid(_)));
        assert!(registry.is_empty());
    }
}
