//! Semantic validation of a parsed configuration.
//!
//! Errors are scoped so a reload can reject just the offending pool or route
//! and keep serving everything else. Only [`Scope::Global`] errors reject a
//! whole configuration.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{PolicyConfig, PoolConfig, ProxyConfig, RouteConfig};
use crate::load_balancer::endpoint::Endpoint;
use crate::load_balancer::weighted::MAX_WEIGHT;

/// What part of the configuration an error applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Global,
    Pool(String),
    Route(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "config"),
            Scope::Pool(name) => write!(f, "pool `{}`", name),
            Scope::Route(name) => write!(f, "route `{}`", name),
        }
    }
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{scope}: {message}")]
pub struct ValidationError {
    pub scope: Scope,
    pub message: String,
}

impl ValidationError {
    fn global(message: impl Into<String>) -> Self {
        Self { scope: Scope::Global, message: message.into() }
    }

    fn pool(name: &str, message: impl Into<String>) -> Self {
        Self { scope: Scope::Pool(name.to_string()), message: message.into() }
    }

    fn route(name: &str, message: impl Into<String>) -> Self {
        Self { scope: Scope::Route(name.to_string()), message: message.into() }
    }

    /// True if this error invalidates the whole configuration.
    pub fn is_global(&self) -> bool {
        self.scope == Scope::Global
    }
}

pub(crate) fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validate every section, returning all errors found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = validate_settings(config);

    let mut seen = HashSet::new();
    for pool in &config.pools {
        if !seen.insert(pool.name.as_str()) {
            errors.push(ValidationError::pool(&pool.name, "duplicate pool name, first definition wins"));
            continue;
        }
        errors.extend(validate_pool(pool));
    }

    for route in &config.routes {
        errors.extend(validate_route(route, &seen));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Checks on settings that apply to every pool and route.
pub fn validate_settings(config: &ProxyConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let session = &config.session;

    if session.high_watermark == 0 {
        errors.push(ValidationError::global("session.high_watermark must be > 0"));
    }
    if session.low_watermark >= session.high_watermark {
        errors.push(ValidationError::global(
            "session.low_watermark must be below session.high_watermark",
        ));
    }
    if session.flush_batch == 0 {
        errors.push(ValidationError::global("session.flush_batch must be > 0"));
    }
    if session.connect_timeout_secs == 0 {
        errors.push(ValidationError::global("session.connect_timeout_secs must be > 0"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::global("listener.max_connections must be > 0"));
    }
    if config.health_check.enabled && config.health_check.interval_secs == 0 {
        errors.push(ValidationError::global("health_check.interval_secs must be > 0"));
    }

    errors
}

/// Checks on a single pool definition.
pub fn validate_pool(pool: &PoolConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if pool.name.trim().is_empty() {
        errors.push(ValidationError::pool(&pool.name, "name must not be empty"));
    }

    for server in &pool.servers {
        if let Err(e) = Endpoint::parse(&server.server) {
            errors.push(ValidationError::pool(&pool.name, e.to_string()));
        }
        if pool.policy == PolicyConfig::WeightedRoundRobin
            && !(1..=MAX_WEIGHT).contains(&server.weight)
        {
            errors.push(ValidationError::pool(
                &pool.name,
                format!(
                    "server `{}` weight must be between 1 and {}",
                    server.server, MAX_WEIGHT
                ),
            ));
        }
    }

    errors
}

/// Checks on a single route definition against the set of known pool names.
pub fn validate_route(route: &RouteConfig, pools: &HashSet<&str>) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if route.name.trim().is_empty() {
        errors.push(ValidationError::route(&route.name, "name must not be empty"));
    }
    if route.bind.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::route(
            &route.name,
            format!("bind `{}` is not a socket address", route.bind),
        ));
    }
    if !pools.contains(route.pool.as_str()) {
        errors.push(ValidationError::route(
            &route.name,
            format!("unknown pool `{}`", route.pool),
        ));
    }
    if let Some(prefix) = &route.path_prefix {
        if !prefix.starts_with('/') {
            errors.push(ValidationError::route(&route.name, "path_prefix must start with `/`"));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ServerConfig;

    fn pool(name: &str, servers: &[&str]) -> PoolConfig {
        PoolConfig {
            name: name.into(),
            policy: PolicyConfig::RoundRobin,
            servers: servers
                .iter()
                .map(|s| ServerConfig { server: s.to_string(), weight: 1 })
                .collect(),
        }
    }

    fn route(name: &str, bind: &str, pool: &str) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            bind: bind.into(),
            host: None,
            path_prefix: None,
            pool: pool.into(),
            priority: 0,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn errors_are_scoped_to_pool_and_route() {
        let mut config = ProxyConfig::default();
        config.pools.push(pool("good", &["http://127.0.0.1:3000"]));
        config.pools.push(pool("bad", &["ftp://"]));
        config.routes.push(route("ok", "127.0.0.1:8080", "good"));
        config.routes.push(route("orphan", "127.0.0.1:8080", "missing"));
        config.routes.push(route("badbind", "localhost", "good"));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.scope == Scope::Pool("bad".into())));
        assert!(errors.iter().any(|e| e.scope == Scope::Route("orphan".into())));
        assert!(errors.iter().any(|e| e.scope == Scope::Route("badbind".into())));
        assert!(errors.iter().all(|e| !e.is_global()));
    }

    #[test]
    fn zero_weight_rejected_for_weighted_pools() {
        let mut p = pool("w", &["127.0.0.1:3000"]);
        p.policy = PolicyConfig::WeightedRoundRobin;
        p.servers[0].weight = 0;
        assert_eq!(validate_pool(&p).len(), 1);

        p.policy = PolicyConfig::RoundRobin;
        assert!(validate_pool(&p).is_empty());
    }

    #[test]
    fn oversized_weight_rejects_only_its_pool() {
        let mut config = ProxyConfig::default();
        let mut heavy = pool("heavy", &["127.0.0.1:3000"]);
        heavy.policy = PolicyConfig::WeightedRoundRobin;
        heavy.servers[0].weight = u32::MAX;
        config.pools.push(heavy);
        config.pools.push(pool("light", &["127.0.0.1:3001"]));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].scope, Scope::Pool("heavy".into()));

        config.pools[0].servers[0].weight = MAX_WEIGHT;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn watermarks_must_be_ordered() {
        let mut config = ProxyConfig::default();
        config.session.low_watermark = config.session.high_watermark;
        let errors = validate_settings(&config);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_global());
    }

    #[test]
    fn duplicate_pool_names_reported() {
        let mut config = ProxyConfig::default();
        config.pools.push(pool("web", &["127.0.0.1:3000"]));
        config.pools.push(pool("web", &["127.0.0.1:3001"]));
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("duplicate"));
    }
}
