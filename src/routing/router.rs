//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Compile route and pool configuration into an immutable table
//! - Look up the matching route for a request head on a given bind address
//! - Carry over the previous generation's pool or route when its new
//!   definition is rejected
//!
//! # Design Decisions
//! - Immutable after construction, swapped atomically on reload
//! - O(n) scan per bind address (acceptable for typical route counts)
//! - Highest priority first, configuration order breaks ties
//! - Explicit `None` rather than a silent default route

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::http::request::Parts;

use crate::config::validation::{join_errors, validate_route, ValidationError};
use crate::config::{ProxyConfig, RouteConfig};
use crate::load_balancer::endpoint::Endpoint;
use crate::load_balancer::pool::{Pool, PoolError};
use crate::load_balancer::registry::BackendRegistry;
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};

/// A definition rejected while building a route table.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("{}", join_errors(.0))]
    Route(Vec<ValidationError>),
    #[error("pool `{0}` defined more than once, first definition wins")]
    DuplicatePool(String),
}

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    name: String,
    bind: SocketAddr,
    matcher: AndMatcher,
    pool: Arc<Pool>,
    priority: u32,
}

impl Route {
    fn compile(config: &RouteConfig, bind: SocketAddr, pool: Arc<Pool>) -> Self {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &config.host {
            matchers.push(Box::new(HostMatcher::new(host.clone())));
        }
        if let Some(prefix) = &config.path_prefix {
            matchers.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
        }

        Self {
            name: config.name.clone(),
            bind,
            matcher: AndMatcher::new(matchers),
            pool,
            priority: config.priority,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind(&self) -> SocketAddr {
        self.bind
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn matches(&self, head: &Parts) -> bool {
        self.matcher.matches(head)
    }
}

/// One configuration generation of routes and pools.
#[derive(Debug, Default)]
pub struct RouteTable {
    generation: u64,
    routes: Vec<Arc<Route>>,
    pools: HashMap<String, Arc<Pool>>,
}

impl RouteTable {
    /// Table with no routes; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from `config`.
    ///
    /// Every rejected pool or route is reported. If `previous` had a
    /// definition under the same name, that definition stays in service;
    /// otherwise the name is simply absent from the new table.
    pub fn build(
        config: &ProxyConfig,
        registry: &BackendRegistry,
        previous: Option<&RouteTable>,
    ) -> (RouteTable, Vec<BuildError>) {
        let mut errors = Vec::new();
        let mut pools: HashMap<String, Arc<Pool>> = HashMap::new();

        for pool_config in &config.pools {
            if pools.contains_key(&pool_config.name) {
                errors.push(BuildError::DuplicatePool(pool_config.name.clone()));
                continue;
            }
            match Pool::build(pool_config, registry) {
                Ok(pool) => {
                    pools.insert(pool_config.name.clone(), Arc::new(pool));
                }
                Err(e) => {
                    tracing::warn!(pool = %pool_config.name, error = %e, "Pool rejected");
                    if let Some(kept) = previous.and_then(|p| p.pools.get(&pool_config.name)) {
                        tracing::info!(pool = %pool_config.name, "Keeping previous pool definition");
                        pools.insert(pool_config.name.clone(), kept.clone());
                    }
                    errors.push(e.into());
                }
            }
        }

        let pool_names: HashSet<&str> = pools.keys().map(String::as_str).collect();
        let mut routes = Vec::with_capacity(config.routes.len());

        for route_config in &config.routes {
            let problems = validate_route(route_config, &pool_names);
            let bind = route_config.bind.parse::<SocketAddr>();
            let compiled = match (problems.is_empty(), bind, pools.get(&route_config.pool)) {
                (true, Ok(bind), Some(pool)) => {
                    Some(Arc::new(Route::compile(route_config, bind, pool.clone())))
                }
                _ => None,
            };
            match compiled {
                Some(route) => routes.push(route),
                None => {
                    tracing::warn!(
                        route = %route_config.name,
                        error = %join_errors(&problems),
                        "Route rejected"
                    );
                    if let Some(kept) = previous.and_then(|p| p.route(&route_config.name)) {
                        tracing::info!(route = %route_config.name, "Keeping previous route definition");
                        routes.push(kept);
                    }
                    errors.push(BuildError::Route(problems));
                }
            }
        }

        // stable sort keeps configuration order within a priority
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));

        let table = RouteTable {
            generation: previous.map_or(1, |p| p.generation + 1),
            routes,
            pools,
        };
        (table, errors)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// First route on `bind` whose conditions all match.
    pub fn lookup_route(&self, bind: SocketAddr, head: &Parts) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.bind == bind && route.matches(head))
            .cloned()
    }

    pub fn route(&self, name: &str) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.name == name).cloned()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn pool(&self, name: &str) -> Option<&Arc<Pool>> {
        self.pools.get(name)
    }

    /// Distinct bind addresses in use.
    pub fn binds(&self) -> HashSet<SocketAddr> {
        self.routes.iter().map(|r| r.bind).collect()
    }

    /// Every endpoint referenced by a pool or by a kept route's pool.
    pub fn endpoints(&self) -> HashSet<Endpoint> {
        self.pools
            .values()
            .chain(self.routes.iter().map(|r| &r.pool))
            .flat_map(|pool| pool.endpoints().cloned())
            .collect()
    }
}
