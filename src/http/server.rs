//! Proxy server: listeners, dispatch and reload.
//!
//! # Responsibilities
//! - Bind one listener per distinct route `bind` address
//! - Negotiate each connection's protocol and serve it with hyper
//! - Dispatch every request head: route lookup, backend selection, session
//!   pair spawn
//! - Publish new route table generations on reload and reconcile listeners
//! - Drain connections on shutdown with a deadline
//!
//! # Design Decisions
//! - The route table and session settings live behind `ArcSwap`; requests
//!   load them once per head and never block a reload
//! - Listeners are keyed by configured bind address, so a reload only
//!   touches the addresses that appeared or disappeared
//! - TLS material is loaded once at startup

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::config::validation::{join_errors, validate_settings};
use crate::config::{HealthCheckConfig, ListenerConfig, ProxyConfig};
use crate::health::HealthMonitor;
use crate::http::response::error_response;
use crate::lifecycle::Shutdown;
use crate::load_balancer::{BackendRegistry, PolicyError, RequestContext};
use crate::net::negotiator::stopped;
use crate::net::{
    load_tls_acceptor, serve, sniff_cleartext, ConnectionGuard, ConnectionPermit,
    ConnectionTracker, Listener, ListenerError, Protocol, TlsError,
};
use crate::observability::metrics;
use crate::routing::RouteTable;
use crate::session::upstream::{self, UpstreamRequest};
use crate::session::{ProxyBody, SessionSettings};

/// Error starting the proxy server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// State shared by every listener and connection.
#[derive(Debug)]
struct Shared {
    routes: ArcSwap<RouteTable>,
    settings: ArcSwap<SessionSettings>,
    registry: Arc<BackendRegistry>,
}

struct ListenerHandle {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ProxyServer {
    shared: Arc<Shared>,
    listener_config: ListenerConfig,
    health_config: HealthCheckConfig,
    tls: Option<TlsAcceptor>,
    listeners: HashMap<SocketAddr, ListenerHandle>,
    tracker: ConnectionTracker,
    /// Stops background tasks owned by the server.
    halt: Shutdown,
}

impl ProxyServer {
    /// Build the first route table generation and load TLS material.
    ///
    /// Rejected pools and routes are logged and left out; nothing is bound
    /// until [`start`](Self::start).
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(
            config.health_check.passive_cooldown_secs,
        )));
        let (table, errors) = RouteTable::build(&config, &registry, None);
        for error in &errors {
            tracing::error!(error = %error, "Configuration entry rejected");
        }

        let tls = config
            .listener
            .tls
            .as_ref()
            .map(load_tls_acceptor)
            .transpose()?;

        tracing::info!(
            routes = table.routes().len(),
            backends = registry.len(),
            "Route table generation {} built",
            table.generation()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                routes: ArcSwap::from_pointee(table),
                settings: ArcSwap::from_pointee(SessionSettings::from(&config.session)),
                registry,
            }),
            listener_config: config.listener,
            health_config: config.health_check,
            tls,
            listeners: HashMap::new(),
            tracker: ConnectionTracker::new(),
            halt: Shutdown::new(),
        })
    }

    /// Bind every route address and start health checks.
    ///
    /// Fails on the first address that cannot be bound.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        let errors = self.reconcile_listeners().await;
        if let Some(error) = errors.into_iter().next() {
            return Err(error.into());
        }

        if self.health_config.enabled {
            let monitor = HealthMonitor::new(self.shared.registry.clone(), self.health_config.clone());
            tokio::spawn(monitor.run(self.halt.subscribe()));
        }
        Ok(())
    }

    /// Apply a reloaded configuration.
    ///
    /// The new generation is published before listeners are reconciled, so
    /// a newly bound listener only ever serves the routes that caused it.
    pub async fn on_config_changed(&mut self, config: ProxyConfig) {
        let fatal = validate_settings(&config);
        if !fatal.is_empty() {
            tracing::error!(error = %join_errors(&fatal), "Configuration reload rejected");
            metrics::record_config_reload(false);
            return;
        }

        let previous = self.shared.routes.load_full();
        let (table, errors) = RouteTable::build(&config, &self.shared.registry, Some(&previous));
        for error in &errors {
            tracing::error!(error = %error, "Configuration entry rejected, keeping previous version");
        }

        let live = table.endpoints();
        let generation = table.generation();
        self.shared.routes.store(Arc::new(table));
        self.shared
            .settings
            .store(Arc::new(SessionSettings::from(&config.session)));
        self.shared.registry.retain(&live);
        self.shared.registry.set_cooldown(Duration::from_secs(
            config.health_check.passive_cooldown_secs,
        ));

        self.listener_config.max_connections = config.listener.max_connections;
        self.listener_config.h2c_prior_knowledge = config.listener.h2c_prior_knowledge;
        self.listener_config.shutdown_grace_secs = config.listener.shutdown_grace_secs;

        let bind_errors = self.reconcile_listeners().await;
        for error in &bind_errors {
            tracing::error!(error = %error, "Listener could not be started");
        }

        metrics::record_config_reload(errors.is_empty() && bind_errors.is_empty());
        tracing::info!(
            generation,
            backends = self.shared.registry.len(),
            listeners = self.listeners.len(),
            "Configuration reloaded"
        );
    }

    /// Serve until `shutdown` fires, applying configurations from `updates`.
    pub async fn run(mut self, mut updates: mpsc::UnboundedReceiver<ProxyConfig>, shutdown: Shutdown) {
        let mut watching = true;
        loop {
            tokio::select! {
                update = updates.recv(), if watching => match update {
                    Some(config) => self.on_config_changed(config).await,
                    None => watching = false,
                },
                _ = shutdown.wait() => break,
            }
        }
        self.stop().await;
    }

    /// Stop accepting, ask every connection to finish, and wait for them up
    /// to `listener.shutdown_grace_secs`.
    pub async fn stop(mut self) {
        tracing::info!(connections = self.tracker.active_count(), "Shutting down");
        self.halt.trigger();
        for (_, listener) in self.listeners.drain() {
            listener.stop.send_replace(true);
        }

        let grace = Duration::from_secs(self.listener_config.shutdown_grace_secs);
        if !self.tracker.wait_for_drain(grace).await {
            tracing::warn!(
                connections = self.tracker.active_count(),
                "Shutdown grace period elapsed with connections still open"
            );
        }
    }

    /// Addresses actually bound, by configured bind address.
    pub fn local_addrs(&self) -> HashMap<SocketAddr, SocketAddr> {
        self.listeners
            .iter()
            .map(|(bind, handle)| (*bind, handle.local_addr))
            .collect()
    }

    pub fn route_table(&self) -> Arc<RouteTable> {
        self.shared.routes.load_full()
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.shared.registry
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }

    /// Make the bound listener set equal the current table's binds.
    async fn reconcile_listeners(&mut self) -> Vec<ListenerError> {
        let wanted = self.shared.routes.load().binds();

        let removed: Vec<SocketAddr> = self
            .listeners
            .keys()
            .filter(|addr| !wanted.contains(addr))
            .copied()
            .collect();
        for addr in removed {
            if let Some(handle) = self.listeners.remove(&addr) {
                handle.stop.send_replace(true);
                tracing::info!(address = %addr, "Listener removed");
            }
        }

        // prune listeners whose accept loop already ended
        self.listeners.retain(|_, handle| !handle.task.is_finished());

        let mut errors = Vec::new();
        for addr in wanted {
            if self.listeners.contains_key(&addr) {
                continue;
            }
            match Listener::bind(addr, self.listener_config.max_connections).await {
                Ok(listener) => {
                    let handle = self.spawn_listener(addr, listener);
                    self.listeners.insert(addr, handle);
                }
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    fn spawn_listener(&self, bind: SocketAddr, listener: Listener) -> ListenerHandle {
        let local_addr = listener.local_addr().unwrap_or(bind);
        let (stop, stop_rx) = watch::channel(false);
        let acceptor = AcceptLoop {
            listener,
            bind,
            shared: self.shared.clone(),
            tls: self.tls.clone(),
            h2c: self.listener_config.h2c_prior_knowledge,
            tracker: self.tracker.clone(),
        };
        let task = tokio::spawn(acceptor.run(stop_rx));
        ListenerHandle {
            local_addr,
            stop,
            task,
        }
    }
}

struct AcceptLoop {
    listener: Listener,
    bind: SocketAddr,
    shared: Arc<Shared>,
    tls: Option<TlsAcceptor>,
    h2c: bool,
    tracker: ConnectionTracker,
}

impl AcceptLoop {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                result = self.listener.accept() => result,
                _ = stopped(&mut stop) => break,
            };

            match accepted {
                Ok((stream, client, permit)) => {
                    let connection = Connection {
                        stream,
                        client,
                        bind: self.bind,
                        shared: self.shared.clone(),
                        tls: self.tls.clone(),
                        h2c: self.h2c,
                        guard: self.tracker.track(),
                        _permit: permit,
                    };
                    tokio::spawn(connection.serve(stop.clone()));
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    // usually fd exhaustion; back off instead of spinning
                    tracing::warn!(address = %self.bind, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        tracing::info!(address = %self.bind, "Listener stopped");
    }
}

struct Connection {
    stream: TcpStream,
    client: SocketAddr,
    bind: SocketAddr,
    shared: Arc<Shared>,
    tls: Option<TlsAcceptor>,
    h2c: bool,
    guard: ConnectionGuard,
    _permit: ConnectionPermit,
}

impl Connection {
    async fn serve(self, stop: watch::Receiver<bool>) {
        let connection_id = self.guard.id();
        let result = match self.tls {
            Some(acceptor) => {
                let stream = match acceptor.accept(self.stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!(connection_id = %connection_id, error = %e, "TLS handshake failed");
                        return;
                    }
                };
                let protocol = Protocol::from_alpn(stream.get_ref().1.alpn_protocol());
                let dispatcher = Dispatcher::new(self.shared, self.bind, self.client, protocol);
                tracing::trace!(connection_id = %connection_id, protocol = protocol.as_str(), "Serving TLS connection");
                serve(stream, protocol, dispatcher, stop).await
            }
            None => {
                let protocol = if self.h2c {
                    sniff_cleartext(&self.stream).await.unwrap_or(Protocol::Http1)
                } else {
                    Protocol::Http1
                };
                let dispatcher = Dispatcher::new(self.shared, self.bind, self.client, protocol);
                tracing::trace!(connection_id = %connection_id, protocol = protocol.as_str(), "Serving connection");
                serve(self.stream, protocol, dispatcher, stop).await
            }
        };

        if let Err(e) = result {
            tracing::debug!(connection_id = %connection_id, client = %self.client, error = %e, "Connection ended with error");
        }
    }
}

/// Per-connection request handler shared by both protocol pipelines.
#[derive(Clone)]
struct Dispatcher {
    shared: Arc<Shared>,
    bind: SocketAddr,
    client: SocketAddr,
    protocol: Protocol,
}

impl Dispatcher {
    fn new(shared: Arc<Shared>, bind: SocketAddr, client: SocketAddr, protocol: Protocol) -> Self {
        Self {
            shared,
            bind,
            client,
            protocol,
        }
    }

    async fn handle(self, request: Request<Incoming>) -> Response<ProxyBody> {
        let started = Instant::now();
        let (parts, body) = request.into_parts();
        let method = parts.method.to_string();

        let Some(route) = self.shared.routes.load().lookup_route(self.bind, &parts) else {
            tracing::debug!(bind = %self.bind, path = %parts.uri.path(), "No route matched");
            metrics::record_request(&method, 404, "none", started);
            return error_response(StatusCode::NOT_FOUND, "no matching route");
        };

        let pool = route.pool().clone();
        let context = RequestContext::from_parts(&parts, self.client);
        let backend = match pool.select(&context) {
            Ok(backend) => backend,
            Err(e) => {
                match e {
                    PolicyError::NoServers => {
                        tracing::error!(route = %route.name(), pool = %pool.name(), "Pool has no servers")
                    }
                    _ => {
                        tracing::warn!(route = %route.name(), pool = %pool.name(), error = %e, "No backend available")
                    }
                }
                metrics::record_request(&method, 503, "none", started);
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "no backend available");
            }
        };

        tracing::debug!(
            route = %route.name(),
            pool = %pool.name(),
            endpoint = %backend.endpoint(),
            method = %method,
            path = %parts.uri.path(),
            "Dispatching request"
        );

        let response = upstream::spawn(UpstreamRequest {
            request: Request::from_parts(parts, body),
            client: self.client,
            backend,
            pool,
            context,
            protocol: self.protocol,
            settings: SessionSettings::clone(&self.shared.settings.load()),
        });

        match response.await {
            Ok(response) => response,
            Err(_) => error_response(StatusCode::BAD_GATEWAY, "upstream session ended"),
        }
    }
}

impl Service<Request<Incoming>> for Dispatcher {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { Ok(dispatcher.handle(request).await) })
    }
}
