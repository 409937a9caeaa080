//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tandem_proxy::config::{PolicyConfig, PoolConfig, ProxyConfig, RouteConfig, ServerConfig};
use tandem_proxy::lifecycle::Shutdown;
use tandem_proxy::load_balancer::{BackendRegistry, BackendState, Endpoint};
use tandem_proxy::net::Protocol;
use tandem_proxy::ProxyServer;

/// Start a backend serving every connection with `handler`.
pub async fn start_backend<F, Fut, B>(addr: SocketAddr, protocol: Protocol, handler: F)
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<B>> + Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let io = TokioIo::new(stream);
                let _ = match protocol {
                    Protocol::Http1 => http1::Builder::new().serve_connection(io, service).await,
                    Protocol::Http2 => {
                        http2::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                    }
                };
            });
        }
    });
}

/// Backend answering with its name, or echoing the request body if there
/// is one. Every response carries `x-backend: <name>`.
pub async fn start_echo_backend(addr: SocketAddr, name: &'static str, protocol: Protocol) {
    start_backend(addr, protocol, move |req: Request<Incoming>| async move {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };
        let body = if body.is_empty() {
            Bytes::from_static(name.as_bytes())
        } else {
            body
        };
        Response::builder()
            .header("x-backend", name)
            .body(Full::new(body))
            .unwrap()
    })
    .await;
}

/// An address nobody listens on.
pub fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn pool(name: &str, policy: PolicyConfig, servers: &[(SocketAddr, u32)]) -> PoolConfig {
    PoolConfig {
        name: name.into(),
        policy,
        servers: servers
            .iter()
            .map(|(addr, weight)| ServerConfig {
                server: format!("http://{}", addr),
                weight: *weight,
            })
            .collect(),
    }
}

pub fn route(name: &str, bind: SocketAddr, pool: &str) -> RouteConfig {
    RouteConfig {
        name: name.into(),
        bind: bind.to_string(),
        host: None,
        path_prefix: None,
        pool: pool.into(),
        priority: 0,
    }
}

/// Start the proxy with every listener bound before returning. Configs sent
/// on the returned channel are applied as reloads.
pub async fn start_proxy(config: ProxyConfig) -> (Shutdown, mpsc::UnboundedSender<ProxyConfig>) {
    let (shutdown, updates, _) = start_proxy_with_registry(config).await;
    (shutdown, updates)
}

/// Like [`start_proxy`], also returning the backend registry so tests can
/// watch throttle gates.
pub async fn start_proxy_with_registry(
    config: ProxyConfig,
) -> (Shutdown, mpsc::UnboundedSender<ProxyConfig>, Arc<BackendRegistry>) {
    let mut server = ProxyServer::new(config).unwrap();
    server.start().await.unwrap();
    let registry = server.registry().clone();

    let shutdown = Shutdown::new();
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    tokio::spawn(server.run(updates_rx, shutdown.clone()));
    (shutdown, updates_tx, registry)
}

/// Shared state of the backend at `addr`.
pub fn backend_state(registry: &BackendRegistry, addr: SocketAddr) -> Arc<BackendState> {
    let endpoint = Endpoint::parse(&format!("http://{}", addr)).unwrap();
    registry.get(&endpoint).unwrap()
}

/// Poll `condition` until it holds. Panics after 20 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(20), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached in time");
}

/// Non-pooled client so every request opens a fresh proxy connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
