//! Load and distribution tests for the reverse proxy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tandem_proxy::config::{PolicyConfig, ProxyConfig};
use tandem_proxy::net::Protocol;

mod common;

async fn backend_of(client: &reqwest::Client, url: &str) -> String {
    let res = client.get(url).send().await.expect("Proxy unreachable");
    assert_eq!(res.status(), 200);
    res.headers()["x-backend"].to_str().unwrap().to_string()
}

#[tokio::test]
async fn round_robin_alternates() {
    let a: SocketAddr = "127.0.0.1:28581".parse().unwrap();
    let b: SocketAddr = "127.0.0.1:28582".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28583".parse().unwrap();
    common::start_echo_backend(a, "a", Protocol::Http1).await;
    common::start_echo_backend(b, "b", Protocol::Http1).await;

    let mut config = ProxyConfig::default();
    config
        .pools
        .push(common::pool("web", PolicyConfig::RoundRobin, &[(a, 1), (b, 1)]));
    config.routes.push(common::route("r1", proxy_addr, "web"));
    let (shutdown, _updates) = common::start_proxy(config).await;

    let client = common::client();
    let url = format!("http://{}/", proxy_addr);
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(backend_of(&client, &url).await);
    }
    assert_eq!(seen, vec!["a", "b", "a", "b"]);

    shutdown.trigger();
}

#[tokio::test]
async fn weighted_round_robin_follows_weights() {
    let a: SocketAddr = "127.0.0.1:28681".parse().unwrap();
    let b: SocketAddr = "127.0.0.1:28682".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28683".parse().unwrap();
    common::start_echo_backend(a, "a", Protocol::Http1).await;
    common::start_echo_backend(b, "b", Protocol::Http1).await;

    let mut config = ProxyConfig::default();
    config.pools.push(common::pool(
        "web",
        PolicyConfig::WeightedRoundRobin,
        &[(a, 3), (b, 1)],
    ));
    config.routes.push(common::route("r1", proxy_addr, "web"));
    let (shutdown, _updates) = common::start_proxy(config).await;

    let client = common::client();
    let url = format!("http://{}/", proxy_addr);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..8 {
        *counts.entry(backend_of(&client, &url).await).or_default() += 1;
    }
    assert_eq!(counts["a"], 6);
    assert_eq!(counts["b"], 2);

    shutdown.trigger();
}

#[tokio::test]
async fn concurrent_load() {
    let backend_addr: SocketAddr = "127.0.0.1:28781".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28782".parse().unwrap();
    common::start_echo_backend(backend_addr, "Hello from backend", Protocol::Http1).await;

    let mut config = ProxyConfig::default();
    config.pools.push(common::pool(
        "web",
        PolicyConfig::LeastPending,
        &[(backend_addr, 1)],
    ));
    config.routes.push(common::route("r1", proxy_addr, "web"));
    let (shutdown, _updates) = common::start_proxy(config).await;

    let concurrency = 20;
    let requests_per_task = 25;
    let total_requests = concurrency * requests_per_task;

    let client = common::client();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..concurrency {
        let client = client.clone();
        let url = format!("http://{}/", proxy_addr);
        tasks.push(tokio::spawn(async move {
            let mut ok = 0;
            for _ in 0..requests_per_task {
                if let Ok(res) = client.get(&url).send().await {
                    if res.status().is_success()
                        && res.text().await.unwrap_or_default() == "Hello from backend"
                    {
                        ok += 1;
                    }
                }
            }
            ok
        }));
    }

    let mut successes = 0;
    for task in tasks {
        successes += task.await.unwrap();
    }
    let elapsed = start.elapsed();

    println!(
        "{} requests in {:?} ({:.0} req/s)",
        total_requests,
        elapsed,
        total_requests as f64 / elapsed.as_secs_f64()
    );
    assert_eq!(successes, total_requests);
    assert!(elapsed < Duration::from_secs(60));

    shutdown.trigger();
}
